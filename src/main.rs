mod archive;
mod backup;
mod cli;
mod config;
mod error;
mod lock;
mod logging;
mod monitor;
mod notify;
mod utils;
mod vcs;

#[cfg(test)]
mod scenarios;

use cli::Cli;
use log::error;

fn main() {
    // The logger is started per pipeline once the configuration is loaded.
    // Anything that fails before that only reaches stderr.
    match Cli::handle_command_line() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{:?}", err);
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}
