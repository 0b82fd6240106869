use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use log::info;

use crate::archive::{Archiver, TarGzArchiver};
use crate::backup::{self, BackupPipeline};
use crate::config::Config;
use crate::error::{BackupFailure, HostWatchError};
use crate::lock::RunLock;
use crate::logging::RunLog;
use crate::monitor::LogMonitor;
use crate::notify::Notifier;
use crate::utils::Utils;
use crate::vcs::{GitStore, VersionStore};

#[derive(Parser)]
#[command(
    name = "hostwatch",
    version,
    about = "hostWatch: verified archive backups and incremental log keyword alerts"
)]
pub struct Cli {
    /// Configuration file (default: config.toml in the user config directory)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create, verify and commit one backup archive, then prune expired archives
    Backup,
    /// Scan watched logs once for keywords in bytes written since the last scan
    Monitor,
    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    /// Returns the process exit code
    pub fn handle_command_line() -> Result<i32, HostWatchError> {
        let args = Cli::parse();
        let config = Config::load(args.config.as_deref())?;

        match args.command {
            Command::Backup => Self::run_backup(&config),
            Command::Monitor => Self::run_monitor(&config),
            Command::Config => {
                print!("{}", config.to_toml()?);
                Ok(0)
            }
        }
    }

    fn run_backup(config: &Config) -> Result<i32, HostWatchError> {
        if config.backup.sources.is_empty() {
            return Err(HostWatchError::Error(
                "No backup sources configured (backup.sources)".to_owned(),
            ));
        }

        let now = Local::now();
        config.ensure_dirs()?;
        let run_log = RunLog::start(&config.logging, "backup", &now)?;
        let notifier = Notifier::from_config(&config.notify)?;

        let archiver = TarGzArchiver::new();
        let store = GitStore::new(
            &config.backup.repo_dir,
            &config.backup.author_name,
            &config.backup.author_email,
        );

        Self::execute_backup(
            config,
            now,
            &archiver,
            &store,
            &notifier,
            &Utils::hostname(),
            Some(run_log.path()),
        )
    }

    /// Runs the pipeline under its run lock and maps the outcome to an exit
    /// code, sending the failure email on any aborting failure
    pub fn execute_backup(
        config: &Config,
        now: DateTime<Local>,
        archiver: &dyn Archiver,
        store: &dyn VersionStore,
        notifier: &Notifier,
        hostname: &str,
        run_log: Option<&Path>,
    ) -> Result<i32, HostWatchError> {
        let result = match RunLock::acquire(&config.lock_dir, "backup") {
            Ok(_lock) => BackupPipeline::new(&config.backup, archiver, store).run(now),
            Err(e @ HostWatchError::AlreadyRunning(_)) => {
                Err(BackupFailure::AlreadyRunning(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        match result {
            Ok(report) => {
                info!(
                    "Backup stored at {} ({}, {} entries, sha256 {}), {} expired archive(s) removed",
                    report.archive.display(),
                    Utils::format_bytes(report.size),
                    report.digest.entries,
                    report.digest.sha256,
                    report.removed.len()
                );
                if report.compacted {
                    info!("Backup repository history compacted");
                }
                Ok(0)
            }
            Err(failure) => {
                backup::report_failure(
                    &failure,
                    notifier,
                    config.backup.admin_email.as_deref(),
                    hostname,
                    run_log,
                );
                Ok(1)
            }
        }
    }

    fn run_monitor(config: &Config) -> Result<i32, HostWatchError> {
        let now = Local::now();
        config.ensure_dirs()?;
        let _run_log = RunLog::start(&config.logging, "monitor", &now)?;
        let _lock = RunLock::acquire(&config.lock_dir, "monitor")?;
        let notifier = Notifier::from_config(&config.notify)?;

        let monitor = LogMonitor::new(
            &config.monitor,
            config.notify.alert_email.as_deref(),
            &notifier,
            &Utils::hostname(),
        )?;
        let report = monitor.run(now);

        for (path, outcome) in &report.files {
            info!("{}: {:?}", path.display(), outcome);
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_subcommands() {
        let cli = Cli::try_parse_from(["hostwatch", "backup"]).unwrap();
        assert!(matches!(cli.command, Command::Backup));
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["hostwatch", "monitor"]).unwrap();
        assert!(matches!(cli.command, Command::Monitor));

        let cli = Cli::try_parse_from(["hostwatch", "config"]).unwrap();
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn test_cli_parsing_config_path_is_global() {
        let cli = Cli::try_parse_from(["hostwatch", "monitor", "--config", "/etc/hostwatch.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/hostwatch.toml")));

        let cli = Cli::try_parse_from(["hostwatch", "-c", "/etc/hostwatch.toml", "backup"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/hostwatch.toml")));
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        let result = Cli::try_parse_from(["hostwatch"]);
        assert!(result.is_err(), "Should require a command");

        let result = Cli::try_parse_from(["hostwatch", "restore"]);
        assert!(result.is_err(), "Should reject unknown commands");

        let result = Cli::try_parse_from(["hostwatch", "backup", "--invalid-flag"]);
        assert!(result.is_err(), "Should reject unknown flags on backup");
    }
}
