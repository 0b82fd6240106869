use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use flexi_logger::{detailed_format, Duplicate, FileSpec, Logger, LoggerHandle};
use log::{debug, info};

use crate::config::LoggingConfig;
use crate::error::HostWatchError;
use crate::utils::Utils;

/// The timestamped log file capturing all output of one pipeline run
pub struct RunLog {
    path: PathBuf,
    _handle: LoggerHandle,
}

impl RunLog {
    /// Starts logging to `<dir>/<pipeline>-YYYYMMDD-HHMMSS.log`, echoing
    /// info and above to stderr, then drops the oldest run logs beyond
    /// `keep_runs` for this pipeline
    pub fn start(
        config: &LoggingConfig,
        pipeline: &str,
        now: &DateTime<Local>,
    ) -> Result<Self, HostWatchError> {
        fs::create_dir_all(&config.dir)?;
        let path = Self::path_for(&config.dir, pipeline, now);

        let handle = Logger::try_with_str(&config.level)?
            .log_to_file(FileSpec::try_from(path.clone())?.suppress_timestamp())
            .append()
            .format_for_files(detailed_format)
            .duplicate_to_stderr(Duplicate::Info)
            .start()?;

        info!("Logging {} run to {}", pipeline, path.display());
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        let removed = Utils::prune_by_name(&config.dir, &format!("{}-", pipeline), ".log", config.keep_runs);
        for old in removed {
            debug!("Removed old run log {}", old.display());
        }

        Ok(RunLog {
            path,
            _handle: handle,
        })
    }

    pub fn path_for(dir: &Path, pipeline: &str, now: &DateTime<Local>) -> PathBuf {
        dir.join(format!("{}-{}.log", pipeline, Utils::run_stamp(now)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
