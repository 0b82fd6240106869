use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::HostWatchError;

const ENV_PREFIX: &str = "HOSTWATCH_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    pub keep_runs: usize,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DEFAULT_LEVEL: &str = "info";
    const DEFAULT_KEEP_RUNS: usize = 56;

    fn default_for(data_dir: &Path) -> Self {
        LoggingConfig {
            level: Self::DEFAULT_LEVEL.to_string(),
            dir: data_dir.join("logs"),
            keep_runs: Self::DEFAULT_KEEP_RUNS,
        }
    }

    fn ensure_valid(&mut self) {
        // Log levels are trimmed and lowercased. An unknown level is reported
        // on stderr (the logger isn't running yet) and replaced by the default
        let str_original = self.level.clone();
        self.level = self.level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.level.as_str()) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DEFAULT_LEVEL
            );
            self.level = Self::DEFAULT_LEVEL.to_owned();
        }

        if self.keep_runs == 0 {
            eprintln!(
                "Config error: logging.keep_runs must be at least 1 - using default of {}",
                Self::DEFAULT_KEEP_RUNS
            );
            self.keep_runs = Self::DEFAULT_KEEP_RUNS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupConfig {
    pub sources: Vec<PathBuf>,
    pub excludes: Vec<String>,
    pub archive_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub retention_days: u32,
    pub min_free_bytes: u64,
    /// Month and day ("MM-DD") on which version-control history is compacted
    pub compact_on: String,
    pub admin_email: Option<String>,
    pub author_name: String,
    pub author_email: String,
}

impl BackupConfig {
    const DEFAULT_RETENTION_DAYS: u32 = 30;
    const DEFAULT_MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;
    const DEFAULT_COMPACT_ON: &str = "01-01";

    fn default_for(data_dir: &Path) -> Self {
        BackupConfig {
            sources: Vec::new(),
            excludes: vec![
                "*.tmp".to_owned(),
                "*.swp".to_owned(),
                "**/cache/**".to_owned(),
                "**/.cache/**".to_owned(),
            ],
            archive_dir: data_dir.join("archives"),
            repo_dir: data_dir.join("repo"),
            retention_days: Self::DEFAULT_RETENTION_DAYS,
            min_free_bytes: Self::DEFAULT_MIN_FREE_BYTES,
            compact_on: Self::DEFAULT_COMPACT_ON.to_owned(),
            admin_email: None,
            author_name: "hostwatch".to_owned(),
            author_email: "hostwatch@localhost".to_owned(),
        }
    }

    /// True when `date` falls on the configured compaction day
    pub fn compaction_due(&self, date: NaiveDate) -> bool {
        match Self::parse_month_day(&self.compact_on) {
            Some((month, day)) => date.month() == month && date.day() == day,
            None => false,
        }
    }

    fn parse_month_day(s: &str) -> Option<(u32, u32)> {
        let (month, day) = s.trim().split_once('-')?;
        let month: u32 = month.parse().ok()?;
        let day: u32 = day.parse().ok()?;
        // 2000 is a leap year so 02-29 is accepted
        NaiveDate::from_ymd_opt(2000, month, day).map(|_| (month, day))
    }

    fn ensure_valid(&mut self) {
        if Self::parse_month_day(&self.compact_on).is_none() {
            eprintln!(
                "Config error: backup.compact_on of '{}' is not MM-DD - using default of '{}'",
                self.compact_on,
                Self::DEFAULT_COMPACT_ON
            );
            self.compact_on = Self::DEFAULT_COMPACT_ON.to_owned();
        }
        self.admin_email = normalize_optional(self.admin_email.take());
        self.excludes.retain(|pattern| !pattern.trim().is_empty());
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub logs: Vec<PathBuf>,
    pub keywords: Vec<String>,
    pub state_dir: PathBuf,
    pub audit_log: PathBuf,
    pub context_lines: usize,
    pub max_excerpt_lines: usize,
}

impl MonitorConfig {
    const DEFAULT_CONTEXT_LINES: usize = 2;
    const DEFAULT_MAX_EXCERPT_LINES: usize = 20;

    fn default_for(data_dir: &Path) -> Self {
        MonitorConfig {
            logs: vec![
                PathBuf::from("/var/log/syslog"),
                PathBuf::from("/var/log/auth.log"),
            ],
            keywords: vec![
                "error".to_owned(),
                "fail".to_owned(),
                "denied".to_owned(),
                "critical".to_owned(),
            ],
            state_dir: data_dir.join("state"),
            audit_log: data_dir.join("alerts.log"),
            context_lines: Self::DEFAULT_CONTEXT_LINES,
            max_excerpt_lines: Self::DEFAULT_MAX_EXCERPT_LINES,
        }
    }

    fn ensure_valid(&mut self) {
        let mut keywords: Vec<String> = Vec::with_capacity(self.keywords.len());
        for keyword in self.keywords.drain(..) {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
        self.keywords = keywords;

        if self.max_excerpt_lines == 0 {
            eprintln!(
                "Config error: monitor.max_excerpt_lines must be at least 1 - using default of {}",
                Self::DEFAULT_MAX_EXCERPT_LINES
            );
            self.max_excerpt_lines = Self::DEFAULT_MAX_EXCERPT_LINES;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotifyConfig {
    pub alert_email: Option<String>,
    pub webhook_url: Option<String>,
    pub mail_from: String,
    pub sendmail: String,
    pub webhook_timeout_secs: u64,
}

impl NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            alert_email: None,
            webhook_url: None,
            mail_from: "hostwatch@localhost".to_owned(),
            sendmail: "sendmail".to_owned(),
            webhook_timeout_secs: 10,
        }
    }

    fn ensure_valid(&mut self) {
        self.alert_email = normalize_optional(self.alert_email.take());
        self.webhook_url = normalize_optional(self.webhook_url.take());
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub lock_dir: PathBuf,
    pub logging: LoggingConfig,
    pub backup: BackupConfig,
    pub monitor: MonitorConfig,
    pub notify: NotifyConfig,
}

impl Config {
    /// Defaults rooted at `data_dir`. Every path the tool writes to lives
    /// beneath it unless configured otherwise.
    pub fn default_for(data_dir: &Path) -> Self {
        Config {
            lock_dir: data_dir.join("run"),
            logging: LoggingConfig::default_for(data_dir),
            backup: BackupConfig::default_for(data_dir),
            monitor: MonitorConfig::default_for(data_dir),
            notify: NotifyConfig::default(),
        }
    }

    /// Loads the configuration once for this invocation.
    ///
    /// Defaults are merged with the TOML file (either `explicit_path` or
    /// `config.toml` in the per-user config directory) and then with
    /// `HOSTWATCH_` environment variables, using `__` to separate sections.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, HostWatchError> {
        let project_dirs = ProjectDirs::from("", "", "hostwatch");

        let data_dir = project_dirs
            .as_ref()
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let config_path = match explicit_path {
            Some(path) => path.to_path_buf(),
            None => project_dirs
                .as_ref()
                .map(|dirs| dirs.config_dir().join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("config.toml")),
        };

        Self::load_from(&config_path, &data_dir)
    }

    pub fn load_from(config_path: &Path, data_dir: &Path) -> Result<Self, HostWatchError> {
        if config_path.exists() {
            info!("Loading configuration from {}", config_path.display());
        }

        // A missing TOML file is not an error - figment simply contributes nothing
        let figment = Figment::from(Serialized::defaults(Config::default_for(data_dir)))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract()?;
        config.ensure_valid();

        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, HostWatchError> {
        toml::to_string_pretty(self)
            .map_err(|e| HostWatchError::Error(format!("Failed to serialize config: {}", e)))
    }

    /// Creates the directories the pipelines write into
    pub fn ensure_dirs(&self) -> Result<(), HostWatchError> {
        fs::create_dir_all(&self.lock_dir)?;
        fs::create_dir_all(&self.logging.dir)?;
        Ok(())
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.backup.ensure_valid();
        self.monitor.ensure_valid();
        self.notify.ensure_valid();
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}
