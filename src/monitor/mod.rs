mod alert;
mod scan;
mod state;

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{error, info, warn, Level};
use logging_timer::timer;

use crate::config::MonitorConfig;
use crate::error::HostWatchError;
use crate::notify::Notifier;
use crate::utils::Utils;

pub use alert::{AlertEvent, AuditLog};
pub use scan::{classify, FileState, KeywordMatcher};
pub use state::{Checkpoint, StateStore};

/// What happened to one watched log during a pass
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Scanned {
        state: FileState,
        bytes: u64,
        alerts: usize,
    },
    Unchanged,
    Skipped(String),
}

#[derive(Debug, Default)]
pub struct MonitorReport {
    pub files: Vec<(PathBuf, FileOutcome)>,
    pub alerts: Vec<AlertEvent>,
}

impl MonitorReport {
    #[cfg(test)]
    pub fn outcome(&self, path: &Path) -> Option<&FileOutcome> {
        self.files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, outcome)| outcome)
    }
}

/// One incremental scan pass over every configured log file
pub struct LogMonitor<'a> {
    config: &'a MonitorConfig,
    alert_email: Option<&'a str>,
    notifier: &'a Notifier,
    store: StateStore,
    audit: AuditLog,
    matchers: Vec<KeywordMatcher>,
    hostname: String,
}

impl<'a> LogMonitor<'a> {
    pub fn new(
        config: &'a MonitorConfig,
        alert_email: Option<&'a str>,
        notifier: &'a Notifier,
        hostname: &str,
    ) -> Result<Self, HostWatchError> {
        let matchers = config
            .keywords
            .iter()
            .map(|keyword| KeywordMatcher::new(keyword))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LogMonitor {
            config,
            alert_email,
            notifier,
            store: StateStore::new(&config.state_dir),
            audit: AuditLog::new(&config.audit_log),
            matchers,
            hostname: hostname.to_owned(),
        })
    }

    /// Scans each configured log once. A log that can't be read is skipped
    /// without affecting the others.
    pub fn run(&self, now: DateTime<Local>) -> MonitorReport {
        let mut report = MonitorReport::default();

        for path in &self.config.logs {
            let outcome = match self.scan_file(path, now, &mut report.alerts) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    FileOutcome::Skipped(e.to_string())
                }
            };
            report.files.push((path.clone(), outcome));
        }

        info!(
            "Monitor pass complete: {} file(s), {} alert(s)",
            report.files.len(),
            report.alerts.len()
        );

        report
    }

    fn scan_file(
        &self,
        path: &Path,
        now: DateTime<Local>,
        alerts: &mut Vec<AlertEvent>,
    ) -> Result<FileOutcome, HostWatchError> {
        let _tmr = timer!(Level::Trace; "LogMonitor.scan_file", "{}", path.display());

        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(HostWatchError::Error("not a regular file".to_owned()));
        }

        let identity = Utils::file_identity(&metadata);
        let size = metadata.len();
        let transition = classify(self.store.load(path), identity, size);

        if transition.state == FileState::Unchanged {
            info!("{}: unchanged at offset {}", path.display(), size);
            return Ok(FileOutcome::Unchanged);
        }

        info!(
            "{}: {} - scanning from byte {}",
            path.display(),
            transition.state,
            transition.start
        );
        let reader = scan::range_reader(file, transition.start, size)?;
        let scanned = scan::scan_lines(
            reader,
            &self.matchers,
            self.config.context_lines,
            self.config.max_excerpt_lines,
        )?;
        let end = transition.start + scanned.bytes;

        let mut raised = 0;
        for (matcher, excerpt) in self.matchers.iter().zip(scanned.excerpts) {
            let Some(excerpt) = excerpt else {
                continue;
            };
            let alert = self.raise(matcher.keyword(), path, now, excerpt);
            alerts.push(alert);
            raised += 1;
        }

        // Advance even when nothing matched so these bytes are never re-read
        if let Err(e) = self.store.save(path, Checkpoint { identity, offset: end }) {
            error!("Could not save state for {}: {}", path.display(), e);
        }

        Ok(FileOutcome::Scanned {
            state: transition.state,
            bytes: scanned.bytes,
            alerts: raised,
        })
    }

    fn raise(&self, keyword: &str, path: &Path, now: DateTime<Local>, excerpt: String) -> AlertEvent {
        let mut alert = AlertEvent::new(keyword, path, &self.hostname, now, excerpt);
        warn!("{}", alert.message());

        alert.email = Some(
            self.notifier
                .email(self.alert_email, &alert.subject(), &alert.email_body()),
        );
        alert.webhook = Some(self.notifier.chat(&alert.message(), &alert.excerpt));

        if let Err(e) = self.audit.append(&alert) {
            error!("Could not write audit record: {}", e);
        }

        alert
    }
}
