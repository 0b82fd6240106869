use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::HostWatchError;
use crate::notify::Delivery;

/// One keyword match in one scan cycle. Transient: written to the audit log
/// and the notification channels, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub keyword: String,
    pub log_path: PathBuf,
    pub hostname: String,
    pub timestamp: DateTime<Local>,
    pub excerpt: String,
    pub email: Option<Delivery>,
    pub webhook: Option<Delivery>,
}

impl AlertEvent {
    pub fn new(
        keyword: &str,
        log_path: &Path,
        hostname: &str,
        timestamp: DateTime<Local>,
        excerpt: String,
    ) -> Self {
        AlertEvent {
            keyword: keyword.to_owned(),
            log_path: log_path.to_path_buf(),
            hostname: hostname.to_owned(),
            timestamp,
            excerpt,
            email: None,
            webhook: None,
        }
    }

    pub fn message(&self) -> String {
        format!(
            "[{}] {}: keyword '{}' found in {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.hostname,
            self.keyword,
            self.log_path.display()
        )
    }

    pub fn subject(&self) -> String {
        format!("[hostwatch] '{}' in {} on {}", self.keyword, self.log_path.display(), self.hostname)
    }

    pub fn email_body(&self) -> String {
        format!("{}\n\n{}\n", self.message(), self.excerpt)
    }

    pub fn audit_line(&self) -> String {
        // One record per line, whatever a failing channel printed
        let outcome = |delivery: &Option<Delivery>| match delivery {
            Some(d) => d
                .to_string()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join(" | "),
            None => "not attempted".to_owned(),
        };

        format!(
            "{} host={} keyword={} log={} email=\"{}\" webhook=\"{}\"",
            self.timestamp.to_rfc3339(),
            self.hostname,
            self.keyword,
            self.log_path.display(),
            outcome(&self.email),
            outcome(&self.webhook)
        )
    }
}

/// Append-only history of every alert raised
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: &Path) -> Self {
        AuditLog {
            path: path.to_path_buf(),
        }
    }

    pub fn append(&self, alert: &AlertEvent) -> Result<(), HostWatchError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", alert.audit_line())?;
        Ok(())
    }
}
