use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::HostWatchError;

/// Persisted read position for one watched log file.
///
/// Stored as a single human readable line `<identity> <offset>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub identity: u64,
    pub offset: u64,
}

impl Checkpoint {
    pub fn to_record(&self) -> String {
        format!("{} {}\n", self.identity, self.offset)
    }

    pub fn parse(record: &str) -> Option<Self> {
        let mut parts = record.split_whitespace();
        let identity = parts.next()?.parse().ok()?;
        let offset = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Checkpoint { identity, offset })
    }
}

/// Directory of checkpoint records, one per watched log keyed by the log's
/// base name
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        StateStore {
            dir: dir.to_path_buf(),
        }
    }

    pub fn record_path(&self, log_path: &Path) -> PathBuf {
        let base = log_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_owned());
        self.dir.join(format!("{}.state", base))
    }

    /// Returns the stored checkpoint. A missing record means the log has
    /// never been scanned; an unreadable or malformed one is treated the same.
    pub fn load(&self, log_path: &Path) -> Option<Checkpoint> {
        let record_path = self.record_path(log_path);
        let text = match fs::read_to_string(&record_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read state {}: {}", record_path.display(), e);
                return None;
            }
        };

        let checkpoint = Checkpoint::parse(&text);
        if checkpoint.is_none() {
            warn!(
                "Ignoring malformed state {}: '{}'",
                record_path.display(),
                text.trim()
            );
        }
        checkpoint
    }

    /// Replaces the record atomically: written to a temp file in the same
    /// directory with owner-only permissions, then renamed over the old one
    pub fn save(&self, log_path: &Path, checkpoint: Checkpoint) -> Result<(), HostWatchError> {
        fs::create_dir_all(&self.dir)?;

        let record_path = self.record_path(log_path);
        let tmp_path = record_path.with_extension("state.tmp");

        {
            let mut file = Self::create_private(&tmp_path)?;
            file.write_all(checkpoint.to_record().as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &record_path)?;
        Ok(())
    }

    #[cfg(unix)]
    fn create_private(path: &Path) -> Result<File, HostWatchError> {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        // mode() only applies on creation
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        Ok(file)
    }

    #[cfg(not(unix))]
    fn create_private(path: &Path) -> Result<File, HostWatchError> {
        Ok(File::create(path)?)
    }
}
