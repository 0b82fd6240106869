// Backup run, strictly in order, stopping at the first failure:
//   1. free space on the archive volume          INSUFFICIENT_SPACE
//   2. every source directory exists             MISSING_SOURCE
//   3. create the timestamped archive            ARCHIVE_CREATE_FAILED
//   4. read it back (corrupt archives are removed)  ARCHIVE_CORRUPT
//   5. commit it to the version store            VCS_COMMIT_FAILED
//   6. retention sweep (best effort, runs after a commit failure too)
//   7. history compaction on the configured day (best effort)
// Reporting of the outcome is left to the caller, see `report_failure`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use log::{error, info, warn, Level};
use logging_timer::timer;

use crate::archive::{ArchiveDigest, Archiver};
use crate::config::BackupConfig;
use crate::error::BackupFailure;
use crate::notify::{Delivery, Notifier};
use crate::utils::Utils;
use crate::vcs::VersionStore;

const ARCHIVE_PREFIX: &str = "backup-";
const UNCOMMITTED_SUFFIX: &str = ".uncommitted";

#[derive(Debug)]
pub struct BackupReport {
    pub archive: PathBuf,
    pub size: u64,
    pub digest: ArchiveDigest,
    pub removed: Vec<PathBuf>,
    pub compacted: bool,
}

pub struct BackupPipeline<'a> {
    config: &'a BackupConfig,
    archiver: &'a dyn Archiver,
    store: &'a dyn VersionStore,
}

impl<'a> BackupPipeline<'a> {
    pub fn new(
        config: &'a BackupConfig,
        archiver: &'a dyn Archiver,
        store: &'a dyn VersionStore,
    ) -> Self {
        BackupPipeline {
            config,
            archiver,
            store,
        }
    }

    pub fn run(&self, now: DateTime<Local>) -> Result<BackupReport, BackupFailure> {
        let stamp = Utils::run_stamp(&now);
        info!("Starting backup {}", stamp);

        self.check_space()?;
        self.check_sources()?;

        let (archive, size) = self.create_archive(&stamp)?;
        let digest = self.verify_archive(&archive)?;

        let committed = self.commit_archive(&archive, &stamp);
        let removed = self.sweep_retention(now.into());
        committed?;

        let compacted = self.compact_if_due(now);

        info!("Backup complete: {}", archive.display());

        Ok(BackupReport {
            archive,
            size,
            digest,
            removed,
            compacted,
        })
    }

    fn check_space(&self) -> Result<(), BackupFailure> {
        let volume = &self.config.archive_dir;
        let insufficient = |available| BackupFailure::InsufficientSpace {
            volume: volume.clone(),
            available,
            required: self.config.min_free_bytes,
        };

        if let Err(e) = fs::create_dir_all(volume) {
            error!("Could not create {}: {}", volume.display(), e);
            return Err(insufficient(0));
        }

        let available = match Utils::available_space(volume) {
            Ok(available) => available,
            Err(e) => {
                error!("Could not determine free space on {}: {}", volume.display(), e);
                return Err(insufficient(0));
            }
        };

        if available <= self.config.min_free_bytes {
            return Err(insufficient(available));
        }

        info!(
            "{} free on {}",
            Utils::format_bytes(available),
            volume.display()
        );
        Ok(())
    }

    fn check_sources(&self) -> Result<(), BackupFailure> {
        for source in &self.config.sources {
            if !source.is_dir() {
                return Err(BackupFailure::MissingSource(source.clone()));
            }
        }
        Ok(())
    }

    /// Picks `backup-<stamp>.<ext>`, adding a counter if a run in the same
    /// second already used that name
    fn archive_path(&self, stamp: &str) -> PathBuf {
        let ext = self.archiver.extension();
        let mut path = self
            .config
            .archive_dir
            .join(format!("{}{}.{}", ARCHIVE_PREFIX, stamp, ext));

        let mut counter = 1;
        while path.exists() {
            path = self
                .config
                .archive_dir
                .join(format!("{}{}-{}.{}", ARCHIVE_PREFIX, stamp, counter, ext));
            counter += 1;
        }
        path
    }

    fn create_archive(&self, stamp: &str) -> Result<(PathBuf, u64), BackupFailure> {
        let _tmr = timer!(Level::Debug; "BackupPipeline.create_archive", "{}", stamp);

        let path = self.archive_path(stamp);
        info!("Creating archive {}", path.display());

        // Sources may contain the backup stores themselves
        let skip = [self.config.archive_dir.clone(), self.config.repo_dir.clone()];

        match self
            .archiver
            .create(&path, &self.config.sources, &self.config.excludes, &skip)
        {
            Ok(size) => Ok((path, size)),
            Err(e) => {
                remove_if_present(&path);
                Err(BackupFailure::ArchiveCreateFailed {
                    path,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn verify_archive(&self, archive: &Path) -> Result<ArchiveDigest, BackupFailure> {
        let _tmr = timer!(Level::Debug; "BackupPipeline.verify_archive", "{}", archive.display());

        match self.archiver.verify(archive) {
            Ok(digest) => {
                info!("Verified {} ({} entries)", archive.display(), digest.entries);
                Ok(digest)
            }
            Err(e) => {
                remove_if_present(archive);
                Err(BackupFailure::ArchiveCorrupt {
                    path: archive.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn commit_archive(&self, archive: &Path, stamp: &str) -> Result<(), BackupFailure> {
        let message = format!("System backup {}", stamp);

        let result = self
            .store
            .ensure_repo()
            .and_then(|_| self.store.commit(archive, &message));

        match result {
            Ok(()) => {
                info!("Committed '{}'", message);
                Ok(())
            }
            Err(e) => {
                // The archive stays in the primary store, flagged
                let marker = uncommitted_marker(archive);
                if let Err(marker_err) = fs::write(&marker, b"") {
                    warn!("Could not write {}: {}", marker.display(), marker_err);
                }
                Err(BackupFailure::VcsCommitFailed {
                    path: archive.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Removes archives whose modification time is older than the retention
    /// window. Never fails the run.
    pub fn sweep_retention(&self, now: SystemTime) -> Vec<PathBuf> {
        let window = Duration::from_secs(u64::from(self.config.retention_days) * 24 * 60 * 60);
        let Some(cutoff) = now.checked_sub(window) else {
            return Vec::new();
        };

        let entries = match fs::read_dir(&self.config.archive_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Retention sweep could not list {}: {}",
                    self.config.archive_dir.display(),
                    e
                );
                return Vec::new();
            }
        };

        let suffix = format!(".{}", self.archiver.extension());
        let mut removed = Vec::new();

        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let is_archive = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(ARCHIVE_PREFIX) && name.ends_with(&suffix));
            if !is_archive {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Retention sweep skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            if modified >= cutoff {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    info!("Retention: removed {}", path.display());
                    remove_if_present(&uncommitted_marker(&path));
                    removed.push(path);
                }
                Err(e) => warn!("Retention: could not remove {}: {}", path.display(), e),
            }
        }

        removed.sort();
        removed
    }

    fn compact_if_due(&self, now: DateTime<Local>) -> bool {
        if !self.config.compaction_due(now.date_naive()) {
            return false;
        }

        info!("Compacting backup repository history");
        match self.store.compact() {
            Ok(()) => true,
            Err(e) => {
                warn!("History compaction failed: {}", e);
                false
            }
        }
    }
}

/// Sends the failure email carrying the full run log. A missing admin
/// address or mail facility is logged by the notifier and otherwise ignored.
pub fn report_failure(
    failure: &BackupFailure,
    notifier: &Notifier,
    admin_email: Option<&str>,
    hostname: &str,
    run_log: Option<&Path>,
) -> Delivery {
    error!("Backup failed [{}]: {}", failure.code(), failure);

    let log_text = run_log.and_then(|path| match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Could not read run log {}: {}", path.display(), e);
            None
        }
    });

    let subject = format!("[hostwatch] Backup FAILED on {}: {}", hostname, failure.code());
    let body = match log_text {
        Some(text) => format!("{}\n\nRun log:\n{}", failure, text),
        None => failure.to_string(),
    };

    notifier.email(admin_email, &subject, &body)
}

fn uncommitted_marker(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(UNCOMMITTED_SUFFIX);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}
