use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::warn;

use crate::error::HostWatchError;

pub struct Utils {}

impl Utils {
    /// Timestamp used in archive names, run log names and commit messages
    pub fn run_stamp(now: &DateTime<Local>) -> String {
        now.format("%Y%m%d-%H%M%S").to_string()
    }

    pub fn hostname() -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }

    /// Bytes available to unprivileged users on the volume holding `path`
    #[cfg(unix)]
    pub fn available_space(path: &Path) -> Result<u64, HostWatchError> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| HostWatchError::Error(format!("Path contains NUL: {}", path.display())))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is a valid NUL-terminated string and stat is a valid out pointer
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }

    #[cfg(not(unix))]
    pub fn available_space(_path: &Path) -> Result<u64, HostWatchError> {
        Err(HostWatchError::Error(
            "Free space checks are only supported on Unix".to_owned(),
        ))
    }

    /// Stable identity of a file independent of its path (the inode on Unix)
    #[cfg(unix)]
    pub fn file_identity(metadata: &Metadata) -> u64 {
        use std::os::unix::fs::MetadataExt;
        metadata.ino()
    }

    #[cfg(not(unix))]
    pub fn file_identity(metadata: &Metadata) -> u64 {
        metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }

        if unit == 0 {
            format!("{} {}", bytes, UNITS[0])
        } else {
            format!("{:.1} {}", value, UNITS[unit])
        }
    }

    /// Deletes all but the newest `keep` files in `dir` whose names start
    /// with `prefix` and end with `suffix`. Names embed a sortable timestamp
    /// so lexical order is age order. Failures are logged, never returned.
    pub fn prune_by_name(dir: &Path, prefix: &str, suffix: &str, keep: usize) -> Vec<PathBuf> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not list {} for pruning: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut matching: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(prefix) && name.ends_with(suffix))
            })
            .collect();

        matching.sort();

        let excess = matching.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for path in matching.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }

        removed
    }
}
