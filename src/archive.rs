use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{Glob, GlobSet, GlobSetBuilder};
use hex::encode;
use log::{debug, Level};
use logging_timer::timer;
use sha2::{Digest, Sha256};
use tar::{Archive, Builder};
use walkdir::WalkDir;

use crate::error::HostWatchError;

/// Result of a successful integrity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDigest {
    pub entries: u64,
    pub sha256: String,
}

/// Creates and validates compressed archives of directory trees
pub trait Archiver {
    /// File extension of produced archives, without the leading dot
    fn extension(&self) -> &str;

    /// Writes one archive of `sources` to `dest`, skipping paths that match
    /// any of `excludes` and everything at or below a `skip` directory.
    /// `dest` itself is never stored. Returns the archive size in bytes. A
    /// failed create leaves nothing behind at `dest`.
    fn create(
        &self,
        dest: &Path,
        sources: &[PathBuf],
        excludes: &[String],
        skip: &[PathBuf],
    ) -> Result<u64, HostWatchError>;

    /// Reads the whole archive back without extracting it
    fn verify(&self, path: &Path) -> Result<ArchiveDigest, HostWatchError>;
}

/// gzip-compressed tar archives
pub struct TarGzArchiver;

impl TarGzArchiver {
    pub const EXTENSION: &str = "tar.gz";

    pub fn new() -> Self {
        TarGzArchiver
    }

    fn build_excludes(excludes: &[String]) -> Result<GlobSet, HostWatchError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in excludes {
            let glob = Glob::new(pattern).map_err(|e| {
                HostWatchError::Error(format!("Invalid exclude pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| HostWatchError::Error(format!("Invalid exclude patterns: {}", e)))
    }

    /// Name a source directory is stored under: its path without the root
    /// or any prefix, so `/etc/nginx` becomes `etc/nginx` as tar does it
    fn archive_root(source: &Path) -> PathBuf {
        source
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    }

    fn is_excluded(set: &GlobSet, name_in_archive: &Path) -> bool {
        if set.is_match(name_in_archive) {
            return true;
        }
        name_in_archive
            .file_name()
            .is_some_and(|file_name| set.is_match(Path::new(file_name)))
    }

    /// Resolved forms of the skip directories. Ones that do not exist yet
    /// cannot be inside a source and are dropped.
    fn resolve_skipped(dest: &Path, skip: &[PathBuf]) -> Result<Vec<PathBuf>, HostWatchError> {
        let mut resolved = vec![fs::canonicalize(dest)?];
        for path in skip {
            match fs::canonicalize(path) {
                Ok(path) => resolved.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(resolved)
    }

    fn write_archive(
        dest: &Path,
        sources: &[PathBuf],
        excludes: &GlobSet,
        skip: &[PathBuf],
    ) -> Result<(), HostWatchError> {
        let file = File::create(dest)?;
        let skipped = Self::resolve_skipped(dest, skip)?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);

        for source in sources {
            let root = Self::archive_root(source);
            // Walk the resolved path so it compares with the skip list
            let resolved = fs::canonicalize(source)?;

            let walker = WalkDir::new(&resolved)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| {
                    let keep = !skipped.iter().any(|s| entry.path().starts_with(s));
                    if !keep {
                        debug!("Skipping {}", entry.path().display());
                    }
                    keep
                });

            for entry in walker {
                let entry = entry.map_err(|e| {
                    HostWatchError::Error(format!("Failed to walk {}: {}", source.display(), e))
                })?;

                let relative = entry.path().strip_prefix(&resolved).map_err(|e| {
                    HostWatchError::Error(format!("Unexpected path {}: {}", entry.path().display(), e))
                })?;
                let name = root.join(relative);

                if name.as_os_str().is_empty() {
                    continue;
                }

                if Self::is_excluded(excludes, &name) {
                    debug!("Excluding {}", entry.path().display());
                    continue;
                }

                builder.append_path_with_name(entry.path(), &name)?;
            }
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        io::Write::flush(&mut writer)?;
        Ok(())
    }

    pub fn sha256_file(path: &Path) -> Result<String, HostWatchError> {
        let f = File::open(path)?;
        let mut reader = BufReader::new(f);
        let mut hasher = Sha256::new();
        let mut buffer = [0; 8192]; // Read in 8KB chunks

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(encode(hasher.finalize()))
    }
}

impl Default for TarGzArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver for TarGzArchiver {
    fn extension(&self) -> &str {
        Self::EXTENSION
    }

    fn create(
        &self,
        dest: &Path,
        sources: &[PathBuf],
        excludes: &[String],
        skip: &[PathBuf],
    ) -> Result<u64, HostWatchError> {
        let _tmr = timer!(Level::Trace; "TarGzArchiver.create", "{}", dest.display());

        let excludes = Self::build_excludes(excludes)?;

        if let Err(e) = Self::write_archive(dest, sources, &excludes, skip) {
            if dest.exists() {
                if let Err(remove_err) = fs::remove_file(dest) {
                    debug!("Could not remove partial archive {}: {}", dest.display(), remove_err);
                }
            }
            return Err(e);
        }

        Ok(fs::metadata(dest)?.len())
    }

    fn verify(&self, path: &Path) -> Result<ArchiveDigest, HostWatchError> {
        let _tmr = timer!(Level::Trace; "TarGzArchiver.verify", "{}", path.display());

        let file = File::open(path)?;
        let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

        // Every header must parse and every entry's data must decompress
        let mut entries = 0;
        for entry in archive.entries()? {
            let mut entry = entry?;
            entry.path()?;
            io::copy(&mut entry, &mut io::sink())?;
            entries += 1;
        }

        // Drain past the end-of-archive marker so the gzip trailer CRC is checked
        io::copy(&mut archive.into_inner(), &mut io::sink())?;

        Ok(ArchiveDigest {
            entries,
            sha256: Self::sha256_file(path)?,
        })
    }
}
