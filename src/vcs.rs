use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};

use crate::error::HostWatchError;

/// A version-controlled working tree that keeps every archive ever produced
/// in its commit history
pub trait VersionStore {
    /// Initializes the repository the first time it is used
    fn ensure_repo(&self) -> Result<(), HostWatchError>;

    /// Copies `archive` into the working tree, stages it and commits
    fn commit(&self, archive: &Path, message: &str) -> Result<(), HostWatchError>;

    /// History compaction. An optimization only.
    fn compact(&self) -> Result<(), HostWatchError>;
}

/// `VersionStore` backed by the `git` command line tool
pub struct GitStore {
    repo_dir: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitStore {
    pub fn new(repo_dir: &Path, author_name: &str, author_email: &str) -> Self {
        GitStore {
            repo_dir: repo_dir.to_path_buf(),
            author_name: author_name.to_owned(),
            author_email: author_email.to_owned(),
        }
    }

    fn run_git(&self, args: &[&str]) -> Result<String, HostWatchError> {
        debug!("git {}", args.join(" "));

        let output = Command::new("git")
            .current_dir(&self.repo_dir)
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .output()
            .map_err(|e| HostWatchError::Error(format!("Failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(HostWatchError::Error(format!(
                "git {} failed ({}): {}",
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VersionStore for GitStore {
    fn ensure_repo(&self) -> Result<(), HostWatchError> {
        if self.repo_dir.join(".git").exists() {
            return Ok(());
        }

        fs::create_dir_all(&self.repo_dir)?;
        self.run_git(&["init", "--quiet"])?;
        info!("Initialized backup repository at {}", self.repo_dir.display());
        Ok(())
    }

    fn commit(&self, archive: &Path, message: &str) -> Result<(), HostWatchError> {
        let file_name = archive
            .file_name()
            .ok_or_else(|| HostWatchError::Error(format!("Not a file: {}", archive.display())))?;

        fs::copy(archive, self.repo_dir.join(file_name))?;

        let file_name = file_name.to_string_lossy();
        self.run_git(&["add", "--", &file_name])?;
        self.run_git(&["commit", "--quiet", "-m", message])?;
        Ok(())
    }

    fn compact(&self) -> Result<(), HostWatchError> {
        self.run_git(&["gc", "--aggressive", "--prune=now", "--quiet"])?;
        Ok(())
    }
}
