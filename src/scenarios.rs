//! End-to-end runs of both pipelines against scratch directories, with the
//! mail and webhook channels replaced by recorders.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Local;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::archive::TarGzArchiver;
use crate::backup::testing::FakeStore;
use crate::cli::Cli;
use crate::config::Config;
use crate::lock::RunLock;
use crate::monitor::{Checkpoint, FileOutcome, FileState, LogMonitor, StateStore};
use crate::notify::testing::{notifier, RecordingMailer, RecordingWebhook};
use crate::notify::Notifier;
use crate::utils::Utils;
use crate::vcs::GitStore;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn scratch_config(dir: &Path) -> Config {
    let mut config = Config::default_for(dir);

    let etc = dir.join("srv/etc");
    let home = dir.join("srv/home");
    fs::create_dir_all(&etc).unwrap();
    fs::create_dir_all(home.join(".cache")).unwrap();
    fs::write(etc.join("hosts"), "127.0.0.1 localhost\n").unwrap();
    fs::write(home.join("notes.txt"), "remember the milk\n").unwrap();
    fs::write(home.join(".cache/huge.bin"), vec![0u8; 4096]).unwrap();

    config.backup.sources = vec![etc, home];
    config.backup.min_free_bytes = 0;
    config.backup.admin_email = Some("admin@example.com".to_owned());
    config.backup.compact_on = "02-29".to_owned();
    config.monitor.keywords = vec!["error".to_owned(), "denied".to_owned()];
    config
}

fn append(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(bytes).unwrap();
}

/// `len` bytes of newline-terminated filler followed by `line`
fn padded(len: usize, line: &str) -> Vec<u8> {
    assert!(line.len() < len);
    let mut bytes = vec![b'.'; len - line.len() - 1];
    bytes.push(b'\n');
    bytes.extend_from_slice(line.as_bytes());
    assert_eq!(bytes.len(), len);
    bytes
}

fn recorders() -> (RecordingMailer, RecordingWebhook, Notifier) {
    let mailer = RecordingMailer::default();
    let webhook = RecordingWebhook::default();
    let notifier = notifier(&mailer, &webhook, Some("https://chat.example.com/hook"));
    (mailer, webhook, notifier)
}

#[test]
fn test_backup_success_commits_to_git() {
    if !git_available() {
        return;
    }

    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());
    let (mailer, _webhook, notifier) = recorders();
    let archiver = TarGzArchiver::new();
    let store = GitStore::new(
        &config.backup.repo_dir,
        &config.backup.author_name,
        &config.backup.author_email,
    );
    let now = Local::now();
    let stamp = Utils::run_stamp(&now);

    let code =
        Cli::execute_backup(&config, now, &archiver, &store, &notifier, "db01", None).unwrap();

    assert_eq!(code, 0);
    let archive_name = format!("backup-{}.tar.gz", stamp);
    assert!(config.backup.archive_dir.join(&archive_name).exists());
    assert!(config.backup.repo_dir.join(&archive_name).exists());

    let output = Command::new("git")
        .current_dir(&config.backup.repo_dir)
        .args(["log", "--format=%s"])
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("System backup {}", stamp)
    );
    assert!(mailer.sent.borrow().is_empty());
}

#[test]
fn test_backup_missing_source_aborts_before_archiving() {
    let dir = TempDir::new().unwrap();
    let mut config = scratch_config(dir.path());
    config.backup.sources.push(dir.path().join("srv/missing"));
    let (mailer, _webhook, notifier) = recorders();
    let archiver = TarGzArchiver::new();
    let store = FakeStore::default();

    let run_log = dir.path().join("backup-run.log");
    fs::write(&run_log, "INFO Starting backup\n").unwrap();

    let code = Cli::execute_backup(
        &config,
        Local::now(),
        &archiver,
        &store,
        &notifier,
        "db01",
        Some(&run_log),
    )
    .unwrap();

    assert_ne!(code, 0);
    let archives: Vec<PathBuf> = fs::read_dir(&config.backup.archive_dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    assert!(archives.is_empty());
    assert!(store.commits.borrow().is_empty());

    let sent = mailer.sent.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "admin@example.com");
    assert!(sent[0].subject.ends_with("MISSING_SOURCE"));
    assert!(sent[0].body.contains("INFO Starting backup"));
}

#[test]
fn test_backup_contended_lock_reports_already_running() {
    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());
    let (mailer, _webhook, notifier) = recorders();
    let archiver = TarGzArchiver::new();
    let store = FakeStore::default();

    let _held = RunLock::acquire(&config.lock_dir, "backup").unwrap();
    let code =
        Cli::execute_backup(&config, Local::now(), &archiver, &store, &notifier, "db01", None)
            .unwrap();

    assert_eq!(code, 1);
    assert!(store.commits.borrow().is_empty());
    assert!(mailer.sent.borrow()[0].subject.ends_with("ALREADY_RUNNING"));
}

#[test]
fn test_monitor_growth_then_idle() {
    let dir = TempDir::new().unwrap();
    let mut config = scratch_config(dir.path());
    let log = dir.path().join("syslog");
    config.monitor.logs = vec![log.clone()];
    let (mailer, webhook, notifier) = recorders();
    let monitor =
        LogMonitor::new(&config.monitor, Some("alerts@example.com"), &notifier, "db01").unwrap();
    let store = StateStore::new(&config.monitor.state_dir);

    // An earlier pass already consumed the first 100 bytes
    append(&log, &padded(100, "boot ok\n"));
    monitor.run(Local::now());
    assert_eq!(store.load(&log).map(|c| c.offset), Some(100));

    append(&log, &padded(150, "kernel: I/O error on sda\n"));
    let report = monitor.run(Local::now());

    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].keyword, "error");
    assert_eq!(
        report.outcome(&log),
        Some(&FileOutcome::Scanned {
            state: FileState::Grew,
            bytes: 150,
            alerts: 1,
        })
    );
    assert_eq!(store.load(&log).map(|c| c.offset), Some(250));
    assert_eq!(mailer.sent.borrow().len(), 1);
    assert_eq!(webhook.posted.borrow().len(), 1);

    let checkpoint_before = store.load(&log);
    let report = monitor.run(Local::now());

    assert!(report.alerts.is_empty());
    assert_eq!(report.outcome(&log), Some(&FileOutcome::Unchanged));
    assert_eq!(store.load(&log), checkpoint_before);
    assert_eq!(mailer.sent.borrow().len(), 1);
}

#[test]
fn test_monitor_rotation_rescans_new_file() {
    let dir = TempDir::new().unwrap();
    let mut config = scratch_config(dir.path());
    let log = dir.path().join("auth.log");
    config.monitor.logs = vec![log.clone()];
    let (_mailer, _webhook, notifier) = recorders();
    let monitor = LogMonitor::new(&config.monitor, None, &notifier, "db01").unwrap();
    let store = StateStore::new(&config.monitor.state_dir);

    append(&log, &padded(250, "sshd: session opened\n"));
    monitor.run(Local::now());
    let before = store.load(&log).unwrap();
    assert_eq!(before.offset, 250);

    // Rotated away and kept on disk, so the new file cannot reuse the inode
    fs::rename(&log, dir.path().join("auth.log.1")).unwrap();
    append(&log, &padded(40, "sshd: access denied\n"));

    let report = monitor.run(Local::now());

    assert_eq!(
        report.outcome(&log),
        Some(&FileOutcome::Scanned {
            state: FileState::Rotated,
            bytes: 40,
            alerts: 1,
        })
    );
    assert_eq!(report.alerts[0].keyword, "denied");

    let after = store.load(&log).unwrap();
    assert_ne!(after.identity, before.identity);
    assert_eq!(
        after,
        Checkpoint {
            identity: after.identity,
            offset: 40
        }
    );

    // Scanned exactly once
    assert!(monitor.run(Local::now()).alerts.is_empty());
}

#[test]
fn test_monitor_first_scan_alerts_on_existing_content() {
    let dir = TempDir::new().unwrap();
    let mut config = scratch_config(dir.path());
    let log = dir.path().join("kern.log");
    config.monitor.logs = vec![log.clone()];
    append(&log, b"ERROR at the very start\nthen quiet\n");
    let (_mailer, _webhook, notifier) = recorders();
    let monitor = LogMonitor::new(&config.monitor, None, &notifier, "db01").unwrap();

    let report = monitor.run(Local::now());

    assert_eq!(report.alerts.len(), 1);
    assert!(matches!(
        report.outcome(&log),
        Some(FileOutcome::Scanned {
            state: FileState::New,
            ..
        })
    ));
}
