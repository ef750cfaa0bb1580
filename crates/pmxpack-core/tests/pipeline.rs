//! End-to-end pipeline scenarios against a throwaway directory layout.
//!
//! These tests force the host type and disable the Proxmox-specific
//! inventory sections so the pipeline runs on any Linux build machine:
//! the remaining inventory items either exist everywhere or are skipped
//! silently by the walker.

use std::fs;
use std::path::{Path, PathBuf};

use pmxpack_config::BackupConfig;
use pmxpack_core::engine::{Engine, RunOptions};
use pmxpack_core::staging::MARKER_FILE;
use pmxpack_lock::BackupLock;
use pmxpack_storage::{RetentionOutcome, StorageTarget};
use pmxpack_types::{
    BackupMetadata, CancelToken, CompressionType, ExitCode, HostType, LocationStats,
    NullReporter, Reporter, RetentionSettings, StorageLocation,
};
use tempfile::TempDir;

struct Fixture {
    config: BackupConfig,
    _dirs: Vec<TempDir>,
}

fn fixture() -> Fixture {
    let backup = tempfile::tempdir().expect("backup dir");
    let state = tempfile::tempdir().expect("state dir");
    let log = tempfile::tempdir().expect("log dir");

    let mut config = BackupConfig::default();
    config.backup_dir = backup.path().join("backups");
    config.state_dir = state.path().to_path_buf();
    config.log_dir = log.path().to_path_buf();
    config.compression_type = CompressionType::None;
    config.compression_level = 0;
    config.collect_proxmox = false;
    config.collect_datastores = false;
    config.retention = RetentionSettings::Simple { max_backups: 3 };

    Fixture { config, _dirs: vec![backup, state, log] }
}

fn no_leftover_staging() -> bool {
    let prefix = format!("pmxpack-{}-", std::process::id());
    match fs::read_dir(std::env::temp_dir()) {
        Ok(entries) => !entries.flatten().any(|e| {
            e.file_name().to_string_lossy().starts_with(&prefix)
                && e.path().join(MARKER_FILE).exists()
        }),
        Err(_) => true,
    }
}

#[test]
fn successful_run_produces_verified_archive() {
    let fixture = fixture();
    let engine = Engine::new(fixture.config.clone(), CancelToken::new());
    let opts = RunOptions { dry_run: false, host_type_override: Some(HostType::Pve) };

    let stats = engine.run(&opts, &mut NullReporter).expect("pipeline");

    let archive_path = stats.archive_path.clone().expect("archive path");
    assert!(archive_path.exists());
    assert!(stats.archive_size > 0);
    assert_eq!(stats.effective_compression, CompressionType::None);

    // The manifest round-trips and its digest matches the archive.
    let manifest_path = stats.manifest_path.clone().expect("manifest path");
    let manifest = pmxpack_digest::load_manifest(&manifest_path).expect("manifest");
    assert_eq!(manifest.archive_size, stats.archive_size);
    assert_eq!(Some(&manifest.sha256), stats.sha256.as_ref());
    let ok = pmxpack_digest::verify_checksum(&archive_path, &manifest.sha256, &CancelToken::new())
        .expect("verify");
    assert!(ok);

    // Cleanup invariants: no staging left, lock released, report written.
    assert!(no_leftover_staging());
    assert!(!BackupLock::is_locked(&fixture.config.state_dir));
    let reports = fs::read_dir(&fixture.config.log_dir)
        .expect("log dir")
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("backup-stats-"))
        .count();
    assert_eq!(reports, 1);
}

#[test]
fn dry_run_writes_nothing_but_estimates() {
    let fixture = fixture();
    let engine = Engine::new(fixture.config.clone(), CancelToken::new());
    let opts = RunOptions { dry_run: true, host_type_override: Some(HostType::Pve) };

    let stats = engine.run(&opts, &mut NullReporter).expect("dry run");
    assert!(stats.dry_run);
    assert!(stats.archive_path.is_none());
    // Nothing landed in the backup directory.
    assert!(
        !fixture.config.backup_dir.exists()
            || fs::read_dir(&fixture.config.backup_dir).expect("read").count() == 0
    );
    assert!(no_leftover_staging());
}

#[test]
fn cancelled_run_exits_cleanly() {
    let fixture = fixture();
    let cancel = CancelToken::new();
    cancel.cancel();
    let engine = Engine::new(fixture.config.clone(), cancel);
    let opts = RunOptions { dry_run: false, host_type_override: Some(HostType::Pve) };

    let err = engine.run(&opts, &mut NullReporter).unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::Cancelled);
    assert!(no_leftover_staging());
    assert!(!BackupLock::is_locked(&fixture.config.state_dir));
}

#[test]
fn unknown_host_without_override_fails_preflight() {
    let fixture = fixture();
    let engine = Engine::new(fixture.config.clone(), CancelToken::new());
    let opts = RunOptions { dry_run: false, host_type_override: Some(HostType::Unknown) };

    let err = engine.run(&opts, &mut NullReporter).unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::PreflightError);
    assert!(!BackupLock::is_locked(&fixture.config.state_dir));
}

#[test]
fn concurrent_run_is_refused_by_the_lock() {
    let fixture = fixture();
    let _held = BackupLock::acquire(&fixture.config.state_dir).expect("hold lock");

    let engine = Engine::new(fixture.config.clone(), CancelToken::new());
    let opts = RunOptions { dry_run: false, host_type_override: Some(HostType::Pve) };
    let err = engine.run(&opts, &mut NullReporter).unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::PreflightError);
}

/// Target that accepts or rejects stores on demand.
struct ScriptedTarget {
    name: String,
    critical: bool,
    fail_store: bool,
    stored: std::sync::Mutex<Vec<String>>,
}

impl ScriptedTarget {
    fn new(name: &str, critical: bool, fail_store: bool) -> Self {
        Self {
            name: name.to_string(),
            critical,
            fail_store,
            stored: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl StorageTarget for ScriptedTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> StorageLocation {
        StorageLocation::Secondary
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn detect_filesystem(&self) -> anyhow::Result<String> {
        Ok("scripted".to_string())
    }

    fn store(
        &self,
        archive: &Path,
        _sidecars: &[PathBuf],
        _metadata: &BackupMetadata,
        _reporter: &mut dyn Reporter,
    ) -> anyhow::Result<()> {
        if self.fail_store {
            anyhow::bail!("scripted store failure");
        }
        self.stored
            .lock()
            .unwrap()
            .push(archive.file_name().unwrap().to_string_lossy().into_owned());
        Ok(())
    }

    fn verify_upload(
        &self,
        _filename: &str,
        _expected_size: u64,
        _expected_sha256: Option<&str>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<BackupMetadata>> {
        Ok(Vec::new())
    }

    fn delete(&self, _filename: &str, _reporter: &mut dyn Reporter) -> anyhow::Result<()> {
        Ok(())
    }

    fn apply_retention(
        &self,
        _settings: &RetentionSettings,
        _reporter: &mut dyn Reporter,
    ) -> anyhow::Result<RetentionOutcome> {
        Ok(RetentionOutcome::default())
    }

    fn get_stats(&self) -> anyhow::Result<LocationStats> {
        Ok(LocationStats { backup_count: 0, free_space: None, total_space: None })
    }
}

#[test]
fn non_critical_target_failure_degrades_to_warning() {
    let fixture = fixture();
    let mut engine = Engine::new(fixture.config.clone(), CancelToken::new());
    engine.register_storage_target(Box::new(ScriptedTarget::new("flaky", false, true)));

    let opts = RunOptions { dry_run: false, host_type_override: Some(HostType::Pve) };
    let stats = engine.run(&opts, &mut NullReporter).expect("pipeline survives");
    assert!(stats.has_warnings);
    assert!(stats.archive_path.unwrap().exists());
}

#[test]
fn critical_target_failure_aborts_with_storage_error() {
    let fixture = fixture();
    let mut engine = Engine::new(fixture.config.clone(), CancelToken::new());
    engine.register_storage_target(Box::new(ScriptedTarget::new("strict", true, true)));

    let opts = RunOptions { dry_run: false, host_type_override: Some(HostType::Pve) };
    let err = engine.run(&opts, &mut NullReporter).unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::StorageError);
    // Cleanup still ran.
    assert!(no_leftover_staging());
    assert!(!BackupLock::is_locked(&fixture.config.state_dir));
}

#[test]
fn repeated_runs_are_pruned_by_retention() {
    let fixture = fixture();
    let opts = RunOptions { dry_run: false, host_type_override: Some(HostType::Pve) };

    for _ in 0..2 {
        // Distinct start times come from distinct engine runs; the
        // timestamped filename keeps them from colliding.
        let engine = Engine::new(fixture.config.clone(), CancelToken::new());
        engine.run(&opts, &mut NullReporter).expect("pipeline");
        std::thread::sleep(std::time::Duration::from_millis(1100));
    }

    let archives = fs::read_dir(&fixture.config.backup_dir)
        .expect("backup dir")
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains("-backup-"))
        .filter(|e| e.file_name().to_string_lossy().contains(".tar"))
        .count();
    assert_eq!(archives, 2);
}
