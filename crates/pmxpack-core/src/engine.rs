//! Pipeline orchestrator.
//!
//! Owns the phase sequence: preflight → collect → disk-recheck →
//! optimize → archive → digest+manifest → dispatch → notify →
//! log-handling. The staging directory is an RAII guard so it is removed
//! on every exit path, and the lock is released by drop as well as
//! explicitly. Failures are converted into a typed [`BackupError`] whose
//! phase tag drives the process exit code.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;

use pmxpack_archive::{ArchiveSettings, Archiver, CodecError};
use pmxpack_config::BackupConfig;
use pmxpack_lock::BackupLock;
use pmxpack_notify::{NotifyPayload, WebhookConfig, WebhookKind, notify_outcome};
use pmxpack_storage::{
    CloudConfig, CloudTarget, DirectoryTarget, StorageTarget, archive_filename,
};
use pmxpack_types::{
    BackupError, BackupMetadata, BackupStats, CancelToken, Cancelled, HostType, Manifest,
    Reporter,
};

use crate::collector::Collector;
use crate::preflight;
use crate::staging::StagingDir;
use crate::stats as stats_report;

/// Per-invocation options from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub host_type_override: Option<HostType>,
}

/// The backup pipeline engine.
pub struct Engine {
    config: BackupConfig,
    cancel: CancelToken,
    targets: Vec<Box<dyn StorageTarget>>,
}

impl Engine {
    /// Build an engine with the storage targets implied by the config.
    pub fn new(config: BackupConfig, cancel: CancelToken) -> Self {
        let mut targets: Vec<Box<dyn StorageTarget>> = vec![Box::new(DirectoryTarget::primary(
            config.backup_dir.clone(),
            cancel.clone(),
        ))];

        if config.secondary_enabled
            && let Some(dir) = &config.secondary_dir
        {
            targets.push(Box::new(DirectoryTarget::secondary(
                dir.clone(),
                config.secondary_critical,
                cancel.clone(),
            )));
        }

        if config.cloud_enabled
            && let Some(remote) = &config.cloud_remote
        {
            let cloud_config = CloudConfig {
                remote: remote.clone(),
                connection_timeout: config.cloud_connection_timeout,
                operation_timeout: config.cloud_operation_timeout,
                upload_retries: config.cloud_upload_retries,
                delete_batch_size: config.cloud_delete_batch_size,
                ..Default::default()
            };
            targets.push(Box::new(CloudTarget::with_cli(
                cloud_config,
                &config.cloud_tool,
                cancel.clone(),
            )));
        }

        Self { config, cancel, targets }
    }

    /// Register an additional storage target; dispatch runs targets in
    /// registration order.
    pub fn register_storage_target(&mut self, target: Box<dyn StorageTarget>) {
        self.targets.push(target);
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn targets(&self) -> &[Box<dyn StorageTarget>] {
        &self.targets
    }

    /// Execute the full pipeline.
    pub fn run(
        &self,
        opts: &RunOptions,
        reporter: &mut dyn Reporter,
    ) -> Result<BackupStats, BackupError> {
        let host_type = match opts.host_type_override.or(self.config.host_type) {
            Some(forced) => forced,
            None => preflight::detect_host_type(),
        };
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let mut stats = BackupStats::new(&hostname, host_type);
        stats.dry_run = opts.dry_run;
        stats.requested_compression = self.config.compression_type;

        let outcome = self.run_phases(host_type, &hostname, opts, &mut stats, reporter);
        stats.finish();

        // notify: strictly best-effort, failures are swallowed inside.
        let sinks = self.webhook_sinks();
        if !sinks.is_empty() && !opts.dry_run {
            let error_text = outcome.as_ref().err().map(|err| err.to_string());
            let payload = NotifyPayload::from_stats(&stats, error_text);
            notify_outcome(&sinks, &payload, reporter);
        }

        // log handling runs last, on success and failure alike.
        if !opts.dry_run {
            match stats_report::write_stats_report(&self.config.log_dir, &stats) {
                Ok(path) => reporter.info(&format!("stats report written to {}", path.display())),
                Err(err) => reporter.warn(&format!("failed to write stats report: {:#}", err)),
            }
            if let Err(err) =
                stats_report::rotate_reports(&self.config.log_dir, self.config.report_keep)
            {
                reporter.warn(&format!("report rotation failed: {:#}", err));
            }
        }

        outcome.map(|_| stats)
    }

    fn run_phases(
        &self,
        host_type: HostType,
        hostname: &str,
        opts: &RunOptions,
        stats: &mut BackupStats,
        reporter: &mut dyn Reporter,
    ) -> Result<(), BackupError> {
        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        // init: validate what the config alone can tell us.
        let settings = ArchiveSettings {
            compression: self.config.compression_type,
            level: self.config.compression_level,
            threads: self.config.compression_threads,
        };
        Archiver::validate(&settings).map_err(BackupError::config)?;
        if !self.targets.iter().any(|t| t.is_enabled() && t.is_critical()) {
            return Err(BackupError::config(anyhow!(
                "no enabled critical storage target configured"
            )));
        }

        let mut lock =
            BackupLock::acquire_with_timeout(&self.config.state_dir, self.config.lock_stale_after)
                .map_err(BackupError::preflight)?;

        // preflight
        reporter.info("running pre-flight checks");
        let estimate = self.estimate_artifact_size();
        let checks = preflight::run_all_checks(&self.config, host_type, estimate);
        for check in &checks {
            if check.passed {
                reporter.debug(&format!("check {}: {}", check.name, check.message));
            } else {
                reporter.warn(&format!("check {} failed: {}", check.name, check.message));
            }
        }
        if let Some(failure) = preflight::first_critical_failure(&checks) {
            return Err(BackupError::preflight(anyhow!(
                "{}: {}",
                failure.name,
                failure.message
            )));
        }

        // collect
        reporter.info(&format!("collecting {} host configuration", host_type));
        let staging = StagingDir::create_in_temp().map_err(BackupError::collection)?;
        let collector = Collector::new(
            &self.config,
            host_type,
            staging.path().to_path_buf(),
            self.cancel.clone(),
            opts.dry_run,
        )
        .map_err(BackupError::config)?;
        let collected = collector.collect(reporter).map_err(BackupError::collection)?;
        stats.collection = collected.totals;
        if collected.warnings > 0 {
            stats.has_warnings = true;
        }
        reporter.info(&format!(
            "collected {} files, {} bytes ({} failed)",
            stats.collection.files_processed,
            stats.collection.bytes_collected,
            stats.collection.files_failed
        ));

        // disk re-check against what was actually collected
        let recheck = preflight::check_disk_space(
            &self.config.backup_dir,
            stats.collection.bytes_collected,
            self.config.safety_factor,
        );
        if !recheck.passed {
            return Err(BackupError::disk(anyhow!(recheck.message)));
        }

        // optimize: best effort, failure only warns
        if let Err(err) = optimize_staging(staging.path()) {
            reporter.warn(&format!("staging optimization failed: {:#}", err));
            stats.has_warnings = true;
        }

        // archive
        let archiver = Archiver::new(settings, self.cancel.clone());
        stats.effective_compression = archiver.effective();
        stats.compression_level = archiver.level();
        if archiver.effective() != archiver.requested() {
            reporter.warn(&format!(
                "{} toolchain unavailable, using {}",
                archiver.requested(),
                archiver.effective()
            ));
            stats.has_warnings = true;
        }

        let archive_name = archive_filename(hostname, stats.start_time, archiver.extension());
        let archive_path = self.config.backup_dir.join(&archive_name);

        if opts.dry_run {
            reporter.info(&format!(
                "would create {} from {} collected bytes",
                archive_path.display(),
                stats.collection.bytes_collected
            ));
            return Ok(());
        }

        fs::create_dir_all(&self.config.backup_dir)
            .map_err(|err| BackupError::archive(anyhow!(err)))?;
        reporter.info(&format!("creating archive {}", archive_path.display()));
        archiver
            .create_archive(staging.path(), &archive_path)
            .map_err(|err| {
                if err.is::<CodecError>() {
                    BackupError::compression(err)
                } else {
                    BackupError::archive(err)
                }
            })?;
        stats.archive_path = Some(archive_path.clone());
        stats.archive_size = archiver
            .archive_size(&archive_path)
            .map_err(BackupError::archive)?;

        // digest + manifest; the archive existing and verified here is
        // the commit point of the run.
        reporter.info("verifying archive integrity");
        archiver
            .verify_archive(&archive_path)
            .map_err(BackupError::verification)?;
        let digest = pmxpack_digest::generate_checksum(&archive_path, &self.cancel)
            .map_err(BackupError::verification)?;

        let manifest = Manifest {
            archive_path: archive_path.clone(),
            archive_size: stats.archive_size,
            sha256: digest.clone(),
            created_at: stats.start_time,
            compression_type: stats.effective_compression,
            compression_level: stats.compression_level,
            compression_mode: None,
            proxmox_type: host_type,
            proxmox_targets: Some(
                self.targets
                    .iter()
                    .filter(|t| t.is_enabled())
                    .map(|t| t.name().to_string())
                    .collect(),
            ),
            proxmox_version: None,
            hostname: hostname.to_string(),
            script_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            encryption_mode: None,
        };
        let manifest_path = pmxpack_digest::manifest_path(&archive_path);
        pmxpack_digest::create_manifest(&manifest, &manifest_path)
            .map_err(BackupError::verification)?;
        let checksum_path = pmxpack_digest::write_checksum_sidecar(&archive_path, &digest)
            .map_err(BackupError::verification)?;
        stats.sha256 = Some(digest);
        stats.manifest_path = Some(manifest_path.clone());

        // dispatch
        let sidecars = vec![manifest_path, checksum_path];
        for target in &self.targets {
            self.dispatch_target(
                target.as_ref(),
                &archive_path,
                &archive_name,
                &sidecars,
                host_type,
                stats,
                reporter,
            )?;
        }

        let _ = lock.release();
        Ok(())
    }

    /// Store → verify → retention → stats for one target, strictly in
    /// that order.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_target(
        &self,
        target: &dyn StorageTarget,
        archive_path: &Path,
        archive_name: &str,
        sidecars: &[PathBuf],
        host_type: HostType,
        stats: &mut BackupStats,
        reporter: &mut dyn Reporter,
    ) -> Result<(), BackupError> {
        if !target.is_enabled() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        match target.detect_filesystem() {
            Ok(fstype) => {
                reporter.debug(&format!("target {} is backed by {}", target.name(), fstype));
            }
            Err(err) if target.is_critical() => {
                return Err(BackupError::storage(
                    err.context(format!("target {} unreachable", target.name())),
                ));
            }
            Err(err) => {
                reporter.warn(&format!("target {} unreachable: {:#}", target.name(), err));
                stats.has_warnings = true;
                return Ok(());
            }
        }

        let metadata = BackupMetadata {
            filename: archive_name.to_string(),
            timestamp: stats.start_time,
            size: stats.archive_size,
            sha256: stats.sha256.clone(),
            compression: stats.effective_compression,
            proxmox_type: host_type,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };

        reporter.info(&format!("storing archive on {} target", target.name()));
        let mut stored = true;
        if let Err(err) = target.store(archive_path, sidecars, &metadata, reporter) {
            if err.is::<Cancelled>() {
                return Err(BackupError::Cancelled);
            }
            if target.is_critical() {
                return Err(BackupError::storage(
                    err.context(format!("store failed on critical target {}", target.name())),
                ));
            }
            reporter.warn(&format!("store failed on {}: {:#}", target.name(), err));
            stats.has_warnings = true;
            stored = false;
        }

        if stored && let Err(err) =
            target.verify_upload(archive_name, stats.archive_size, stats.sha256.as_deref())
        {
            if err.is::<Cancelled>() {
                return Err(BackupError::Cancelled);
            }
            if target.is_critical() {
                return Err(BackupError::storage(err.context(format!(
                    "verification failed on critical target {}",
                    target.name()
                ))));
            }
            reporter.warn(&format!("verification failed on {}: {:#}", target.name(), err));
            stats.has_warnings = true;
        }

        // Retention still runs after a non-critical store failure so the
        // destination does not accumulate stale files across flaky runs.
        match target.apply_retention(&self.config.retention, reporter) {
            Ok(outcome) => {
                if outcome.deleted > 0 {
                    reporter.info(&format!(
                        "{}: retention kept {}, deleted {}",
                        target.name(),
                        outcome.kept,
                        outcome.deleted
                    ));
                }
            }
            Err(err) => {
                if err.is::<Cancelled>() {
                    return Err(BackupError::Cancelled);
                }
                reporter.warn(&format!("retention failed on {}: {:#}", target.name(), err));
                stats.has_warnings = true;
            }
        }

        match target.get_stats() {
            Ok(location) => stats.record_location(target.name(), location),
            Err(err) => {
                reporter.warn(&format!("stats query failed on {}: {:#}", target.name(), err));
                stats.has_warnings = true;
            }
        }

        Ok(())
    }

    /// Size the disk-space estimate on the most recent backup, falling
    /// back to a fixed default on an empty history.
    fn estimate_artifact_size(&self) -> u64 {
        self.targets
            .first()
            .and_then(|primary| primary.list().ok())
            .and_then(|backups| backups.first().map(|b| b.size))
            .filter(|size| *size > 0)
            .unwrap_or(preflight::DEFAULT_ESTIMATE)
    }

    fn webhook_sinks(&self) -> Vec<WebhookConfig> {
        let Some(url) = &self.config.webhook_url else {
            return Vec::new();
        };
        let kind = self
            .config
            .webhook_type
            .parse::<WebhookKind>()
            .unwrap_or_default();
        vec![WebhookConfig { url: url.clone(), kind, timeout_secs: 30 }]
    }
}

/// Best-effort staging optimization: prune directories that ended up
/// empty after exclusion matching so they do not bloat the archive.
fn optimize_staging(staging: &Path) -> anyhow::Result<usize> {
    let mut pruned = 0;
    // Deepest first so newly emptied parents are caught in one pass.
    let mut dirs: Vec<PathBuf> = walk_dirs(staging)?;
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        if dir == staging {
            continue;
        }
        if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
            pruned += 1;
        }
    }
    Ok(pruned)
}

fn walk_dirs(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
                pending.push(entry.path());
            }
        }
    }
    Ok(dirs)
}
