//! Cloud storage target driven through an external sync tool.
//!
//! The tool is an opaque CLI collaborator with rclone-compatible verbs
//! (`copyto`, `ls`, `lsl`, `deletefile`, `about`). Two separate budgets
//! apply: a short connection timeout for reachability probes and a long
//! operation timeout for transfers. Uploads are retried with exponential
//! backoff, each attempt bounded by the remaining operation deadline.
//! The target is never critical: failures degrade the run to warnings.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use pmxpack_process::{CommandOutput, CommandRunner, summarize_output};
use pmxpack_retry::{RetryExecutor, RetryStrategyConfig};
use pmxpack_types::{
    BackupMetadata, CancelToken, HostType, LocationStats, Reporter, RetentionSettings,
    StorageLocation,
};

use crate::retention::plan_retention;
use crate::{
    RetentionOutcome, StorageTarget, compression_from_filename, is_backup_filename,
    parse_filename_timestamp, sidecar_filenames,
};

/// Invocation surface of the sync tool, mockable in tests.
pub trait SyncTool: Send + Sync {
    /// Run the tool with `args`, bounded by `timeout`. Non-zero exits are
    /// reported in the output, not as errors.
    fn run(&self, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Real sync tool invocation through the command runner.
pub struct CliSyncTool {
    tool: String,
    runner: CommandRunner,
}

impl CliSyncTool {
    pub fn new(tool: String, cancel: CancelToken, default_timeout: Duration) -> Self {
        Self { tool, runner: CommandRunner::new(cancel, default_timeout) }
    }
}

impl SyncTool for CliSyncTool {
    fn run(&self, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        self.runner.run_with_timeout(&self.tool, args, &[], timeout)
    }
}

/// Settings for the cloud target.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Remote spec understood by the tool, e.g. `s3:bucket/pmxpack`.
    pub remote: String,
    /// Reachability probe budget.
    pub connection_timeout: Duration,
    /// Transfer budget per stored file.
    pub operation_timeout: Duration,
    /// Total upload attempts per file.
    pub upload_retries: u32,
    /// Files deleted per retention batch.
    pub delete_batch_size: u32,
    /// Pause between deletion batches.
    pub batch_pause: Duration,
    /// Backoff between upload attempts.
    pub retry: RetryStrategyConfig,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            remote: String::new(),
            connection_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(900),
            upload_retries: 3,
            delete_batch_size: 20,
            batch_pause: Duration::from_millis(500),
            retry: RetryStrategyConfig {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                ..Default::default()
            },
        }
    }
}

/// Cloud storage target.
pub struct CloudTarget {
    name: String,
    config: CloudConfig,
    tool: Box<dyn SyncTool>,
    cancel: CancelToken,
    enabled: bool,
    fs_cache: Mutex<Option<String>>,
}

impl CloudTarget {
    pub fn new(config: CloudConfig, tool: Box<dyn SyncTool>, cancel: CancelToken) -> Self {
        let mut config = config;
        config.retry.max_attempts = config.upload_retries.max(1);
        Self {
            name: "cloud".to_string(),
            config,
            tool,
            cancel,
            enabled: true,
            fs_cache: Mutex::new(None),
        }
    }

    /// Build against the real CLI tool binary.
    pub fn with_cli(config: CloudConfig, tool_binary: &str, cancel: CancelToken) -> Self {
        let tool = CliSyncTool::new(
            tool_binary.to_string(),
            cancel.clone(),
            config.operation_timeout,
        );
        Self::new(config, Box::new(tool), cancel)
    }

    fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.config.remote.trim_end_matches('/'), name)
    }

    fn upload_with_retry(&self, local: &Path, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.operation_timeout;
        let executor = RetryExecutor::new(self.config.retry.clone());
        let remote = self.remote_path(name);

        executor.run_with_deadline(deadline, |attempt, remaining| {
            self.cancel.checkpoint()?;
            if remaining.is_zero() {
                bail!("upload deadline exhausted before attempt {}", attempt);
            }
            let args = vec![
                "copyto".to_string(),
                local.to_string_lossy().into_owned(),
                remote.clone(),
            ];
            let output = self.tool.run(&args, remaining)?;
            if output.success() {
                Ok(())
            } else {
                Err(anyhow!(
                    "upload attempt {} for {} failed: {}",
                    attempt,
                    name,
                    summarize_output(&output.combined())
                ))
            }
        })
    }

    /// Primary verification: a single listing call that reports size.
    fn verify_primary(&self, filename: &str, expected_size: u64) -> Result<()> {
        let args = vec!["ls".to_string(), self.remote_path(filename)];
        let output = self.tool.run(&args, self.config.connection_timeout)?;
        if !output.success() {
            bail!(
                "ls failed for {}: {}",
                filename,
                summarize_output(&output.combined())
            );
        }
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            if let Some((size, name)) = parse_ls_line(line)
                && name == filename
            {
                if size == expected_size {
                    return Ok(());
                }
                bail!(
                    "remote {} has size {} but {} was expected",
                    filename,
                    size,
                    expected_size
                );
            }
        }
        bail!("remote listing did not include {}", filename)
    }

    /// Alternative verification: bulk listing filtered by name.
    fn verify_alternative(&self, filename: &str, expected_size: u64) -> Result<()> {
        for entry in self.list_raw()? {
            if entry.filename == filename {
                if entry.size == expected_size {
                    return Ok(());
                }
                bail!(
                    "remote {} has size {} but {} was expected",
                    filename,
                    entry.size,
                    expected_size
                );
            }
        }
        bail!("bulk listing did not include {}", filename)
    }

    fn list_raw(&self) -> Result<Vec<BackupMetadata>> {
        let args = vec!["lsl".to_string(), self.config.remote.clone()];
        let output = self.tool.run(&args, self.config.operation_timeout)?;
        if !output.success() {
            bail!("lsl failed: {}", summarize_output(&output.combined()));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut backups = Vec::new();
        for line in text.lines() {
            let Some((size, modified, name)) = parse_lsl_line(line) else {
                continue;
            };
            if !is_backup_filename(&name) {
                continue;
            }
            let timestamp = parse_filename_timestamp(&name).or(modified).unwrap_or_else(Utc::now);
            backups.push(BackupMetadata {
                timestamp,
                size,
                sha256: None,
                compression: compression_from_filename(&name),
                proxmox_type: HostType::Unknown,
                version: None,
                filename: name,
            });
        }
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    fn delete_one(&self, name: &str) -> Result<()> {
        let args = vec!["deletefile".to_string(), self.remote_path(name)];
        let output = self.tool.run(&args, self.config.operation_timeout)?;
        if !output.success() {
            bail!(
                "deletefile failed for {}: {}",
                name,
                summarize_output(&output.combined())
            );
        }
        Ok(())
    }
}

impl StorageTarget for CloudTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> StorageLocation {
        StorageLocation::Cloud
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn detect_filesystem(&self) -> Result<String> {
        let mut cache = self.fs_cache.lock().unwrap();
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }

        let args = vec![
            "lsd".to_string(),
            "--max-depth".to_string(),
            "1".to_string(),
            self.config.remote.clone(),
        ];
        let output = self
            .tool
            .run(&args, self.config.connection_timeout)
            .context("cloud remote unreachable")?;
        if !output.success() {
            bail!(
                "cloud remote unreachable: {}",
                summarize_output(&output.combined())
            );
        }

        let scheme = self
            .config
            .remote
            .split(':')
            .next()
            .unwrap_or("remote")
            .to_string();
        *cache = Some(scheme.clone());
        Ok(scheme)
    }

    fn store(
        &self,
        archive: &Path,
        sidecars: &[PathBuf],
        _metadata: &BackupMetadata,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let archive_name = archive
            .file_name()
            .context("archive path has no file name")?
            .to_string_lossy()
            .into_owned();

        self.upload_with_retry(archive, &archive_name)
            .with_context(|| format!("failed to upload {}", archive_name))?;

        for sidecar in sidecars {
            self.cancel.checkpoint()?;
            let Some(name) = sidecar.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !sidecar.exists() {
                continue;
            }
            if let Err(err) = self.upload_with_retry(sidecar, &name) {
                // Sidecars are advisory on the remote; the archive is the
                // artifact that must land.
                reporter.warn(&format!("failed to upload sidecar {}: {:#}", name, err));
            }
        }
        Ok(())
    }

    fn verify_upload(
        &self,
        filename: &str,
        expected_size: u64,
        _expected_sha256: Option<&str>,
    ) -> Result<()> {
        match self.verify_primary(filename, expected_size) {
            Ok(()) => Ok(()),
            Err(primary_err) => self.verify_alternative(filename, expected_size).map_err(|alt| {
                alt.context(format!("primary verification failed: {:#}", primary_err))
            }),
        }
    }

    fn list(&self) -> Result<Vec<BackupMetadata>> {
        self.list_raw()
    }

    fn delete(&self, filename: &str, reporter: &mut dyn Reporter) -> Result<()> {
        self.delete_one(filename)?;
        for sidecar in sidecar_filenames(filename) {
            if let Err(err) = self.delete_one(&sidecar) {
                reporter.debug(&format!("sidecar {} not deleted: {:#}", sidecar, err));
            }
        }
        Ok(())
    }

    fn apply_retention(
        &self,
        settings: &RetentionSettings,
        reporter: &mut dyn Reporter,
    ) -> Result<RetentionOutcome> {
        let backups = self.list_raw()?;
        let plan = plan_retention(settings, backups);

        // Expand archives into archive+sidecar file names and delete in
        // batches to stay under remote rate limits.
        let mut doomed = Vec::new();
        for backup in &plan.delete {
            reporter.info(&format!("retention: deleting {}", backup.filename));
            doomed.push(backup.filename.clone());
            doomed.extend(sidecar_filenames(&backup.filename));
        }

        let batch_size = self.config.delete_batch_size.max(1) as usize;
        for (index, batch) in doomed.chunks(batch_size).enumerate() {
            if index > 0 {
                std::thread::sleep(self.config.batch_pause);
            }
            for name in batch {
                self.cancel.checkpoint()?;
                if let Err(err) = self.delete_one(name) {
                    if is_backup_filename(name) {
                        reporter.warn(&format!("retention: {} not deleted: {:#}", name, err));
                    } else {
                        reporter.debug(&format!("sidecar {} not deleted: {:#}", name, err));
                    }
                }
            }
        }

        Ok(RetentionOutcome { kept: plan.keep.len(), deleted: plan.delete.len() })
    }

    fn get_stats(&self) -> Result<LocationStats> {
        let backup_count = self.list_raw()?.len() as u64;
        let mut stats = LocationStats { backup_count, free_space: None, total_space: None };

        let args = vec![
            "about".to_string(),
            "--json".to_string(),
            self.config.remote.clone(),
        ];
        if let Ok(output) = self.tool.run(&args, self.config.connection_timeout)
            && output.success()
            && let Ok(about) =
                serde_json::from_slice::<serde_json::Value>(&output.stdout)
        {
            stats.free_space = about.get("free").and_then(|v| v.as_u64());
            stats.total_space = about.get("total").and_then(|v| v.as_u64());
        }
        Ok(stats)
    }
}

/// Parse an `ls` line: `{size} {name}` (size column is padded).
fn parse_ls_line(line: &str) -> Option<(u64, String)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return None;
    }
    let size = tokens[0].parse::<u64>().ok()?;
    Some((size, tokens[1..].join(" ")))
}

/// Parse an `lsl` line: `{size} {date} {time} {name}`.
fn parse_lsl_line(line: &str) -> Option<(u64, Option<DateTime<Utc>>, String)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }
    let size = tokens[0].parse::<u64>().ok()?;
    let (date, time) = (tokens[1], tokens[2]);
    let name = tokens[3..].join(" ");

    let modified = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok().and_then(|d| {
        let time = time.split('.').next().unwrap_or(time);
        NaiveTime::parse_from_str(time, "%H:%M:%S")
            .ok()
            .map(|t| d.and_time(t).and_utc())
    });
    Some((size, modified, name))
}
