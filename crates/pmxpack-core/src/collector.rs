//! Collection phase: drive the host inventory into the staging tree.
//!
//! Operations run strictly in inventory order with a cancellation check
//! between items. Datastore sampling is the one place with intra-phase
//! parallelism: datastores are processed by a small worker pool and the
//! file sampling inside each datastore fans out again, all workers
//! sharing the walker's atomic counters and the cancellation token.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use serde::Serialize;

use pmxpack_config::BackupConfig;
use pmxpack_process::CommandRunner;
use pmxpack_types::{CancelToken, CollectionTotals, FileSummary, HostType, Reporter};
use pmxpack_walker::{ExclusionSet, Walker};

use crate::inventory::{CollectOp, inventory_for};

/// Patterns sampled inside datastore roots.
const DATASTORE_FILE_PATTERNS: &[&str] = &["*.conf", "*.json", "*.log"];

/// Result of a finished collection phase.
#[derive(Debug, Clone, Default)]
pub struct CollectorOutcome {
    pub totals: CollectionTotals,
    /// Number of non-fatal problems that were downgraded to warnings.
    pub warnings: u32,
}

/// Sampled shape of one datastore, persisted as a staging report.
#[derive(Debug, Serialize)]
struct DatastoreSample {
    name: String,
    path: PathBuf,
    directories: Vec<String>,
    files: Vec<FileSummary>,
}

/// Drives the declarative inventory for the detected host type.
pub struct Collector<'a> {
    config: &'a BackupConfig,
    host_type: HostType,
    staging: PathBuf,
    walker: Walker,
    runner: CommandRunner,
    cancel: CancelToken,
    dry_run: bool,
}

impl<'a> Collector<'a> {
    /// Build a collector, validating the exclusion globs up front.
    pub fn new(
        config: &'a BackupConfig,
        host_type: HostType,
        staging: PathBuf,
        cancel: CancelToken,
        dry_run: bool,
    ) -> Result<Self> {
        let excludes = ExclusionSet::compile(&config.exclude_patterns)
            .context("invalid exclude_patterns")?;
        let walker =
            Walker::new(staging.clone(), excludes, cancel.clone()).with_dry_run(dry_run);
        let runner = CommandRunner::new(cancel.clone(), config.command_timeout);
        Ok(Self { config, host_type, staging, walker, runner, cancel, dry_run })
    }

    pub fn totals(&self) -> CollectionTotals {
        self.walker.stats()
    }

    /// Run the full inventory plus datastore sampling.
    pub fn collect(&self, reporter: &mut dyn Reporter) -> Result<CollectorOutcome> {
        let mut warnings = 0u32;

        let ops = inventory_for(self.host_type, self.config);
        for op in &ops {
            self.cancel.checkpoint()?;
            warnings += self.run_op(op, reporter)?;
        }

        if self.config.collect_datastores {
            let datastores = discover_datastores(self.host_type, Path::new("/"));
            warnings += self.sample_datastores(&datastores, reporter)?;
        }

        Ok(CollectorOutcome { totals: self.walker.stats(), warnings })
    }

    fn run_op(&self, op: &CollectOp, reporter: &mut dyn Reporter) -> Result<u32> {
        let critical = op.is_critical();
        match op {
            CollectOp::CopyFile { source, .. } => {
                let result = self.walker.copy_file(source, reporter);
                self.settle_copy(result, op, critical, reporter)
            }
            CollectOp::CopyTree { source, .. } => {
                let result = self.walker.copy_tree(source, reporter);
                self.settle_copy(result, op, critical, reporter)
            }
            CollectOp::CaptureCommand { command, output, .. } => {
                self.run_command(command, output, &[], &[], critical, reporter)
            }
            CollectOp::MirrorCommand { command, output, mirrors, .. } => {
                self.run_command(command, output, mirrors, &[], critical, reporter)
            }
            CollectOp::OptionalCommand { command, output } => {
                self.run_command(command, output, &[], &[], false, reporter)
            }
            CollectOp::AuthenticatedCommand { command, output, credentials, .. } => {
                self.run_command(command, output, &[], credentials, critical, reporter)
            }
        }
    }

    fn settle_copy(
        &self,
        result: Result<()>,
        op: &CollectOp,
        critical: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<u32> {
        match result {
            Ok(()) => Ok(0),
            Err(err) if err.is::<pmxpack_types::Cancelled>() => Err(err),
            Err(err) if critical => {
                Err(err.context(format!("critical inventory item failed: {}", op.describe())))
            }
            Err(err) => {
                reporter.warn(&format!("{} failed: {:#}", op.describe(), err));
                Ok(1)
            }
        }
    }

    fn run_command(
        &self,
        command: &str,
        output: &Path,
        mirrors: &[PathBuf],
        credentials: &[String],
        critical: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<u32> {
        if self.dry_run {
            reporter.info(&format!("would run `{}`", command));
            return Ok(0);
        }

        let output_path = self.staging.join(output);
        let mirror_paths: Vec<PathBuf> =
            mirrors.iter().map(|m| self.staging.join(m)).collect();

        let result = if credentials.is_empty() {
            self.runner
                .mirror(command, critical, &output_path, &mirror_paths)?
        } else {
            let creds: Vec<(&str, Option<String>)> = credentials
                .iter()
                .map(|name| (name.as_str(), std::env::var(name).ok()))
                .collect();
            self.runner
                .authenticated(command, critical, &output_path, &creds)?
        };

        if let Some(warning) = result.warning {
            reporter.warn(&warning);
            return Ok(1);
        }

        let stats = self.walker.stats_handle();
        stats.add_file();
        stats.add_bytes(result.output.len() as u64);
        Ok(0)
    }

    /// Sample datastore roots in parallel and persist one report per
    /// datastore under `reports/datastores/`.
    pub fn sample_datastores(
        &self,
        datastores: &[(String, PathBuf)],
        reporter: &mut dyn Reporter,
    ) -> Result<u32> {
        if datastores.is_empty() {
            return Ok(0);
        }

        let queue: Mutex<VecDeque<(String, PathBuf)>> =
            Mutex::new(datastores.iter().cloned().collect());
        let issues: Mutex<Vec<String>> = Mutex::new(Vec::new());

        let workers = self
            .config
            .effective_datastore_concurrency()
            .min(datastores.len());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        let job = queue.lock().unwrap().pop_front();
                        let Some((name, path)) = job else {
                            return;
                        };
                        if let Err(err) = self.sample_one(&name, &path) {
                            issues
                                .lock()
                                .unwrap()
                                .push(format!("datastore {} sampling failed: {:#}", name, err));
                        }
                    }
                });
            }
        });

        self.cancel.checkpoint()?;

        let issues = issues.into_inner().unwrap();
        for issue in &issues {
            reporter.warn(issue);
        }
        Ok(issues.len() as u32)
    }

    fn sample_one(&self, name: &str, path: &Path) -> Result<()> {
        let directories = self.walker.sample_directories(path, 2, 64)?;

        // Fan out file sampling across top-level subdirectories.
        let top_level: Vec<&String> =
            directories.iter().filter(|d| !d.contains('/')).collect();
        let patterns: Vec<String> =
            DATASTORE_FILE_PATTERNS.iter().map(|p| p.to_string()).collect();

        let files: Mutex<Vec<FileSummary>> = Mutex::new(Vec::new());
        if top_level.is_empty() {
            let sampled = self.walker.sample_files(path, &patterns, 3, 256)?;
            files.lock().unwrap().extend(sampled);
        } else {
            let queue: Mutex<VecDeque<&String>> =
                Mutex::new(top_level.iter().copied().collect());
            let errors: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());
            let workers = self
                .config
                .effective_sampler_concurrency()
                .min(top_level.len());
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| {
                        loop {
                            if self.cancel.is_cancelled() {
                                return;
                            }
                            let sub = queue.lock().unwrap().pop_front();
                            let Some(sub) = sub else { return };
                            match self.walker.sample_files(&path.join(sub), &patterns, 2, 64) {
                                Ok(mut sampled) => {
                                    for summary in &mut sampled {
                                        summary.relative_path =
                                            format!("{}/{}", sub, summary.relative_path);
                                    }
                                    files.lock().unwrap().extend(sampled);
                                }
                                Err(err) => errors.lock().unwrap().push(err),
                            }
                        }
                    });
                }
            });
            if let Some(err) = errors.into_inner().unwrap().into_iter().next() {
                return Err(err);
            }
        }

        self.cancel.checkpoint()?;

        let mut files = files.into_inner().unwrap();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let sample = DatastoreSample {
            name: name.to_string(),
            path: path.to_path_buf(),
            directories,
            files,
        };

        let report = self
            .staging
            .join("reports/datastores")
            .join(format!("{}.json", name));
        if self.dry_run {
            return Ok(());
        }
        if let Some(parent) = report.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(&sample).context("failed to serialize sample")?;
        std::fs::write(&report, &json)
            .with_context(|| format!("failed to write {}", report.display()))?;

        let stats = self.walker.stats_handle();
        stats.add_file();
        stats.add_bytes(json.len() as u64);
        Ok(())
    }
}

/// Discover datastore roots from the host configuration under `root`.
///
/// PBS datastores come from `datastore.cfg`; PVE directory storages from
/// `storage.cfg`. Both files use the stanza format
/// `type: name` followed by indented `key value` lines.
pub fn discover_datastores(host_type: HostType, root: &Path) -> Vec<(String, PathBuf)> {
    let config_path = match host_type {
        HostType::Pbs => root.join("etc/proxmox-backup/datastore.cfg"),
        HostType::Pve => root.join("etc/pve/storage.cfg"),
        HostType::Unknown => return Vec::new(),
    };
    let Ok(content) = std::fs::read_to_string(&config_path) else {
        return Vec::new();
    };
    parse_datastore_stanzas(&content)
}

fn parse_datastore_stanzas(content: &str) -> Vec<(String, PathBuf)> {
    let mut datastores = Vec::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            current = line
                .split_once(':')
                .map(|(_, name)| name.trim().to_string())
                .filter(|name| !name.is_empty());
            continue;
        }
        let trimmed = line.trim();
        if let Some(name) = &current
            && let Some(path) = trimmed.strip_prefix("path ")
        {
            datastores.push((name.clone(), PathBuf::from(path.trim())));
        }
    }
    datastores
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pmxpack_types::NullReporter;
    use tempfile::tempdir;

    use super::*;

    fn collector_at<'a>(
        config: &'a BackupConfig,
        staging: &Path,
        dry_run: bool,
    ) -> Collector<'a> {
        Collector::new(
            config,
            HostType::Pve,
            staging.to_path_buf(),
            CancelToken::new(),
            dry_run,
        )
        .expect("collector")
    }

    #[test]
    fn invalid_exclusion_glob_is_rejected_up_front() {
        let staging = tempdir().expect("tempdir");
        let mut config = BackupConfig::default();
        config.exclude_patterns = vec!["[broken".to_string()];
        let result = Collector::new(
            &config,
            HostType::Pve,
            staging.path().to_path_buf(),
            CancelToken::new(),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn stanza_parser_reads_pbs_datastores() {
        let content = "\
datastore: tank
\tpath /mnt/datastore/tank
\tcomment main store

datastore: scratch
\tpath /mnt/scratch
";
        let stores = parse_datastore_stanzas(content);
        assert_eq!(
            stores,
            vec![
                ("tank".to_string(), PathBuf::from("/mnt/datastore/tank")),
                ("scratch".to_string(), PathBuf::from("/mnt/scratch")),
            ]
        );
    }

    #[test]
    fn stanza_parser_reads_pve_storage() {
        let content = "\
dir: local
\tpath /var/lib/vz
\tcontent iso,backup

lvmthin: local-lvm
\tthinpool data
";
        let stores = parse_datastore_stanzas(content);
        // Only storages with a filesystem path are sampled.
        assert_eq!(stores, vec![("local".to_string(), PathBuf::from("/var/lib/vz"))]);
    }

    #[test]
    fn sampling_writes_one_report_per_datastore() {
        let staging = tempdir().expect("tempdir");
        let store = tempdir().expect("tempdir");
        for rel in ["vm-100/disk.conf", "vm-100/notes.log", "vm-101/disk.conf", "iso/x.iso"] {
            let path = store.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            fs::write(&path, b"data").expect("write");
        }

        let config = BackupConfig::default();
        let collector = collector_at(&config, staging.path(), false);
        let warnings = collector
            .sample_datastores(
                &[("tank".to_string(), store.path().to_path_buf())],
                &mut NullReporter,
            )
            .expect("sample");
        assert_eq!(warnings, 0);

        let report = staging.path().join("reports/datastores/tank.json");
        let content = fs::read_to_string(&report).expect("report");
        let value: serde_json::Value = serde_json::from_str(&content).expect("json");
        assert_eq!(value["name"], "tank");
        let files = value["files"].as_array().expect("files");
        // Both .conf files and the .log, but never the iso.
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn sampling_fans_out_across_datastores() {
        let staging = tempdir().expect("tempdir");
        let mut stores = Vec::new();
        let mut dirs = Vec::new();
        for i in 0..5 {
            let dir = tempdir().expect("tempdir");
            fs::write(dir.path().join("state.conf"), b"x").expect("write");
            stores.push((format!("store-{}", i), dir.path().to_path_buf()));
            dirs.push(dir);
        }

        let config = BackupConfig::default();
        let collector = collector_at(&config, staging.path(), false);
        collector
            .sample_datastores(&stores, &mut NullReporter)
            .expect("sample");

        for i in 0..5 {
            assert!(
                staging
                    .path()
                    .join(format!("reports/datastores/store-{}.json", i))
                    .exists()
            );
        }
    }

    #[test]
    fn dry_run_commands_do_not_touch_staging() {
        let staging = tempdir().expect("tempdir");
        let config = BackupConfig::default();
        let collector = collector_at(&config, staging.path(), true);

        let warnings = collector
            .run_command(
                "uname -a",
                Path::new("reports/system/uname.txt"),
                &[],
                &[],
                false,
                &mut NullReporter,
            )
            .expect("dry run");
        assert_eq!(warnings, 0);
        assert!(!staging.path().join("reports").exists());
    }

    #[test]
    fn command_output_counts_into_stats() {
        let staging = tempdir().expect("tempdir");
        let config = BackupConfig::default();
        let collector = collector_at(&config, staging.path(), false);

        collector
            .run_command(
                "uname -s",
                Path::new("reports/system/uname.txt"),
                &[],
                &[],
                true,
                &mut NullReporter,
            )
            .expect("run");
        let totals = collector.totals();
        assert_eq!(totals.files_processed, 1);
        assert!(totals.bytes_collected > 0);
    }

    #[test]
    fn cancelled_collection_returns_the_sentinel() {
        let staging = tempdir().expect("tempdir");
        let config = BackupConfig::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let collector = Collector::new(
            &config,
            HostType::Pve,
            staging.path().to_path_buf(),
            cancel,
            false,
        )
        .expect("collector");

        let err = collector.collect(&mut NullReporter).unwrap_err();
        assert!(err.is::<pmxpack_types::Cancelled>());
    }
}
