//! # Types
//!
//! Core domain types for pmxpack: host identity, compression selection,
//! storage locations, manifest and listing records, pipeline statistics,
//! the error taxonomy, and the cooperative cancellation token.
//!
//! ## Serialization
//!
//! Most types implement `Serialize` and `Deserialize` from `serde` for
//! persistence to disk (manifests, metadata sidecars, stats reports).
//! Timestamps are `chrono` UTC values serialized as RFC3339.
//!
//! ## Error taxonomy
//!
//! Every failure that crosses a phase boundary is a [`BackupError`]
//! carrying the phase it happened in; the process exit code is derived
//! from it via [`BackupError::exit_code`]. Cancellation is its own
//! variant so signal-driven shutdown is distinguishable from failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two Proxmox product variants this tool knows how to inventory,
/// plus the undetected case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostType {
    /// Proxmox VE virtualization node
    Pve,
    /// Proxmox Backup Server
    Pbs,
    /// Neither product detected
    #[default]
    Unknown,
}

impl std::fmt::Display for HostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostType::Pve => write!(f, "pve"),
            HostType::Pbs => write!(f, "pbs"),
            HostType::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for HostType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pve" | "proxmox-ve" => Ok(HostType::Pve),
            "pbs" | "proxmox-backup-server" => Ok(HostType::Pbs),
            "unknown" => Ok(HostType::Unknown),
            _ => anyhow::bail!("unknown host type: {}", s),
        }
    }
}

/// Compression codec for the archive step.
///
/// `Pigz` is parallel gzip; it produces gzip-compatible output and shares
/// the `.tar.gz` extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    /// Plain uncompressed tar
    None,
    /// Single-threaded gzip
    Gzip,
    /// Parallel gzip (gzip-compatible output)
    Pigz,
    /// bzip2
    Bzip2,
    /// xz
    Xz,
    /// Legacy lzma container
    Lzma,
    /// zstandard (default)
    #[default]
    Zstd,
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionType::None => write!(f, "none"),
            CompressionType::Gzip => write!(f, "gzip"),
            CompressionType::Pigz => write!(f, "pigz"),
            CompressionType::Bzip2 => write!(f, "bzip2"),
            CompressionType::Xz => write!(f, "xz"),
            CompressionType::Lzma => write!(f, "lzma"),
            CompressionType::Zstd => write!(f, "zstd"),
        }
    }
}

impl std::str::FromStr for CompressionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "tar" => Ok(CompressionType::None),
            "gzip" | "gz" => Ok(CompressionType::Gzip),
            "pigz" | "gzip-parallel" => Ok(CompressionType::Pigz),
            "bzip2" | "bz2" => Ok(CompressionType::Bzip2),
            "xz" => Ok(CompressionType::Xz),
            "lzma" => Ok(CompressionType::Lzma),
            "zstd" | "zst" => Ok(CompressionType::Zstd),
            _ => anyhow::bail!("unknown compression type: {}", s),
        }
    }
}

/// Location tag for a storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    /// The primary backup directory on the host
    Primary,
    /// A secondary mirror directory (NFS mount, second disk, ...)
    Secondary,
    /// A remote reached through the external sync tool
    Cloud,
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocation::Primary => write!(f, "primary"),
            StorageLocation::Secondary => write!(f, "secondary"),
            StorageLocation::Cloud => write!(f, "cloud"),
        }
    }
}

/// Pipeline phase used to tag errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Configuration parsing and validation
    Config,
    /// Pre-flight checks (lock, host detection, disk estimate)
    Preflight,
    /// File and command-output collection
    Collection,
    /// Optional post-collection optimization pass
    Optimization,
    /// Archive packaging
    Archive,
    /// Codec subprocess
    Compression,
    /// Digest and manifest verification
    Verification,
    /// Storage target dispatch
    Storage,
    /// Disk space re-check
    Disk,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Config => "config",
            Phase::Preflight => "preflight",
            Phase::Collection => "collection",
            Phase::Optimization => "optimization",
            Phase::Archive => "archive",
            Phase::Compression => "compression",
            Phase::Verification => "verification",
            Phase::Storage => "storage",
            Phase::Disk => "disk",
        };
        write!(f, "{}", s)
    }
}

/// Enumerated process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Ok,
    ConfigError,
    PreflightError,
    CollectionError,
    ArchiveError,
    CompressionError,
    VerificationError,
    StorageError,
    DiskSpaceError,
    Cancelled,
}

impl ExitCode {
    /// Numeric process exit code.
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Ok => 0,
            ExitCode::ConfigError => 1,
            ExitCode::PreflightError => 2,
            ExitCode::CollectionError => 3,
            ExitCode::ArchiveError => 4,
            ExitCode::CompressionError => 5,
            ExitCode::VerificationError => 6,
            ExitCode::StorageError => 7,
            ExitCode::DiskSpaceError => 8,
            ExitCode::Cancelled => 9,
        }
    }
}

/// Typed pipeline error: a phase tag wrapping the underlying cause.
///
/// The error crosses phase boundaries unchanged; the orchestrator inspects
/// it to derive the process exit code.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The run was cancelled by signal or by a fatal error elsewhere.
    #[error("backup cancelled")]
    Cancelled,
    /// A phase failed with an underlying cause. The cause keeps its full
    /// anyhow context chain and is rendered into the message.
    #[error("{phase} phase failed: {cause:#}")]
    Phase { phase: Phase, cause: anyhow::Error },
}

impl BackupError {
    pub fn phase(phase: Phase, cause: anyhow::Error) -> Self {
        // A cancellation sentinel anywhere in the chain wins over the
        // phase tag, so signal-driven aborts keep their exit code.
        if cause.is::<Cancelled>() {
            return BackupError::Cancelled;
        }
        BackupError::Phase { phase, cause }
    }

    pub fn config(source: anyhow::Error) -> Self {
        Self::phase(Phase::Config, source)
    }

    pub fn preflight(source: anyhow::Error) -> Self {
        Self::phase(Phase::Preflight, source)
    }

    pub fn collection(source: anyhow::Error) -> Self {
        Self::phase(Phase::Collection, source)
    }

    pub fn archive(source: anyhow::Error) -> Self {
        Self::phase(Phase::Archive, source)
    }

    pub fn compression(source: anyhow::Error) -> Self {
        Self::phase(Phase::Compression, source)
    }

    pub fn verification(source: anyhow::Error) -> Self {
        Self::phase(Phase::Verification, source)
    }

    pub fn storage(source: anyhow::Error) -> Self {
        Self::phase(Phase::Storage, source)
    }

    pub fn disk(source: anyhow::Error) -> Self {
        Self::phase(Phase::Disk, source)
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            BackupError::Cancelled => ExitCode::Cancelled,
            BackupError::Phase { phase, .. } => match phase {
                Phase::Config => ExitCode::ConfigError,
                Phase::Preflight => ExitCode::PreflightError,
                Phase::Collection | Phase::Optimization => ExitCode::CollectionError,
                Phase::Archive => ExitCode::ArchiveError,
                Phase::Compression => ExitCode::CompressionError,
                Phase::Verification => ExitCode::VerificationError,
                Phase::Storage => ExitCode::StorageError,
                Phase::Disk => ExitCode::DiskSpaceError,
            },
        }
    }
}

/// Logging surface passed by parameter into every subsystem.
///
/// The CLI installs a console implementation; tests use
/// [`NullReporter`]. There is no global logger.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
    /// Low-interest detail; default implementation drops it.
    fn debug(&mut self, _msg: &str) {}
}

/// Reporter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Sentinel error for cooperative cancellation.
///
/// Subsystems return this (wrapped in `anyhow::Error`) when the shared
/// [`CancelToken`] fires; the orchestrator downcasts it to map the run to
/// the cancelled exit code instead of a phase failure.
#[derive(Debug, Clone, Copy, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Process-wide cooperative cancellation token.
///
/// Cloned handles share one flag. Long-running loops call
/// [`CancelToken::checkpoint`] between units of work (file copies, hash
/// chunks, inventory items) and bail out with [`Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }
}

/// Serializable snapshot of the collection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionTotals {
    /// Files successfully copied or captured
    pub files_processed: u64,
    /// Files that failed to copy (missing sources do not count)
    pub files_failed: u64,
    /// Directories created in the staging tree
    pub directories_created: u64,
    /// Bytes actually written into the staging tree
    pub bytes_collected: u64,
}

impl CollectionTotals {
    /// Fold another snapshot into this one.
    pub fn merge(&mut self, other: &CollectionTotals) {
        self.files_processed += other.files_processed;
        self.files_failed += other.files_failed;
        self.directories_created += other.directories_created;
        self.bytes_collected += other.bytes_collected;
    }
}

/// Immutable record produced by directory/file sampling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    /// Path relative to the sampled root, forward-slash form
    pub relative_path: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time
    pub modified: DateTime<Utc>,
}

/// Structured sidecar recording archive digest and metadata.
///
/// Written next to the archive as `{stem}.manifest.json`. Immutable once
/// written; load∘create is the identity on the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub archive_path: PathBuf,
    pub archive_size: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub compression_type: CompressionType,
    pub compression_level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_mode: Option<String>,
    pub proxmox_type: HostType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxmox_targets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxmox_version: Option<String>,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_mode: Option<String>,
}

/// Per-archive record returned by storage listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Archive file name (no directory component)
    pub filename: String,
    /// Timestamp parsed from the filename or a sidecar
    pub timestamp: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub compression: CompressionType,
    pub proxmox_type: HostType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Retention policy for a storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RetentionSettings {
    /// Keep the newest `max_backups`; 0 disables retention.
    Simple { max_backups: u32 },
    /// Grandfather-father-son bucket counts.
    Gfs {
        daily: u32,
        weekly: u32,
        monthly: u32,
        yearly: u32,
    },
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings::Simple { max_backups: 10 }
    }
}

impl RetentionSettings {
    /// True when the policy can never delete anything.
    pub fn is_disabled(&self) -> bool {
        matches!(self, RetentionSettings::Simple { max_backups: 0 })
    }
}

/// Per-location figures folded into the pipeline stats after dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationStats {
    pub backup_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_space: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_space: Option<u64>,
}

/// Accumulator that grows across pipeline phases and is persisted as the
/// stats report at cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStats {
    pub hostname: String,
    pub proxmox_type: HostType,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    pub collection: CollectionTotals,
    pub requested_compression: CompressionType,
    pub effective_compression: CompressionType,
    pub compression_level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    pub archive_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    /// Archive size over bytes collected; absent until both are known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    pub locations: BTreeMap<String, LocationStats>,
    pub has_warnings: bool,
    pub dry_run: bool,
}

impl BackupStats {
    pub fn new(hostname: impl Into<String>, proxmox_type: HostType) -> Self {
        Self {
            hostname: hostname.into(),
            proxmox_type,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: 0,
            collection: CollectionTotals::default(),
            requested_compression: CompressionType::default(),
            effective_compression: CompressionType::default(),
            compression_level: 0,
            archive_path: None,
            archive_size: 0,
            sha256: None,
            manifest_path: None,
            compression_ratio: None,
            locations: BTreeMap::new(),
            has_warnings: false,
            dry_run: false,
        }
    }

    /// Stamp the end time, duration, and compression ratio.
    pub fn finish(&mut self) {
        let end = Utc::now();
        self.duration_secs = (end - self.start_time).num_seconds().max(0) as u64;
        self.end_time = Some(end);
        if self.archive_size > 0 && self.collection.bytes_collected > 0 {
            self.compression_ratio =
                Some(self.archive_size as f64 / self.collection.bytes_collected as f64);
        }
    }

    /// Record per-location figures under the target's name.
    pub fn record_location(&mut self, name: &str, stats: LocationStats) {
        self.locations.insert(name.to_string(), stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn host_type_round_trip() {
        for ht in [HostType::Pve, HostType::Pbs, HostType::Unknown] {
            assert_eq!(HostType::from_str(&ht.to_string()).unwrap(), ht);
        }
        assert!(HostType::from_str("esxi").is_err());
    }

    #[test]
    fn compression_aliases() {
        assert_eq!(
            CompressionType::from_str("gzip-parallel").unwrap(),
            CompressionType::Pigz
        );
        assert_eq!(CompressionType::from_str("zst").unwrap(), CompressionType::Zstd);
        assert_eq!(CompressionType::from_str("tar").unwrap(), CompressionType::None);
    }

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::ConfigError.code(), 1);
        assert_eq!(ExitCode::StorageError.code(), 7);
        assert_eq!(ExitCode::DiskSpaceError.code(), 8);
        assert_eq!(ExitCode::Cancelled.code(), 9);
    }

    #[test]
    fn phase_errors_map_to_exit_codes() {
        let err = BackupError::storage(anyhow::anyhow!("copy failed"));
        assert_eq!(err.exit_code(), ExitCode::StorageError);
        assert_eq!(BackupError::Cancelled.exit_code(), ExitCode::Cancelled);
    }

    #[test]
    fn cancellation_sentinel_wins_over_phase_tag() {
        let err = BackupError::collection(anyhow::Error::new(Cancelled));
        assert_eq!(err.exit_code(), ExitCode::Cancelled);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.checkpoint().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(token.checkpoint().is_err());
    }

    #[test]
    fn collection_totals_merge() {
        let mut a = CollectionTotals {
            files_processed: 2,
            files_failed: 1,
            directories_created: 3,
            bytes_collected: 100,
        };
        let b = CollectionTotals {
            files_processed: 5,
            files_failed: 0,
            directories_created: 1,
            bytes_collected: 900,
        };
        a.merge(&b);
        assert_eq!(a.files_processed, 7);
        assert_eq!(a.bytes_collected, 1000);
    }

    #[test]
    fn manifest_json_round_trip() {
        let manifest = Manifest {
            archive_path: PathBuf::from("/opt/pb/backup/test.tar.xz"),
            archive_size: 1024,
            sha256: "abc123".to_string(),
            created_at: Utc::now(),
            compression_type: CompressionType::Xz,
            compression_level: 6,
            compression_mode: None,
            proxmox_type: HostType::Pbs,
            proxmox_targets: None,
            proxmox_version: Some("3.2".to_string()),
            hostname: "test-host".to_string(),
            script_version: Some("0.2.0".to_string()),
            encryption_mode: None,
        };
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
        // Optional fields stay out of the serialized form entirely.
        assert!(!json.contains("compression_mode"));
    }

    #[test]
    fn retention_disabled_only_for_simple_zero() {
        assert!(RetentionSettings::Simple { max_backups: 0 }.is_disabled());
        assert!(!RetentionSettings::Simple { max_backups: 1 }.is_disabled());
        assert!(
            !RetentionSettings::Gfs { daily: 0, weekly: 0, monthly: 0, yearly: 0 }.is_disabled()
        );
    }

    #[test]
    fn stats_finish_computes_ratio() {
        let mut stats = BackupStats::new("pve1", HostType::Pve);
        stats.collection.bytes_collected = 1000;
        stats.archive_size = 250;
        stats.finish();
        assert!(stats.end_time.is_some());
        let ratio = stats.compression_ratio.unwrap();
        assert!((ratio - 0.25).abs() < f64::EPSILON);
    }
}
