//! Storage targets for verified backup distribution.
//!
//! Every target implements [`StorageTarget`]: store, verify, list,
//! delete, retention, and stats over one destination. Concrete targets
//! are the primary/secondary directory target and the cloud target
//! driven through an external sync tool. A critical target's failure
//! aborts the pipeline; non-critical targets degrade to warnings.

mod cloud;
mod directory;
mod retention;

pub use cloud::{CloudConfig, CloudTarget, CliSyncTool, SyncTool};
pub use directory::DirectoryTarget;
pub use retention::{RetentionPlan, plan_retention};

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};

use pmxpack_types::{
    BackupMetadata, CompressionType, LocationStats, Reporter, RetentionSettings, StorageLocation,
};

/// Legacy filename prefix still accepted by listings and retention.
pub const LEGACY_PREFIX: &str = "proxmox-backup-";

/// Timestamp layout embedded in archive filenames.
pub const FILENAME_TIMESTAMP: &str = "%Y%m%d-%H%M%S";

/// Deletions and kept entries from one retention pass.
#[derive(Debug, Clone, Default)]
pub struct RetentionOutcome {
    pub kept: usize,
    pub deleted: usize,
}

/// Capability set implemented by every storage destination.
pub trait StorageTarget: Send + Sync {
    fn name(&self) -> &str;

    fn location(&self) -> StorageLocation;

    fn is_enabled(&self) -> bool;

    /// Whether a store/verify failure on this target aborts the run.
    fn is_critical(&self) -> bool;

    /// Identify the underlying filesystem or remote. Implementations
    /// cache the answer for the run.
    fn detect_filesystem(&self) -> Result<String>;

    /// Place the archive and its sidecars on the destination.
    fn store(&self, archive: &Path, sidecars: &[std::path::PathBuf], metadata: &BackupMetadata, reporter: &mut dyn Reporter) -> Result<()>;

    /// Confirm the stored archive matches the expected size and digest.
    fn verify_upload(&self, filename: &str, expected_size: u64, expected_sha256: Option<&str>) -> Result<()>;

    /// Backups currently on the destination, newest first.
    fn list(&self) -> Result<Vec<BackupMetadata>>;

    /// Remove one archive and its sidecars.
    fn delete(&self, filename: &str, reporter: &mut dyn Reporter) -> Result<()>;

    /// Apply the retention policy to the current listing.
    fn apply_retention(
        &self,
        settings: &RetentionSettings,
        reporter: &mut dyn Reporter,
    ) -> Result<RetentionOutcome>;

    /// Per-location stats folded into the pipeline report.
    fn get_stats(&self) -> Result<LocationStats>;
}

/// Archive file name for a host and timestamp:
/// `{hostname}-backup-{YYYYMMDD-HHMMSS}{ext}`.
pub fn archive_filename(hostname: &str, timestamp: DateTime<Utc>, extension: &str) -> String {
    format!(
        "{}-backup-{}{}",
        hostname,
        timestamp.format(FILENAME_TIMESTAMP),
        extension
    )
}

/// Whether a file name follows the backup naming convention (current or
/// legacy).
pub fn is_backup_filename(name: &str) -> bool {
    if !name.contains(".tar") {
        return false;
    }
    name.contains("-backup-") || name.starts_with(LEGACY_PREFIX)
}

/// Parse the timestamp embedded in a backup file name, if present.
pub fn parse_filename_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let rest = name.split("-backup-").nth(1)?;
    let stamp = rest.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, FILENAME_TIMESTAMP)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Compression implied by an archive file name.
pub fn compression_from_filename(name: &str) -> CompressionType {
    if name.ends_with(".tar.gz") {
        CompressionType::Gzip
    } else if name.ends_with(".tar.bz2") {
        CompressionType::Bzip2
    } else if name.ends_with(".tar.xz") {
        CompressionType::Xz
    } else if name.ends_with(".tar.lzma") {
        CompressionType::Lzma
    } else if name.ends_with(".tar.zst") {
        CompressionType::Zstd
    } else {
        CompressionType::None
    }
}

/// Stem of an archive name: everything before its `.tar*` suffix.
pub fn archive_stem(name: &str) -> &str {
    match name.find(".tar") {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Sidecar file names accompanying an archive.
pub fn sidecar_filenames(archive_name: &str) -> Vec<String> {
    let stem = archive_stem(archive_name);
    vec![
        format!("{}.manifest.json", stem),
        format!("{}.sha256", stem),
        format!("{}.metadata.json", stem),
    ]
}

/// Metadata sidecar name for an archive.
pub fn metadata_filename(archive_name: &str) -> String {
    format!("{}.metadata.json", archive_stem(archive_name))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn filename_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 11, 12, 3, 15, 0).unwrap();
        let name = archive_filename("pve1", ts, ".tar.zst");
        assert_eq!(name, "pve1-backup-20241112-031500.tar.zst");
        assert!(is_backup_filename(&name));
        assert_eq!(parse_filename_timestamp(&name), Some(ts));
    }

    #[test]
    fn legacy_names_are_recognized() {
        assert!(is_backup_filename("proxmox-backup-legacy.tar.gz"));
        assert!(is_backup_filename("proxmox-backup-20220101-000000.tar"));
        assert!(!is_backup_filename("proxmox-backup-notes.txt"));
        assert!(!is_backup_filename("random.tar.gz"));
    }

    #[test]
    fn legacy_name_without_timestamp_parses_to_none() {
        assert_eq!(parse_filename_timestamp("proxmox-backup-legacy.tar.gz"), None);
    }

    #[test]
    fn compression_inferred_from_suffix() {
        assert_eq!(compression_from_filename("a-backup-x.tar.zst"), CompressionType::Zstd);
        assert_eq!(compression_from_filename("a-backup-x.tar.gz"), CompressionType::Gzip);
        assert_eq!(compression_from_filename("a-backup-x.tar"), CompressionType::None);
    }

    #[test]
    fn sidecars_share_the_stem() {
        let sidecars = sidecar_filenames("pve1-backup-20241112-031500.tar.zst");
        assert_eq!(
            sidecars,
            vec![
                "pve1-backup-20241112-031500.manifest.json",
                "pve1-backup-20241112-031500.sha256",
                "pve1-backup-20241112-031500.metadata.json",
            ]
        );
    }
}
