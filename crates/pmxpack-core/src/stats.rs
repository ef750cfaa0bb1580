//! Stats report persistence and rotation.
//!
//! At cleanup the pipeline writes `backup-stats-{timestamp}.json` into
//! the log directory and prunes old reports beyond the configured keep
//! count.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use pmxpack_types::BackupStats;

const REPORT_PREFIX: &str = "backup-stats-";

/// Write the final stats report atomically and return its path.
pub fn write_stats_report(log_dir: &Path, stats: &BackupStats) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

    let timestamp = stats.start_time.format("%Y%m%d-%H%M%S");
    let path = log_dir.join(format!("{}{}.json", REPORT_PREFIX, timestamp));
    let json = serde_json::to_string_pretty(stats).context("failed to serialize stats")?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all().context("failed to sync stats report")?;
    }
    fs::rename(&tmp, &path)
        .with_context(|| format!("failed to rename {} into place", path.display()))?;
    Ok(path)
}

/// Delete stats reports beyond the newest `keep`; returns how many were
/// removed. `keep == 0` disables rotation.
pub fn rotate_reports(log_dir: &Path, keep: u32) -> Result<usize> {
    if keep == 0 || !log_dir.exists() {
        return Ok(0);
    }

    let mut reports: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
    for entry in fs::read_dir(log_dir)
        .with_context(|| format!("failed to read {}", log_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(REPORT_PREFIX) || !name.ends_with(".json") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        reports.push((modified, entry.path()));
    }

    reports.sort_by(|a, b| b.0.cmp(&a.0));
    let mut removed = 0;
    for (_, path) in reports.into_iter().skip(keep as usize) {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove old report {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use pmxpack_types::HostType;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn report_round_trips() {
        let dir = tempdir().expect("tempdir");
        let mut stats = BackupStats::new("pve1", HostType::Pve);
        stats.archive_size = 4096;
        stats.finish();

        let path = write_stats_report(dir.path(), &stats).expect("write");
        let content = fs::read_to_string(&path).expect("read");
        let loaded: BackupStats = serde_json::from_str(&content).expect("parse");
        assert_eq!(loaded.hostname, "pve1");
        assert_eq!(loaded.archive_size, 4096);
    }

    #[test]
    fn rotation_keeps_newest_reports() {
        let dir = tempdir().expect("tempdir");
        for i in 0..5 {
            let name = format!("{}2025010{}-020000.json", REPORT_PREFIX, i + 1);
            fs::write(dir.path().join(&name), b"{}").expect("seed");
        }

        let removed = rotate_reports(dir.path(), 2).expect("rotate");
        assert_eq!(removed, 3);
        let left = fs::read_dir(dir.path()).expect("read").count();
        assert_eq!(left, 2);
    }

    #[test]
    fn rotation_disabled_with_zero_keep() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("backup-stats-x.json"), b"{}").expect("seed");
        assert_eq!(rotate_reports(dir.path(), 0).expect("rotate"), 0);
    }

    #[test]
    fn rotation_ignores_unrelated_files() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("other.json"), b"{}").expect("seed");
        fs::write(dir.path().join("backup-stats-a.json"), b"{}").expect("seed");
        let removed = rotate_reports(dir.path(), 1).expect("rotate");
        assert_eq!(removed, 0);
        assert!(dir.path().join("other.json").exists());
    }
}
