//! Pre-flight checks run before any collection work starts.
//!
//! Checks are ordered and individually tagged with criticality; the
//! engine aborts with a preflight error on the first failed critical
//! check. The disk-space check runs twice: once up front against an
//! estimate and again after collection against the measured byte count.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::statvfs::statvfs;

use pmxpack_types::HostType;

use pmxpack_config::BackupConfig;

/// Fallback artifact estimate when no previous backup exists to size
/// against.
pub const DEFAULT_ESTIMATE: u64 = 256 * 1024 * 1024;

/// Outcome of a single pre-flight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub critical: bool,
}

impl CheckResult {
    fn pass(name: &str, message: String) -> Self {
        Self { name: name.to_string(), passed: true, message, critical: true }
    }

    fn fail(name: &str, message: String) -> Self {
        Self { name: name.to_string(), passed: false, message, critical: true }
    }

    fn advisory(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// Detect the host type by probing well-known path markers under `root`.
pub fn detect_host_type_at(root: &Path) -> HostType {
    if root.join("etc/pve").is_dir() {
        return HostType::Pve;
    }
    if root.join("etc/proxmox-backup").is_dir() {
        return HostType::Pbs;
    }
    HostType::Unknown
}

/// Detect the host type of the live system.
pub fn detect_host_type() -> HostType {
    detect_host_type_at(Path::new("/"))
}

/// Free bytes available to unprivileged writers on the filesystem
/// containing `path`.
pub fn free_space(path: &Path) -> Result<u64> {
    let vfs = statvfs(path)
        .with_context(|| format!("statvfs failed for {}", path.display()))?;
    Ok(vfs.blocks_available() as u64 * vfs.fragment_size() as u64)
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut probe = path;
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent,
            None => return PathBuf::from("/"),
        }
    }
    probe.to_path_buf()
}

/// Disk-space check: `required × safety_factor` must fit in the free
/// space of the directory (or its nearest existing ancestor).
pub fn check_disk_space(dir: &Path, required: u64, safety_factor: f64) -> CheckResult {
    let probe = nearest_existing(dir);
    let needed = (required as f64 * safety_factor) as u64;
    match free_space(&probe) {
        Ok(free) if free >= needed => CheckResult::pass(
            "disk-space",
            format!(
                "{} free in {}, {} needed",
                free,
                probe.display(),
                needed
            ),
        ),
        Ok(free) => CheckResult::fail(
            "disk-space",
            format!(
                "insufficient space in {}: {} free, {} needed (factor {})",
                probe.display(),
                free,
                needed,
                safety_factor
            ),
        ),
        Err(err) => CheckResult::fail("disk-space", format!("{:#}", err)),
    }
}

/// Run the ordered pre-flight check list.
///
/// `host_type` is the already-resolved type (detection plus any CLI
/// override); `estimate` is the expected artifact size.
pub fn run_all_checks(
    config: &BackupConfig,
    host_type: HostType,
    estimate: u64,
) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(if host_type == HostType::Unknown {
        CheckResult::fail(
            "host-type",
            "neither /etc/pve nor /etc/proxmox-backup found; pass --host-type to force one"
                .to_string(),
        )
    } else {
        CheckResult::pass("host-type", format!("detected {}", host_type))
    });

    let backup_parent = nearest_existing(&config.backup_dir);
    results.push(if is_writable_dir(&backup_parent) {
        CheckResult::pass("backup-dir", format!("{} is writable", backup_parent.display()))
    } else {
        CheckResult::fail(
            "backup-dir",
            format!("{} is not a writable directory", backup_parent.display()),
        )
    });

    let staging_root = std::env::temp_dir();
    results.push(if is_writable_dir(&staging_root) {
        CheckResult::pass("staging-root", format!("{} is writable", staging_root.display()))
    } else {
        CheckResult::fail(
            "staging-root",
            format!("{} is not a writable directory", staging_root.display()),
        )
    });

    results.push(check_disk_space(&config.backup_dir, estimate, config.safety_factor));

    let requested = config.compression_type;
    let effective = pmxpack_archive::resolve_compression(requested);
    results.push(if requested == effective {
        CheckResult::pass("codec", format!("{} toolchain available", requested)).advisory()
    } else {
        CheckResult::fail(
            "codec",
            format!("{} toolchain missing, falling back to {}", requested, effective),
        )
        .advisory()
    });

    results
}

/// First failed critical check, if any.
pub fn first_critical_failure(results: &[CheckResult]) -> Option<&CheckResult> {
    results.iter().find(|r| !r.passed && r.critical)
}

fn is_writable_dir(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let probe = dir.join(format!(".pmxpack-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn detects_pve_marker() {
        let root = tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("etc/pve")).expect("mkdir");
        assert_eq!(detect_host_type_at(root.path()), HostType::Pve);
    }

    #[test]
    fn detects_pbs_marker() {
        let root = tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("etc/proxmox-backup")).expect("mkdir");
        assert_eq!(detect_host_type_at(root.path()), HostType::Pbs);
    }

    #[test]
    fn unknown_without_markers() {
        let root = tempdir().expect("tempdir");
        assert_eq!(detect_host_type_at(root.path()), HostType::Unknown);
    }

    #[test]
    fn disk_check_passes_for_tiny_requirement() {
        let dir = tempdir().expect("tempdir");
        let result = check_disk_space(dir.path(), 1, 1.5);
        assert!(result.passed, "{}", result.message);
    }

    #[test]
    fn disk_check_fails_for_absurd_requirement() {
        let dir = tempdir().expect("tempdir");
        let result = check_disk_space(dir.path(), u64::MAX / 4, 1.5);
        assert!(!result.passed);
        assert!(result.message.contains("insufficient"));
    }

    #[test]
    fn disk_check_walks_up_to_existing_ancestor() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("not/yet/created");
        let result = check_disk_space(&missing, 1, 1.5);
        assert!(result.passed, "{}", result.message);
    }

    #[test]
    fn unknown_host_type_is_a_critical_failure() {
        let mut config = BackupConfig::default();
        let dir = tempdir().expect("tempdir");
        config.backup_dir = dir.path().to_path_buf();

        let results = run_all_checks(&config, HostType::Unknown, 1);
        let failure = first_critical_failure(&results).expect("critical failure");
        assert_eq!(failure.name, "host-type");
    }

    #[test]
    fn all_checks_pass_on_sane_setup() {
        let mut config = BackupConfig::default();
        let dir = tempdir().expect("tempdir");
        config.backup_dir = dir.path().to_path_buf();

        let results = run_all_checks(&config, HostType::Pve, 1);
        assert!(first_critical_failure(&results).is_none());
        // Order is stable: host type first, disk space before codec.
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["host-type", "backup-dir", "staging-root", "disk-space", "codec"]);
    }
}
