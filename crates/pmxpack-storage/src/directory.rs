//! Directory-backed storage target, used for both the primary backup
//! directory and the secondary mirror.

use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use nix::sys::statvfs::statvfs;
use nix::unistd::{Gid, Uid, chown};

use pmxpack_types::{
    BackupMetadata, CancelToken, HostType, LocationStats, Reporter, RetentionSettings,
    StorageLocation,
};

use crate::retention::plan_retention;
use crate::{
    RetentionOutcome, StorageTarget, compression_from_filename, is_backup_filename,
    metadata_filename, parse_filename_timestamp, sidecar_filenames,
};

/// Mode for the backup directory itself.
const BACKUP_DIR_MODE: u32 = 0o700;
/// Mode applied to stored archives (best effort).
const STORED_FILE_MODE: u32 = 0o640;

/// Storage target writing to a local (or locally mounted) directory.
#[derive(Debug)]
pub struct DirectoryTarget {
    name: String,
    location: StorageLocation,
    base: PathBuf,
    enabled: bool,
    critical: bool,
    cancel: CancelToken,
    fs_cache: Mutex<Option<String>>,
}

impl DirectoryTarget {
    /// The primary backup directory: always enabled, always critical.
    pub fn primary(base: PathBuf, cancel: CancelToken) -> Self {
        Self {
            name: "local".to_string(),
            location: StorageLocation::Primary,
            base,
            enabled: true,
            critical: true,
            cancel,
            fs_cache: Mutex::new(None),
        }
    }

    /// A secondary mirror with configurable criticality.
    pub fn secondary(base: PathBuf, critical: bool, cancel: CancelToken) -> Self {
        Self {
            name: "secondary".to_string(),
            location: StorageLocation::Secondary,
            base,
            enabled: true,
            critical,
            cancel,
            fs_cache: Mutex::new(None),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create the backup directory with restrictive permissions.
    pub fn ensure_base(&self) -> Result<()> {
        if !self.base.exists() {
            fs::create_dir_all(&self.base)
                .with_context(|| format!("failed to create {}", self.base.display()))?;
        }
        fs::set_permissions(&self.base, fs::Permissions::from_mode(BACKUP_DIR_MODE))
            .with_context(|| format!("failed to set mode on {}", self.base.display()))?;
        Ok(())
    }

    /// Best-effort ownership and mode alignment with the backup
    /// directory; failures only warn.
    fn align_permissions(&self, path: &Path, reporter: &mut dyn Reporter) {
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(STORED_FILE_MODE)) {
            reporter.warn(&format!("failed to set mode on {}: {}", path.display(), err));
        }
        match fs::metadata(&self.base) {
            Ok(dir_meta) => {
                let uid = Uid::from_raw(dir_meta.uid());
                let gid = Gid::from_raw(dir_meta.gid());
                if let Err(err) = chown(path, Some(uid), Some(gid)) {
                    reporter.warn(&format!(
                        "failed to set owner on {}: {}",
                        path.display(),
                        err
                    ));
                }
            }
            Err(err) => {
                reporter.warn(&format!("failed to stat {}: {}", self.base.display(), err));
            }
        }
    }

    fn sha256_from_sidecar(&self, archive_name: &str) -> Option<String> {
        let stem = crate::archive_stem(archive_name);
        let path = self.base.join(format!("{}.sha256", stem));
        let content = fs::read_to_string(path).ok()?;
        content.split_whitespace().next().map(str::to_string)
    }

    fn metadata_from_sidecar(&self, archive_name: &str) -> Option<BackupMetadata> {
        let path = self.base.join(metadata_filename(archive_name));
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl StorageTarget for DirectoryTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> StorageLocation {
        self.location
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    fn detect_filesystem(&self) -> Result<String> {
        let mut cache = self.fs_cache.lock().unwrap();
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }
        let fstype = filesystem_of(&self.base);
        *cache = Some(fstype.clone());
        Ok(fstype)
    }

    fn store(
        &self,
        archive: &Path,
        sidecars: &[PathBuf],
        metadata: &BackupMetadata,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        self.cancel.checkpoint()?;
        self.ensure_base()?;

        let archive_name = archive
            .file_name()
            .context("archive path has no file name")?
            .to_string_lossy()
            .into_owned();
        let dest = self.base.join(&archive_name);

        // The archiver writes straight into the primary directory; do not
        // copy a file onto itself.
        if archive != dest {
            fs::copy(archive, &dest)
                .with_context(|| format!("failed to copy archive to {}", dest.display()))?;
        }
        self.align_permissions(&dest, reporter);

        for sidecar in sidecars {
            self.cancel.checkpoint()?;
            let Some(name) = sidecar.file_name() else {
                continue;
            };
            let sidecar_dest = self.base.join(name);
            if sidecar.as_path() != sidecar_dest.as_path() && sidecar.exists() {
                fs::copy(sidecar, &sidecar_dest).with_context(|| {
                    format!("failed to copy sidecar to {}", sidecar_dest.display())
                })?;
                self.align_permissions(&sidecar_dest, reporter);
            }
        }

        // Persist the metadata record so listings survive filename-only
        // information loss.
        let metadata_dest = self.base.join(metadata_filename(&archive_name));
        let json = serde_json::to_string_pretty(metadata).context("failed to serialize metadata")?;
        fs::write(&metadata_dest, json)
            .with_context(|| format!("failed to write {}", metadata_dest.display()))?;
        self.align_permissions(&metadata_dest, reporter);

        Ok(())
    }

    fn verify_upload(
        &self,
        filename: &str,
        expected_size: u64,
        expected_sha256: Option<&str>,
    ) -> Result<()> {
        let path = self.base.join(filename);
        let metadata = fs::metadata(&path)
            .with_context(|| format!("stored archive missing: {}", path.display()))?;
        if metadata.len() != expected_size {
            bail!(
                "stored archive {} has size {} but {} was expected",
                filename,
                metadata.len(),
                expected_size
            );
        }
        if let Some(expected) = expected_sha256 {
            let ok = pmxpack_digest::verify_checksum(&path, expected, &self.cancel)?;
            if !ok {
                bail!("stored archive {} failed checksum verification", filename);
            }
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<BackupMetadata>> {
        let mut backups = Vec::new();
        if !self.base.exists() {
            return Ok(backups);
        }

        for entry in fs::read_dir(&self.base)
            .with_context(|| format!("failed to read {}", self.base.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_backup_filename(&name) {
                continue;
            }
            let file_meta = entry.metadata()?;
            if !file_meta.is_file() {
                continue;
            }

            if let Some(mut record) = self.metadata_from_sidecar(&name) {
                record.filename = name;
                record.size = file_meta.len();
                backups.push(record);
                continue;
            }

            let timestamp = parse_filename_timestamp(&name)
                .or_else(|| file_meta.modified().ok().map(chrono::DateTime::from))
                .unwrap_or_else(chrono::Utc::now);
            backups.push(BackupMetadata {
                timestamp,
                size: file_meta.len(),
                sha256: self.sha256_from_sidecar(&name),
                compression: compression_from_filename(&name),
                proxmox_type: HostType::Unknown,
                version: None,
                filename: name,
            });
        }

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    fn delete(&self, filename: &str, reporter: &mut dyn Reporter) -> Result<()> {
        let path = self.base.join(filename);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
        }
        for sidecar in sidecar_filenames(filename) {
            let path = self.base.join(&sidecar);
            if path.exists()
                && let Err(err) = fs::remove_file(&path)
            {
                reporter.warn(&format!("failed to delete sidecar {}: {}", sidecar, err));
            }
        }
        Ok(())
    }

    fn apply_retention(
        &self,
        settings: &RetentionSettings,
        reporter: &mut dyn Reporter,
    ) -> Result<RetentionOutcome> {
        let backups = self.list()?;
        let plan = plan_retention(settings, backups);
        for doomed in &plan.delete {
            self.cancel.checkpoint()?;
            reporter.info(&format!("retention: deleting {}", doomed.filename));
            self.delete(&doomed.filename, reporter)?;
        }
        Ok(RetentionOutcome { kept: plan.keep.len(), deleted: plan.delete.len() })
    }

    fn get_stats(&self) -> Result<LocationStats> {
        let backup_count = self.list()?.len() as u64;
        let mut stats = LocationStats { backup_count, free_space: None, total_space: None };
        if let Ok(vfs) = statvfs(self.base.as_path()) {
            let frsize = vfs.fragment_size() as u64;
            stats.free_space = Some(vfs.blocks_available() as u64 * frsize);
            stats.total_space = Some(vfs.blocks() as u64 * frsize);
        }
        Ok(stats)
    }
}

/// Filesystem type of the mount point containing `path`, from
/// `/proc/mounts`.
fn filesystem_of(path: &Path) -> String {
    let mut content = String::new();
    if File::open("/proc/mounts")
        .and_then(|mut f| f.read_to_string(&mut content))
        .is_err()
    {
        return "unknown".to_string();
    }

    let target = path.to_string_lossy();
    let mut best: Option<(usize, String)> = None;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if target.starts_with(mount)
            && best.as_ref().map(|(len, _)| mount.len() > *len).unwrap_or(true)
        {
            best = Some((mount.len(), fstype.to_string()));
        }
    }
    best.map(|(_, fstype)| fstype).unwrap_or_else(|| "unknown".to_string())
}
