//! Archive digests and manifest sidecars.
//!
//! The archive is streamed through SHA-256 in 32 KiB chunks with a
//! cancellation check between chunks, so a signal interrupts hashing of
//! multi-gigabyte archives promptly. The manifest is a small structured
//! sidecar written atomically (tmp + rename) with group-readable
//! permissions; `load ∘ create` is the identity on the record.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use pmxpack_types::{CancelToken, Manifest};

/// Chunk size for streaming hash computation.
const HASH_CHUNK: usize = 32 * 1024;

/// Mode for manifests and checksum sidecars: owner read/write, group read.
const SIDECAR_MODE: u32 = 0o640;

/// Stream a file through SHA-256 and return the lowercase hex digest.
pub fn generate_checksum(path: &Path, cancel: &CancelToken) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];

    loop {
        cancel.checkpoint()?;
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file's digest against an expected value.
///
/// A mismatch is a `false` result, never an error; only I/O problems fail.
pub fn verify_checksum(path: &Path, expected: &str, cancel: &CancelToken) -> Result<bool> {
    let actual = generate_checksum(path, cancel)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Path of the manifest sidecar for an archive: the archive stem (name
/// without its `.tar*` suffix) plus `.manifest.json`.
pub fn manifest_path(archive: &Path) -> PathBuf {
    sibling_with_suffix(archive, ".manifest.json")
}

/// Path of the checksum sidecar for an archive.
pub fn checksum_path(archive: &Path) -> PathBuf {
    sibling_with_suffix(archive, ".sha256")
}

fn sibling_with_suffix(archive: &Path, suffix: &str) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match name.find(".tar") {
        Some(idx) => &name[..idx],
        None => name.as_str(),
    };
    archive.with_file_name(format!("{}{}", stem, suffix))
}

/// Write the manifest as pretty-printed JSON next to the archive.
pub fn create_manifest(manifest: &Manifest, path: &Path) -> Result<()> {
    let json =
        serde_json::to_string_pretty(manifest).context("failed to serialize manifest")?;
    write_sidecar(path, json.as_bytes())
}

/// Read a manifest back from disk.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    Ok(manifest)
}

/// Write a `sha256sum`-compatible checksum sidecar for an archive.
pub fn write_checksum_sidecar(archive: &Path, digest: &str) -> Result<PathBuf> {
    let path = checksum_path(archive);
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    write_sidecar(&path, format!("{}  {}\n", digest, name).as_bytes())?;
    Ok(path)
}

/// Atomic sidecar write: tmp + rename, then restrictive permissions.
fn write_sidecar(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} into place", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(SIDECAR_MODE))
        .with_context(|| format!("failed to set mode on {}", path.display()))?;
    Ok(())
}
