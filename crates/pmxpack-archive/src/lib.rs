//! Archive production for the staging tree.
//!
//! The tar container is built in process (deterministic lexicographic
//! entry order, symlinks preserved) and streamed into the stdin of an
//! external codec subprocess — the same gzip/pigz/bzip2/xz/zstd binaries
//! operators already have on a Proxmox host. Codec failures are kept
//! distinguishable from packaging failures via [`CodecError`] so the
//! pipeline can map them to the compression exit code.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use thiserror::Error;
use walkdir::WalkDir;

use pmxpack_types::{CancelToken, CompressionType};

/// Level used when a configured level is out of range for the codec.
pub const FALLBACK_LEVEL: u32 = 6;

/// Marker error for codec subprocess failures.
///
/// The orchestrator downcasts to this to distinguish the compression
/// phase from generic archive packaging failures.
#[derive(Debug, Error)]
#[error("codec subprocess failed: {0}")]
pub struct CodecError(pub String);

/// Requested archiver configuration, prior to resolution.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveSettings {
    pub compression: CompressionType,
    pub level: u32,
    /// 0 means let the codec pick (its own auto mode).
    pub threads: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self { compression: CompressionType::Zstd, level: FALLBACK_LEVEL, threads: 0 }
    }
}

/// Inclusive level range accepted by a codec.
pub fn level_range(compression: CompressionType) -> (u32, u32) {
    match compression {
        CompressionType::None => (0, 0),
        CompressionType::Gzip | CompressionType::Pigz | CompressionType::Bzip2 => (1, 9),
        CompressionType::Xz | CompressionType::Lzma => (0, 9),
        CompressionType::Zstd => (1, 19),
    }
}

/// Clamp a configured level into the codec's range.
///
/// Out-of-range levels fall back to [`FALLBACK_LEVEL`]; `none` is pinned
/// to 0.
pub fn normalize_level(compression: CompressionType, level: u32) -> u32 {
    let (lo, hi) = level_range(compression);
    if compression == CompressionType::None {
        return 0;
    }
    if level < lo || level > hi { FALLBACK_LEVEL } else { level }
}

/// On-disk archive suffix for a codec.
pub fn archive_extension(compression: CompressionType) -> &'static str {
    match compression {
        CompressionType::None => ".tar",
        CompressionType::Gzip | CompressionType::Pigz => ".tar.gz",
        CompressionType::Bzip2 => ".tar.bz2",
        CompressionType::Xz => ".tar.xz",
        CompressionType::Lzma => ".tar.lzma",
        CompressionType::Zstd => ".tar.zst",
    }
}

/// The binary a codec shells out to, or `None` for plain tar.
pub fn codec_binary(compression: CompressionType) -> Option<&'static str> {
    match compression {
        CompressionType::None => None,
        CompressionType::Gzip => Some("gzip"),
        CompressionType::Pigz => Some("pigz"),
        CompressionType::Bzip2 => Some("bzip2"),
        // lzma archives are produced by xz in lzma container mode
        CompressionType::Xz | CompressionType::Lzma => Some("xz"),
        CompressionType::Zstd => Some("zstd"),
    }
}

fn codec_available(compression: CompressionType) -> bool {
    match codec_binary(compression) {
        None => true,
        Some(binary) => which::which(binary).is_ok(),
    }
}

/// Resolve the requested codec against the binaries present on the host.
///
/// Falls back to zstd, then gzip, then plain tar when the requested
/// toolchain is missing.
pub fn resolve_compression(requested: CompressionType) -> CompressionType {
    if codec_available(requested) {
        return requested;
    }
    for fallback in [CompressionType::Zstd, CompressionType::Gzip, CompressionType::None] {
        if codec_available(fallback) {
            return fallback;
        }
    }
    CompressionType::None
}

/// Packages the staging tree into a single compressed archive.
#[derive(Debug, Clone)]
pub struct Archiver {
    requested: CompressionType,
    effective: CompressionType,
    level: u32,
    threads: u32,
    cancel: CancelToken,
}

impl Archiver {
    /// Reject invalid settings combinations.
    pub fn validate(settings: &ArchiveSettings) -> Result<()> {
        let (lo, hi) = level_range(settings.compression);
        if settings.compression != CompressionType::None
            && (settings.level < lo || settings.level > hi)
        {
            bail!(
                "compression level {} out of range {}..={} for {}",
                settings.level,
                lo,
                hi,
                settings.compression
            );
        }
        Ok(())
    }

    /// Build an archiver, resolving the codec against the host toolchain
    /// and normalizing the level for the effective codec.
    pub fn new(settings: ArchiveSettings, cancel: CancelToken) -> Self {
        let effective = resolve_compression(settings.compression);
        Self {
            requested: settings.compression,
            effective,
            level: normalize_level(effective, settings.level),
            threads: settings.threads,
            cancel,
        }
    }

    pub fn requested(&self) -> CompressionType {
        self.requested
    }

    pub fn effective(&self) -> CompressionType {
        self.effective
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Suffix for archives this archiver produces.
    pub fn extension(&self) -> &'static str {
        archive_extension(self.effective)
    }

    /// Pack `staging` into `destination`.
    pub fn create_archive(&self, staging: &Path, destination: &Path) -> Result<()> {
        match codec_binary(self.effective) {
            None => {
                let file = File::create(destination)
                    .with_context(|| format!("failed to create {}", destination.display()))?;
                let mut builder = tar::Builder::new(file);
                self.append_tree(&mut builder, staging)?;
                let file = builder.into_inner().context("failed to finish archive")?;
                file.sync_all().context("failed to sync archive")?;
                Ok(())
            }
            Some(binary) => self.create_compressed(binary, staging, destination),
        }
    }

    fn create_compressed(&self, binary: &str, staging: &Path, destination: &Path) -> Result<()> {
        let out = File::create(destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;

        let mut child = Command::new(binary)
            .args(self.compress_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| anyhow!(CodecError(format!("failed to spawn {}: {}", binary, err))))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!(CodecError(format!("{} has no stdin", binary))))?;
        let stderr_reader = spawn_stderr_reader(&mut child);

        let mut builder = tar::Builder::new(stdin);
        let append_result = self.append_tree(&mut builder, staging);
        // Close the stream (and the child's stdin) unconditionally so the
        // codec sees EOF before we wait on it.
        let finish_result = builder
            .into_inner()
            .context("failed to finish archive stream")
            .map(drop);
        let write_result = append_result.and(finish_result);

        let status = child.wait().context("failed to wait for codec")?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let _ = fs::remove_file(destination);
            return Err(anyhow!(CodecError(format!(
                "{} exited with {}: {}",
                binary,
                status.code().unwrap_or(-1),
                String::from_utf8_lossy(&stderr).trim()
            ))));
        }

        // The codec succeeded; any leftover write error is a packaging
        // problem on our side.
        write_result?;
        Ok(())
    }

    fn compress_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.effective == CompressionType::Lzma {
            args.push("--format=lzma".to_string());
        }
        args.push(format!("-{}", self.level));
        match self.effective {
            CompressionType::Pigz if self.threads > 0 => {
                args.push("-p".to_string());
                args.push(self.threads.to_string());
            }
            CompressionType::Xz | CompressionType::Lzma => {
                args.push(format!("-T{}", self.threads));
            }
            CompressionType::Zstd => {
                args.push(format!("-T{}", self.threads));
            }
            _ => {}
        }
        args.push("-c".to_string());
        args
    }

    fn append_tree<W: Write>(&self, builder: &mut tar::Builder<W>, staging: &Path) -> Result<()> {
        builder.follow_symlinks(false);

        for entry in WalkDir::new(staging)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            self.cancel.checkpoint()?;
            let entry = entry.context("failed to walk staging tree")?;
            let rel = entry
                .path()
                .strip_prefix(staging)
                .context("staging entry outside root")?;
            builder
                .append_path_with_name(entry.path(), rel)
                .with_context(|| format!("failed to append {}", rel.display()))?;
        }
        Ok(())
    }

    /// Size of a produced archive.
    pub fn archive_size(&self, path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to stat archive {}", path.display()))?;
        Ok(metadata.len())
    }

    /// Integrity check: run the codec in test mode, then walk every entry
    /// of the container. Returns the number of entries seen.
    pub fn verify_archive(&self, path: &Path) -> Result<u64> {
        if let Some(binary) = codec_binary(self.effective) {
            let output = Command::new(binary)
                .arg("-t")
                .arg(path)
                .output()
                .map_err(|err| {
                    anyhow!(CodecError(format!("failed to spawn {} -t: {}", binary, err)))
                })?;
            if !output.status.success() {
                return Err(anyhow!(CodecError(format!(
                    "{} -t failed on {}: {}",
                    binary,
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ))));
            }
        }

        match codec_binary(self.effective) {
            None => {
                let file = File::open(path)
                    .with_context(|| format!("failed to open archive {}", path.display()))?;
                self.walk_entries(tar::Archive::new(file))
            }
            Some(binary) => {
                let file = File::open(path)
                    .with_context(|| format!("failed to open archive {}", path.display()))?;
                let mut args: Vec<String> = Vec::new();
                if self.effective == CompressionType::Lzma {
                    args.push("--format=lzma".to_string());
                }
                args.push("-dc".to_string());
                let mut child = Command::new(binary)
                    .args(&args)
                    .stdin(Stdio::from(file))
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|err| {
                        anyhow!(CodecError(format!("failed to spawn {}: {}", binary, err)))
                    })?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow!(CodecError(format!("{} has no stdout", binary))))?;
                let entries = self.walk_entries(tar::Archive::new(stdout))?;
                let status = child.wait().context("failed to wait for codec")?;
                if !status.success() {
                    return Err(anyhow!(CodecError(format!(
                        "{} failed while decoding {}",
                        binary,
                        path.display()
                    ))));
                }
                Ok(entries)
            }
        }
    }

    fn walk_entries<R: Read>(&self, mut archive: tar::Archive<R>) -> Result<u64> {
        let mut count = 0u64;
        for entry in archive.entries().context("failed to read archive entries")? {
            self.cancel.checkpoint()?;
            let mut entry = entry.context("corrupt archive entry")?;
            std::io::copy(&mut entry, &mut std::io::sink())
                .context("failed to read archive entry body")?;
            count += 1;
        }
        Ok(count)
    }
}

fn spawn_stderr_reader(child: &mut Child) -> Option<thread::JoinHandle<Vec<u8>>> {
    child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stderr.read_to_end(&mut buffer);
            buffer
        })
    })
}
