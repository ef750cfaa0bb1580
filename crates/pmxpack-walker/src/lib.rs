//! Filesystem walker for the collection phase.
//!
//! The walker copies files and trees from the live host into the staging
//! tree, mirroring absolute paths under the staging root
//! (`/etc/hostname` → `{staging}/etc/hostname`). Missing sources are a
//! silent no-op — many inventory paths are optional. Symbolic links are
//! recreated with the same target string; device, socket, and fifo nodes
//! are skipped with a debug message and not counted as failures.
//!
//! Traversal is deterministic (lexicographic), directories are created
//! before their contents, and every step rechecks the cancellation token.

mod exclude;

pub use exclude::ExclusionSet;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, symlink};
use std::path::{Path, PathBuf};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use pmxpack_types::{CancelToken, CollectionTotals, FileSummary, Reporter};

/// Mode for files copied into the staging tree.
const STAGED_FILE_MODE: u32 = 0o640;

/// Shared collection counters, updated atomically by walker operations.
///
/// Counters only ever increase during a run.
#[derive(Debug, Default)]
pub struct WalkStats {
    files_processed: AtomicU64,
    files_failed: AtomicU64,
    directories_created: AtomicU64,
    bytes_collected: AtomicU64,
}

impl WalkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_directory(&self) {
        self.directories_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_collected.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Serializable snapshot of the counters.
    pub fn snapshot(&self) -> CollectionTotals {
        CollectionTotals {
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            directories_created: self.directories_created.load(Ordering::Relaxed),
            bytes_collected: self.bytes_collected.load(Ordering::Relaxed),
        }
    }
}

/// Scoped copy/sample operations over the staging tree.
#[derive(Debug, Clone)]
pub struct Walker {
    staging_root: PathBuf,
    excludes: Arc<ExclusionSet>,
    cancel: CancelToken,
    stats: Arc<WalkStats>,
    dry_run: bool,
    // Directories already "created" in dry-run mode, so repeated copies
    // into one directory count it once, like a real run would.
    dry_run_dirs: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Walker {
    pub fn new(staging_root: PathBuf, excludes: ExclusionSet, cancel: CancelToken) -> Self {
        Self {
            staging_root,
            excludes: Arc::new(excludes),
            cancel,
            stats: Arc::new(WalkStats::new()),
            dry_run: false,
            dry_run_dirs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Snapshot of the shared counters.
    pub fn stats(&self) -> CollectionTotals {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<WalkStats> {
        Arc::clone(&self.stats)
    }

    /// Destination inside the staging tree mirroring an absolute source.
    pub fn staging_path(&self, source: &Path) -> PathBuf {
        let relative = source.strip_prefix("/").unwrap_or(source);
        self.staging_root.join(relative)
    }

    /// Copy a single file (or symlink) into the staging tree.
    ///
    /// An absent source is a silent no-op. A directory source delegates
    /// to [`Walker::copy_tree`].
    pub fn copy_file(&self, source: &Path, reporter: &mut dyn Reporter) -> Result<()> {
        self.cancel.checkpoint()?;

        let metadata = match fs::symlink_metadata(source) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                self.stats.add_failure();
                return Err(err).with_context(|| format!("failed to stat {}", source.display()));
            }
        };

        if metadata.is_dir() {
            return self.copy_tree(source, reporter);
        }
        if self.excludes.is_excluded(source, Some(&self.staging_root)) {
            return Ok(());
        }

        let dest = self.staging_path(source);
        match self.copy_one(source, &metadata, &dest, reporter) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stats.add_failure();
                Err(err)
            }
        }
    }

    /// Recursively copy a directory tree into the staging tree.
    ///
    /// Exclusion matches on a directory skip the whole subtree. Per-file
    /// failures are counted and reported but do not stop the walk.
    pub fn copy_tree(&self, source_root: &Path, reporter: &mut dyn Reporter) -> Result<()> {
        if !source_root.exists() {
            return Ok(());
        }

        let mut it = WalkDir::new(source_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = it.next() {
            self.cancel.checkpoint()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    self.stats.add_failure();
                    reporter.warn(&format!("walk error under {}: {}", source_root.display(), err));
                    continue;
                }
            };

            let path = entry.path();
            let file_type = entry.file_type();
            if self.excludes.is_excluded(path, Some(&self.staging_root)) {
                if file_type.is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }

            let dest = self.staging_path(path);
            if file_type.is_dir() {
                self.ensure_dir(&dest)
                    .with_context(|| format!("failed to create {}", dest.display()))?;
                continue;
            }

            let metadata = match fs::symlink_metadata(path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    self.stats.add_failure();
                    reporter.warn(&format!("failed to stat {}: {}", path.display(), err));
                    continue;
                }
            };

            if let Err(err) = self.copy_one(path, &metadata, &dest, reporter) {
                self.stats.add_failure();
                reporter.warn(&format!("failed to copy {}: {:#}", path.display(), err));
            }
        }

        Ok(())
    }

    fn copy_one(
        &self,
        source: &Path,
        metadata: &fs::Metadata,
        dest: &Path,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(source)
                .with_context(|| format!("failed to read link {}", source.display()))?;
            if self.dry_run {
                reporter.info(&format!("would link {} -> {}", dest.display(), target.display()));
                self.stats.add_file();
                return Ok(());
            }
            if let Some(parent) = dest.parent() {
                self.ensure_dir(parent)?;
            }
            if dest.exists() || fs::symlink_metadata(dest).is_ok() {
                fs::remove_file(dest).ok();
            }
            symlink(&target, dest)
                .with_context(|| format!("failed to create symlink {}", dest.display()))?;
            self.stats.add_file();
            return Ok(());
        }

        if file_type.is_block_device()
            || file_type.is_char_device()
            || file_type.is_socket()
            || file_type.is_fifo()
        {
            reporter.debug(&format!("skipping special file {}", source.display()));
            return Ok(());
        }

        if self.dry_run {
            reporter.info(&format!("would copy {}", source.display()));
            self.stats.add_file();
            self.stats.add_bytes(metadata.len());
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            self.ensure_dir(parent)?;
        }

        let mut reader =
            File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
        let mut writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(STAGED_FILE_MODE)
            .open(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let written = io::copy(&mut reader, &mut writer)
            .with_context(|| format!("failed to copy {}", source.display()))?;

        self.stats.add_file();
        self.stats.add_bytes(written);
        Ok(())
    }

    /// Create a directory chain, counting the directories that did not
    /// exist before.
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            return Ok(());
        }

        if self.dry_run {
            let mut seen = self.dry_run_dirs.lock().unwrap();
            let mut probe = Some(dir);
            while let Some(p) = probe {
                if p.exists() || p.as_os_str().is_empty() || seen.contains(p) {
                    break;
                }
                seen.insert(p.to_path_buf());
                self.stats.add_directory();
                probe = p.parent();
            }
            return Ok(());
        }

        let mut missing = 0u64;
        let mut probe = Some(dir);
        while let Some(p) = probe {
            if p.exists() || p.as_os_str().is_empty() {
                break;
            }
            missing += 1;
            probe = p.parent();
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
        for _ in 0..missing {
            self.stats.add_directory();
        }
        Ok(())
    }

    /// Collect up to `limit` directory paths relative to `root`, at most
    /// `max_depth` levels deep, in traversal order.
    pub fn sample_directories(
        &self,
        root: &Path,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut sampled = Vec::new();
        if limit == 0 {
            return Ok(sampled);
        }

        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
        {
            self.cancel.checkpoint()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(root) {
                sampled.push(rel.to_string_lossy().replace('\\', "/"));
            }
            if sampled.len() >= limit {
                // Limit reached; stop walking instead of failing.
                break;
            }
        }
        Ok(sampled)
    }

    /// Collect up to `limit` file summaries under `root` whose basename
    /// or relative path matches any of `patterns`.
    pub fn sample_files(
        &self,
        root: &Path,
        patterns: &[String],
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<FileSummary>> {
        let compiled: Vec<glob::Pattern> = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).with_context(|| format!("invalid sample pattern {:?}", p))
            })
            .collect::<Result<_>>()?;

        let mut sampled = Vec::new();
        if limit == 0 {
            return Ok(sampled);
        }

        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
        {
            self.cancel.checkpoint()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            let name = entry.file_name().to_string_lossy();
            let hit = compiled
                .iter()
                .any(|p| p.matches(&name) || p.matches(&rel_str));
            if !hit {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let modified: DateTime<Utc> = metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            sampled.push(FileSummary {
                relative_path: rel_str,
                size: metadata.len(),
                modified,
            });
            if sampled.len() >= limit {
                break;
            }
        }
        Ok(sampled)
    }
}

#[cfg(test)]
mod tests {
    use pmxpack_types::NullReporter;
    use tempfile::tempdir;

    use super::*;

    fn walker(staging: &Path, patterns: &[&str]) -> Walker {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        Walker::new(
            staging.to_path_buf(),
            ExclusionSet::compile(&owned).expect("compile"),
            CancelToken::new(),
        )
    }

    #[test]
    fn copy_file_mirrors_source_path() {
        let src = tempdir().expect("tempdir");
        let staging = tempdir().expect("tempdir");
        let source = src.path().join("etc/hostname");
        fs::create_dir_all(source.parent().unwrap()).expect("mkdir");
        fs::write(&source, b"pve1\n").expect("write");

        let w = walker(staging.path(), &[]);
        w.copy_file(&source, &mut NullReporter).expect("copy");

        let dest = w.staging_path(&source);
        assert_eq!(fs::read(&dest).expect("read"), b"pve1\n");

        let stats = w.stats();
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.bytes_collected, 5);
        assert!(stats.directories_created > 0);
    }

    #[test]
    fn missing_source_is_silent() {
        let staging = tempdir().expect("tempdir");
        let w = walker(staging.path(), &[]);
        w.copy_file(Path::new("/does/not/exist"), &mut NullReporter)
            .expect("no-op");
        assert_eq!(w.stats(), CollectionTotals::default());
    }

    #[test]
    fn symlink_is_recreated_not_followed() {
        let src = tempdir().expect("tempdir");
        let staging = tempdir().expect("tempdir");
        let target = src.path().join("real.conf");
        fs::write(&target, b"data").expect("write");
        let link = src.path().join("alias.conf");
        symlink("real.conf", &link).expect("symlink");

        let w = walker(staging.path(), &[]);
        w.copy_file(&link, &mut NullReporter).expect("copy");

        let dest = w.staging_path(&link);
        let dest_target = fs::read_link(&dest).expect("read_link");
        assert_eq!(dest_target, Path::new("real.conf"));
    }

    #[test]
    fn copied_files_have_restrictive_mode() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempdir().expect("tempdir");
        let staging = tempdir().expect("tempdir");
        let source = src.path().join("secret.cfg");
        fs::write(&source, b"key").expect("write");

        let w = walker(staging.path(), &[]);
        w.copy_file(&source, &mut NullReporter).expect("copy");

        let mode = fs::metadata(w.staging_path(&source))
            .expect("stat")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, STAGED_FILE_MODE);
    }

    #[test]
    fn copy_tree_excludes_node_modules() {
        let src = tempdir().expect("tempdir");
        let staging = tempdir().expect("tempdir");
        for rel in [
            "pkg/node_modules/lodash/index.js",
            "pkg/src/main.js",
            "top.txt",
        ] {
            let path = src.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            fs::write(&path, b"x").expect("write");
        }

        let w = walker(staging.path(), &["**/node_modules/**"]);
        w.copy_tree(src.path(), &mut NullReporter).expect("copy");

        let mut staged = Vec::new();
        for entry in WalkDir::new(staging.path()).min_depth(1) {
            let entry = entry.expect("entry");
            staged.push(entry.path().to_string_lossy().into_owned());
        }
        assert!(!staged.iter().any(|p| p.contains("/node_modules/")));
        assert!(!staged.iter().any(|p| p.ends_with("/node_modules")));
        assert!(staged.iter().any(|p| p.ends_with("main.js")));
        assert!(staged.iter().any(|p| p.ends_with("top.txt")));
    }

    #[test]
    fn dry_run_advances_stats_without_writing() {
        let src = tempdir().expect("tempdir");
        let staging = tempdir().expect("tempdir");
        let source = src.path().join("etc/network/interfaces");
        fs::create_dir_all(source.parent().unwrap()).expect("mkdir");
        fs::write(&source, b"auto lo\n").expect("write");

        let w = walker(staging.path(), &[]).with_dry_run(true);
        w.copy_file(&source, &mut NullReporter).expect("dry copy");

        assert!(!w.staging_path(&source).exists());
        let stats = w.stats();
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.bytes_collected, 8);
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let src = tempdir().expect("tempdir");
        let staging = tempdir().expect("tempdir");
        fs::write(src.path().join("a"), b"x").expect("write");

        let cancel = CancelToken::new();
        cancel.cancel();
        let w = Walker::new(
            staging.path().to_path_buf(),
            ExclusionSet::default(),
            cancel,
        );
        assert!(w.copy_tree(src.path(), &mut NullReporter).is_err());
    }

    #[test]
    fn sample_directories_honours_depth_and_limit() {
        let root = tempdir().expect("tempdir");
        for rel in ["a/deep/deeper", "b", "c/sub"] {
            fs::create_dir_all(root.path().join(rel)).expect("mkdir");
        }

        let staging = tempdir().expect("tempdir");
        let w = walker(staging.path(), &[]);

        let dirs = w.sample_directories(root.path(), 2, 10).expect("sample");
        assert_eq!(dirs, vec!["a", "a/deep", "b", "c", "c/sub"]);

        let limited = w.sample_directories(root.path(), 2, 2).expect("sample");
        assert_eq!(limited, vec!["a", "a/deep"]);
    }

    #[test]
    fn sample_files_matches_basename_and_relative_path() {
        let root = tempdir().expect("tempdir");
        for rel in ["vm/100.conf", "vm/disk.raw", "notes.txt"] {
            let path = root.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            fs::write(&path, b"content").expect("write");
        }

        let staging = tempdir().expect("tempdir");
        let w = walker(staging.path(), &[]);

        let files = w
            .sample_files(root.path(), &["*.conf".to_string()], 3, 10)
            .expect("sample");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "vm/100.conf");
        assert_eq!(files[0].size, 7);
    }

    proptest::proptest! {
        #[test]
        fn stats_are_monotonic_across_copies(count in 1usize..8) {
            let src = tempdir().expect("tempdir");
            let staging = tempdir().expect("tempdir");
            let w = walker(staging.path(), &[]);

            let mut last = 0u64;
            for i in 0..count {
                let path = src.path().join(format!("file-{}", i));
                fs::write(&path, vec![b'x'; i + 1]).expect("write");
                w.copy_file(&path, &mut NullReporter).expect("copy");
                let snapshot = w.stats();
                proptest::prop_assert!(snapshot.bytes_collected >= last);
                last = snapshot.bytes_collected;
                proptest::prop_assert_eq!(snapshot.files_processed, (i + 1) as u64);
            }
        }
    }
}
