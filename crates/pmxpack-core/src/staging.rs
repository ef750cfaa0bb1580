//! Staging directory lifecycle.
//!
//! The staging tree lives under the system temp root with a unique
//! suffix and is owned exclusively by the pipeline. The guard removes it
//! on drop, which covers success, failure, cancellation, and panics.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker file written at the staging root.
pub const MARKER_FILE: &str = ".pmxpack-staging.json";

/// Contents of the staging marker.
#[derive(Debug, Serialize, Deserialize)]
pub struct StagingMarker {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// RAII guard over the staging directory.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Create a fresh staging directory under `base` with a unique
    /// pid+timestamp suffix and write the ownership marker.
    pub fn create(base: &Path) -> Result<Self> {
        let suffix = format!(
            "pmxpack-{}-{}",
            std::process::id(),
            Utc::now().format("%Y%m%d%H%M%S%f")
        );
        let path = base.join(suffix);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create staging dir {}", path.display()))?;

        let marker = StagingMarker { pid: std::process::id(), created_at: Utc::now() };
        let json = serde_json::to_string_pretty(&marker).context("failed to serialize marker")?;
        fs::write(path.join(MARKER_FILE), json)
            .with_context(|| format!("failed to write marker in {}", path.display()))?;

        Ok(Self { path })
    }

    /// Create under the system temp root.
    pub fn create_in_temp() -> Result<Self> {
        Self::create(&std::env::temp_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staging tree now. Idempotent; also runs on drop.
    pub fn cleanup(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path)
                .with_context(|| format!("failed to remove staging {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
