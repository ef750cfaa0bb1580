//! Configuration file support for pmxpack.
//!
//! The configuration format is a flat `key=value` text file with `#`
//! comments and `${VAR}` environment expansion, inherited from the
//! product's shell-script heritage. Selected fields also accept their
//! legacy upper-case key names so existing site configs keep working.
//!
//! ```text
//! # /etc/pmxpack/pmxpack.conf
//! backup_dir = /opt/pmxpack/backup
//! compression_type = zstd
//! compression_level = 6
//! max_backups = 14
//! exclude_patterns = **/node_modules/**, *.tmp
//! cloud_enabled = true
//! cloud_remote = ${PMX_CLOUD_REMOTE}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use pmxpack_types::{CompressionType, HostType, RetentionSettings};

/// Default safety factor applied to disk-space estimates.
pub const DEFAULT_SAFETY_FACTOR: f64 = 1.5;

/// Typed configuration for a backup run.
#[derive(Debug, Clone, Serialize)]
pub struct BackupConfig {
    /// Primary backup directory (critical target)
    pub backup_dir: PathBuf,
    /// Directory for stats reports and rotated logs
    pub log_dir: PathBuf,
    /// Directory holding the lock file
    pub state_dir: PathBuf,
    /// Host type override; `None` means auto-detect
    pub host_type: Option<HostType>,

    pub compression_type: CompressionType,
    pub compression_level: u32,
    /// 0 means auto (number of cores)
    pub compression_threads: u32,

    pub retention: RetentionSettings,

    /// Exclusion globs applied during collection
    pub exclude_patterns: Vec<String>,

    /// Capture category toggles
    pub collect_system: bool,
    pub collect_network: bool,
    pub collect_packages: bool,
    pub collect_proxmox: bool,
    pub collect_datastores: bool,

    /// Free-space safety factor for the disk estimate
    pub safety_factor: f64,
    /// Deadline for collection subprocesses
    #[serde(with = "humantime_serde_secs")]
    pub command_timeout: Duration,
    /// Lock files older than this are treated as stale
    #[serde(with = "humantime_serde_secs")]
    pub lock_stale_after: Duration,

    /// Fan-out across datastores during sampling
    pub datastore_concurrency: u32,
    /// Fan-out within a single datastore
    pub sampler_concurrency: u32,

    pub secondary_enabled: bool,
    pub secondary_dir: Option<PathBuf>,
    pub secondary_critical: bool,

    pub cloud_enabled: bool,
    /// Remote spec for the sync tool, e.g. `remote:bucket/pmxpack`
    pub cloud_remote: Option<String>,
    /// Sync tool binary
    pub cloud_tool: String,
    #[serde(with = "humantime_serde_secs")]
    pub cloud_connection_timeout: Duration,
    #[serde(with = "humantime_serde_secs")]
    pub cloud_operation_timeout: Duration,
    pub cloud_upload_retries: u32,
    pub cloud_delete_batch_size: u32,

    pub webhook_url: Option<String>,
    pub webhook_type: String,

    /// Stats reports kept in the log directory
    pub report_keep: u32,
}

mod humantime_serde_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/opt/pmxpack/backup"),
            log_dir: PathBuf::from("/var/log/pmxpack"),
            state_dir: PathBuf::from("/var/run/pmxpack"),
            host_type: None,
            compression_type: CompressionType::Zstd,
            compression_level: 6,
            compression_threads: 0,
            retention: RetentionSettings::default(),
            exclude_patterns: Vec::new(),
            collect_system: true,
            collect_network: true,
            collect_packages: true,
            collect_proxmox: true,
            collect_datastores: true,
            safety_factor: DEFAULT_SAFETY_FACTOR,
            command_timeout: Duration::from_secs(60),
            lock_stale_after: Duration::from_secs(3600),
            datastore_concurrency: 3,
            sampler_concurrency: 4,
            secondary_enabled: false,
            secondary_dir: None,
            secondary_critical: false,
            cloud_enabled: false,
            cloud_remote: None,
            cloud_tool: "rclone".to_string(),
            cloud_connection_timeout: Duration::from_secs(30),
            cloud_operation_timeout: Duration::from_secs(900),
            cloud_upload_retries: 3,
            cloud_delete_batch_size: 20,
            webhook_url: None,
            webhook_type: "generic".to_string(),
            report_keep: 10,
        }
    }
}

/// Result of parsing a config file: the typed config plus any keys the
/// parser did not recognize (reported as warnings, never fatal).
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub config: BackupConfig,
    pub unknown_keys: Vec<String>,
}

impl BackupConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<ParsedConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let parsed = Self::parse(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        parsed.config.validate()?;
        Ok(parsed)
    }

    /// Parse configuration text without touching the filesystem.
    pub fn parse(content: &str) -> Result<ParsedConfig> {
        let mut raw: BTreeMap<String, String> = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("line {}: expected key=value", lineno + 1))?;
            let key = canonical_key(key.trim());
            let value = expand_vars(unquote(value.trim()))
                .with_context(|| format!("line {}", lineno + 1))?;
            raw.insert(key, value);
        }

        let mut config = BackupConfig::default();
        let mut unknown_keys = Vec::new();

        // Retention is assembled after the scan so the policy key and the
        // count keys can appear in any order.
        let mut retention_policy: Option<String> = None;
        let mut max_backups: Option<u32> = None;
        let mut gfs = (0u32, 0u32, 0u32, 0u32);

        for (key, value) in &raw {
            match key.as_str() {
                "backup_dir" => config.backup_dir = PathBuf::from(value),
                "log_dir" => config.log_dir = PathBuf::from(value),
                "state_dir" => config.state_dir = PathBuf::from(value),
                "host_type" => config.host_type = Some(value.parse()?),
                "compression_type" => config.compression_type = value.parse()?,
                "compression_level" => config.compression_level = parse_u32(key, value)?,
                "compression_threads" => config.compression_threads = parse_u32(key, value)?,
                "retention_policy" => retention_policy = Some(value.to_lowercase()),
                "max_backups" => max_backups = Some(parse_u32(key, value)?),
                "gfs_daily" => gfs.0 = parse_u32(key, value)?,
                "gfs_weekly" => gfs.1 = parse_u32(key, value)?,
                "gfs_monthly" => gfs.2 = parse_u32(key, value)?,
                "gfs_yearly" => gfs.3 = parse_u32(key, value)?,
                "exclude_patterns" => {
                    config.exclude_patterns = value
                        .split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect();
                }
                "collect_system" => config.collect_system = parse_bool(key, value)?,
                "collect_network" => config.collect_network = parse_bool(key, value)?,
                "collect_packages" => config.collect_packages = parse_bool(key, value)?,
                "collect_proxmox" => config.collect_proxmox = parse_bool(key, value)?,
                "collect_datastores" => config.collect_datastores = parse_bool(key, value)?,
                "safety_factor" => {
                    config.safety_factor = value
                        .parse::<f64>()
                        .with_context(|| format!("{} must be a number, got {:?}", key, value))?;
                }
                "command_timeout" => config.command_timeout = parse_duration(key, value)?,
                "lock_stale_after" => config.lock_stale_after = parse_duration(key, value)?,
                "datastore_concurrency" => config.datastore_concurrency = parse_u32(key, value)?,
                "sampler_concurrency" => config.sampler_concurrency = parse_u32(key, value)?,
                "secondary_enabled" => config.secondary_enabled = parse_bool(key, value)?,
                "secondary_dir" => config.secondary_dir = Some(PathBuf::from(value)),
                "secondary_critical" => config.secondary_critical = parse_bool(key, value)?,
                "cloud_enabled" => config.cloud_enabled = parse_bool(key, value)?,
                "cloud_remote" => config.cloud_remote = Some(value.clone()),
                "cloud_tool" => config.cloud_tool = value.clone(),
                "cloud_connection_timeout" => {
                    config.cloud_connection_timeout = parse_duration(key, value)?;
                }
                "cloud_operation_timeout" => {
                    config.cloud_operation_timeout = parse_duration(key, value)?;
                }
                "cloud_upload_retries" => config.cloud_upload_retries = parse_u32(key, value)?,
                "cloud_delete_batch_size" => {
                    config.cloud_delete_batch_size = parse_u32(key, value)?;
                }
                "webhook_url" => config.webhook_url = Some(value.clone()),
                "webhook_type" => config.webhook_type = value.to_lowercase(),
                "report_keep" => config.report_keep = parse_u32(key, value)?,
                _ => unknown_keys.push(key.clone()),
            }
        }

        config.retention = match retention_policy.as_deref() {
            None | Some("simple") => RetentionSettings::Simple {
                max_backups: max_backups.unwrap_or(10),
            },
            Some("gfs") => {
                if max_backups.is_some() {
                    bail!(
                        "max_backups cannot be combined with retention_policy=gfs; \
                         set the gfs_* counts instead"
                    );
                }
                RetentionSettings::Gfs {
                    daily: gfs.0,
                    weekly: gfs.1,
                    monthly: gfs.2,
                    yearly: gfs.3,
                }
            }
            Some(other) => bail!("unknown retention_policy: {}", other),
        };

        Ok(ParsedConfig { config, unknown_keys })
    }

    /// Validate the configuration, normalizing non-positive knobs.
    pub fn validate(&self) -> Result<()> {
        if self.backup_dir.as_os_str().is_empty() {
            bail!("backup_dir cannot be empty");
        }
        if self.safety_factor < 1.0 {
            bail!("safety_factor must be at least 1.0");
        }
        if !(self.collect_system
            || self.collect_network
            || self.collect_packages
            || self.collect_proxmox
            || self.collect_datastores)
        {
            bail!("at least one collect_* category must be enabled");
        }
        if let RetentionSettings::Gfs { daily, weekly, monthly, yearly } = self.retention
            && daily == 0
            && weekly == 0
            && monthly == 0
            && yearly == 0
        {
            bail!("retention_policy=gfs requires at least one non-zero gfs_* count");
        }
        if self.secondary_enabled && self.secondary_dir.is_none() {
            bail!("secondary_enabled requires secondary_dir");
        }
        if self.cloud_enabled && self.cloud_remote.is_none() {
            bail!("cloud_enabled requires cloud_remote");
        }
        if self.cloud_enabled && self.cloud_upload_retries == 0 {
            bail!("cloud_upload_retries must be greater than 0");
        }
        match self.webhook_type.as_str() {
            "generic" | "slack" | "discord" => {}
            other => bail!("unknown webhook_type: {}", other),
        }
        Ok(())
    }

    /// Concurrency knobs with non-positive values replaced by the minima.
    pub fn effective_datastore_concurrency(&self) -> usize {
        self.datastore_concurrency.max(1) as usize
    }

    pub fn effective_sampler_concurrency(&self) -> usize {
        self.sampler_concurrency.max(1) as usize
    }
}

/// Map legacy upper-case key names onto their canonical form.
fn canonical_key(key: &str) -> String {
    match key {
        "BACKUP_PATH" => "backup_dir".to_string(),
        "LOG_PATH" => "log_dir".to_string(),
        "COMPRESSION" | "COMPRESSION_TYPE" => "compression_type".to_string(),
        "COMPRESSION_LEVEL" => "compression_level".to_string(),
        "MAX_BACKUPS" | "MAX_LOCAL_BACKUPS" => "max_backups".to_string(),
        "BACKUP_EXCLUDES" | "EXCLUDE_PATTERNS" => "exclude_patterns".to_string(),
        "RCLONE_REMOTE" | "CLOUD_REMOTE" => "cloud_remote".to_string(),
        "SECONDARY_PATH" => "secondary_dir".to_string(),
        other => other.to_lowercase(),
    }
}

/// Strip one layer of matching single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Expand `${VAR}` references from the process environment.
///
/// Referencing an unset variable is an error rather than an empty
/// expansion, so a missing credential cannot silently redirect a path.
fn expand_vars(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .with_context(|| format!("unterminated ${{ in {:?}", value))?;
        let name = &after[..end];
        let expanded = std::env::var(name)
            .with_context(|| format!("undefined variable ${{{}}} in {:?}", name, value))?;
        out.push_str(&expanded);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => bail!("{} must be a boolean, got {:?}", key, value),
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("{} must be a duration like 30s or 15m, got {:?}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BackupConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn parses_basic_file() {
        let parsed = BackupConfig::parse(
            "# site config\n\
             backup_dir = /srv/backup\n\
             compression_type = xz\n\
             compression_level = 9\n\
             max_backups = 5\n\
             exclude_patterns = **/node_modules/**, *.tmp\n",
        )
        .expect("parse");
        let config = parsed.config;
        assert_eq!(config.backup_dir, PathBuf::from("/srv/backup"));
        assert_eq!(config.compression_type, CompressionType::Xz);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.retention, RetentionSettings::Simple { max_backups: 5 });
        assert_eq!(config.exclude_patterns, vec!["**/node_modules/**", "*.tmp"]);
        assert!(parsed.unknown_keys.is_empty());
    }

    #[test]
    fn legacy_keys_are_accepted() {
        let parsed = BackupConfig::parse(
            "BACKUP_PATH = /mnt/backup\n\
             COMPRESSION = gzip\n\
             MAX_LOCAL_BACKUPS = 7\n",
        )
        .expect("parse");
        assert_eq!(parsed.config.backup_dir, PathBuf::from("/mnt/backup"));
        assert_eq!(parsed.config.compression_type, CompressionType::Gzip);
        assert_eq!(parsed.config.retention, RetentionSettings::Simple { max_backups: 7 });
    }

    #[test]
    fn unknown_keys_are_collected_not_fatal() {
        let parsed = BackupConfig::parse("frobnicate = yes\n").expect("parse");
        assert_eq!(parsed.unknown_keys, vec!["frobnicate"]);
    }

    #[test]
    fn env_expansion() {
        temp_env::with_var("PMX_TEST_REMOTE", Some("s3:bucket/pmx"), || {
            let parsed = BackupConfig::parse("cloud_remote = ${PMX_TEST_REMOTE}\n").expect("parse");
            assert_eq!(parsed.config.cloud_remote.as_deref(), Some("s3:bucket/pmx"));
        });
    }

    #[test]
    fn env_expansion_rejects_undefined() {
        temp_env::with_var_unset("PMX_TEST_UNSET_XYZ", || {
            let err = BackupConfig::parse("cloud_remote = ${PMX_TEST_UNSET_XYZ}\n").unwrap_err();
            assert!(err.to_string().contains("line 1"));
        });
    }

    #[test]
    fn quoted_values_are_unquoted() {
        let parsed = BackupConfig::parse("backup_dir = \"/srv/with space\"\n").expect("parse");
        assert_eq!(parsed.config.backup_dir, PathBuf::from("/srv/with space"));
    }

    #[test]
    fn gfs_retention_parses() {
        let parsed = BackupConfig::parse(
            "retention_policy = gfs\n\
             gfs_daily = 7\n\
             gfs_weekly = 4\n\
             gfs_monthly = 6\n\
             gfs_yearly = 2\n",
        )
        .expect("parse");
        assert_eq!(
            parsed.config.retention,
            RetentionSettings::Gfs { daily: 7, weekly: 4, monthly: 6, yearly: 2 }
        );
    }

    #[test]
    fn gfs_with_max_backups_is_refused() {
        let err = BackupConfig::parse(
            "retention_policy = gfs\n\
             gfs_daily = 7\n\
             max_backups = 5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be combined"));
    }

    #[test]
    fn gfs_all_zero_is_refused() {
        let parsed = BackupConfig::parse("retention_policy = gfs\n").expect("parse");
        assert!(parsed.config.validate().is_err());
    }

    #[test]
    fn all_categories_disabled_is_refused() {
        let mut config = BackupConfig::default();
        config.collect_system = false;
        config.collect_network = false;
        config.collect_packages = false;
        config.collect_proxmox = false;
        config.collect_datastores = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn secondary_requires_dir() {
        let mut config = BackupConfig::default();
        config.secondary_enabled = true;
        assert!(config.validate().is_err());
        config.secondary_dir = Some(PathBuf::from("/mnt/mirror"));
        config.validate().expect("valid with dir");
    }

    #[test]
    fn concurrency_minima() {
        let mut config = BackupConfig::default();
        config.datastore_concurrency = 0;
        config.sampler_concurrency = 0;
        assert_eq!(config.effective_datastore_concurrency(), 1);
        assert_eq!(config.effective_sampler_concurrency(), 1);
    }

    #[test]
    fn duration_keys_accept_humantime() {
        let parsed = BackupConfig::parse("cloud_operation_timeout = 15m\n").expect("parse");
        assert_eq!(parsed.config.cloud_operation_timeout, Duration::from_secs(900));
    }
}
