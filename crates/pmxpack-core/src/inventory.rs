//! Declarative collection inventories.
//!
//! Each host type is bound to a list of [`CollectOp`] entries executed in
//! order by the collector. The lists below are the site-independent
//! baseline; paths that do not exist on a given host are silently
//! skipped by the walker, so the inventories err on the side of listing
//! more than a minimal host carries.

use std::path::PathBuf;

use pmxpack_config::BackupConfig;
use pmxpack_types::HostType;

/// One collection operation with its criticality.
#[derive(Debug, Clone)]
pub enum CollectOp {
    /// Copy a single file or symlink into the staging tree.
    CopyFile { source: PathBuf, critical: bool },
    /// Copy a directory tree into the staging tree.
    CopyTree { source: PathBuf, critical: bool },
    /// Run a command, capturing output into a staging-relative file.
    CaptureCommand { command: String, output: PathBuf, critical: bool },
    /// Capture plus copies of the output at extra staging-relative paths.
    MirrorCommand {
        command: String,
        output: PathBuf,
        mirrors: Vec<PathBuf>,
        critical: bool,
    },
    /// Best-effort command; failures never stop the run.
    OptionalCommand { command: String, output: PathBuf },
    /// Command requiring credential environment variables; skipped with a
    /// warning when they are absent.
    AuthenticatedCommand {
        command: String,
        output: PathBuf,
        credentials: Vec<String>,
        critical: bool,
    },
}

impl CollectOp {
    pub fn is_critical(&self) -> bool {
        match self {
            CollectOp::CopyFile { critical, .. }
            | CollectOp::CopyTree { critical, .. }
            | CollectOp::CaptureCommand { critical, .. }
            | CollectOp::MirrorCommand { critical, .. }
            | CollectOp::AuthenticatedCommand { critical, .. } => *critical,
            CollectOp::OptionalCommand { .. } => false,
        }
    }

    /// Short human-readable label for logs.
    pub fn describe(&self) -> String {
        match self {
            CollectOp::CopyFile { source, .. } => format!("copy {}", source.display()),
            CollectOp::CopyTree { source, .. } => format!("copy tree {}", source.display()),
            CollectOp::CaptureCommand { command, .. }
            | CollectOp::MirrorCommand { command, .. }
            | CollectOp::OptionalCommand { command, .. }
            | CollectOp::AuthenticatedCommand { command, .. } => format!("run `{}`", command),
        }
    }
}

fn file(source: &str, critical: bool) -> CollectOp {
    CollectOp::CopyFile { source: PathBuf::from(source), critical }
}

fn tree(source: &str, critical: bool) -> CollectOp {
    CollectOp::CopyTree { source: PathBuf::from(source), critical }
}

fn capture(command: &str, output: &str, critical: bool) -> CollectOp {
    CollectOp::CaptureCommand {
        command: command.to_string(),
        output: PathBuf::from(output),
        critical,
    }
}

fn optional(command: &str, output: &str) -> CollectOp {
    CollectOp::OptionalCommand { command: command.to_string(), output: PathBuf::from(output) }
}

/// Baseline inventory shared by every host type.
pub fn common_inventory(config: &BackupConfig) -> Vec<CollectOp> {
    let mut ops = Vec::new();

    if config.collect_system {
        ops.extend([
            file("/etc/hostname", false),
            file("/etc/hosts", false),
            file("/etc/fstab", false),
            file("/etc/resolv.conf", false),
            file("/etc/timezone", false),
            file("/etc/crontab", false),
            tree("/etc/cron.d", false),
            tree("/etc/systemd/system", false),
            capture("uname -a", "reports/system/uname.txt", false),
            optional("df -h", "reports/system/df.txt"),
            optional("lsblk -o NAME,SIZE,TYPE,MOUNTPOINT", "reports/system/lsblk.txt"),
            optional("systemctl list-units --failed --no-pager", "reports/system/failed-units.txt"),
        ]);
    }

    if config.collect_network {
        ops.extend([
            file("/etc/network/interfaces", false),
            tree("/etc/network/interfaces.d", false),
            capture("ip -details addr show", "reports/network/ip-addr.txt", false),
            optional("ip route show", "reports/network/routes.txt"),
        ]);
    }

    if config.collect_packages {
        ops.extend([
            tree("/etc/apt/sources.list.d", false),
            file("/etc/apt/sources.list", false),
            capture("dpkg --get-selections", "reports/packages/selections.txt", false),
            optional("apt-mark showhold", "reports/packages/holds.txt"),
        ]);
    }

    ops
}

/// Inventory specific to a Proxmox VE node.
pub fn pve_inventory(config: &BackupConfig) -> Vec<CollectOp> {
    let mut ops = Vec::new();
    if !config.collect_proxmox {
        return ops;
    }

    ops.extend([
        // The clustered config filesystem is the heart of a PVE backup.
        tree("/etc/pve", true),
        file("/etc/vzdump.conf", false),
        file("/etc/modules", false),
        tree("/etc/modprobe.d", false),
        capture("pveversion --verbose", "reports/pve/version.txt", true),
        CollectOp::MirrorCommand {
            command: "pvesh get /cluster/resources --output-format json".to_string(),
            output: PathBuf::from("reports/pve/cluster-resources.json"),
            mirrors: vec![PathBuf::from("reports/cluster-resources.json")],
            critical: false,
        },
        optional("qm list", "reports/pve/qm-list.txt"),
        optional("pct list", "reports/pve/pct-list.txt"),
        optional("pvesm status", "reports/pve/storage-status.txt"),
        optional("ha-manager status", "reports/pve/ha-status.txt"),
    ]);
    ops
}

/// Inventory specific to a Proxmox Backup Server.
pub fn pbs_inventory(config: &BackupConfig) -> Vec<CollectOp> {
    let mut ops = Vec::new();
    if !config.collect_proxmox {
        return ops;
    }

    ops.extend([
        tree("/etc/proxmox-backup", true),
        capture(
            "proxmox-backup-manager versions --verbose",
            "reports/pbs/versions.txt",
            true,
        ),
        capture(
            "proxmox-backup-manager datastore list --output-format json",
            "reports/pbs/datastores.json",
            false,
        ),
        optional(
            "proxmox-backup-manager cert info",
            "reports/pbs/cert-info.txt",
        ),
        CollectOp::AuthenticatedCommand {
            command: "proxmox-backup-client status --output-format json".to_string(),
            output: PathBuf::from("reports/pbs/client-status.json"),
            credentials: vec!["PBS_PASSWORD".to_string()],
            critical: false,
        },
    ]);
    ops
}

/// The full ordered inventory for a host type.
pub fn inventory_for(host_type: HostType, config: &BackupConfig) -> Vec<CollectOp> {
    let mut ops = common_inventory(config);
    match host_type {
        HostType::Pve => ops.extend(pve_inventory(config)),
        HostType::Pbs => ops.extend(pbs_inventory(config)),
        HostType::Unknown => {}
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pve_inventory_includes_cluster_config() {
        let config = BackupConfig::default();
        let ops = inventory_for(HostType::Pve, &config);
        assert!(ops.iter().any(|op| matches!(
            op,
            CollectOp::CopyTree { source, critical: true } if source == &PathBuf::from("/etc/pve")
        )));
    }

    #[test]
    fn pbs_inventory_includes_datastore_listing() {
        let config = BackupConfig::default();
        let ops = inventory_for(HostType::Pbs, &config);
        assert!(
            ops.iter()
                .any(|op| op.describe().contains("datastore list"))
        );
    }

    #[test]
    fn category_flags_prune_sections() {
        let mut config = BackupConfig::default();
        config.collect_packages = false;
        let ops = inventory_for(HostType::Pve, &config);
        assert!(!ops.iter().any(|op| op.describe().contains("dpkg")));

        config.collect_proxmox = false;
        let ops = inventory_for(HostType::Pve, &config);
        assert!(!ops.iter().any(|op| op.describe().contains("pveversion")));
    }

    #[test]
    fn optional_ops_are_never_critical() {
        let config = BackupConfig::default();
        for op in inventory_for(HostType::Pve, &config) {
            if let CollectOp::OptionalCommand { .. } = op {
                assert!(!op.is_critical());
            }
        }
    }

    #[test]
    fn unknown_host_gets_only_the_baseline() {
        let config = BackupConfig::default();
        let ops = inventory_for(HostType::Unknown, &config);
        assert!(!ops.iter().any(|op| op.describe().contains("/etc/pve")));
        assert!(!ops.is_empty());
    }
}
