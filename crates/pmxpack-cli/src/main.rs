use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pmxpack_config::BackupConfig;
use pmxpack_core::engine::{Engine, RunOptions};
use pmxpack_core::preflight;
use pmxpack_storage::StorageTarget;
use pmxpack_types::{CancelToken, ExitCode, HostType, Reporter};

mod progress;

use progress::ConsoleReporter;

const DEFAULT_CONFIG: &str = "/etc/pmxpack/pmxpack.conf";

#[derive(Parser, Debug)]
#[command(name = "pmxpack", version)]
#[command(about = "Configuration backup agent for Proxmox VE and Proxmox Backup Server hosts")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Force the host type instead of auto-detecting (pve or pbs)
    #[arg(long, value_parser = parse_host_type)]
    host_type: Option<HostType>,

    /// Log every action without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Show low-level detail while running
    #[arg(short, long)]
    verbose: bool,

    /// Only print warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full backup pipeline (the default)
    Run,
    /// Run the pre-flight checks and print their results
    Check,
    /// List backups on every configured storage target
    List,
}

fn parse_host_type(value: &str) -> Result<HostType, String> {
    match value.parse::<HostType>() {
        Ok(HostType::Unknown) => Err("host type must be pve or pbs".to_string()),
        Ok(host_type) => Ok(host_type),
        Err(err) => Err(err.to_string()),
    }
}

fn load_config(cli: &Cli, reporter: &mut dyn Reporter) -> Result<BackupConfig> {
    if !cli.config.exists() {
        if cli.config == PathBuf::from(DEFAULT_CONFIG) {
            reporter.warn(&format!(
                "no config at {}, using built-in defaults",
                cli.config.display()
            ));
            return Ok(BackupConfig::default());
        }
        anyhow::bail!("config file not found: {}", cli.config.display());
    }

    let parsed = BackupConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    for key in &parsed.unknown_keys {
        reporter.warn(&format!("ignoring unknown config key: {}", key));
    }
    Ok(parsed.config)
}

fn main() {
    let cli = Cli::parse();
    let mut reporter = ConsoleReporter::new(cli.quiet, cli.verbose);

    let config = match load_config(&cli, &mut reporter) {
        Ok(config) => config,
        Err(err) => {
            reporter.error(&format!("{:#}", err));
            exit(ExitCode::ConfigError.code());
        }
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            eprintln!("signal received, cancelling");
            cancel.cancel();
        }) {
            reporter.warn(&format!("failed to install signal handler: {}", err));
        }
    }

    let code = match cli.cmd.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => cmd_run(&cli, config, cancel, &mut reporter),
        Commands::Check => cmd_check(&cli, config, cancel, &mut reporter),
        Commands::List => cmd_list(config, cancel, &mut reporter),
    };
    exit(code);
}

fn cmd_run(
    cli: &Cli,
    config: BackupConfig,
    cancel: CancelToken,
    reporter: &mut ConsoleReporter,
) -> i32 {
    let engine = Engine::new(config, cancel);
    let opts = RunOptions { dry_run: cli.dry_run, host_type_override: cli.host_type };

    match engine.run(&opts, reporter) {
        Ok(stats) => {
            let summary = if cli.dry_run {
                format!(
                    "dry run complete: {} files, {} bytes would be collected",
                    stats.collection.files_processed, stats.collection.bytes_collected
                )
            } else {
                format!(
                    "backup complete: {} ({} bytes) in {}s{}",
                    stats
                        .archive_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    stats.archive_size,
                    stats.duration_secs,
                    if stats.has_warnings { ", with warnings" } else { "" }
                )
            };
            reporter.finish(&summary);
            ExitCode::Ok.code()
        }
        Err(err) => {
            reporter.finish("backup failed");
            reporter.error(&err.to_string());
            err.exit_code().code()
        }
    }
}

fn cmd_check(
    cli: &Cli,
    config: BackupConfig,
    _cancel: CancelToken,
    _reporter: &mut ConsoleReporter,
) -> i32 {
    let host_type = cli
        .host_type
        .or(config.host_type)
        .unwrap_or_else(preflight::detect_host_type);

    let checks = preflight::run_all_checks(&config, host_type, preflight::DEFAULT_ESTIMATE);
    let mut failed_critical = false;
    for check in &checks {
        let status = if check.passed { "ok" } else { "FAILED" };
        println!("{:<14} {:<8} {}", check.name, status, check.message);
        if !check.passed && check.critical {
            failed_critical = true;
        }
    }

    if failed_critical {
        ExitCode::PreflightError.code()
    } else {
        ExitCode::Ok.code()
    }
}

fn cmd_list(config: BackupConfig, cancel: CancelToken, reporter: &mut ConsoleReporter) -> i32 {
    let engine = Engine::new(config, cancel);
    let mut had_errors = false;

    for target in engine.targets() {
        if !target.is_enabled() {
            continue;
        }
        match target.list() {
            Ok(backups) => {
                println!("{} ({}):", target.name(), target.location());
                if backups.is_empty() {
                    println!("  (no backups)");
                }
                for backup in backups {
                    println!(
                        "  {}  {:>12}  {}",
                        backup.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        backup.size,
                        backup.filename
                    );
                }
            }
            Err(err) => {
                reporter.warn(&format!("listing {} failed: {:#}", target.name(), err));
                had_errors = true;
            }
        }
    }

    if had_errors {
        ExitCode::StorageError.code()
    } else {
        ExitCode::Ok.code()
    }
}
