//! # pmxpack-core
//!
//! The backup pipeline engine: pre-flight checks, host inventories, the
//! collector, the orchestrator state machine, and stats reporting.
//!
//! The crate wires the leaf crates together: [`pmxpack_walker`] for
//! file collection, [`pmxpack_process`] for command capture,
//! [`pmxpack_archive`] for packaging, [`pmxpack_digest`] for
//! verification, [`pmxpack_storage`] for distribution and retention, and
//! [`pmxpack_notify`] for outcome notifications.

pub mod collector;
pub mod engine;
pub mod inventory;
pub mod preflight;
pub mod staging;
pub mod stats;

pub use collector::{Collector, CollectorOutcome, discover_datastores};
pub use engine::{Engine, RunOptions};
pub use inventory::{CollectOp, inventory_for};
pub use preflight::{CheckResult, detect_host_type, run_all_checks};
pub use staging::StagingDir;
