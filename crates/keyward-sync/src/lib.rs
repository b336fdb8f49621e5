//! Gated, idempotent pull-and-apply of a generated configuration script.
//! The engine waits for the convergence engine to be idle, refreshes the
//! configuration source, and runs the script only when its content changed.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use keyward_core::run_state::RunState;

pub mod checksum;
pub mod command;
pub mod engine;

pub use engine::{SyncEngine, SyncError, SyncOptions, SyncOutcome, SyncReport, SyncTarget};

/// Reads the convergence engine's current run state.
#[async_trait]
pub trait RunStateSource: Send + Sync {
    async fn current_state(&self) -> Result<RunState>;
}

/// Brings the local configuration source up to date with its upstream.
#[async_trait]
pub trait SourceRefresher: Send + Sync {
    async fn refresh(&self) -> Result<()>;
}

/// Executes the configuration script as an opaque external program.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, script: &Path) -> Result<()>;
}
