use std::{path::PathBuf, sync::Arc, time::Duration};

use color_eyre::{eyre::eyre, Result};
use keyward_core::certificate::CertificateStore;
use keyward_storage::settings_store::SettingsStore;
use keyward_sync::{
    command::{CommandRunStateSource, CommandScriptRunner, GitRefresher},
    engine::DEFAULT_POLL_INTERVAL,
    SyncEngine, SyncOptions, SyncOutcome, SyncTarget,
};
use tracing::info;

use crate::config::SyncConfig;

/// Setting names consulted when the config file leaves a sync path unset.
pub const INSTALL_PATH_KEY: &str = "InstallPath";
pub const REPOSITORY_PATH_KEY: &str = "RepositoryPath";
pub const CONFIG_SCRIPT_KEY: &str = "ConfigScript";

/// Run one configuration sync with collaborators built from config.
pub async fn run<S: CertificateStore>(
    cfg: &SyncConfig,
    store: &SettingsStore<S>,
    force: bool,
) -> Result<()> {
    let target = resolve_target(cfg, store)?;
    let state_command = cfg
        .state_command
        .as_deref()
        .ok_or_else(|| eyre!("`sync.state_command` must be configured"))?;
    let state = CommandRunStateSource::from_command_line(state_command)
        .map_err(|e| eyre!(e.to_string()))?;
    let runner = match &cfg.interpreter {
        Some(interpreter) => {
            CommandScriptRunner::with_interpreter(interpreter, cfg.interpreter_args.clone())
        }
        None => CommandScriptRunner::direct(),
    };
    let refresher = GitRefresher::new(target.repository_path.clone());

    info!(
        script = %target.script_path().display(),
        record = %target.hash_record_path().display(),
        "sync invoked (force={force})"
    );
    let engine = SyncEngine::new(
        target,
        options(cfg, force),
        Arc::new(state),
        Arc::new(refresher),
        Arc::new(runner),
    );
    let report = engine.run().await?;
    match report.outcome {
        SyncOutcome::Applied => println!(
            "Configuration applied ({}).",
            report.hash.as_deref().unwrap_or_default()
        ),
        SyncOutcome::Skipped => println!("Configuration unchanged; nothing applied."),
    }
    Ok(())
}

fn options(cfg: &SyncConfig, force: bool) -> SyncOptions {
    SyncOptions {
        poll_interval: cfg
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL),
        max_wait: cfg.max_wait_secs.map(Duration::from_secs),
        force,
    }
}

/// Fill sync paths from config, falling back to values in the settings store.
pub fn resolve_target<S: CertificateStore>(
    cfg: &SyncConfig,
    store: &SettingsStore<S>,
) -> Result<SyncTarget> {
    let mut missing = Vec::new();
    if cfg.install_path.is_none() {
        missing.push(INSTALL_PATH_KEY);
    }
    if cfg.repository_path.is_none() {
        missing.push(REPOSITORY_PATH_KEY);
    }
    if cfg.script_name.is_none() {
        missing.push(CONFIG_SCRIPT_KEY);
    }

    let stored = if missing.is_empty() {
        Default::default()
    } else {
        store.get_values(&missing)?
    };
    let lookup = |key: &str| -> Result<String> {
        stored
            .get(key)
            .and_then(|v| v.as_ref())
            .map(|v| v.as_str().to_string())
            .ok_or_else(|| eyre!("`{key}` is neither configured nor stored in settings"))
    };

    let install_path = match &cfg.install_path {
        Some(path) => path.clone(),
        None => PathBuf::from(lookup(INSTALL_PATH_KEY)?),
    };
    let repository_path = match &cfg.repository_path {
        Some(path) => path.clone(),
        None => PathBuf::from(lookup(REPOSITORY_PATH_KEY)?),
    };
    let script_name = match &cfg.script_name {
        Some(name) => name.clone(),
        None => lookup(CONFIG_SCRIPT_KEY)?,
    };
    Ok(SyncTarget::new(install_path, repository_path, script_name)?)
}
