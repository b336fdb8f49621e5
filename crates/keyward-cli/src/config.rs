use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the machine-wide data directory.
pub const HOME_ENV: &str = "KEYWARD_HOME";

/// Machine-level configuration loaded from `~/.config/keyward/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the encrypted settings file.
    pub settings_path: Option<PathBuf>,
    /// Directory holding certificate files.
    pub certificate_dir: Option<PathBuf>,
    /// Default certificate (subject or thumbprint) used by `protect`.
    pub certificate: Option<String>,
    /// Configuration sync settings.
    pub sync: Option<SyncConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncConfig {
    /// Where the hash record is kept. Falls back to the `InstallPath` setting.
    pub install_path: Option<PathBuf>,
    /// Local clone of the configuration source. Falls back to `RepositoryPath`.
    pub repository_path: Option<PathBuf>,
    /// Script file inside the repository. Falls back to `ConfigScript`.
    pub script_name: Option<String>,
    pub poll_interval_secs: Option<u64>,
    /// Give up waiting for the convergence engine after this long; unset waits forever.
    pub max_wait_secs: Option<u64>,
    /// Command printing the convergence engine's run state.
    pub state_command: Option<String>,
    pub interpreter: Option<String>,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("keyward").join("config.toml"))
}

/// Data directory: `$KEYWARD_HOME` when set, else the platform data dir.
pub fn data_home(env_override: Option<OsString>) -> Result<PathBuf> {
    if let Some(home) = env_override.filter(|h| !h.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("keyward"))
}

/// Paths every component is constructed with, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub settings_path: PathBuf,
    pub certificate_dir: PathBuf,
}

impl Config {
    pub fn resolve_paths(&self, home: &Path) -> ResolvedPaths {
        ResolvedPaths {
            settings_path: self.settings_path.clone().unwrap_or_else(|| {
                home.join(keyward_storage::settings_store::SETTINGS_FILE_NAME)
            }),
            certificate_dir: self
                .certificate_dir
                .clone()
                .unwrap_or_else(|| home.join("certificates")),
        }
    }
}

/// Write the given config to disk, creating parent directories as needed.
/// Leaves an existing file untouched to avoid clobbering user edits.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    let path = default_path()?;
    write_to_path_if_missing(config, &path)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
