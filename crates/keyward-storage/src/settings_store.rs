use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Local;
use keyward_core::{
    certificate::{CertificateError, CertificateStore},
    credential::Credential,
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::{
    envelope::{self, EnvelopeError, SealedRecord, StoredRecord},
    key_provider::CertificateKeyProvider,
};

/// Name of the settings file inside the data directory.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error("failed to seal setting {name}: {source}")]
    Seal {
        name: String,
        #[source]
        source: EnvelopeError,
    },
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is not valid: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of opening one stored setting.
#[derive(Debug)]
pub enum RecordOutcome {
    Decrypted(Credential),
    /// The record could not be opened; other records are unaffected.
    Skipped(EnvelopeError),
}

/// Acknowledgement returned by [`SettingsStore::protect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectReport {
    pub path: PathBuf,
    pub backup: Option<PathBuf>,
    pub count: usize,
}

type SettingsFile = BTreeMap<String, StoredRecord>;

/// Envelope-encrypted settings file bound to a single path.
pub struct SettingsStore<S: CertificateStore> {
    path: PathBuf,
    keys: CertificateKeyProvider<S>,
}

impl<S: CertificateStore> SettingsStore<S> {
    pub fn new(path: impl Into<PathBuf>, certificates: S) -> Self {
        Self {
            path: path.into(),
            keys: CertificateKeyProvider::new(certificates),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal every entry for `certificate` and replace the settings file.
    ///
    /// Unless `force` is set, an existing file is renamed to
    /// `<path>-<timestamp>.bak` once the new contents are fully written.
    /// Concurrent callers must serialize externally.
    #[instrument(skip_all, fields(path = %self.path.display(), count = settings.len()))]
    pub fn protect(
        &self,
        settings: &BTreeMap<String, String>,
        certificate: &str,
        force: bool,
    ) -> Result<ProtectReport, SettingsError> {
        let cert = self.keys.find(certificate)?;

        let mut file = SettingsFile::new();
        for (name, value) in settings {
            let record = envelope::seal(value, &cert).map_err(|source| SettingsError::Seal {
                name: name.clone(),
                source,
            })?;
            file.insert(name.clone(), record.to_stored());
        }

        let backup = write_settings(&self.path, &file, !force)?;
        info!(thumbprint = %cert.thumbprint(), "settings protected");
        Ok(ProtectReport {
            path: self.path.clone(),
            backup,
            count: file.len(),
        })
    }

    /// Open every record, reporting per-record outcomes. A missing file is an
    /// empty result, not an error. The file is never modified.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<BTreeMap<String, RecordOutcome>, SettingsError> {
        let Some(file) = read_settings(&self.path)? else {
            debug!("no settings file present");
            return Ok(BTreeMap::new());
        };

        let mut out = BTreeMap::new();
        for (name, stored) in file {
            let outcome = match self.open(&stored) {
                Ok(secret) => RecordOutcome::Decrypted(Credential::new(name.clone(), secret)),
                Err(err) => {
                    warn!(setting = %name, "skipping setting: {err}");
                    RecordOutcome::Skipped(err)
                }
            };
            out.insert(name, outcome);
        }
        Ok(out)
    }

    /// Decrypted settings keyed by name; unopenable records are omitted.
    pub fn unprotect(&self) -> Result<BTreeMap<String, Credential>, SettingsError> {
        Ok(self
            .load()?
            .into_iter()
            .filter_map(|(name, outcome)| match outcome {
                RecordOutcome::Decrypted(cred) => Some((name, cred)),
                RecordOutcome::Skipped(_) => None,
            })
            .collect())
    }

    /// Look up specific settings; names that are absent or unopenable map to `None`.
    pub fn get_values(
        &self,
        keys: &[&str],
    ) -> Result<BTreeMap<String, Option<Zeroizing<String>>>, SettingsError> {
        let mut decrypted = self.unprotect()?;
        Ok(keys
            .iter()
            .map(|key| {
                let value = decrypted.remove(*key).map(Credential::into_secret);
                (key.to_string(), value)
            })
            .collect())
    }

    /// Setting names present in the file. Values are not decrypted.
    pub fn list_keys(&self) -> Result<Vec<String>, SettingsError> {
        Ok(read_settings(&self.path)?
            .map(|file| file.into_keys().collect())
            .unwrap_or_default())
    }

    fn open(&self, stored: &StoredRecord) -> Result<Zeroizing<String>, EnvelopeError> {
        let record = SealedRecord::from_stored(stored)?;
        envelope::unseal(&record, |thumbprint| self.keys.find(thumbprint))
    }
}

fn read_settings(path: &Path) -> Result<Option<SettingsFile>, SettingsError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| SettingsError::Format {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `file` to `path`, returning the backup of the previous file if one
/// was kept.
fn write_settings(
    path: &Path,
    file: &SettingsFile,
    keep_backup: bool,
) -> Result<Option<PathBuf>, SettingsError> {
    let json = serde_json::to_vec_pretty(file).map_err(|source| SettingsError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    replace_file(path, keep_backup, |tmp| tmp.write_all(&json))
}

/// Stage new contents next to `path`, then back up the live file and rename
/// the staged one over it. The live file is not touched until `fill` and the
/// flush have succeeded.
fn replace_file<F>(
    path: &Path,
    keep_backup: bool,
    fill: F,
) -> Result<Option<PathBuf>, SettingsError>
where
    F: FnOnce(&mut NamedTempFile) -> std::io::Result<()>,
{
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    fill(&mut tmp).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;

    let backup = if keep_backup && path.exists() {
        Some(backup_existing(path)?)
    } else {
        None
    };

    if let Err(err) = tmp.persist(path) {
        if let Some(backup) = &backup {
            if let Err(restore) = fs::rename(backup, path) {
                warn!(backup = %backup.display(), "failed to restore backup: {restore}");
            }
        }
        return Err(io_err(err.error));
    }
    Ok(backup)
}

fn backup_existing(path: &Path) -> Result<PathBuf, SettingsError> {
    let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
    let base = path.as_os_str().to_string_lossy().into_owned();

    let mut backup = PathBuf::from(format!("{base}-{stamp}.bak"));
    let mut attempt = 1;
    while backup.exists() {
        backup = PathBuf::from(format!("{base}-{stamp}-{attempt}.bak"));
        attempt += 1;
    }

    fs::rename(path, &backup).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(backup = %backup.display(), "previous settings backed up");
    Ok(backup)
}
