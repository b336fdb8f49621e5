use std::collections::BTreeMap;

use color_eyre::{eyre::eyre, Result};
use keyward_core::certificate::CertificateStore;
use keyward_storage::{
    certificate_store::FileCertificateStore, key_provider::generate_certificate,
    settings_store::SettingsStore,
};
use tracing::debug;

use crate::config::{Config, ResolvedPaths};

/// Build the settings store from resolved paths.
pub fn store_from_paths(paths: &ResolvedPaths) -> SettingsStore<FileCertificateStore> {
    debug!(
        settings = %paths.settings_path.display(),
        certificates = %paths.certificate_dir.display(),
        "initializing settings store"
    );
    SettingsStore::new(
        paths.settings_path.clone(),
        FileCertificateStore::new(paths.certificate_dir.clone()),
    )
}

pub fn protect<S: CertificateStore>(
    store: &SettingsStore<S>,
    config: &Config,
    cert: Option<String>,
    force: bool,
    entries: Vec<(String, String)>,
) -> Result<()> {
    let cert = cert
        .or_else(|| config.certificate.clone())
        .ok_or_else(|| eyre!("no certificate given; pass --cert or set `certificate` in config"))?;
    let settings: BTreeMap<String, String> = entries.into_iter().collect();

    let report = store.protect(&settings, &cert, force)?;
    println!(
        "Protected {} setting(s) in {}",
        report.count,
        report.path.display()
    );
    if let Some(backup) = report.backup {
        println!("Previous file saved as {}", backup.display());
    }
    Ok(())
}

pub fn get<S: CertificateStore>(store: &SettingsStore<S>, keys: &[String]) -> Result<()> {
    let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
    for (name, value) in store.get_values(&keys)? {
        match value {
            Some(secret) => println!("{name}={}", secret.as_str()),
            None => println!("{name} is not set"),
        }
    }
    Ok(())
}

pub fn list<S: CertificateStore>(store: &SettingsStore<S>) -> Result<()> {
    let names = store.list_keys()?;
    if names.is_empty() {
        println!("No settings yet. Add some with `keyward protect NAME=VALUE`.");
        return Ok(());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

pub fn new_certificate(certificates: &FileCertificateStore, subject: &str) -> Result<()> {
    let cert = generate_certificate(subject);
    let path = certificates.save(&cert)?;
    println!("{} {}", cert.thumbprint(), cert.subject());
    println!("Saved to {}", path.display());
    Ok(())
}
