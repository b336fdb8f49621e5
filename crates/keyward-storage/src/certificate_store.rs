use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyward_core::certificate::{Certificate, CertificateError, CertificateStore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{instrument, warn};

/// Directory of certificate files, one JSON document per certificate.
pub struct FileCertificateStore {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CertificateFile {
    subject: String,
    public_key: String,
    #[serde(default)]
    private_key: Option<String>,
}

impl FileCertificateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a certificate as `<thumbprint>.json`, replacing any previous copy.
    #[instrument(skip_all, fields(subject = %certificate.subject()))]
    pub fn save(&self, certificate: &Certificate) -> Result<PathBuf, CertificateError> {
        fs::create_dir_all(&self.root).map_err(store_err)?;

        let doc = CertificateFile {
            subject: certificate.subject().to_string(),
            public_key: STANDARD.encode(certificate.public_key()),
            private_key: certificate.private_key().map(|k| STANDARD.encode(k)),
        };
        let path = self.root.join(format!("{}.json", certificate.thumbprint()));

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(store_err)?;
        let json = serde_json::to_vec_pretty(&doc).map_err(store_err)?;
        tmp.write_all(&json).map_err(store_err)?;
        tmp.flush().map_err(store_err)?;
        tmp.persist(&path).map_err(|e| store_err(e.error))?;
        Ok(path)
    }

    fn load_all(&self) -> Result<Vec<Certificate>, CertificateError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(store_err(err)),
        };

        let mut certs = Vec::new();
        for entry in entries {
            let path = entry.map_err(store_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_certificate(&path) {
                Ok(cert) => certs.push(cert),
                Err(err) => warn!(path = %path.display(), "skipping unreadable certificate: {err}"),
            }
        }
        Ok(certs)
    }
}

impl CertificateStore for FileCertificateStore {
    fn find(&self, identifier: &str) -> Result<Certificate, CertificateError> {
        self.load_all()?
            .into_iter()
            .find(|c| c.matches(identifier))
            .ok_or_else(|| CertificateError::NotFound {
                identifier: identifier.to_string(),
            })
    }
}

fn read_certificate(path: &Path) -> Result<Certificate, CertificateError> {
    let bytes = fs::read(path).map_err(store_err)?;
    let doc: CertificateFile = serde_json::from_slice(&bytes).map_err(store_err)?;

    let public_key = decode_key(&doc.public_key)?;
    let private_key = doc.private_key.as_deref().map(decode_key).transpose()?;
    Ok(Certificate::new(doc.subject, public_key, private_key))
}

fn decode_key(encoded: &str) -> Result<[u8; 32], CertificateError> {
    let bytes = STANDARD.decode(encoded).map_err(store_err)?;
    if bytes.len() != 32 {
        return Err(CertificateError::Store {
            reason: format!("expected 32 key bytes, got {}", bytes.len()),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn store_err<E: ToString>(err: E) -> CertificateError {
    CertificateError::Store {
        reason: err.to_string(),
    }
}
