use std::{
    fmt,
    sync::{Arc, Mutex},
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors produced while locating certificates or using their keys.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    /// No certificate matched the identifier.
    #[error("certificate not found: {identifier}")]
    NotFound { identifier: String },
    /// Certificate is present but its private key cannot be used.
    #[error("private key unavailable for certificate {thumbprint}")]
    KeyAccessDenied { thumbprint: String },
    /// Payload exceeds what the asymmetric wrap accepts.
    #[error("wrap payload of {len} bytes exceeds maximum of {max}")]
    KeyTooLarge { len: usize, max: usize },
    /// Asymmetric encryption failed.
    #[error("key wrap failed: {reason}")]
    Wrap { reason: String },
    /// Asymmetric decryption failed (wrong key or corrupted data).
    #[error("key unwrap failed: {reason}")]
    Unwrap { reason: String },
    /// Underlying store failure.
    #[error("certificate store failure: {reason}")]
    Store { reason: String },
}

/// An asymmetric certificate: subject name, public key and, when the store
/// grants it, the private key.
#[derive(Clone)]
pub struct Certificate {
    subject: String,
    public_key: [u8; 32],
    private_key: Option<Zeroizing<[u8; 32]>>,
}

impl Certificate {
    pub fn new(
        subject: impl Into<String>,
        public_key: [u8; 32],
        private_key: Option<[u8; 32]>,
    ) -> Self {
        Self {
            subject: normalize_subject(subject.into()),
            public_key,
            private_key: private_key.map(Zeroizing::new),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn private_key(&self) -> Option<&[u8; 32]> {
        self.private_key.as_deref()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// Uppercase hex SHA-256 of the public key.
    pub fn thumbprint(&self) -> String {
        hex::encode_upper(Sha256::digest(self.public_key))
    }

    /// Copy of this certificate carrying only the public half.
    pub fn public_only(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            public_key: self.public_key,
            private_key: None,
        }
    }

    /// True when `identifier` names this certificate by thumbprint
    /// (case-insensitive), full subject, or bare common name.
    pub fn matches(&self, identifier: &str) -> bool {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return false;
        }
        identifier.eq_ignore_ascii_case(&self.thumbprint())
            || self.subject == identifier
            || self.subject == format!("CN={identifier}")
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("thumbprint", &self.thumbprint())
            .field("has_private_key", &self.has_private_key())
            .finish()
    }
}

fn normalize_subject(subject: String) -> String {
    let trimmed = subject.trim();
    if trimmed.starts_with("CN=") {
        trimmed.to_string()
    } else {
        format!("CN={trimmed}")
    }
}

/// Read-only certificate lookup (file-backed in production; memory in tests).
pub trait CertificateStore: Send + Sync {
    /// Locate a certificate by subject name or thumbprint.
    fn find(&self, identifier: &str) -> Result<Certificate, CertificateError>;
}

/// In-memory certificate store for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCertificateStore {
    inner: Arc<Mutex<Vec<Certificate>>>,
}

impl InMemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, certificate: Certificate) -> Result<(), CertificateError> {
        let mut certs = self.inner.lock().map_err(|err| CertificateError::Store {
            reason: format!("lock poisoned: {err}"),
        })?;
        certs.retain(|c| c.thumbprint() != certificate.thumbprint());
        certs.push(certificate);
        Ok(())
    }

    pub fn remove(&self, identifier: &str) -> Result<(), CertificateError> {
        let mut certs = self.inner.lock().map_err(|err| CertificateError::Store {
            reason: format!("lock poisoned: {err}"),
        })?;
        certs.retain(|c| !c.matches(identifier));
        Ok(())
    }
}

impl CertificateStore for InMemoryCertificateStore {
    fn find(&self, identifier: &str) -> Result<Certificate, CertificateError> {
        let certs = self.inner.lock().map_err(|err| CertificateError::Store {
            reason: format!("lock poisoned: {err}"),
        })?;
        certs
            .iter()
            .find(|c| c.matches(identifier))
            .cloned()
            .ok_or_else(|| CertificateError::NotFound {
                identifier: identifier.to_string(),
            })
    }
}
