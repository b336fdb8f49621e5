use crypto_box::{
    aead::{Aead, AeadCore, Nonce, OsRng},
    PublicKey, SalsaBox, SecretKey,
};
use keyward_core::certificate::{Certificate, CertificateError, CertificateStore};
use tracing::debug;
use zeroize::Zeroizing;

/// Largest payload `wrap_key` accepts. Only symmetric keys go through the
/// asymmetric path, never raw setting values.
pub const MAX_WRAP_PAYLOAD: usize = 64;

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Certificate lookup for the settings store. Wrapping goes through
/// [`wrap_key`] and [`unwrap_key`] with the certificate it returns.
pub struct CertificateKeyProvider<S: CertificateStore> {
    store: S,
}

impl<S: CertificateStore> CertificateKeyProvider<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn find(&self, identifier: &str) -> Result<Certificate, CertificateError> {
        let cert = self.store.find(identifier)?;
        debug!(thumbprint = %cert.thumbprint(), "certificate resolved");
        Ok(cert)
    }
}

/// Encrypt a small payload under the certificate's public key.
///
/// Output layout: `ephemeral_public(32) || nonce(24) || ciphertext`. A fresh
/// ephemeral key pair is used per call, so wrapping the same key twice yields
/// different bytes.
pub fn wrap_key(certificate: &Certificate, key: &[u8]) -> Result<Vec<u8>, CertificateError> {
    if key.len() > MAX_WRAP_PAYLOAD {
        return Err(CertificateError::KeyTooLarge {
            len: key.len(),
            max: MAX_WRAP_PAYLOAD,
        });
    }

    let recipient = PublicKey::from(*certificate.public_key());
    let ephemeral = SecretKey::generate(&mut OsRng);
    let salsa_box = SalsaBox::new(&recipient, &ephemeral);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let sealed = salsa_box
        .encrypt(&nonce, key)
        .map_err(|e| CertificateError::Wrap {
            reason: e.to_string(),
        })?;

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + sealed.len());
    out.extend_from_slice(ephemeral.public_key().as_bytes());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Recover a payload produced by [`wrap_key`] using the certificate's private key.
pub fn unwrap_key(
    certificate: &Certificate,
    wrapped: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CertificateError> {
    let private = certificate
        .private_key()
        .ok_or_else(|| CertificateError::KeyAccessDenied {
            thumbprint: certificate.thumbprint(),
        })?;

    if wrapped.len() < EPHEMERAL_LEN + NONCE_LEN + TAG_LEN {
        return Err(CertificateError::Unwrap {
            reason: format!("wrapped key truncated ({} bytes)", wrapped.len()),
        });
    }

    let (ephemeral, rest) = wrapped.split_at(EPHEMERAL_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let mut ephemeral_bytes = [0u8; EPHEMERAL_LEN];
    ephemeral_bytes.copy_from_slice(ephemeral);

    let secret = SecretKey::from(*private);
    let salsa_box = SalsaBox::new(&PublicKey::from(ephemeral_bytes), &secret);
    salsa_box
        .decrypt(Nonce::<SalsaBox>::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CertificateError::Unwrap {
            reason: "wrong key or tampered data".to_string(),
        })
}

/// Create a new certificate with a fresh X25519 key pair.
pub fn generate_certificate(subject: &str) -> Certificate {
    let secret = SecretKey::generate(&mut OsRng);
    let public = *secret.public_key().as_bytes();
    Certificate::new(subject, public, Some(secret.to_bytes()))
}
