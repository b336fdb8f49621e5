use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyward_core::certificate::{Certificate, CertificateError};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::key_provider::{unwrap_key, wrap_key};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// No certificate matches the record's recipient thumbprint.
    #[error("no certificate found for thumbprint {thumbprint}")]
    MissingCertificate { thumbprint: String },
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    /// Stored record fields could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// 256-bit AES key, wiped when dropped on every exit path.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn from_unwrapped(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != KEY_LEN {
            return Err(EnvelopeError::Decrypt(format!(
                "expected {KEY_LEN}-byte key, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    fn cipher(&self) -> Result<Aes256Gcm, EnvelopeError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| EnvelopeError::Encrypt(e.to_string()))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Envelope-encrypted form of one setting value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    /// `nonce || aes-gcm output`.
    pub ciphertext: Vec<u8>,
    /// The record's symmetric key, wrapped under the recipient certificate.
    pub wrapped_key: Vec<u8>,
    /// Thumbprint of the certificate that can open this record.
    pub recipient_ref: String,
}

/// On-disk field layout of a sealed record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRecord {
    pub encrypted_data: String,
    pub encrypted_key: String,
    pub thumbprint: String,
}

impl SealedRecord {
    pub fn to_stored(&self) -> StoredRecord {
        StoredRecord {
            encrypted_data: STANDARD.encode(&self.ciphertext),
            encrypted_key: STANDARD.encode(&self.wrapped_key),
            thumbprint: STANDARD.encode(self.recipient_ref.as_bytes()),
        }
    }

    pub fn from_stored(stored: &StoredRecord) -> Result<Self, EnvelopeError> {
        let ciphertext = STANDARD
            .decode(&stored.encrypted_data)
            .map_err(|e| EnvelopeError::Malformed(format!("encrypted_data: {e}")))?;
        let wrapped_key = STANDARD
            .decode(&stored.encrypted_key)
            .map_err(|e| EnvelopeError::Malformed(format!("encrypted_key: {e}")))?;
        let thumbprint = STANDARD
            .decode(&stored.thumbprint)
            .map_err(|e| EnvelopeError::Malformed(format!("thumbprint: {e}")))?;
        let recipient_ref = String::from_utf8(thumbprint)
            .map_err(|e| EnvelopeError::Malformed(format!("thumbprint: {e}")))?;
        Ok(Self {
            ciphertext,
            wrapped_key,
            recipient_ref,
        })
    }
}

/// Encrypt `plaintext` under a freshly generated key and wrap that key for `certificate`.
pub fn seal(plaintext: &str, certificate: &Certificate) -> Result<SealedRecord, EnvelopeError> {
    let key = SymmetricKey::generate();
    let cipher = key.cipher()?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let encrypted = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| EnvelopeError::Encrypt(e.to_string()))?;

    let mut ciphertext = Vec::with_capacity(NONCE_LEN + encrypted.len());
    ciphertext.extend_from_slice(nonce.as_slice());
    ciphertext.extend_from_slice(&encrypted);

    let wrapped_key = wrap_key(certificate, key.as_bytes())?;
    Ok(SealedRecord {
        ciphertext,
        wrapped_key,
        recipient_ref: certificate.thumbprint(),
    })
}

/// Open a sealed record. `find_certificate` resolves the record's thumbprint.
/// A lookup that reports [`CertificateError::NotFound`] yields
/// [`EnvelopeError::MissingCertificate`] so batch callers can skip; any other
/// lookup failure is returned as-is.
pub fn unseal<F>(
    record: &SealedRecord,
    find_certificate: F,
) -> Result<Zeroizing<String>, EnvelopeError>
where
    F: FnOnce(&str) -> Result<Certificate, CertificateError>,
{
    let certificate = find_certificate(&record.recipient_ref).map_err(|err| match err {
        CertificateError::NotFound { .. } => EnvelopeError::MissingCertificate {
            thumbprint: record.recipient_ref.clone(),
        },
        other => EnvelopeError::Certificate(other),
    })?;

    let unwrapped = unwrap_key(&certificate, &record.wrapped_key)?;
    let key = SymmetricKey::from_unwrapped(&unwrapped)?;
    drop(unwrapped);

    decrypt_with(&key, &record.ciphertext)
}

fn decrypt_with(
    key: &SymmetricKey,
    ciphertext: &[u8],
) -> Result<Zeroizing<String>, EnvelopeError> {
    if ciphertext.len() < NONCE_LEN {
        return Err(EnvelopeError::Decrypt("ciphertext truncated".to_string()));
    }
    let (nonce, body) = ciphertext.split_at(NONCE_LEN);
    let cipher = key.cipher()?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| EnvelopeError::Decrypt(e.to_string()))?,
    );
    let text = std::str::from_utf8(&plaintext)
        .map_err(|e| EnvelopeError::Decrypt(format!("value is not utf-8: {e}")))?;
    Ok(Zeroizing::new(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::generate_certificate;

    #[test]
    fn seal_then_unseal_returns_plaintext() {
        let cert = generate_certificate("node01");
        let record = seal("P@ssw0rd!", &cert).expect("seal");
        assert_eq!(record.recipient_ref, cert.thumbprint());

        let opened = unseal(&record, |_| Ok(cert.clone())).expect("unseal");
        assert_eq!(opened.as_str(), "P@ssw0rd!");
    }

    #[test]
    fn sealing_twice_differs_but_opens_identically() {
        let cert = generate_certificate("node01");
        let first = seal("same", &cert).expect("seal");
        let second = seal("same", &cert).expect("seal");

        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(first.wrapped_key, second.wrapped_key);
        assert_eq!(
            unseal(&first, |_| Ok(cert.clone())).expect("open").as_str(),
            unseal(&second, |_| Ok(cert.clone())).expect("open").as_str()
        );
    }

    #[test]
    fn empty_value_round_trips() {
        let cert = generate_certificate("node01");
        let record = seal("", &cert).expect("seal");
        let opened = unseal(&record, |_| Ok(cert.clone())).expect("unseal");
        assert_eq!(opened.as_str(), "");
    }

    #[test]
    fn missing_certificate_is_reported_not_panicked() {
        let cert = generate_certificate("node01");
        let record = seal("value", &cert).expect("seal");
        let err = unseal(&record, |thumbprint| {
            Err(CertificateError::NotFound {
                identifier: thumbprint.to_string(),
            })
        })
        .expect_err("no cert");
        assert!(matches!(err, EnvelopeError::MissingCertificate { .. }));
    }

    #[test]
    fn store_failure_keeps_its_cause() {
        let cert = generate_certificate("node01");
        let record = seal("value", &cert).expect("seal");
        let err = unseal(&record, |_| {
            Err(CertificateError::Store {
                reason: "certificate directory unreadable".into(),
            })
        })
        .expect_err("store failure");
        assert!(matches!(
            err,
            EnvelopeError::Certificate(CertificateError::Store { .. })
        ));
    }

    #[test]
    fn cipher_key_schedule_is_wiped_on_drop() {
        use std::mem::{size_of, MaybeUninit};

        let key = SymmetricKey::from_unwrapped(&[0xA5; KEY_LEN]).expect("key");
        let mut slot = MaybeUninit::<Aes256Gcm>::uninit();
        slot.write(key.cipher().expect("cipher"));
        // SAFETY: the slot was initialised above and is dropped exactly once;
        // afterwards it is only read as raw bytes.
        let leftover = unsafe {
            slot.assume_init_drop();
            std::slice::from_raw_parts(slot.as_ptr().cast::<u8>(), size_of::<Aes256Gcm>())
        };
        assert!(
            !leftover.windows(KEY_LEN).any(|w| w == [0xA5; KEY_LEN]),
            "key bytes remain in the dropped cipher"
        );
    }

    #[test]
    fn public_only_certificate_cannot_open() {
        let cert = generate_certificate("node01");
        let record = seal("value", &cert).expect("seal");
        let err = unseal(&record, |_| Ok(cert.public_only())).expect_err("no private key");
        assert!(matches!(
            err,
            EnvelopeError::Certificate(CertificateError::KeyAccessDenied { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let cert = generate_certificate("node01");
        let mut record = seal("value", &cert).expect("seal");
        let last = record.ciphertext.len() - 1;
        record.ciphertext[last] ^= 0xFF;

        let err = unseal(&record, |_| Ok(cert.clone())).expect_err("tampered");
        assert!(matches!(err, EnvelopeError::Decrypt(_)));
    }

    #[test]
    fn stored_form_encodes_thumbprint_as_base64_ascii() {
        let cert = generate_certificate("node01");
        let record = seal("value", &cert).expect("seal");
        let stored = record.to_stored();

        let decoded = STANDARD.decode(&stored.thumbprint).expect("base64");
        assert_eq!(decoded, cert.thumbprint().into_bytes());
        assert!(!stored.encrypted_data.contains("value"));
        assert_eq!(SealedRecord::from_stored(&stored).expect("decode"), record);
    }

    #[test]
    fn malformed_stored_record_is_rejected() {
        let stored = StoredRecord {
            encrypted_data: "***".into(),
            encrypted_key: String::new(),
            thumbprint: String::new(),
        };
        let err = SealedRecord::from_stored(&stored).expect_err("bad base64");
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }
}
