//! Envelope-encrypted settings at rest.
//! Each value is sealed with a fresh AES-256-GCM key; that key is wrapped
//! under an X25519 certificate so only the certificate holder can open it.

pub mod certificate_store;
pub mod envelope;
pub mod key_provider;
pub mod settings_store;
