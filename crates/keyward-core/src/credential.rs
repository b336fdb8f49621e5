use std::fmt;

use zeroize::Zeroizing;

/// A decrypted setting: the setting name paired with its secret value.
/// The secret is wiped from memory when the credential is dropped.
#[derive(Clone)]
pub struct Credential {
    username: String,
    secret: Zeroizing<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: Zeroizing<String>) -> Self {
        Self {
            username: username.into(),
            secret,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Borrow the secret. Callers must not log or persist the result.
    pub fn expose_secret(&self) -> &str {
        self.secret.as_str()
    }

    pub fn into_secret(self) -> Zeroizing<String> {
        self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
