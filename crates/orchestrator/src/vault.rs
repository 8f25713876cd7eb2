#![forbid(unsafe_code)]

use crate::error::Error;
use std::fmt;

/// A revealed secret. Debug output is redacted so secrets never end up in
/// logs or error chains.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// The at-rest credential encryption routine lives outside this crate; it is
/// consumed here only as an opaque reveal capability.
pub trait CredentialVault: Send + Sync {
    /// Resolve an opaque credential reference to its secret.
    fn reveal(&self, credential_ref: &str) -> Result<Secret, Error>;
}

/// Vault backed by a fixed in-memory map. Useful for tests and for
/// environments that inject secrets through the process environment.
#[derive(Debug, Default)]
pub struct StaticVault {
    entries: std::collections::HashMap<String, String>,
}

impl StaticVault {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

impl CredentialVault for StaticVault {
    fn reveal(&self, credential_ref: &str) -> Result<Secret, Error> {
        self.entries
            .get(credential_ref)
            .map(|value| Secret::new(value.clone()))
            .ok_or_else(|| Error::CredentialUnavailable(credential_ref.to_string()))
    }
}
