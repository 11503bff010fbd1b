use log::{info, warn};
use std::collections::HashMap;

use crate::error::{INVALID_CREDENTIALS, Result, ScreenerError};

/// Static credential store
///
/// Maps normalized identifiers (email addresses) to their secrets. The store
/// is built once from configuration and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

/// Result of a login attempt
///
/// A rejected login is an expected outcome, not an error. The denial carries
/// no hint of whether the identifier or the secret was wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Credentials matched; holds the normalized identifier
    Granted(String),

    /// Credentials did not match
    Denied,
}

impl LoginOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LoginOutcome::Granted(_))
    }

    /// User-facing message for this outcome.
    pub fn message(&self) -> String {
        match self {
            LoginOutcome::Granted(identifier) => format!("Access granted! Welcome, {}", identifier),
            LoginOutcome::Denied => INVALID_CREDENTIALS.to_string(),
        }
    }

    /// Turn a denial into [`ScreenerError::AuthenticationFailure`] for callers
    /// that prefer `?`.
    pub fn into_result(self) -> Result<String> {
        match self {
            LoginOutcome::Granted(identifier) => Ok(identifier),
            LoginOutcome::Denied => Err(ScreenerError::AuthenticationFailure),
        }
    }
}

/// Normalize an identifier for lookup
///
/// Identifiers are compared case-insensitively, ignoring surrounding whitespace.
///
/// # Arguments
/// * `identifier` - Raw identifier as typed by the user
///
/// # Returns
/// * `String` - Lowercased, trimmed identifier
///
/// # Examples
/// ```
/// use screener::login::normalize_identifier;
///
/// assert_eq!(normalize_identifier("  User@Test.com "), "user@test.com");
/// ```
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

impl CredentialStore {
    /// Build a store from a configured identifier → secret mapping
    ///
    /// Keys are normalized on the way in.
    ///
    /// # Arguments
    /// * `users` - Identifier/secret pairs as written in configuration
    ///
    /// # Returns
    /// * `Result<CredentialStore>` - The store, or a configuration error
    ///
    /// # Errors
    /// * Returns `ScreenerError::Configuration` if two identifiers normalize to
    ///   the same key
    pub fn from_users<I, K, V>(users: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut map = HashMap::new();
        for (identifier, secret) in users {
            let key = normalize_identifier(identifier.as_ref());
            if map.insert(key.clone(), secret.into()).is_some() {
                return Err(ScreenerError::Configuration(format!(
                    "identifier '{}' is listed more than once in [auth.users]",
                    key
                )));
            }
        }
        Ok(CredentialStore { users: map })
    }

    /// Look up the secret for an identifier
    ///
    /// # Arguments
    /// * `identifier` - Identifier to look up; normalized before lookup
    ///
    /// # Returns
    /// * `Option<&str>` - The stored secret, or `None` if the identifier is unknown
    pub fn lookup(&self, identifier: &str) -> Option<&str> {
        self.users
            .get(&normalize_identifier(identifier))
            .map(String::as_str)
    }

    /// Verify an identifier/secret pair
    ///
    /// The secret must match byte-for-byte (case-sensitive).
    ///
    /// # Arguments
    /// * `identifier` - Identifier as typed by the user
    /// * `secret` - Secret as typed by the user
    ///
    /// # Returns
    /// * `LoginOutcome` - `Granted` with the normalized identifier, or `Denied`
    pub fn verify(&self, identifier: &str, secret: &str) -> LoginOutcome {
        let key = normalize_identifier(identifier);
        match self.users.get(&key) {
            Some(stored) if stored.as_bytes() == secret.as_bytes() => {
                info!("login granted for {}", key);
                LoginOutcome::Granted(key)
            }
            _ => {
                warn!("login denied for {}", key);
                LoginOutcome::Denied
            }
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
