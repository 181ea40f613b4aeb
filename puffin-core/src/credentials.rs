//! Credential storage and resolution for the completion endpoint's API token.
//!
//! Provides a trait-based abstraction over credential storage with two implementations:
//! - `KeyringCredentialStore`: Uses the OS-native credential store (macOS Keychain,
//!   Windows Credential Manager, Linux Secret Service).
//! - `InMemoryCredentialStore`: In-memory store for testing.
//!
//! [`resolve_api_token`] walks config, environment, and the store in that order.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::EndpointConfig;

const SERVICE: &str = "puffin";

/// Errors from credential storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("No API token configured for {provider} (set {env_var})")]
    Missing { provider: String, env_var: String },

    #[error("Credential not found for {service}:{account}")]
    NotFound { service: String, account: String },

    #[error("Failed to store credential: {message}")]
    StoreFailed { message: String },

    #[error("Failed to delete credential: {message}")]
    DeleteFailed { message: String },

    #[error("Keyring backend not available: {message}")]
    BackendUnavailable { message: String },
}

/// Trait for credential storage backends.
pub trait CredentialStore: Send + Sync {
    /// Store an API token for the given provider.
    fn store_key(&self, provider: &str, api_key: &str) -> Result<(), CredentialError>;

    /// Retrieve the API token for the given provider.
    fn get_key(&self, provider: &str) -> Result<String, CredentialError>;

    /// Delete the API token for the given provider.
    fn delete_key(&self, provider: &str) -> Result<(), CredentialError>;

    /// Check whether a token exists for the given provider.
    fn has_key(&self, provider: &str) -> bool;
}

/// OS-native credential store using the `keyring` crate.
///
/// Stores credentials under service `"puffin"` with account names
/// formatted as `"provider:{name}"`.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }

    /// Format the account name for a given provider.
    pub fn account_name(provider: &str) -> String {
        format!("provider:{provider}")
    }

    fn entry(&self, provider: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, &Self::account_name(provider)).map_err(|e| {
            CredentialError::BackendUnavailable {
                message: e.to_string(),
            }
        })
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn store_key(&self, provider: &str, api_key: &str) -> Result<(), CredentialError> {
        self.entry(provider)?
            .set_password(api_key)
            .map_err(|e| CredentialError::StoreFailed {
                message: e.to_string(),
            })
    }

    fn get_key(&self, provider: &str) -> Result<String, CredentialError> {
        self.entry(provider)?.get_password().map_err(|e| match e {
            keyring::Error::NoEntry => CredentialError::NotFound {
                service: self.service.clone(),
                account: Self::account_name(provider),
            },
            other => CredentialError::StoreFailed {
                message: other.to_string(),
            },
        })
    }

    fn delete_key(&self, provider: &str) -> Result<(), CredentialError> {
        self.entry(provider)?
            .delete_credential()
            .map_err(|e| CredentialError::DeleteFailed {
                message: e.to_string(),
            })
    }

    fn has_key(&self, provider: &str) -> bool {
        self.get_key(provider).is_ok()
    }
}

/// In-memory credential store for testing.
///
/// Thread-safe via `Mutex<HashMap>`. Does not persist across process restarts.
pub struct InMemoryCredentialStore {
    store: Mutex<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still a valid map.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn store_key(&self, provider: &str, api_key: &str) -> Result<(), CredentialError> {
        let account = KeyringCredentialStore::account_name(provider);
        self.lock().insert(account, api_key.to_string());
        Ok(())
    }

    fn get_key(&self, provider: &str) -> Result<String, CredentialError> {
        let account = KeyringCredentialStore::account_name(provider);
        self.lock()
            .get(&account)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound {
                service: SERVICE.to_string(),
                account,
            })
    }

    fn delete_key(&self, provider: &str) -> Result<(), CredentialError> {
        let account = KeyringCredentialStore::account_name(provider);
        self.lock().remove(&account);
        Ok(())
    }

    fn has_key(&self, provider: &str) -> bool {
        let account = KeyringCredentialStore::account_name(provider);
        self.lock().contains_key(&account)
    }
}

/// Whether a token has the shape Replicate issues (`r8_` prefix, 40 characters).
pub fn looks_like_replicate_token(token: &str) -> bool {
    token.starts_with("r8_") && token.len() == 40
}

/// Resolve the API token for the configured endpoint.
///
/// Order: explicit `api_token` in config, then the `api_token_env` environment
/// variable, then the credential store under `credential_store_key` (or the
/// provider name). Blank values are skipped.
pub fn resolve_api_token(
    config: &EndpointConfig,
    store: Option<&dyn CredentialStore>,
) -> Result<String, CredentialError> {
    let from_env = || {
        std::env::var(&config.api_token_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
    };
    let from_store = || {
        let key = config
            .credential_store_key
            .as_deref()
            .unwrap_or(&config.provider);
        store.and_then(|s| match s.get_key(key) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!(error = %e, key, "No token in credential store");
                None
            }
        })
    };

    let token = config
        .api_token
        .clone()
        .filter(|v| !v.trim().is_empty())
        .or_else(from_env)
        .or_else(from_store)
        .ok_or_else(|| CredentialError::Missing {
            provider: config.provider.clone(),
            env_var: config.api_token_env.clone(),
        })?;

    if config.provider == "replicate" && !looks_like_replicate_token(&token) {
        warn!("API token does not look like a Replicate token (expected r8_ prefix, 40 chars)");
    }
    Ok(token)
}
