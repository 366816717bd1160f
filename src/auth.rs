use crate::storage::{KeyValueStore, StorageResult};
use std::sync::Arc;

pub const TOKEN_KEY: &str = "token";

/// Bearer token held in the platform's secure storage.
///
/// Obtaining a token (login) happens elsewhere; this type only reads it for
/// each request and drops it when the service answers 401.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn token(&self) -> Option<String> {
        self.store
            .get(TOKEN_KEY)
            .map(|raw| raw.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    pub fn set_token(&self, token: &str) -> StorageResult<()> {
        self.store.set(TOKEN_KEY, token.trim())
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    pub fn invalidate(&self) {
        if let Err(err) = self.store.remove(TOKEN_KEY) {
            tracing::error!(error = %err, "failed to clear expired token");
        } else {
            tracing::warn!("authentication expired; token cleared");
        }
    }
}
