//! Local key-value persistence
//!
//! This module provides:
//! - A `KeyValueStore` seam for the platform's secure/local storage
//! - A file-backed store (one JSON file per key) for native targets
//! - An in-memory store for tests and ephemeral sessions
//! - `ConversationCache`, the offline mirror of the conversation list

use crate::types::Conversation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io};

pub const CHAT_HISTORY_KEY: &str = "chatHistory";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

// ============================================
// File-backed store
// ============================================

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted in the platform data directory, falling back to a
    /// relative `cache/` directory when none is available.
    pub fn for_namespace(namespace: &str) -> Self {
        let safe = sanitize_key(namespace);
        if let Some(data_dir) = dirs::data_local_dir() {
            return Self::new(data_dir.join("kbchat").join(safe));
        }
        Self::new(PathBuf::from("cache").join(safe))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_key(key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(key);
        // Write to a sibling temp file first so a crash never leaves a torn blob.
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, value)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ============================================
// In-memory store
// ============================================

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Sanitize storage key for filesystem use
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}

// ============================================
// Conversation cache
// ============================================

/// The whole conversation list lives under one key and is always rewritten
/// in full.
#[derive(Clone)]
pub struct ConversationCache {
    store: Arc<dyn KeyValueStore>,
}

impl ConversationCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Vec<Conversation> {
        let Some(raw) = self.store.get(CHAT_HISTORY_KEY) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<Conversation>>(&raw) {
            Ok(conversations) => {
                tracing::debug!(count = conversations.len(), "loaded conversation cache");
                conversations
            }
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable conversation cache");
                Vec::new()
            }
        }
    }

    pub fn save(&self, conversations: &[Conversation]) -> StorageResult<()> {
        let raw = serde_json::to_string(conversations)?;
        self.store.set(CHAT_HISTORY_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("chatHistory"), "chatHistory");
        assert_eq!(sanitize_key("user:preferences"), "user_preferences");
        assert_eq!(sanitize_key(&"k".repeat(100)).len(), 64);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.set("token", "abc").unwrap();
        assert_eq!(store.get("token"), Some("abc".to_string()));
        store.remove("token").unwrap();
        assert!(store.get("token").is_none());
    }

    #[test]
    fn cache_discards_corrupt_blob() {
        let store = Arc::new(MemoryStore::new());
        store.set(CHAT_HISTORY_KEY, "{not json").unwrap();
        let cache = ConversationCache::new(store);
        assert!(cache.load().is_empty());
    }

    #[test]
    fn cache_writes_whole_list() {
        let store = Arc::new(MemoryStore::new());
        let cache = ConversationCache::new(store.clone());
        let now = OffsetDateTime::now_utc();
        let first = Conversation::new_local("first", now);
        let second = Conversation::new_local("second", now);
        cache.save(&[first.clone(), second.clone()]).unwrap();
        cache.save(&[second.clone()]).unwrap();

        let loaded = cache.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, second.id);
    }
}
