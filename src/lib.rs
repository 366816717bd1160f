//! Conversation sync and streaming-answer engine for the knowledge-base chat
//! client.
//!
//! - `chat` - conversation store, answer streaming, background sync
//! - `api` - remote service seam, HTTP client, SSE decoding
//! - `storage` - key-value persistence and the offline conversation cache
//! - `auth` - bearer token storage
//! - `config` - environment-driven settings

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod storage;
pub mod types;
