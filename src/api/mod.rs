//! Remote side of the chat engine
//!
//! This module talks to the knowledge-base service: conversation CRUD, the
//! QA completion endpoints (JSON and multipart upload) and feedback.
//!
//! # Architecture
//!
//! - `RemoteService` - the seam the chat store depends on
//! - `client` - `ApiClient`, the reqwest implementation with bearer auth
//! - `sse` - incremental decoder for the streamed answer
//! - `wire` - JSON shapes exchanged with the service
//!
//! # Usage
//!
//! ```rust,no_run
//! use kbchat::api::{ApiClient, RemoteService};
//! use kbchat::auth::TokenStore;
//! use kbchat::storage::FileStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), kbchat::api::ApiError> {
//! let tokens = TokenStore::new(Arc::new(FileStore::for_namespace("secure")));
//! let client = ApiClient::new("http://127.0.0.1:8030", tokens);
//! let conversations = client.list_conversations().await?;
//! # Ok(())
//! # }
//! ```
mod client;
pub mod sse;
pub mod wire;

pub use client::ApiClient;
pub use sse::{SseDecoder, StreamEvent, decode_events};
pub use wire::{
    ConversationSummary, HistoryEntry, KnowledgeFeedback, MessageFeedback, RemoteConversation,
    RemoteMessage,
};

use crate::config::QaSettings;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(String),

    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("resource not found")]
    NotFound,

    #[error("login expired, please sign in again")]
    Unauthorized,

    #[error("not signed in")]
    MissingToken,

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("service reported an error: {0}")]
    Server(String),

    #[error("request was cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized | ApiError::MissingToken)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Raw response body chunks, exactly as read from the network.
pub type ByteStream = BoxStream<'static, ApiResult<Vec<u8>>>;

// ============================================
// Requests
// ============================================

#[derive(Clone, Debug, Serialize)]
pub struct QaRequest {
    pub query: String,
    pub model: String,
    pub kb_name: String,
    pub use_kb: bool,
    pub history: Vec<HistoryEntry>,
    pub stream: bool,
}

impl QaRequest {
    pub fn new(query: impl Into<String>, history: Vec<HistoryEntry>, settings: &QaSettings) -> Self {
        Self {
            query: query.into(),
            model: settings.model.clone(),
            kb_name: settings.kb_name.clone(),
            use_kb: settings.use_kb,
            history,
            stream: settings.stream,
        }
    }
}

/// The file half of an upload request.
#[derive(Clone, Debug, PartialEq)]
pub enum FilePart {
    /// Content resolved to bytes before sending.
    Bytes {
        name: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
    /// Content could not be read; only the handle metadata is sent.
    Handle {
        uri: String,
        name: String,
        mime_type: String,
    },
}

impl FilePart {
    pub fn name(&self) -> &str {
        match self {
            FilePart::Bytes { name, .. } | FilePart::Handle { name, .. } => name,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub query: String,
    pub settings: QaSettings,
    pub file: FilePart,
}

/// Answer to a QA request: either an SSE body still being delivered or a
/// single JSON completion already reduced to its text.
pub enum AnswerBody {
    Streaming(ByteStream),
    Complete(String),
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    fn is_authenticated(&self) -> bool;

    async fn list_conversations(&self) -> ApiResult<Vec<ConversationSummary>>;

    async fn conversation_messages(&self, id: &str) -> ApiResult<Vec<RemoteMessage>>;

    /// Creates or replaces the conversation and returns the id the service
    /// stored it under.
    async fn save_conversation(&self, conversation: &RemoteConversation) -> ApiResult<String>;

    /// `ApiError::NotFound` when the service no longer has the conversation.
    async fn delete_conversation(&self, id: &str) -> ApiResult<()>;

    async fn ask(&self, request: &QaRequest) -> ApiResult<AnswerBody>;

    async fn ask_with_file(&self, request: &UploadRequest) -> ApiResult<AnswerBody>;

    async fn send_message_feedback(&self, feedback: &MessageFeedback) -> ApiResult<()>;

    async fn send_knowledge_feedback(&self, feedback: &KnowledgeFeedback) -> ApiResult<()>;
}
