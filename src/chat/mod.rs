//! Conversation state, streaming answers and background sync
//!
//! `ChatStore` is the entry point: it owns the in-memory conversation list
//! and the active message view, writes the offline cache on every mutation
//! and hands remote writes to the `SyncEngine`.
//!
//! # Architecture
//!
//! - `store` - `ChatStore`, the authoritative state and every user operation
//! - `session` - accumulator for one streamed answer
//! - `sync` - single-flight push of conversations to the server
//! - `attachment` - the single pending file and its upload lifecycle
//! - `grouping` - date buckets for the conversation list
mod attachment;
mod grouping;
mod session;
mod store;
mod sync;

pub use attachment::{
    Attachment, AttachmentSlot, AttachmentState, ContentResolver, FsResolver, UploadOutcome,
    resolve_payload,
};
pub use grouping::{ConversationGroup, DateBucket, group_by_date};
pub use session::{SessionState, StreamingSession};
pub use store::{
    AnswerStream, ChatStore, FeedbackOutcome, MessageSource, RemoteStatus, Selection,
    StreamUpdate,
};
pub use sync::{
    SnapshotState, SyncEngine, SyncResult, SyncSnapshot, SyncStatus, SyncTarget, SyncTicket,
};

use crate::api::ApiError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat store has been disposed")]
    Disposed,

    #[error("message is empty")]
    EmptyMessage,

    #[error("an answer is still being generated for this conversation")]
    StreamActive,

    #[error("conversation {0} not found")]
    ConversationNotFound(String),

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("a reason is required for this feedback")]
    FeedbackReasonRequired,

    #[error("no question to regenerate")]
    NothingToRegenerate,

    #[error("an attachment is being uploaded")]
    AttachmentBusy,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ChatResult<T> = Result<T, ChatError>;
