use super::attachment::{
    Attachment, AttachmentSlot, AttachmentState, ContentResolver, FsResolver, UploadOutcome,
    resolve_payload,
};
use super::grouping::{ConversationGroup, group_by_date};
use super::session::StreamingSession;
use super::sync::{
    SnapshotState, SyncEngine, SyncResult, SyncSnapshot, SyncStatus, SyncTarget, SyncTicket,
};
use super::{ChatError, ChatResult};
use crate::api::{
    AnswerBody, ApiClient, ApiError, ConversationSummary, HistoryEntry, KnowledgeFeedback,
    MessageFeedback, QaRequest, RemoteConversation, RemoteMessage, RemoteService, StreamEvent,
    UploadRequest, decode_events,
};
use crate::auth::TokenStore;
use crate::config::ClientConfig;
use crate::storage::{ConversationCache, StorageResult};
use crate::types::{
    Citation, Conversation, Feedback, FeedbackKind, Message, Role, WELCOME_MESSAGE_ID,
    next_timestamp,
};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const CANCELLED_TEXT: &str = "Answer cancelled.";
const UNTITLED: &str = "New conversation";
const ATTACHMENT_ONLY_QUERY: &str = "Please answer based on the attached file.";
const FILE_PREFIX: &str = "[File: ";

/// Progress of one answer, in the order it happened.
#[derive(Clone, Debug)]
pub enum StreamUpdate {
    Content { content: String, thinking: String },
    Citations(Vec<Citation>),
    Completed(Message),
    Failed(ApiError),
}

/// Pull-based answer: nothing is requested until the stream is polled, and
/// dropping it finalizes the answer as cancelled.
pub type AnswerStream = BoxStream<'static, StreamUpdate>;

#[derive(Clone, Debug, PartialEq)]
pub enum MessageSource {
    Cache,
    Remote,
    CacheFallback(ApiError),
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub source: MessageSource,
}

/// How a local write fared on the server.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteStatus {
    Synced,
    /// The server had already dropped the conversation.
    AlreadyGone,
    /// Nothing to send: never pushed, not signed in, or waiting for the
    /// server history before the conversation can be pushed.
    LocalOnly,
    Failed(ApiError),
}

#[derive(Clone, Debug)]
pub struct FeedbackOutcome {
    pub feedback: Option<Feedback>,
    pub remote: RemoteStatus,
}

// ============================================
// State
// ============================================

#[derive(Default)]
struct ChatState {
    /// Most recently updated first.
    conversations: Vec<Conversation>,
    current_id: Option<String>,
    /// System notices shown in the active view; never persisted.
    notices: Vec<Message>,
    attachment: AttachmentSlot,
    disposed: bool,
}

impl ChatState {
    fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|conv| conv.id == id)
    }

    fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|conv| conv.id == id)
    }

    fn current(&self) -> Option<&Conversation> {
        self.current_id.as_deref().and_then(|id| self.conversation(id))
    }

    fn is_current(&self, id: &str) -> bool {
        self.current_id.as_deref() == Some(id)
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    fn last_view_timestamp(&self) -> Option<OffsetDateTime> {
        let last_message = self.current().and_then(Conversation::last_timestamp);
        let last_notice = self.notices.last().map(|notice| notice.timestamp);
        last_message.max(last_notice)
    }

    fn push_notice(&mut self, text: String) {
        let timestamp = next_timestamp(self.last_view_timestamp());
        self.notices.push(Message::new(Role::System, text, timestamp));
    }

    fn reset_view(&mut self) {
        self.current_id = None;
        self.notices.clear();
        self.attachment.clear();
    }

    fn view(&self, welcome: &str) -> Vec<Message> {
        let mut messages = vec![Message::welcome(welcome)];
        if let Some(conversation) = self.current() {
            messages.extend(
                conversation
                    .messages
                    .iter()
                    .filter(|msg| !is_onboarding(msg, welcome))
                    .cloned(),
            );
        }
        messages.extend(self.notices.iter().cloned());
        messages.sort_by_key(|msg| msg.timestamp);
        messages
    }
}

fn is_onboarding(message: &Message, welcome: &str) -> bool {
    message.role == Role::System
        || message.id == WELCOME_MESSAGE_ID
        || message.content.trim() == welcome.trim()
}

fn strip_file_prefix(content: &str) -> &str {
    content
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.split_once(']'))
        .map(|(_, question)| question.trim_start())
        .unwrap_or(content)
}

/// Server messages in display order with strictly increasing timestamps.
fn normalize_remote_messages(
    remote: Vec<RemoteMessage>,
    fallback: OffsetDateTime,
    welcome: &str,
) -> Vec<Message> {
    let mut messages: Vec<Message> = remote
        .into_iter()
        .filter_map(|msg| msg.into_message(fallback))
        .filter(|msg| !is_onboarding(msg, welcome))
        .collect();
    messages.sort_by_key(|msg| msg.timestamp);
    for message in &mut messages {
        message.loading = false;
    }
    enforce_increasing(&mut messages);
    messages
}

/// Bumps colliding timestamps of an already sorted list.
fn enforce_increasing(messages: &mut [Message]) {
    let mut previous: Option<OffsetDateTime> = None;
    for message in messages {
        if let Some(prev) = previous {
            if message.timestamp <= prev {
                message.timestamp = prev + Duration::milliseconds(1);
            }
        }
        previous = Some(message.timestamp);
    }
}

/// Folds the fetched server history into a conversation. Messages added on
/// this device in the meantime are kept; returns how many there were.
fn merge_history(conversation: &mut Conversation, fetched: Vec<Message>) -> usize {
    let known: HashSet<String> = fetched.iter().map(|msg| msg.id.clone()).collect();
    let local: Vec<Message> = std::mem::take(&mut conversation.messages)
        .into_iter()
        .filter(|msg| !known.contains(&msg.id))
        .collect();
    let local_count = local.len();

    let mut merged = fetched;
    merged.extend(local);
    merged.sort_by_key(|msg| msg.timestamp);
    enforce_increasing(&mut merged);
    conversation.messages = merged;
    conversation.history_loaded = true;
    local_count
}

/// Folds the server's conversation list into local state. Local messages and
/// unsynced conversations always survive; a synced conversation the server no
/// longer lists was deleted elsewhere and is dropped unless it is open.
fn merge_remote_list(state: &mut ChatState, summaries: Vec<ConversationSummary>) {
    let now = OffsetDateTime::now_utc();
    let listed: HashSet<String> = summaries.iter().map(|s| s.id.clone()).collect();
    let current = state.current_id.clone();
    state.conversations.retain(|conv| match &conv.server_id {
        Some(server_id) if conv.synced && current.as_deref() != Some(conv.id.as_str()) => {
            listed.contains(server_id)
        }
        _ => true,
    });

    for summary in summaries {
        let created_at = summary.created_at();
        let updated_at = summary.updated_at();
        let title = summary.title.filter(|title| !title.trim().is_empty());
        let existing = state.conversations.iter_mut().find(|conv| {
            conv.server_id.as_deref() == Some(summary.id.as_str()) || conv.id == summary.id
        });
        match existing {
            Some(local) => {
                if local.server_id.is_none() {
                    local.server_id = Some(summary.id.clone());
                }
                if local.synced {
                    if let Some(title) = title {
                        local.title = title;
                    }
                    if let Some(updated_at) = updated_at.filter(|ts| *ts > local.updated_at) {
                        local.updated_at = updated_at;
                    }
                }
            }
            None => {
                let created_at = created_at.or(updated_at).unwrap_or(now);
                state.conversations.push(Conversation {
                    id: summary.id.clone(),
                    server_id: Some(summary.id),
                    title: title.unwrap_or_else(|| UNTITLED.to_string()),
                    created_at,
                    updated_at: updated_at.unwrap_or(created_at),
                    messages: Vec::new(),
                    synced: true,
                    revision: 0,
                    history_loaded: false,
                });
            }
        }
    }
}

// ============================================
// Store
// ============================================

struct Inner {
    config: ClientConfig,
    remote: Arc<dyn RemoteService>,
    cache: ConversationCache,
    resolver: Arc<dyn ContentResolver>,
    sync: Arc<SyncEngine>,
    state: Mutex<ChatState>,
}

impl Inner {
    fn lock(&self) -> ChatResult<MutexGuard<'_, ChatState>> {
        let state = self.state.lock();
        if state.disposed {
            return Err(ChatError::Disposed);
        }
        Ok(state)
    }

    fn ensure_live(&self) -> ChatResult<()> {
        self.lock().map(drop)
    }

    fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    fn welcome(&self) -> &str {
        &self.config.welcome_text
    }

    fn persist(&self, state: &ChatState) -> StorageResult<()> {
        self.cache.save(&state.conversations)
    }

    fn persist_logged(&self, state: &ChatState) {
        if let Err(err) = self.persist(state) {
            tracing::error!(error = %err, "failed to write conversation cache");
        }
    }

    fn notice(&self, text: String) {
        let mut state = self.state.lock();
        if !state.disposed {
            state.push_notice(text);
        }
    }

    fn request_sync(self: &Arc<Self>, conversation_id: &str) -> SyncTicket {
        let target: Arc<dyn SyncTarget> = self.clone();
        self.sync.request(target, conversation_id)
    }

    /// Mirrors in-progress answer text into the message. Not persisted.
    fn write_progress(&self, session: &StreamingSession) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        let Some(message) = state
            .conversation_mut(session.conversation_id())
            .and_then(|conv| conv.find_message_mut(session.message_id()))
        else {
            return;
        };
        message.content = session.content().to_string();
        message.thinking = session.thinking().to_string();
        message.citations = session.citations().to_vec();
    }

    /// Writes the terminal state of an answer, releases the attachment and
    /// persists. `None` when the message is gone or the store disposed.
    fn finish_answer(
        &self,
        session: &StreamingSession,
        error: Option<&ApiError>,
        uses_attachment: bool,
    ) -> Option<Message> {
        let mut state = self.state.lock();
        if state.disposed {
            return None;
        }
        if uses_attachment {
            state.attachment.finish(match error {
                None => UploadOutcome::Delivered,
                Some(_) => UploadOutcome::Failed,
            });
        }

        let now = OffsetDateTime::now_utc();
        let conversation = state.conversation_mut(session.conversation_id())?;
        let message = conversation.find_message_mut(session.message_id())?;
        message.content = session.content().to_string();
        message.thinking = session.thinking().to_string();
        message.citations = session.citations().to_vec();
        message.loading = false;
        if message.content.is_empty() {
            match error {
                Some(ApiError::Cancelled) => message.content = CANCELLED_TEXT.to_string(),
                Some(err) => message.content = format!("Error: {err}"),
                None => {}
            }
        }
        let snapshot = message.clone();
        conversation.touch(now);

        if let Some(err) = error.filter(|err| **err != ApiError::Cancelled) {
            if state.is_current(session.conversation_id()) {
                state.push_notice(format!("Failed to get an answer: {err}"));
            }
        }
        state.sort();
        self.persist_logged(&state);
        Some(snapshot)
    }
}

impl SyncTarget for Inner {
    fn sync_snapshot(&self, id: &str) -> SnapshotState {
        let state = self.state.lock();
        if state.disposed {
            return SnapshotState::Gone;
        }
        match state.conversation(id) {
            None => SnapshotState::Gone,
            Some(conversation) if conversation.needs_history() => SnapshotState::Deferred,
            Some(conversation) => SnapshotState::Ready(SyncSnapshot {
                revision: conversation.revision,
                payload: RemoteConversation::from_conversation(conversation),
            }),
        }
    }

    fn sync_succeeded(&self, id: &str, revision: u64, server_id: &str) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        let Some(conversation) = state.conversation_mut(id) else {
            return;
        };
        conversation.server_id = Some(server_id.to_string());
        if conversation.revision == revision {
            conversation.synced = true;
        }
        self.persist_logged(&state);
    }

    fn sync_failed(&self, id: &str, _error: &ApiError) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        if let Some(conversation) = state.conversation_mut(id) {
            if conversation.synced {
                conversation.synced = false;
                self.persist_logged(&state);
            }
        }
    }
}

enum HistoryLoad {
    Cached,
    Fetched,
    Failed(ApiError),
}

struct PreparedSend {
    conversation_id: String,
    message_id: String,
    query: String,
    history: Vec<HistoryEntry>,
    attachment: Option<Attachment>,
}

/// Owns the streaming session inside an `AnswerStream`. Whatever way the
/// stream ends, the answer is finalized exactly once.
struct SessionGuard {
    inner: Arc<Inner>,
    session: StreamingSession,
    uses_attachment: bool,
}

impl SessionGuard {
    fn apply(&mut self, event: StreamEvent) -> Option<StreamUpdate> {
        match event {
            StreamEvent::Content(chunk) => {
                if !self.session.push_content(&chunk) {
                    return None;
                }
            }
            StreamEvent::Thinking(piece) => {
                let before = self.session.thinking().len();
                self.session.push_thinking(&piece);
                if self.session.thinking().len() == before {
                    return None;
                }
            }
            StreamEvent::Citations(citations) => {
                self.session.set_citations(citations.clone());
                self.inner.write_progress(&self.session);
                return Some(StreamUpdate::Citations(citations));
            }
            StreamEvent::Done | StreamEvent::Failed(_) => return None,
        }
        self.inner.write_progress(&self.session);
        Some(StreamUpdate::Content {
            content: self.session.content().to_string(),
            thinking: self.session.thinking().to_string(),
        })
    }

    fn complete(&mut self) -> StreamUpdate {
        self.session.complete();
        let finished = self
            .inner
            .finish_answer(&self.session, None, self.uses_attachment);
        tracing::info!(
            conversation_id = self.session.conversation_id(),
            message_id = self.session.message_id(),
            chars = self.session.content().chars().count(),
            "answer completed"
        );
        match finished {
            Some(message) => {
                self.inner.request_sync(self.session.conversation_id());
                StreamUpdate::Completed(message)
            }
            None => StreamUpdate::Completed(self.snapshot()),
        }
    }

    fn fail(&mut self, error: ApiError) -> StreamUpdate {
        tracing::warn!(
            conversation_id = self.session.conversation_id(),
            message_id = self.session.message_id(),
            error = %error,
            "answer failed"
        );
        self.session.fail();
        self.inner
            .finish_answer(&self.session, Some(&error), self.uses_attachment);
        StreamUpdate::Failed(error)
    }

    fn snapshot(&self) -> Message {
        let mut message = Message::new(
            Role::Assistant,
            self.session.content(),
            OffsetDateTime::now_utc(),
        );
        message.id = self.session.message_id().to_string();
        message.thinking = self.session.thinking().to_string();
        message.citations = self.session.citations().to_vec();
        message
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.session.state().is_terminal() {
            return;
        }
        self.session.cancel();
        tracing::info!(
            conversation_id = self.session.conversation_id(),
            message_id = self.session.message_id(),
            "answer stream dropped before completion"
        );
        self.inner.finish_answer(
            &self.session,
            Some(&ApiError::Cancelled),
            self.uses_attachment,
        );
    }
}

/// Authoritative conversation state for one signed-in client.
///
/// Cheap to clone; all clones share the same state. Every mutation is applied
/// in memory and written to the cache before the call returns; remote writes
/// follow in the background.
#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<Inner>,
}

impl ChatStore {
    pub fn new(
        config: ClientConfig,
        remote: Arc<dyn RemoteService>,
        cache: ConversationCache,
        resolver: Arc<dyn ContentResolver>,
    ) -> Self {
        let mut conversations = cache.load();
        let mut repaired = 0usize;
        for conversation in &mut conversations {
            conversation.messages.retain(|msg| msg.role != Role::System);
            for message in conversation.messages.iter_mut().filter(|msg| msg.loading) {
                message.loading = false;
                if message.content.is_empty() {
                    message.content = CANCELLED_TEXT.to_string();
                }
                repaired += 1;
            }
        }

        let mut state = ChatState {
            conversations,
            ..ChatState::default()
        };
        state.sort();
        if repaired > 0 {
            tracing::warn!(count = repaired, "cleared answers left loading by a previous run");
            if let Err(err) = cache.save(&state.conversations) {
                tracing::error!(error = %err, "failed to write conversation cache");
            }
        }
        tracing::info!(conversations = state.conversations.len(), "chat store ready");

        let sync = Arc::new(SyncEngine::new(Arc::clone(&remote)));
        Self {
            inner: Arc::new(Inner {
                config,
                remote,
                cache,
                resolver,
                sync,
                state: Mutex::new(state),
            }),
        }
    }

    /// Store wired to the HTTP client, the file-backed cache and the
    /// filesystem resolver.
    pub fn open(config: ClientConfig) -> Self {
        let tokens = TokenStore::new(Arc::new(config.store("secure")));
        let cache = ConversationCache::new(Arc::new(config.store("storage")));
        let remote = Arc::new(ApiClient::from_config(&config, tokens));
        Self::new(config, remote, cache, Arc::new(FsResolver))
    }

    /// Stops all further state mutation. Streams still running finish
    /// without touching the store.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        if !state.disposed {
            state.disposed = true;
            tracing::info!("chat store disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    // ---- accessors ----

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.lock().conversations.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.inner.state.lock().conversation(id).cloned()
    }

    /// The active view: welcome message, current conversation, notices.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().view(self.inner.welcome())
    }

    pub fn current_conversation_id(&self) -> Option<String> {
        self.inner.state.lock().current_id.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner
            .state
            .lock()
            .current()
            .is_some_and(Conversation::has_pending_answer)
    }

    pub fn pending_attachment(&self) -> Option<Attachment> {
        self.inner.state.lock().attachment.pending().cloned()
    }

    pub fn attachment_state(&self) -> AttachmentState {
        self.inner.state.lock().attachment.state()
    }

    pub fn grouped_conversations(&self, now: OffsetDateTime) -> Vec<ConversationGroup> {
        group_by_date(&self.inner.state.lock().conversations, now)
    }

    // ---- attachments ----

    pub fn attach(&self, attachment: Attachment) -> ChatResult<()> {
        self.inner.lock()?.attachment.attach(attachment)
    }

    pub fn remove_attachment(&self) -> ChatResult<bool> {
        Ok(self.inner.lock()?.attachment.clear())
    }

    // ---- conversations ----

    /// Starts a blank view. The conversation itself is created by the first
    /// message sent from it.
    pub fn create_conversation(&self) -> ChatResult<Vec<Message>> {
        let mut state = self.inner.lock()?;
        state.reset_view();
        Ok(state.view(self.inner.welcome()))
    }

    pub async fn select_conversation(&self, id: &str) -> ChatResult<Selection> {
        {
            let mut state = self.inner.lock()?;
            if state.conversation(id).is_none() {
                return Err(ChatError::ConversationNotFound(id.to_string()));
            }
            state.current_id = Some(id.to_string());
            state.notices.clear();
            state.attachment.clear();
        }

        let source = match self.load_history(id).await? {
            HistoryLoad::Cached => MessageSource::Cache,
            HistoryLoad::Fetched => MessageSource::Remote,
            HistoryLoad::Failed(err) => {
                let mut state = self.inner.lock()?;
                if state.is_current(id) {
                    state.push_notice(format!("Could not load messages from the server: {err}"));
                }
                MessageSource::CacheFallback(err)
            }
        };

        let welcome = self.inner.welcome();
        let state = self.inner.lock()?;
        let messages = if state.is_current(id) {
            state.view(welcome)
        } else {
            let mut messages = vec![Message::welcome(welcome)];
            if let Some(conversation) = state.conversation(id) {
                messages.extend(conversation.messages.iter().cloned());
            }
            messages
        };
        Ok(Selection {
            conversation_id: id.to_string(),
            messages,
            source,
        })
    }

    /// Fetches and merges the server history of a server-backed
    /// conversation that has not been loaded yet.
    async fn load_history(&self, id: &str) -> ChatResult<HistoryLoad> {
        let (server_id, created_at) = {
            let state = self.inner.lock()?;
            let conversation = state
                .conversation(id)
                .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
            match &conversation.server_id {
                Some(server_id) if !conversation.history_loaded => {
                    (server_id.clone(), conversation.created_at)
                }
                _ => return Ok(HistoryLoad::Cached),
            }
        };

        let fetched = self.inner.remote.conversation_messages(&server_id).await;
        let push = {
            let mut state = self.inner.lock()?;
            let welcome = self.inner.welcome();
            let conversation = state
                .conversation_mut(id)
                .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
            let remote = match fetched {
                Ok(remote) => remote,
                Err(err) => {
                    tracing::warn!(conversation_id = id, error = %err, "message fetch failed; using cache");
                    return Ok(HistoryLoad::Failed(err));
                }
            };

            let messages = normalize_remote_messages(remote, created_at, welcome);
            let fetched_count = messages.len();
            let local_count = merge_history(conversation, messages);
            let push = local_count > 0 && !conversation.synced && !conversation.has_pending_answer();
            tracing::debug!(
                conversation_id = id,
                fetched = fetched_count,
                local = local_count,
                "server history merged"
            );
            self.inner.persist_logged(&state);
            push
        };
        if push {
            self.inner.request_sync(id);
        }
        Ok(HistoryLoad::Fetched)
    }

    /// Removes the conversation locally, then best-effort on the server.
    /// The local delete is never rolled back.
    pub async fn delete_conversation(&self, id: &str) -> ChatResult<RemoteStatus> {
        let server_id = {
            let mut state = self.inner.lock()?;
            let index = state
                .conversations
                .iter()
                .position(|conv| conv.id == id)
                .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
            let removed = state.conversations.remove(index);
            if state.is_current(id) {
                state.reset_view();
            }
            self.inner.persist(&state)?;
            tracing::info!(conversation_id = id, "conversation deleted locally");
            removed.server_id
        };

        let Some(server_id) = server_id else {
            return Ok(RemoteStatus::LocalOnly);
        };
        if !self.inner.remote.is_authenticated() {
            return Ok(RemoteStatus::LocalOnly);
        }

        match self.inner.remote.delete_conversation(&server_id).await {
            Ok(()) => Ok(RemoteStatus::Synced),
            Err(ApiError::NotFound) => {
                tracing::debug!(conversation_id = id, "server copy already gone");
                Ok(RemoteStatus::AlreadyGone)
            }
            Err(err) => {
                tracing::warn!(conversation_id = id, error = %err, "remote delete failed");
                self.inner.notice(format!(
                    "Deleted on this device, but the server copy could not be removed: {err}"
                ));
                Ok(RemoteStatus::Failed(err))
            }
        }
    }

    /// Refreshes the list from the server, falling back to the cache.
    pub async fn load_conversations(&self) -> ChatResult<MessageSource> {
        self.inner.ensure_live()?;
        if !self.inner.remote.is_authenticated() {
            return Ok(MessageSource::Cache);
        }
        let summaries = match self.inner.remote.list_conversations().await {
            Ok(summaries) => summaries,
            Err(err) => {
                tracing::warn!(error = %err, "conversation list fetch failed; using cache");
                return Ok(MessageSource::CacheFallback(err));
            }
        };

        let mut state = self.inner.lock()?;
        let listed = summaries.len();
        merge_remote_list(&mut state, summaries);
        state.sort();
        self.inner.persist_logged(&state);
        tracing::info!(listed, total = state.conversations.len(), "conversation list refreshed");
        Ok(MessageSource::Remote)
    }

    /// Pushes the conversation now and waits for the result. A conversation
    /// whose server history is still missing is loaded first; if that fails
    /// nothing is pushed.
    pub async fn retry_sync(&self, id: &str) -> ChatResult<SyncResult> {
        if let HistoryLoad::Failed(err) = self.load_history(id).await? {
            return Ok(Err(err));
        }
        Ok(self.inner.request_sync(id).wait().await)
    }

    // ---- feedback ----

    /// Sets feedback on a message; choosing the current kind again clears
    /// it. The change is saved locally first and then pushed.
    pub async fn record_feedback(
        &self,
        message_id: &str,
        kind: FeedbackKind,
        reason: Option<&str>,
    ) -> ChatResult<FeedbackOutcome> {
        let (conversation_id, feedback) = {
            let mut state = self.inner.lock()?;
            let conversation = state
                .conversations
                .iter_mut()
                .find(|conv| conv.messages.iter().any(|msg| msg.id == message_id))
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            let message = conversation
                .find_message_mut(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;

            let next = match (message.feedback.as_ref().map(Feedback::kind), kind) {
                (Some(existing), requested) if existing == requested => None,
                (_, FeedbackKind::Like) => Some(Feedback::Like),
                (_, FeedbackKind::Dislike) => {
                    let reason = reason.map(str::trim).unwrap_or_default();
                    if reason.is_empty() {
                        return Err(ChatError::FeedbackReasonRequired);
                    }
                    Some(Feedback::Dislike {
                        reason: reason.to_string(),
                    })
                }
            };
            message.feedback = next.clone();
            conversation.mark_dirty();
            let conversation_id = conversation.id.clone();
            self.inner.persist_logged(&state);
            (conversation_id, next)
        };
        tracing::debug!(
            conversation_id = %conversation_id,
            message_id,
            feedback = ?feedback.as_ref().map(Feedback::kind),
            "feedback recorded"
        );

        if !self.inner.remote.is_authenticated() {
            return Ok(FeedbackOutcome {
                feedback,
                remote: RemoteStatus::LocalOnly,
            });
        }

        let pushed = self.inner.request_sync(&conversation_id).wait().await;
        let posted = match &feedback {
            Some(set) => {
                let payload =
                    MessageFeedback::new(message_id, set.kind(), set.reason().unwrap_or_default());
                self.inner.remote.send_message_feedback(&payload).await
            }
            None => Ok(()),
        };

        let remote = match (pushed, posted) {
            (Ok(SyncStatus::Deferred), Ok(())) => RemoteStatus::LocalOnly,
            (Ok(_), Ok(())) => RemoteStatus::Synced,
            (Err(err), _) | (Ok(_), Err(err)) => {
                tracing::warn!(message_id, error = %err, "feedback not delivered");
                self.inner
                    .notice(format!("Feedback saved on this device but not sent: {err}"));
                RemoteStatus::Failed(err)
            }
        };
        Ok(FeedbackOutcome { feedback, remote })
    }

    /// Reports whether an answer was correct to the knowledge base, with an
    /// optional corrected answer.
    pub async fn submit_correction(
        &self,
        message_id: &str,
        correct: bool,
        correction: &str,
    ) -> ChatResult<()> {
        let correction = correction.trim();
        if !correct && correction.is_empty() {
            return Err(ChatError::FeedbackReasonRequired);
        }
        let payload = {
            let state = self.inner.lock()?;
            let (conversation, index) = state
                .conversations
                .iter()
                .find_map(|conv| {
                    conv.messages
                        .iter()
                        .position(|msg| msg.id == message_id)
                        .map(|index| (conv, index))
                })
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            let question = conversation.messages[..index]
                .iter()
                .rev()
                .find(|msg| msg.role == Role::User)
                .map(|msg| strip_file_prefix(&msg.content).to_string())
                .unwrap_or_default();
            KnowledgeFeedback::new(
                question,
                conversation.messages[index].content.clone(),
                correct,
                correction,
                self.inner.config.qa.kb_name.clone(),
            )
        };

        if let Err(err) = self.inner.remote.send_knowledge_feedback(&payload).await {
            tracing::warn!(message_id, error = %err, "correction not delivered");
            self.inner
                .notice(format!("Correction could not be sent: {err}"));
            return Err(err.into());
        }
        tracing::info!(message_id, correct, "correction submitted");
        Ok(())
    }

    // ---- sending ----

    /// Appends the question and an answer placeholder, then returns the
    /// stream that fetches the answer.
    pub fn send_message(&self, text: &str) -> ChatResult<AnswerStream> {
        self.send(text, true)
    }

    /// Asks the last question of the current conversation again as a new
    /// exchange. Earlier messages are kept.
    pub fn regenerate_last(&self) -> ChatResult<AnswerStream> {
        let question = {
            let state = self.inner.lock()?;
            state
                .current()
                .and_then(|conv| conv.messages.iter().rev().find(|msg| msg.role == Role::User))
                .map(|msg| strip_file_prefix(&msg.content).to_string())
        };
        match question.filter(|question| !question.trim().is_empty()) {
            Some(question) => self.send(&question, false),
            None => Err(ChatError::NothingToRegenerate),
        }
    }

    fn send(&self, text: &str, use_attachment: bool) -> ChatResult<AnswerStream> {
        let text = text.trim();
        let prepared = {
            let mut state = self.inner.lock()?;
            let staged =
                use_attachment && state.attachment.state() == AttachmentState::Staged;
            if text.is_empty() && !staged {
                return Err(ChatError::EmptyMessage);
            }
            if state.current().is_some_and(Conversation::has_pending_answer) {
                return Err(ChatError::StreamActive);
            }

            let attachment = if staged {
                state.attachment.take_for_send()
            } else {
                None
            };
            let conversation_id = match state.current().map(|conv| conv.id.clone()) {
                Some(id) => id,
                None => {
                    let title_source = match &attachment {
                        Some(attachment) if text.is_empty() => attachment.name.as_str(),
                        _ => text,
                    };
                    let conversation =
                        Conversation::new_local(title_source, OffsetDateTime::now_utc());
                    let id = conversation.id.clone();
                    state.conversations.insert(0, conversation);
                    state.current_id = Some(id.clone());
                    id
                }
            };

            let user_at = next_timestamp(state.last_view_timestamp());
            let answer_at = next_timestamp(Some(user_at));
            let content = match &attachment {
                Some(attachment) => format!("{FILE_PREFIX}{}] {text}", attachment.name)
                    .trim_end()
                    .to_string(),
                None => text.to_string(),
            };
            let mut user = Message::new(Role::User, content, user_at);
            user.file_info = attachment.as_ref().map(Attachment::file_info);
            let mut placeholder = Message::new(Role::Assistant, "", answer_at);
            placeholder.loading = true;
            let message_id = placeholder.id.clone();

            let mut history = Vec::new();
            if let Some(conversation) = state.conversation_mut(&conversation_id) {
                history = conversation
                    .messages
                    .iter()
                    .filter(|msg| msg.role != Role::System && !msg.loading)
                    .map(|msg| HistoryEntry {
                        role: msg.role,
                        content: msg.content.clone(),
                    })
                    .collect();
                conversation.messages.push(user);
                conversation.messages.push(placeholder);
                conversation.touch(answer_at);
            }
            state.sort();
            self.inner.persist_logged(&state);

            tracing::info!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                history = history.len(),
                with_attachment = attachment.is_some(),
                "question sent"
            );
            PreparedSend {
                conversation_id,
                message_id,
                query: if text.is_empty() {
                    ATTACHMENT_ONLY_QUERY.to_string()
                } else {
                    text.to_string()
                },
                history,
                attachment,
            }
        };
        Ok(self.answer_stream(prepared))
    }

    fn answer_stream(&self, send: PreparedSend) -> AnswerStream {
        let inner = Arc::clone(&self.inner);
        let mut guard = SessionGuard {
            inner: Arc::clone(&inner),
            session: StreamingSession::new(send.conversation_id, send.message_id),
            uses_attachment: send.attachment.is_some(),
        };
        let PreparedSend {
            query,
            history,
            attachment,
            ..
        } = send;

        Box::pin(async_stream::stream! {
            let settings = inner.config.qa.clone();
            let response = match attachment {
                Some(attachment) => {
                    let file = resolve_payload(inner.resolver.as_ref(), &attachment).await;
                    inner
                        .remote
                        .ask_with_file(&UploadRequest { query, settings, file })
                        .await
                }
                None => inner.remote.ask(&QaRequest::new(query, history, &settings)).await,
            };
            let body = match response {
                Ok(body) => body,
                Err(err) => {
                    yield guard.fail(err);
                    return;
                }
            };

            let mut events = match body {
                AnswerBody::Complete(text) => {
                    stream::iter(vec![Ok(StreamEvent::Content(text)), Ok(StreamEvent::Done)]).boxed()
                }
                AnswerBody::Streaming(bytes) => decode_events(bytes),
            };
            while let Some(item) = events.next().await {
                if inner.is_disposed() {
                    return;
                }
                match item {
                    Ok(StreamEvent::Done) => break,
                    Ok(StreamEvent::Failed(message)) => {
                        yield guard.fail(ApiError::Server(message));
                        return;
                    }
                    Ok(event) => {
                        if let Some(update) = guard.apply(event) {
                            yield update;
                        }
                    }
                    Err(err) => {
                        yield guard.fail(err);
                        return;
                    }
                }
            }
            yield guard.complete();
        })
    }
}
