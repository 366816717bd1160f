//! Integration tests for the chat store
//!
//! Drives `ChatStore` against a scripted in-memory remote service

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kbchat::api::{
    AnswerBody, ApiError, ApiResult, ConversationSummary, FilePart, KnowledgeFeedback,
    MessageFeedback, QaRequest, RemoteConversation, RemoteMessage, RemoteService, UploadRequest,
};
use kbchat::chat::{
    Attachment, AttachmentState, ChatError, ChatStore, ContentResolver, MessageSource,
    RemoteStatus, StreamUpdate, SyncStatus,
};
use kbchat::config::ClientConfig;
use kbchat::storage::{CHAT_HISTORY_KEY, ConversationCache, KeyValueStore, MemoryStore};
use kbchat::types::{Conversation, Feedback, FeedbackKind, Message, Role};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;

// ============================================
// Fakes
// ============================================

enum Scripted {
    Sse(Vec<String>),
    /// Delivers the chunks, then never ends.
    Hanging(Vec<String>),
    Complete(String),
    Error(ApiError),
}

struct FakeRemote {
    authenticated: AtomicBool,
    answers: Mutex<VecDeque<Scripted>>,
    questions: Mutex<Vec<QaRequest>>,
    uploads: Mutex<Vec<UploadRequest>>,
    saves: Mutex<Vec<RemoteConversation>>,
    save_errors: Mutex<VecDeque<ApiError>>,
    deletes: Mutex<Vec<String>>,
    delete_error: Mutex<Option<ApiError>>,
    listed: Mutex<Vec<ConversationSummary>>,
    remote_messages: Mutex<HashMap<String, Vec<RemoteMessage>>>,
    message_feedback: Mutex<Vec<MessageFeedback>>,
    knowledge_feedback: Mutex<Vec<KnowledgeFeedback>>,
}

impl FakeRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            authenticated: AtomicBool::new(true),
            answers: Mutex::new(VecDeque::new()),
            questions: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            saves: Mutex::new(Vec::new()),
            save_errors: Mutex::new(VecDeque::new()),
            deletes: Mutex::new(Vec::new()),
            delete_error: Mutex::new(None),
            listed: Mutex::new(Vec::new()),
            remote_messages: Mutex::new(HashMap::new()),
            message_feedback: Mutex::new(Vec::new()),
            knowledge_feedback: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, answer: Scripted) {
        self.answers.lock().push_back(answer);
    }

    fn next_answer(&self) -> ApiResult<AnswerBody> {
        let bytes = |chunks: Vec<String>| -> Vec<ApiResult<Vec<u8>>> {
            chunks.into_iter().map(|chunk| Ok(chunk.into_bytes())).collect()
        };
        match self.answers.lock().pop_front() {
            Some(Scripted::Sse(chunks)) => {
                Ok(AnswerBody::Streaming(stream::iter(bytes(chunks)).boxed()))
            }
            Some(Scripted::Hanging(chunks)) => Ok(AnswerBody::Streaming(
                stream::iter(bytes(chunks)).chain(stream::pending()).boxed(),
            )),
            Some(Scripted::Complete(text)) => Ok(AnswerBody::Complete(text)),
            Some(Scripted::Error(err)) => Err(err),
            None => Err(ApiError::Transport("no scripted answer".into())),
        }
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn list_conversations(&self) -> ApiResult<Vec<ConversationSummary>> {
        Ok(self.listed.lock().clone())
    }

    async fn conversation_messages(&self, id: &str) -> ApiResult<Vec<RemoteMessage>> {
        self.remote_messages
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::Transport("offline".into()))
    }

    async fn save_conversation(&self, conversation: &RemoteConversation) -> ApiResult<String> {
        if let Some(err) = self.save_errors.lock().pop_front() {
            return Err(err);
        }
        self.saves.lock().push(conversation.clone());
        if conversation.id.starts_with("srv-") {
            Ok(conversation.id.clone())
        } else {
            Ok(format!("srv-{}", conversation.id))
        }
    }

    async fn delete_conversation(&self, id: &str) -> ApiResult<()> {
        self.deletes.lock().push(id.to_string());
        match self.delete_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn ask(&self, request: &QaRequest) -> ApiResult<AnswerBody> {
        self.questions.lock().push(request.clone());
        self.next_answer()
    }

    async fn ask_with_file(&self, request: &UploadRequest) -> ApiResult<AnswerBody> {
        self.uploads.lock().push(request.clone());
        self.next_answer()
    }

    async fn send_message_feedback(&self, feedback: &MessageFeedback) -> ApiResult<()> {
        self.message_feedback.lock().push(feedback.clone());
        Ok(())
    }

    async fn send_knowledge_feedback(&self, feedback: &KnowledgeFeedback) -> ApiResult<()> {
        self.knowledge_feedback.lock().push(feedback.clone());
        Ok(())
    }
}

/// Resolver that returns fixed bytes, or fails when none are set.
struct StaticResolver(Option<Vec<u8>>);

#[async_trait]
impl ContentResolver for StaticResolver {
    async fn read(&self, _attachment: &Attachment) -> io::Result<Vec<u8>> {
        self.0
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "revoked"))
    }
}

// ============================================
// Helpers
// ============================================

fn open_store(remote: &Arc<FakeRemote>, kv: &Arc<MemoryStore>) -> ChatStore {
    open_store_with_resolver(remote, kv, StaticResolver(Some(b"%PDF-1.7".to_vec())))
}

fn open_store_with_resolver(
    remote: &Arc<FakeRemote>,
    kv: &Arc<MemoryStore>,
    resolver: StaticResolver,
) -> ChatStore {
    ChatStore::new(
        ClientConfig::default(),
        remote.clone(),
        ConversationCache::new(kv.clone()),
        Arc::new(resolver),
    )
}

fn seed(kv: &Arc<MemoryStore>, conversations: &[Conversation]) {
    ConversationCache::new(kv.clone())
        .save(conversations)
        .expect("Failed to seed cache");
}

fn synced_conversation(server_id: &str) -> Conversation {
    let now = OffsetDateTime::now_utc();
    let mut conversation = Conversation::new_local("Seeded question", now);
    conversation.server_id = Some(server_id.to_string());
    conversation.synced = true;
    conversation
        .messages
        .push(Message::new(Role::User, "Seeded question", now));
    let mut answer = Message::new(Role::Assistant, "Seeded answer", now + time::Duration::seconds(1));
    answer.id = "m-1".to_string();
    conversation.messages.push(answer);
    conversation
}

/// Listed by the server, messages never fetched to this device.
fn server_only_conversation(server_id: &str) -> Conversation {
    let mut conversation = synced_conversation(server_id);
    conversation.messages.clear();
    conversation.history_loaded = false;
    conversation
}

fn remote_history() -> Vec<RemoteMessage> {
    serde_json::from_value(serde_json::json!([
        {"id": "r2", "type": "bot", "content": "answer", "timestamp": "2024-05-01T10:00:05"},
        {"id": "r1", "type": "user", "content": "question", "timestamp": "2024-05-01T10:00:00"}
    ]))
    .unwrap()
}

fn sse(frames: &[&str]) -> Vec<String> {
    frames.iter().map(|frame| frame.to_string()).collect()
}

fn cached(kv: &Arc<MemoryStore>) -> Vec<Conversation> {
    ConversationCache::new(kv.clone()).load()
}

fn assert_strictly_ordered(messages: &[Message]) {
    for pair in messages.windows(2) {
        assert!(
            pair[0].timestamp < pair[1].timestamp,
            "{} is not before {}",
            pair[0].id,
            pair[1].id
        );
    }
}

// ============================================
// Sending and streaming
// ============================================

mod streaming_tests {
    use super::*;

    #[tokio::test]
    async fn test_streamed_answer_is_applied_and_synced() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Sse(sse(&[
            "data: {\"content\":\"abc <think>x\"}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"y</think>def\"}}]}\n\n\
             data: {\"type\":\"citations\",\"citations\":[{\"title\":\"Handbook\"}]}\n\n",
            "data: [DONE]\n\n",
        ])));
        let store = open_store(&remote, &kv);

        let updates: Vec<StreamUpdate> = store
            .send_message("What is abc?")
            .expect("send accepted")
            .collect()
            .await;

        let contents: Vec<String> = updates
            .iter()
            .filter_map(|update| match update {
                StreamUpdate::Content { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["abc", "abcdef"]);
        match updates.last() {
            Some(StreamUpdate::Completed(message)) => {
                assert_eq!(message.content, "abcdef");
                assert_eq!(message.thinking, "xy");
                assert_eq!(message.citations.len(), 1);
                assert!(!message.loading);
            }
            other => panic!("expected completion, got {other:?}"),
        }

        let messages = store.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "What is abc?");
        assert_eq!(messages[2].content, "abcdef");
        assert_strictly_ordered(&messages);
        assert!(!store.is_streaming());

        let id = store.current_conversation_id().expect("conversation created");
        assert_eq!(cached(&kv)[0].messages.len(), 2);

        let pushed = store.retry_sync(&id).await.expect("conversation exists");
        assert_eq!(
            pushed,
            Ok(SyncStatus::Pushed {
                server_id: format!("srv-{id}")
            })
        );
        let conversation = store.conversation(&id).unwrap();
        assert!(conversation.synced);
        assert_eq!(conversation.server_id, Some(format!("srv-{id}")));
        assert!(
            remote
                .saves
                .lock()
                .iter()
                .all(|save| save.messages.iter().all(|msg| msg.role != Role::System))
        );
    }

    #[tokio::test]
    async fn test_second_send_is_rejected_before_network() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let store = open_store(&remote, &kv);

        let pending = store.send_message("first").expect("first send accepted");
        assert!(store.is_streaming());
        assert!(matches!(
            store.send_message("second"),
            Err(ChatError::StreamActive)
        ));
        assert!(remote.questions.lock().is_empty());
        drop(pending);
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let store = open_store(&remote, &kv);

        assert!(matches!(
            store.send_message("   "),
            Err(ChatError::EmptyMessage)
        ));
        assert!(store.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_interrupt_delivery() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Sse(sse(&[
            "data: {\"content\":\"Hello\"}\n\n",
            "data: {oops\n\n",
            "data: {\"content\":\", world\"}\n\n",
        ])));
        let store = open_store(&remote, &kv);

        let updates: Vec<StreamUpdate> = store.send_message("hi").unwrap().collect().await;
        match updates.last() {
            Some(StreamUpdate::Completed(message)) => assert_eq!(message.content, "Hello, world"),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_excludes_system_messages() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Complete("first answer".into()));
        remote.script(Scripted::Complete("second answer".into()));
        let store = open_store(&remote, &kv);

        let _: Vec<_> = store.send_message("first").unwrap().collect().await;
        let _: Vec<_> = store.send_message("second").unwrap().collect().await;

        let questions = remote.questions.lock();
        assert!(questions[0].history.is_empty());
        let roles: Vec<Role> = questions[1].history.iter().map(|entry| entry.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(questions[1].history[1].content, "first answer");
        assert_eq!(questions[1].model, "qa");
        assert_eq!(questions[1].kb_name, "default");
    }

    #[tokio::test]
    async fn test_failure_substitutes_error_and_adds_notice() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Error(ApiError::Status {
            status: 500,
            message: "boom".into(),
        }));
        let store = open_store(&remote, &kv);

        let updates: Vec<StreamUpdate> = store.send_message("hi").unwrap().collect().await;
        assert!(matches!(updates.as_slice(), [StreamUpdate::Failed(_)]));

        let messages = store.messages();
        let answer = &messages[messages.len() - 2];
        assert_eq!(answer.role, Role::Assistant);
        assert!(answer.content.starts_with("Error:"));
        assert!(!answer.loading);
        let notice = messages.last().unwrap();
        assert_eq!(notice.role, Role::System);
        assert!(notice.content.contains("boom"));
        assert_strictly_ordered(&messages);

        let persisted = cached(&kv);
        assert!(
            persisted[0]
                .messages
                .iter()
                .all(|msg| msg.role != Role::System && !msg.loading)
        );
    }

    #[tokio::test]
    async fn test_server_reported_failure_inside_stream() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Sse(sse(&[
            "data: {\"content\":\"partial\"}\n\n",
            "data: {\"success\":false,\"message\":\"kb offline\"}\n\n",
        ])));
        let store = open_store(&remote, &kv);

        let updates: Vec<StreamUpdate> = store.send_message("hi").unwrap().collect().await;
        assert!(matches!(
            updates.last(),
            Some(StreamUpdate::Failed(ApiError::Server(message))) if message == "kb offline"
        ));
        let messages = store.messages();
        assert_eq!(messages[messages.len() - 2].content, "partial");
    }

    #[tokio::test]
    async fn test_dropped_stream_is_finalized_as_cancelled() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Hanging(sse(&["data: {\"content\":\"partial answer\"}\n\n"])));
        let store = open_store(&remote, &kv);

        let mut answer = store.send_message("slow question").unwrap();
        let first = answer.next().await;
        assert!(matches!(first, Some(StreamUpdate::Content { .. })));
        drop(answer);

        assert!(!store.is_streaming());
        let messages = store.messages();
        let last = messages.last().unwrap();
        assert_eq!(last.content, "partial answer");
        assert!(!last.loading);
        assert!(!cached(&kv)[0].has_pending_answer());
        assert!(store.send_message("next").is_ok());
    }

    #[tokio::test]
    async fn test_regenerate_appends_new_exchange() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Complete("one".into()));
        remote.script(Scripted::Complete("two".into()));
        let store = open_store(&remote, &kv);

        assert!(matches!(
            store.regenerate_last(),
            Err(ChatError::NothingToRegenerate)
        ));
        let _: Vec<_> = store.send_message("Q1").unwrap().collect().await;
        let _: Vec<_> = store.regenerate_last().unwrap().collect().await;

        let messages = store.messages();
        let contents: Vec<&str> = messages[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Q1", "one", "Q1", "two"]);
        assert_eq!(remote.questions.lock()[1].query, "Q1");
    }
}

// ============================================
// Attachments
// ============================================

mod attachment_tests {
    use super::*;

    fn report() -> Attachment {
        Attachment::new("file:///docs/report.pdf", "report.pdf", None).with_size(8)
    }

    #[tokio::test]
    async fn test_attachment_is_uploaded_and_cleared() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Complete("It is a report.".into()));
        let store = open_store(&remote, &kv);

        store.attach(report()).unwrap();
        assert_eq!(store.attachment_state(), AttachmentState::Staged);
        let answer = store.send_message("summarize").unwrap();
        assert_eq!(store.attachment_state(), AttachmentState::Uploading);
        assert!(matches!(store.attach(report()), Err(ChatError::AttachmentBusy)));

        let _: Vec<_> = answer.collect().await;
        assert_eq!(store.attachment_state(), AttachmentState::Idle);
        assert!(store.pending_attachment().is_none());

        let uploads = remote.uploads.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].query, "summarize");
        assert!(matches!(&uploads[0].file, FilePart::Bytes { bytes, .. } if bytes == b"%PDF-1.7"));

        let user = &store.messages()[1];
        assert_eq!(user.content, "[File: report.pdf] summarize");
        assert_eq!(user.file_info.as_ref().map(|f| f.name.as_str()), Some("report.pdf"));
    }

    #[tokio::test]
    async fn test_attachment_cleared_on_failure_and_falls_back_to_metadata() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Error(ApiError::Transport("reset".into())));
        let store = open_store_with_resolver(&remote, &kv, StaticResolver(None));

        store.attach(report()).unwrap();
        let updates: Vec<_> = store.send_message("").unwrap().collect().await;
        assert!(matches!(updates.as_slice(), [StreamUpdate::Failed(_)]));
        assert_eq!(store.attachment_state(), AttachmentState::Idle);

        let uploads = remote.uploads.lock();
        assert!(matches!(&uploads[0].file, FilePart::Handle { name, .. } if name == "report.pdf"));
        assert!(!uploads[0].query.is_empty());
    }

    #[tokio::test]
    async fn test_new_conversation_drops_staged_attachment() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let store = open_store(&remote, &kv);

        store.attach(report()).unwrap();
        let view = store.create_conversation().unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(store.attachment_state(), AttachmentState::Idle);
        assert!(!store.remove_attachment().unwrap());
    }
}

// ============================================
// Conversations, delete and feedback
// ============================================

mod conversation_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_is_local_first_and_404_is_success() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let conversation = synced_conversation("srv-1");
        let id = conversation.id.clone();
        seed(&kv, &[conversation]);
        *remote.delete_error.lock() = Some(ApiError::NotFound);
        let store = open_store(&remote, &kv);

        let selection = store.select_conversation(&id).await.unwrap();
        assert_eq!(selection.source, MessageSource::Cache);
        assert_eq!(selection.messages.len(), 3);

        let status = store.delete_conversation(&id).await.unwrap();
        assert_eq!(status, RemoteStatus::AlreadyGone);
        assert_eq!(remote.deletes.lock().as_slice(), ["srv-1".to_string()]);
        assert!(store.current_conversation_id().is_none());
        assert!(cached(&kv).is_empty());
        assert!(matches!(
            store.select_conversation(&id).await,
            Err(ChatError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_remote_delete_keeps_local_delete_and_warns() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let conversation = synced_conversation("srv-2");
        let id = conversation.id.clone();
        seed(&kv, &[conversation]);
        *remote.delete_error.lock() = Some(ApiError::Status {
            status: 503,
            message: "maintenance".into(),
        });
        let store = open_store(&remote, &kv);

        let status = store.delete_conversation(&id).await.unwrap();
        assert!(matches!(status, RemoteStatus::Failed(_)));
        assert!(store.conversations().is_empty());
        let messages = store.messages();
        assert_eq!(messages.last().map(|m| m.role), Some(Role::System));
        assert!(messages.last().unwrap().content.contains("maintenance"));
    }

    #[tokio::test]
    async fn test_local_conversation_delete_skips_server() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let conversation = Conversation::new_local("draft", OffsetDateTime::now_utc());
        let id = conversation.id.clone();
        seed(&kv, &[conversation]);
        let store = open_store(&remote, &kv);

        assert_eq!(
            store.delete_conversation(&id).await.unwrap(),
            RemoteStatus::LocalOnly
        );
        assert!(remote.deletes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_select_fetches_remote_messages_once() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let conversation = server_only_conversation("srv-7");
        let id = conversation.id.clone();
        seed(&kv, &[conversation]);
        remote
            .remote_messages
            .lock()
            .insert("srv-7".into(), remote_history());
        let store = open_store(&remote, &kv);

        let selection = store.select_conversation(&id).await.unwrap();
        assert_eq!(selection.source, MessageSource::Remote);
        let ids: Vec<&str> = selection.messages[1..].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(cached(&kv)[0].messages.len(), 2);

        remote.remote_messages.lock().clear();
        let again = store.select_conversation(&id).await.unwrap();
        assert_eq!(again.source, MessageSource::Cache);
    }

    #[tokio::test]
    async fn test_select_falls_back_when_fetch_fails() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let conversation = server_only_conversation("srv-8");
        let id = conversation.id.clone();
        seed(&kv, &[conversation]);
        let store = open_store(&remote, &kv);

        let selection = store.select_conversation(&id).await.unwrap();
        assert!(matches!(selection.source, MessageSource::CacheFallback(_)));
        assert_eq!(store.current_conversation_id(), Some(id));
    }

    #[tokio::test]
    async fn test_unloaded_history_is_never_overwritten() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let conversation = server_only_conversation("srv-8");
        let id = conversation.id.clone();
        seed(&kv, &[conversation]);
        remote.script(Scripted::Complete("local answer".into()));
        let store = open_store(&remote, &kv);

        let selection = store.select_conversation(&id).await.unwrap();
        assert!(matches!(selection.source, MessageSource::CacheFallback(_)));
        let _: Vec<_> = store.send_message("follow-up").unwrap().collect().await;

        let retried = store.retry_sync(&id).await.unwrap();
        assert!(retried.is_err());
        assert!(remote.saves.lock().is_empty());
        assert!(!store.conversation(&id).unwrap().synced);

        remote
            .remote_messages
            .lock()
            .insert("srv-8".into(), remote_history());
        let pushed = store.retry_sync(&id).await.unwrap();
        assert_eq!(
            pushed,
            Ok(SyncStatus::Pushed {
                server_id: "srv-8".into()
            })
        );

        let saves = remote.saves.lock();
        let last = saves.last().unwrap();
        assert_eq!(last.id, "srv-8");
        let contents: Vec<&str> = last.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["question", "answer", "follow-up", "local answer"]);

        let conversation = store.conversation(&id).unwrap();
        assert!(conversation.synced);
        assert!(!conversation.needs_history());
        assert_eq!(conversation.messages.len(), 4);
        assert_strictly_ordered(&conversation.messages);
    }

    #[tokio::test]
    async fn test_failed_push_stays_local_until_retry() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let conversation = synced_conversation("srv-10");
        let id = conversation.id.clone();
        seed(&kv, &[conversation]);
        remote.save_errors.lock().push_back(ApiError::Status {
            status: 503,
            message: "maintenance".into(),
        });
        let store = open_store(&remote, &kv);

        let outcome = store
            .record_feedback("m-1", FeedbackKind::Like, None)
            .await
            .unwrap();
        assert!(matches!(outcome.remote, RemoteStatus::Failed(ApiError::Status { status: 503, .. })));
        assert!(remote.saves.lock().is_empty());
        let local = store.conversation(&id).unwrap();
        assert!(!local.synced);
        assert_eq!(local.messages[1].feedback, Some(Feedback::Like));
        assert_eq!(cached(&kv)[0].messages[1].feedback, Some(Feedback::Like));
        assert!(!cached(&kv)[0].synced);

        let retried = store.retry_sync(&id).await.unwrap();
        assert_eq!(
            retried,
            Ok(SyncStatus::Pushed {
                server_id: "srv-10".into()
            })
        );
        assert!(store.conversation(&id).unwrap().synced);
        assert!(cached(&kv)[0].synced);
        let saves = remote.saves.lock();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].messages[1].feedback, Some(Feedback::Like));
    }

    #[tokio::test]
    async fn test_feedback_toggles_and_requires_reason() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        seed(&kv, &[synced_conversation("srv-3")]);
        let store = open_store(&remote, &kv);

        let liked = store
            .record_feedback("m-1", FeedbackKind::Like, None)
            .await
            .unwrap();
        assert_eq!(liked.feedback, Some(Feedback::Like));
        assert_eq!(liked.remote, RemoteStatus::Synced);

        let cleared = store
            .record_feedback("m-1", FeedbackKind::Like, None)
            .await
            .unwrap();
        assert_eq!(cleared.feedback, None);

        assert!(matches!(
            store
                .record_feedback("m-1", FeedbackKind::Dislike, Some("  "))
                .await,
            Err(ChatError::FeedbackReasonRequired)
        ));

        let disliked = store
            .record_feedback("m-1", FeedbackKind::Dislike, Some("outdated"))
            .await
            .unwrap();
        assert_eq!(
            disliked.feedback,
            Some(Feedback::Dislike {
                reason: "outdated".into()
            })
        );

        let posted = remote.message_feedback.lock();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[1].feedback_type, "dislike");
        assert_eq!(posted[1].comment, "outdated");

        let saved = remote.saves.lock();
        assert_eq!(saved.last().unwrap().id, "srv-3");
        assert!(store.conversations()[0].synced);
        assert!(matches!(
            store.record_feedback("missing", FeedbackKind::Like, None).await,
            Err(ChatError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_feedback_without_token_stays_local() {
        let remote = FakeRemote::new();
        remote.authenticated.store(false, Ordering::SeqCst);
        let kv = Arc::new(MemoryStore::new());
        seed(&kv, &[synced_conversation("srv-4")]);
        let store = open_store(&remote, &kv);

        let outcome = store
            .record_feedback("m-1", FeedbackKind::Like, None)
            .await
            .unwrap();
        assert_eq!(outcome.remote, RemoteStatus::LocalOnly);
        assert!(!store.conversations()[0].synced);
        assert!(remote.saves.lock().is_empty());
    }

    #[tokio::test]
    async fn test_correction_goes_to_knowledge_base() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        seed(&kv, &[synced_conversation("srv-5")]);
        let store = open_store(&remote, &kv);

        assert!(matches!(
            store.submit_correction("m-1", false, "").await,
            Err(ChatError::FeedbackReasonRequired)
        ));
        store
            .submit_correction("m-1", false, "The policy changed in 2024.")
            .await
            .unwrap();

        let sent = remote.knowledge_feedback.lock();
        assert_eq!(sent[0].question, "Seeded question");
        assert_eq!(sent[0].answer, "Seeded answer");
        assert_eq!(sent[0].feedback_type, "incorrect");
        assert_eq!(sent[0].kb_name, "default");
    }

    #[tokio::test]
    async fn test_load_conversations_merges_server_list() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let local = Conversation::new_local("offline draft", OffsetDateTime::now_utc());
        seed(&kv, &[local.clone()]);
        *remote.listed.lock() = serde_json::from_value(serde_json::json!([
            {"id": 42, "title": "From the web", "created_at": "2024-05-01T10:00:00"}
        ]))
        .unwrap();
        let store = open_store(&remote, &kv);

        assert_eq!(store.load_conversations().await.unwrap(), MessageSource::Remote);
        let conversations = store.conversations();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].id, local.id);
        assert_eq!(conversations[1].server_id.as_deref(), Some("42"));
        assert_eq!(cached(&kv).len(), 2);
        assert!(!store.grouped_conversations(OffsetDateTime::now_utc()).is_empty());
    }
}

// ============================================
// Lifecycle
// ============================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_startup_clears_stale_loading_flags() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        let mut conversation = synced_conversation("srv-6");
        let mut stale = Message::new(
            Role::Assistant,
            "",
            OffsetDateTime::now_utc() + time::Duration::seconds(5),
        );
        stale.loading = true;
        conversation.messages.push(stale);
        seed(&kv, &[conversation]);

        let store = open_store(&remote, &kv);
        let conversation = &store.conversations()[0];
        assert!(!conversation.has_pending_answer());
        assert!(!conversation.messages.last().unwrap().content.is_empty());
        assert!(!cached(&kv)[0].has_pending_answer());
    }

    #[tokio::test]
    async fn test_disposed_store_rejects_mutations() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        seed(&kv, &[synced_conversation("srv-9")]);
        let store = open_store(&remote, &kv);
        let id = store.conversations()[0].id.clone();
        let before = kv.get(CHAT_HISTORY_KEY);

        store.dispose();
        assert!(store.is_disposed());
        assert!(matches!(store.send_message("hi"), Err(ChatError::Disposed)));
        assert!(matches!(store.create_conversation(), Err(ChatError::Disposed)));
        assert!(matches!(
            store.delete_conversation(&id).await,
            Err(ChatError::Disposed)
        ));
        assert_eq!(kv.get(CHAT_HISTORY_KEY), before);
    }

    #[tokio::test]
    async fn test_answer_after_dispose_leaves_state_untouched() {
        let remote = FakeRemote::new();
        let kv = Arc::new(MemoryStore::new());
        remote.script(Scripted::Complete("late".into()));
        let store = open_store(&remote, &kv);

        let answer = store.send_message("question").unwrap();
        let before = kv.get(CHAT_HISTORY_KEY);
        store.dispose();
        let _: Vec<_> = answer.collect().await;

        assert_eq!(kv.get(CHAT_HISTORY_KEY), before);
        assert!(store.conversations()[0].has_pending_answer());
    }
}
