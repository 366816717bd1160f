//! Background push of local conversations to the remote store.
//!
//! Pushes are single-flight per conversation: while one is running, further
//! requests for the same id collapse into one follow-up push, which reads
//! the latest snapshot when it starts.

use crate::api::{ApiError, ApiResult, RemoteConversation, RemoteService};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// What the engine pushes and where it reports back. Implemented by the
/// chat store.
pub trait SyncTarget: Send + Sync + 'static {
    /// Latest state of the conversation.
    fn sync_snapshot(&self, id: &str) -> SnapshotState;

    fn sync_succeeded(&self, id: &str, revision: u64, server_id: &str);

    fn sync_failed(&self, id: &str, error: &ApiError);
}

#[derive(Clone, Debug)]
pub struct SyncSnapshot {
    pub revision: u64,
    pub payload: RemoteConversation,
}

#[derive(Clone, Debug)]
pub enum SnapshotState {
    Ready(SyncSnapshot),
    /// Must not be pushed yet: the server holds messages not merged locally.
    Deferred,
    Gone,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Pushed { server_id: String },
    /// Held back until the server history has been loaded.
    Deferred,
    /// The conversation was deleted (or the store disposed) before the push.
    Gone,
}

pub type SyncResult = ApiResult<SyncStatus>;

/// Resolves with the result of the push that covered the request.
pub struct SyncTicket {
    rx: oneshot::Receiver<SyncResult>,
}

impl SyncTicket {
    pub async fn wait(self) -> SyncResult {
        self.rx.await.unwrap_or(Err(ApiError::Cancelled))
    }
}

#[derive(Default)]
struct Flight {
    current: Vec<oneshot::Sender<SyncResult>>,
    next: Vec<oneshot::Sender<SyncResult>>,
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteService>,
    flights: Mutex<HashMap<String, Flight>>,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteService>) -> Self {
        Self {
            remote,
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.flights.lock().contains_key(id)
    }

    /// Requests a push of conversation `id`. Must be called inside a tokio
    /// runtime.
    pub fn request(self: &Arc<Self>, target: Arc<dyn SyncTarget>, id: &str) -> SyncTicket {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut flights = self.flights.lock();
            match flights.get_mut(id) {
                Some(flight) => {
                    tracing::debug!(conversation_id = id, "push in flight; queued follow-up");
                    flight.next.push(tx);
                    false
                }
                None => {
                    flights.insert(
                        id.to_string(),
                        Flight {
                            current: vec![tx],
                            next: Vec::new(),
                        },
                    );
                    true
                }
            }
        };

        if start {
            let engine = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move { engine.run(target, id).await });
        }
        SyncTicket { rx }
    }

    async fn run(self: Arc<Self>, target: Arc<dyn SyncTarget>, id: String) {
        loop {
            let result = self.push_once(target.as_ref(), &id).await;

            let (waiters, again) = {
                let mut flights = self.flights.lock();
                match flights.get_mut(&id) {
                    Some(flight) if !flight.next.is_empty() => {
                        let next = std::mem::take(&mut flight.next);
                        (std::mem::replace(&mut flight.current, next), true)
                    }
                    Some(_) => {
                        let waiters = flights
                            .remove(&id)
                            .map(|flight| flight.current)
                            .unwrap_or_default();
                        (waiters, false)
                    }
                    None => (Vec::new(), false),
                }
            };

            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
            if !again {
                break;
            }
        }
    }

    async fn push_once(&self, target: &dyn SyncTarget, id: &str) -> SyncResult {
        if !self.remote.is_authenticated() {
            tracing::debug!(conversation_id = id, "not signed in; push skipped");
            let err = ApiError::MissingToken;
            target.sync_failed(id, &err);
            return Err(err);
        }
        let snapshot = match target.sync_snapshot(id) {
            SnapshotState::Ready(snapshot) => snapshot,
            SnapshotState::Deferred => {
                tracing::debug!(conversation_id = id, "server history not loaded; push deferred");
                return Ok(SyncStatus::Deferred);
            }
            SnapshotState::Gone => return Ok(SyncStatus::Gone),
        };

        match self.remote.save_conversation(&snapshot.payload).await {
            Ok(server_id) => {
                tracing::debug!(
                    conversation_id = id,
                    server_id = %server_id,
                    revision = snapshot.revision,
                    "conversation pushed"
                );
                target.sync_succeeded(id, snapshot.revision, &server_id);
                Ok(SyncStatus::Pushed { server_id })
            }
            Err(err) => {
                tracing::warn!(conversation_id = id, error = %err, "conversation push failed");
                target.sync_failed(id, &err);
                Err(err)
            }
        }
    }
}
