//! `SessionRegistry` — one Session actor per diagram, created on demand.
//!
//! Spec §4.4 / §5. Mirrors the lazy per-key actor registry this codebase
//! keeps for run sessions (`session::SessionManager`): a single mutex
//! around a map of handles, `get_or_create` spawning the actor task the
//! first time a diagram is touched and reaping it once its last
//! participant has left for longer than the grace period.

use crate::authz::AggregateLookup;
use crate::coordinator::{DiagramMutator, PostCommitNotify, SessionNotifier, UpdateCoordinator};
use crate::domain::DiagramId;
use crate::session::{Session, SessionHandle, SessionMessage};
use crate::storage::DiagramStore;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Registry of live Session actors, keyed by diagram.
///
/// `mutator` is wired in after construction (`set_mutator`), since the
/// coordinator it points at is itself constructed with this registry as
/// its `SessionNotifier` — the two hold a deliberate back-reference,
/// broken by two-phase init instead of an `Rc`-style cycle.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<DiagramId, SessionHandle>>,
    outbound_queue_capacity: usize,
    grace_period: Duration,
    mutator: OnceLock<Arc<dyn DiagramMutator>>,
}

impl SessionRegistry {
    pub fn new(outbound_queue_capacity: usize, grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            outbound_queue_capacity,
            grace_period,
            mutator: OnceLock::new(),
        })
    }

    /// Complete the registry's wiring once the coordinator that mutates
    /// diagrams on its behalf exists. Must be called exactly once, before
    /// the first `get_or_create`.
    pub fn set_mutator(&self, mutator: Arc<dyn DiagramMutator>) {
        let _ = self.mutator.set(mutator);
    }

    /// Return the handle for `diagram_id`'s Session actor, spawning it if
    /// this is the first participant to touch the diagram (spec §4.4).
    pub async fn get_or_create(self: &Arc<Self>, diagram_id: DiagramId) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&diagram_id) {
            if !handle.mailbox.is_closed() {
                return handle.clone();
            }
        }

        let mutator = self
            .mutator
            .get()
            .expect("SessionRegistry::set_mutator must run before the first session is created")
            .clone();
        let handle = Session::spawn(
            diagram_id,
            self.outbound_queue_capacity,
            self.grace_period,
            self.clone(),
            mutator,
        );
        info!(diagram_id = %diagram_id, "session spawned");
        sessions.insert(diagram_id, handle.clone());
        handle
    }

    pub async fn get(&self, diagram_id: DiagramId) -> Option<SessionHandle> {
        self.sessions.lock().await.get(&diagram_id).cloned()
    }

    /// Drop the registry's handle to a diagram's Session, called by the
    /// Session itself once its inactivity timer fires with zero
    /// participants (spec §4.5, `InactivityTick`).
    pub async fn reap(&self, diagram_id: DiagramId) {
        self.sessions.lock().await.remove(&diagram_id);
        info!(diagram_id = %diagram_id, "session reaped");
    }
}

/// Forwards post-commit notifications from the `UpdateCoordinator` to
/// whichever Session owns the diagram, if any is currently live. A commit
/// that lands while no Session is running (e.g. REST write with nobody
/// connected) has nothing to notify — the next connection's handshake
/// will simply load current state.
#[async_trait::async_trait]
impl SessionNotifier for SessionRegistry {
    async fn notify(&self, notification: PostCommitNotify) {
        if let Some(handle) = self.get(notification.diagram_id).await {
            let _ = handle
                .mailbox
                .send(SessionMessage::PostCommitNotify(notification))
                .await;
        }
    }
}

/// Convenience alias for the coordinator type this crate actually wires
/// up: a durable store doubling as the authorization lookup, notifying
/// through the registry.
pub type CoreUpdateCoordinator<S> = UpdateCoordinator<S, Arc<S>, SessionRegistry>;

/// Build the coordinator with the default CAS retry limit and finish
/// wiring the registry's back-reference to it.
pub fn build_coordinator<S>(store: Arc<S>, registry: Arc<SessionRegistry>) -> Arc<CoreUpdateCoordinator<S>>
where
    S: DiagramStore + AggregateLookup + 'static,
{
    let resolver = Arc::new(crate::authz::AuthorizationResolver::new(store.clone()));
    let coordinator = Arc::new(UpdateCoordinator::new(store, resolver, registry.clone()));
    registry.set_mutator(coordinator.clone());
    coordinator
}

/// Same wiring as `build_coordinator`, with an explicit CAS retry limit
/// (spec.md §4.3 / §9 — configurable via `CoreConfig::cas_retry_limit`).
/// Called once from `AppContext::new`.
pub fn build_coordinator_with_retry_limit<S>(
    store: Arc<S>,
    registry: Arc<SessionRegistry>,
    retry_limit: u32,
) -> Arc<CoreUpdateCoordinator<S>>
where
    S: DiagramStore + AggregateLookup + 'static,
{
    let resolver = Arc::new(crate::authz::AuthorizationResolver::new(store.clone()));
    let coordinator = Arc::new(
        UpdateCoordinator::new(store, resolver, registry.clone()).with_retry_limit(retry_limit),
    );
    registry.set_mutator(coordinator.clone());
    coordinator
}
