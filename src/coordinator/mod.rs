//! `UpdateCoordinator` — the single funnel by which diagram cells mutate.
//!
//! Spec §4.3. Both REST write handlers and the Session presenter path
//! delegate here; neither is allowed to touch a `DiagramStore` directly
//! (§9, "REST... historically bypassed the coordinator... route them
//! through it").

use crate::authz::{AggregateLookup, AuthorizationResolver};
use crate::domain::{Cell, CellsOp, DiagramId, Role, Subject};
use crate::errors::CoreError;
use crate::storage::DiagramStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// A successful commit — returned to the caller (REST handler or Session
/// message handler) so it can build a response/notification.
#[derive(Debug, Clone)]
pub struct Commit {
    pub new_version: u64,
    pub modified_at: DateTime<Utc>,
    pub cells: Vec<Cell>,
}

/// Delivered to whatever Session is registered for a diagram after a
/// successful commit, regardless of whether the write came from REST or
/// from the Session's own presenter path (spec §4.3 step 6).
#[derive(Debug, Clone)]
pub struct PostCommitNotify {
    pub diagram_id: DiagramId,
    pub new_version: u64,
    pub committed_by: Subject,
    pub cells: Vec<Cell>,
    pub op: CellsOp,
}

/// Injected by `SessionRegistry` so `UpdateCoordinator` stays a stateless,
/// freely-cloneable handle bundle (spec §5: "stateless beyond its handles
/// and is safe to call from any task").
#[async_trait::async_trait]
pub trait SessionNotifier: Send + Sync {
    async fn notify(&self, notification: PostCommitNotify);
}

/// Object-safe view of `UpdateCoordinator::apply`, used by `Session` so it
/// can call back into the coordinator without being generic over `S`/`L`/`N`
/// itself (spec §4.5, `InboundDiagramOp`).
#[async_trait::async_trait]
pub trait DiagramMutator: Send + Sync {
    async fn apply(
        &self,
        diagram_id: DiagramId,
        subject: &Subject,
        cells_op: CellsOp,
        client_known_version: Option<u64>,
    ) -> Result<Commit, CoreError>;
}

const DEFAULT_CAS_RETRY_LIMIT: u32 = 3;

#[derive(Clone)]
pub struct UpdateCoordinator<S, L, N> {
    store: Arc<S>,
    resolver: Arc<AuthorizationResolver<L>>,
    notifier: Arc<N>,
    cas_retry_limit: u32,
}

impl<S, L, N> UpdateCoordinator<S, L, N>
where
    S: DiagramStore,
    L: AggregateLookup,
    N: SessionNotifier,
{
    pub fn new(store: Arc<S>, resolver: Arc<AuthorizationResolver<L>>, notifier: Arc<N>) -> Self {
        Self {
            store,
            resolver,
            notifier,
            cas_retry_limit: DEFAULT_CAS_RETRY_LIMIT,
        }
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.cas_retry_limit = limit;
        self
    }

    /// Apply `cells_op` to `diagram_id` on behalf of `subject`.
    ///
    /// `client_known_version`: REST clients may omit this (`None`); socket
    /// clients always supply it (spec §4.3 step 3).
    pub async fn apply(
        &self,
        diagram_id: DiagramId,
        subject: &Subject,
        cells_op: CellsOp,
        client_known_version: Option<u64>,
    ) -> Result<Commit, CoreError> {
        // Step 1: load once to find the parent aggregate, then check role.
        let probe = self.store.load(diagram_id).await?;
        self.resolver
            .require(subject, probe.aggregate_id, Role::Writer)
            .await?;

        let mut attempt = 0u32;
        loop {
            // Step 2
            let diagram = self.store.load(diagram_id).await?;

            // Step 3
            if let Some(known) = client_known_version {
                if known != diagram.update_vector {
                    return Err(CoreError::Stale(diagram.update_vector));
                }
            }

            // Step 4
            let new_cells = cells_op
                .apply(&diagram.cells)
                .map_err(CoreError::InvalidPatch)?;

            // Step 5
            match self
                .store
                .compare_and_swap(diagram_id, diagram.update_vector, new_cells.clone())
                .await
            {
                Ok((new_version, modified_at)) => {
                    info!(
                        diagram_id = %diagram_id,
                        new_version,
                        committed_by = %subject,
                        "diagram commit"
                    );

                    self.notifier
                        .notify(PostCommitNotify {
                            diagram_id,
                            new_version,
                            committed_by: subject.clone(),
                            cells: new_cells.clone(),
                            op: cells_op.clone(),
                        })
                        .await;

                    return Ok(Commit {
                        new_version,
                        modified_at,
                        cells: new_cells,
                    });
                }
                Err(CoreError::VersionConflict(current)) => {
                    attempt += 1;
                    if attempt >= self.cas_retry_limit {
                        return Err(CoreError::Stale(current));
                    }
                    warn!(diagram_id = %diagram_id, attempt, current, "CAS retry");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[async_trait::async_trait]
impl<S, L, N> DiagramMutator for UpdateCoordinator<S, L, N>
where
    S: DiagramStore,
    L: AggregateLookup,
    N: SessionNotifier,
{
    async fn apply(
        &self,
        diagram_id: DiagramId,
        subject: &Subject,
        cells_op: CellsOp,
        client_known_version: Option<u64>,
    ) -> Result<Commit, CoreError> {
        UpdateCoordinator::apply(self, diagram_id, subject, cells_op, client_known_version).await
    }
}
