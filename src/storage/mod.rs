//! Persistence collaborator: durable aggregates and diagrams.
//!
//! Spec §4.2 ("DiagramStore (contract only; persistence is a collaborator)")
//! and the design note in §9 ("express this as an abstract 'store'
//! capability... the in-memory variant is a test collaborator only").
//!
//! [`DiagramStore`] is the trait the core depends on; [`SqliteStore`] is the
//! production implementation and also satisfies [`AggregateLookup`] for the
//! authorization resolver, since both read from the same durable aggregate
//! table. [`memory::InMemoryStore`] is the in-process test double.

pub mod memory;
pub mod sqlite;

use crate::authz::AggregateLookup;
use crate::domain::{Diagram, DiagramId};
use crate::errors::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use sqlite::SqliteStore;

/// The single funnel by which diagram cells are persisted. Spec §4.2.
#[async_trait]
pub trait DiagramStore: Send + Sync {
    /// Return the current state of a diagram, or `NotFound`.
    async fn load(&self, diagram_id: DiagramId) -> Result<Diagram, CoreError>;

    /// Atomically replace `diagram.cells` iff the stored `update_vector`
    /// still equals `expected_version`. On success returns the new
    /// version and commit timestamp; on mismatch, `VersionConflict` with
    /// the version actually stored.
    async fn compare_and_swap(
        &self,
        diagram_id: DiagramId,
        expected_version: u64,
        new_cells: Vec<crate::domain::Cell>,
    ) -> Result<(u64, DateTime<Utc>), CoreError>;
}

/// Marker trait bundling the two storage capabilities the core needs from
/// one durable backend, so `AppContext` can hold a single trait object.
pub trait Store: DiagramStore + AggregateLookup {}
impl<T: DiagramStore + AggregateLookup> Store for T {}

/// Lets an `Arc<SqliteStore>` (or `Arc<InMemoryStore>`) be shared between a
/// coordinator's store handle and an `AuthorizationResolver`'s lookup
/// handle without cloning the backend itself.
#[async_trait]
impl<T: DiagramStore + ?Sized> DiagramStore for std::sync::Arc<T> {
    async fn load(&self, diagram_id: DiagramId) -> Result<Diagram, CoreError> {
        (**self).load(diagram_id).await
    }

    async fn compare_and_swap(
        &self,
        diagram_id: DiagramId,
        expected_version: u64,
        new_cells: Vec<crate::domain::Cell>,
    ) -> Result<(u64, DateTime<Utc>), CoreError> {
        (**self)
            .compare_and_swap(diagram_id, expected_version, new_cells)
            .await
    }
}
