//! In-memory test collaborator for [`DiagramStore`] and [`AggregateLookup`].
//!
//! Spec §9 design note: "the in-memory variant is a test collaborator
//! only." Used by the property tests in §8 and the unit tests throughout
//! the `session`/`coordinator` modules so they don't need a SQLite file.

use super::DiagramStore;
use crate::authz::AggregateLookup;
use crate::domain::{AggregateId, Aggregate, AuthEntry, Cell, Diagram, DiagramId, Role, Subject};
use crate::errors::CoreError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryStore {
    aggregates: RwLock<HashMap<AggregateId, Aggregate>>,
    diagrams: RwLock<HashMap<DiagramId, Diagram>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_aggregate(&self, aggregate: Aggregate) {
        self.aggregates.write().await.insert(aggregate.id, aggregate);
    }

    pub async fn insert_diagram(&self, aggregate_id: AggregateId, diagram_id: DiagramId) {
        let now = Utc::now();
        self.diagrams.write().await.insert(
            diagram_id,
            Diagram {
                id: diagram_id,
                aggregate_id,
                cells: Vec::new(),
                update_vector: 0,
                created_at: now,
                modified_at: now,
            },
        );
    }

    /// Add or replace an explicit authorization entry, used to model
    /// `AuthorizationChanged` (spec §4.5) in tests.
    pub async fn set_entry(&self, aggregate_id: AggregateId, subject: Subject, role: Option<Role>) {
        let mut guard = self.aggregates.write().await;
        if let Some(agg) = guard.get_mut(&aggregate_id) {
            agg.entries.retain(|e| e.subject != subject);
            if let Some(role) = role {
                agg.entries.push(AuthEntry { subject, role });
            }
        }
    }
}

#[async_trait]
impl DiagramStore for InMemoryStore {
    async fn load(&self, diagram_id: DiagramId) -> Result<Diagram, CoreError> {
        self.diagrams
            .read()
            .await
            .get(&diagram_id)
            .cloned()
            .ok_or(CoreError::NotFound)
    }

    async fn compare_and_swap(
        &self,
        diagram_id: DiagramId,
        expected_version: u64,
        new_cells: Vec<Cell>,
    ) -> Result<(u64, chrono::DateTime<Utc>), CoreError> {
        let mut guard = self.diagrams.write().await;
        let diagram = guard.get_mut(&diagram_id).ok_or(CoreError::NotFound)?;
        if diagram.update_vector != expected_version {
            return Err(CoreError::VersionConflict(diagram.update_vector));
        }
        diagram.cells = new_cells;
        diagram.update_vector += 1;
        diagram.modified_at = Utc::now();
        Ok((diagram.update_vector, diagram.modified_at))
    }
}

#[async_trait]
impl AggregateLookup for InMemoryStore {
    async fn aggregate_owner(&self, aggregate_id: AggregateId) -> Option<Subject> {
        self.aggregates
            .read()
            .await
            .get(&aggregate_id)
            .map(|a| a.owner.clone())
    }

    async fn aggregate_entries(&self, aggregate_id: AggregateId) -> Option<Vec<(Subject, Role)>> {
        self.aggregates.read().await.get(&aggregate_id).map(|a| {
            a.entries
                .iter()
                .map(|e| (e.subject.clone(), e.role))
                .collect()
        })
    }
}
