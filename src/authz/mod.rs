//! `AuthorizationResolver` — pure function from (subject, aggregate) to role.
//!
//! Spec §4.1. Ownership dominates explicit entries; absence implies no
//! role at all. There is no inheritance beyond aggregate → diagram: a
//! diagram's authorization is always its parent aggregate's.

use crate::domain::{AggregateId, Role, Subject};
use crate::errors::CoreError;
use async_trait::async_trait;

/// Collaborator that can produce the aggregate an authorization decision
/// needs. Implemented by the SQLite-backed store in production and an
/// in-memory map in tests — the resolver itself stays pure logic and
/// never touches storage directly.
#[async_trait]
pub trait AggregateLookup: Send + Sync {
    async fn aggregate_owner(&self, aggregate_id: AggregateId) -> Option<Subject>;
    async fn aggregate_entries(&self, aggregate_id: AggregateId) -> Option<Vec<(Subject, Role)>>;
}

/// Lets an `Arc<SqliteStore>` (or `Arc<InMemoryStore>`) double as the
/// resolver's lookup handle while the same `Arc` also backs a
/// `DiagramStore` elsewhere, instead of requiring two separate instances.
#[async_trait]
impl<T: AggregateLookup + ?Sized> AggregateLookup for std::sync::Arc<T> {
    async fn aggregate_owner(&self, aggregate_id: AggregateId) -> Option<Subject> {
        (**self).aggregate_owner(aggregate_id).await
    }

    async fn aggregate_entries(&self, aggregate_id: AggregateId) -> Option<Vec<(Subject, Role)>> {
        (**self).aggregate_entries(aggregate_id).await
    }
}

pub struct AuthorizationResolver<L: AggregateLookup> {
    lookup: L,
}

impl<L: AggregateLookup> AuthorizationResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Resolve the effective role of `subject` on `aggregate_id`.
    ///
    /// Returns `Ok(None)` for "no role" (spec's `none`), distinct from the
    /// `AggregateNotFound` failure mode (`CoreError::NotFound`).
    pub async fn resolve(
        &self,
        subject: &Subject,
        aggregate_id: AggregateId,
    ) -> Result<Option<Role>, CoreError> {
        let owner = self
            .lookup
            .aggregate_owner(aggregate_id)
            .await
            .ok_or(CoreError::NotFound)?;

        if &owner == subject {
            return Ok(Some(Role::Owner));
        }

        let entries = self
            .lookup
            .aggregate_entries(aggregate_id)
            .await
            .ok_or(CoreError::NotFound)?;

        Ok(entries
            .into_iter()
            .find(|(s, _)| s == subject)
            .map(|(_, role)| role))
    }

    /// Require at least `min_role` for `subject` on `aggregate_id`.
    ///
    /// A subject whose identity could not be established should never
    /// reach this call — that case is `Unauthenticated`, handled upstream
    /// at the connection/handshake boundary, and is distinct from
    /// `Forbidden` (spec §4.1 edge case).
    pub async fn require(
        &self,
        subject: &Subject,
        aggregate_id: AggregateId,
        min_role: Role,
    ) -> Result<Role, CoreError> {
        match self.resolve(subject, aggregate_id).await? {
            Some(role) if role >= min_role => Ok(role),
            _ => Err(CoreError::Forbidden),
        }
    }
}
