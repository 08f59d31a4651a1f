//! SQLite-backed `DiagramStore` + `AggregateLookup`, WAL mode.
//!
//! Grounded directly in the sibling daemon's `Storage`: same connect-options
//! shape, same `include_str!` migration runner, same query-timeout wrapper.
//! The CAS in [`SqliteStore::compare_and_swap`] is the same atomic-claim
//! idiom as that codebase's `claim_session_for_run` — a single `UPDATE ...
//! WHERE` whose `rows_affected()` tells us whether we won the race.

use super::DiagramStore;
use crate::authz::AggregateLookup;
use crate::domain::{AggregateId, Cell, Diagram, DiagramId, Role, Subject};
use crate::errors::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::str::FromStr;

/// Prevents a hung query (e.g. a wedged connection) from blocking the core
/// indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, CoreError> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(CoreError::Internal(e.to_string())),
        Err(_) => Err(CoreError::Internal(format!(
            "query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        ))),
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, CoreError> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // An in-memory database lives only on the connection that created
        // it, so the pool must be pinned to exactly one connection or
        // later queries would land on a fresh, empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        sqlx::query(include_str!("migrations/001_init.sql"))
            .execute(pool)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Create an aggregate with the given owner and explicit entries.
    /// Exposed for tests and for the external REST layer that owns
    /// aggregate CRUD (spec §1 — out of scope for the core otherwise).
    pub async fn create_aggregate(
        &self,
        id: AggregateId,
        owner: &Subject,
        entries: &[(Subject, Role)],
    ) -> Result<(), CoreError> {
        with_timeout(
            sqlx::query("INSERT INTO aggregates (id, owner_subject) VALUES (?, ?)")
                .bind(id.to_string())
                .bind(&owner.0)
                .execute(&self.pool),
        )
        .await?;
        for (subject, role) in entries {
            with_timeout(
                sqlx::query(
                    "INSERT INTO aggregate_auth_entries (aggregate_id, subject, role) VALUES (?, ?, ?)",
                )
                .bind(id.to_string())
                .bind(&subject.0)
                .bind(role.to_string())
                .execute(&self.pool),
            )
            .await?;
        }
        Ok(())
    }

    /// Create a diagram at version 0 with no cells.
    pub async fn create_diagram(
        &self,
        id: DiagramId,
        aggregate_id: AggregateId,
    ) -> Result<(), CoreError> {
        let now = Utc::now().to_rfc3339();
        with_timeout(
            sqlx::query(
                "INSERT INTO diagrams (id, aggregate_id, cells, update_vector, created_at, modified_at) \
                 VALUES (?, ?, '[]', 0, ?, ?)",
            )
            .bind(id.to_string())
            .bind(aggregate_id.to_string())
            .bind(&now)
            .bind(&now)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DiagramStore for SqliteStore {
    async fn load(&self, diagram_id: DiagramId) -> Result<Diagram, CoreError> {
        let row = with_timeout(
            sqlx::query(
                "SELECT id, aggregate_id, cells, update_vector, created_at, modified_at \
                 FROM diagrams WHERE id = ?",
            )
            .bind(diagram_id.to_string())
            .fetch_optional(&self.pool),
        )
        .await?;

        let row = row.ok_or(CoreError::NotFound)?;
        row_to_diagram(row)
    }

    async fn compare_and_swap(
        &self,
        diagram_id: DiagramId,
        expected_version: u64,
        new_cells: Vec<Cell>,
    ) -> Result<(u64, DateTime<Utc>), CoreError> {
        let cells_json = serde_json::to_string(&new_cells)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let result = with_timeout(
            sqlx::query(
                "UPDATE diagrams SET cells = ?, update_vector = update_vector + 1, modified_at = ? \
                 WHERE id = ? AND update_vector = ?",
            )
            .bind(&cells_json)
            .bind(&now_str)
            .bind(diagram_id.to_string())
            .bind(expected_version as i64)
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            // Either the diagram doesn't exist, or someone else committed
            // first. Disambiguate by re-reading the current version.
            let current = self.load(diagram_id).await?;
            return Err(CoreError::VersionConflict(current.update_vector));
        }

        Ok((expected_version + 1, now))
    }
}

#[async_trait]
impl AggregateLookup for SqliteStore {
    async fn aggregate_owner(&self, aggregate_id: AggregateId) -> Option<Subject> {
        let row = sqlx::query("SELECT owner_subject FROM aggregates WHERE id = ?")
            .bind(aggregate_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        Some(Subject::new(row.get::<String, _>("owner_subject")))
    }

    async fn aggregate_entries(&self, aggregate_id: AggregateId) -> Option<Vec<(Subject, Role)>> {
        // Confirm existence first so callers can distinguish "no entries"
        // from "no aggregate" the same way `aggregate_owner` does.
        self.aggregate_owner(aggregate_id).await?;

        let rows = sqlx::query(
            "SELECT subject, role FROM aggregate_auth_entries WHERE aggregate_id = ?",
        )
        .bind(aggregate_id.to_string())
        .fetch_all(&self.pool)
        .await
        .ok()?;

        Some(
            rows.into_iter()
                .filter_map(|row| {
                    let subject: String = row.get("subject");
                    let role: String = row.get("role");
                    let role = match role.as_str() {
                        "reader" => Role::Reader,
                        "writer" => Role::Writer,
                        "owner" => Role::Owner,
                        _ => return None,
                    };
                    Some((Subject::new(subject), role))
                })
                .collect(),
        )
    }
}

fn row_to_diagram(row: sqlx::sqlite::SqliteRow) -> Result<Diagram, CoreError> {
    let id_str: String = row.get("id");
    let aggregate_id_str: String = row.get("aggregate_id");
    let cells_json: String = row.get("cells");
    let update_vector: i64 = row.get("update_vector");
    let created_at: String = row.get("created_at");
    let modified_at: String = row.get("modified_at");

    Ok(Diagram {
        id: DiagramId::parse(&id_str).map_err(|e| CoreError::Internal(e.to_string()))?,
        aggregate_id: AggregateId::parse(&aggregate_id_str)
            .map_err(|e| CoreError::Internal(e.to_string()))?,
        cells: serde_json::from_str(&cells_json).map_err(|e| CoreError::Internal(e.to_string()))?,
        update_vector: update_vector as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .with_timezone(&Utc),
        modified_at: DateTime::parse_from_rfc3339(&modified_at)
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (SqliteStore, AggregateId, DiagramId) {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let agg_id = AggregateId::new();
        let diagram_id = DiagramId::new();
        store
            .create_aggregate(
                agg_id,
                &Subject::new("alice@example.com"),
                &[(Subject::new("bob@example.com"), Role::Reader)],
            )
            .await
            .unwrap();
        store.create_diagram(diagram_id, agg_id).await.unwrap();
        (store, agg_id, diagram_id)
    }

    #[tokio::test]
    async fn load_returns_initial_state() {
        let (store, agg_id, diagram_id) = fixture().await;
        let diagram = store.load(diagram_id).await.unwrap();
        assert_eq!(diagram.aggregate_id, agg_id);
        assert_eq!(diagram.update_vector, 0);
        assert!(diagram.cells.is_empty());
    }

    #[tokio::test]
    async fn load_missing_diagram_is_not_found() {
        let (store, _, _) = fixture().await;
        let err = store.load(DiagramId::new()).await.unwrap_err();
        assert_eq!(err, CoreError::NotFound);
    }

    #[tokio::test]
    async fn cas_advances_version_by_one() {
        let (store, _, diagram_id) = fixture().await;
        let cells = vec![Cell {
            id: "c1".into(),
            body: serde_json::json!({"x": 1}),
        }];
        let (new_version, _) = store
            .compare_and_swap(diagram_id, 0, cells.clone())
            .await
            .unwrap();
        assert_eq!(new_version, 1);
        let diagram = store.load(diagram_id).await.unwrap();
        assert_eq!(diagram.update_vector, 1);
        assert_eq!(diagram.cells, cells);
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_version() {
        let (store, _, diagram_id) = fixture().await;
        store
            .compare_and_swap(diagram_id, 0, vec![])
            .await
            .unwrap();
        let err = store
            .compare_and_swap(diagram_id, 0, vec![])
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::VersionConflict(1));
    }

    #[tokio::test]
    async fn aggregate_lookup_resolves_owner_and_entries() {
        let (store, agg_id, _) = fixture().await;
        let owner = store.aggregate_owner(agg_id).await.unwrap();
        assert_eq!(owner, Subject::new("alice@example.com"));
        let entries = store.aggregate_entries(agg_id).await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
