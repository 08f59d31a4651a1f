//! Core data model: aggregates, diagrams, cells, subjects, and roles.
//!
//! Spec §3. These types are intentionally thin — the core treats cell
//! bodies as opaque and never interprets their contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_newtype!(AggregateId);
uuid_newtype!(DiagramId);
uuid_newtype!(ConnectionId);

/// An authenticated identity, already validated by the external auth
/// collaborator. Equality for email-like subjects is case-insensitive,
/// per §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(pub String);

impl Subject {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Case-insensitive comparison for email-like identities; subjects
    /// that don't look like emails fall back to exact match.
    fn normalized(&self) -> String {
        if self.0.contains('@') {
            self.0.to_lowercase()
        } else {
            self.0.clone()
        }
    }
}

impl PartialEq for Subject {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Subject {}

impl std::hash::Hash for Subject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Effective role of a subject on an aggregate (and transitively, on any
/// diagram it owns). Total order: `Reader < Writer < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
    Owner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Owner => "owner",
        };
        write!(f, "{}", s)
    }
}

/// One explicit authorization entry on an aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEntry {
    pub subject: Subject,
    pub role: Role,
}

/// The parent aggregate ("threat model"). The core only reads this to
/// resolve roles — aggregate CRUD lives outside the core.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub id: AggregateId,
    pub owner: Subject,
    pub entries: Vec<AuthEntry>,
}

/// One cell of a diagram's graphical content. Opaque to the core beyond
/// its identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    pub id: String,
    pub body: serde_json::Value,
}

/// The collaboratively edited diagram. `update_vector` is server-assigned
/// and strictly increasing; clients must never supply it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    pub id: DiagramId,
    pub aggregate_id: AggregateId,
    pub cells: Vec<Cell>,
    pub update_vector: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A single cell-level patch operation, applied in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { cell: Cell },
    Remove { cell_id: String },
    Update { cell_id: String, new_body: serde_json::Value },
}

/// The mutation requested against a diagram's cell sequence — spec §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CellsOp {
    Replace { cells: Vec<Cell> },
    Patch { delta: Vec<PatchOp> },
}

impl CellsOp {
    /// Apply this operation to `cells`, deterministically, in submission
    /// order. Fails with `InvalidPatch` on `update` of a missing cell or
    /// `add` of a duplicate identity.
    pub fn apply(&self, cells: &[Cell]) -> Result<Vec<Cell>, String> {
        match self {
            CellsOp::Replace { cells: new_cells } => Ok(new_cells.clone()),
            CellsOp::Patch { delta } => {
                let mut result = cells.to_vec();
                for op in delta {
                    match op {
                        PatchOp::Add { cell } => {
                            if result.iter().any(|c| c.id == cell.id) {
                                return Err(format!("duplicate cell id: {}", cell.id));
                            }
                            result.push(cell.clone());
                        }
                        PatchOp::Remove { cell_id } => {
                            result.retain(|c| &c.id != cell_id);
                        }
                        PatchOp::Update { cell_id, new_body } => {
                            match result.iter_mut().find(|c| &c.id == cell_id) {
                                Some(c) => c.body = new_body.clone(),
                                None => {
                                    return Err(format!("update of missing cell: {}", cell_id))
                                }
                            }
                        }
                    }
                }
                Ok(result)
            }
        }
    }
}
