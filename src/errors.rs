//! Error taxonomy shared by every collaborator in the core.
//!
//! Mirrors the two-tier approach the rest of this codebase uses for its
//! JSON-RPC surface: `anyhow` for ergonomic propagation at call sites, plus
//! a typed enum here so the REST and socket boundaries can match on error
//! *kind* instead of sniffing message strings.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("stale version, current is {0}")]
    Stale(u64),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("slow consumer")]
    SlowConsumer,

    #[error("version conflict, current is {0}")]
    VersionConflict(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// REST status code for this error, per the wire contract in §6.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Unauthenticated => 401,
            CoreError::Forbidden => 403,
            CoreError::NotFound => 404,
            CoreError::Stale(_) => 409,
            CoreError::InvalidPatch(_) => 400,
            CoreError::SlowConsumer => 500,
            CoreError::VersionConflict(_) => 409,
            CoreError::Internal(_) => 500,
        }
    }

    /// REST error code token for this error, per the wire contract in §6.
    pub fn http_code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated => "unauthenticated",
            CoreError::Forbidden => "forbidden",
            CoreError::NotFound => "not_found",
            CoreError::Stale(_) => "stale",
            CoreError::InvalidPatch(_) => "invalid_patch",
            CoreError::SlowConsumer => "internal",
            CoreError::VersionConflict(_) => "stale",
            CoreError::Internal(_) => "internal",
        }
    }

    /// WebSocket close code for this error, per the wire contract in §6.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            CoreError::Unauthenticated => 1008,
            CoreError::Forbidden => 1008,
            CoreError::NotFound => 1008,
            CoreError::SlowConsumer => 1013,
            CoreError::Internal(_) => 1011,
            // Stale/InvalidPatch/VersionConflict never close the socket —
            // they're answered in-band with `state_correction`/`error`.
            CoreError::Stale(_) | CoreError::InvalidPatch(_) | CoreError::VersionConflict(_) => {
                1011
            }
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
