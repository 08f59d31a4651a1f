//! Wire envelopes for the socket endpoint — spec §6.
//!
//! Tagged JSON, one discriminant field per direction, mirroring the way
//! this codebase's JSON-RPC transport tags its `method` field — except the
//! diagram socket is event-shaped, not RPC-shaped, so each variant carries
//! its own body directly instead of a generic `params` blob.

use crate::domain::{Cell, CellsOp, Role, Subject};
use serde::{Deserialize, Serialize};

/// One live participant, as shown in `participants_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub subject: Subject,
    pub role: Role,
}

/// Server → client events (spec §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    InitialState {
        version: u64,
        cells: Vec<Cell>,
        presenter: Option<Subject>,
        participants: Vec<ParticipantInfo>,
    },
    CurrentPresenter {
        presenter: Option<Subject>,
    },
    ParticipantsUpdate {
        participants: Vec<ParticipantInfo>,
    },
    DiagramOperation {
        version: u64,
        op: CellsOp,
        by_subject: Subject,
    },
    /// Full resync targeted at a single connection (spec §6).
    StateCorrection {
        version: u64,
        cells: Vec<Cell>,
    },
    Error {
        code: String,
        message: String,
    },
    SessionEnded {
        reason: String,
    },
}

/// Client → server messages (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    DiagramOperation {
        client_known_version: u64,
        op: CellsOp,
    },
    RequestPresenter {},
    YieldPresenter {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagram_operation_event_round_trips_through_json() {
        let event = ServerEvent::DiagramOperation {
            version: 3,
            op: CellsOp::Replace { cells: vec![] },
            by_subject: Subject::new("alice@example.com"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"diagram_operation\""));
    }

    #[test]
    fn client_message_parses_diagram_operation() {
        let raw = r#"{"type":"diagram_operation","client_known_version":5,"op":{"kind":"replace","cells":[]}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::DiagramOperation { client_known_version, .. } => {
                assert_eq!(client_known_version, 5);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_message_parses_request_presenter() {
        let raw = r#"{"type":"request_presenter"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::RequestPresenter {}));
    }
}
