//! `ConnectionHandler` — the per-socket boundary. Spec §4.6.
//!
//! Grounded in this codebase's `ipc::handle_connection`: same
//! `accept_async_with_config` WS upgrade, same peek-before-upgrade shape for
//! sharing one port with a health check, same `tokio::select!` read/write
//! loop. The JSON-RPC auth challenge there (first frame must be
//! `daemon.auth`) becomes a bearer extracted at the HTTP upgrade itself
//! here, since the socket path already encodes which diagram is being
//! opened (§6) and authentication must complete before any frame is
//! accepted.

use crate::authz::{AggregateLookup, AuthorizationResolver};
use crate::domain::{AggregateId, ConnectionId, DiagramId, Role, Subject};
use crate::errors::CoreError;
use crate::protocol::{ClientMessage, ParticipantInfo, ServerEvent};
use crate::ratelimit::MessageRateLimiter;
use crate::registry::SessionRegistry;
use crate::session::SessionMessage;
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Validates a bearer credential and resolves it to a subject identity.
/// Out of scope for the core itself (spec §1: "OAuth/JWT issuance and
/// validation... the core receives an already-validated subject
/// identity"), so this is a thin seam the host process implements.
#[async_trait::async_trait]
pub trait SubjectAuthenticator: Send + Sync {
    async fn authenticate(&self, bearer: &str) -> Option<Subject>;
}

const DEFAULT_READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

pub struct ConnectionHandler<L: AggregateLookup> {
    resolver: Arc<AuthorizationResolver<L>>,
    registry: Arc<SessionRegistry>,
    authenticator: Arc<dyn SubjectAuthenticator>,
    outbound_queue_capacity: usize,
    read_idle_timeout: Duration,
    max_messages_per_sec: u32,
}

impl<L: AggregateLookup + 'static> ConnectionHandler<L> {
    pub fn new(
        resolver: Arc<AuthorizationResolver<L>>,
        registry: Arc<SessionRegistry>,
        authenticator: Arc<dyn SubjectAuthenticator>,
        outbound_queue_capacity: usize,
        max_messages_per_sec: u32,
    ) -> Self {
        Self {
            resolver,
            registry,
            authenticator,
            outbound_queue_capacity,
            read_idle_timeout: DEFAULT_READ_IDLE_TIMEOUT,
            max_messages_per_sec,
        }
    }

    pub fn with_read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.read_idle_timeout = timeout;
        self
    }

    /// Drive one socket from upgrade to close. `aggregate_id`/`diagram_id`
    /// come from the URL path (§6); routing the raw path to these IDs is
    /// the host's job, same as health-check vs. upgrade disambiguation is
    /// the host's job in the sibling daemon.
    pub async fn handle(
        &self,
        stream: TcpStream,
        aggregate_id: AggregateId,
        diagram_id: DiagramId,
    ) -> Result<(), CoreError> {
        let bearer = std::sync::Mutex::new(None::<String>);
        let ws_config = WebSocketConfig {
            max_message_size: Some(MAX_MESSAGE_SIZE),
            max_frame_size: Some(MAX_FRAME_SIZE),
            ..Default::default()
        };

        let callback = |req: &Request, resp: Response| {
            if let Some(value) = req.headers().get("authorization") {
                if let Ok(s) = value.to_str() {
                    *bearer.lock().unwrap() = s.strip_prefix("Bearer ").map(|t| t.to_string());
                }
            } else if let Some(query) = req.uri().query() {
                for pair in query.split('&') {
                    if let Some(token) = pair.strip_prefix("token=") {
                        *bearer.lock().unwrap() = Some(token.to_string());
                    }
                }
            }
            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let bearer = bearer.into_inner().unwrap();
        let (mut sink, mut stream) = ws.split();

        // Step 2: authenticate.
        let subject = match bearer {
            Some(token) => self.authenticator.authenticate(&token).await,
            None => None,
        };
        let subject = match subject {
            Some(s) => s,
            None => {
                let _ = sink
                    .send(Message::Close(Some(close_frame(
                        CoreError::Unauthenticated.ws_close_code(),
                        "unauthenticated",
                    ))))
                    .await;
                return Err(CoreError::Unauthenticated);
            }
        };

        // Step 3: resolve role.
        let role = match self.resolver.resolve(&subject, aggregate_id).await {
            Ok(Some(role)) => role,
            Ok(None) => {
                let _ = sink
                    .send(Message::Close(Some(close_frame(
                        CoreError::Forbidden.ws_close_code(),
                        "forbidden",
                    ))))
                    .await;
                return Err(CoreError::Forbidden);
            }
            Err(e) => {
                let _ = sink
                    .send(Message::Close(Some(close_frame(e.ws_close_code(), "error"))))
                    .await;
                return Err(e);
            }
        };

        // Step 4: obtain the Session, refusing to start a new one below writer.
        let existed = self.registry.get(diagram_id).await.is_some();
        if !existed && role < Role::Writer {
            let _ = sink
                .send(Message::Close(Some(close_frame(
                    CoreError::Forbidden.ws_close_code(),
                    "not_allowed_to_start",
                ))))
                .await;
            return Err(CoreError::Forbidden);
        }
        let session = self.registry.get_or_create(diagram_id).await;

        let connection_id = ConnectionId::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(self.outbound_queue_capacity);
        let (reply_tx, reply_rx) = oneshot::channel();

        if session
            .mailbox
            .send(SessionMessage::ParticipantJoin {
                connection_id,
                subject: subject.clone(),
                role,
                outbound: outbound_tx,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(CoreError::Internal("session mailbox closed".into()));
        }

        let (version, cells, presenter, participants): (
            u64,
            Vec<crate::domain::Cell>,
            Option<Subject>,
            Vec<ParticipantInfo>,
        ) = reply_rx
            .await
            .map_err(|_| CoreError::Internal("session did not reply to join".into()))?;

        // Step 5: initial state frame.
        let initial = ServerEvent::InitialState {
            version,
            cells,
            presenter,
            participants,
        };
        if send_event(&mut sink, &initial).await.is_err() {
            let _ = session
                .mailbox
                .send(SessionMessage::ParticipantLeave { connection_id })
                .await;
            return Ok(());
        }

        // Step 6: read/write loops.
        let mut message_limiter = MessageRateLimiter::new(self.max_messages_per_sec);
        loop {
            tokio::select! {
                biased;

                msg = tokio::time::timeout(self.read_idle_timeout, stream.next()) => {
                    match msg {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if !message_limiter.check() {
                                if send_event(&mut sink, &ServerEvent::Error {
                                    code: "rate_limited".into(),
                                    message: "message rate limit exceeded".into(),
                                }).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                            if let Some(unknown) = self
                                .dispatch_client_message(&text, connection_id, &session)
                                .await
                            {
                                if send_event(&mut sink, &unknown).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                        Ok(Some(Err(e))) => {
                            warn!(err = %e, "ws read error");
                            break;
                        }
                        Ok(Some(Ok(_))) => {}
                        Err(_) => {
                            debug!(connection_id = %connection_id, "read idle timeout");
                            break;
                        }
                    }
                }

                event = outbound_rx.recv() => {
                    match event {
                        Some(event) => {
                            if send_event(&mut sink, &event).await.is_err() {
                                break;
                            }
                        }
                        // The Session only drops a participant's outbound
                        // sender when evicting it for a full queue (spec
                        // §4.5 broadcast backpressure) — close with 1013
                        // rather than a bare connection drop.
                        None => {
                            let _ = sink
                                .send(Message::Close(Some(close_frame(
                                    CoreError::SlowConsumer.ws_close_code(),
                                    "overloaded",
                                ))))
                                .await;
                            break;
                        }
                    }
                }
            }
        }

        let _ = session
            .mailbox
            .send(SessionMessage::ParticipantLeave { connection_id })
            .await;
        Ok(())
    }

    /// Parses and forwards one client frame to the Session mailbox.
    /// Unknown/malformed kinds are answered directly (returned here for the
    /// caller to write to the socket) and do not kill the connection (spec
    /// §4.6 read loop).
    async fn dispatch_client_message(
        &self,
        text: &str,
        connection_id: ConnectionId,
        session: &crate::session::SessionHandle,
    ) -> Option<ServerEvent> {
        let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
        let msg = match parsed {
            Ok(msg) => msg,
            Err(_) => {
                return Some(ServerEvent::Error {
                    code: "unknown_kind".into(),
                    message: "unrecognized or malformed message".into(),
                });
            }
        };
        let session_msg = match msg {
            ClientMessage::DiagramOperation {
                client_known_version,
                op,
            } => SessionMessage::InboundDiagramOp {
                connection_id,
                op,
                client_known_version,
            },
            ClientMessage::RequestPresenter {} => {
                SessionMessage::RequestPresenter { connection_id }
            }
            ClientMessage::YieldPresenter {} => SessionMessage::YieldPresenter { connection_id },
        };
        let _ = session.mailbox.send(session_msg).await;
        None
    }
}

async fn send_event(
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    event: &ServerEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

fn close_frame(
    code: u16,
    reason: &str,
) -> tokio_tungstenite::tungstenite::protocol::CloseFrame<'static> {
    tokio_tungstenite::tungstenite::protocol::CloseFrame {
        code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(code),
        reason: reason.to_string().into(),
    }
}
