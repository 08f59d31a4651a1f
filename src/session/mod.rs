//! The Session actor — one per diagram, total ordering per diagram.
//!
//! Spec §4.4/§4.5. Grounded in this codebase's connection-handling loop
//! (`ipc::run`): a single `tokio::select!` over a mailbox plus a periodic
//! tick, `biased` so shutdown/inactivity always gets first look. Unlike
//! `session::SessionManager` (a CRUD registry over rows in storage), each
//! `Session` here is itself a live actor task — closer in shape to a
//! per-connection `handle_connection` loop than to the session manager.

use crate::coordinator::{DiagramMutator, PostCommitNotify};
use crate::domain::{Cell, CellsOp, DiagramId, Role, Subject};
use crate::errors::CoreError;
use crate::protocol::{ParticipantInfo, ServerEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// One connection's worth of participation in a diagram's Session.
struct Participant {
    subject: Subject,
    role: Role,
    outbound: mpsc::Sender<ServerEvent>,
}

/// Messages a Session actor accepts. Spec §4.5's message table, one
/// variant per row.
pub enum SessionMessage {
    ParticipantJoin {
        connection_id: crate::domain::ConnectionId,
        subject: Subject,
        role: Role,
        outbound: mpsc::Sender<ServerEvent>,
        reply: oneshot::Sender<(u64, Vec<Cell>, Option<Subject>, Vec<ParticipantInfo>)>,
    },
    ParticipantLeave {
        connection_id: crate::domain::ConnectionId,
    },
    /// A participant asked to become presenter.
    RequestPresenter {
        connection_id: crate::domain::ConnectionId,
    },
    /// The current presenter gave up the role voluntarily.
    YieldPresenter {
        connection_id: crate::domain::ConnectionId,
    },
    /// A diagram mutation submitted by a connection. Only honored if the
    /// submitting connection currently holds the presenter seat (spec
    /// §4.5, `InboundDiagramOp`).
    InboundDiagramOp {
        connection_id: crate::domain::ConnectionId,
        op: CellsOp,
        client_known_version: u64,
    },
    /// A commit landed — either from this Session's own presenter path or
    /// from a REST write — and must be fanned out to every participant.
    PostCommitNotify(PostCommitNotify),
    /// An aggregate's authorization entries changed; re-resolve every
    /// live participant's role and evict anyone who no longer qualifies.
    AuthorizationChanged {
        resolve: Box<
            dyn Fn(Subject) -> futures_util::future::BoxFuture<'static, Option<Role>>
                + Send
                + Sync,
        >,
    },
    AdministrativeTerminate,
}

/// Handle used by `ConnectionHandler` and `SessionRegistry` to talk to a
/// running Session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub mailbox: mpsc::Sender<SessionMessage>,
}

struct SessionActor {
    diagram_id: DiagramId,
    participants: HashMap<crate::domain::ConnectionId, Participant>,
    presenter: Option<crate::domain::ConnectionId>,
    last_known_version: u64,
    last_known_cells: Vec<Cell>,
    grace_period: Duration,
    registry: std::sync::Arc<crate::registry::SessionRegistry>,
    mutator: Arc<dyn DiagramMutator>,
}

impl SessionActor {
    fn participant_infos(&self) -> Vec<ParticipantInfo> {
        self.participants
            .values()
            .map(|p| ParticipantInfo {
                subject: p.subject.clone(),
                role: p.role,
            })
            .collect()
    }

    fn presenter_subject(&self) -> Option<Subject> {
        self.presenter
            .and_then(|id| self.participants.get(&id))
            .map(|p| p.subject.clone())
    }

    async fn broadcast(&mut self, event: ServerEvent) {
        let mut dead = Vec::new();
        for (id, participant) in self.participants.iter() {
            // Bounded mailbox: a slow consumer that can't keep up gets
            // dropped rather than allowed to stall every other
            // participant's delivery (spec §5, backpressure).
            match participant.outbound.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection_id = %id, "slow consumer evicted");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.remove_participant(id).await;
        }
    }

    /// Send an event to a single connection only — used for
    /// `state_correction`/`error`, which must never reach other
    /// participants (spec §4.5, `InboundDiagramOp`).
    async fn send_to(&mut self, connection_id: crate::domain::ConnectionId, event: ServerEvent) {
        let Some(participant) = self.participants.get(&connection_id) else {
            return;
        };
        if participant.outbound.try_send(event).is_err() {
            self.remove_participant(connection_id).await;
        }
    }

    /// On presenter disconnect the seat becomes empty and stays empty — the
    /// session never auto-elects a replacement. Only an explicit
    /// `RequestPresenter` from a writer/owner fills it (spec §4.5,
    /// "Presenter election rules": "the session does not auto-elect").
    async fn remove_participant(&mut self, connection_id: crate::domain::ConnectionId) {
        self.participants.remove(&connection_id);
        let was_presenter = self.presenter == Some(connection_id);
        if was_presenter {
            self.presenter = None;
        }
        self.broadcast(ServerEvent::ParticipantsUpdate {
            participants: self.participant_infos(),
        })
        .await;
        if was_presenter {
            self.broadcast(ServerEvent::CurrentPresenter { presenter: None })
                .await;
        }
    }

    /// Fills a vacant presenter seat with the first qualifying
    /// (writer-or-above) participant. Called on every join while the seat
    /// is empty (spec §4.5 `ParticipantJoin`: "if no presenter and role ≥
    /// writer, set presenter = subject"), never on disconnect — see
    /// `remove_participant`.
    async fn elect_presenter(&mut self) {
        if self.presenter.is_some() {
            return;
        }
        let candidate = self
            .participants
            .iter()
            .filter(|(_, p)| p.role >= Role::Writer)
            .map(|(id, _)| *id)
            .next();
        if let Some(id) = candidate {
            self.presenter = Some(id);
            let presenter = self.presenter_subject();
            self.broadcast(ServerEvent::CurrentPresenter { presenter }).await;
        }
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<SessionMessage>) {
        let mut inactivity = tokio::time::interval(self.grace_period);
        inactivity.tick().await; // first tick fires immediately; discard it

        loop {
            tokio::select! {
                biased;

                msg = mailbox.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }

                _ = inactivity.tick() => {
                    if self.participants.is_empty() {
                        info!(diagram_id = %self.diagram_id, "session idle past grace period");
                        self.registry.reap(self.diagram_id).await;
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: SessionMessage) {
        match msg {
            SessionMessage::ParticipantJoin {
                connection_id,
                subject,
                role,
                outbound,
                reply,
            } => {
                self.participants.insert(
                    connection_id,
                    Participant {
                        subject,
                        role,
                        outbound,
                    },
                );
                self.elect_presenter().await;
                let _ = reply.send((
                    self.last_known_version,
                    self.last_known_cells.clone(),
                    self.presenter_subject(),
                    self.participant_infos(),
                ));
                self.broadcast(ServerEvent::ParticipantsUpdate {
                    participants: self.participant_infos(),
                })
                .await;
            }

            SessionMessage::ParticipantLeave { connection_id } => {
                self.remove_participant(connection_id).await;
            }

            SessionMessage::RequestPresenter { connection_id } => {
                let requester_role = self.participants.get(&connection_id).map(|p| p.role);
                let is_qualified = requester_role.map(|r| r >= Role::Writer).unwrap_or(false);
                let is_owner = requester_role == Some(Role::Owner);
                let seat_vacant = self.presenter.is_none();
                // Spec §4.5 `InboundPresenterRequest`: "Allowed only if
                // requester is owner or current presenter voluntarily
                // yields" — an owner seizes the seat unconditionally; a
                // plain writer may only take an already-vacant seat, never
                // steal it from another active presenter.
                if is_qualified && (is_owner || seat_vacant) {
                    self.presenter = Some(connection_id);
                    let presenter = self.presenter_subject();
                    self.broadcast(ServerEvent::CurrentPresenter { presenter }).await;
                }
            }

            SessionMessage::YieldPresenter { connection_id } => {
                // Mirrors disconnect: the seat goes empty and stays empty
                // until the next explicit RequestPresenter (spec §4.5,
                // "Presenter election rules": "the session does not
                // auto-elect").
                if self.presenter == Some(connection_id) {
                    self.presenter = None;
                    self.broadcast(ServerEvent::CurrentPresenter { presenter: None })
                        .await;
                }
            }

            SessionMessage::InboundDiagramOp {
                connection_id,
                op,
                client_known_version,
            } => {
                if self.presenter != Some(connection_id) {
                    self.send_to(
                        connection_id,
                        ServerEvent::Error {
                            code: "not_presenter".into(),
                            message: "only the current presenter may submit diagram ops".into(),
                        },
                    )
                    .await;
                    return;
                }
                let subject = match self.participants.get(&connection_id) {
                    Some(p) => p.subject.clone(),
                    None => return,
                };
                let result = self
                    .mutator
                    .apply(self.diagram_id, &subject, op, Some(client_known_version))
                    .await;
                match result {
                    Ok(_) => {
                        // The commit notification path (PostCommitNotify)
                        // broadcasts the resulting diagram_operation; there
                        // is nothing further to do here.
                    }
                    Err(CoreError::Stale(current)) => {
                        self.send_to(
                            connection_id,
                            ServerEvent::StateCorrection {
                                version: current,
                                cells: self.last_known_cells.clone(),
                            },
                        )
                        .await;
                    }
                    Err(CoreError::Forbidden) => {
                        self.send_to(
                            connection_id,
                            ServerEvent::Error {
                                code: "forbidden".into(),
                                message: "not authorized to edit this diagram".into(),
                            },
                        )
                        .await;
                    }
                    Err(CoreError::InvalidPatch(message)) => {
                        self.send_to(
                            connection_id,
                            ServerEvent::Error {
                                code: "invalid_patch".into(),
                                message,
                            },
                        )
                        .await;
                    }
                    Err(other) => {
                        warn!(diagram_id = %self.diagram_id, err = %other, "apply failed");
                        self.send_to(
                            connection_id,
                            ServerEvent::Error {
                                code: "internal".into(),
                                message: "internal error".into(),
                            },
                        )
                        .await;
                    }
                }
            }

            SessionMessage::PostCommitNotify(notify) => {
                if notify.diagram_id != self.diagram_id {
                    return;
                }
                self.last_known_version = notify.new_version;
                self.last_known_cells = notify.cells.clone();
                self.broadcast(ServerEvent::DiagramOperation {
                    version: notify.new_version,
                    op: notify.op,
                    by_subject: notify.committed_by,
                })
                .await;
            }

            SessionMessage::AuthorizationChanged { resolve } => {
                let mut evicted = Vec::new();
                let mut demoted = Vec::new();
                for (id, participant) in self.participants.iter_mut() {
                    match resolve(participant.subject.clone()).await {
                        Some(role) => {
                            participant.role = role;
                            if role < Role::Writer {
                                demoted.push(*id);
                            }
                        }
                        None => evicted.push(*id),
                    }
                }
                for id in evicted {
                    self.remove_participant(id).await;
                }
                // A participant downgraded below writer keeps their
                // connection but may never hold the presenter seat (spec
                // §4.5: "Readers may never be presenter") — clear it and
                // let a qualified writer/owner take it, same as
                // `remove_participant` does on full eviction.
                if let Some(presenter) = self.presenter {
                    if demoted.contains(&presenter) {
                        self.presenter = None;
                        self.broadcast(ServerEvent::CurrentPresenter { presenter: None })
                            .await;
                        self.elect_presenter().await;
                    }
                }
            }

            SessionMessage::AdministrativeTerminate => {
                self.broadcast(ServerEvent::SessionEnded {
                    reason: "terminated".into(),
                })
                .await;
                self.registry.reap(self.diagram_id).await;
            }
        }
    }
}

pub struct Session;

impl Session {
    pub fn spawn(
        diagram_id: DiagramId,
        outbound_queue_capacity: usize,
        grace_period: Duration,
        registry: std::sync::Arc<crate::registry::SessionRegistry>,
        mutator: Arc<dyn DiagramMutator>,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(outbound_queue_capacity);
        let actor = SessionActor {
            diagram_id,
            participants: HashMap::new(),
            presenter: None,
            last_known_version: 0,
            last_known_cells: Vec::new(),
            grace_period,
            registry,
            mutator,
        };
        tokio::spawn(actor.run(rx));
        SessionHandle { mailbox: tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConnectionId;

    struct NullMutator;

    #[async_trait::async_trait]
    impl DiagramMutator for NullMutator {
        async fn apply(
            &self,
            _diagram_id: DiagramId,
            _subject: &Subject,
            _cells_op: CellsOp,
            _client_known_version: Option<u64>,
        ) -> Result<crate::coordinator::Commit, CoreError> {
            Err(CoreError::Internal("NullMutator never commits".into()))
        }
    }

    fn actor(grace: Duration) -> (SessionActor, std::sync::Arc<crate::registry::SessionRegistry>) {
        let registry = crate::registry::SessionRegistry::new(8, grace);
        let actor = SessionActor {
            diagram_id: DiagramId::new(),
            participants: HashMap::new(),
            presenter: None,
            last_known_version: 0,
            last_known_cells: Vec::new(),
            grace_period: grace,
            registry: registry.clone(),
            mutator: Arc::new(NullMutator),
        };
        (actor, registry)
    }

    #[tokio::test]
    async fn first_writer_is_elected_presenter() {
        let (mut actor, _registry) = actor(Duration::from_secs(900));
        let (tx, _rx) = mpsc::channel(4);
        actor.participants.insert(
            ConnectionId::new(),
            Participant {
                subject: Subject::new("alice@example.com"),
                role: Role::Writer,
                outbound: tx,
            },
        );
        actor.elect_presenter().await;
        assert!(actor.presenter.is_some());
    }

    #[tokio::test]
    async fn reader_only_participants_never_become_presenter() {
        let (mut actor, _registry) = actor(Duration::from_secs(900));
        let (tx, _rx) = mpsc::channel(4);
        actor.participants.insert(
            ConnectionId::new(),
            Participant {
                subject: Subject::new("bob@example.com"),
                role: Role::Reader,
                outbound: tx,
            },
        );
        actor.elect_presenter().await;
        assert!(actor.presenter.is_none());
    }

    #[tokio::test]
    async fn presenter_leaving_does_not_auto_elect_a_replacement() {
        let (mut actor, _registry) = actor(Duration::from_secs(900));
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        actor.participants.insert(
            id1,
            Participant {
                subject: Subject::new("alice@example.com"),
                role: Role::Writer,
                outbound: tx1,
            },
        );
        actor.participants.insert(
            id2,
            Participant {
                subject: Subject::new("carol@example.com"),
                role: Role::Writer,
                outbound: tx2,
            },
        );
        actor.elect_presenter().await;
        let first_presenter = actor.presenter;
        assert!(first_presenter.is_some());

        actor.remove_participant(first_presenter.unwrap()).await;
        // Spec §4.5 "Presenter election rules": the seat stays empty until
        // an explicit RequestPresenter, even though Carol still qualifies.
        assert!(actor.presenter.is_none());

        actor
            .handle(SessionMessage::RequestPresenter { connection_id: id2 })
            .await;
        assert_eq!(actor.presenter, Some(id2));
    }

    #[tokio::test]
    async fn demoting_the_presenter_below_writer_clears_the_seat() {
        let (mut actor, _registry) = actor(Duration::from_secs(900));
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        actor.participants.insert(
            id1,
            Participant {
                subject: Subject::new("alice@example.com"),
                role: Role::Writer,
                outbound: tx1,
            },
        );
        actor.participants.insert(
            id2,
            Participant {
                subject: Subject::new("carol@example.com"),
                role: Role::Writer,
                outbound: tx2,
            },
        );
        actor.elect_presenter().await;
        assert_eq!(actor.presenter, Some(id1));

        actor
            .handle(SessionMessage::AuthorizationChanged {
                resolve: Box::new(move |subject| {
                    Box::pin(async move {
                        if subject == Subject::new("alice@example.com") {
                            Some(Role::Reader)
                        } else {
                            Some(Role::Writer)
                        }
                    })
                }),
            })
            .await;

        // The reader never keeps the seat, and the remaining qualified
        // writer is elected in the same pass.
        assert_eq!(actor.presenter, Some(id2));
        assert_eq!(actor.participants.get(&id1).unwrap().role, Role::Reader);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_on_full_mailbox() {
        let (mut actor, _registry) = actor(Duration::from_secs(900));
        let (tx, rx) = mpsc::channel(1);
        let id = ConnectionId::new();
        actor.participants.insert(
            id,
            Participant {
                subject: Subject::new("dave@example.com"),
                role: Role::Reader,
                outbound: tx,
            },
        );
        // Fill the bounded mailbox so the next broadcast overflows it.
        actor
            .participants
            .get(&id)
            .unwrap()
            .outbound
            .try_send(ServerEvent::CurrentPresenter { presenter: None })
            .unwrap();
        drop(rx); // never drained — simulate a client that stopped reading

        actor
            .broadcast(ServerEvent::CurrentPresenter { presenter: None })
            .await;
        assert!(!actor.participants.contains_key(&id));
    }

    #[tokio::test]
    async fn diagram_op_from_non_presenter_is_rejected() {
        let (mut actor, _registry) = actor(Duration::from_secs(900));
        let (tx, mut rx) = mpsc::channel(4);
        let id = ConnectionId::new();
        actor.participants.insert(
            id,
            Participant {
                subject: Subject::new("erin@example.com"),
                role: Role::Writer,
                outbound: tx,
            },
        );
        // No presenter elected yet, so `id` cannot submit an op.
        actor
            .handle(SessionMessage::InboundDiagramOp {
                connection_id: id,
                op: CellsOp::Replace { cells: vec![] },
                client_known_version: 0,
            })
            .await;

        let event = rx.try_recv().expect("expected an error event");
        match event {
            ServerEvent::Error { code, .. } => assert_eq!(code, "not_presenter"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
