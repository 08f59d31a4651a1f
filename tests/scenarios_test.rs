//! End-to-end scenarios from spec.md §8, driven directly against the
//! Session/SessionRegistry/UpdateCoordinator stack — the same calls
//! `ConnectionHandler` makes, minus the TCP/WebSocket transport itself.

use std::time::Duration;

use tmcore::domain::{
    Aggregate, AggregateId, AuthEntry, Cell, CellsOp, ConnectionId, DiagramId, PatchOp, Role,
    Subject,
};
use tmcore::protocol::ServerEvent;
use tmcore::registry::{build_coordinator, SessionRegistry};
use tmcore::session::SessionMessage;
use tmcore::storage::memory::InMemoryStore;
use tokio::sync::{mpsc, oneshot};

const OUTBOUND_CAPACITY: usize = 16;

struct Fixture {
    store: std::sync::Arc<InMemoryStore>,
    registry: std::sync::Arc<SessionRegistry>,
    coordinator: std::sync::Arc<tmcore::registry::CoreUpdateCoordinator<InMemoryStore>>,
    aggregate_id: AggregateId,
    diagram_id: DiagramId,
}

async fn fixture(entries: Vec<(&str, Role)>) -> Fixture {
    let store = std::sync::Arc::new(InMemoryStore::new());
    let aggregate_id = AggregateId::new();
    let diagram_id = DiagramId::new();
    store
        .insert_aggregate(Aggregate {
            id: aggregate_id,
            owner: Subject::new("alice@example.com"),
            entries: entries
                .into_iter()
                .map(|(s, r)| AuthEntry {
                    subject: Subject::new(s),
                    role: r,
                })
                .collect(),
        })
        .await;
    store.insert_diagram(aggregate_id, diagram_id).await;

    let registry = SessionRegistry::new(OUTBOUND_CAPACITY, Duration::from_secs(900));
    let coordinator = build_coordinator(store.clone(), registry.clone());

    Fixture {
        store,
        registry,
        coordinator,
        aggregate_id,
        diagram_id,
    }
}

/// Joins `subject` (with `role`) into the diagram's Session, as
/// `ConnectionHandler::handle` would on a successful handshake. Returns the
/// connection id, the outbound receiver, and the join-time snapshot.
async fn join(
    fx: &Fixture,
    subject: &str,
    role: Role,
) -> (
    ConnectionId,
    mpsc::Receiver<ServerEvent>,
    (u64, Vec<Cell>, Option<Subject>),
) {
    let handle = fx.registry.get_or_create(fx.diagram_id).await;
    let connection_id = ConnectionId::new();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .mailbox
        .send(SessionMessage::ParticipantJoin {
            connection_id,
            subject: Subject::new(subject),
            role,
            outbound: tx,
            reply: reply_tx,
        })
        .await
        .unwrap();
    let (version, cells, presenter, _participants) = reply_rx.await.unwrap();
    (connection_id, rx, (version, cells, presenter))
}

fn add_cell_patch(id: &str, x: i64) -> CellsOp {
    CellsOp::Patch {
        delta: vec![PatchOp::Add {
            cell: Cell {
                id: id.into(),
                body: serde_json::json!({ "x": x }),
            },
        }],
    }
}

/// Scenario 1: single presenter patch. Alice is the only participant, so
/// she is elected presenter on join; her patch commits at version 1 and is
/// broadcast back to her.
#[tokio::test]
async fn single_presenter_patch_commits_and_broadcasts() {
    let fx = fixture(vec![]).await;
    let (connection_id, mut rx, (version, cells, presenter)) =
        join(&fx, "alice@example.com", Role::Owner).await;
    assert_eq!(version, 0);
    assert!(cells.is_empty());
    assert_eq!(presenter, Some(Subject::new("alice@example.com")));

    let handle = fx.registry.get(fx.diagram_id).await.unwrap();
    handle
        .mailbox
        .send(SessionMessage::InboundDiagramOp {
            connection_id,
            op: add_cell_patch("c1", 1),
            client_known_version: 0,
        })
        .await
        .unwrap();

    // Alice's own join elects her presenter: current_presenter, then
    // participants_update. Drain both before the commit broadcast.
    let _ = rx.recv().await;
    let _ = rx.recv().await;
    let event = rx.recv().await.expect("expected a broadcast event");
    match event {
        ServerEvent::DiagramOperation {
            version, by_subject, ..
        } => {
            assert_eq!(version, 1);
            assert_eq!(by_subject, Subject::new("alice@example.com"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    let diagram = fx.store.load(fx.diagram_id).await.unwrap();
    assert_eq!(diagram.update_vector, 1);
}

/// Scenario 2: reader rejected. Bob holds `reader` and is never elected
/// presenter; his diagram op is answered with `error{not_presenter}` and
/// the store is untouched.
#[tokio::test]
async fn reader_diagram_op_is_rejected_as_not_presenter() {
    let fx = fixture(vec![("bob@example.com", Role::Reader)]).await;
    let (connection_id, mut rx, (_version, _cells, presenter)) =
        join(&fx, "bob@example.com", Role::Reader).await;
    assert_eq!(presenter, None);

    let handle = fx.registry.get(fx.diagram_id).await.unwrap();
    handle
        .mailbox
        .send(SessionMessage::InboundDiagramOp {
            connection_id,
            op: CellsOp::Replace { cells: vec![] },
            client_known_version: 0,
        })
        .await
        .unwrap();

    // Bob's own join never elects a presenter (he's a reader), so only a
    // participants_update is queued ahead of the rejection.
    let _ = rx.recv().await;
    let event = rx.recv().await.expect("expected an error event");
    match event {
        ServerEvent::Error { code, .. } => assert_eq!(code, "not_presenter"),
        other => panic!("unexpected event: {other:?}"),
    }
    let diagram = fx.store.load(fx.diagram_id).await.unwrap();
    assert_eq!(diagram.update_vector, 0);
}

/// Scenario 3: REST and socket race. A REST write and the presenter's
/// socket op both target version 5; only one wins the CAS, and the loser
/// gets `state_correction`, not a second broadcast.
#[tokio::test]
async fn concurrent_rest_and_socket_writes_one_wins_the_other_is_corrected() {
    let fx = fixture(vec![]).await;
    // Advance the diagram to version 5 up front via direct REST-style applies.
    for i in 0..5 {
        fx.coordinator
            .apply(
                fx.diagram_id,
                &Subject::new("alice@example.com"),
                add_cell_patch(&format!("seed{i}"), i),
                None,
            )
            .await
            .unwrap();
    }

    let (connection_id, mut rx, (version, _cells, presenter)) =
        join(&fx, "alice@example.com", Role::Owner).await;
    assert_eq!(version, 5);
    assert_eq!(presenter, Some(Subject::new("alice@example.com")));
    let _ = rx.recv().await; // CurrentPresenter from Alice's own join
    let _ = rx.recv().await; // ParticipantsUpdate at join

    // REST commits first, landing at version 6.
    let rest_commit = fx
        .coordinator
        .apply(
            fx.diagram_id,
            &Subject::new("alice@example.com"),
            CellsOp::Patch {
                delta: vec![PatchOp::Update {
                    cell_id: "seed0".into(),
                    new_body: serde_json::json!({"x": 3}),
                }],
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(rest_commit.new_version, 6);

    // All participants (including the presenter) see the REST commit
    // broadcast before the socket apply below is even attempted.
    let event = rx.recv().await.expect("expected the REST commit broadcast");
    match event {
        ServerEvent::DiagramOperation { version, .. } => assert_eq!(version, 6),
        other => panic!("unexpected event: {other:?}"),
    }

    // The presenter's own socket op, submitted against the now-stale
    // version 5, fails the CAS and is corrected, not broadcast again.
    let handle = fx.registry.get(fx.diagram_id).await.unwrap();
    handle
        .mailbox
        .send(SessionMessage::InboundDiagramOp {
            connection_id,
            op: CellsOp::Patch {
                delta: vec![PatchOp::Update {
                    cell_id: "seed0".into(),
                    new_body: serde_json::json!({"x": 2}),
                }],
            },
            client_known_version: 5,
        })
        .await
        .unwrap();

    let event = rx.recv().await.expect("expected a state_correction");
    match event {
        ServerEvent::StateCorrection { version, .. } => assert_eq!(version, 6),
        other => panic!("unexpected event: {other:?}"),
    }
}

/// Scenario 4: presenter handoff. The aggregate owner seizes the presenter
/// seat from Alice; Alice's subsequent op is then rejected.
#[tokio::test]
async fn owner_seizes_presenter_from_active_presenter() {
    let fx = fixture(vec![]).await;
    let (alice_conn, mut alice_rx, _) = join(&fx, "alice@example.com", Role::Writer).await;
    let _ = alice_rx.recv().await; // CurrentPresenter electing Alice on her own join
    let _ = alice_rx.recv().await; // ParticipantsUpdate for Alice's own join

    let (carol_conn, mut carol_rx, _) = join(&fx, "carol@example.com", Role::Owner).await;
    let _ = alice_rx.recv().await; // ParticipantsUpdate when Carol joins
    let _ = carol_rx.recv().await; // the same event, Carol's own copy

    let handle = fx.registry.get(fx.diagram_id).await.unwrap();
    handle
        .mailbox
        .send(SessionMessage::RequestPresenter {
            connection_id: carol_conn,
        })
        .await
        .unwrap();

    for rx in [&mut alice_rx, &mut carol_rx] {
        let event = rx.recv().await.expect("expected current_presenter");
        match event {
            ServerEvent::CurrentPresenter { presenter } => {
                assert_eq!(presenter, Some(Subject::new("carol@example.com")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    handle
        .mailbox
        .send(SessionMessage::InboundDiagramOp {
            connection_id: alice_conn,
            op: CellsOp::Replace { cells: vec![] },
            client_known_version: 0,
        })
        .await
        .unwrap();
    let event = alice_rx.recv().await.expect("expected an error for Alice");
    match event {
        ServerEvent::Error { code, .. } => assert_eq!(code, "not_presenter"),
        other => panic!("unexpected event: {other:?}"),
    }
}

/// Scenario 5: slow consumer eviction. Dave's outbound queue is never
/// drained; once it fills, the Session evicts him while Alice's broadcasts
/// keep flowing to everyone else in order.
#[tokio::test]
async fn slow_consumer_is_evicted_while_others_keep_receiving() {
    let fx = fixture(vec![]).await;
    let handle = fx.registry.get_or_create(fx.diagram_id).await;

    let alice_conn = ConnectionId::new();
    let (alice_tx, mut alice_rx) = mpsc::channel(256);
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .mailbox
        .send(SessionMessage::ParticipantJoin {
            connection_id: alice_conn,
            subject: Subject::new("alice@example.com"),
            role: Role::Owner,
            outbound: alice_tx,
            reply: reply_tx,
        })
        .await
        .unwrap();
    reply_rx.await.unwrap();
    let _ = alice_rx.recv().await; // CurrentPresenter electing Alice on her own join
    let _ = alice_rx.recv().await; // ParticipantsUpdate

    // Dave's queue is tiny and never drained.
    let dave_conn = ConnectionId::new();
    let (dave_tx, dave_rx) = mpsc::channel(2);
    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .mailbox
        .send(SessionMessage::ParticipantJoin {
            connection_id: dave_conn,
            subject: Subject::new("dave@example.com"),
            role: Role::Reader,
            outbound: dave_tx,
            reply: reply_tx,
        })
        .await
        .unwrap();
    reply_rx.await.unwrap();
    let _ = alice_rx.recv().await; // ParticipantsUpdate including Dave

    for i in 0..20u64 {
        handle
            .mailbox
            .send(SessionMessage::InboundDiagramOp {
                connection_id: alice_conn,
                op: add_cell_patch(&format!("c{i}"), i as i64),
                client_known_version: i,
            })
            .await
            .unwrap();
    }

    let mut seen_versions = Vec::new();
    while seen_versions.len() < 20 {
        match alice_rx.recv().await.expect("alice dropped unexpectedly") {
            ServerEvent::DiagramOperation { version, .. } => seen_versions.push(version),
            ServerEvent::ParticipantsUpdate { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
    let expected: Vec<u64> = (1..=20).collect();
    assert_eq!(seen_versions, expected);

    // Dave's mailbox overflowed and he was evicted; the registry no longer
    // delivers to his dropped sender, so his receiver observes a close.
    drop(dave_rx);
    assert_eq!(fx.store.load(fx.diagram_id).await.unwrap().update_vector, 20);
}

/// Scenario 6: authorization revocation mid-session. Bob, a writer
/// participant, loses his role; `AuthorizationChanged` evicts him and
/// leaves everyone else informed, without touching the store.
#[tokio::test]
async fn authorization_revocation_evicts_the_affected_participant() {
    let fx = fixture(vec![("bob@example.com", Role::Writer)]).await;
    let (_alice_conn, mut alice_rx, _) = join(&fx, "alice@example.com", Role::Owner).await;
    let _ = alice_rx.recv().await; // CurrentPresenter electing Alice on her own join
    let _ = alice_rx.recv().await; // ParticipantsUpdate for Alice's own join

    let (_bob_conn, mut bob_rx, _) = join(&fx, "bob@example.com", Role::Writer).await;
    let _ = alice_rx.recv().await; // ParticipantsUpdate when Bob joins
    let _ = bob_rx.recv().await;

    fx.store
        .set_entry(fx.aggregate_id, Subject::new("bob@example.com"), None)
        .await;

    let resolver_store = fx.store.clone();
    let aggregate_id = fx.aggregate_id;
    let handle = fx.registry.get(fx.diagram_id).await.unwrap();
    handle
        .mailbox
        .send(SessionMessage::AuthorizationChanged {
            resolve: Box::new(move |subject| {
                let store = resolver_store.clone();
                Box::pin(async move {
                    if subject == Subject::new("alice@example.com") {
                        Some(Role::Owner)
                    } else {
                        use tmcore::authz::AggregateLookup;
                        store
                            .aggregate_entries(aggregate_id)
                            .await
                            .and_then(|entries| {
                                entries
                                    .into_iter()
                                    .find(|(s, _)| *s == subject)
                                    .map(|(_, r)| r)
                            })
                    }
                })
            }),
        })
        .await
        .unwrap();

    // Bob's connection is dropped by the session (no further sends
    // succeed) and Alice sees a ParticipantsUpdate omitting him.
    let event = alice_rx
        .recv()
        .await
        .expect("expected participants_update after revocation");
    match event {
        ServerEvent::ParticipantsUpdate { participants } => {
            assert!(participants
                .iter()
                .all(|p| p.subject != Subject::new("bob@example.com")));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(fx.store.load(fx.diagram_id).await.unwrap().update_vector, 0);
}
