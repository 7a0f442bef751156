//! End-to-end session scenarios over the in-memory mesh.

use std::sync::Arc;
use std::time::Duration;

use selfie_core::memory::MemoryMesh;
use selfie_core::{
    Activity, ConnectionState, HandshakeError, ImageFormat, LocalIdentity, Payload,
    PeerIdentity, PeerSessionManager, ReceivedPayload, SessionConfig, SessionError,
    SessionEvent, SessionEvents, SessionHandle, TransportError,
};

const JPEG: [u8; 8] = [0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0xff, 0xd9];

struct Node {
    handle: SessionHandle,
    events: SessionEvents,
}

impl Node {
    fn spawn(mesh: &MemoryMesh, name: &str) -> Self {
        Self::with_config(mesh, name, SessionConfig::default())
    }

    fn with_config(mesh: &MemoryMesh, name: &str, config: SessionConfig) -> Self {
        let (transport, transport_events) = mesh.join(name);
        let local = Arc::new(LocalIdentity::with_identity(name.into()));
        let (handle, events) =
            PeerSessionManager::spawn(local, config, Arc::new(transport), transport_events)
                .unwrap();
        Node { handle, events }
    }

    /// Collect events until one matches; returns everything seen, the match last.
    async fn until(&mut self, mut pred: impl FnMut(&SessionEvent) -> bool) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            let done = pred(&ev);
            seen.push(ev);
            if done {
                return seen;
            }
        }
    }

    async fn host(&mut self) {
        self.handle.start_hosting().unwrap();
        self.until(|e| matches!(e, SessionEvent::ActivityChanged(Activity::Active { .. })))
            .await;
    }

    /// Wait until the roster shows every peer in `peers` Connected.
    async fn connected_to(&mut self, peers: &[&str]) {
        self.until(|e| match e {
            SessionEvent::RosterChanged(snapshot) => peers.iter().all(|p| {
                snapshot
                    .iter()
                    .any(|peer| peer.identity.as_str() == *p && peer.state == ConnectionState::Connected)
            }),
            _ => false,
        })
        .await;
    }
}

fn id(s: &str) -> PeerIdentity {
    PeerIdentity::new(s)
}

#[tokio::test]
async fn bob_is_invited_accepted_and_dropped() {
    let mesh = MemoryMesh::new();
    let mut bob = Node::spawn(&mesh, "Bob");
    let mut alice = Node::spawn(&mesh, "Alice");

    bob.host().await;
    alice.handle.join_session().unwrap();
    alice
        .until(|e| *e == SessionEvent::PeerDiscovered(id("Bob")))
        .await;
    assert_eq!(alice.handle.discovered_peers().await.unwrap(), vec![id("Bob")]);

    alice.handle.invite(id("Bob"), Some(b"join me".to_vec())).unwrap();
    let seen = bob
        .until(|e| matches!(e, SessionEvent::InvitationReceived(_)))
        .await;
    let Some(SessionEvent::InvitationReceived(request)) = seen.last() else {
        unreachable!()
    };
    assert_eq!(request.from, id("Alice"));
    assert_eq!(request.context.as_deref(), Some(&b"join me"[..]));
    bob.handle.decide(request.id, true).unwrap();

    alice.connected_to(&["Bob"]).await;
    bob.connected_to(&["Alice"]).await;
    assert_eq!(alice.handle.list_connections().await.unwrap(), vec![id("Bob")]);

    mesh.sever("Alice", "Bob");
    let seen = alice
        .until(|e| matches!(e, SessionEvent::PeerDisconnected(_)))
        .await;
    assert_eq!(seen.last(), Some(&SessionEvent::PeerDisconnected(id("Bob"))));
    let roster = alice.handle.roster().await.unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].state, ConnectionState::Disconnected);

    // A second drop report is absorbed by the roster.
    mesh.sever("Alice", "Bob");
    alice.handle.roster().await.unwrap();
    assert!(alice.events.try_recv().is_err());
    assert!(alice.handle.list_connections().await.unwrap().is_empty());
}

#[tokio::test]
async fn declined_invitation_leaves_rosters_empty() {
    let mesh = MemoryMesh::new();
    let mut bob = Node::spawn(&mesh, "Bob");
    let mut alice = Node::spawn(&mesh, "Alice");
    bob.host().await;
    alice.handle.join_session().unwrap();
    alice
        .until(|e| *e == SessionEvent::PeerDiscovered(id("Bob")))
        .await;

    alice.handle.invite(id("Bob"), None).unwrap();
    let seen = bob
        .until(|e| matches!(e, SessionEvent::InvitationReceived(_)))
        .await;
    let Some(SessionEvent::InvitationReceived(request)) = seen.last() else {
        unreachable!()
    };
    bob.handle.decide(request.id, false).unwrap();

    let seen = alice.until(|e| matches!(e, SessionEvent::Error(_))).await;
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::Error(HandshakeError::Declined(id("Bob")).into()))
    );
    assert!(alice.handle.roster().await.unwrap().is_empty());
    assert!(bob.handle.roster().await.unwrap().is_empty());

    // Deciding again names the invitation as unknown.
    bob.handle.decide(request.id, true).unwrap();
    let seen = bob.until(|e| matches!(e, SessionEvent::Error(_))).await;
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::Error(
            HandshakeError::UnknownInvitation(request.id).into()
        ))
    );
}

#[tokio::test]
async fn concurrent_senders_both_arrive() {
    let mesh = MemoryMesh::new();
    let mut alice = Node::spawn(&mesh, "Alice");
    let mut bob = Node::spawn(&mesh, "Bob");
    let mut carol = Node::spawn(&mesh, "Carol");
    for node in [&mut alice, &mut bob, &mut carol] {
        node.host().await;
    }
    mesh.link("Alice", "Bob");
    mesh.link("Alice", "Carol");
    alice.connected_to(&["Bob", "Carol"]).await;
    bob.connected_to(&["Alice"]).await;
    carol.connected_to(&["Alice"]).await;

    bob.handle.broadcast_data(Payload::text("from bob")).unwrap();
    carol.handle.broadcast_data(Payload::text("from carol")).unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        let seen = alice
            .until(|e| matches!(e, SessionEvent::DataReceived { .. }))
            .await;
        if let Some(SessionEvent::DataReceived { from, payload }) = seen.last() {
            received.push((from.clone(), payload.clone()));
        }
    }
    received.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        received,
        vec![
            (id("Bob"), ReceivedPayload::Text("from bob".into())),
            (id("Carol"), ReceivedPayload::Text("from carol".into())),
        ]
    );
    let mut connected = alice.handle.list_connections().await.unwrap();
    connected.sort();
    assert_eq!(connected, vec![id("Bob"), id("Carol")]);
}

#[tokio::test]
async fn partial_broadcast_failure_is_reported_per_peer() {
    let mesh = MemoryMesh::new();
    let mut alice = Node::spawn(&mesh, "Alice");
    let mut peers: Vec<Node> = ["Bob", "Carol", "Dave"]
        .into_iter()
        .map(|name| Node::spawn(&mesh, name))
        .collect();
    alice.host().await;
    for (name, node) in ["Bob", "Carol", "Dave"].into_iter().zip(peers.iter_mut()) {
        node.host().await;
        mesh.link("Alice", name);
    }
    alice.connected_to(&["Bob", "Carol", "Dave"]).await;
    mesh.fail_sends_to("Carol");

    alice.handle.broadcast_data(Payload::image(JPEG.to_vec())).unwrap();
    let seen = alice
        .until(|e| matches!(e, SessionEvent::BroadcastFinished(_)))
        .await;
    let Some(SessionEvent::BroadcastFinished(report)) = seen.last() else {
        unreachable!()
    };
    assert_eq!(report.delivered.len(), 2);
    assert!(report.delivered.contains(&id("Bob")));
    assert!(report.delivered.contains(&id("Dave")));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].peer, id("Carol"));
    let send_errors: Vec<&SessionError> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Error(err @ SessionError::Send(_)) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(send_errors.len(), 1);

    for (name, node) in ["Bob", "Carol", "Dave"].into_iter().zip(peers.iter_mut()) {
        if name == "Carol" {
            continue;
        }
        let seen = node
            .until(|e| matches!(e, SessionEvent::DataReceived { .. }))
            .await;
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::DataReceived {
                from: id("Alice"),
                payload: ReceivedPayload::Image {
                    format: ImageFormat::Jpeg,
                    bytes: JPEG.to_vec()
                }
            })
        );
        node.handle.roster().await.unwrap();
        assert!(node.events.try_recv().is_err(), "{name} got a duplicate");
    }
}

#[tokio::test]
async fn image_is_followed_by_provenance_when_enabled() {
    let mesh = MemoryMesh::new();
    let config = SessionConfig {
        announce_provenance: true,
        ..SessionConfig::default()
    };
    let mut alice = Node::with_config(&mesh, "Alice", config);
    let mut bob = Node::spawn(&mesh, "Bob");
    alice.host().await;
    bob.host().await;
    mesh.link("Alice", "Bob");
    alice.connected_to(&["Bob"]).await;

    alice.handle.broadcast_data(Payload::image(JPEG.to_vec())).unwrap();
    let mut payloads = Vec::new();
    while payloads.len() < 2 {
        let seen = bob
            .until(|e| matches!(e, SessionEvent::DataReceived { .. }))
            .await;
        if let Some(SessionEvent::DataReceived { payload, .. }) = seen.last() {
            payloads.push(payload.clone());
        }
    }
    assert!(matches!(payloads[0], ReceivedPayload::Image { .. }));
    assert_eq!(payloads[1], ReceivedPayload::Text("Sent from Alice".into()));
}

#[tokio::test]
async fn leaving_disconnects_peers_and_declines_pending_invitations() {
    let mesh = MemoryMesh::new();
    let mut alice = Node::spawn(&mesh, "Alice");
    let mut bob = Node::spawn(&mesh, "Bob");
    let mut carol = Node::spawn(&mesh, "Carol");
    alice.host().await;
    bob.host().await;
    mesh.link("Alice", "Bob");
    alice.connected_to(&["Bob"]).await;
    bob.connected_to(&["Alice"]).await;

    carol.handle.join_session().unwrap();
    carol
        .until(|e| *e == SessionEvent::PeerDiscovered(id("Alice")))
        .await;
    carol.handle.invite(id("Alice"), None).unwrap();
    alice
        .until(|e| matches!(e, SessionEvent::InvitationReceived(_)))
        .await;

    alice.handle.leave_session().unwrap();
    let seen = alice
        .until(|e| *e == SessionEvent::ActivityChanged(Activity::Idle))
        .await;
    let drops: Vec<_> = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::PeerDisconnected(_)))
        .collect();
    assert_eq!(drops, vec![&SessionEvent::PeerDisconnected(id("Bob"))]);

    let seen = bob
        .until(|e| matches!(e, SessionEvent::PeerDisconnected(_)))
        .await;
    assert_eq!(seen.last(), Some(&SessionEvent::PeerDisconnected(id("Alice"))));

    let seen = carol.until(|e| matches!(e, SessionEvent::Error(_))).await;
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::Error(HandshakeError::Declined(id("Alice")).into()))
    );

    assert_eq!(alice.handle.activity().await.unwrap(), Activity::Idle);
    assert!(alice.handle.list_connections().await.unwrap().is_empty());
    assert!(!mesh.is_advertising("Alice"));

    // Nothing left to send to: an empty fan-out succeeds.
    alice.handle.broadcast_data(Payload::text("anyone?")).unwrap();
    let seen = alice
        .until(|e| matches!(e, SessionEvent::BroadcastFinished(_)))
        .await;
    let Some(SessionEvent::BroadcastFinished(report)) = seen.last() else {
        unreachable!()
    };
    assert!(report.is_success());
    assert_eq!(report.attempted(), 0);
}

#[tokio::test]
async fn leaving_mid_invite_never_links() {
    let mesh = MemoryMesh::new();
    let mut bob = Node::spawn(&mesh, "Bob");
    let mut alice = Node::spawn(&mesh, "Alice");
    bob.host().await;
    alice.handle.join_session().unwrap();
    alice
        .until(|e| *e == SessionEvent::PeerDiscovered(id("Bob")))
        .await;

    alice.handle.invite(id("Bob"), None).unwrap();
    let seen = bob
        .until(|e| matches!(e, SessionEvent::InvitationReceived(_)))
        .await;
    let Some(SessionEvent::InvitationReceived(request)) = seen.last() else {
        unreachable!()
    };
    let invitation = request.id;

    alice.handle.leave_session().unwrap();
    let seen = alice
        .until(|e| *e == SessionEvent::ActivityChanged(Activity::Idle))
        .await;
    assert!(seen.contains(&SessionEvent::Error(
        HandshakeError::Cancelled(id("Bob")).into()
    )));

    // Bob answers an inviter that is already gone.
    bob.handle.decide(invitation, true).unwrap();
    bob.handle.broadcast_data(Payload::text("still there?")).unwrap();
    let seen = bob
        .until(|e| matches!(e, SessionEvent::BroadcastFinished(_)))
        .await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, SessionEvent::RosterChanged(_))));
    let Some(SessionEvent::BroadcastFinished(report)) = seen.last() else {
        unreachable!()
    };
    assert!(report.delivered.is_empty());

    assert!(bob.handle.roster().await.unwrap().is_empty());
    assert!(alice.handle.roster().await.unwrap().is_empty());
    assert!(alice.handle.list_connections().await.unwrap().is_empty());
}

#[tokio::test]
async fn broadcast_to_a_dropped_peer_fails_without_blocking() {
    let mesh = MemoryMesh::new();
    let mut alice = Node::spawn(&mesh, "Alice");
    let mut bob = Node::spawn(&mesh, "Bob");
    alice.host().await;
    bob.host().await;
    mesh.link("Alice", "Bob");
    alice.connected_to(&["Bob"]).await;

    mesh.sever("Alice", "Bob");
    alice
        .until(|e| matches!(e, SessionEvent::PeerDisconnected(_)))
        .await;
    mesh.link("Alice", "Bob");
    alice.connected_to(&["Bob"]).await;
    mesh.fail_sends_to("Bob");

    alice.handle.broadcast_data(Payload::text("hello")).unwrap();
    let seen = alice
        .until(|e| matches!(e, SessionEvent::BroadcastFinished(_)))
        .await;
    let Some(SessionEvent::BroadcastFinished(report)) = seen.last() else {
        unreachable!()
    };
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0].cause, TransportError::Io(_)));
}
