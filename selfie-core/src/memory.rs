//! In-process transport: every node of a [`MemoryMesh`] sees the others' advertisements,
//! invitations and data through channels. Used by tests and local demos, with hooks for
//! injecting link failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{DiscoveryError, HandshakeError, TransportError};
use crate::identity::PeerIdentity;
use crate::invitation::invitation;
use crate::roster::ConnectionState;
use crate::transport::{
    DiscoveryTransport, Reliability, SendOutcome, TransportEvent, TransportEventSender,
    TransportEvents,
};

struct Node {
    events: TransportEventSender,
    advertising: Option<String>,
    browsing: Option<String>,
    links: HashSet<PeerIdentity>,
    /// Bumped by `disconnect`; handshakes started under an older value never connect.
    generation: u64,
    fail_sends: bool,
    offline: bool,
}

#[derive(Default)]
struct MeshState {
    nodes: HashMap<PeerIdentity, Node>,
}

impl MeshState {
    fn emit(&self, to: &PeerIdentity, event: TransportEvent) -> bool {
        match self.nodes.get(to) {
            Some(node) => node.events.send(event).is_ok(),
            None => false,
        }
    }

    fn generation(&self, peer: &PeerIdentity) -> Option<u64> {
        self.nodes.get(peer).map(|n| n.generation)
    }

    fn connect(&mut self, a: &PeerIdentity, b: &PeerIdentity) {
        for (me, other) in [(a, b), (b, a)] {
            if let Some(node) = self.nodes.get_mut(me) {
                node.links.insert(other.clone());
            }
            for state in [ConnectionState::Connecting, ConnectionState::Connected] {
                self.emit(
                    me,
                    TransportEvent::PeerStateChanged {
                        peer: other.clone(),
                        state,
                    },
                );
            }
        }
    }

    fn sever(&mut self, a: &PeerIdentity, b: &PeerIdentity) {
        let linked = self
            .nodes
            .get_mut(a)
            .map(|n| n.links.remove(b))
            .unwrap_or(false);
        if let Some(n) = self.nodes.get_mut(b) {
            n.links.remove(a);
        }
        if !linked {
            return;
        }
        for (me, other) in [(a, b), (b, a)] {
            self.emit(
                me,
                TransportEvent::PeerStateChanged {
                    peer: other.clone(),
                    state: ConnectionState::Disconnected,
                },
            );
        }
    }
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    state: Arc<Mutex<MeshState>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Returns its transport and the event stream the session consumes.
    pub fn join(&self, name: impl Into<PeerIdentity>) -> (MemoryTransport, TransportEvents) {
        let me = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().nodes.insert(
            me.clone(),
            Node {
                events: tx,
                advertising: None,
                browsing: None,
                links: HashSet::new(),
                generation: 0,
                fail_sends: false,
                offline: false,
            },
        );
        (
            MemoryTransport {
                me,
                mesh: self.clone(),
            },
            rx,
        )
    }

    /// Connect two nodes directly, skipping the invitation.
    pub fn link(&self, a: impl Into<PeerIdentity>, b: impl Into<PeerIdentity>) {
        self.lock().connect(&a.into(), &b.into());
    }

    /// Drop the link between two nodes as if the radio lost it.
    pub fn sever(&self, a: impl Into<PeerIdentity>, b: impl Into<PeerIdentity>) {
        self.lock().sever(&a.into(), &b.into());
    }

    /// Every send addressed to `peer` fails from now on.
    pub fn fail_sends_to(&self, peer: impl Into<PeerIdentity>) {
        if let Some(node) = self.lock().nodes.get_mut(&peer.into()) {
            node.fail_sends = true;
        }
    }

    /// An offline node cannot start advertising or browsing.
    pub fn set_offline(&self, peer: impl Into<PeerIdentity>, offline: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&peer.into()) {
            node.offline = offline;
        }
    }

    pub fn is_advertising(&self, peer: impl Into<PeerIdentity>) -> bool {
        self.lock()
            .nodes
            .get(&peer.into())
            .is_some_and(|n| n.advertising.is_some())
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's view of a [`MemoryMesh`].
#[derive(Clone)]
pub struct MemoryTransport {
    me: PeerIdentity,
    mesh: MemoryMesh,
}

impl MemoryTransport {
    pub fn identity(&self) -> &PeerIdentity {
        &self.me
    }
}

#[async_trait]
impl DiscoveryTransport for MemoryTransport {
    async fn start_advertising(&self, service_type: &str) -> Result<(), DiscoveryError> {
        let mut state = self.mesh.lock();
        let node = state
            .nodes
            .get_mut(&self.me)
            .ok_or_else(|| DiscoveryError::AdvertiseFailed("node left the mesh".into()))?;
        if node.offline {
            return Err(DiscoveryError::AdvertiseFailed("network unavailable".into()));
        }
        node.advertising = Some(service_type.to_string());
        let browsers: Vec<PeerIdentity> = state
            .nodes
            .iter()
            .filter(|(id, n)| **id != self.me && n.browsing.as_deref() == Some(service_type))
            .map(|(id, _)| id.clone())
            .collect();
        for b in browsers {
            state.emit(&b, TransportEvent::PeerDiscovered(self.me.clone()));
        }
        Ok(())
    }

    async fn stop_advertising(&self) {
        let mut state = self.mesh.lock();
        let Some(service) = state
            .nodes
            .get_mut(&self.me)
            .and_then(|n| n.advertising.take())
        else {
            return;
        };
        let browsers: Vec<PeerIdentity> = state
            .nodes
            .iter()
            .filter(|(id, n)| **id != self.me && n.browsing.as_deref() == Some(service.as_str()))
            .map(|(id, _)| id.clone())
            .collect();
        for b in browsers {
            state.emit(&b, TransportEvent::PeerLost(self.me.clone()));
        }
    }

    async fn start_browsing(&self, service_type: &str) -> Result<(), DiscoveryError> {
        let mut state = self.mesh.lock();
        let node = state
            .nodes
            .get_mut(&self.me)
            .ok_or_else(|| DiscoveryError::BrowseFailed("node left the mesh".into()))?;
        if node.offline {
            return Err(DiscoveryError::BrowseFailed("network unavailable".into()));
        }
        node.browsing = Some(service_type.to_string());
        let mut visible: Vec<PeerIdentity> = state
            .nodes
            .iter()
            .filter(|(id, n)| **id != self.me && n.advertising.as_deref() == Some(service_type))
            .map(|(id, _)| id.clone())
            .collect();
        visible.sort();
        for peer in visible {
            state.emit(&self.me, TransportEvent::PeerDiscovered(peer));
        }
        Ok(())
    }

    async fn stop_browsing(&self) {
        if let Some(node) = self.mesh.lock().nodes.get_mut(&self.me) {
            node.browsing = None;
        }
    }

    async fn invite(
        &self,
        peer: &PeerIdentity,
        context: Option<Vec<u8>>,
    ) -> Result<(), HandshakeError> {
        let (decision, started) = {
            let state = self.mesh.lock();
            let advertising = state
                .nodes
                .get(peer)
                .is_some_and(|n| n.advertising.is_some());
            if !advertising {
                return Err(HandshakeError::UnknownPeer(peer.clone()));
            }
            let started = (state.generation(&self.me), state.generation(peer));
            let (request, responder, decision) = invitation(self.me.clone(), context);
            if !state.emit(peer, TransportEvent::InvitationReceived { request, responder }) {
                return Err(HandshakeError::TransportRejected(format!(
                    "{} is not listening",
                    peer
                )));
            }
            (decision, started)
        };
        match decision.wait().await {
            Ok(true) => {
                let mut state = self.mesh.lock();
                if (state.generation(&self.me), state.generation(peer)) != started {
                    debug!(from = %self.me, to = %peer, "memory mesh: accepted after disconnect");
                    return Err(HandshakeError::Cancelled(peer.clone()));
                }
                debug!(from = %self.me, to = %peer, "memory mesh: invitation accepted");
                state.connect(&self.me, peer);
                Ok(())
            }
            Ok(false) => Err(HandshakeError::Declined(peer.clone())),
            Err(e) => Err(e),
        }
    }

    async fn send(
        &self,
        bytes: &[u8],
        to: &[PeerIdentity],
        _reliability: Reliability,
    ) -> Vec<SendOutcome> {
        let state = self.mesh.lock();
        let links = state
            .nodes
            .get(&self.me)
            .map(|n| n.links.clone())
            .unwrap_or_default();
        to.iter()
            .map(|peer| {
                let result = match state.nodes.get(peer) {
                    _ if !links.contains(peer) => Err(TransportError::NotConnected),
                    Some(n) if n.fail_sends => Err(TransportError::Io("injected failure".into())),
                    Some(_) => {
                        let delivered = state.emit(
                            peer,
                            TransportEvent::DataReceived {
                                peer: self.me.clone(),
                                bytes: bytes.to_vec(),
                            },
                        );
                        if delivered {
                            Ok(())
                        } else {
                            Err(TransportError::LinkClosed)
                        }
                    }
                    None => Err(TransportError::LinkClosed),
                };
                (peer.clone(), result)
            })
            .collect()
    }

    async fn disconnect(&self) {
        let mut state = self.mesh.lock();
        let links: Vec<PeerIdentity> = match state.nodes.get_mut(&self.me) {
            Some(node) => {
                node.generation += 1;
                node.links.iter().cloned().collect()
            }
            None => Vec::new(),
        };
        for peer in links {
            state.sever(&self.me, &peer);
        }
    }

    async fn disconnect_peer(&self, peer: &PeerIdentity) {
        self.mesh.lock().sever(&self.me, peer);
    }
}
