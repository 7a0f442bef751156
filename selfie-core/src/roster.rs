//! Session roster: authoritative mapping from peer identity to connection state.
//!
//! Transitions only along Connecting -> Connected, Connecting -> Disconnected and
//! Connected -> Disconnected. A disconnected peer comes back only through a fresh
//! Connecting. Entries stay (as Disconnected) until explicitly forgotten.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::identity::PeerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub identity: PeerIdentity,
    pub state: ConnectionState,
}

/// Outcome of a roster mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        previous: Option<ConnectionState>,
        current: ConnectionState,
    },
    Ignored,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    /// True when an in-session peer dropped (Connected -> Disconnected).
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            Transition::Applied {
                previous: Some(ConnectionState::Connected),
                current: ConnectionState::Disconnected,
            }
        )
    }
}

/// Ordered-by-insertion roster. Single writer: only the session control loop mutates it.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    peers: Vec<Peer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or move a peer to Connecting. Ignored for a Connected peer so a stray
    /// re-handshake cannot downgrade an active link.
    pub fn record_connecting(&mut self, peer: &PeerIdentity) -> Transition {
        match self.position(peer) {
            None => {
                self.peers.push(Peer {
                    identity: peer.clone(),
                    state: ConnectionState::Connecting,
                });
                debug!(peer = %peer, "roster: new peer connecting");
                Transition::Applied {
                    previous: None,
                    current: ConnectionState::Connecting,
                }
            }
            Some(i) => match self.peers[i].state {
                ConnectionState::Connected => {
                    debug!(peer = %peer, "roster: connecting ignored, peer already connected");
                    Transition::Ignored
                }
                ConnectionState::Connecting => Transition::Ignored,
                ConnectionState::Disconnected => self.set(i, ConnectionState::Connecting),
            },
        }
    }

    /// Move a Connecting peer to Connected. Unknown or Disconnected peers are logged and left alone.
    pub fn record_connected(&mut self, peer: &PeerIdentity) -> Transition {
        let Some(i) = self.position(peer) else {
            warn!(peer = %peer, "roster: connected reported for untracked peer");
            return Transition::Ignored;
        };
        match self.peers[i].state {
            ConnectionState::Connecting => self.set(i, ConnectionState::Connected),
            ConnectionState::Connected => Transition::Ignored,
            ConnectionState::Disconnected => {
                warn!(peer = %peer, "roster: connected without a fresh connecting, ignored");
                Transition::Ignored
            }
        }
    }

    /// Move a peer to Disconnected from any live state.
    pub fn record_disconnected(&mut self, peer: &PeerIdentity) -> Transition {
        let Some(i) = self.position(peer) else {
            debug!(peer = %peer, "roster: disconnect for untracked peer");
            return Transition::Ignored;
        };
        match self.peers[i].state {
            ConnectionState::Disconnected => Transition::Ignored,
            _ => self.set(i, ConnectionState::Disconnected),
        }
    }

    /// Dispatch a transport-reported state to the matching `record_*`.
    pub fn apply(&mut self, peer: &PeerIdentity, state: ConnectionState) -> Transition {
        match state {
            ConnectionState::Connecting => self.record_connecting(peer),
            ConnectionState::Connected => self.record_connected(peer),
            ConnectionState::Disconnected => self.record_disconnected(peer),
        }
    }

    /// Identities currently Connected, in insertion order. Broadcast fan-out target.
    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.peers
            .iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| p.identity.clone())
            .collect()
    }

    /// Full roster snapshot.
    pub fn all_peers(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn state_of(&self, peer: &PeerIdentity) -> Option<ConnectionState> {
        self.position(peer).map(|i| self.peers[i].state)
    }

    /// Remove a Disconnected peer. Live peers cannot be forgotten.
    pub fn forget(&mut self, peer: &PeerIdentity) -> bool {
        match self.position(peer) {
            Some(i) if self.peers[i].state == ConnectionState::Disconnected => {
                self.peers.remove(i);
                true
            }
            _ => false,
        }
    }

    /// Teardown: every live peer becomes Disconnected. Returns the peers that were Connected.
    pub fn disconnect_all(&mut self) -> Vec<PeerIdentity> {
        let mut dropped = Vec::new();
        for p in &mut self.peers {
            if p.state == ConnectionState::Connected {
                dropped.push(p.identity.clone());
            }
            p.state = ConnectionState::Disconnected;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn position(&self, peer: &PeerIdentity) -> Option<usize> {
        self.peers.iter().position(|p| &p.identity == peer)
    }

    fn set(&mut self, i: usize, state: ConnectionState) -> Transition {
        let previous = self.peers[i].state;
        self.peers[i].state = state;
        debug!(peer = %self.peers[i].identity, ?previous, current = ?state, "roster transition");
        Transition::Applied {
            previous: Some(previous),
            current: state,
        }
    }
}
