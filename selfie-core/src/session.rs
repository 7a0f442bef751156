//! Session aggregate: roster, discoverable peers, pending invitations and discovery modes.
//! Host-driven: the control loop passes transport notifications in and receives the
//! events to publish. No I/O here.

use tracing::{debug, info, warn};

use crate::broadcast::BroadcastReport;
use crate::error::{HandshakeError, PayloadError, SessionError};
use crate::identity::PeerIdentity;
use crate::invitation::{InvitationId, InvitationRequest, InvitationResponder, PendingInvitations};
use crate::payload::{self, ReceivedPayload};
use crate::roster::{ConnectionState, Peer, Roster};

/// Events published to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Full roster snapshot after any applied transition.
    RosterChanged(Vec<Peer>),
    /// A peer that was Connected dropped. Fires once per drop.
    PeerDisconnected(PeerIdentity),
    PeerDiscovered(PeerIdentity),
    PeerLost(PeerIdentity),
    /// Decide with `SessionHandle::decide(request.id, ..)`.
    InvitationReceived(InvitationRequest),
    DataReceived {
        from: PeerIdentity,
        payload: ReceivedPayload,
    },
    BroadcastFinished(BroadcastReport),
    ActivityChanged(Activity),
    Error(SessionError),
}

/// What the node is doing. Advertising and browsing are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activity {
    #[default]
    Idle,
    Active { advertising: bool, browsing: bool },
}

/// Exists only between the first `start_hosting`/`join_session` and teardown.
#[derive(Debug, Default)]
pub struct Session {
    roster: Roster,
    discovered: Vec<PeerIdentity>,
    invitations: PendingInvitations,
    advertising: bool,
    browsing: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activity(&self) -> Activity {
        Activity::Active {
            advertising: self.advertising,
            browsing: self.browsing,
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn set_advertising(&mut self, on: bool) {
        self.advertising = on;
    }

    pub fn set_browsing(&mut self, on: bool) {
        self.browsing = on;
        if !on {
            self.discovered.clear();
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.roster.connected_peers()
    }

    pub fn discovered_peers(&self) -> &[PeerIdentity] {
        &self.discovered
    }

    pub fn is_discovered(&self, peer: &PeerIdentity) -> bool {
        self.discovered.contains(peer)
    }

    pub fn pending_invitations(&self) -> &PendingInvitations {
        &self.invitations
    }

    pub fn on_peer_discovered(&mut self, peer: PeerIdentity) -> Vec<SessionEvent> {
        if self.discovered.contains(&peer) {
            return vec![];
        }
        debug!(peer = %peer, "peer discovered");
        self.discovered.push(peer.clone());
        vec![SessionEvent::PeerDiscovered(peer)]
    }

    pub fn on_peer_lost(&mut self, peer: PeerIdentity) -> Vec<SessionEvent> {
        let before = self.discovered.len();
        self.discovered.retain(|p| *p != peer);
        if self.discovered.len() == before {
            return vec![];
        }
        debug!(peer = %peer, "peer lost");
        vec![SessionEvent::PeerLost(peer)]
    }

    /// Hold the responder until `decide`/`expire`; surface the request.
    pub fn on_invitation(
        &mut self,
        request: InvitationRequest,
        responder: InvitationResponder,
    ) -> Vec<SessionEvent> {
        info!(from = %request.from, invitation = %request.id, "invitation received");
        self.invitations.insert(responder);
        vec![SessionEvent::InvitationReceived(request)]
    }

    pub fn decide(
        &mut self,
        id: InvitationId,
        accept: bool,
    ) -> Result<PeerIdentity, HandshakeError> {
        self.invitations.decide(id, accept)
    }

    /// Decline an invitation nobody decided in time.
    pub fn expire(&mut self, id: InvitationId) -> Vec<SessionEvent> {
        match self.invitations.expire(id) {
            Some(peer) => {
                warn!(from = %peer, invitation = %id, "invitation expired");
                vec![SessionEvent::Error(HandshakeError::Expired(peer).into())]
            }
            None => vec![],
        }
    }

    pub fn on_peer_state(&mut self, peer: PeerIdentity, state: ConnectionState) -> Vec<SessionEvent> {
        let transition = self.roster.apply(&peer, state);
        if !transition.is_applied() {
            return vec![];
        }
        if state == ConnectionState::Connected {
            info!(peer = %peer, "peer connected");
        }
        let mut events = vec![SessionEvent::RosterChanged(self.roster.all_peers())];
        if transition.is_drop() {
            info!(peer = %peer, "peer dropped");
            events.push(SessionEvent::PeerDisconnected(peer));
        }
        events
    }

    pub fn on_data(&mut self, from: PeerIdentity, bytes: Vec<u8>) -> Vec<SessionEvent> {
        if self.roster.state_of(&from) != Some(ConnectionState::Connected) {
            debug!(peer = %from, "data from a peer not marked connected");
        }
        let len = bytes.len();
        match payload::classify(bytes) {
            Some(payload) => vec![SessionEvent::DataReceived { from, payload }],
            None => {
                warn!(peer = %from, len, "unrecognized payload");
                vec![SessionEvent::Error(
                    PayloadError::Unrecognized { peer: from, len }.into(),
                )]
            }
        }
    }

    /// Explicitly remove a Disconnected peer.
    pub fn forget(&mut self, peer: &PeerIdentity) -> Vec<SessionEvent> {
        if self.roster.forget(peer) {
            vec![SessionEvent::RosterChanged(self.roster.all_peers())]
        } else {
            vec![]
        }
    }

    /// Decline pending invitations and mark every peer Disconnected.
    pub fn teardown(mut self) -> Vec<SessionEvent> {
        let declined = self.invitations.decline_all();
        if !declined.is_empty() {
            debug!(count = declined.len(), "declined pending invitations on teardown");
        }
        let dropped = self.roster.disconnect_all();
        let mut events: Vec<SessionEvent> = dropped
            .into_iter()
            .map(SessionEvent::PeerDisconnected)
            .collect();
        if !self.roster.is_empty() {
            events.push(SessionEvent::RosterChanged(self.roster.all_peers()));
        }
        events
    }
}
