//! Invitation handshake: mutual consent before a remote peer is admitted.
//!
//! The transport creates a request with [`invitation`], hands the request and its
//! [`InvitationResponder`] to the session, and awaits the [`PendingDecision`]. The responder
//! resolves at most once; a responder dropped unresolved reads as [`HandshakeError::Abandoned`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::HandshakeError;
use crate::identity::PeerIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvitationId(uuid::Uuid);

impl InvitationId {
    pub fn new() -> Self {
        InvitationId(uuid::Uuid::new_v4())
    }
}

impl Default for InvitationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to pick an invitation on a console.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

impl std::str::FromStr for InvitationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(InvitationId)
    }
}

/// An inbound invitation. Ephemeral: lives from receipt until decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationRequest {
    pub id: InvitationId,
    pub from: PeerIdentity,
    pub context: Option<Vec<u8>>,
}

/// Create a request plus its one-shot decision pair.
pub fn invitation(
    from: PeerIdentity,
    context: Option<Vec<u8>>,
) -> (InvitationRequest, InvitationResponder, PendingDecision) {
    let (tx, rx) = oneshot::channel();
    let request = InvitationRequest {
        id: InvitationId::new(),
        from: from.clone(),
        context,
    };
    let responder = InvitationResponder {
        id: request.id,
        from: from.clone(),
        tx: Some(tx),
    };
    (request, responder, PendingDecision { from, rx })
}

/// Decision side of an invitation. Resolves at most once.
#[derive(Debug)]
pub struct InvitationResponder {
    id: InvitationId,
    from: PeerIdentity,
    tx: Option<oneshot::Sender<bool>>,
}

impl InvitationResponder {
    pub fn id(&self) -> InvitationId {
        self.id
    }

    pub fn from(&self) -> &PeerIdentity {
        &self.from
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    /// Deliver the decision to the transport. Errors if already resolved or if the
    /// transport stopped waiting (link gone).
    pub fn respond(&mut self, accept: bool) -> Result<(), HandshakeError> {
        let tx = self
            .tx
            .take()
            .ok_or(HandshakeError::UnknownInvitation(self.id))?;
        tx.send(accept).map_err(|_| {
            HandshakeError::TransportRejected(format!(
                "transport stopped waiting for the decision on {}",
                self.from
            ))
        })
    }
}

/// Transport side of an invitation: await the decision.
#[derive(Debug)]
pub struct PendingDecision {
    from: PeerIdentity,
    rx: oneshot::Receiver<bool>,
}

impl PendingDecision {
    pub async fn wait(self) -> Result<bool, HandshakeError> {
        self.rx.await.map_err(|_| HandshakeError::Abandoned(self.from))
    }
}

/// Inbound invitations awaiting a decision, keyed by id. Each is independent of the others.
#[derive(Debug, Default)]
pub struct PendingInvitations {
    pending: HashMap<InvitationId, InvitationResponder>,
}

impl PendingInvitations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, responder: InvitationResponder) {
        self.pending.insert(responder.id(), responder);
    }

    /// Resolve one invitation. Returns the inviting peer.
    pub fn decide(
        &mut self,
        id: InvitationId,
        accept: bool,
    ) -> Result<PeerIdentity, HandshakeError> {
        let mut responder = self
            .pending
            .remove(&id)
            .ok_or(HandshakeError::UnknownInvitation(id))?;
        debug!(invitation = %id, from = %responder.from(), accept, "invitation decided");
        responder.respond(accept)?;
        Ok(responder.from.clone())
    }

    /// Resolve as declined because nobody decided in time.
    pub fn expire(&mut self, id: InvitationId) -> Option<PeerIdentity> {
        let mut responder = self.pending.remove(&id)?;
        let _ = responder.respond(false);
        Some(responder.from.clone())
    }

    /// Decline everything still pending (teardown). Returns the inviting peers.
    pub fn decline_all(&mut self) -> Vec<PeerIdentity> {
        self.pending
            .drain()
            .map(|(_, mut responder)| {
                let _ = responder.respond(false);
                responder.from.clone()
            })
            .collect()
    }

    /// Find a pending invitation by the short id shown to users.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<InvitationId> {
        let mut matches = self
            .pending
            .keys()
            .filter(|id| id.0.simple().to_string().starts_with(prefix));
        let first = matches.next().copied();
        match matches.next() {
            Some(_) => None,
            None => first,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_reaches_transport() {
        let (req, responder, decision) = invitation("Bob".into(), Some(b"hi".to_vec()));
        let mut pending = PendingInvitations::new();
        pending.insert(responder);
        assert_eq!(pending.decide(req.id, true).unwrap(), PeerIdentity::new("Bob"));
        assert_eq!(decision.wait().await, Ok(true));
    }

    #[tokio::test]
    async fn deciding_twice_is_an_error() {
        let (req, responder, decision) = invitation("Bob".into(), None);
        let mut pending = PendingInvitations::new();
        pending.insert(responder);
        pending.decide(req.id, false).unwrap();
        assert_eq!(
            pending.decide(req.id, true),
            Err(HandshakeError::UnknownInvitation(req.id))
        );
        assert_eq!(decision.wait().await, Ok(false));
    }

    #[tokio::test]
    async fn responder_resolves_once() {
        let (_req, mut responder, _decision) = invitation("Bob".into(), None);
        responder.respond(true).unwrap();
        assert!(responder.is_resolved());
        assert!(matches!(
            responder.respond(true),
            Err(HandshakeError::UnknownInvitation(_))
        ));
    }

    #[tokio::test]
    async fn dropped_responder_reads_as_abandoned() {
        let (_req, responder, decision) = invitation("Bob".into(), None);
        drop(responder);
        assert_eq!(
            decision.wait().await,
            Err(HandshakeError::Abandoned("Bob".into()))
        );
    }

    #[tokio::test]
    async fn transport_gone_is_rejected() {
        let (req, responder, decision) = invitation("Bob".into(), None);
        drop(decision);
        let mut pending = PendingInvitations::new();
        pending.insert(responder);
        assert!(matches!(
            pending.decide(req.id, true),
            Err(HandshakeError::TransportRejected(_))
        ));
    }

    #[tokio::test]
    async fn decline_all_resolves_every_pending() {
        let mut pending = PendingInvitations::new();
        let mut decisions = Vec::new();
        for name in ["A", "B"] {
            let (_req, responder, decision) = invitation(name.into(), None);
            pending.insert(responder);
            decisions.push(decision);
        }
        assert_eq!(pending.decline_all().len(), 2);
        assert!(pending.is_empty());
        for d in decisions {
            assert_eq!(d.wait().await, Ok(false));
        }
    }

    #[test]
    fn find_by_prefix_matches_display_form() {
        let (req, responder, _decision) = invitation("Bob".into(), None);
        let mut pending = PendingInvitations::new();
        pending.insert(responder);
        assert_eq!(pending.find_by_prefix(&req.id.to_string()), Some(req.id));
        assert_eq!(pending.find_by_prefix("zz"), None);
    }
}
