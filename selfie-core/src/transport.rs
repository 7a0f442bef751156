//! Discovery transport seam. Link-layer advertisement, browsing and delivery live behind
//! this trait; the session logic above it never touches sockets.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DiscoveryError, HandshakeError, TransportError};
use crate::identity::PeerIdentity;
use crate::invitation::{InvitationRequest, InvitationResponder};
use crate::roster::ConnectionState;

/// Delivery class requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    /// Ordered, at-most-once, acknowledged by the link.
    #[default]
    Reliable,
    Unreliable,
}

/// Notifications from the transport. Events for one peer arrive in the order the
/// transport produced them.
#[derive(Debug)]
pub enum TransportEvent {
    PeerDiscovered(PeerIdentity),
    PeerLost(PeerIdentity),
    InvitationReceived {
        request: InvitationRequest,
        responder: InvitationResponder,
    },
    PeerStateChanged {
        peer: PeerIdentity,
        state: ConnectionState,
    },
    DataReceived {
        peer: PeerIdentity,
        bytes: Vec<u8>,
    },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Per-peer outcome of a single `send`.
pub type SendOutcome = (PeerIdentity, Result<(), TransportError>);

#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Make this node visible to browsers of `service_type` and accept invitations.
    async fn start_advertising(&self, service_type: &str) -> Result<(), DiscoveryError>;

    async fn stop_advertising(&self);

    /// Start reporting `PeerDiscovered` / `PeerLost` for `service_type`.
    async fn start_browsing(&self, service_type: &str) -> Result<(), DiscoveryError>;

    async fn stop_browsing(&self);

    /// Invite a discovered peer. Resolves once the remote side decided; on acceptance the
    /// transport follows up with `PeerStateChanged` events.
    async fn invite(
        &self,
        peer: &PeerIdentity,
        context: Option<Vec<u8>>,
    ) -> Result<(), HandshakeError>;

    /// Send `bytes` to every peer in `to`, one result per peer. A failure for one peer
    /// must not prevent delivery to the others.
    async fn send(
        &self,
        bytes: &[u8],
        to: &[PeerIdentity],
        reliability: Reliability,
    ) -> Vec<SendOutcome>;

    /// Drop every link and cancel handshakes in flight. The transport reports
    /// `Disconnected` for each live peer. No handshake that started before this call may
    /// bring a link up afterwards.
    async fn disconnect(&self);

    /// Drop the link to one peer, reporting `Disconnected` if it was up.
    async fn disconnect_peer(&self, peer: &PeerIdentity);
}
