//! Error taxonomy. Nothing here is fatal: every failure degrades to a reported event.

use std::fmt;

use crate::identity::PeerIdentity;
use crate::invitation::InvitationId;

/// Failure reported by a `DiscoveryTransport` for a single operation or peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer is not connected")]
    NotConnected,
    #[error("link closed")]
    LinkClosed,
    #[error("session closed before delivery")]
    SessionClosed,
    #[error("transport reported no result for this peer")]
    NoResult,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Delivery to one peer failed. Never aborts delivery to the remaining peers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("send to {peer} failed: {cause}")]
pub struct SendError {
    pub peer: PeerIdentity,
    pub cause: TransportError,
}

/// Invitation could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("{0} declined the invitation")]
    Declined(PeerIdentity),
    #[error("invitation from {0} expired before a decision")]
    Expired(PeerIdentity),
    #[error("no pending invitation {0}")]
    UnknownInvitation(InvitationId),
    #[error("invitation from {0} was dropped without a decision")]
    Abandoned(PeerIdentity),
    #[error("{0} is not a discovered peer")]
    UnknownPeer(PeerIdentity),
    #[error("no active session")]
    NoSession,
    /// The session was torn down while the handshake was in flight.
    #[error("handshake with {0} was cancelled")]
    Cancelled(PeerIdentity),
    #[error("transport rejected the handshake: {0}")]
    TransportRejected(String),
}

/// Advertising or browsing could not start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("advertising failed: {0}")]
    AdvertiseFailed(String),
    #[error("browsing failed: {0}")]
    BrowseFailed(String),
    #[error("invalid service type {0:?}")]
    InvalidServiceType(String),
}

/// Received bytes could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("{len} bytes from {peer} are neither an image nor text")]
    Unrecognized { peer: PeerIdentity, len: usize },
}

/// Coarse category surfaced to the UI alongside the detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Send,
    Handshake,
    Discovery,
    Payload,
    Closed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Send => "send",
            ErrorKind::Handshake => "handshake",
            ErrorKind::Discovery => "discovery",
            ErrorKind::Payload => "payload",
            ErrorKind::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("session manager has shut down")]
    Closed,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Send(_) => ErrorKind::Send,
            SessionError::Handshake(_) => ErrorKind::Handshake,
            SessionError::Discovery(_) => ErrorKind::Discovery,
            SessionError::Payload(_) => ErrorKind::Payload,
            SessionError::Closed => ErrorKind::Closed,
        }
    }

    /// Human-readable detail for `onError(kind, detail)`.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_variant() {
        let err: SessionError = SendError {
            peer: "Bob".into(),
            cause: TransportError::LinkClosed,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Send);
        assert_eq!(err.detail(), "send to Bob failed: link closed");

        let err: SessionError = DiscoveryError::AdvertiseFailed("no network".into()).into();
        assert_eq!(err.kind(), ErrorKind::Discovery);
        assert_eq!(SessionError::Closed.kind(), ErrorKind::Closed);
    }
}
