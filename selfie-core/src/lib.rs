//! Selfie-share peer session core.
//! Roster, invitations and broadcast live here; link I/O sits behind `DiscoveryTransport`.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod identity;
pub mod invitation;
pub mod manager;
pub mod memory;
pub mod payload;
pub mod protocol;
pub mod roster;
pub mod session;
pub mod transport;
pub mod wire;

pub use broadcast::BroadcastReport;
pub use config::SessionConfig;
pub use error::{
    DiscoveryError, ErrorKind, HandshakeError, PayloadError, SendError, SessionError,
    TransportError,
};
pub use identity::{DeviceId, Keypair, LocalIdentity, PeerIdentity, PublicKey};
pub use invitation::{InvitationId, InvitationRequest};
pub use manager::{PeerSessionManager, SessionEvents, SessionHandle};
pub use payload::{ImageFormat, Payload, PayloadKind, ReceivedPayload};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use roster::{ConnectionState, Peer};
pub use session::{Activity, SessionEvent};
pub use transport::{DiscoveryTransport, Reliability, TransportEvent, TransportEvents};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
