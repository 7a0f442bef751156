//! LAN wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, PeerIdentity, PublicKey};

/// Current protocol version. Carried in beacons and the link hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence for one service type, with the port links connect to.
    Beacon {
        protocol_version: u8,
        service_type: String,
        identity: PeerIdentity,
        device_id: DeviceId,
        public_key: PublicKey,
        listen_port: u16,
    },
    /// First message on a fresh link, from the inviter.
    Invite {
        identity: PeerIdentity,
        context: Option<Vec<u8>>,
    },
    InviteReply {
        accepted: bool,
    },
    /// Inviter's answer to an accepting reply. The responder brings the link up only
    /// after this arrives.
    InviteConfirm,
    /// Application bytes, opaque to the session.
    Data {
        payload: Vec<u8>,
    },
    /// Graceful leave.
    Leave,
}
