//! meshchat wire protocol: message types, version, and service namespace.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};
use crate::peer::PeerIdentity;

/// Current protocol version. Carried in beacons and the link handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Discovery namespace. Beacons for any other service are ignored.
pub const SERVICE_TYPE: &str = "robo-mesh";

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: announce presence and where to reach us.
    Beacon {
        protocol_version: u8,
        service: String,
        peer: PeerIdentity,
        public_key: PublicKey,
        listen_port: u16,
    },
    /// Discovery: stopped advertising; drop us from your list now.
    Goodbye { protocol_version: u8, peer_id: PeerId },
    /// Ask the receiver to join our session. The receiver may hold the invite
    /// for at most `timeout_ticks`.
    Invite { from: PeerIdentity, timeout_ticks: u64 },
    /// Invitee's decision.
    InviteReply { accepted: bool },
    /// Inviter saw the acceptance; both sides are now connected.
    Established,
    /// Chat payload (see codec module).
    Chat { payload: Vec<u8> },
}
