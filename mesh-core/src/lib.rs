//! meshchat core: proximity peer discovery, invitation handshake, and chat sessions.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod codec;
pub mod core;
pub mod discovery;
pub mod event;
pub mod identity;
pub mod link;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod wire;

pub use codec::{ChatPayload, DecodeError, END_CHAT};
pub use core::{MeshCore, MessageError, OutboundAction, DEFAULT_INVITE_TIMEOUT_TICKS};
pub use discovery::BrowseGeneration;
pub use event::MeshEvent;
pub use identity::{
    load_or_create_identity, IdentityError, IdentityStore, Keypair, LocalIdentity,
    MemoryIdentityStore, PeerId, PublicKey,
};
pub use link::{LinkCipher, LinkCryptoError, LinkOpener, LinkSalts, LinkSealer, LinkSide};
pub use peer::{DiscoveredPeerSet, PeerIdentity};
pub use protocol::{Message, PROTOCOL_VERSION, SERVICE_TYPE};
pub use session::{ChatMessage, ConnectionState, SendError, Sender, SessionError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
