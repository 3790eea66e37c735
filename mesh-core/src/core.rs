//! Host-driven API: MeshCore receives events from the host, returns actions, and
//! queues consumer events.

use crate::discovery::{BrowseGeneration, Discovery};
use crate::event::{EventQueue, MeshEvent};
use crate::identity::{LocalIdentity, PeerId};
use crate::peer::PeerIdentity;
use crate::protocol::{Message, PROTOCOL_VERSION, SERVICE_TYPE};
use crate::session::{
    ChatMessage, ConnectionState, PendingInvitation, SendError, SessionError, SessionManager,
};
use crate::wire::{self, FrameEncodeError};

/// Default time an invitation stays open, in ticks.
pub const DEFAULT_INVITE_TIMEOUT_TICKS: u64 = 30;

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Open a link to the peer if none is up. Sends to that peer queue behind it.
    Connect(PeerId),
    /// Deliver a framed message over the peer's link.
    Send(PeerId, Vec<u8>),
    /// Flush anything queued for the peer, then drop its link.
    Close(PeerId),
}

/// Main coordinator. One per process; the host shares it behind a lock.
pub struct MeshCore {
    identity: LocalIdentity,
    discovery: Discovery,
    session: SessionManager,
    events: EventQueue,
    invite_timeout_ticks: u64,
}

impl MeshCore {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            discovery: Discovery::new(identity.peer_id()),
            session: SessionManager::new(identity.peer()),
            identity,
            events: EventQueue::new(),
            invite_timeout_ticks: DEFAULT_INVITE_TIMEOUT_TICKS,
        }
    }

    /// Set how many ticks an invitation may go unanswered.
    pub fn set_invite_timeout(&mut self, ticks: u64) {
        self.invite_timeout_ticks = ticks;
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    // ---- discovery ----

    pub fn start_advertising(&mut self) -> bool {
        self.discovery.start_advertising()
    }

    pub fn stop_advertising(&mut self) -> bool {
        self.discovery.stop_advertising()
    }

    pub fn is_advertising(&self) -> bool {
        self.discovery.is_advertising()
    }

    pub fn start_browsing(&mut self) -> BrowseGeneration {
        self.discovery.start_browsing()
    }

    pub fn stop_browsing(&mut self) {
        self.discovery.stop_browsing(&mut self.events);
    }

    pub fn browse_generation(&self) -> Option<BrowseGeneration> {
        self.discovery.browse_generation()
    }

    pub fn on_peer_found(&mut self, generation: BrowseGeneration, peer: PeerIdentity) -> bool {
        self.discovery.on_peer_found(generation, peer, &mut self.events)
    }

    pub fn on_peer_lost(&mut self, generation: BrowseGeneration, peer_id: &PeerId) -> bool {
        self.discovery.on_peer_lost(generation, peer_id, &mut self.events)
    }

    pub fn on_advertising_failed(&mut self, reason: impl Into<String>) {
        self.discovery
            .on_advertising_failed(reason.into(), &mut self.events);
    }

    pub fn on_browsing_failed(&mut self, reason: impl Into<String>) {
        self.discovery
            .on_browsing_failed(reason.into(), &mut self.events);
    }

    /// Snapshot of visible peers in discovery order.
    pub fn discovered_peers(&self) -> Vec<PeerIdentity> {
        self.discovery.peers()
    }

    /// Beacon frame for the host to multicast while advertising.
    pub fn beacon_frame(&self, listen_port: u16) -> Result<Vec<u8>, FrameEncodeError> {
        wire::encode_frame(&Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service: SERVICE_TYPE.to_string(),
            peer: self.identity.peer(),
            public_key: self.identity.keypair().public_key().clone(),
            listen_port,
        })
    }

    /// Frame telling browsers we are no longer advertising.
    pub fn goodbye_frame(&self) -> Result<Vec<u8>, FrameEncodeError> {
        wire::encode_frame(&Message::Goodbye {
            protocol_version: PROTOCOL_VERSION,
            peer_id: self.identity.peer_id(),
        })
    }

    // ---- session ----

    /// Invite a discovered peer with the configured timeout.
    pub fn invite(&mut self, peer_id: &PeerId) -> Result<Vec<OutboundAction>, SessionError> {
        let timeout = self.invite_timeout_ticks;
        self.invite_with_timeout(peer_id, timeout)
    }

    pub fn invite_with_timeout(
        &mut self,
        peer_id: &PeerId,
        timeout_ticks: u64,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let peer = self
            .discovery
            .peer(peer_id)
            .cloned()
            .ok_or(SessionError::UnknownPeer(*peer_id))?;
        self.session.invite(peer, timeout_ticks)
    }

    pub fn respond_to_invitation(
        &mut self,
        accept: bool,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        self.session.respond_to_invitation(accept)
    }

    pub fn pending_invitation(&self) -> Option<&PendingInvitation> {
        self.session.pending_invitation()
    }

    /// Frames for every connected peer. Call `record_sent` once the links took them.
    pub fn send(&mut self, body: &str) -> Result<Vec<OutboundAction>, SendError> {
        self.session.send(body)
    }

    /// Add a message the host handed to every link to the transcript.
    pub fn record_sent(&mut self, body: &str) {
        self.session.record_sent(body);
    }

    pub fn end_chat(&mut self) -> Result<Vec<OutboundAction>, SendError> {
        self.session.end_chat(&mut self.events)
    }

    pub fn disconnect(&mut self) -> Vec<OutboundAction> {
        self.session.disconnect(&mut self.events)
    }

    pub fn connection_state(&self, peer_id: &PeerId) -> ConnectionState {
        self.session.connection_state(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.session.connected_peers()
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        self.session.transcript()
    }

    /// The link to `peer_id` is gone (EOF, error, or closed by us).
    pub fn on_link_closed(&mut self, peer_id: PeerId) {
        self.session.on_link_closed(peer_id, &mut self.events);
    }

    /// Process one framed message received over the link to `peer_id`.
    pub fn on_message_received(
        &mut self,
        peer_id: PeerId,
        bytes: &[u8],
    ) -> Result<Vec<OutboundAction>, MessageError> {
        let (msg, _consumed) = wire::decode_frame(bytes).map_err(|_| MessageError::DecodeFailed)?;
        let actions = match msg {
            Message::Invite {
                from,
                timeout_ticks,
            } => self
                .session
                .on_invite(peer_id, from, timeout_ticks, &mut self.events),
            Message::InviteReply { accepted } => {
                self.session
                    .on_invite_reply(peer_id, accepted, &mut self.events)
            }
            Message::Established => {
                self.session.on_established(peer_id, &mut self.events);
                vec![]
            }
            Message::Chat { payload } => {
                self.session.on_chat(peer_id, &payload, &mut self.events)?;
                vec![]
            }
            Message::Beacon { .. } | Message::Goodbye { .. } => {
                tracing::debug!(peer = %peer_id, "ignoring discovery frame on link");
                vec![]
            }
        };
        Ok(actions)
    }

    /// Periodic tick: expire handshakes and unanswered invitations.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        self.session.tick(&mut self.events)
    }

    // ---- events ----

    pub fn poll_event(&mut self) -> Option<MeshEvent> {
        self.events.pop()
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode frame")]
    DecodeFailed,
    #[error("bad chat payload: {0}")]
    Payload(#[from] crate::codec::DecodeError),
}
