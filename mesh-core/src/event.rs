//! Events the core raises for its consumer.
//!
//! One closed enum instead of a delegate object: the host drains the queue after
//! each call and forwards the events to whatever single-threaded context the
//! consumer runs on.

use std::collections::VecDeque;

use crate::peer::PeerIdentity;
use crate::session::ChatMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A peer became visible while browsing.
    PeerFound(PeerIdentity),
    /// A visible peer went away (or browsing stopped).
    PeerLost(PeerIdentity),
    AdvertisingFailed { reason: String },
    BrowsingFailed { reason: String },
    /// Someone wants to chat. Answer with `respond_to_invitation`.
    InvitationReceived { from: PeerIdentity },
    /// Our invitation was turned down.
    InvitationDeclined(PeerIdentity),
    /// Our invitation got no answer in time.
    InvitationTimedOut(PeerIdentity),
    /// The handshake broke off before completing (link dropped or never confirmed).
    InvitationFailed(PeerIdentity),
    /// Handshake complete; messages can flow.
    Connected(PeerIdentity),
    /// A connected peer is gone. Raised for local disconnects and network drops alike.
    ConnectionLost(PeerIdentity),
    MessageReceived { from: PeerIdentity, message: ChatMessage },
    /// The peer sent the end-of-chat control word.
    ChatEnded { from: PeerIdentity },
}

/// FIFO of pending events, shared by the discovery and session state.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<MeshEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: MeshEvent) {
        tracing::trace!(?event, "queued event");
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<MeshEvent> {
        self.events.pop_front()
    }

    pub fn drain(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
