//! Session manager: invitation handshake, per-peer connection state, chat transcript.
//!
//! Handshake, inviter A and invitee B:
//!
//! ```text
//! A: invite()            NotConnected -> Connecting   --Invite-->
//! B: on_invite()         pending invitation, InvitationReceived
//! B: respond(true)       NotConnected -> Connecting   <--InviteReply{accepted}--
//! A: on_invite_reply()   Connecting -> Connected      --Established-->
//! B: on_established()    Connecting -> Connected
//! ```
//!
//! If A and B invite each other at once, the side with the lower peer id keeps
//! the inviter role and takes the other Invite as acceptance; the higher side
//! steps down to invitee and accepts.
//!
//! Any state can fall back to NotConnected (disconnect, link loss, timeout).
//! Connected never goes back to Connecting.

use std::collections::BTreeMap;

use crate::codec::{self, ChatPayload, DecodeError};
use crate::core::OutboundAction;
use crate::event::{EventQueue, MeshEvent};
use crate::identity::PeerId;
use crate::peer::PeerIdentity;
use crate::protocol::Message;
use crate::wire::{self, FrameEncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (NotConnected, Connecting) | (Connecting, Connected) | (_, NotConnected)
        )
    }
}

/// Who wrote a transcript line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    Local,
    Peer(PeerIdentity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: Sender,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Inviter,
    Invitee,
}

struct PeerSession {
    peer: PeerIdentity,
    state: ConnectionState,
    role: Role,
    /// Tick by which a Connecting handshake must complete.
    deadline: u64,
}

/// Resume token for an inbound invitation. Resolving it consumes it.
#[must_use]
pub struct InvitationHandler {
    peer: PeerId,
}

impl InvitationHandler {
    fn resolve(self, accepted: bool) -> Message {
        tracing::debug!(peer = %self.peer, accepted, "invitation resolved");
        Message::InviteReply { accepted }
    }
}

/// Inbound invitation waiting for the local decision.
pub struct PendingInvitation {
    from: PeerIdentity,
    handler: InvitationHandler,
    expires_at: u64,
}

impl PendingInvitation {
    pub fn from(&self) -> &PeerIdentity {
        &self.from
    }
}

pub struct SessionManager {
    local: PeerIdentity,
    sessions: BTreeMap<PeerId, PeerSession>,
    pending: Option<PendingInvitation>,
    transcript: Vec<ChatMessage>,
    tick_count: u64,
}

impl SessionManager {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            sessions: BTreeMap::new(),
            pending: None,
            transcript: Vec::new(),
            tick_count: 0,
        }
    }

    pub fn connection_state(&self, peer_id: &PeerId) -> ConnectionState {
        self.sessions
            .get(peer_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.sessions
            .values()
            .filter(|s| s.state == ConnectionState::Connected)
            .map(|s| s.peer.clone())
            .collect()
    }

    pub fn pending_invitation(&self) -> Option<&PendingInvitation> {
        self.pending.as_ref()
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// Invite `peer`. The outcome arrives later as Connected, InvitationDeclined,
    /// InvitationTimedOut or InvitationFailed.
    pub fn invite(
        &mut self,
        peer: PeerIdentity,
        timeout_ticks: u64,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let state = self.connection_state(&peer.id);
        if state != ConnectionState::NotConnected {
            return Err(SessionError::AlreadyActive {
                peer: peer.id,
                state,
            });
        }
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.from.id == peer.id)
        {
            return Err(SessionError::InvitationPending(peer.id));
        }
        let frame = wire::encode_frame(&Message::Invite {
            from: self.local.clone(),
            timeout_ticks,
        })?;
        let peer_id = peer.id;
        tracing::info!(peer = %peer, timeout_ticks, "inviting peer");
        self.begin_connecting(peer, Role::Inviter, self.tick_count.saturating_add(timeout_ticks))?;
        Ok(vec![
            OutboundAction::Connect(peer_id),
            OutboundAction::Send(peer_id, frame),
        ])
    }

    /// An Invite arrived over the link to `link_peer`.
    ///
    /// Only one invitation is held at a time; another one arriving meanwhile is
    /// declined on the spot.
    pub fn on_invite(
        &mut self,
        link_peer: PeerId,
        from: PeerIdentity,
        timeout_ticks: u64,
        events: &mut EventQueue,
    ) -> Vec<OutboundAction> {
        if from.id != link_peer {
            tracing::warn!(link = %link_peer, claimed = %from.id, "invite identity does not match link");
            return vec![];
        }
        if self.is_connecting_as(&from.id, Role::Inviter) {
            return self.resolve_crossed_invite(from.id, events);
        }
        let state = self.connection_state(&from.id);
        if self.pending.is_some() || state != ConnectionState::NotConnected {
            tracing::info!(peer = %from, ?state, "busy, declining invitation");
            let mut actions = Vec::new();
            if let Ok(frame) = wire::encode_frame(&Message::InviteReply { accepted: false }) {
                actions.push(OutboundAction::Send(from.id, frame));
            }
            if state == ConnectionState::NotConnected {
                actions.push(OutboundAction::Close(from.id));
            }
            return actions;
        }
        tracing::info!(peer = %from, "invitation received");
        self.pending = Some(PendingInvitation {
            from: from.clone(),
            handler: InvitationHandler { peer: from.id },
            expires_at: self.tick_count.saturating_add(timeout_ticks),
        });
        events.push(MeshEvent::InvitationReceived { from });
        vec![]
    }

    /// Apply the local decision to the pending invitation. A second call, or a
    /// call with nothing pending, is `NoPendingInvitation`.
    pub fn respond_to_invitation(
        &mut self,
        accept: bool,
    ) -> Result<Vec<OutboundAction>, SessionError> {
        let PendingInvitation {
            from,
            handler,
            expires_at,
        } = self.pending.take().ok_or(SessionError::NoPendingInvitation)?;
        let frame = wire::encode_frame(&handler.resolve(accept))?;
        let mut actions = vec![OutboundAction::Send(from.id, frame)];
        if accept {
            let deadline = expires_at.max(self.tick_count.saturating_add(1));
            self.begin_connecting(from, Role::Invitee, deadline)?;
        } else {
            tracing::info!(peer = %from, "invitation declined");
            actions.push(OutboundAction::Close(from.id));
        }
        Ok(actions)
    }

    pub fn on_invite_reply(
        &mut self,
        peer_id: PeerId,
        accepted: bool,
        events: &mut EventQueue,
    ) -> Vec<OutboundAction> {
        if !self.is_connecting_as(&peer_id, Role::Inviter) {
            tracing::warn!(peer = %peer_id, accepted, "reply for no outstanding invite");
            return match self.connection_state(&peer_id) {
                ConnectionState::NotConnected if accepted => vec![OutboundAction::Close(peer_id)],
                _ => vec![],
            };
        }
        if !accepted {
            if let Some((peer, _)) = self.mark_not_connected(&peer_id, events) {
                tracing::info!(peer = %peer, "invitation was declined");
                events.push(MeshEvent::InvitationDeclined(peer));
            }
            return vec![OutboundAction::Close(peer_id)];
        }
        self.confirm_handshake(peer_id, events)
    }

    /// Our invite to `peer_id` crossed theirs to us.
    fn resolve_crossed_invite(
        &mut self,
        peer_id: PeerId,
        events: &mut EventQueue,
    ) -> Vec<OutboundAction> {
        if self.local.id < peer_id {
            tracing::info!(peer = %peer_id, "invitations crossed, taking theirs as acceptance");
            return self.confirm_handshake(peer_id, events);
        }
        tracing::info!(peer = %peer_id, "invitations crossed, accepting theirs");
        if let Some(session) = self.sessions.get_mut(&peer_id) {
            session.role = Role::Invitee;
        }
        match wire::encode_frame(&Message::InviteReply { accepted: true }) {
            Ok(frame) => vec![OutboundAction::Send(peer_id, frame)],
            Err(e) => {
                tracing::warn!(peer = %peer_id, error = %e, "could not accept crossed invite");
                vec![]
            }
        }
    }

    /// Inviter side: the peer agreed. Go Connected and tell it so.
    fn confirm_handshake(&mut self, peer_id: PeerId, events: &mut EventQueue) -> Vec<OutboundAction> {
        match wire::encode_frame(&Message::Established) {
            Ok(frame) => {
                self.mark_connected(&peer_id, events);
                vec![OutboundAction::Send(peer_id, frame)]
            }
            Err(e) => {
                tracing::warn!(peer = %peer_id, error = %e, "could not confirm handshake");
                if let Some((peer, _)) = self.mark_not_connected(&peer_id, events) {
                    events.push(MeshEvent::InvitationFailed(peer));
                }
                vec![OutboundAction::Close(peer_id)]
            }
        }
    }

    /// The peer confirmed the handshake. Normally we are the invitee here; an
    /// inviter gets this too when its own Invite crossed the peer's and lost.
    pub fn on_established(&mut self, peer_id: PeerId, events: &mut EventQueue) {
        if self.connection_state(&peer_id) != ConnectionState::Connecting {
            tracing::warn!(peer = %peer_id, "unexpected handshake confirmation");
            return;
        }
        self.mark_connected(&peer_id, events);
    }

    /// Chat payload from `peer_id`. Malformed payloads are returned as errors and
    /// leave the session untouched.
    pub fn on_chat(
        &mut self,
        peer_id: PeerId,
        payload: &[u8],
        events: &mut EventQueue,
    ) -> Result<(), DecodeError> {
        let peer = match self.sessions.get(&peer_id) {
            Some(s) if s.state == ConnectionState::Connected => s.peer.clone(),
            _ => {
                tracing::warn!(peer = %peer_id, "dropping chat from peer not connected");
                return Ok(());
            }
        };
        match codec::decode_payload(payload)? {
            ChatPayload::EndChat => {
                tracing::info!(peer = %peer, "peer ended the chat");
                events.push(MeshEvent::ChatEnded { from: peer });
            }
            ChatPayload::Text(body) => {
                let message = ChatMessage {
                    sender: Sender::Peer(peer.clone()),
                    body,
                };
                self.transcript.push(message.clone());
                events.push(MeshEvent::MessageReceived {
                    from: peer,
                    message,
                });
            }
        }
        Ok(())
    }

    /// Frames carrying `body` for every connected peer. The transcript is left
    /// alone until the host reports the links took them (`record_sent`).
    pub fn send(&mut self, body: &str) -> Result<Vec<OutboundAction>, SendError> {
        let frame = self.chat_frame(codec::encode_message(body))?;
        Ok(self.to_connected(frame))
    }

    /// Every link accepted the frames from `send(body)`.
    pub fn record_sent(&mut self, body: &str) {
        self.transcript.push(ChatMessage {
            sender: Sender::Local,
            body: body.to_string(),
        });
    }

    /// Tell connected peers the chat is over on purpose, then disconnect.
    pub fn end_chat(&mut self, events: &mut EventQueue) -> Result<Vec<OutboundAction>, SendError> {
        let frame = self.chat_frame(codec::encode_end_chat())?;
        let mut actions = self.to_connected(frame);
        actions.extend(self.disconnect(events));
        Ok(actions)
    }

    fn chat_frame(
        &self,
        payload: Result<Vec<u8>, bincode::Error>,
    ) -> Result<Vec<u8>, SendError> {
        if !self
            .sessions
            .values()
            .any(|s| s.state == ConnectionState::Connected)
        {
            return Err(SendError::NotConnected);
        }
        let payload = payload.map_err(FrameEncodeError::Encode)?;
        Ok(wire::encode_frame(&Message::Chat { payload })?)
    }

    fn to_connected(&self, frame: Vec<u8>) -> Vec<OutboundAction> {
        self.sessions
            .values()
            .filter(|s| s.state == ConnectionState::Connected)
            .map(|s| OutboundAction::Send(s.peer.id, frame.clone()))
            .collect()
    }

    /// Drop every connection. Safe to call repeatedly.
    pub fn disconnect(&mut self, events: &mut EventQueue) -> Vec<OutboundAction> {
        let ids: Vec<PeerId> = self.sessions.keys().copied().collect();
        if !ids.is_empty() {
            tracing::info!(peers = ids.len(), "disconnecting session");
        }
        let mut actions = Vec::with_capacity(ids.len());
        for id in ids {
            self.mark_not_connected(&id, events);
            actions.push(OutboundAction::Close(id));
        }
        actions
    }

    /// The host lost the link to `peer_id`.
    pub fn on_link_closed(&mut self, peer_id: PeerId, events: &mut EventQueue) {
        if let Some((peer, ConnectionState::Connecting)) = self.mark_not_connected(&peer_id, events) {
            events.push(MeshEvent::InvitationFailed(peer));
        }
        if let Some(stale) = self.pending.take_if(|p| p.from.id == peer_id) {
            tracing::info!(peer = %peer_id, "inviter went away, dropping invitation");
            events.push(MeshEvent::InvitationFailed(stale.from));
        }
    }

    /// Advance one tick: expire handshakes and stale invitations.
    pub fn tick(&mut self, events: &mut EventQueue) -> Vec<OutboundAction> {
        self.tick_count = self.tick_count.saturating_add(1);
        let now = self.tick_count;
        let mut actions = Vec::new();

        let expired: Vec<(PeerId, Role)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == ConnectionState::Connecting && s.deadline <= now)
            .map(|(id, s)| (*id, s.role))
            .collect();
        for (id, role) in expired {
            if let Some((peer, _)) = self.mark_not_connected(&id, events) {
                tracing::info!(peer = %peer, ?role, "handshake timed out");
                events.push(match role {
                    Role::Inviter => MeshEvent::InvitationTimedOut(peer),
                    Role::Invitee => MeshEvent::InvitationFailed(peer),
                });
            }
            actions.push(OutboundAction::Close(id));
        }

        if let Some(stale) = self.pending.take_if(|p| p.expires_at <= now) {
            tracing::info!(peer = %stale.from, "invitation expired unanswered");
            if self.connection_state(&stale.from.id) == ConnectionState::NotConnected {
                actions.push(OutboundAction::Close(stale.from.id));
            }
            events.push(MeshEvent::InvitationFailed(stale.from));
        }
        actions
    }

    fn is_connecting_as(&self, peer_id: &PeerId, role: Role) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|s| s.state == ConnectionState::Connecting && s.role == role)
    }

    fn begin_connecting(
        &mut self,
        peer: PeerIdentity,
        role: Role,
        deadline: u64,
    ) -> Result<(), SessionError> {
        let from = self.connection_state(&peer.id);
        if !from.can_transition_to(ConnectionState::Connecting) {
            return Err(SessionError::IllegalTransition {
                from,
                to: ConnectionState::Connecting,
            });
        }
        tracing::debug!(peer = %peer, ?role, "-> connecting");
        self.sessions.insert(
            peer.id,
            PeerSession {
                peer,
                state: ConnectionState::Connecting,
                role,
                deadline,
            },
        );
        Ok(())
    }

    fn mark_connected(&mut self, peer_id: &PeerId, events: &mut EventQueue) {
        if let Some(session) = self.sessions.get_mut(peer_id) {
            if session.state.can_transition_to(ConnectionState::Connected) {
                session.state = ConnectionState::Connected;
                tracing::info!(peer = %session.peer, "connected");
                events.push(MeshEvent::Connected(session.peer.clone()));
            }
        }
    }

    /// Move a peer back to NotConnected. Returns the peer and the state it left.
    fn mark_not_connected(
        &mut self,
        peer_id: &PeerId,
        events: &mut EventQueue,
    ) -> Option<(PeerIdentity, ConnectionState)> {
        let session = self.sessions.remove(peer_id)?;
        tracing::debug!(peer = %session.peer, from = ?session.state, "-> not connected");
        if session.state == ConnectionState::Connected {
            tracing::info!(peer = %session.peer, "connection lost");
            events.push(MeshEvent::ConnectionLost(session.peer.clone()));
            if !self
                .sessions
                .values()
                .any(|s| s.state == ConnectionState::Connected)
            {
                self.transcript.clear();
            }
        }
        Some((session.peer, session.state))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer {peer} is already {state:?}")]
    AlreadyActive { peer: PeerId, state: ConnectionState },
    #[error("peer {0} has an invitation waiting for our answer")]
    InvitationPending(PeerId),
    #[error("no pending invitation")]
    NoPendingInvitation,
    #[error("peer {0} is not in the discovered set")]
    UnknownPeer(PeerId),
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no connected peer")]
    NotConnected,
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("transport rejected message: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::wire::decode_frame;

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::new(Keypair::generate().peer_id(), name)
    }

    fn manager() -> SessionManager {
        SessionManager::new(peer("local"))
    }

    fn sent_message(action: &OutboundAction) -> Message {
        match action {
            OutboundAction::Send(_, bytes) => decode_frame(bytes).unwrap().0,
            other => panic!("expected Send, got {other:?}"),
        }
    }

    /// Drive `m` to Connected with `remote` as the inviter side.
    fn connected(m: &mut SessionManager, remote: &PeerIdentity, events: &mut EventQueue) {
        m.invite(remote.clone(), 30).unwrap();
        m.on_invite_reply(remote.id, true, events);
        assert_eq!(m.connection_state(&remote.id), ConnectionState::Connected);
    }

    #[test]
    fn transition_table() {
        use ConnectionState::*;
        assert!(NotConnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(NotConnected));
        assert!(Connecting.can_transition_to(NotConnected));
        assert!(!NotConnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn invite_moves_to_connecting_and_emits_connect_then_invite() {
        let mut m = manager();
        let b = peer("b");
        let actions = m.invite(b.clone(), 30).unwrap();
        assert_eq!(m.connection_state(&b.id), ConnectionState::Connecting);
        assert!(matches!(actions[0], OutboundAction::Connect(id) if id == b.id));
        assert!(matches!(
            sent_message(&actions[1]),
            Message::Invite { timeout_ticks: 30, .. }
        ));
    }

    #[test]
    fn reinviting_connected_peer_is_rejected() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        connected(&mut m, &b, &mut events);
        assert!(matches!(
            m.invite(b.clone(), 30),
            Err(SessionError::AlreadyActive {
                state: ConnectionState::Connected,
                ..
            })
        ));
        assert_eq!(m.connection_state(&b.id), ConnectionState::Connected);
    }

    #[test]
    fn accepted_reply_connects_and_confirms() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        m.invite(b.clone(), 30).unwrap();
        let actions = m.on_invite_reply(b.id, true, &mut events);
        assert!(matches!(sent_message(&actions[0]), Message::Established));
        assert_eq!(events.drain(), vec![MeshEvent::Connected(b)]);
    }

    #[test]
    fn declined_reply_returns_to_not_connected() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        m.invite(b.clone(), 30).unwrap();
        let actions = m.on_invite_reply(b.id, false, &mut events);
        assert_eq!(m.connection_state(&b.id), ConnectionState::NotConnected);
        assert!(matches!(actions[..], [OutboundAction::Close(id)] if id == b.id));
        assert_eq!(events.drain(), vec![MeshEvent::InvitationDeclined(b)]);
    }

    #[test]
    fn invite_times_out_without_connecting() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        m.invite(b.clone(), 30).unwrap();
        for _ in 0..29 {
            assert!(m.tick(&mut events).is_empty());
        }
        assert_eq!(m.connection_state(&b.id), ConnectionState::Connecting);
        let actions = m.tick(&mut events);
        assert!(matches!(actions[..], [OutboundAction::Close(_)]));
        assert_eq!(m.connection_state(&b.id), ConnectionState::NotConnected);
        assert_eq!(events.drain(), vec![MeshEvent::InvitationTimedOut(b.clone())]);

        // A late acceptance does not resurrect the session.
        let late = m.on_invite_reply(b.id, true, &mut events);
        assert!(matches!(late[..], [OutboundAction::Close(_)]));
        assert!(events.is_empty());
        assert_eq!(m.connection_state(&b.id), ConnectionState::NotConnected);
    }

    #[test]
    fn inbound_invite_waits_for_decision() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let a = peer("a");
        assert!(m.on_invite(a.id, a.clone(), 30, &mut events).is_empty());
        assert_eq!(events.drain(), vec![MeshEvent::InvitationReceived { from: a.clone() }]);
        assert_eq!(m.pending_invitation().map(|p| p.from().clone()), Some(a.clone()));
        assert_eq!(m.connection_state(&a.id), ConnectionState::NotConnected);

        let actions = m.respond_to_invitation(true).unwrap();
        assert!(matches!(
            sent_message(&actions[0]),
            Message::InviteReply { accepted: true }
        ));
        assert_eq!(m.connection_state(&a.id), ConnectionState::Connecting);

        m.on_established(a.id, &mut events);
        assert_eq!(m.connection_state(&a.id), ConnectionState::Connected);
        assert_eq!(events.drain(), vec![MeshEvent::Connected(a)]);
    }

    #[test]
    fn responding_twice_is_an_error() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let a = peer("a");
        m.on_invite(a.id, a.clone(), 30, &mut events);
        let actions = m.respond_to_invitation(false).unwrap();
        assert!(matches!(actions.last(), Some(OutboundAction::Close(_))));
        assert!(matches!(
            m.respond_to_invitation(true),
            Err(SessionError::NoPendingInvitation)
        ));
        assert_eq!(m.connection_state(&a.id), ConnectionState::NotConnected);
    }

    #[test]
    fn second_invitation_is_declined_while_one_pending() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let (a, c) = (peer("a"), peer("c"));
        m.on_invite(a.id, a.clone(), 30, &mut events);
        events.drain();
        let actions = m.on_invite(c.id, c.clone(), 30, &mut events);
        assert!(events.is_empty());
        assert!(matches!(
            sent_message(&actions[0]),
            Message::InviteReply { accepted: false }
        ));
        assert!(matches!(actions[1], OutboundAction::Close(id) if id == c.id));
        assert_eq!(m.pending_invitation().map(|p| p.from().id), Some(a.id));
    }

    #[test]
    fn invite_with_mismatched_identity_is_ignored() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let (a, imposter) = (peer("a"), peer("imposter"));
        assert!(m.on_invite(a.id, imposter, 30, &mut events).is_empty());
        assert!(events.is_empty());
        assert!(m.pending_invitation().is_none());
    }

    #[test]
    fn unanswered_invitation_expires() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let a = peer("a");
        m.on_invite(a.id, a.clone(), 3, &mut events);
        m.tick(&mut events);
        m.tick(&mut events);
        assert!(m.pending_invitation().is_some());
        events.drain();
        let actions = m.tick(&mut events);
        assert!(m.pending_invitation().is_none());
        assert!(matches!(actions[..], [OutboundAction::Close(id)] if id == a.id));
        assert_eq!(events.drain(), vec![MeshEvent::InvitationFailed(a)]);
    }

    #[test]
    fn inviter_dropping_link_withdraws_invitation() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let a = peer("a");
        m.on_invite(a.id, a.clone(), 30, &mut events);
        events.drain();
        m.on_link_closed(a.id, &mut events);
        assert!(m.pending_invitation().is_none());
        assert_eq!(events.drain(), vec![MeshEvent::InvitationFailed(a)]);
        assert!(matches!(
            m.respond_to_invitation(true),
            Err(SessionError::NoPendingInvitation)
        ));
    }

    /// Two peers whose ids order as (low, high).
    fn ordered_pair() -> (PeerIdentity, PeerIdentity) {
        let (x, y) = (peer("x"), peer("y"));
        if x.id < y.id {
            (x, y)
        } else {
            (y, x)
        }
    }

    #[test]
    fn crossed_invite_lower_id_takes_it_as_acceptance() {
        let (low, high) = ordered_pair();
        let mut m = SessionManager::new(low);
        let mut events = EventQueue::new();
        m.invite(high.clone(), 30).unwrap();
        let actions = m.on_invite(high.id, high.clone(), 30, &mut events);
        assert!(matches!(sent_message(&actions[0]), Message::Established));
        assert_eq!(m.connection_state(&high.id), ConnectionState::Connected);
        assert_eq!(events.drain(), vec![MeshEvent::Connected(high.clone())]);
        assert!(m.pending_invitation().is_none());

        // Their acceptance of our invite arrives after the fact.
        assert!(m.on_invite_reply(high.id, true, &mut events).is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn crossed_invite_higher_id_steps_down_and_accepts() {
        let (low, high) = ordered_pair();
        let mut m = SessionManager::new(high);
        let mut events = EventQueue::new();
        m.invite(low.clone(), 30).unwrap();
        let actions = m.on_invite(low.id, low.clone(), 30, &mut events);
        assert!(matches!(
            sent_message(&actions[0]),
            Message::InviteReply { accepted: true }
        ));
        assert!(events.is_empty());
        assert_eq!(m.connection_state(&low.id), ConnectionState::Connecting);

        m.on_established(low.id, &mut events);
        assert_eq!(events.drain(), vec![MeshEvent::Connected(low)]);
    }

    #[test]
    fn send_requires_connection() {
        let mut m = manager();
        assert!(matches!(m.send("hi"), Err(SendError::NotConnected)));
        assert!(m.transcript().is_empty());
    }

    #[test]
    fn send_and_receive_fill_transcript() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        connected(&mut m, &b, &mut events);
        events.drain();

        let actions = m.send("hello").unwrap();
        assert!(m.transcript().is_empty());
        m.record_sent("hello");
        assert_eq!(actions.len(), 1);
        match sent_message(&actions[0]) {
            Message::Chat { payload } => assert_eq!(codec::decode_message(&payload).unwrap(), "hello"),
            other => panic!("expected Chat, got {other:?}"),
        }

        m.on_chat(b.id, &codec::encode_message("hi back").unwrap(), &mut events)
            .unwrap();
        assert_eq!(
            m.transcript(),
            &[
                ChatMessage {
                    sender: Sender::Local,
                    body: "hello".into()
                },
                ChatMessage {
                    sender: Sender::Peer(b.clone()),
                    body: "hi back".into()
                },
            ]
        );
        assert!(matches!(
            &events.drain()[..],
            [MeshEvent::MessageReceived { from, .. }] if *from == b
        ));
    }

    #[test]
    fn end_chat_literal_is_not_a_message() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        connected(&mut m, &b, &mut events);
        events.drain();
        m.on_chat(b.id, &codec::encode_end_chat().unwrap(), &mut events)
            .unwrap();
        assert_eq!(events.drain(), vec![MeshEvent::ChatEnded { from: b }]);
        assert!(m.transcript().is_empty());
    }

    #[test]
    fn malformed_chat_keeps_session() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        connected(&mut m, &b, &mut events);
        events.drain();
        assert!(m.on_chat(b.id, &[], &mut events).is_err());
        assert!(events.is_empty());
        assert_eq!(m.connection_state(&b.id), ConnectionState::Connected);
    }

    #[test]
    fn disconnect_is_idempotent_and_reports_loss() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        connected(&mut m, &b, &mut events);
        m.send("one").unwrap();
        events.drain();

        let actions = m.disconnect(&mut events);
        assert!(matches!(actions[..], [OutboundAction::Close(id)] if id == b.id));
        assert_eq!(events.drain(), vec![MeshEvent::ConnectionLost(b.clone())]);
        assert!(m.transcript().is_empty());
        assert!(m.disconnect(&mut events).is_empty());
        assert!(events.is_empty());
        assert!(matches!(m.send("two"), Err(SendError::NotConnected)));
    }

    #[test]
    fn end_chat_sends_literal_then_closes() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        connected(&mut m, &b, &mut events);
        let actions = m.end_chat(&mut events).unwrap();
        match sent_message(&actions[0]) {
            Message::Chat { payload } => assert_eq!(
                codec::decode_payload(&payload).unwrap(),
                ChatPayload::EndChat
            ),
            other => panic!("expected Chat, got {other:?}"),
        }
        assert!(matches!(actions[1], OutboundAction::Close(_)));
        assert_eq!(m.connection_state(&b.id), ConnectionState::NotConnected);
    }

    #[test]
    fn link_loss_while_connecting_fails_invitation() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let b = peer("b");
        m.invite(b.clone(), 30).unwrap();
        m.on_link_closed(b.id, &mut events);
        assert_eq!(events.drain(), vec![MeshEvent::InvitationFailed(b.clone())]);

        connected(&mut m, &b, &mut events);
        events.drain();
        m.on_link_closed(b.id, &mut events);
        assert_eq!(events.drain(), vec![MeshEvent::ConnectionLost(b)]);
    }

    #[test]
    fn invitee_gives_up_without_confirmation() {
        let mut m = manager();
        let mut events = EventQueue::new();
        let a = peer("a");
        m.on_invite(a.id, a.clone(), 2, &mut events);
        m.respond_to_invitation(true).unwrap();
        events.drain();
        m.tick(&mut events);
        m.tick(&mut events);
        assert_eq!(m.connection_state(&a.id), ConnectionState::NotConnected);
        assert_eq!(events.drain(), vec![MeshEvent::InvitationFailed(a)]);
    }
}
