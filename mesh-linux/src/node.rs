//! Node: the handle a consumer holds. Wraps the core behind one lock, runs the
//! actions it returns against the links, and forwards its events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{
    ChatMessage, ConnectionState, Keypair, MeshCore, MeshEvent, OutboundAction, PeerId,
    PeerIdentity, SendError, SessionError,
};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::discovery::Directory;

/// Host tick period. Invitation timeouts are counted in these.
pub const TICK: Duration = Duration::from_secs(1);

/// What a link writer is asked to do.
#[derive(Debug)]
pub enum LinkCommand {
    Frame(Vec<u8>),
    /// Flush queued frames, then shut the link.
    Close,
}

pub type LinkId = u64;

struct LinkHandle {
    id: LinkId,
    tx: mpsc::UnboundedSender<LinkCommand>,
}

/// Outbound link the transport should dial.
pub struct Dial {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub link: LinkId,
    pub rx: mpsc::UnboundedReceiver<LinkCommand>,
}

/// Receivers handed out once at construction.
pub struct NodeChannels {
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    pub dials: mpsc::UnboundedReceiver<Dial>,
}

#[derive(Clone)]
pub struct Node {
    core: Arc<Mutex<MeshCore>>,
    keypair: Arc<Keypair>,
    directory: Directory,
    links: Arc<Mutex<HashMap<PeerId, LinkHandle>>>,
    next_link: Arc<AtomicU64>,
    dial_tx: mpsc::UnboundedSender<Dial>,
    events: mpsc::UnboundedSender<MeshEvent>,
    advertise_changed: Arc<Notify>,
}

impl Node {
    pub fn new(core: MeshCore) -> (Self, NodeChannels) {
        let keypair = Arc::new(core.identity().keypair().clone());
        let (events, events_rx) = mpsc::unbounded_channel();
        let (dial_tx, dials) = mpsc::unbounded_channel();
        let node = Self {
            core: Arc::new(Mutex::new(core)),
            keypair,
            directory: Directory::default(),
            links: Arc::new(Mutex::new(HashMap::new())),
            next_link: Arc::new(AtomicU64::new(1)),
            dial_tx,
            events,
            advertise_changed: Arc::new(Notify::new()),
        };
        (
            node,
            NodeChannels {
                events: events_rx,
                dials,
            },
        )
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub(crate) fn directory(&self) -> &Directory {
        &self.directory
    }

    pub(crate) fn advertise_changed(&self) -> &Notify {
        &self.advertise_changed
    }

    /// Run `f` against the core and forward the events it queued, all under the
    /// core lock so event order matches state order.
    pub(crate) async fn with_core<T>(&self, f: impl FnOnce(&mut MeshCore) -> T) -> T {
        let mut core = self.core.lock().await;
        let out = f(&mut core);
        for event in core.drain_events() {
            let _ = self.events.send(event);
        }
        out
    }

    // ---- consumer API ----

    pub async fn start_advertising(&self) {
        if self.with_core(|c| c.start_advertising()).await {
            self.advertise_changed.notify_one();
        }
    }

    pub async fn stop_advertising(&self) {
        if self.with_core(|c| c.stop_advertising()).await {
            self.advertise_changed.notify_one();
        }
    }

    pub async fn is_advertising(&self) -> bool {
        self.core.lock().await.is_advertising()
    }

    pub async fn start_browsing(&self) {
        self.with_core(|c| c.start_browsing()).await;
    }

    pub async fn stop_browsing(&self) {
        self.with_core(|c| c.stop_browsing()).await;
    }

    pub async fn peers(&self) -> Vec<PeerIdentity> {
        self.core.lock().await.discovered_peers()
    }

    pub async fn transcript(&self) -> Vec<ChatMessage> {
        self.core.lock().await.transcript().to_vec()
    }

    pub async fn connection_state(&self, peer_id: &PeerId) -> ConnectionState {
        self.core.lock().await.connection_state(peer_id)
    }

    pub async fn connected_peers(&self) -> Vec<PeerIdentity> {
        self.core.lock().await.connected_peers()
    }

    pub async fn invite(&self, peer_id: PeerId) -> Result<(), SessionError> {
        let actions = self.with_core(|c| c.invite(&peer_id)).await?;
        self.dispatch(actions).await;
        Ok(())
    }

    pub async fn respond_to_invitation(&self, accept: bool) -> Result<(), SessionError> {
        let actions = self.with_core(|c| c.respond_to_invitation(accept)).await?;
        self.dispatch(actions).await;
        Ok(())
    }

    /// Hand `text` to every connected peer's link. Succeeds once the links took
    /// the bytes; there is no delivery receipt.
    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        let actions = self.with_core(|c| c.send(text)).await?;
        let links = self.links.lock().await;
        for action in actions {
            if let OutboundAction::Send(peer, bytes) = action {
                let handle = links
                    .get(&peer)
                    .ok_or_else(|| SendError::Transport(format!("no link to {peer}")))?;
                handle
                    .tx
                    .send(LinkCommand::Frame(bytes))
                    .map_err(|_| SendError::Transport(format!("link to {peer} closed")))?;
            }
        }
        drop(links);
        self.with_core(|c| c.record_sent(text)).await;
        Ok(())
    }

    pub async fn end_chat(&self) -> Result<(), SendError> {
        let actions = self.with_core(|c| c.end_chat()).await?;
        self.dispatch(actions).await;
        Ok(())
    }

    pub async fn disconnect(&self) {
        let actions = self.with_core(|c| c.disconnect()).await;
        self.dispatch(actions).await;
    }

    // ---- host side ----

    pub(crate) async fn dispatch(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Connect(peer_id) => self.open_link(peer_id).await,
                OutboundAction::Send(peer_id, bytes) => {
                    let links = self.links.lock().await;
                    match links.get(&peer_id) {
                        Some(h) => {
                            let _ = h.tx.send(LinkCommand::Frame(bytes));
                        }
                        None => tracing::warn!(peer = %peer_id, "no link for outbound frame"),
                    }
                }
                OutboundAction::Close(peer_id) => {
                    if let Some(h) = self.links.lock().await.remove(&peer_id) {
                        tracing::debug!(peer = %peer_id, link = h.id, "closing link");
                        let _ = h.tx.send(LinkCommand::Close);
                    }
                }
            }
        }
    }

    async fn open_link(&self, peer_id: PeerId) {
        if self.links.lock().await.contains_key(&peer_id) {
            return;
        }
        let Some(addr) = self.directory.addr(&peer_id).await else {
            tracing::warn!(peer = %peer_id, "no address for peer");
            self.with_core(|c| c.on_link_closed(peer_id)).await;
            return;
        };
        let (link, rx) = self.register_link(peer_id).await;
        if self
            .dial_tx
            .send(Dial {
                peer_id,
                addr,
                link,
                rx,
            })
            .is_err()
        {
            tracing::warn!(peer = %peer_id, "transport not running");
            self.link_closed(peer_id, link).await;
        }
    }

    /// Install a fresh link for `peer_id`, replacing any older one.
    pub(crate) async fn register_link(
        &self,
        peer_id: PeerId,
    ) -> (LinkId, mpsc::UnboundedReceiver<LinkCommand>) {
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(old) = self.links.lock().await.insert(peer_id, LinkHandle { id, tx }) {
            tracing::debug!(peer = %peer_id, old = old.id, new = id, "replacing link");
        }
        (id, rx)
    }

    /// A link ended. Only the peer's current link reports loss to the core.
    pub(crate) async fn link_closed(&self, peer_id: PeerId, link: LinkId) {
        let current = {
            let mut links = self.links.lock().await;
            match links.get(&peer_id) {
                Some(h) if h.id == link => {
                    links.remove(&peer_id);
                    true
                }
                _ => false,
            }
        };
        if current {
            tracing::debug!(peer = %peer_id, link, "link ended");
            self.with_core(|c| c.on_link_closed(peer_id)).await;
        }
    }

    /// One decrypted frame from `peer_id`.
    pub(crate) async fn on_frame(&self, peer_id: PeerId, bytes: &[u8]) {
        match self.with_core(|c| c.on_message_received(peer_id, bytes)).await {
            Ok(actions) => self.dispatch(actions).await,
            Err(e) => tracing::warn!(peer = %peer_id, error = %e, "dropping bad frame"),
        }
    }

    pub(crate) async fn tick(&self) {
        let actions = self.with_core(|c| c.tick()).await;
        self.dispatch(actions).await;
    }
}

/// Drive core timeouts once per tick until the process exits.
pub async fn run_ticker(node: Node) {
    let mut interval = tokio::time::interval(TICK);
    interval.tick().await;
    loop {
        interval.tick().await;
        node.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::LocalIdentity;

    fn node() -> (Node, NodeChannels) {
        Node::new(MeshCore::new(LocalIdentity::generate("test")))
    }

    #[tokio::test]
    async fn send_without_session_fails_cleanly() {
        let (node, _ch) = node();
        assert!(matches!(node.send("hello").await, Err(SendError::NotConnected)));
        node.disconnect().await;
        node.disconnect().await;
    }

    #[tokio::test]
    async fn respond_without_invitation_is_error() {
        let (node, _ch) = node();
        assert!(matches!(
            node.respond_to_invitation(true).await,
            Err(SessionError::NoPendingInvitation)
        ));
    }

    #[tokio::test]
    async fn stop_browsing_forwards_lost_events() {
        let (node, mut ch) = node();
        node.start_browsing().await;
        let peer = LocalIdentity::generate("far").peer();
        node.with_core(|c| {
            let g = c.browse_generation().unwrap();
            c.on_peer_found(g, peer.clone());
        })
        .await;
        node.stop_browsing().await;
        assert_eq!(ch.events.recv().await, Some(MeshEvent::PeerFound(peer.clone())));
        assert_eq!(ch.events.recv().await, Some(MeshEvent::PeerLost(peer)));
        assert!(node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn stale_link_does_not_report_loss() {
        let (node, _ch) = node();
        let peer = LocalIdentity::generate("p").peer_id();
        let (old, _rx_old) = node.register_link(peer).await;
        let (new, _rx_new) = node.register_link(peer).await;
        node.link_closed(peer, old).await;
        assert!(node.links.lock().await.contains_key(&peer));
        node.link_closed(peer, new).await;
        assert!(!node.links.lock().await.contains_key(&peer));
    }

    #[tokio::test]
    async fn invite_without_address_fails_invitation() {
        let (node, mut ch) = node();
        node.start_browsing().await;
        let peer = LocalIdentity::generate("ghost").peer();
        node.with_core(|c| {
            let g = c.browse_generation().unwrap();
            c.on_peer_found(g, peer.clone());
        })
        .await;
        node.invite(peer.id).await.unwrap();
        assert_eq!(ch.events.recv().await, Some(MeshEvent::PeerFound(peer.clone())));
        assert_eq!(ch.events.recv().await, Some(MeshEvent::InvitationFailed(peer.clone())));
        assert_eq!(node.connection_state(&peer.id).await, ConnectionState::NotConnected);
    }

    /// Drive the core to Connected with `peer` without touching any link.
    async fn connected_to(node: &Node, peer: &PeerIdentity) {
        node.with_core(|c| {
            let g = c.start_browsing();
            c.on_peer_found(g, peer.clone());
            c.invite(&peer.id).unwrap();
            let reply = mesh_core::encode_frame(&mesh_core::Message::InviteReply { accepted: true })
                .unwrap();
            c.on_message_received(peer.id, &reply).unwrap();
        })
        .await;
        assert_eq!(node.connection_state(&peer.id).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn unsent_message_stays_out_of_transcript() {
        let (node, _ch) = node();
        let peer = LocalIdentity::generate("far").peer();
        connected_to(&node, &peer).await;
        assert!(matches!(
            node.send("lost words").await,
            Err(SendError::Transport(_))
        ));
        assert!(node.transcript().await.is_empty());
    }

    #[tokio::test]
    async fn sent_message_lands_in_transcript() {
        let (node, _ch) = node();
        let peer = LocalIdentity::generate("near").peer();
        connected_to(&node, &peer).await;
        let (_link, mut rx) = node.register_link(peer.id).await;
        node.send("kept words").await.unwrap();
        assert!(matches!(rx.recv().await, Some(LinkCommand::Frame(_))));
        let transcript = node.transcript().await;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].body, "kept words");
        assert_eq!(transcript[0].sender, mesh_core::Sender::Local);
    }
}
