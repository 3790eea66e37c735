//! Remote peer identity and the ordered set of currently visible peers.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// A remote device as seen on the network. Equality and hashing use the ID only;
/// the display name is whatever the peer announced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub display_name: String,
}

impl PeerIdentity {
    pub fn new(id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Visible peers in the order they were first found. No duplicates.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredPeerSet {
    peers: Vec<PeerIdentity>,
}

impl DiscoveredPeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer. Returns false if it was already present (position is kept).
    pub fn insert(&mut self, peer: PeerIdentity) -> bool {
        if self.contains(&peer.id) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Remove a peer by ID, returning the stored identity if it was present.
    pub fn remove(&mut self, id: &PeerId) -> Option<PeerIdentity> {
        let pos = self.peers.iter().position(|p| p.id == *id)?;
        Some(self.peers.remove(pos))
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|p| p.id == *id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerIdentity> {
        self.peers.iter().find(|p| p.id == *id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Copy of the current list for consumers.
    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        self.peers.clone()
    }

    /// Empty the set, returning what was in it in listing order.
    pub fn drain(&mut self) -> Vec<PeerIdentity> {
        std::mem::take(&mut self.peers)
    }
}
