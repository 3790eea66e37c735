//! Discovery state: advertise/browse toggles and the visible-peer set.
//!
//! The host owns the radio (sockets); this module decides what its reports mean.

use crate::event::{EventQueue, MeshEvent};
use crate::identity::PeerId;
use crate::peer::{DiscoveredPeerSet, PeerIdentity};

/// Tag for one browse run. Reports carrying an old tag arrived after the run
/// they belong to was stopped, and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowseGeneration(u64);

pub struct Discovery {
    local_id: PeerId,
    advertising: bool,
    browsing: bool,
    generation: u64,
    peers: DiscoveredPeerSet,
}

impl Discovery {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            advertising: false,
            browsing: false,
            generation: 0,
            peers: DiscoveredPeerSet::new(),
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    /// Returns true if advertising was off and is now on.
    pub fn start_advertising(&mut self) -> bool {
        if self.advertising {
            return false;
        }
        self.advertising = true;
        tracing::debug!("advertising started");
        true
    }

    /// Returns true if advertising was on and is now off.
    pub fn stop_advertising(&mut self) -> bool {
        if !self.advertising {
            return false;
        }
        self.advertising = false;
        tracing::debug!("advertising stopped");
        true
    }

    /// Start browsing. Already browsing: returns the running generation unchanged.
    pub fn start_browsing(&mut self) -> BrowseGeneration {
        if !self.browsing {
            self.browsing = true;
            self.generation = self.generation.wrapping_add(1);
            tracing::debug!(generation = self.generation, "browsing started");
        }
        BrowseGeneration(self.generation)
    }

    /// Stop browsing and forget every visible peer, reporting each as lost.
    pub fn stop_browsing(&mut self, events: &mut EventQueue) {
        if !self.browsing {
            return;
        }
        self.browsing = false;
        tracing::debug!(generation = self.generation, "browsing stopped");
        self.forget_all(events);
    }

    /// Generation to tag reports with, or None when not browsing.
    pub fn browse_generation(&self) -> Option<BrowseGeneration> {
        self.browsing.then_some(BrowseGeneration(self.generation))
    }

    fn is_current(&self, generation: BrowseGeneration) -> bool {
        self.browsing && generation.0 == self.generation
    }

    /// Apply a "found" report. Returns true if the peer is new to the set.
    pub fn on_peer_found(
        &mut self,
        generation: BrowseGeneration,
        peer: PeerIdentity,
        events: &mut EventQueue,
    ) -> bool {
        if !self.is_current(generation) {
            tracing::trace!(peer = %peer, "dropping found report from stale browse");
            return false;
        }
        if peer.id == self.local_id {
            return false;
        }
        if !self.peers.insert(peer.clone()) {
            return false;
        }
        tracing::debug!(peer = %peer, "peer found");
        events.push(MeshEvent::PeerFound(peer));
        true
    }

    /// Apply a "lost" report. Returns true if the peer was in the set.
    pub fn on_peer_lost(
        &mut self,
        generation: BrowseGeneration,
        peer_id: &PeerId,
        events: &mut EventQueue,
    ) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        match self.peers.remove(peer_id) {
            Some(peer) => {
                tracing::debug!(peer = %peer, "peer lost");
                events.push(MeshEvent::PeerLost(peer));
                true
            }
            None => false,
        }
    }

    pub fn on_advertising_failed(&mut self, reason: String, events: &mut EventQueue) {
        tracing::warn!(%reason, "advertising failed");
        self.advertising = false;
        events.push(MeshEvent::AdvertisingFailed { reason });
    }

    pub fn on_browsing_failed(&mut self, reason: String, events: &mut EventQueue) {
        tracing::warn!(%reason, "browsing failed");
        self.browsing = false;
        self.forget_all(events);
        events.push(MeshEvent::BrowsingFailed { reason });
    }

    fn forget_all(&mut self, events: &mut EventQueue) {
        for peer in self.peers.drain() {
            events.push(MeshEvent::PeerLost(peer));
        }
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.peers.snapshot()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerIdentity> {
        self.peers.get(id)
    }
}
