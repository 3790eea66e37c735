//! LAN discovery: UDP multicast beacons out, beacons and goodbyes in, and a
//! directory of where each peer's link listener lives.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_core::wire::decode_frame;
use mesh_core::{Message, PeerId, PeerIdentity, PublicKey, PROTOCOL_VERSION, SERVICE_TYPE};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::node::Node;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub addr: SocketAddr,
    pub public_key: PublicKey,
    pub last_seen: Instant,
}

/// Last known link address per peer, fed by beacons.
#[derive(Clone, Default)]
pub struct Directory {
    entries: Arc<Mutex<HashMap<PeerId, DirectoryEntry>>>,
}

impl Directory {
    pub async fn addr(&self, peer_id: &PeerId) -> Option<SocketAddr> {
        self.entries.lock().await.get(peer_id).map(|e| e.addr)
    }

    pub async fn public_key(&self, peer_id: &PeerId) -> Option<PublicKey> {
        self.entries
            .lock()
            .await
            .get(peer_id)
            .map(|e| e.public_key.clone())
    }

    /// Record a sighting. Returns true if the peer was not known before.
    pub async fn seen(&self, peer_id: PeerId, addr: SocketAddr, public_key: PublicKey) -> bool {
        self.entries
            .lock()
            .await
            .insert(
                peer_id,
                DirectoryEntry {
                    addr,
                    public_key,
                    last_seen: Instant::now(),
                },
            )
            .is_none()
    }

    pub async fn remove(&self, peer_id: &PeerId) -> bool {
        self.entries.lock().await.remove(peer_id).is_some()
    }

    /// Drop and return every peer not heard from within `timeout` of `now`.
    pub async fn expire(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let mut entries = self.entries.lock().await;
        let stale: Vec<PeerId> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale
    }
}

pub async fn run_discovery(
    node: Node,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let socket = match make_multicast_socket(discovery_port).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            let reason = format!("multicast socket on port {discovery_port}: {e}");
            node.with_core(|c| {
                c.on_advertising_failed(reason.clone());
                c.on_browsing_failed(reason);
            })
            .await;
            return Err(e);
        }
    };
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    tracing::info!(%dest, "discovery running");

    let beacon_task = tokio::spawn(beacon_loop(socket.clone(), node.clone(), dest, transport_port));
    let recv_task = tokio::spawn(recv_loop(socket, node.clone()));
    let timeout_task = tokio::spawn(peer_timeout_loop(node));

    let _ = tokio::try_join!(beacon_task, recv_task, timeout_task);
    Ok(())
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Multicast a beacon every interval while advertising; say goodbye once when
/// advertising turns off.
async fn beacon_loop(socket: Arc<UdpSocket>, node: Node, dest: SocketAddr, transport_port: u16) {
    let mut was_advertising = false;
    loop {
        let (frame, advertising) = node
            .with_core(|c| {
                let advertising = c.is_advertising();
                let frame = if advertising {
                    Some(c.beacon_frame(transport_port))
                } else if was_advertising {
                    Some(c.goodbye_frame())
                } else {
                    None
                };
                (frame, advertising)
            })
            .await;
        was_advertising = advertising;
        match frame {
            Some(Ok(frame)) => {
                if let Err(e) = socket.send_to(&frame, dest).await {
                    tracing::warn!(error = %e, "beacon send failed");
                    node.with_core(|c| c.on_advertising_failed(e.to_string())).await;
                }
            }
            Some(Err(e)) => tracing::error!(error = %e, "cannot encode beacon"),
            None => {}
        }
        tokio::select! {
            _ = tokio::time::sleep(BEACON_INTERVAL) => {}
            _ = node.advertise_changed().notified() => {}
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, node: Node) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let my_id = node.keypair().peer_id();
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                node.with_core(|c| c.on_browsing_failed(e.to_string())).await;
                return Err(e);
            }
        };
        let Ok((msg, _)) = decode_frame(&buf[..n]) else {
            tracing::trace!(%from, "ignoring undecodable datagram");
            continue;
        };
        match msg {
            Message::Beacon {
                protocol_version,
                service,
                peer,
                public_key,
                listen_port,
            } => {
                if protocol_version != PROTOCOL_VERSION || service != SERVICE_TYPE {
                    continue;
                }
                if peer.id == my_id || !beacon_is_consistent(&peer, &public_key) {
                    continue;
                }
                let addr = SocketAddr::new(from.ip(), listen_port);
                if node.directory().seen(peer.id, addr, public_key).await {
                    tracing::debug!(peer = %peer, %addr, "new peer in directory");
                }
                node.with_core(|c| {
                    if let Some(g) = c.browse_generation() {
                        c.on_peer_found(g, peer);
                    }
                })
                .await;
            }
            Message::Goodbye {
                protocol_version,
                peer_id,
            } => {
                if protocol_version != PROTOCOL_VERSION || peer_id == my_id {
                    continue;
                }
                node.directory().remove(&peer_id).await;
                report_lost(&node, peer_id).await;
            }
            _ => {}
        }
    }
}

/// A beacon's peer id must be the one its key derives.
fn beacon_is_consistent(peer: &PeerIdentity, public_key: &PublicKey) -> bool {
    PeerId::from_public_key(public_key.as_bytes()) == peer.id
}

async fn report_lost(node: &Node, peer_id: PeerId) {
    node.with_core(|c| {
        if let Some(g) = c.browse_generation() {
            c.on_peer_lost(g, &peer_id);
        }
    })
    .await;
}

async fn peer_timeout_loop(node: Node) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        for peer_id in node.directory().expire(Instant::now(), PEER_TIMEOUT).await {
            tracing::debug!(peer = %peer_id, "peer beacon timed out");
            report_lost(&node, peer_id).await;
        }
    }
}
