//! Registry of IPSC peer repeaters known to the server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// One registered (or waking-up) peer repeater
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    pub mode: u8,
    pub flags: [u8; 4],
    pub last_seen: Instant,
    pub keep_alive_received: u64,
    pub keep_alive_sent: u64,
    pub registered: bool,
    /// Monotonic registration order, reported in peer-list replies
    index: u64,
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<u32, Peer>,
    next_index: u64,
}

/// Peer map shared between the receive loop, the reply builders and the
/// sweeper. Lookups take the read lock; registration and eviction take
/// the write lock.
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer after a master-register request.
    pub fn upsert(&self, peer_id: u32, addr: SocketAddr, mode: u8, flags: [u8; 4]) {
        let mut guard = self.inner.write().unwrap();
        let RegistryInner { peers, next_index } = &mut *guard;
        let entry = peers.entry(peer_id).or_insert_with(|| {
            tracing::info!("peer {} registered from {}", peer_id, addr);
            let peer = Peer {
                addr,
                mode,
                flags,
                last_seen: Instant::now(),
                keep_alive_received: 0,
                keep_alive_sent: 0,
                registered: true,
                index: *next_index,
            };
            *next_index += 1;
            peer
        });
        entry.addr = addr;
        entry.mode = mode;
        entry.flags = flags;
        entry.registered = true;
        entry.last_seen = Instant::now();
    }

    /// Record a master-alive request from `peer_id`, creating the peer if
    /// the register request was missed.
    pub fn mark_alive(&self, peer_id: u32, addr: SocketAddr) {
        let mut guard = self.inner.write().unwrap();
        let RegistryInner { peers, next_index } = &mut *guard;
        let entry = peers.entry(peer_id).or_insert_with(|| {
            let peer = Peer {
                addr,
                mode: 0,
                flags: [0u8; 4],
                last_seen: Instant::now(),
                keep_alive_received: 0,
                keep_alive_sent: 0,
                registered: true,
                index: *next_index,
            };
            *next_index += 1;
            peer
        });
        entry.addr = addr;
        entry.keep_alive_received += 1;
        entry.last_seen = Instant::now();
    }

    pub fn note_keep_alive_sent(&self, peer_id: u32) {
        if let Some(peer) = self.inner.write().unwrap().peers.get_mut(&peer_id) {
            peer.keep_alive_sent += 1;
        }
    }

    /// Refresh the liveness timestamp without touching any counter.
    pub fn touch(&self, peer_id: u32) {
        if let Some(peer) = self.inner.write().unwrap().peers.get_mut(&peer_id) {
            peer.last_seen = Instant::now();
        }
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().peers.len()
    }

    pub fn get(&self, peer_id: u32) -> Option<Peer> {
        self.inner.read().unwrap().peers.get(&peer_id).cloned()
    }

    /// All peers with their IDs, in registration order.
    pub fn snapshot(&self) -> Vec<(u32, Peer)> {
        let inner = self.inner.read().unwrap();
        let mut peers: Vec<(u32, Peer)> =
            inner.peers.iter().map(|(id, p)| (*id, p.clone())).collect();
        peers.sort_by_key(|(_, p)| p.index);
        peers
    }

    /// Addresses of every registered peer, for traffic fan-out.
    pub fn registered_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .read()
            .unwrap()
            .peers
            .values()
            .filter(|p| p.registered)
            .map(|p| p.addr)
            .collect()
    }

    /// Drop peers that have not been heard from within `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let before = inner.peers.len();
        inner.peers.retain(|id, p| {
            let keep = now.duration_since(p.last_seen) <= max_age;
            if !keep {
                tracing::info!("peer {} timed out, dropping", id);
            }
            keep
        });
        before - inner.peers.len()
    }
}
