//! Peer transport and an in-memory committee network
//!
//! Every member gets a `LocalTransport` from a shared `LocalNetwork`. Messages
//! are encoded to bytes on send and decoded on delivery, like a real wire.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ConsensusError;
use crate::operator::OperatorHandle;
use crate::types::{PeerIndex, PeerMessage};

/// Point-to-point and broadcast delivery between committee members
pub trait PeerTransport: Send + Sync {
    /// Send to every other member; returns how many sends succeeded
    fn broadcast(&self, message: &PeerMessage) -> usize;

    /// Send to one member
    fn send(&self, to: PeerIndex, message: &PeerMessage) -> Result<(), ConsensusError>;
}

#[derive(Debug, Default)]
struct PeerSlot {
    handle: Option<OperatorHandle>,
    reachable: bool,
}

#[derive(Debug, Default)]
struct NetworkStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// In-process network connecting the members of one committee
#[derive(Debug, Clone)]
pub struct LocalNetwork {
    peers: Arc<RwLock<Vec<PeerSlot>>>,
    stats: Arc<NetworkStats>,
}

impl LocalNetwork {
    pub fn new(size: PeerIndex) -> Self {
        let peers = (0..size)
            .map(|_| PeerSlot {
                handle: None,
                reachable: true,
            })
            .collect();
        Self {
            peers: Arc::new(RwLock::new(peers)),
            stats: Arc::new(NetworkStats::default()),
        }
    }

    /// Attach a member's operator to the network
    pub fn register(&self, index: PeerIndex, handle: OperatorHandle) {
        if let Some(slot) = self.peers.write().get_mut(index as usize) {
            slot.handle = Some(handle);
        }
    }

    /// Cut a member off (or reconnect it); it neither sends nor receives
    pub fn set_reachable(&self, index: PeerIndex, reachable: bool) {
        if let Some(slot) = self.peers.write().get_mut(index as usize) {
            slot.reachable = reachable;
        }
    }

    pub fn transport(&self, own: PeerIndex) -> LocalTransport {
        LocalTransport {
            own,
            network: self.clone(),
        }
    }

    pub fn messages_delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    fn size(&self) -> PeerIndex {
        self.peers.read().len() as PeerIndex
    }

    fn deliver(&self, from: PeerIndex, to: PeerIndex, data: &[u8]) -> bool {
        let target = {
            let peers = self.peers.read();
            let sender_up = peers.get(from as usize).map(|s| s.reachable).unwrap_or(false);
            match peers.get(to as usize) {
                Some(slot) if sender_up && slot.reachable => slot.handle.clone(),
                _ => None,
            }
        };
        let Some(handle) = target else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let message = match PeerMessage::from_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Undecodable message from {}: {}", from, e);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        if handle.deliver_peer_message(from, message) {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// One member's endpoint on a `LocalNetwork`
#[derive(Debug, Clone)]
pub struct LocalTransport {
    own: PeerIndex,
    network: LocalNetwork,
}

impl PeerTransport for LocalTransport {
    fn broadcast(&self, message: &PeerMessage) -> usize {
        let data = message.to_bytes();
        let sent = (0..self.network.size())
            .filter(|peer| *peer != self.own)
            .filter(|peer| self.network.deliver(self.own, *peer, &data))
            .count();
        tracing::trace!("Broadcast {} from {} reached {} peers", message.kind(), self.own, sent);
        sent
    }

    fn send(&self, to: PeerIndex, message: &PeerMessage) -> Result<(), ConsensusError> {
        if to == self.own {
            return Err(ConsensusError::UnknownPeer(to));
        }
        if self.network.deliver(self.own, to, &message.to_bytes()) {
            Ok(())
        } else {
            Err(ConsensusError::Unreachable(to))
        }
    }
}
