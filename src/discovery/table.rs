//! Peer table: the registry of discovered peers

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// One discovered peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer address; also the table key
    pub addr: IpAddr,
    /// Display name the peer announced
    pub name: String,
    /// Stream port the peer accepts connections on
    pub port: u16,
    /// When the peer was last seen by discovery
    pub last_seen: Instant,
}

/// Concurrent map of discovered peers, keyed by address.
///
/// All operations take the single table lock, so readers never observe a
/// half-updated record.
pub struct PeerTable {
    peers: Mutex<HashMap<IpAddr, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a peer or refresh its `last_seen`. Returns true when the
    /// record is newly created (for logging).
    pub fn upsert(&self, addr: IpAddr, name: &str, port: u16) -> bool {
        let mut peers = self.peers.lock();
        let existing = peers.insert(
            addr,
            PeerRecord {
                addr,
                name: name.to_string(),
                port,
                last_seen: Instant::now(),
            },
        );
        existing.is_none()
    }

    /// Remove and return every record older than `timeout`
    pub fn age(&self, timeout: Duration) -> Vec<PeerRecord> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let stale: Vec<IpAddr> = peers
            .values()
            .filter(|record| now.duration_since(record.last_seen) > timeout)
            .map(|record| record.addr)
            .collect();
        stale
            .into_iter()
            .filter_map(|addr| peers.remove(&addr))
            .collect()
    }

    /// Remove and return every record whose address is not in `keep`
    pub fn retain_addrs(&self, keep: &HashSet<IpAddr>) -> Vec<PeerRecord> {
        let mut peers = self.peers.lock();
        let gone: Vec<IpAddr> = peers
            .keys()
            .filter(|addr| !keep.contains(addr))
            .copied()
            .collect();
        gone.into_iter()
            .filter_map(|addr| peers.remove(&addr))
            .collect()
    }

    /// Consistent copy of the table for reconciliation and UI queries
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.lock().values().cloned().collect()
    }

    /// Display name for `addr`, if known
    pub fn display_name(&self, addr: IpAddr) -> Option<String> {
        self.peers.lock().get(&addr).map(|record| record.name.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
