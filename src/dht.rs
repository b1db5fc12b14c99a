//! # Distributed Hash Table State
//!
//! This module holds the node-local DHT state and its concurrency discipline:
//!
//! - [`RoutingTable`]: 160 k-buckets, one per XOR-distance bit class, each an
//!   LRU-ordered list of up to [`BUCKET_SIZE`] peers behind its own mutex
//! - [`IndexStore`]: index address → deduplicated set of item addresses
//! - [`ItemRegistry`]: item address → crawled page record, rank preserved
//!   across overwrites
//!
//! ## Lookup
//!
//! `nearest` is a single-hop responder, not the classical iterative Kademlia
//! lookup: starting at the bucket selected by the most-significant bit of
//! `self ⊕ target`, it walks outward by the alternating offset sequence
//! `0, +1, −1, +2, −2, …` (mirrored where it would leave `[0, 159]`) and
//! answers from the first non-empty bucket — everything there when the bucket
//! holds fewer than α entries, otherwise the α entries closest to the target.
//! Multi-hop convergence is the query engine's job on the client side.
//!
//! ## Locking
//!
//! Bucket and entry mutexes guard only short, non-blocking critical sections
//! and are never held across await points. The outer maps are concurrent;
//! distinct keys never contend.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::address::{self, Address, ADDRESS_BITS};

/// Capacity of one routing bucket.
pub const BUCKET_SIZE: usize = 20;

/// Fan-out bound: peers returned per lookup and probed per hop.
pub const ALPHA: usize = 3;

/// Error kinds raised by DHT state operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DhtError {
    /// Zero XOR distance: a foreign address collides with our own. Must never
    /// happen in practice; fatal for the offending operation only.
    #[error("zero XOR distance: address collides with our own")]
    Collision,
}

/// Seconds since the Unix epoch.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Connection coordinates for a known peer.
///
/// `last_seen` is node-local bookkeeping and stays off the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: Address,
    pub network_address: String,
    #[serde(skip)]
    pub last_seen: i64,
}

impl PeerInfo {
    pub fn new(address: Address, network_address: impl Into<String>) -> Self {
        Self {
            address,
            network_address: network_address.into(),
            last_seen: now_unix(),
        }
    }
}

/// One k-bucket: position 0 is least recently seen, the tail most recent.
#[derive(Debug, Default)]
struct RoutingBucket {
    peers: Vec<PeerInfo>,
}

impl RoutingBucket {
    /// LRU touch: refresh a known peer and move it to the tail, append a new
    /// peer when there is room, otherwise evict the head and append.
    fn touch(&mut self, peer: PeerInfo) {
        if let Some(pos) = self.peers.iter().position(|p| p.address == peer.address) {
            let mut known = self.peers.remove(pos);
            known.last_seen = peer.last_seen;
            self.peers.push(known);
            return;
        }

        if self.peers.len() >= BUCKET_SIZE {
            self.peers.remove(0);
        }
        self.peers.push(peer);
    }

    /// All peers when fewer than `limit`, else the `limit` closest to
    /// `target` by XOR distance.
    fn closest(&self, target: &Address, limit: usize) -> Vec<PeerInfo> {
        if self.peers.len() < limit {
            return self.peers.clone();
        }
        let mut candidates = self.peers.clone();
        candidates.sort_by(|a, b| {
            a.address
                .xor_distance(target)
                .cmp(&b.address.xor_distance(target))
        });
        candidates.truncate(limit);
        candidates
    }
}

/// Offset sequence for the outward bucket walk: `0, +1, −1, +2, −2, …`,
/// mirrored when a step would leave `[0, bits)`. Returns `None` once both
/// directions are exhausted; the sequence visits every bucket index exactly
/// once before that.
fn next_offset(origin: i32, prev: i32) -> Option<i32> {
    let top = (ADDRESS_BITS - 1) as i32;

    let mut next = -prev;
    if prev <= 0 {
        next += 1;
    }

    if origin + next > top && origin - next >= 0 {
        return Some(-next);
    }
    if origin + next < 0 && origin + (-next + 1) <= top {
        return Some(-next + 1);
    }
    if (origin + next > top && origin - next < 0)
        || (origin + next < 0 && origin + (-next + 1) > top)
    {
        return None;
    }

    Some(next)
}

/// Fixed map from XOR-distance bit index to k-bucket. Never resized; buckets
/// may be empty. Each bucket has its own lock, so touches on different bit
/// classes never contend.
pub struct RoutingTable {
    self_address: Address,
    buckets: Vec<Mutex<RoutingBucket>>,
}

impl RoutingTable {
    pub fn new(self_address: Address) -> Self {
        let buckets = (0..ADDRESS_BITS)
            .map(|_| Mutex::new(RoutingBucket::default()))
            .collect();
        Self {
            self_address,
            buckets,
        }
    }

    pub fn self_address(&self) -> &Address {
        &self.self_address
    }

    fn bucket_index(&self, peer_address: &Address) -> Result<usize, DhtError> {
        let distance = self.self_address.xor_distance(peer_address);
        address::msb(&distance)
            .map(|bit| bit as usize)
            .ok_or(DhtError::Collision)
    }

    /// Record contact with a peer, maintaining the LRU bucket discipline.
    /// Inserting our own address is a collision and an internal error.
    pub fn touch(&self, peer: PeerInfo) -> Result<(), DhtError> {
        let index = self.bucket_index(&peer.address)?;
        self.buckets[index]
            .lock()
            .expect("routing bucket lock poisoned")
            .touch(peer);
        Ok(())
    }

    /// Up to `limit` known peers near `target`, from the first non-empty
    /// bucket along the outward walk. Empty when no bucket holds anything.
    pub fn nearest(&self, target: &Address, limit: usize) -> Result<Vec<PeerInfo>, DhtError> {
        let distance = self.self_address.xor_distance(target);
        let origin = address::msb(&distance).ok_or(DhtError::Collision)? as i32;

        let mut offset = 0i32;
        loop {
            let index = (origin + offset) as usize;
            {
                let bucket = self.buckets[index]
                    .lock()
                    .expect("routing bucket lock poisoned");
                if !bucket.peers.is_empty() {
                    return Ok(bucket.closest(target, limit));
                }
            }
            match next_offset(origin, offset) {
                Some(next) => offset = next,
                None => return Ok(Vec::new()),
            }
        }
    }

    /// Number of peers across all buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().expect("routing bucket lock poisoned").peers.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn bucket_peers(&self, index: usize) -> Vec<PeerInfo> {
        self.buckets[index]
            .lock()
            .expect("routing bucket lock poisoned")
            .peers
            .clone()
    }
}

/// A crawled page as stored in the item registry.
///
/// `local_rank` and `rank_samples` are refined asynchronously by the rank
/// loop and survive record overwrites; everything else is last-writer-wins.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub address: Address,
    pub url: String,
    pub title: String,
    pub edges: Vec<Address>,
    pub local_rank: f64,
    pub rank_samples: u64,
}

impl Item {
    /// Build an item record from crawl output. The item address is the SHA-1
    /// of the URL; edges are the addresses of the outgoing hyperlinks.
    pub fn from_page(url: &str, title: &str, edge_urls: &[String]) -> Self {
        Self {
            address: Address::hash(url.as_bytes()),
            url: url.to_string(),
            title: title.to_string(),
            edges: edge_urls
                .iter()
                .map(|edge| Address::hash(edge.as_bytes()))
                .collect(),
            local_rank: 0.0,
            rank_samples: 0,
        }
    }
}

/// Index address → set of item addresses, deduplicated per entry.
///
/// The outer map is concurrent; each entry mutates under its own lock, so
/// `insert` is idempotent on `(index, item)` pairs even under contention.
#[derive(Default)]
pub struct IndexStore {
    entries: DashMap<Address, Arc<Mutex<Vec<Address>>>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain-or-create the entry for `index_address` and add `item_address`
    /// if it is not already present.
    pub fn insert(&self, index_address: Address, item_address: Address) {
        let entry = self.entries.entry(index_address).or_default().clone();
        let mut addresses = entry.lock().expect("index entry lock poisoned");
        if !addresses.contains(&item_address) {
            addresses.push(item_address);
        }
    }

    /// Snapshot of the item addresses stored under `index_address`.
    pub fn load(&self, index_address: &Address) -> Option<Vec<Address>> {
        self.entries.get(index_address).map(|entry| {
            entry
                .value()
                .lock()
                .expect("index entry lock poisoned")
                .clone()
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Item address → item record.
///
/// Same concurrency pattern as [`IndexStore`]; the per-item lock also guards
/// the rank fields mutated by the asynchronous rank loop.
#[derive(Default)]
pub struct ItemRegistry {
    items: DashMap<Address, Arc<Mutex<Item>>>,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an item. A record already present is overwritten, except that
    /// its rank state carries over so asynchronous rank results are not lost.
    /// Returns `true` when the item address was not seen before.
    pub fn store(&self, item: Item) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.items.entry(item.address) {
            Entry::Occupied(occupied) => {
                let slot = occupied.get().clone();
                drop(occupied);
                let mut existing = slot.lock().expect("item lock poisoned");
                let mut replacement = item;
                replacement.local_rank = existing.local_rank;
                replacement.rank_samples = existing.rank_samples;
                *existing = replacement;
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(item)));
                true
            }
        }
    }

    /// Snapshot of the item stored under `address`.
    pub fn load(&self, address: &Address) -> Option<Item> {
        self.items
            .get(address)
            .map(|item| item.value().lock().expect("item lock poisoned").clone())
    }

    /// Apply a rank observation to an item under its lock.
    pub fn record_rank(&self, address: &Address, rank: f64) -> bool {
        let Some(slot) = self.items.get(address).map(|item| item.value().clone()) else {
            return false;
        };
        let mut item = slot.lock().expect("item lock poisoned");
        item.local_rank = rank;
        item.rank_samples += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
