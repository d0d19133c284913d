//! The set of known peers.
//!
//! [`AddressBook`] is shared between the dispatcher's handler tasks and the
//! owner of the server, so every access goes through one lock. The book also
//! owns the node's own address and never lets it in as a peer.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::address::NetAddress;

#[derive(Debug)]
struct BookInner {
    own: NetAddress,
    peers: HashSet<NetAddress>,
}

/// Concurrency-safe set of peer addresses.
///
/// Cloning is cheap and yields a handle to the same book.
#[derive(Debug, Clone)]
pub struct AddressBook {
    inner: Arc<RwLock<BookInner>>,
    rng: Arc<Mutex<StdRng>>,
}

impl AddressBook {
    /// Creates an empty book for a node reachable at `own`.
    #[must_use]
    pub fn new(own: NetAddress) -> Self {
        Self::with_rng(own, StdRng::from_entropy())
    }

    /// Creates an empty book whose random choices are reproducible.
    #[must_use]
    pub fn seeded(own: NetAddress, seed: u64) -> Self {
        Self::with_rng(own, StdRng::seed_from_u64(seed))
    }

    fn with_rng(own: NetAddress, rng: StdRng) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BookInner {
                own,
                peers: HashSet::new(),
            })),
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Returns the node's own address.
    #[must_use]
    pub fn own_address(&self) -> NetAddress {
        self.inner.read().own.clone()
    }

    /// Replaces the host of the node's own address, keeping its port.
    ///
    /// If the new own address was known as a peer it is dropped from the book.
    pub fn set_own_host(&self, host: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.own.host = host.into();
        let own = inner.own.clone();
        inner.peers.remove(&own);
    }

    /// Adds a peer. Returns true if it was not already present.
    ///
    /// The node's own address is never inserted.
    pub fn insert(&self, addr: NetAddress) -> bool {
        let mut inner = self.inner.write();
        if addr == inner.own {
            return false;
        }
        inner.peers.insert(addr)
    }

    /// Removes a peer. Returns true if it was present.
    pub fn remove(&self, addr: &NetAddress) -> bool {
        self.inner.write().peers.remove(addr)
    }

    /// Returns true if `addr` is a known peer.
    #[must_use]
    pub fn contains(&self, addr: &NetAddress) -> bool {
        self.inner.read().peers.contains(addr)
    }

    /// Returns the number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Returns true if no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Returns a copy of all known peers, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NetAddress> {
        let mut peers: Vec<_> = self.inner.read().peers.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Picks one peer uniformly at random, or `None` if the book is empty.
    #[must_use]
    pub fn random_peer(&self) -> Option<NetAddress> {
        let mut peers = self.snapshot();
        if peers.is_empty() {
            return None;
        }
        let idx = self.rng.lock().gen_range(0..peers.len());
        Some(peers.swap_remove(idx))
    }

    /// Returns `min(count, len)` distinct peers chosen at random.
    #[must_use]
    pub fn sample(&self, count: usize) -> Vec<NetAddress> {
        let mut peers = self.snapshot();
        peers.shuffle(&mut *self.rng.lock());
        peers.truncate(count);
        peers
    }
}
