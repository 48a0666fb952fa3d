//! Client bookkeeping.
//!
//! Clients are identified by the source address of their datagrams; a peer
//! that changes its source port is a new client. Every admitted client is a
//! viewer of the composite; a client that additionally holds a pipeline
//! input and a grid slot is a publisher whose video is mixed in.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Per-client record.
#[derive(Debug, Clone, Copy)]
pub struct Client {
    /// When the last datagram from this client arrived.
    pub last_activity: Instant,
    /// Pipeline input held while publishing.
    pub input: Option<usize>,
    /// Grid slot held while publishing.
    pub slot: Option<usize>,
}

impl Client {
    fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            input: None,
            slot: None,
        }
    }

    /// A publisher holds a pipeline input (and, pairwise, a slot).
    pub fn is_publisher(&self) -> bool {
        self.input.is_some()
    }
}

/// All currently known clients, keyed by remote endpoint.
///
/// A `BTreeMap` keeps iteration deterministic (fan-out order, compaction
/// candidate order) and gives the endpoint ordering the key needs.
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: BTreeMap<SocketAddr, Client>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.clients.contains_key(&addr)
    }

    /// Record a datagram from `addr`, inserting the client when unknown.
    /// Returns `true` for a newly admitted client.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.clients.entry(addr) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().last_activity = now;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Client::new(now));
                true
            }
        }
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&Client> {
        self.clients.get(&addr)
    }

    pub fn get_mut(&mut self, addr: SocketAddr) -> Option<&mut Client> {
        self.clients.get_mut(&addr)
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<Client> {
        self.clients.remove(&addr)
    }

    /// Every known endpoint, in address order. All clients receive the
    /// composite, so this is the fan-out list.
    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.clients.keys().copied()
    }

    pub fn publisher_count(&self) -> usize {
        self.clients.values().filter(|c| c.is_publisher()).count()
    }

    /// Slots currently held by publishers.
    pub fn assigned_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.clients.values().filter_map(|c| c.slot)
    }

    /// The publisher holding the highest slot, when that slot is above
    /// `slot`. Compacting from the top down moves each publisher at most
    /// once.
    pub fn publisher_above(&self, slot: usize) -> Option<SocketAddr> {
        self.clients
            .iter()
            .filter_map(|(addr, c)| c.slot.map(|s| (s, *addr)))
            .max_by_key(|(s, _)| *s)
            .filter(|(s, _)| *s > slot)
            .map(|(_, addr)| addr)
    }

    /// Endpoints whose last datagram is older than `idle_limit`.
    pub fn idle_since(&self, now: Instant, idle_limit: Duration) -> Vec<SocketAddr> {
        self.clients
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_activity) > idle_limit)
            .map(|(addr, _)| *addr)
            .collect()
    }
}
