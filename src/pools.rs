//! Free-resource pools for grid slots and pipeline inputs.
//!
//! Both pools are LIFO stacks initialized with the highest index on top, so
//! the first allocation hands out index 0 and a freshly started server fills
//! the grid in layout order.

use std::net::SocketAddr;

/// Pool of free grid slot indices.
#[derive(Debug)]
pub struct SlotPool {
    free: Vec<usize>,
}

impl SlotPool {
    /// All `capacity` slots start free; slot 0 is allocated first.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).rev().collect(),
        }
    }

    /// Take the slot on top of the stack.
    pub fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Return a slot to the top of the stack.
    pub fn release(&mut self, slot: usize) {
        self.free.push(slot);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Order the stack so the lowest free slot is handed out next.
    ///
    /// Compaction relies on this: after a batch of releases the stack holds
    /// arbitrary indices, and both compaction and subsequent admissions must
    /// see the lowest one first.
    pub fn sort_descending(&mut self) {
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }

    /// The slot the next `acquire` would return. Only meaningful after
    /// [`sort_descending`](Self::sort_descending).
    pub fn lowest(&self) -> Option<usize> {
        self.free.last().copied()
    }

    /// Hand out the lowest free slot and take `occupied` back in its place,
    /// keeping the stack sorted. One compaction step.
    pub fn swap_lowest(&mut self, occupied: usize) -> Option<usize> {
        let lowest = self.free.pop()?;
        self.free.push(occupied);
        self.sort_descending();
        Some(lowest)
    }
}

/// Pool of free pipeline inputs.
///
/// The sockets themselves are created at startup and handed to the media
/// pipeline for the life of the process; the pool keeps only their local
/// endpoints, indexed by pipeline input number.
#[derive(Debug)]
pub struct InputPool {
    endpoints: Vec<SocketAddr>,
    free: Vec<usize>,
}

impl InputPool {
    /// `endpoints[i]` must be the local address bound for the pipeline's
    /// i-th input.
    pub fn new(endpoints: Vec<SocketAddr>) -> Self {
        let free = (0..endpoints.len()).rev().collect();
        Self { endpoints, free }
    }

    pub fn capacity(&self) -> usize {
        self.endpoints.len()
    }

    /// Take the input on top of the stack.
    pub fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Return an input to the top of the stack.
    pub fn release(&mut self, input: usize) {
        self.free.push(input);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Loopback endpoint datagrams for input `input` are forwarded to.
    pub fn endpoint(&self, input: usize) -> SocketAddr {
        self.endpoints[input]
    }

    /// Reverse lookup: which pipeline input reads from `endpoint`.
    pub fn index_of(&self, endpoint: SocketAddr) -> Option<usize> {
        self.endpoints.iter().position(|&e| e == endpoint)
    }
}
