//! Request table
//!
//! Maps sequence numbers to the response slot of the caller waiting on them.
//! The counter and the map share one lock, so allocating a sequence and
//! registering its slot is atomic with respect to other callers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{MuxError, Result};
use crate::protocol::Frame;

/// Bookkeeping for one request awaiting its response
struct PendingEntry {
    /// Single-slot channel; the table is its only sender
    sender: Sender<Frame>,

    /// When the request was registered
    created_at: Instant,
}

struct TableState {
    /// Last sequence handed out
    last_sequence: u64,

    pending: HashMap<u64, PendingEntry>,
}

/// Thread-safe sequence allocator and response router
pub struct RequestTable {
    state: Mutex<TableState>,
}

impl RequestTable {
    /// Create an empty table; the first sequence handed out is 1
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                last_sequence: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocate the next sequence number
    pub fn next_sequence(&self) -> u64 {
        let mut state = self.state.lock();
        state.last_sequence += 1;
        state.last_sequence
    }

    /// Register a waiting caller for `sequence`
    ///
    /// Returns the receiving end of a single-slot channel. Fails if the
    /// sequence already has an entry.
    pub fn register(&self, sequence: u64) -> Result<Receiver<Frame>> {
        let mut state = self.state.lock();
        if state.pending.contains_key(&sequence) {
            return Err(MuxError::DuplicateSequence(sequence));
        }
        Ok(Self::insert(&mut state, sequence))
    }

    /// Allocate a sequence and register it under a single lock acquisition
    pub fn allocate(&self) -> (u64, Receiver<Frame>) {
        let mut state = self.state.lock();
        // Skip past anything registered by hand with `register`
        loop {
            state.last_sequence += 1;
            let sequence = state.last_sequence;
            if !state.pending.contains_key(&sequence) {
                let receiver = Self::insert(&mut state, sequence);
                return (sequence, receiver);
            }
        }
    }

    fn insert(state: &mut TableState, sequence: u64) -> Receiver<Frame> {
        let (sender, receiver) = channel::bounded(1);
        state.pending.insert(
            sequence,
            PendingEntry {
                sender,
                created_at: Instant::now(),
            },
        );
        receiver
    }

    /// Route a response frame to its waiting caller
    ///
    /// Returns false if nobody is waiting on `sequence`; the frame is dropped.
    /// That happens routinely when a response arrives after its caller timed out.
    pub fn deliver(&self, sequence: u64, frame: Frame) -> bool {
        let entry = self.state.lock().pending.remove(&sequence);

        match entry {
            Some(entry) => {
                // Capacity 1 and this is the only send, so it cannot block.
                // A failed send means the receiver is gone, same as a timeout.
                if entry.sender.try_send(frame).is_err() {
                    tracing::debug!("Receiver for sequence {} already dropped", sequence);
                    return false;
                }
                tracing::trace!(
                    "Delivered sequence {} after {:?}",
                    sequence,
                    entry.created_at.elapsed()
                );
                true
            }
            None => {
                tracing::debug!("Dropping response for unknown sequence {}", sequence);
                false
            }
        }
    }

    /// Remove the entry for `sequence`, if still present
    pub fn evict(&self, sequence: u64) -> bool {
        self.state.lock().pending.remove(&sequence).is_some()
    }

    /// Remove every entry registered longer than `max_age` ago
    ///
    /// Returns the number of entries removed.
    pub fn evict_expired(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|_, entry| entry.created_at.elapsed() <= max_age);
        let evicted = before - state.pending.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} stale pending requests", evicted);
        }
        evicted
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.state.lock().pending.contains_key(&sequence)
    }

    /// Number of requests awaiting a response
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}
