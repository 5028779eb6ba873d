//! Simulated Network
//!
//! A single FIFO shared by every simulated daemon. Messages to or from a
//! failed daemon are dropped, both when queued and when the daemon fails
//! with traffic still in flight.

use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use trellis_core::{DaemonId, Tag};

/// One message in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: DaemonId,
    pub to: DaemonId,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct NetworkState {
    queue: VecDeque<Envelope>,
    failed: BTreeSet<DaemonId>,
    sent: u64,
    dropped: u64,
}

/// Shared in-memory message queue
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message unless either end has failed
    pub fn push(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        if state.failed.contains(&envelope.from) || state.failed.contains(&envelope.to) {
            state.dropped += 1;
            return;
        }
        state.sent += 1;
        state.queue.push_back(envelope);
    }

    /// Take the oldest message
    pub fn pop(&self) -> Option<Envelope> {
        self.state.lock().queue.pop_front()
    }

    /// Take the oldest message matching `filter`, leaving the rest in order
    pub fn take_where<F>(&self, filter: F) -> Option<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        let mut state = self.state.lock();
        let index = state.queue.iter().position(filter)?;
        state.queue.remove(index)
    }

    /// Copy of every message in flight
    pub fn in_flight(&self) -> Vec<Envelope> {
        self.state.lock().queue.iter().cloned().collect()
    }

    /// Get the number of messages in flight
    pub fn pending_message_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Fail a daemon and drop everything it sent or would receive
    pub fn fail(&self, daemon: DaemonId) {
        let mut state = self.state.lock();
        state.failed.insert(daemon);
        let before = state.queue.len();
        state
            .queue
            .retain(|envelope| envelope.from != daemon && envelope.to != daemon);
        state.dropped += (before - state.queue.len()) as u64;
    }

    /// Messages accepted so far
    pub fn sent_count(&self) -> u64 {
        self.state.lock().sent
    }

    /// Messages lost to failed daemons
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }
}
