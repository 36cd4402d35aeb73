//! Upload slots: a global cap on concurrent uploads plus a per-peer cap,
//! with a queue whose reservations expire if the peer stops retrying.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of asking for an upload slot.
#[derive(Debug)]
pub enum SlotResult {
    /// A slot was granted; hold the guard for the transfer's lifetime.
    Granted(SlotGuard),
    /// No slot free; the peer holds this 1-based queue position and
    /// should retry. The reservation expires if it does not.
    Queued(usize),
}

#[derive(Debug)]
pub struct UploadSlots {
    state: Mutex<SlotsState>,
    expiry: Duration,
}

#[derive(Debug)]
struct SlotsState {
    total: usize,
    per_peer: usize,
    active_total: usize,
    active: HashMap<String, usize>,
    /// Waiting peers in arrival order, with their last retry time.
    waiting: Vec<(String, Instant)>,
}

impl UploadSlots {
    pub fn new(total: usize, per_peer: usize, expiry: Duration) -> Arc<UploadSlots> {
        Arc::new(UploadSlots {
            state: Mutex::new(SlotsState {
                total,
                per_peer,
                active_total: 0,
                active: HashMap::new(),
                waiting: Vec::new(),
            }),
            expiry,
        })
    }

    pub fn set_limits(&self, total: usize, per_peer: usize) {
        let mut state = self.state.lock().unwrap();
        state.total = total;
        state.per_peer = per_peer;
    }

    /// Request a slot for `alias`.
    pub fn try_acquire(self: &Arc<Self>, alias: &str) -> SlotResult {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let expiry = self.expiry;
        state.waiting.retain(|(_, seen)| now.duration_since(*seen) < expiry);

        // Per-peer cap holds regardless of queue state.
        let peer_active = state.active.get(alias).copied().unwrap_or(0);
        if peer_active >= state.per_peer {
            return SlotResult::Queued(Self::requeue(&mut state, alias, now));
        }

        let free = state.total.saturating_sub(state.active_total);
        let ahead = state
            .waiting
            .iter()
            .take_while(|(waiter, _)| waiter != alias)
            .count();

        if free > ahead {
            // Enough free slots to cover everyone ahead of us and us.
            state.waiting.retain(|(waiter, _)| waiter != alias);
            state.active_total += 1;
            *state.active.entry(alias.to_string()).or_insert(0) += 1;
            SlotResult::Granted(SlotGuard {
                slots: Arc::clone(self),
                alias: alias.to_string(),
            })
        } else {
            SlotResult::Queued(Self::requeue(&mut state, alias, now))
        }
    }

    /// Refresh or append the waiter and return its 1-based position.
    fn requeue(state: &mut SlotsState, alias: &str, now: Instant) -> usize {
        if let Some(pos) = state.waiting.iter().position(|(waiter, _)| waiter == alias) {
            state.waiting[pos].1 = now;
            pos + 1
        } else {
            state.waiting.push((alias.to_string(), now));
            state.waiting.len()
        }
    }

    fn release(&self, alias: &str) {
        let mut state = self.state.lock().unwrap();
        state.active_total = state.active_total.saturating_sub(1);
        if let Some(count) = state.active.get_mut(alias) {
            *count -= 1;
            if *count == 0 {
                state.active.remove(alias);
            }
        }
    }

    /// Currently active uploads.
    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active_total
    }
}

/// Holds one granted slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<UploadSlots>,
    alias: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.release(&self.alias);
    }
}
