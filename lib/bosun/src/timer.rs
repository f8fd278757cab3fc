//! Deadline-based timer service.
//!
//! The server arms a handful of timers (per-player idle timeouts, the
//! reconnect grace window, the end-of-match cool-down) and needs them to be
//! cancellable and rearm-safe without spawning a thread per timer. Timers
//! are kept in a deadline-ordered heap; cancellation removes the entry from
//! the id table, so an already-queued heap node for a cancelled timer fires
//! into nothing.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

pub type TimerId = u64;

pub struct Timers<T> {
    deadlines: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, T>,
    next_id: TimerId,
}

impl<T> Timers<T> {
    #[inline]
    pub fn new() -> Timers<T> {
        Timers {
            deadlines: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    /// Number of armed (not yet fired or cancelled) timers.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arms a timer firing `event` once `deadline` is reached.
    #[inline]
    pub fn schedule(&mut self, deadline: Instant, event: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.deadlines.push(Reverse((deadline, id)));
        self.entries.insert(id, event);

        id
    }

    /// Disarms a timer. Returns false if it already fired or was cancelled.
    #[inline]
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Pops every timer whose deadline has passed, in deadline order.
    /// Cancelled entries are dropped silently.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();

        while let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }

            self.deadlines.pop();

            if let Some(event) = self.entries.remove(&id) {
                fired.push(event);
            }
        }

        fired
    }
}
