//! Deferred event scheduler
//!
//! A virtual-time queue of pending callbacks. Components never wait; they
//! `notify` an event for `now + delay` and return. The driving loop pops
//! events in time order (ties in submission order) and runs each to
//! completion before the next, which keeps every run deterministic and
//! replayable.

use alloc::collections::BinaryHeap;
use core::cmp::{Ordering, Reverse};
use core::time::Duration;

struct Scheduled<E> {
    at: Duration,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Time-ordered queue of events on a single simulated timeline
pub struct EventQueue<E> {
    now: Duration,
    next_seq: u64,
    pending: BinaryHeap<Reverse<Scheduled<E>>>,
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            pending: BinaryHeap::new(),
        }
    }

    /// Current simulated time
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule `event` to fire `delay` after the current time
    pub fn notify(&mut self, event: E, delay: Duration) {
        let at = self.now + delay;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Reverse(Scheduled { at, seq, event }));
    }

    /// Take the earliest event and advance time to it
    pub fn pop(&mut self) -> Option<(Duration, E)> {
        let Reverse(next) = self.pending.pop()?;
        self.now = next.at;
        Some((next.at, next.event))
    }

    /// Take the earliest event only if it fires at or before `limit`
    pub fn pop_until(&mut self, limit: Duration) -> Option<(Duration, E)> {
        match self.peek_time() {
            Some(at) if at <= limit => self.pop(),
            _ => None,
        }
    }

    /// Fire time of the earliest pending event
    pub fn peek_time(&self) -> Option<Duration> {
        self.pending.peek().map(|Reverse(next)| next.at)
    }

    /// Move the clock forward without firing anything
    pub fn advance_to(&mut self, time: Duration) {
        if time > self.now {
            self.now = time;
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending event, returning them in firing order
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::with_capacity(self.pending.len());
        while let Some(Reverse(next)) = self.pending.pop() {
            events.push(next.event);
        }
        events
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}
