// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Timeout scheduling for the periodic tick.
//!
//! Timeouts carry a typed token instead of a callback: the single owner of
//! all protocol state drains expired tokens each tick and dispatches them
//! itself. That keeps every mutation on the periodic thread and makes
//! cancelling an AR's timers a plain retain over the entries.

use log::debug;

/// Handle to a scheduled timeout, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle(u32);

struct Entry<K> {
    handle: TimeoutHandle,
    fires_at_us: u32,
    token: K,
}

/// A store of pending timeouts keyed by a 32-bit microsecond horizon.
pub struct Scheduler<K> {
    entries: Vec<Entry<K>>,
    next_handle: u32,
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// `true` if `a` is at or after `b` on the wrapping 32-bit clock.
fn reached(now: u32, deadline: u32) -> bool {
    // Less than half the clock range apart in wrapping arithmetic.
    now.wrapping_sub(deadline) < 0x8000_0000
}

impl<K> Scheduler<K> {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 1,
        }
    }

    /// Schedule `token` to fire `delay_us` after `now_us`.
    pub fn schedule(&mut self, now_us: u32, delay_us: u32, token: K) -> TimeoutHandle {
        let handle = TimeoutHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.entries.push(Entry {
            handle,
            fires_at_us: now_us.wrapping_add(delay_us),
            token,
        });
        handle
    }

    /// Cancel a previously scheduled timeout. Returns true if it was still
    /// pending.
    pub fn cancel(&mut self, handle: TimeoutHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.handle != handle);
        before != self.entries.len()
    }

    /// Cancel every pending timeout matching the predicate. Used when an
    /// AR aborts to deactivate all of its timers in one sweep.
    pub fn cancel_matching<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&K) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|e| !predicate(&e.token));
        if before != self.entries.len() {
            debug!("scheduler: cancelled {} timeouts", before - self.entries.len());
        }
    }

    /// Remove and return every token whose deadline has passed.
    pub fn take_expired(&mut self, now_us: u32) -> Vec<K> {
        let mut expired = Vec::new();
        let mut ix = 0;
        while ix < self.entries.len() {
            if reached(now_us, self.entries[ix].fires_at_us) {
                expired.push(self.entries.swap_remove(ix).token);
            } else {
                ix += 1;
            }
        }
        expired
    }

    /// Number of pending timeouts.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_deadline_not_before() {
        let mut sched = Scheduler::new();
        sched.schedule(1_000, 500, "a");
        assert!(sched.take_expired(1_400).is_empty());
        assert_eq!(vec!["a"], sched.take_expired(1_500));
        assert_eq!(0, sched.pending());
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut sched = Scheduler::new();
        let handle = sched.schedule(0, 100, 1u32);
        assert!(sched.cancel(handle));
        assert!(!sched.cancel(handle));
        assert!(sched.take_expired(200).is_empty());
    }

    #[test]
    fn wrapping_deadline() {
        let mut sched = Scheduler::new();
        // Deadline wraps past u32::MAX.
        sched.schedule(u32::MAX - 10, 20, ());
        assert!(sched.take_expired(u32::MAX).is_empty());
        assert_eq!(1, sched.take_expired(9).len());
    }

    #[test]
    fn cancel_matching_sweeps_tokens() {
        let mut sched = Scheduler::new();
        sched.schedule(0, 10, (1, "x"));
        sched.schedule(0, 10, (2, "y"));
        sched.schedule(0, 10, (1, "z"));
        sched.cancel_matching(|(ar, _)| *ar == 1);
        let left = sched.take_expired(10);
        assert_eq!(vec![(2, "y")], left);
    }
}
