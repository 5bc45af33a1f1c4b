// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Bounded multi-producer single-consumer mailboxes.
//!
//! Receive callbacks run outside the periodic thread and only ever enqueue
//! here; the periodic tick is the single consumer. Posting onto a full
//! mailbox drops the message with a logged error rather than blocking.

use std::collections::VecDeque;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
}

/// The consumer end of a mailbox.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

/// A cloneable producer end.
pub struct MailboxSender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Mailbox<T> {
    /// A mailbox holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// A producer handle for this mailbox.
    pub fn sender(&self) -> MailboxSender<T> {
        MailboxSender {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Take the oldest message, if any.
    pub fn fetch(&self) -> Option<T> {
        self.inner.queue.lock().pop_front()
    }

    /// Drop every queued message. Used when the owner closes.
    pub fn drain(&self) {
        self.inner.queue.lock().clear();
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> MailboxSender<T> {
    /// Post a message. On a full mailbox the message is dropped and an
    /// error is logged; returns whether the message was accepted.
    pub fn post(&self, message: T) -> bool {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            error!(
                "mailbox full ({} messages), dropping incoming message",
                self.inner.capacity
            );
            false
        } else {
            queue.push_back(message);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mbox = Mailbox::new(4);
        let tx = mbox.sender();
        assert!(tx.post(1));
        assert!(tx.post(2));
        assert_eq!(Some(1), mbox.fetch());
        assert_eq!(Some(2), mbox.fetch());
        assert_eq!(None, mbox.fetch());
    }

    #[test]
    fn full_mailbox_drops() {
        let mbox = Mailbox::new(2);
        let tx = mbox.sender();
        assert!(tx.post("a"));
        assert!(tx.post("b"));
        assert!(!tx.post("c"));
        assert_eq!(2, mbox.len());
        assert_eq!(Some("a"), mbox.fetch());
        // Room again.
        assert!(tx.post("d"));
    }

    #[test]
    fn senders_share_the_queue() {
        let mbox = Mailbox::new(8);
        let tx1 = mbox.sender();
        let tx2 = tx1.clone();
        tx1.post(1);
        tx2.post(2);
        assert_eq!(2, mbox.len());
        mbox.drain();
        assert!(mbox.is_empty());
    }
}
