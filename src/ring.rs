//! Bounded SPSC ring buffer of message records.
//!
//! One producer, one consumer, fixed capacity chosen at init. One slot is
//! kept as a sentinel, so a ring of capacity `C` holds at most `C - 1`
//! unread records. The producer only advances `head`, the consumer only
//! advances `tail`; a full ring rejects the write and never overwrites.
//!
//! This is the primary cross-core synchronization primitive: the producer
//! publishes a record with a release store on `head`, the consumer observes
//! it with an acquire load.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{Error, Message, Result};

/// Bounded single-producer/single-consumer queue of [`Message`] records.
pub struct Ring {
    slots: Box<[UnsafeCell<Message>]>,
    /// Next slot to write; owned by the producer.
    head: AtomicUsize,
    /// Next slot to read; owned by the consumer.
    tail: AtomicUsize,
}

// Safety: slot `i` is written only by the single producer while
// `head == i` and read only by the single consumer while `tail == i`;
// the release store on `head` after the payload write and the acquire
// load of `head` on the consumer side order the accesses. Callers uphold
// the one-producer/one-consumer contract.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Create a ring with `capacity` slots (`capacity - 1` usable).
    ///
    /// `capacity` is clamped to at least 2.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(Message::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Usable capacity: one slot stays empty between head and tail.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of unread records.
    pub fn messages_waiting(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            self.slots.len() - tail + head
        }
    }

    /// Number of records that can still be written.
    pub fn slots_available(&self) -> usize {
        self.capacity() - self.messages_waiting()
    }

    /// Append a record. Producer-side operation.
    ///
    /// Fails with [`Error::MailboxFull`] when no slot is available; head and
    /// tail are left untouched in that case.
    pub fn write(&self, message: Message) -> Result<()> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let next = self.advance(head);
        if next == tail {
            return Err(Error::MailboxFull);
        }
        // Safety: the producer owns slot `head` until the release store below.
        unsafe { *self.slots[head].get() = message };
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Read the oldest record without removing it. Consumer-side operation.
    pub fn peek(&self) -> Option<Message> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        // Safety: the consumer owns slot `tail` until it advances `tail`.
        Some(unsafe { *self.slots[tail].get() })
    }

    /// Remove and return the oldest record. Consumer-side operation.
    pub fn pop(&self) -> Option<Message> {
        let message = self.peek()?;
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store(self.advance(tail), Ordering::Release);
        Some(message)
    }

    /// Discard every unread record by moving tail onto head.
    /// Consumer-side operation.
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }

    fn advance(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::msg;

    fn probe(primary: u32) -> Message {
        Message {
            kind: msg::TEST,
            primary,
            ..Default::default()
        }
    }

    #[test]
    fn write_pop_roundtrip() {
        let ring = Ring::with_capacity(8);
        assert_eq!(ring.messages_waiting(), 0);
        ring.write(probe(42)).unwrap();
        assert_eq!(ring.messages_waiting(), 1);
        assert_eq!(ring.pop().unwrap().primary, 42);
        assert_eq!(ring.messages_waiting(), 0);
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn full_ring_rejects_without_overwrite() {
        let ring = Ring::with_capacity(4);
        for i in 0..3 {
            ring.write(probe(i)).unwrap();
        }
        assert_eq!(ring.slots_available(), 0);
        assert_eq!(ring.write(probe(99)), Err(Error::MailboxFull));
        // Oldest record untouched.
        assert_eq!(ring.peek().unwrap().primary, 0);
        assert_eq!(ring.messages_waiting(), 3);
    }

    #[test]
    fn usable_capacity_is_one_less_than_slots() {
        let ring = Ring::with_capacity(25);
        assert_eq!(ring.capacity(), 24);
        let mut accepted = 0;
        while ring.write(probe(accepted)).is_ok() {
            accepted += 1;
        }
        assert_eq!(accepted, 24);
    }

    #[test]
    fn fifo_across_wraparound() {
        let ring = Ring::with_capacity(4);
        for round in 0..5u32 {
            for i in 0..3 {
                ring.write(probe(round * 10 + i)).unwrap();
            }
            for i in 0..3 {
                assert_eq!(ring.pop().unwrap().primary, round * 10 + i);
            }
        }
    }

    #[test]
    fn peek_does_not_consume() {
        let ring = Ring::with_capacity(4);
        ring.write(probe(7)).unwrap();
        assert_eq!(ring.peek().unwrap().primary, 7);
        assert_eq!(ring.peek().unwrap().primary, 7);
        assert_eq!(ring.messages_waiting(), 1);
    }

    #[test]
    fn clear_discards_everything() {
        let ring = Ring::with_capacity(8);
        for i in 0..5 {
            ring.write(probe(i)).unwrap();
        }
        ring.clear();
        assert_eq!(ring.messages_waiting(), 0);
        assert_eq!(ring.peek(), None);
        // Still usable afterwards.
        ring.write(probe(1)).unwrap();
        assert_eq!(ring.pop().unwrap().primary, 1);
    }

    #[test]
    fn minimum_capacity_is_enforced() {
        let ring = Ring::with_capacity(0);
        assert_eq!(ring.capacity(), 1);
        ring.write(probe(1)).unwrap();
        assert_eq!(ring.write(probe(2)), Err(Error::MailboxFull));
    }
}
