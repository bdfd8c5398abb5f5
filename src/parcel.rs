//! Owned-payload store for pointer-sized message payloads.
//!
//! Message payload words are 32 bits; log texts and timer registrations do
//! not fit. The sender stashes the payload here and sends the returned
//! ticket in `Message::primary`; the recipient claims the ticket and takes
//! ownership. A stashed payload belongs to the sender until claimed, so a
//! failed send must be followed by a reclaim. [`ParcelStore::outstanding`]
//! lets tests assert that no payload leaks.

use parking_lot::Mutex;

use crate::timer::TimerEntry;

/// A payload in transfer between two tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A formatted log line bound for the event log.
    Text(String),
    /// A timer registration bound for the timer service.
    Timer(TimerEntry),
}

/// Ticket handed out for a stashed payload.
pub type Ticket = u32;

#[derive(Default)]
struct Slots {
    slots: Vec<Option<Payload>>,
    free: Vec<u32>,
}

/// Slot store mapping tickets to in-flight payloads.
#[derive(Default)]
pub struct ParcelStore {
    inner: Mutex<Slots>,
}

impl ParcelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload and return its ticket.
    pub fn stash(&self, payload: Payload) -> Ticket {
        let mut inner = self.inner.lock();
        match inner.free.pop() {
            Some(index) => {
                inner.slots[index as usize] = Some(payload);
                index
            }
            None => {
                inner.slots.push(Some(payload));
                (inner.slots.len() - 1) as Ticket
            }
        }
    }

    /// Take ownership of a stashed payload.
    ///
    /// Returns `None` for unknown or already-claimed tickets.
    pub fn claim(&self, ticket: Ticket) -> Option<Payload> {
        let mut inner = self.inner.lock();
        let payload = inner.slots.get_mut(ticket as usize)?.take()?;
        inner.free.push(ticket);
        Some(payload)
    }

    /// Number of payloads currently in transfer.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.is_some()).count()
    }
}
