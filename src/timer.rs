//! Software timers: deferred and repeating notifications delivered as
//! messages, plus purely local virtual deadlines for polling loops.
//!
//! The service keeps an unordered flat list of entries. Each run it scans
//! the whole list against now: expired entries produce a notification to
//! the owning task (message type = the entry's timer id, primary = the
//! entry's sequence number), repeating entries are rescheduled by adding
//! the interval, one-shot entries are removed. The service then moves its
//! own wake-up deadline to the earliest pending fire and, with an empty
//! list, goes back to sleep.
//!
//! Resolution is bounded below by the scheduler's high-priority period;
//! milliseconds are the promised unit, not the guaranteed accuracy.

use core::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::parcel::Payload;
use crate::task::TaskContext;
use crate::types::{msg, state, Error, Result, TaskId, TimeUs};

// ============================================================================
// Timer Entry
// ============================================================================

/// One registered software timer.
///
/// The first fire happens at the registration timestamp, so a repeating
/// timer's fire sequence is `start, start + interval, start + 2*interval, …`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEntry {
    /// Owning task; notifications are addressed to it.
    pub task: TaskId,
    /// Caller-chosen id, unique per task; doubles as the message type of
    /// notifications.
    pub timer_id: u8,
    pub repeating: bool,
    pub interval_ms: u32,
    /// Next fire deadline in microseconds.
    pub next_fire: TimeUs,
    /// Service-assigned, monotonically increasing.
    pub sequence: u32,
}

// ============================================================================
// Task-facing Timer API
// ============================================================================

impl TaskContext<'_> {
    /// Register a software timer. Returns the sequence number assigned to
    /// the entry, usable with [`cancel_timer_by_sequence`].
    ///
    /// Fails with [`Error::InvalidOperation`] when the timer service is
    /// disabled.
    ///
    /// [`cancel_timer_by_sequence`]: TaskContext::cancel_timer_by_sequence
    pub fn set_timer(&self, timer_id: u8, repeating: bool, interval_ms: u32) -> Result<u32> {
        let service = self.sys.ids.timer.ok_or(Error::InvalidOperation)?;
        let sequence = self.sys.timer_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = TimerEntry {
            task: self.id,
            timer_id,
            repeating,
            interval_ms,
            next_fire: self.now_us(),
            sequence,
        };
        let ticket = self.sys.parcels.stash(Payload::Timer(entry));
        match self.send(service, msg::SET_TIMER, ticket, 0) {
            Ok(()) => Ok(sequence),
            Err(err) => {
                self.sys.parcels.claim(ticket);
                Err(err)
            }
        }
    }

    /// Cancel this task's timer with the given id.
    pub fn cancel_timer(&self, timer_id: u8) -> Result<()> {
        let service = self.sys.ids.timer.ok_or(Error::InvalidOperation)?;
        self.send(service, msg::CANCEL_TIMER, u32::from(timer_id), 0)
    }

    /// Cancel the timer carrying the given sequence number.
    pub fn cancel_timer_by_sequence(&self, sequence: u32) -> Result<()> {
        let service = self.sys.ids.timer.ok_or(Error::InvalidOperation)?;
        self.send(service, msg::CANCEL_TIMER_BY_SEQ, sequence, 0)
    }

    /// Virtual timer: compute a deadline `usec` from now. Involves no
    /// service; pair with [`deadline_passed`] in polling loops.
    ///
    /// [`deadline_passed`]: TaskContext::deadline_passed
    pub fn deadline_in(&self, usec: TimeUs) -> TimeUs {
        self.now_us() + usec
    }

    /// Virtual timer check: has the deadline passed?
    pub fn deadline_passed(&self, deadline: TimeUs) -> bool {
        self.now_us() > deadline
    }
}

// ============================================================================
// Timer Service
// ============================================================================

pub(crate) struct TimerSvc {
    entries: Vec<TimerEntry>,
}

impl TimerSvc {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn run(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        match ctx.state {
            state::INIT => {
                self.entries.clear();
                let _ = ctx.sleep();
            }
            state::RUN => {
                self.process_requests(ctx);
                self.scan(ctx)?;
            }
            state::STOP => {
                let _ = ctx.set_task_state(ctx.id, state::DOWN);
            }
            _ => {}
        }
        Ok(())
    }

    fn process_requests(&mut self, ctx: &TaskContext<'_>) {
        let mut budget = ctx.sys.cfg.batch_limit;
        while budget > 0 {
            let Some(message) = ctx.recv() else { break };
            budget -= 1;
            match message.kind {
                msg::PING => ctx.answer_ping(&message),
                msg::SET_TIMER => match ctx.sys.parcels.claim(message.primary) {
                    Some(Payload::Timer(entry)) => {
                        debug!(
                            task = entry.task,
                            timer = entry.timer_id,
                            sequence = entry.sequence,
                            "timer registered"
                        );
                        self.entries.push(entry);
                    }
                    _ => {
                        warn!(
                            sender = message.sender_task,
                            ticket = message.primary,
                            "timer registration without a payload ignored"
                        );
                    }
                },
                msg::CANCEL_TIMER => {
                    let before = self.entries.len();
                    let timer_id = message.primary as u8;
                    self.entries
                        .retain(|e| !(e.task == message.sender_task && e.timer_id == timer_id));
                    if self.entries.len() == before {
                        warn!(
                            sender = message.sender_task,
                            timer = timer_id,
                            "cancellation for an unknown timer ignored"
                        );
                    }
                }
                msg::CANCEL_TIMER_BY_SEQ => {
                    self.entries.retain(|e| e.sequence != message.primary);
                }
                _ => {}
            }
        }
    }

    /// Scan for expired entries, notify, reschedule or drop.
    fn scan(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        if self.entries.is_empty() {
            let _ = ctx.sleep();
            return Ok(());
        }
        let now = ctx.now_us();
        let mut earliest = TimeUs::MAX;
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &mut self.entries[index];
            if entry.next_fire <= now {
                let _ = ctx.send(entry.task, entry.timer_id, entry.sequence, 0);
                if entry.repeating {
                    entry.next_fire += TimeUs::from(entry.interval_ms) * 1_000;
                    earliest = earliest.min(entry.next_fire);
                } else {
                    self.entries.swap_remove(index);
                    continue;
                }
            } else {
                earliest = earliest.min(entry.next_fire);
            }
            index += 1;
        }
        if self.entries.is_empty() {
            let _ = ctx.sleep();
        } else {
            // Only the service adjusts its own schedule; the scheduler will
            // re-enter it exactly when the earliest entry is due.
            ctx.sys.task(ctx.id).set_wake_at(earliest);
        }
        Ok(())
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
