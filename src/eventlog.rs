//! Event log: thread-safe collection of log entries as messages, written
//! through a single sink.
//!
//! Tasks submit entries with [`TaskContext::log_notice`] and
//! [`TaskContext::log_error`]; the text travels through the payload store
//! and the message carries only the ticket, so entries from both cores
//! funnel into one task that owns the sink exclusively. Entries of the two
//! cores may interleave out of timestamp order; entries of one core never
//! do.
//!
//! Only entries from this host are accepted: a payload ticket is
//! meaningless on another host, so cross-host entries are rejected.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::parcel::Payload;
use crate::task::{TaskContext, TaskFn};
use crate::types::{msg, state, HostId, Result, TaskId, TimeUs};

// ============================================================================
// Sink
// ============================================================================

/// A rendered log entry on its way to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: TimeUs,
    pub host: HostId,
    pub task: TaskId,
    pub task_name: String,
    pub text: String,
}

/// Destination for log entries. The event log task is the only writer.
pub trait LogSink: Send {
    /// Notification-level entry.
    fn notify(&mut self, record: &LogRecord);
    /// Error-level entry.
    fn error(&mut self, record: &LogRecord);
}

/// Default sink: emits entries through `tracing`.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn notify(&mut self, record: &LogRecord) {
        tracing::info!(
            target: "duet::eventlog",
            task = %record.task_name,
            id = record.task,
            host = record.host,
            timestamp = record.timestamp,
            "{}",
            record.text
        );
    }

    fn error(&mut self, record: &LogRecord) {
        tracing::error!(
            target: "duet::eventlog",
            task = %record.task_name,
            id = record.task,
            host = record.host,
            timestamp = record.timestamp,
            "{}",
            record.text
        );
    }
}

/// In-memory sink for tests; clones share the same entry list.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<(bool, LogRecord)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured entries as `(is_error, record)` pairs, in arrival order.
    pub fn entries(&self) -> Vec<(bool, LogRecord)> {
        self.entries.lock().clone()
    }

    /// Texts of notification-level entries.
    pub fn notices(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(is_error, _)| !is_error)
            .map(|(_, r)| r.text.clone())
            .collect()
    }

    /// Texts of error-level entries.
    pub fn errors(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(is_error, _)| *is_error)
            .map(|(_, r)| r.text.clone())
            .collect()
    }
}

impl LogSink for MemorySink {
    fn notify(&mut self, record: &LogRecord) {
        self.entries.lock().push((false, record.clone()));
    }

    fn error(&mut self, record: &LogRecord) {
        self.entries.lock().push((true, record.clone()));
    }
}

// ============================================================================
// Task-facing Logging API
// ============================================================================

impl TaskContext<'_> {
    /// Submit a notification-level log entry.
    pub fn log_notice(&self, text: impl Into<String>) -> Result<()> {
        self.log(msg::LOG_NOTIFY, text.into())
    }

    /// Submit an error-level log entry.
    pub fn log_error(&self, text: impl Into<String>) -> Result<()> {
        self.log(msg::LOG_ERROR, text.into())
    }

    fn log(&self, kind: u8, mut text: String) -> Result<()> {
        truncate_utf8(&mut text, self.sys.cfg.event_log_entry_max);
        let ticket = self.sys.parcels.stash(Payload::Text(text));
        match self.send(self.sys.ids.eventlog, kind, ticket, 0) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Undeliverable entry; take the payload back.
                self.sys.parcels.claim(ticket);
                Err(err)
            }
        }
    }
}

fn truncate_utf8(text: &mut String, mut max: usize) {
    if text.len() <= max {
        return;
    }
    while max > 0 && !text.is_char_boundary(max) {
        max -= 1;
    }
    text.truncate(max);
}

// ============================================================================
// Event Log Service
// ============================================================================

pub(crate) struct EventLogSvc {
    sink: Box<dyn LogSink>,
}

impl EventLogSvc {
    pub(crate) fn new(sink: Box<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Stand-in task function used while the builder has not yet settled
    /// on a sink.
    pub(crate) fn placeholder() -> TaskFn {
        Box::new(|_| Ok(()))
    }

    pub(crate) fn run(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        match ctx.state {
            state::INIT => {
                self.announce(ctx, "logging started");
                let _ = ctx.sleep();
            }
            state::RUN => {
                self.drain(ctx);
                let _ = ctx.sleep();
            }
            state::STOP => {
                self.drain(ctx);
                self.announce(ctx, "logging stopped");
                let _ = ctx.set_task_state(ctx.id, state::DOWN);
            }
            _ => {}
        }
        Ok(())
    }

    /// The event log cannot log through itself; bring-up and shutdown
    /// entries go straight to the sink.
    fn announce(&mut self, ctx: &TaskContext<'_>, text: &str) {
        self.sink.notify(&LogRecord {
            timestamp: ctx.now_us(),
            host: ctx.sys.host_id(),
            task: ctx.id,
            task_name: ctx.name().to_string(),
            text: text.to_string(),
        });
    }

    fn drain(&mut self, ctx: &TaskContext<'_>) {
        let sys = ctx.sys;
        let mut budget = sys.cfg.event_log_capacity;
        while budget > 0 {
            let Some(message) = ctx.recv() else { break };
            budget -= 1;
            if message.sender_host != sys.host_id() {
                warn!(
                    host = message.sender_host,
                    "cross-host log entry rejected, payload tickets are not portable"
                );
                continue;
            }
            match message.kind {
                msg::PING => ctx.answer_ping(&message),
                msg::LOG_NOTIFY | msg::LOG_ERROR => {
                    let Some(Payload::Text(text)) = sys.parcels.claim(message.primary) else {
                        warn!(
                            sender = message.sender_task,
                            ticket = message.primary,
                            "log entry without a payload ignored"
                        );
                        continue;
                    };
                    let sender_name = sys
                        .task_ref(message.sender_task)
                        .map(|t| t.name().to_string())
                        .unwrap_or_default();
                    let record = LogRecord {
                        timestamp: message.timestamp,
                        host: message.sender_host,
                        task: message.sender_task,
                        task_name: sender_name,
                        text,
                    };
                    if message.kind == msg::LOG_ERROR {
                        self.sink.error(&record);
                    } else {
                        self.sink.notify(&record);
                    }
                }
                other => {
                    warn!(
                        kind = other,
                        sender = message.sender_task,
                        "unknown message type at the event log"
                    );
                }
            }
        }
    }
}
