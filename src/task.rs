//! Task records and the per-invocation context handed to task functions.
//!
//! A task is a function invoked cooperatively by a core's scheduler; it
//! runs to completion every time. The hot fields the schedulers read while
//! planning (sleeping flag, wake-up deadline, priority, state, running-core
//! claim) are atomics: the supervisor may rewrite them from the other core,
//! and a reader observing a one-iteration-stale value is acceptable because
//! the filter re-evaluates on the next pass.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::ring::Ring;
use crate::system::System;
use crate::types::{
    CoreId, DebugLevel, Message, Priority, Result, TaskId, TimeUs, NO_CORE,
};

/// Task function: invoked with a snapshot of the task's metadata, returns
/// `Ok` or a fatal error.
pub type TaskFn = Box<dyn FnMut(&TaskContext<'_>) -> Result<()> + Send>;

// ============================================================================
// Task Record
// ============================================================================

/// One entry of the task table.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    /// `None` only for the scheduler's own placeholder entry (id 0).
    pub(crate) func: Mutex<Option<TaskFn>>,
    pub(crate) state: AtomicU8,
    pub(crate) priority: AtomicU32,
    pub(crate) sleeping: AtomicBool,
    pub(crate) wake_at: AtomicU64,
    pub(crate) debug: AtomicU8,
    /// Core currently executing the task; `NO_CORE` when idle. Doubles as
    /// the mutual-exclusion claim cell between the two schedulers.
    pub(crate) running_core: AtomicU8,
    pub(crate) inbox: Ring,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        func: Option<TaskFn>,
        state: u8,
        priority: Priority,
        debug: DebugLevel,
        mailbox_capacity: usize,
    ) -> Self {
        Self {
            id,
            name,
            func: Mutex::new(func),
            state: AtomicU8::new(state),
            priority: AtomicU32::new(priority.max(1)),
            sleeping: AtomicBool::new(false),
            wake_at: AtomicU64::new(0),
            debug: AtomicU8::new(debug),
            running_core: AtomicU8::new(NO_CORE),
            inbox: Ring::with_capacity(mailbox_capacity),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    pub fn priority(&self) -> Priority {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority.max(1), Ordering::Relaxed);
    }

    pub fn sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::SeqCst);
    }

    pub fn wake_at(&self) -> TimeUs {
        self.wake_at.load(Ordering::SeqCst)
    }

    pub(crate) fn set_wake_at(&self, deadline: TimeUs) {
        self.wake_at.store(deadline, Ordering::SeqCst);
    }

    pub fn debug(&self) -> DebugLevel {
        self.debug.load(Ordering::Relaxed)
    }

    pub(crate) fn set_debug(&self, level: DebugLevel) {
        self.debug.store(level, Ordering::Relaxed);
    }

    /// Core currently executing the task, if any.
    pub fn running_on(&self) -> Option<CoreId> {
        match self.running_core.load(Ordering::SeqCst) {
            NO_CORE => None,
            core => Some(core),
        }
    }

    /// Try to claim execution for `core`. At most one core holds the claim
    /// at any instant; the loser backs off and retries.
    pub(crate) fn claim(&self, core: CoreId) -> bool {
        self.running_core
            .compare_exchange(NO_CORE, core, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.running_core.store(NO_CORE, Ordering::Release);
    }
}

// ============================================================================
// Task Context
// ============================================================================

/// Snapshot of a task's metadata for one invocation, plus the API surface
/// a task uses to talk to the runtime.
///
/// The snapshot fields carry no interior mutability: a task changes its own
/// state by sending a request to the supervisor, never by writing here.
/// The service modules extend this type with their operations (messaging,
/// attribute requests, timers, interrupt subscriptions, logging).
pub struct TaskContext<'rt> {
    pub(crate) sys: &'rt System,
    /// This task's id.
    pub id: TaskId,
    /// Task state at invocation time.
    pub state: u8,
    /// Priority at invocation time.
    pub priority: Priority,
    /// Debug verbosity at invocation time.
    pub debug: DebugLevel,
    /// Core this invocation runs on.
    pub core: CoreId,
    pub(crate) name: &'rt str,
}

impl<'rt> TaskContext<'rt> {
    /// The task's registered name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Microseconds since boot.
    pub fn now_us(&self) -> TimeUs {
        self.sys.now_us()
    }

    /// Number of unread messages in this task's mailbox.
    pub fn messages_waiting(&self) -> usize {
        self.sys.task(self.id).inbox.messages_waiting()
    }

    /// Read the oldest message without removing it.
    pub fn peek(&self) -> Option<Message> {
        self.sys.task(self.id).inbox.peek()
    }

    /// Remove and return the oldest message.
    pub fn recv(&self) -> Option<Message> {
        self.sys.task(self.id).inbox.pop()
    }

    /// Look up a task id by name.
    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.sys.task_id(name)
    }

    /// Whether `id` names a registered task.
    pub fn is_valid(&self, id: TaskId) -> bool {
        self.sys.is_valid(id)
    }

    /// Whether `id` is registered and not sleeping.
    pub fn is_awake(&self, id: TaskId) -> bool {
        self.sys.is_awake(id)
    }

    /// Whether `id` names a runtime-owned task.
    pub fn is_system_task(&self, id: TaskId) -> bool {
        self.sys.is_system_task(id)
    }
}
