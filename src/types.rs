//! Base types, constants and configuration for the duet runtime.

use thiserror::Error;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Hard upper bound on the number of registered tasks.
pub const MAX_TASKS: usize = 250;

/// Number of hardware cores driven by the runtime.
pub const MAX_CORES: usize = 2;

/// First core; walks the task table bottom-up.
pub const CORE0: CoreId = 0;

/// Second core; walks the task table top-down.
pub const CORE1: CoreId = 1;

/// Sentinel core id: no core ("parked" run pointer, idle claim cell).
pub const NO_CORE: CoreId = 255;

/// Number of GPIO lines on the reference board.
pub const GPIO_COUNT: usize = 29;

/// Host id addressed to every host.
pub const ALL_HOSTS: HostId = 255;

/// Task id used when the recipient is unknown; such messages are dropped.
pub const TASK_UNSPECIFIED: TaskId = 255;

/// Name prefix reserved for runtime-owned tasks.
pub const SYSTEM_TASK_PREFIX: &str = "sys.";

/// High priority: minimum microseconds between successive runs.
pub const PRIORITY_HIGH: Priority = 2_500;
/// Normal priority.
pub const PRIORITY_NORMAL: Priority = 5_000;
/// Low priority.
pub const PRIORITY_LOW: Priority = 10_000;

// ============================================================================
// Basic Types
// ============================================================================

/// Task identifier; dense, assigned at registration, 0 is the scheduler itself.
pub type TaskId = u8;

/// Host identifier; a single host is implemented, the field is wire-reserved.
pub type HostId = u8;

/// Core identifier (0 or 1).
pub type CoreId = u8;

/// Timestamp in microseconds since boot.
pub type TimeUs = u64;

/// Task priority in microseconds; smaller is higher priority.
pub type Priority = u32;

/// Per-task debug verbosity.
pub type DebugLevel = u8;

/// GPIO line number.
pub type Gpio = u8;

// ============================================================================
// System / Task States
// ============================================================================

/// System and task state values. Tasks may use custom values at or above
/// [`state::USER_BASE`]; the runtime only assigns the predefined ones.
pub mod state {
    /// Final state; schedulers have exited.
    pub const DOWN: u8 = 0;
    /// Shutting down; every task gets one final invocation.
    pub const STOP: u8 = 1;
    /// Normal operation.
    pub const RUN: u8 = 2;
    /// Bring-up; registration is only permitted here.
    pub const INIT: u8 = 3;
    /// Reserved for a future warm-restart path.
    pub const REBOOT: u8 = 4;
    /// First value available for task-defined states.
    pub const USER_BASE: u8 = 5;
}

/// Debug verbosity levels.
pub mod debug {
    pub const NONE: u8 = 0;
    pub const LOW: u8 = 1;
    pub const HIGH: u8 = 2;
}

// ============================================================================
// Message Types
// ============================================================================

/// Message-type tags. User tags occupy 0..=49; runtime tags 50..=99.
/// Tags 0..=28 double as GPIO numbers when addressed to the interrupt demux.
pub mod msg {
    /// Highest user-defined tag.
    pub const USER_MAX: u8 = 49;
    /// Highest tag interpreted as a GPIO number by the interrupt demux.
    pub const GPIO_MAX: u8 = 28;

    /// Dummy message, mostly for debugging.
    pub const TEST: u8 = 50;
    /// Liveness probe; recipients answer with [`ECHO`] carrying the payload.
    pub const PING: u8 = 51;
    /// Answer to a [`PING`].
    pub const ECHO: u8 = 52;
    /// Log entry, notification level. Primary carries a payload ticket.
    pub const LOG_NOTIFY: u8 = 53;
    /// Log entry, error level. Primary carries a payload ticket.
    pub const LOG_ERROR: u8 = 54;

    /// Assign the global system state.
    pub const SET_SYS_STATE: u8 = 55;
    /// Assign a task's state.
    pub const SET_TASK_STATE: u8 = 56;
    /// Reassign a task's priority.
    pub const SET_TASK_PRIORITY: u8 = 57;
    /// Set or clear a task's sleeping flag.
    pub const SET_TASK_SLEEP: u8 = 58;
    /// Move a task's wake-up deadline to now + primary microseconds.
    pub const SET_TASK_WAKEUP: u8 = 59;
    /// Set a task's debug verbosity.
    pub const SET_TASK_DEBUG: u8 = 60;
    /// Wake every sleeping task.
    pub const WAKE_ALL: u8 = 61;
    /// Put all non-system tasks except the target to sleep.
    pub const DEDICATE_TO_TASK: u8 = 62;

    /// Reserved for cross-host message exchange.
    pub const MX_SUBSCRIBE: u8 = 63;
    /// Reserved for cross-host message exchange.
    pub const MX_UNSUBSCRIBE: u8 = 64;

    /// Register a software timer. Primary carries a payload ticket.
    pub const SET_TIMER: u8 = 65;
    /// Cancel the sender's timer with the id in primary.
    pub const CANCEL_TIMER: u8 = 66;
    /// Cancel the timer with the sequence number in primary.
    pub const CANCEL_TIMER_BY_SEQ: u8 = 67;
}

// ============================================================================
// Message Record
// ============================================================================

/// The fixed-size record moved through every queue in the runtime.
///
/// `primary` and `secondary` carry either plain integers or payload-store
/// tickets; when they carry a ticket the referenced payload is owned by the
/// sender until the recipient claims it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Message {
    pub sender_host: HostId,
    pub sender_task: TaskId,
    pub recipient_host: HostId,
    pub recipient_task: TaskId,
    /// Semantic tag, see [`msg`].
    pub kind: u8,
    /// Primary payload word.
    pub primary: u32,
    /// Secondary payload word.
    pub secondary: u32,
    /// Microseconds since boot at enqueue time.
    pub timestamp: TimeUs,
}

// ============================================================================
// Errors
// ============================================================================

/// Result type for runtime operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds surfaced by the runtime.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Registration attempted past the configured task capacity.
    #[error("too many tasks registered")]
    TooManyTasks,
    /// A task's init invocation failed, or a subsystem failed bring-up.
    #[error("initialization failed")]
    Initializing,
    /// Write to a full mailbox or queue.
    #[error("mailbox full")]
    MailboxFull,
    /// Recipient task id out of range or unallocated.
    #[error("invalid recipient")]
    RecipientInvalid,
    /// Lookup by name failed.
    #[error("task not found")]
    TaskNotFound,
    /// The operation requires the target task to be awake.
    #[error("task is sleeping")]
    TaskSleeping,
    /// A task function returned an error during the run phase; fatal.
    #[error("task returned an error while running")]
    RunningTask,
    /// The caller is not allowed to request this operation.
    #[error("invalid operation")]
    InvalidOperation,
}

// ============================================================================
// Configuration
// ============================================================================

/// Runtime configuration. All fields are fixed once the runtime is built.
#[derive(Debug, Clone)]
pub struct Config {
    /// This host's id on the wire.
    pub host_id: HostId,
    /// Maximum number of tasks, capped at [`MAX_TASKS`].
    pub max_tasks: usize,
    /// Task names longer than this are truncated at registration.
    pub max_task_name_len: usize,
    /// Priority value used for the "high" bucket, in microseconds.
    pub priority_high: Priority,
    /// Priority value used for the "normal" bucket.
    pub priority_normal: Priority,
    /// Priority value used for the "low" bucket.
    pub priority_low: Priority,
    /// Delay before the first staggered wake-up deadlines, in milliseconds.
    pub startup_delay_ms: u32,
    /// Capacity of per-task inbound mailboxes (usable slots: capacity - 1).
    pub mailbox_capacity: usize,
    /// Capacity of the per-core outbound queues.
    pub outbound_capacity: usize,
    /// Capacity of the event log's enlarged mailbox, and its drain cap.
    pub event_log_capacity: usize,
    /// Log entry texts longer than this are truncated.
    pub event_log_entry_max: usize,
    /// Microseconds between watchdog ping rounds.
    pub watchdog_check_interval_us: TimeUs,
    /// Maximum tolerated ping-to-echo delay before an error is logged.
    pub watchdog_timeout_us: TimeUs,
    /// Messages a service task processes per invocation.
    pub batch_limit: usize,
    /// Base spin per collision encounter, in microseconds.
    pub collision_backoff_us: u64,
    /// Upper bound of the random jitter added to the collision spin.
    pub collision_jitter_us: u64,
    /// Initial debug verbosity for the runtime and newly registered tasks.
    pub debug: DebugLevel,
    /// Treat all priorities as equal (round-robin passes).
    pub disable_priorities: bool,
    /// Run tasks consecutively with no planning; also drops the timer service.
    pub disable_scheduler: bool,
    /// Run everything on core 0 only.
    pub disable_second_core: bool,
    /// Do not register the watchdog task.
    pub disable_watchdog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: 2,
            max_tasks: 30,
            max_task_name_len: 30,
            priority_high: PRIORITY_HIGH,
            priority_normal: PRIORITY_NORMAL,
            priority_low: PRIORITY_LOW,
            startup_delay_ms: 0,
            mailbox_capacity: 25,
            outbound_capacity: 64,
            event_log_capacity: 250,
            event_log_entry_max: 150,
            watchdog_check_interval_us: 30_000_000,
            watchdog_timeout_us: 5_000_000,
            batch_limit: 32,
            collision_backoff_us: 5,
            collision_jitter_us: 3,
            debug: debug::NONE,
            disable_priorities: false,
            disable_scheduler: false,
            disable_second_core: false,
            disable_watchdog: false,
        }
    }
}

impl Config {
    /// Clamp fields that have hard bounds.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_tasks = self.max_tasks.min(MAX_TASKS);
        self.mailbox_capacity = self.mailbox_capacity.max(2);
        self.outbound_capacity = self.outbound_capacity.max(2);
        self.event_log_capacity = self.event_log_capacity.max(2);
        self.priority_high = self.priority_high.max(1);
        self.priority_normal = self.priority_normal.max(self.priority_high);
        self.priority_low = self.priority_low.max(self.priority_normal);
        self
    }
}
