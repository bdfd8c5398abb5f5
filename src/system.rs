//! The runtime record and its builder.
//!
//! A single [`System`] owns the task table, the per-core outbound queues,
//! the interrupt capture queue and the payload store. Both schedulers hold
//! the same `Arc<System>`; everything mutable on the scheduling path is
//! atomic, everything else is mutated only by the supervisor task.
//!
//! Registration happens through [`RuntimeBuilder`] while the system is in
//! `Init`; once [`RuntimeBuilder::build`] returns, the task table is frozen.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::board::{Board, HostBoard};
use crate::courier::CourierSvc;
use crate::eventlog::{EventLogSvc, LogSink, TracingSink};
use crate::irq::{CaptureQueue, IrqDemux};
use crate::parcel::ParcelStore;
use crate::ring::Ring;
use crate::sched::Scheduler;
use crate::supervisor::SupervisorSvc;
use crate::task::{Task, TaskContext, TaskFn};
use crate::timer::TimerSvc;
use crate::types::{
    state, Config, CoreId, Error, Gpio, HostId, Priority, Result, TaskId, TimeUs,
    CORE0, CORE1, MAX_CORES, NO_CORE, SYSTEM_TASK_PREFIX,
};
use crate::watchdog::WatchdogSvc;

// ============================================================================
// Well-known Task Ids
// ============================================================================

/// Ids of the runtime-owned tasks, fixed at build time.
#[derive(Debug, Clone, Copy)]
pub struct SysTaskIds {
    /// The scheduler's own placeholder entry; never executed.
    pub core: TaskId,
    pub eventlog: TaskId,
    pub courier: TaskId,
    /// Absent when the watchdog is disabled.
    pub watchdog: Option<TaskId>,
    /// Absent when the scheduler (and with it the timer service) is disabled.
    pub timer: Option<TaskId>,
    pub irq: TaskId,
    pub supervisor: TaskId,
}

// ============================================================================
// System
// ============================================================================

/// The process-wide runtime record.
pub struct System {
    pub(crate) cfg: Config,
    pub(crate) board: Box<dyn Board>,
    pub(crate) state: AtomicU8,
    pub(crate) tasks: Vec<Task>,
    pub(crate) ids: SysTaskIds,
    /// Task index each core is currently considering; `NO_CORE` = parked.
    pub(crate) run_ptr: [AtomicU8; MAX_CORES],
    /// Per-core staging queues for messages produced by running tasks.
    pub(crate) outbound: [Ring; MAX_CORES],
    pub(crate) capture: CaptureQueue,
    pub(crate) parcels: ParcelStore,
    pub(crate) timer_seq: AtomicU32,
    pub(crate) fatal: Mutex<Option<Error>>,
}

impl System {
    /// Current global state, see [`state`].
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, value: u8) {
        self.state.store(value, Ordering::SeqCst);
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// This host's wire id.
    pub fn host_id(&self) -> HostId {
        self.cfg.host_id
    }

    /// The board the runtime drives.
    pub fn board(&self) -> &dyn Board {
        self.board.as_ref()
    }

    /// Well-known ids of the runtime tasks.
    pub fn sys_ids(&self) -> &SysTaskIds {
        &self.ids
    }

    /// Microseconds since boot.
    pub fn now_us(&self) -> TimeUs {
        self.board.time_us()
    }

    /// Number of registered tasks, including the scheduler placeholder.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id as usize]
    }

    /// Shared view of a task's metadata.
    pub fn task_ref(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id as usize)
    }

    /// Look up a task id by name.
    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.tasks
            .iter()
            .position(|t| t.name == name)
            .map(|index| index as TaskId)
    }

    /// Whether `id` names a registered task.
    pub fn is_valid(&self, id: TaskId) -> bool {
        (id as usize) < self.tasks.len()
    }

    /// Whether `id` is registered and not sleeping.
    pub fn is_awake(&self, id: TaskId) -> bool {
        self.is_valid(id) && !self.task(id).sleeping()
    }

    /// Whether `id` names a runtime-owned task (reserved name prefix).
    pub fn is_system_task(&self, id: TaskId) -> bool {
        self.is_valid(id) && self.task(id).name.starts_with(SYSTEM_TASK_PREFIX)
    }

    /// Captured interrupts waiting for the demux.
    pub fn interrupts_pending(&self) -> usize {
        self.capture.pending()
    }

    /// Captures lost to a full interrupt queue since boot.
    pub fn interrupts_dropped(&self) -> usize {
        self.capture.dropped()
    }

    /// Payloads currently in transfer between tasks. Zero when every log
    /// entry and timer registration has been claimed by its recipient.
    pub fn payloads_outstanding(&self) -> usize {
        self.parcels.outstanding()
    }

    /// Record a hardware interrupt. Callable from any thread; never blocks.
    pub fn capture_interrupt(&self, gpio: Gpio, events: u32) {
        self.capture.push(gpio, events, self.now_us());
    }

    /// The error that stopped the system, if any.
    pub fn fatal_error(&self) -> Option<Error> {
        *self.fatal.lock()
    }

    pub(crate) fn record_fatal(&self, err: Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    /// Invoke a task once on the given core.
    ///
    /// Returns `Ok(false)` when the other core holds the task's claim (the
    /// invocation is skipped), `Ok(true)` after a successful run, and the
    /// task's error verbatim when the function fails.
    pub(crate) fn step(&self, core: CoreId, id: TaskId) -> Result<bool> {
        let task = self.task(id);
        if !task.claim(core) {
            return Ok(false);
        }
        let ctx = TaskContext {
            sys: self,
            id,
            state: task.state(),
            priority: task.priority(),
            debug: task.debug(),
            core,
            name: &task.name,
        };
        let mut func = task.func.lock();
        let result = match func.as_mut() {
            Some(f) => f(&ctx),
            None => Ok(()),
        };
        drop(func);
        task.release();
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                error!(task = %task.name, id, core, %err, "task returned an error");
                Err(err)
            }
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

struct Pending {
    name: String,
    priority: Priority,
    func: Option<TaskFn>,
    mailbox_capacity: usize,
}

/// Builds a [`Runtime`]: wires the runtime tasks, accepts user task
/// registrations, then freezes the task table.
pub struct RuntimeBuilder {
    cfg: Config,
    board: Option<Box<dyn Board>>,
    sink: Option<Box<dyn LogSink>>,
    pending: Vec<Pending>,
    ids: SysTaskIds,
}

impl RuntimeBuilder {
    fn new(cfg: Config) -> Self {
        let cfg = cfg.normalized();
        let mut builder = Self {
            cfg,
            board: None,
            sink: None,
            pending: Vec::new(),
            ids: SysTaskIds {
                core: 0,
                eventlog: 0,
                courier: 0,
                watchdog: None,
                timer: None,
                irq: 0,
                supervisor: 0,
            },
        };
        builder.register_system_tasks();
        builder
    }

    /// Use a specific board instead of the default [`HostBoard`].
    pub fn with_board(mut self, board: Box<dyn Board>) -> Self {
        self.board = Some(board);
        self
    }

    /// Use a specific event-log sink instead of the default [`TracingSink`].
    pub fn with_log_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn register_system_tasks(&mut self) {
        let cfg = self.cfg.clone();
        let max_tasks = cfg.max_tasks;

        // Placeholder for the scheduler itself; id 0, no function.
        self.ids.core = self.push_system("sys.core", cfg.priority_high, None);

        let eventlog = EventLogSvc::placeholder();
        self.ids.eventlog = self.push_system_with_mailbox(
            "sys.eventlog",
            cfg.priority_low,
            Some(eventlog),
            cfg.event_log_capacity,
        );

        let mut courier = CourierSvc::new(max_tasks);
        self.ids.courier = self.push_system(
            "sys.courier",
            cfg.priority_low,
            Some(Box::new(move |ctx: &TaskContext<'_>| courier.run(ctx))),
        );

        if !cfg.disable_watchdog {
            let mut watchdog = WatchdogSvc::new(
                max_tasks,
                cfg.watchdog_check_interval_us,
                cfg.watchdog_timeout_us,
            );
            self.ids.watchdog = Some(self.push_system(
                "sys.watchdog",
                cfg.priority_low,
                Some(Box::new(move |ctx: &TaskContext<'_>| watchdog.run(ctx))),
            ));
        }

        if !cfg.disable_scheduler {
            let mut timer = TimerSvc::new();
            self.ids.timer = Some(self.push_system(
                "sys.timer",
                cfg.priority_high,
                Some(Box::new(move |ctx: &TaskContext<'_>| timer.run(ctx))),
            ));
        }

        let mut irq = IrqDemux::new();
        self.ids.irq = self.push_system(
            "sys.irq",
            cfg.priority_low,
            Some(Box::new(move |ctx: &TaskContext<'_>| irq.run(ctx))),
        );

        let mut supervisor = SupervisorSvc::new();
        self.ids.supervisor = self.push_system(
            "sys.supervisor",
            cfg.priority_low,
            Some(Box::new(move |ctx: &TaskContext<'_>| supervisor.run(ctx))),
        );
    }

    fn push_system(&mut self, name: &str, priority: Priority, func: Option<TaskFn>) -> TaskId {
        self.push_system_with_mailbox(name, priority, func, self.cfg.mailbox_capacity)
    }

    fn push_system_with_mailbox(
        &mut self,
        name: &str,
        priority: Priority,
        func: Option<TaskFn>,
        mailbox_capacity: usize,
    ) -> TaskId {
        let id = self.pending.len() as TaskId;
        self.pending.push(Pending {
            name: name.to_string(),
            priority,
            func,
            mailbox_capacity,
        });
        id
    }

    /// Register a user task. Ids are assigned densely in registration order.
    ///
    /// Fails with [`Error::TooManyTasks`] past the configured capacity and
    /// with [`Error::InvalidOperation`] for names carrying the reserved
    /// `sys.` prefix.
    pub fn register<F>(&mut self, name: &str, priority: Priority, func: F) -> Result<TaskId>
    where
        F: FnMut(&TaskContext<'_>) -> Result<()> + Send + 'static,
    {
        if name.starts_with(SYSTEM_TASK_PREFIX) {
            return Err(Error::InvalidOperation);
        }
        if self.pending.len() >= self.cfg.max_tasks {
            error!(name, max = self.cfg.max_tasks, "too many tasks to register");
            return Err(Error::TooManyTasks);
        }
        let mut name = name.to_string();
        truncate_utf8(&mut name, self.cfg.max_task_name_len);
        let id = self.pending.len() as TaskId;
        debug!(task = %name, id, priority, "task registered");
        self.pending.push(Pending {
            name,
            priority,
            func: Some(Box::new(func)),
            mailbox_capacity: self.cfg.mailbox_capacity,
        });
        Ok(id)
    }

    /// Freeze the task table and produce the runtime, in `Init` state with
    /// the system-ready line low.
    pub fn build(mut self) -> Runtime {
        let board = self.board.take().unwrap_or_else(|| Box::new(HostBoard::new()));
        let sink = self.sink.take().unwrap_or_else(|| Box::new(TracingSink));
        board.set_system_ready(false);

        let cfg = self.cfg.clone();
        let ids = self.ids;
        let mut tasks: Vec<Task> = Vec::with_capacity(self.pending.len());
        for (index, pending) in self.pending.into_iter().enumerate() {
            tasks.push(Task::new(
                index as TaskId,
                pending.name,
                pending.func,
                state::INIT,
                pending.priority,
                cfg.debug,
                pending.mailbox_capacity,
            ));
        }

        // The event log owns its sink; wire it now that the sink is final.
        let mut eventlog = EventLogSvc::new(sink);
        *tasks[ids.eventlog as usize].func.lock() =
            Some(Box::new(move |ctx: &TaskContext<'_>| eventlog.run(ctx)));

        let outbound_capacity = cfg.outbound_capacity;
        let sys = System {
            cfg,
            board,
            state: AtomicU8::new(state::INIT),
            tasks,
            ids,
            run_ptr: [AtomicU8::new(NO_CORE), AtomicU8::new(NO_CORE)],
            outbound: [
                Ring::with_capacity(outbound_capacity),
                Ring::with_capacity(outbound_capacity),
            ],
            capture: CaptureQueue::new(),
            parcels: ParcelStore::new(),
            timer_seq: AtomicU32::new(0),
            fatal: Mutex::new(None),
        };
        Runtime { sys: Arc::new(sys) }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Handle to a built system: owns the shared [`System`] and drives the
/// per-core schedulers.
pub struct Runtime {
    sys: Arc<System>,
}

impl Runtime {
    /// Start building a runtime with the given configuration.
    pub fn builder(cfg: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(cfg)
    }

    /// The shared runtime record.
    pub fn system(&self) -> &Arc<System> {
        &self.sys
    }

    /// Run the full lifecycle: spawn the second core's scheduler (unless
    /// disabled), run core 0 on the calling thread, and return once the
    /// system reaches `Down`.
    ///
    /// Returns the fatal error when a task failure stopped the system.
    pub fn run(&self) -> Result<()> {
        let second = if self.sys.cfg.disable_second_core {
            None
        } else {
            let sys = Arc::clone(&self.sys);
            let handle = thread::Builder::new()
                .name("duet-core1".into())
                .spawn(move || Scheduler::new(sys, CORE1).run())
                .map_err(|err| {
                    error!(%err, "failed to spawn the second core's scheduler");
                    Error::Initializing
                })?;
            Some(handle)
        };

        let result = Scheduler::new(Arc::clone(&self.sys), CORE0).run();
        if let Some(handle) = second {
            let _ = handle.join();
        }
        result
    }

    /// Run the bring-up phase on the calling thread and return with the
    /// system in `Run`, without entering the work loop.
    ///
    /// Useful for embedders that drive tasks through [`step_task`] and for
    /// deterministic tests.
    ///
    /// [`step_task`]: Runtime::step_task
    pub fn initialize(&self) -> Result<()> {
        let mut sched = Scheduler::new(Arc::clone(&self.sys), CORE0);
        sched.init_phase();
        match self.sys.state() {
            state::RUN => Ok(()),
            _ => Err(self.sys.fatal_error().unwrap_or(Error::Initializing)),
        }
    }

    /// Invoke one task once on the given core, bypassing all planning.
    ///
    /// This is the driving primitive when the scheduler is disabled, and
    /// the stepping hook for deterministic tests. Returns `Ok(false)` when
    /// the other core currently holds the task.
    pub fn step_task(&self, core: CoreId, id: TaskId) -> Result<bool> {
        if !self.sys.is_valid(id) {
            return Err(Error::TaskNotFound);
        }
        self.sys.step(core, id)
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
