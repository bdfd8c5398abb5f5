//! The supervisor: the one place where task and system state is mutated
//! on behalf of other tasks.
//!
//! Requests arrive as messages; because the supervisor is a single-instance
//! task, at most one mutation batch runs at a time. Permission rules are
//! enforced at the call site: a request a task is not allowed to make is
//! rejected with [`Error::InvalidOperation`] and never reaches the mailbox.
//!
//! Request wire mapping: `kind` selects the operation, `primary` carries
//! the setting, `secondary` the target task id.

use tracing::{debug, error, warn};

use crate::task::TaskContext;
use crate::types::{msg, state, DebugLevel, Error, Priority, Result, TaskId, TimeUs};

// ============================================================================
// Task-facing Request API
// ============================================================================

impl TaskContext<'_> {
    /// Request a new global system state. Permitted for every task;
    /// `state::STOP` is the canonical shutdown trigger.
    pub fn set_system_state(&self, value: u8) -> Result<()> {
        self.send(self.sys.ids.supervisor, msg::SET_SYS_STATE, u32::from(value), 0)
    }

    /// Request a new state for `target`. Permitted for every task.
    pub fn set_task_state(&self, target: TaskId, value: u8) -> Result<()> {
        self.request(target, msg::SET_TASK_STATE, u32::from(value))
    }

    /// Request a new debug verbosity for `target`. Permitted for every task.
    pub fn set_task_debug(&self, target: TaskId, level: DebugLevel) -> Result<()> {
        self.request(target, msg::SET_TASK_DEBUG, u32::from(level))
    }

    /// Request a new priority for `target`. For system tasks only other
    /// system tasks may ask.
    pub fn set_task_priority(&self, target: TaskId, priority: Priority) -> Result<()> {
        self.guarded_request(target, msg::SET_TASK_PRIORITY, priority)
    }

    /// Request a sleep-flag change for `target`. Clearing the flag also
    /// resets the wake-up deadline to now. For system tasks only other
    /// system tasks may ask.
    pub fn set_task_sleep(&self, target: TaskId, sleeping: bool) -> Result<()> {
        self.guarded_request(target, msg::SET_TASK_SLEEP, u32::from(sleeping))
    }

    /// Request `target`'s wake-up deadline be moved to now + `usec`. For
    /// system tasks only other system tasks may ask.
    pub fn set_task_wakeup(&self, target: TaskId, usec: u32) -> Result<()> {
        self.guarded_request(target, msg::SET_TASK_WAKEUP, usec)
    }

    /// Put this task to sleep; it will only run again after a message
    /// arrives or an explicit wake request.
    pub fn sleep(&self) -> Result<()> {
        self.set_task_sleep(self.id, true)
    }

    /// Wake every sleeping task. Permitted for every task.
    pub fn wake_all(&self) -> Result<()> {
        self.send(self.sys.ids.supervisor, msg::WAKE_ALL, 0, 0)
    }

    /// Dedicate the system to `target`: every other non-system task is put
    /// to sleep. The target must not be a system task and must be awake.
    pub fn dedicate_to(&self, target: TaskId) -> Result<()> {
        if !self.sys.is_valid(target) {
            return Err(Error::TaskNotFound);
        }
        if self.sys.is_system_task(target) {
            warn!(
                caller = %self.name,
                target,
                "task dedication requested for a system task"
            );
            return Err(Error::InvalidOperation);
        }
        self.send(
            self.sys.ids.supervisor,
            msg::DEDICATE_TO_TASK,
            u32::from(target),
            0,
        )
    }

    fn request(&self, target: TaskId, kind: u8, setting: u32) -> Result<()> {
        if !self.sys.is_valid(target) {
            return Err(Error::TaskNotFound);
        }
        self.send(self.sys.ids.supervisor, kind, setting, u32::from(target))
    }

    /// Conditional operations: aiming at a system task requires the caller
    /// to be a system task itself.
    fn guarded_request(&self, target: TaskId, kind: u8, setting: u32) -> Result<()> {
        if !self.sys.is_valid(target) {
            return Err(Error::TaskNotFound);
        }
        if self.sys.is_system_task(target) && !self.sys.is_system_task(self.id) {
            warn!(
                caller = %self.name,
                target,
                kind,
                "attribute change on a system task refused"
            );
            return Err(Error::InvalidOperation);
        }
        self.send(self.sys.ids.supervisor, kind, setting, u32::from(target))
    }
}

// ============================================================================
// Supervisor Service
// ============================================================================

pub(crate) struct SupervisorSvc;

impl SupervisorSvc {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) fn run(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        let sys = ctx.sys;
        match ctx.state {
            state::INIT => {
                // These three are re-entered by the scheduler's bypass
                // invocations; between those they stay asleep.
                sys.task(sys.ids.supervisor).set_sleeping(true);
                sys.task(sys.ids.courier).set_sleeping(true);
                sys.task(sys.ids.irq).set_sleeping(true);
            }
            state::RUN => {
                let mut budget = sys.cfg.batch_limit;
                while budget > 0 {
                    let Some(message) = ctx.recv() else { break };
                    self.apply(ctx, &message);
                    budget -= 1;
                }
                // Only the supervisor may park itself directly.
                sys.task(ctx.id).set_sleeping(true);
            }
            state::STOP => {
                sys.task(ctx.id).set_state(state::DOWN);
            }
            _ => {}
        }
        Ok(())
    }

    fn apply(&mut self, ctx: &TaskContext<'_>, message: &crate::types::Message) {
        let sys = ctx.sys;
        let target = message.secondary as TaskId;
        match message.kind {
            msg::PING => ctx.answer_ping(message),
            msg::SET_SYS_STATE => {
                let value = message.primary as u8;
                debug!(from = message.sender_task, value, "system state change");
                sys.set_state(value);
            }
            msg::SET_TASK_SLEEP if sys.is_valid(target) => {
                let task = sys.task(target);
                if message.primary == 0 {
                    // Wake only if actually sleeping; an awake task keeps
                    // its existing schedule.
                    if task.sleeping() {
                        task.set_sleeping(false);
                        task.set_wake_at(sys.now_us());
                    }
                } else {
                    task.set_sleeping(true);
                }
            }
            msg::SET_TASK_WAKEUP if sys.is_valid(target) => {
                sys.task(target)
                    .set_wake_at(sys.now_us() + TimeUs::from(message.primary));
            }
            msg::SET_TASK_STATE if sys.is_valid(target) => {
                sys.task(target).set_state(message.primary as u8);
            }
            msg::SET_TASK_PRIORITY if sys.is_valid(target) => {
                sys.task(target).set_priority(message.primary);
            }
            msg::SET_TASK_DEBUG if sys.is_valid(target) => {
                sys.task(target).set_debug(message.primary as u8);
            }
            msg::WAKE_ALL => {
                let now = sys.now_us();
                for task in &sys.tasks {
                    if task.sleeping() {
                        task.set_wake_at(now);
                        task.set_sleeping(false);
                    }
                }
                debug!(from = message.sender_task, "all sleeping tasks woken");
            }
            msg::DEDICATE_TO_TASK => {
                let target = message.primary as TaskId;
                if !sys.is_valid(target) || sys.task(target).sleeping() {
                    error!(
                        target,
                        from = message.sender_task,
                        "dedication target is sleeping or invalid, aborting"
                    );
                    return;
                }
                for task in &sys.tasks {
                    if task.id != target && !sys.is_system_task(task.id) {
                        task.set_sleeping(true);
                    }
                }
                warn!(target, "system now dedicated to one task");
            }
            _ => {}
        }
    }
}
