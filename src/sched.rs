//! Per-core cooperative scheduler.
//!
//! Each core runs one `Scheduler` over the shared system record; the two
//! instances cooperate only through that record. The global system state
//! drives three phases:
//!
//! * **Init** — core 0 gives every task one unconditional init invocation,
//!   staggers the first wake-up deadlines so the priority buckets do not
//!   fire in lockstep, routes any bring-up messages and raises the
//!   system-ready line. Core 1 waits.
//! * **Run** — the work loop. Passes cycle through a priority ceiling
//!   high → normal → low, so high-priority tasks are considered three
//!   times per cycle, normal twice, low once. Core 0 walks the table
//!   bottom-up, core 1 top-down. A task runs only if the other core is
//!   not on the same id, its priority fits the ceiling, it is awake, and
//!   its wake-up deadline has passed.
//! * **Stop** — core 0 drains the courier and the event log once, gives
//!   every task a final `Stop` invocation in descending id order, then
//!   moves the system to `Down`. Core 1 parks and waits.
//!
//! Collisions (both cores converging on one task id) resolve by a bounded
//! spin: the later core parks its run pointer and backs off for a few
//! microseconds, biased by core id and widened with random jitter to break
//! symmetry. A compare-and-swap claim on the task's running-core cell
//! guarantees that at most one core ever executes a given task.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, trace};

use crate::system::System;
use crate::types::{state, CoreId, Error, Priority, Result, TaskId, TimeUs, CORE0, NO_CORE};

pub struct Scheduler {
    sys: Arc<System>,
    core: CoreId,
    rng: SmallRng,
}

impl Scheduler {
    pub fn new(sys: Arc<System>, core: CoreId) -> Self {
        Self {
            sys,
            core,
            rng: SmallRng::seed_from_u64(0x6475_6574 ^ u64::from(core)),
        }
    }

    /// Drive the full lifecycle until the system reaches `Down`.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.sys.state() {
                state::DOWN => break,
                state::INIT => self.init_phase(),
                state::RUN => self.run_phase(),
                _ => self.stop_phase(),
            }
        }
        debug!(core = self.core, "scheduler done");
        match self.sys.fatal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Init
    // ========================================================================

    pub(crate) fn init_phase(&mut self) {
        let sys = Arc::clone(&self.sys);
        if self.core != CORE0 {
            while sys.state() == state::INIT {
                sys.board().delay_us(1_000);
            }
            return;
        }

        debug!("initializing tasks");
        for id in 1..sys.task_count() as TaskId {
            sys.run_ptr[0].store(id, Ordering::SeqCst);
            sys.task(id).set_state(state::INIT);
            match self.execute(id) {
                Ok(_) => sys.task(id).set_state(state::RUN),
                Err(err) => {
                    error!(task = %sys.task(id).name(), id, %err, "task failed to initialize");
                    sys.record_fatal(Error::Initializing);
                    sys.set_state(state::STOP);
                }
            }
        }

        if !sys.cfg.disable_scheduler {
            let start =
                sys.now_us() + TimeUs::from(sys.cfg.startup_delay_ms) * 1_000;
            assign_start_deadlines(&sys, start);
        }

        if sys.state() == state::INIT {
            // Route whatever the init passes produced before the first run.
            self.bypass(sys.ids.courier);
            self.bypass(sys.ids.supervisor);
            sys.set_state(state::RUN);
            sys.board().set_system_ready(true);
            debug!(tasks = sys.task_count(), "system running, ready line high");
        }
    }

    // ========================================================================
    // Run
    // ========================================================================

    fn run_phase(&mut self) {
        let sys = Arc::clone(&self.sys);
        let mut ceiling = sys.cfg.priority_high;
        debug!(
            core = self.core,
            direction = if self.core == CORE0 { "ascending" } else { "descending" },
            "run loop starting"
        );

        while sys.state() == state::RUN {
            self.run_pass(ceiling);
            ceiling = self.next_ceiling(ceiling);
        }
        debug!(core = self.core, state = sys.state(), "run loop stopped");
    }

    /// Walk the task table once under the given priority ceiling.
    ///
    /// This is one pass of the work loop; three passes with the ceilings
    /// produced by [`next_ceiling`] make one priority cycle. Public so that
    /// embedders driving the system manually can schedule single passes.
    ///
    /// [`next_ceiling`]: Scheduler::next_ceiling
    pub fn run_pass(&mut self, ceiling: Priority) {
        let sys = Arc::clone(&self.sys);
        let cfg = sys.cfg.clone();
        let me = self.core as usize;
        let ascending = self.core == CORE0;
        let count = sys.task_count() as TaskId;
        let mut position = 0;
        while position < count.saturating_sub(1) {
            // Ids 1..count, walked in this core's direction; the
            // scheduler's own entry (id 0) is never considered.
            let id = if ascending {
                1 + position
            } else {
                count - 1 - position
            };
            position += 1;
            if sys.state() != state::RUN {
                break;
            }
            sys.run_ptr[me].store(id, Ordering::SeqCst);

            let task = sys.task(id);
            let now = sys.now_us();
            let eligible = sys.run_ptr[me ^ 1].load(Ordering::SeqCst) != id
                && (cfg.disable_priorities
                    || cfg.disable_scheduler
                    || task.priority() <= ceiling)
                && (cfg.disable_scheduler
                    || (!task.sleeping() && task.wake_at() <= now));

            if eligible {
                match self.execute(id) {
                    Ok(ran) => {
                        if sys.outbound[me].messages_waiting() > 0 {
                            self.bypass(sys.ids.courier);
                            self.bypass(sys.ids.supervisor);
                            sys.run_ptr[me].store(id, Ordering::SeqCst);
                        }
                        if ran && sys.state() == state::RUN && !cfg.disable_scheduler {
                            self.advance_deadline(id);
                        }
                    }
                    Err(err) => {
                        error!(
                            core = self.core,
                            task = %sys.task(id).name(),
                            %err,
                            "fatal task error, stopping the system"
                        );
                        sys.record_fatal(Error::RunningTask);
                        sys.set_state(state::STOP);
                        break;
                    }
                }
            }

            // Captured interrupts and pending demux requests ride the
            // same bypass: demux, then delivery, then wake-ups.
            if sys.interrupts_pending() > 0
                || sys.task(sys.ids.irq).inbox.messages_waiting() > 0
            {
                self.bypass(sys.ids.irq);
                self.bypass(sys.ids.courier);
                self.bypass(sys.ids.supervisor);
                sys.run_ptr[me].store(id, Ordering::SeqCst);
            }
        }
    }

    /// The ceiling of the pass following one run at `ceiling`:
    /// high → normal → low → high.
    pub fn next_ceiling(&self, ceiling: Priority) -> Priority {
        let cfg = &self.sys.cfg;
        if ceiling == cfg.priority_high {
            cfg.priority_normal
        } else if ceiling == cfg.priority_normal {
            cfg.priority_low
        } else {
            cfg.priority_high
        }
    }

    /// After a successful run the task's deadline is advanced by its
    /// priority until it lies strictly in the future. A task that set its
    /// own deadline far ahead during the run is left alone.
    fn advance_deadline(&self, id: TaskId) {
        let task = self.sys.task(id);
        let now = self.sys.now_us();
        let step = TimeUs::from(task.priority().max(1));
        let mut wake = task.wake_at();
        if wake > now {
            return;
        }
        while wake <= now {
            wake += step;
        }
        task.set_wake_at(wake);
        trace!(core = self.core, task = id, wake, "next wake-up scheduled");
    }

    // ========================================================================
    // Stop
    // ========================================================================

    fn stop_phase(&mut self) {
        let sys = Arc::clone(&self.sys);
        if sys.state() != state::STOP {
            sys.set_state(state::STOP);
        }
        if self.core != CORE0 {
            sys.run_ptr[1].store(NO_CORE, Ordering::SeqCst);
            while sys.state() == state::STOP {
                sys.board().delay_us(1_000);
            }
            return;
        }

        sys.board().set_system_ready(false);
        debug!("stopping, ready line low");

        // Flush in-flight messages and log entries while the transports
        // are still in their run state.
        self.bypass(sys.ids.courier);
        self.bypass(sys.ids.eventlog);

        // One final Stop invocation per task, highest id first.
        for id in (1..sys.task_count() as TaskId).rev() {
            sys.run_ptr[0].store(id, Ordering::SeqCst);
            sys.task(id).set_state(state::STOP);
            let _ = self.execute(id);
        }

        debug!("all tasks stopped, system going down");
        sys.set_state(state::DOWN);
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run the task the run pointer refers to, resolving cross-core
    /// collisions first.
    ///
    /// Returns `Ok(false)` when the other core won the claim after all.
    fn execute(&mut self, id: TaskId) -> Result<bool> {
        let sys = Arc::clone(&self.sys);
        let me = self.core as usize;
        if !sys.cfg.disable_second_core {
            while sys.run_ptr[me ^ 1].load(Ordering::SeqCst) == id {
                // Collision: park, back off asymmetrically, retry.
                sys.run_ptr[me].store(NO_CORE, Ordering::SeqCst);
                let spin = sys.cfg.collision_backoff_us
                    + u64::from(self.core) * 2
                    + self.rng.gen_range(0..=sys.cfg.collision_jitter_us);
                sys.board().delay_us(spin);
                sys.run_ptr[me].store(id, Ordering::SeqCst);
            }
        }
        sys.step(self.core, id)
    }

    /// Invoke a system task out of band (delivery, wake-ups, interrupt
    /// dispatch). Errors are ignored here; the services report through the
    /// log instead of failing the system.
    fn bypass(&mut self, id: TaskId) {
        self.sys.run_ptr[self.core as usize].store(id, Ordering::SeqCst);
        let _ = self.execute(id);
    }
}

// ============================================================================
// Start-up Staggering
// ============================================================================

/// Give every task an initial wake-up deadline so that tasks of one
/// priority bucket are spread evenly over the bucket's period, and the
/// buckets themselves are shifted by half an offset against each other.
pub(crate) fn assign_start_deadlines(sys: &System, start: TimeUs) {
    let cfg = &sys.cfg;
    let (mut high, mut normal, mut other) = (0u32, 0u32, 0u32);
    for task in sys.tasks.iter().skip(1) {
        let priority = task.priority();
        if priority == cfg.priority_high {
            high += 1;
        } else if priority == cfg.priority_normal {
            normal += 1;
        } else {
            other += 1;
        }
    }

    let high_offset = TimeUs::from(if high > 0 { cfg.priority_high / high } else { 0 });
    let normal_offset = TimeUs::from(if normal > 0 {
        cfg.priority_normal / normal
    } else {
        0
    });
    let other_offset = TimeUs::from(if other > 0 { cfg.priority_low / other } else { 0 });

    let (mut k_high, mut k_normal, mut k_other) = (0u64, 0u64, 0u64);
    for task in sys.tasks.iter().skip(1) {
        let priority = task.priority();
        let wake = if priority == cfg.priority_high {
            let wake = start + k_high * high_offset;
            k_high += 1;
            wake
        } else if priority == cfg.priority_normal {
            let wake = start + high_offset / 2 + k_normal * normal_offset;
            k_normal += 1;
            wake
        } else {
            let wake = start + normal_offset / 2 + k_other * other_offset;
            k_other += 1;
            wake
        };
        task.set_wake_at(wake);
        trace!(task = %task.name(), wake, "first wake-up assigned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::SimBoard;
    use crate::system::Runtime;
    use crate::types::{Config, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL};

    fn high_trio_runtime() -> (Runtime, SimBoard) {
        let board = SimBoard::new();
        // No timer service, so the three user tasks are the only
        // high-priority entries.
        let cfg = Config {
            disable_scheduler: true,
            disable_watchdog: true,
            ..Default::default()
        };
        let mut builder = Runtime::builder(cfg).with_board(Box::new(board.clone()));
        for name in ["t1", "t2", "t3"] {
            builder.register(name, PRIORITY_HIGH, |_| Ok(())).unwrap();
        }
        (builder.build(), board)
    }

    #[test]
    fn stagger_spreads_a_priority_bucket_evenly() {
        let (rt, board) = high_trio_runtime();
        let sys = rt.system();
        board.set_time(0);
        assign_start_deadlines(sys, 1_000);

        let t1 = sys.task_id("t1").unwrap();
        let deadlines: Vec<TimeUs> = (0..3)
            .map(|i| sys.task(t1 + i).wake_at())
            .collect();
        // 2500 / 3 = 833: start, start + 833, start + 1666.
        assert_eq!(deadlines, vec![1_000, 1_833, 2_666]);
    }

    #[test]
    fn stagger_shifts_buckets_by_half_an_offset() {
        let board = SimBoard::new();
        let cfg = Config {
            disable_scheduler: true,
            disable_watchdog: true,
            ..Default::default()
        };
        let mut builder = Runtime::builder(cfg).with_board(Box::new(board.clone()));
        let hi = builder.register("hi", PRIORITY_HIGH, |_| Ok(())).unwrap();
        let no = builder.register("no", PRIORITY_NORMAL, |_| Ok(())).unwrap();
        let rt = builder.build();
        let sys = rt.system();
        // System tasks are all priority-low here; put them aside.
        assign_start_deadlines(sys, 10_000);

        // One high task: offset 2500, first fire at start.
        assert_eq!(sys.task(hi).wake_at(), 10_000);
        // One normal task: shifted by high_offset / 2 = 1250.
        assert_eq!(sys.task(no).wake_at(), 10_000 + 1_250);
    }

    #[test]
    fn pass_ceiling_cycles_high_normal_low() {
        let (rt, _board) = high_trio_runtime();
        let sched = Scheduler::new(Arc::clone(rt.system()), CORE0);
        let mut ceiling = rt.system().config().priority_high;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(ceiling);
            ceiling = sched.next_ceiling(ceiling);
        }
        assert_eq!(
            seen,
            vec![
                PRIORITY_HIGH,
                PRIORITY_NORMAL,
                PRIORITY_LOW,
                PRIORITY_HIGH,
                PRIORITY_NORMAL,
                PRIORITY_LOW
            ]
        );
    }

    #[test]
    fn deadline_advance_is_strictly_future_and_drift_free() {
        let (rt, board) = {
            let board = SimBoard::new();
            let mut builder =
                Runtime::builder(Config::default()).with_board(Box::new(board.clone()));
            builder.register("t", PRIORITY_NORMAL, |_| Ok(())).unwrap();
            (builder.build(), board)
        };
        let sys = rt.system();
        let id = sys.task_id("t").unwrap();
        let sched = Scheduler::new(Arc::clone(sys), 0);

        // Deadline three periods in the past: catches up without drifting.
        board.set_time(100_000);
        sys.task(id).set_wake_at(100_000 - 3 * 5_000);
        sched.advance_deadline(id);
        assert_eq!(sys.task(id).wake_at(), 105_000);

        // Deadline exactly now: strictly greater afterwards.
        sys.task(id).set_wake_at(100_000);
        sched.advance_deadline(id);
        assert!(sys.task(id).wake_at() > 100_000);

        // Far-future deadline set by the task itself: untouched.
        sys.task(id).set_wake_at(9_000_000);
        sched.advance_deadline(id);
        assert_eq!(sys.task(id).wake_at(), 9_000_000);
    }

    #[test]
    fn init_phase_brings_the_system_up() {
        let board = SimBoard::new();
        let cfg = Config {
            disable_second_core: true,
            ..Default::default()
        };
        let mut builder = Runtime::builder(cfg).with_board(Box::new(board.clone()));
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen2 = std::sync::Arc::clone(&seen);
        builder
            .register("t", PRIORITY_NORMAL, move |ctx| {
                if ctx.state == state::INIT {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();
        let rt = builder.build();
        let sys = rt.system();
        Scheduler::new(Arc::clone(sys), CORE0).init_phase();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(sys.state(), state::RUN);
        assert!(board.ready());
        // The supervisor's init pass parked the message-driven services.
        assert!(sys.task(sys.sys_ids().courier).sleeping());
        assert!(sys.task(sys.sys_ids().irq).sleeping());
    }

    #[test]
    fn failed_init_stops_the_system() {
        let board = SimBoard::new();
        let cfg = Config {
            disable_second_core: true,
            ..Default::default()
        };
        let mut builder = Runtime::builder(cfg).with_board(Box::new(board.clone()));
        builder
            .register("broken", PRIORITY_NORMAL, |ctx| {
                if ctx.state == state::INIT {
                    Err(Error::Initializing)
                } else {
                    Ok(())
                }
            })
            .unwrap();
        let rt = builder.build();
        let sys = rt.system();
        Scheduler::new(Arc::clone(sys), CORE0).init_phase();

        assert_eq!(sys.state(), state::STOP);
        assert_eq!(sys.fatal_error(), Some(Error::Initializing));
        assert!(!board.ready());
    }
}
