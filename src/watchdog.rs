//! Watchdog: periodic liveness probes for every awake task.
//!
//! Each check interval the watchdog sends a `Ping` with a fresh counter
//! payload to every non-sleeping task (except itself and the scheduler
//! placeholder) and remembers what it expects back. A matching `Echo`
//! arriving later than the timeout is logged as an error; a ping still
//! unanswered when the next round starts is logged as a warning. The
//! watchdog only reports, it never stops the system.

use tracing::debug;

use crate::task::TaskContext;
use crate::types::{msg, state, Result, TimeUs};

/// The ping payload counter wraps here to keep payloads small.
const COUNTER_WRAP: u32 = 50_000;

pub(crate) struct WatchdogSvc {
    sent_at: Vec<TimeUs>,
    expected: Vec<Option<u32>>,
    counter: u32,
    next_round: TimeUs,
    check_interval_us: TimeUs,
    timeout_us: TimeUs,
}

impl WatchdogSvc {
    pub(crate) fn new(max_tasks: usize, check_interval_us: TimeUs, timeout_us: TimeUs) -> Self {
        Self {
            sent_at: vec![0; max_tasks],
            expected: vec![None; max_tasks],
            counter: 0,
            next_round: 0,
            check_interval_us,
            timeout_us,
        }
    }

    pub(crate) fn run(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        match ctx.state {
            state::INIT => {
                self.counter = 0;
                self.next_round = 0;
                self.sent_at.iter_mut().for_each(|t| *t = 0);
                self.expected.iter_mut().for_each(|e| *e = None);
            }
            state::RUN => {
                self.collect_echoes(ctx);
                self.ping_round(ctx);
            }
            state::STOP => {
                let _ = ctx.set_task_state(ctx.id, state::DOWN);
            }
            _ => {}
        }
        Ok(())
    }

    fn collect_echoes(&mut self, ctx: &TaskContext<'_>) {
        let mut budget = ctx.sys.cfg.batch_limit;
        while budget > 0 {
            let Some(message) = ctx.recv() else { break };
            budget -= 1;
            match message.kind {
                msg::PING => ctx.answer_ping(&message),
                msg::TEST => {
                    debug!(sender = message.sender_task, "test message received");
                }
                msg::ECHO => {
                    let sender = message.sender_task as usize;
                    match self.expected.get(sender).copied().flatten() {
                        Some(expected) if expected == message.primary => {
                            let delay = ctx.now_us().saturating_sub(self.sent_at[sender]);
                            if delay > self.timeout_us {
                                let _ = ctx.log_error(format!(
                                    "echo from task {} exceeded the {} us timeout (delay {} us)",
                                    message.sender_task, self.timeout_us, delay
                                ));
                            }
                            self.expected[sender] = None;
                        }
                        Some(expected) => {
                            let _ = ctx.log_error(format!(
                                "stale echo from task {}: expected {}, received {}",
                                message.sender_task, expected, message.primary
                            ));
                        }
                        None => {
                            debug!(
                                sender = message.sender_task,
                                payload = message.primary,
                                "unsolicited echo ignored"
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Send the next round of probes once the interval has elapsed. An
    /// early wake-up (mail arrived) must not flood the system with pings.
    fn ping_round(&mut self, ctx: &TaskContext<'_>) {
        let sys = ctx.sys;
        let now = ctx.now_us();
        if now < self.next_round {
            return;
        }
        for id in 1..sys.task_count() {
            let id = id as u8;
            if id == ctx.id || !sys.is_awake(id) {
                continue;
            }
            if let Some(pending) = self.expected[id as usize] {
                let _ = ctx.log_error(format!(
                    "warning: task {} never answered ping {}",
                    id, pending
                ));
            }
            let _ = ctx.send(id, msg::PING, self.counter, 0);
            self.sent_at[id as usize] = now;
            self.expected[id as usize] = Some(self.counter);
            self.counter = (self.counter + 1) % COUNTER_WRAP;
        }
        self.next_round = now + self.check_interval_us;
    }
}
