//! The courier: moves messages from the per-core outbound queues into the
//! recipients' inbound mailboxes and arranges wake-ups.
//!
//! Delivery is lossy by contract: a full mailbox demotes to a logged
//! warning and the record is dropped — senders design around it. Within one
//! outbound queue arrival order is preserved; across the two queues there
//! is no ordering.
//!
//! The sending and receiving wrappers tasks use live here as
//! [`TaskContext`] methods, so every queue touch goes through one module.

use tracing::{debug, trace, warn};

use crate::parcel::Payload;
use crate::system::System;
use crate::task::TaskContext;
use crate::types::{msg, state, HostId, Message, Result, TaskId, TASK_UNSPECIFIED};

// ============================================================================
// Task-facing Messaging API
// ============================================================================

impl TaskContext<'_> {
    /// Queue a message to another task on this host. The record lands in
    /// this core's outbound queue and is delivered by the courier after the
    /// current run completes.
    pub fn send(&self, recipient: TaskId, kind: u8, primary: u32, secondary: u32) -> Result<()> {
        self.send_to_host(self.sys.host_id(), recipient, kind, primary, secondary)
    }

    /// Queue a message with an explicit recipient host id.
    pub fn send_to_host(
        &self,
        recipient_host: HostId,
        recipient: TaskId,
        kind: u8,
        primary: u32,
        secondary: u32,
    ) -> Result<()> {
        self.sys.outbound[self.core as usize].write(Message {
            sender_host: self.sys.host_id(),
            sender_task: self.id,
            recipient_host,
            recipient_task: recipient,
            kind,
            primary,
            secondary,
            timestamp: self.now_us(),
        })
    }

    /// Answer a liveness probe with an echo carrying the same payload.
    pub fn answer_ping(&self, ping: &Message) {
        let _ = self.send_to_host(ping.sender_host, ping.sender_task, msg::ECHO, ping.primary, 0);
    }
}

// ============================================================================
// Courier Service
// ============================================================================

/// State of the courier task.
pub(crate) struct CourierSvc {
    needs_wake: Vec<bool>,
}

impl CourierSvc {
    pub(crate) fn new(max_tasks: usize) -> Self {
        Self {
            needs_wake: vec![false; max_tasks],
        }
    }

    pub(crate) fn run(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        match ctx.state {
            state::INIT => {
                self.needs_wake.iter_mut().for_each(|flag| *flag = false);
            }
            state::RUN => self.deliver(ctx),
            state::STOP => {
                // Direct store: a supervisor request from here would never
                // be delivered again.
                ctx.sys.task(ctx.id).set_state(state::DOWN);
            }
            _ => {}
        }
        Ok(())
    }

    fn deliver(&mut self, ctx: &TaskContext<'_>) {
        let sys = ctx.sys;
        let mut budget = sys.cfg.batch_limit;

        // Own mailbox first: the courier answers probes like any task.
        while budget > 0 {
            let Some(message) = ctx.recv() else { break };
            if message.kind == msg::PING {
                ctx.answer_ping(&message);
            }
            budget -= 1;
        }

        // Drain the outbound queues of both cores.
        for queue in &sys.outbound {
            while budget > 0 {
                let Some(message) = queue.peek() else { break };
                self.route(sys, &message);
                queue.pop();
                budget -= 1;
            }
        }

        // Ask the supervisor to wake every recipient that got mail. The
        // supervisor and the demux are re-entered by the scheduler's bypass
        // invocations instead; waking them here would be a cycle.
        for id in 0..sys.task_count() {
            if !self.needs_wake[id] {
                continue;
            }
            self.needs_wake[id] = false;
            let request = Message {
                sender_host: sys.host_id(),
                sender_task: ctx.id,
                recipient_host: sys.host_id(),
                recipient_task: sys.ids.supervisor,
                kind: msg::SET_TASK_SLEEP,
                primary: 0,
                secondary: id as u32,
                timestamp: sys.now_us(),
            };
            if sys.task(sys.ids.supervisor).inbox.write(request).is_err() {
                warn!(task = id, "supervisor mailbox full, wake request dropped");
            }
        }

        // Nothing to do until new mail shows up; the scheduler re-enters the
        // courier directly whenever an outbound queue is non-empty.
        sys.task(ctx.id).set_sleeping(true);
    }

    fn route(&mut self, sys: &System, message: &Message) {
        let recipient = message.recipient_task;
        if recipient == TASK_UNSPECIFIED {
            warn!(
                kind = message.kind,
                sender = message.sender_task,
                "message without a recipient dropped"
            );
            self.discard_payload(sys, message);
            return;
        }
        if !sys.is_valid(recipient) {
            warn!(
                kind = message.kind,
                sender = message.sender_task,
                recipient,
                "invalid recipient, message dropped"
            );
            self.discard_payload(sys, message);
            return;
        }
        match sys.task(recipient).inbox.write(*message) {
            Ok(()) => {
                trace!(
                    kind = message.kind,
                    sender = message.sender_task,
                    recipient,
                    "message delivered"
                );
                if recipient != sys.ids.supervisor && recipient != sys.ids.irq {
                    self.needs_wake[recipient as usize] = true;
                }
            }
            Err(_) => {
                warn!(
                    kind = message.kind,
                    sender = message.sender_task,
                    recipient,
                    "mailbox full, message dropped"
                );
                self.discard_payload(sys, message);
            }
        }
    }

    /// A dropped message may carry a payload ticket; reclaim it so the
    /// transfer does not leak.
    fn discard_payload(&self, sys: &System, message: &Message) {
        let carries_ticket = matches!(
            message.kind,
            msg::LOG_NOTIFY | msg::LOG_ERROR | msg::SET_TIMER
        );
        if carries_ticket && message.sender_host == sys.host_id() {
            if let Some(payload) = sys.parcels.claim(message.primary) {
                if let Payload::Text(text) = &payload {
                    debug!(text = %text, "undeliverable log entry discarded");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::SimBoard;
    use crate::system::Runtime;
    use crate::types::{Config, CORE0, PRIORITY_NORMAL};

    fn runtime_with_pair() -> (Runtime, TaskId, TaskId) {
        let mut builder = Runtime::builder(Config::default()).with_board(Box::new(SimBoard::new()));
        let a = builder.register("a", PRIORITY_NORMAL, |_| Ok(())).unwrap();
        let b = builder.register("b", PRIORITY_NORMAL, |_| Ok(())).unwrap();
        let rt = builder.build();
        // Bring the courier straight to its working state.
        rt.system()
            .task(rt.system().sys_ids().courier)
            .set_state(state::RUN);
        (rt, a, b)
    }

    fn outbound_message(sys: &System, from: TaskId, to: TaskId, primary: u32) -> Message {
        Message {
            sender_host: sys.host_id(),
            sender_task: from,
            recipient_host: sys.host_id(),
            recipient_task: to,
            kind: msg::TEST,
            primary,
            ..Default::default()
        }
    }

    #[test]
    fn routes_to_recipient_and_requests_wake() {
        let (rt, a, b) = runtime_with_pair();
        let sys = rt.system();
        sys.task(b).set_sleeping(true);
        sys.outbound[0]
            .write(outbound_message(sys, a, b, 42))
            .unwrap();

        rt.step_task(CORE0, sys.sys_ids().courier).unwrap();

        assert_eq!(sys.task(b).inbox.messages_waiting(), 1);
        assert_eq!(sys.task(b).inbox.peek().unwrap().primary, 42);
        // Wake request for b is parked in the supervisor's mailbox.
        let request = sys.task(sys.sys_ids().supervisor).inbox.pop().unwrap();
        assert_eq!(request.kind, msg::SET_TASK_SLEEP);
        assert_eq!(request.secondary, u32::from(b));
        assert_eq!(request.primary, 0);
        // The courier parked itself.
        assert!(sys.task(sys.sys_ids().courier).sleeping());
    }

    #[test]
    fn fifo_within_one_outbound_queue() {
        let (rt, a, b) = runtime_with_pair();
        let sys = rt.system();
        for i in 0..5 {
            sys.outbound[0]
                .write(outbound_message(sys, a, b, i))
                .unwrap();
        }
        rt.step_task(CORE0, sys.sys_ids().courier).unwrap();
        for i in 0..5 {
            assert_eq!(sys.task(b).inbox.pop().unwrap().primary, i);
        }
    }

    #[test]
    fn unspecified_recipient_is_dropped() {
        let (rt, a, b) = runtime_with_pair();
        let sys = rt.system();
        sys.outbound[0]
            .write(outbound_message(sys, a, TASK_UNSPECIFIED, 1))
            .unwrap();
        rt.step_task(CORE0, sys.sys_ids().courier).unwrap();
        assert_eq!(sys.outbound[0].messages_waiting(), 0);
        assert_eq!(sys.task(b).inbox.messages_waiting(), 0);
    }

    #[test]
    fn full_mailbox_drops_and_reclaims_payload() {
        let (rt, a, b) = runtime_with_pair();
        let sys = rt.system();
        // Fill b's mailbox to the brim.
        while sys.task(b).inbox.slots_available() > 0 {
            sys.task(b)
                .inbox
                .write(outbound_message(sys, a, b, 0))
                .unwrap();
        }
        let ticket = sys.parcels.stash(Payload::Text("lost".into()));
        let mut overflow = outbound_message(sys, a, b, ticket);
        overflow.kind = msg::LOG_NOTIFY;
        sys.outbound[0].write(overflow).unwrap();

        rt.step_task(CORE0, sys.sys_ids().courier).unwrap();
        assert_eq!(sys.outbound[0].messages_waiting(), 0);
        assert_eq!(sys.parcels.outstanding(), 0);
    }

    #[test]
    fn courier_answers_pings_itself() {
        let (rt, a, _) = runtime_with_pair();
        let sys = rt.system();
        let courier = sys.sys_ids().courier;
        let mut ping = outbound_message(sys, a, courier, 7);
        ping.kind = msg::PING;
        sys.task(courier).inbox.write(ping).unwrap();

        rt.step_task(CORE0, courier).unwrap();
        // The echo went out through the courier's own outbound queue and
        // was routed in the same run.
        let echo = sys.task(a).inbox.pop().unwrap();
        assert_eq!(echo.kind, msg::ECHO);
        assert_eq!(echo.primary, 7);
    }
}
