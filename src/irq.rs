//! Interrupt demultiplexer: captures hardware edges into a lock-free
//! queue and fans them out to subscribed tasks.
//!
//! The capture side ([`System::capture_interrupt`]) may be called from any
//! context and never blocks. The demux task drains the queue, walks the
//! subscription list of the affected GPIO and forwards one message per
//! matching subscription, honoring each subscription's anti-bounce window.
//!
//! Subscription state is owned exclusively by the demux task: every change
//! arrives as a message (message type = GPIO number) and is applied inside
//! the demux run, so capture and mutation never race.
//!
//! [`System::capture_interrupt`]: crate::system::System::capture_interrupt

use core::sync::atomic::{AtomicUsize, Ordering};

use heapless::mpmc::Queue as MpMcQueue;
use tracing::{debug, trace, warn};

use crate::task::TaskContext;
use crate::types::{msg, state, Gpio, Result, TaskId, TimeUs, GPIO_COUNT};

// ============================================================================
// Event Masks and Payload Packing
// ============================================================================

/// GPIO event bits carried in capture masks and subscriptions.
pub mod event {
    /// Stable low level.
    pub const LEVEL_LOW: u32 = 1 << 0;
    /// Stable high level.
    pub const LEVEL_HIGH: u32 = 1 << 1;
    /// Falling edge.
    pub const EDGE_FALL: u32 = 1 << 2;
    /// Rising edge.
    pub const EDGE_RISE: u32 = 1 << 3;
}

/// An event mask of 0 in a subscription request means "unsubscribe".
pub const UNSUBSCRIBE: u32 = 0;

/// Anti-bounce windows are packed into 24 bits, capping them at ~16.7 s.
pub const ANTI_BOUNCE_MAX_US: u32 = 0x00FF_FFFF;

/// Capacity of the capture queue. Power of two, fixed at compile time.
pub const IRQ_QUEUE_CAPACITY: usize = 256;

/// Pack pull direction and anti-bounce window into the secondary payload
/// word of a subscription message.
pub fn pack_subscription(pull_down: bool, anti_bounce_us: u32) -> u32 {
    (u32::from(pull_down) << 24) | (anti_bounce_us & ANTI_BOUNCE_MAX_US)
}

/// Inverse of [`pack_subscription`].
pub fn unpack_subscription(secondary: u32) -> (bool, u32) {
    (
        secondary & 0x0100_0000 != 0,
        secondary & ANTI_BOUNCE_MAX_US,
    )
}

// ============================================================================
// Capture Queue
// ============================================================================

/// One captured hardware interrupt.
#[derive(Debug, Clone, Copy)]
pub struct Capture {
    pub gpio: Gpio,
    pub events: u32,
    pub timestamp: TimeUs,
}

/// Lock-free multi-producer queue between interrupt context and the demux.
///
/// A full queue drops the capture and counts the loss; the capture path
/// must never block or allocate.
pub(crate) struct CaptureQueue {
    queue: MpMcQueue<Capture, IRQ_QUEUE_CAPACITY>,
    pending: AtomicUsize,
    dropped: AtomicUsize,
}

impl CaptureQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: MpMcQueue::new(),
            pending: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, gpio: Gpio, events: u32, timestamp: TimeUs) {
        let capture = Capture {
            gpio,
            events,
            timestamp,
        };
        if self.queue.enqueue(capture).is_ok() {
            self.pending.fetch_add(1, Ordering::Release);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn pop(&self) -> Option<Capture> {
        let capture = self.queue.dequeue()?;
        self.pending.fetch_sub(1, Ordering::Release);
        Some(capture)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Captures lost to a full queue since boot.
    pub(crate) fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Task-facing Subscription API
// ============================================================================

impl TaskContext<'_> {
    /// Subscribe this task to interrupt events on a GPIO.
    ///
    /// The first subscription for a GPIO configures the pin as an input
    /// with the requested pull direction. Subscribing again updates the
    /// event mask in place. `anti_bounce_us` suppresses forwards arriving
    /// within the window after the last forwarded interrupt; it is capped
    /// at [`ANTI_BOUNCE_MAX_US`].
    pub fn subscribe_gpio(
        &self,
        gpio: Gpio,
        events: u32,
        pull_down: bool,
        anti_bounce_us: u32,
    ) -> Result<()> {
        self.send(
            self.sys.ids.irq,
            gpio,
            events,
            pack_subscription(pull_down, anti_bounce_us),
        )
    }

    /// Remove this task's subscription on a GPIO.
    pub fn unsubscribe_gpio(&self, gpio: Gpio) -> Result<()> {
        self.send(self.sys.ids.irq, gpio, UNSUBSCRIBE, 0)
    }
}

// ============================================================================
// Demux Service
// ============================================================================

struct Subscription {
    task: TaskId,
    events: u32,
    anti_bounce_us: u32,
    last_forwarded: TimeUs,
}

struct GpioSlot {
    initialized: bool,
    pull_down: bool,
    event_mask: u32,
    subs: Vec<Subscription>,
}

impl GpioSlot {
    const fn new() -> Self {
        Self {
            initialized: false,
            pull_down: true,
            event_mask: 0,
            subs: Vec::new(),
        }
    }
}

/// State of the demux task.
pub(crate) struct IrqDemux {
    gpio: Vec<GpioSlot>,
}

impl IrqDemux {
    pub(crate) fn new() -> Self {
        Self {
            gpio: (0..GPIO_COUNT).map(|_| GpioSlot::new()).collect(),
        }
    }

    pub(crate) fn run(&mut self, ctx: &TaskContext<'_>) -> Result<()> {
        match ctx.state {
            state::INIT => {
                for slot in &mut self.gpio {
                    *slot = GpioSlot::new();
                }
                let _ = ctx.sleep();
            }
            state::RUN => {
                self.dispatch_captures(ctx);
                self.process_requests(ctx);
                let _ = ctx.sleep();
            }
            state::STOP => {
                let _ = ctx.set_task_state(ctx.id, state::DOWN);
            }
            _ => {}
        }
        Ok(())
    }

    /// Drain captured interrupts and forward to subscribers.
    fn dispatch_captures(&mut self, ctx: &TaskContext<'_>) {
        let sys = ctx.sys;
        let mut budget = sys.cfg.batch_limit;
        while budget > 0 {
            let Some(capture) = sys.capture.pop() else { break };
            budget -= 1;
            let slot = &mut self.gpio[capture.gpio as usize];
            if !slot.initialized {
                continue;
            }
            for sub in &mut slot.subs {
                if capture.events & sub.events == 0 {
                    continue;
                }
                let window_open = sub.anti_bounce_us == 0
                    || capture.timestamp
                        > sub.last_forwarded.saturating_add(TimeUs::from(sub.anti_bounce_us));
                if window_open {
                    let _ = ctx.send(
                        sub.task,
                        capture.gpio,
                        capture.events,
                        u32::from(slot.pull_down),
                    );
                    sub.last_forwarded = capture.timestamp;
                } else {
                    trace!(
                        gpio = capture.gpio,
                        task = sub.task,
                        "interrupt suppressed inside the anti-bounce window"
                    );
                }
            }
        }
    }

    /// Drain the demux mailbox: probes and subscription changes.
    fn process_requests(&mut self, ctx: &TaskContext<'_>) {
        let mut budget = ctx.sys.cfg.batch_limit;
        while budget > 0 {
            let Some(message) = ctx.recv() else { break };
            budget -= 1;
            match message.kind {
                msg::PING => ctx.answer_ping(&message),
                gpio if gpio <= msg::GPIO_MAX => self.subscription(ctx, gpio, &message),
                other => {
                    warn!(
                        kind = other,
                        sender = message.sender_task,
                        "invalid request to the interrupt demux"
                    );
                }
            }
        }
    }

    fn subscription(&mut self, ctx: &TaskContext<'_>, gpio: Gpio, message: &crate::types::Message) {
        let (pull_down, anti_bounce_us) = unpack_subscription(message.secondary);
        let events = message.primary;
        let sender = message.sender_task;
        let slot = &mut self.gpio[gpio as usize];

        if !slot.initialized {
            if events == UNSUBSCRIBE {
                warn!(gpio, sender, "unsubscribe for an uninitialized GPIO ignored");
                return;
            }
            if !ctx.sys.board().configure_input(gpio, pull_down) {
                warn!(gpio, sender, "subscription for an unavailable GPIO refused");
                return;
            }
            slot.initialized = true;
            slot.pull_down = pull_down;
            slot.subs.push(Subscription {
                task: sender,
                events,
                anti_bounce_us,
                last_forwarded: 0,
            });
            debug!(gpio, sender, events, pull_down, "GPIO initialized on first subscription");
        } else {
            match slot.subs.iter().position(|s| s.task == sender) {
                Some(index) if events == UNSUBSCRIBE => {
                    slot.subs.swap_remove(index);
                    debug!(gpio, sender, "unsubscribed");
                }
                Some(index) => {
                    // Update in place; the anti-bounce window keeps its
                    // original value.
                    slot.subs[index].events = events;
                    debug!(gpio, sender, events, "subscription updated");
                }
                None if events == UNSUBSCRIBE => {
                    warn!(gpio, sender, "unsubscribe without a subscription ignored");
                }
                None => {
                    slot.subs.push(Subscription {
                        task: sender,
                        events,
                        anti_bounce_us,
                        last_forwarded: 0,
                    });
                    debug!(gpio, sender, events, "subscription added");
                }
            }
        }

        // Recompute the cached union mask and rewire the controller. With
        // no subscribers left, the pin stays configured but the mask goes
        // to zero and nothing is dispatched.
        slot.event_mask = slot.subs.iter().fold(0, |mask, s| mask | s.events);
        if slot.event_mask != 0 {
            ctx.sys.board().enable_irq(gpio, slot.event_mask, true);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, gpio: Gpio) -> usize {
        self.gpio[gpio as usize].subs.len()
    }

    #[cfg(test)]
    fn union_mask(&self, gpio: Gpio) -> u32 {
        self.gpio[gpio as usize].event_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::SimBoard;
    use crate::system::{Runtime, System};
    use crate::types::{debug as dbg, Config, Message, TaskId, PRIORITY_NORMAL};

    fn fixture() -> (Runtime, SimBoard, TaskId) {
        let board = SimBoard::new();
        let mut builder =
            Runtime::builder(Config::default()).with_board(Box::new(board.clone()));
        let listener = builder
            .register("listener", PRIORITY_NORMAL, |_| Ok(()))
            .unwrap();
        (builder.build(), board, listener)
    }

    fn demux_ctx<'rt>(sys: &'rt System) -> TaskContext<'rt> {
        TaskContext {
            sys,
            id: sys.sys_ids().irq,
            state: state::RUN,
            priority: sys.task(sys.sys_ids().irq).priority(),
            debug: dbg::NONE,
            core: 0,
            name: "sys.irq",
        }
    }

    fn subscribe(demux: &mut IrqDemux, sys: &System, from: TaskId, gpio: Gpio, events: u32, anti_bounce: u32) {
        let message = Message {
            sender_host: sys.host_id(),
            sender_task: from,
            recipient_host: sys.host_id(),
            recipient_task: sys.sys_ids().irq,
            kind: gpio,
            primary: events,
            secondary: pack_subscription(true, anti_bounce),
            timestamp: 0,
        };
        demux.subscription(&demux_ctx(sys), gpio, &message);
    }

    #[test]
    fn packing_roundtrip_caps_the_window() {
        let packed = pack_subscription(true, 0x2FF_FFFF);
        let (pull_down, window) = unpack_subscription(packed);
        assert!(pull_down);
        assert_eq!(window, 0xFF_FFFF);
        assert_eq!(unpack_subscription(pack_subscription(false, 1234)), (false, 1234));
    }

    #[test]
    fn capture_queue_counts_and_drops() {
        let queue = CaptureQueue::new();
        for i in 0..IRQ_QUEUE_CAPACITY + 10 {
            queue.push(1, event::EDGE_RISE, i as TimeUs);
        }
        assert_eq!(queue.pending(), IRQ_QUEUE_CAPACITY);
        assert_eq!(queue.dropped(), 10);
        let first = queue.pop().unwrap();
        assert_eq!(first.timestamp, 0);
        assert_eq!(queue.pending(), IRQ_QUEUE_CAPACITY - 1);
    }

    #[test]
    fn first_subscription_initializes_the_pin() {
        let (rt, board, listener) = fixture();
        let sys = rt.system();
        let mut demux = IrqDemux::new();
        subscribe(&mut demux, sys, listener, 4, event::EDGE_FALL, 0);
        assert_eq!(board.configured_pins().len(), 1);
        assert_eq!(board.configured_pins()[0].gpio, 4);
        assert_eq!(board.irq_mask(4), event::EDGE_FALL);
        assert_eq!(demux.subscriber_count(4), 1);
    }

    #[test]
    fn resubscribe_updates_mask_in_place() {
        let (rt, _board, listener) = fixture();
        let sys = rt.system();
        let mut demux = IrqDemux::new();
        subscribe(&mut demux, sys, listener, 4, event::EDGE_FALL, 0);
        subscribe(&mut demux, sys, listener, 4, event::EDGE_RISE | event::EDGE_FALL, 0);
        assert_eq!(demux.subscriber_count(4), 1);
        assert_eq!(demux.union_mask(4), event::EDGE_RISE | event::EDGE_FALL);
    }

    #[test]
    fn unsubscribe_empties_but_keeps_the_pin_configured() {
        let (rt, board, listener) = fixture();
        let sys = rt.system();
        let mut demux = IrqDemux::new();
        subscribe(&mut demux, sys, listener, 7, event::EDGE_RISE, 0);
        subscribe(&mut demux, sys, listener, 7, UNSUBSCRIBE, 0);
        assert_eq!(demux.subscriber_count(7), 0);
        assert_eq!(demux.union_mask(7), 0);
        // Pin config from the first subscription survives.
        assert_eq!(board.configured_pins().len(), 1);
    }

    #[test]
    fn reserved_pin_subscription_is_refused() {
        let (rt, board, listener) = fixture();
        let sys = rt.system();
        let mut demux = IrqDemux::new();
        subscribe(&mut demux, sys, listener, 25, event::EDGE_RISE, 0);
        assert_eq!(demux.subscriber_count(25), 0);
        assert!(board.configured_pins().is_empty());
    }

    #[test]
    fn anti_bounce_forwards_first_suppresses_second() {
        let (rt, board, listener) = fixture();
        let sys = rt.system();
        let mut demux = IrqDemux::new();
        subscribe(&mut demux, sys, listener, 4, event::EDGE_FALL, 10_000);

        board.set_time(50_000);
        sys.capture_interrupt(4, event::EDGE_FALL);
        board.advance(2_000);
        sys.capture_interrupt(4, event::EDGE_FALL);
        demux.dispatch_captures(&demux_ctx(sys));

        // Exactly one forwarded message, the first capture.
        assert_eq!(sys.outbound[0].messages_waiting(), 1);
        let forwarded = sys.outbound[0].pop().unwrap();
        assert_eq!(forwarded.recipient_task, listener);
        assert_eq!(forwarded.kind, 4);
        assert_eq!(forwarded.primary, event::EDGE_FALL);

        // Past the window the next capture goes through.
        board.set_time(70_000);
        sys.capture_interrupt(4, event::EDGE_FALL);
        demux.dispatch_captures(&demux_ctx(sys));
        assert_eq!(sys.outbound[0].messages_waiting(), 1);
    }

    #[test]
    fn capture_for_unwatched_event_is_not_forwarded() {
        let (rt, _board, listener) = fixture();
        let sys = rt.system();
        let mut demux = IrqDemux::new();
        subscribe(&mut demux, sys, listener, 4, event::EDGE_FALL, 0);
        sys.capture_interrupt(4, event::EDGE_RISE);
        demux.dispatch_captures(&demux_ctx(sys));
        assert_eq!(sys.outbound[0].messages_waiting(), 0);
    }
}
