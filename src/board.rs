//! Board abstraction: time source and the few external signals the
//! runtime drives.
//!
//! The runtime needs a monotonic microsecond clock, the "system-ready"
//! output, and GPIO input configuration for the interrupt demux. Board
//! bring-up itself stays outside the runtime; implement this trait for the
//! target platform.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::{Gpio, TimeUs, GPIO_COUNT};

// ============================================================================
// Board Trait
// ============================================================================

/// Platform interface used by the runtime.
pub trait Board: Send + Sync {
    /// Current time in microseconds. Must be monotonically increasing.
    fn time_us(&self) -> TimeUs;

    /// Busy-wait for the given number of microseconds.
    fn delay_us(&self, us: u64);

    /// Drive the system-ready output. High while the system is in `Run`.
    fn set_system_ready(&self, ready: bool);

    /// Configure a GPIO as an input with the requested pull direction.
    ///
    /// Returns `false` when the pin is not available for subscriptions
    /// (host-reserved pins on the reference board).
    fn configure_input(&self, gpio: Gpio, pull_down: bool) -> bool;

    /// Wire the given event mask into the hardware interrupt controller.
    fn enable_irq(&self, gpio: Gpio, event_mask: u32, enabled: bool);
}

// ============================================================================
// Host Board
// ============================================================================

/// Board backed by the host's monotonic clock. GPIO operations are
/// recorded only as a ready flag and otherwise accepted as no-ops.
pub struct HostBoard {
    start: Instant,
    ready: AtomicBool,
}

impl HostBoard {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            ready: AtomicBool::new(false),
        }
    }

    /// Current state of the system-ready line.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl Default for HostBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for HostBoard {
    fn time_us(&self) -> TimeUs {
        self.start.elapsed().as_micros() as TimeUs
    }

    fn delay_us(&self, us: u64) {
        if us >= 1_000 {
            std::thread::sleep(Duration::from_micros(us));
        } else {
            let until = self.time_us() + us;
            while self.time_us() < until {
                core::hint::spin_loop();
            }
        }
    }

    fn set_system_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    fn configure_input(&self, gpio: Gpio, _pull_down: bool) -> bool {
        (gpio as usize) < GPIO_COUNT
    }

    fn enable_irq(&self, _gpio: Gpio, _event_mask: u32, _enabled: bool) {}
}

// ============================================================================
// Simulated Board (tests)
// ============================================================================

/// A recorded GPIO configuration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinConfig {
    pub gpio: Gpio,
    pub pull_down: bool,
}

struct SimInner {
    time: AtomicU64,
    ready: AtomicBool,
    ready_history: Mutex<Vec<bool>>,
    configured: Mutex<Vec<PinConfig>>,
    irq_masks: Mutex<[u32; GPIO_COUNT]>,
    reserved: [bool; GPIO_COUNT],
}

/// Board with a manually driven clock and recorded pin operations.
///
/// Clones share the same state, so a test can keep a handle after moving
/// one into the runtime. `delay_us` advances the clock, so collision
/// back-off and polling loops make progress under test without real
/// waiting.
#[derive(Clone)]
pub struct SimBoard {
    inner: Arc<SimInner>,
}

impl SimBoard {
    /// New board at time 0 with the reference board's host-reserved pins
    /// (23, 24, 25) refused for input configuration.
    pub fn new() -> Self {
        let mut reserved = [false; GPIO_COUNT];
        for pin in [23usize, 24, 25] {
            reserved[pin] = true;
        }
        Self {
            inner: Arc::new(SimInner {
                time: AtomicU64::new(0),
                ready: AtomicBool::new(false),
                ready_history: Mutex::new(Vec::new()),
                configured: Mutex::new(Vec::new()),
                irq_masks: Mutex::new([0; GPIO_COUNT]),
                reserved,
            }),
        }
    }

    /// Advance the clock by `us` microseconds.
    pub fn advance(&self, us: u64) {
        self.inner.time.fetch_add(us, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute timestamp.
    pub fn set_time(&self, us: TimeUs) {
        self.inner.time.store(us, Ordering::SeqCst);
    }

    /// Current state of the system-ready line.
    pub fn ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Every transition driven onto the ready line, in order.
    pub fn ready_history(&self) -> Vec<bool> {
        self.inner.ready_history.lock().clone()
    }

    /// Every input configuration accepted, in order.
    pub fn configured_pins(&self) -> Vec<PinConfig> {
        self.inner.configured.lock().clone()
    }

    /// The event mask currently wired for a GPIO.
    pub fn irq_mask(&self, gpio: Gpio) -> u32 {
        self.inner.irq_masks.lock()[gpio as usize]
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for SimBoard {
    fn time_us(&self) -> TimeUs {
        self.inner.time.load(Ordering::SeqCst)
    }

    fn delay_us(&self, us: u64) {
        self.advance(us);
    }

    fn set_system_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::SeqCst);
        self.inner.ready_history.lock().push(ready);
    }

    fn configure_input(&self, gpio: Gpio, pull_down: bool) -> bool {
        let index = gpio as usize;
        if index >= GPIO_COUNT || self.inner.reserved[index] {
            return false;
        }
        self.inner.configured.lock().push(PinConfig { gpio, pull_down });
        true
    }

    fn enable_irq(&self, gpio: Gpio, event_mask: u32, enabled: bool) {
        let mut masks = self.inner.irq_masks.lock();
        masks[gpio as usize] = if enabled { event_mask } else { 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_is_manual() {
        let board = SimBoard::new();
        assert_eq!(board.time_us(), 0);
        board.advance(1_500);
        assert_eq!(board.time_us(), 1_500);
        board.delay_us(500);
        assert_eq!(board.time_us(), 2_000);
    }

    #[test]
    fn sim_clones_share_state() {
        let board = SimBoard::new();
        let clone = board.clone();
        board.advance(250);
        assert_eq!(clone.time_us(), 250);
    }

    #[test]
    fn sim_records_ready_transitions() {
        let board = SimBoard::new();
        board.set_system_ready(true);
        board.set_system_ready(false);
        assert_eq!(board.ready_history(), vec![true, false]);
        assert!(!board.ready());
    }

    #[test]
    fn sim_refuses_reserved_pins() {
        let board = SimBoard::new();
        assert!(board.configure_input(4, true));
        assert!(!board.configure_input(25, false));
        assert_eq!(board.configured_pins().len(), 1);
    }

    #[test]
    fn host_clock_moves_forward() {
        let board = HostBoard::new();
        let t0 = board.time_us();
        board.delay_us(200);
        assert!(board.time_us() >= t0 + 200);
    }
}
