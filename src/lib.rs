//! # duet — cooperative dual-core micro-runtime
//!
//! User work is expressed as short-running tasks that two per-core
//! schedulers invoke in turn. Tasks never preempt each other and never
//! block; they communicate exclusively through bounded message queues.
//! On top of that the runtime provides priority-weighted round cycling, a
//! hardware-interrupt demultiplexer, software timers, a watchdog and a
//! thread-safe event log.
//!
//! ## Architecture
//!
//! ```text
//! core 0 scheduler  ──┐                      ┌── core 1 scheduler
//!   (walks up)       │    shared System     │      (walks down)
//!                    ├── task table ────────┤
//!                    ├── outbound queue 0/1 ┤
//!                    ├── capture queue ─────┤
//!                    └── payload store ─────┘
//!         courier · supervisor · irq demux · timer · watchdog · event log
//! ```
//!
//! A task runs to completion, reading its mailbox and queueing outgoing
//! messages into its core's outbound queue. After the run the scheduler
//! lets the courier route those records into the recipients' mailboxes and
//! the supervisor apply the resulting wake-ups. Captured interrupts are
//! drained through the demux before the next task is dispatched.
//!
//! ## Quick start
//!
//! ```no_run
//! use duet::{Config, Runtime, state, msg, PRIORITY_NORMAL};
//!
//! let mut builder = Runtime::builder(Config::default());
//! builder
//!     .register("blinker", PRIORITY_NORMAL, |ctx| {
//!         match ctx.state {
//!             state::INIT => {
//!                 ctx.set_timer(1, true, 500)?;
//!             }
//!             state::RUN => {
//!                 while let Some(message) = ctx.recv() {
//!                     match message.kind {
//!                         msg::PING => ctx.answer_ping(&message),
//!                         1 => { /* timer fired, toggle something */ }
//!                         _ => {}
//!                     }
//!                 }
//!             }
//!             _ => {}
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! builder.build().run().unwrap();
//! ```

pub mod board;
pub mod courier;
pub mod eventlog;
pub mod irq;
pub mod parcel;
pub mod ring;
pub mod sched;
pub mod supervisor;
pub mod system;
pub mod task;
pub mod timer;
pub mod types;
pub mod watchdog;

pub use board::{Board, HostBoard, SimBoard};
pub use eventlog::{LogRecord, LogSink, MemorySink, TracingSink};
pub use irq::{event, pack_subscription, unpack_subscription, IRQ_QUEUE_CAPACITY};
pub use parcel::{ParcelStore, Payload};
pub use ring::Ring;
pub use system::{Runtime, RuntimeBuilder, SysTaskIds, System};
pub use task::{Task, TaskContext, TaskFn};
pub use timer::TimerEntry;
pub use types::{
    debug, msg, state, Config, CoreId, DebugLevel, Error, Gpio, HostId, Message,
    Priority, Result, TaskId, TimeUs, ALL_HOSTS, CORE0, CORE1, MAX_CORES, MAX_TASKS,
    PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL, TASK_UNSPECIFIED,
};

/// Commonly used items.
pub mod prelude {
    pub use crate::board::{Board, SimBoard};
    pub use crate::system::Runtime;
    pub use crate::task::TaskContext;
    pub use crate::types::{
        msg, state, Config, Error, Message, Result, TaskId,
        PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL,
    };
}
