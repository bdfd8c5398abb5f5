//! Property tests for the scheduler's planning math, driven through the
//! real pass machinery (`Scheduler::run_pass` / `Scheduler::next_ceiling`),
//! not a re-implementation.
//!
//! Invariants under test:
//! - priority cycling: over N complete cycles a high-priority task is
//!   considered exactly 3N times, normal 2N, low N
//! - start-up staggering: one bucket's first deadlines are spread evenly
//!   over the bucket's period, buckets shifted by half an offset
//! - wake-up monotonicity: after a pass runs a task, its deadline is
//!   strictly in the future

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use duet::sched::Scheduler;
use duet::{
    state, Board, Config, Runtime, SimBoard, TimeUs, CORE0, PRIORITY_HIGH, PRIORITY_LOW,
    PRIORITY_NORMAL,
};
use proptest::prelude::*;

// ============================================================================
// Fixtures
// ============================================================================

fn sim_config() -> Config {
    Config {
        disable_second_core: true,
        disable_watchdog: true,
        ..Default::default()
    }
}

/// Register `count` run-counting tasks into one shared bucket counter.
fn register_bucket(
    builder: &mut duet::RuntimeBuilder,
    prefix: &str,
    count: usize,
    priority: u32,
    counter: &Arc<AtomicUsize>,
) {
    for i in 0..count {
        let counter = Arc::clone(counter);
        builder
            .register(&format!("{prefix}{i}"), priority, move |ctx| {
                if ctx.state == state::RUN {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();
    }
}

// ============================================================================
// Priority Cycling
// ============================================================================

proptest! {
    /// CORE INVARIANT: over any window of N complete priority cycles a
    /// high-priority task is considered exactly 3N times, a normal one 2N,
    /// a low one N. The clock advances by a full low period between
    /// passes, so every considered task is also due and runs — making the
    /// consideration counts observable as run counts.
    #[test]
    fn cycling_considers_3n_2n_1n(
        cycles in 1usize..6,
        n_high in 1usize..4,
        n_normal in 1usize..4,
        n_low in 1usize..4,
    ) {
        let board = SimBoard::new();
        let high_runs = Arc::new(AtomicUsize::new(0));
        let normal_runs = Arc::new(AtomicUsize::new(0));
        let low_runs = Arc::new(AtomicUsize::new(0));

        let mut builder = Runtime::builder(sim_config()).with_board(Box::new(board.clone()));
        register_bucket(&mut builder, "hi", n_high, PRIORITY_HIGH, &high_runs);
        register_bucket(&mut builder, "mid", n_normal, PRIORITY_NORMAL, &normal_runs);
        register_bucket(&mut builder, "lo", n_low, PRIORITY_LOW, &low_runs);
        let rt = builder.build();
        rt.initialize().unwrap();

        let sys = rt.system();
        let mut sched = Scheduler::new(Arc::clone(sys), CORE0);
        let mut ceiling = sys.config().priority_high;
        for _pass in 0..3 * cycles {
            // One full low period per pass: every task's advanced deadline
            // lands at or before the next pass.
            board.advance(TimeUs::from(sys.config().priority_low));
            sched.run_pass(ceiling);
            ceiling = sched.next_ceiling(ceiling);
        }

        prop_assert_eq!(high_runs.load(Ordering::SeqCst), 3 * cycles * n_high);
        prop_assert_eq!(normal_runs.load(Ordering::SeqCst), 2 * cycles * n_normal);
        prop_assert_eq!(low_runs.load(Ordering::SeqCst), cycles * n_low);
    }

    /// With priorities disabled every pass is a plain round-robin: all
    /// buckets are considered once per pass.
    #[test]
    fn disabled_priorities_level_the_buckets(
        passes in 1usize..9,
        n_high in 1usize..4,
        n_low in 1usize..4,
    ) {
        let board = SimBoard::new();
        let high_runs = Arc::new(AtomicUsize::new(0));
        let low_runs = Arc::new(AtomicUsize::new(0));

        let cfg = Config {
            disable_priorities: true,
            ..sim_config()
        };
        let mut builder = Runtime::builder(cfg).with_board(Box::new(board.clone()));
        register_bucket(&mut builder, "hi", n_high, PRIORITY_HIGH, &high_runs);
        register_bucket(&mut builder, "lo", n_low, PRIORITY_LOW, &low_runs);
        let rt = builder.build();
        rt.initialize().unwrap();

        let sys = rt.system();
        let mut sched = Scheduler::new(Arc::clone(sys), CORE0);
        let mut ceiling = sys.config().priority_high;
        for _pass in 0..passes {
            board.advance(TimeUs::from(sys.config().priority_low));
            sched.run_pass(ceiling);
            ceiling = sched.next_ceiling(ceiling);
        }

        prop_assert_eq!(high_runs.load(Ordering::SeqCst), passes * n_high);
        prop_assert_eq!(low_runs.load(Ordering::SeqCst), passes * n_low);
    }
}

// ============================================================================
// Start-up Staggering
// ============================================================================

proptest! {
    /// First deadlines of a priority bucket form an arithmetic sequence
    /// with step bucket-period / bucket-size, and the normal bucket is
    /// shifted against the high one by half a high offset.
    #[test]
    fn stagger_spreads_buckets_evenly(
        start in 0u64..1_000_000,
        n_high in 1usize..4,
        n_normal in 1usize..4,
    ) {
        let board = SimBoard::new();
        board.set_time(start);

        let mut builder = Runtime::builder(sim_config()).with_board(Box::new(board.clone()));
        let mut high_ids = Vec::new();
        for i in 0..n_high {
            high_ids.push(
                builder
                    .register(&format!("hi{i}"), PRIORITY_HIGH, |_| Ok(()))
                    .unwrap(),
            );
        }
        let mut normal_ids = Vec::new();
        for i in 0..n_normal {
            normal_ids.push(
                builder
                    .register(&format!("mid{i}"), PRIORITY_NORMAL, |_| Ok(()))
                    .unwrap(),
            );
        }
        let rt = builder.build();
        rt.initialize().unwrap();
        let sys = rt.system();

        // The timer service is the high bucket's first member; the user
        // tasks follow it in id order.
        let timer = sys.sys_ids().timer.unwrap();
        let bucket_high = n_high + 1;
        let high_offset = TimeUs::from(PRIORITY_HIGH / bucket_high as u32);
        let normal_offset = TimeUs::from(PRIORITY_NORMAL / n_normal as u32);

        prop_assert_eq!(sys.task_ref(timer).unwrap().wake_at(), start);
        for (j, id) in high_ids.iter().enumerate() {
            prop_assert_eq!(
                sys.task_ref(*id).unwrap().wake_at(),
                start + (j as u64 + 1) * high_offset
            );
        }
        for (j, id) in normal_ids.iter().enumerate() {
            prop_assert_eq!(
                sys.task_ref(*id).unwrap().wake_at(),
                start + high_offset / 2 + j as u64 * normal_offset
            );
        }
    }
}

// ============================================================================
// Wake-up Monotonicity
// ============================================================================

proptest! {
    /// After a pass runs a task, its wake-up deadline is strictly greater
    /// than the time of the run.
    #[test]
    fn deadlines_end_up_strictly_in_the_future(
        priorities in proptest::collection::vec(
            prop_oneof![
                Just(PRIORITY_HIGH),
                Just(PRIORITY_NORMAL),
                Just(PRIORITY_LOW),
            ],
            1..6,
        )
    ) {
        let board = SimBoard::new();
        let mut builder = Runtime::builder(sim_config()).with_board(Box::new(board.clone()));
        let mut ids = Vec::new();
        for (i, priority) in priorities.iter().enumerate() {
            ids.push(
                builder
                    .register(&format!("t{i}"), *priority, |_| Ok(()))
                    .unwrap(),
            );
        }
        let rt = builder.build();
        rt.initialize().unwrap();
        let sys = rt.system();

        // Far enough past every staggered first deadline.
        board.advance(2 * TimeUs::from(sys.config().priority_low));
        let mut sched = Scheduler::new(Arc::clone(sys), CORE0);
        // A low-ceiling pass admits every priority.
        sched.run_pass(sys.config().priority_low);

        let now = board.time_us();
        for id in ids {
            prop_assert!(sys.task_ref(id).unwrap().wake_at() > now);
        }
    }
}
