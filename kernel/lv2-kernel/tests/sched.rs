//! Scheduler ordering properties.

use std::sync::Arc;
use std::time::Duration;

use lv2_core::{CpuFlags, Timestamp};
use lv2_kernel::clock::{GuestClock, ManualClock};
use lv2_kernel::config::{AccuracyClass, KernelConfig};
use lv2_kernel::sched::{Membership, PrioCommand, Scheduler};
use lv2_kernel::thread::{PpuThread, ThreadRegistry};
use proptest::prelude::*;

fn scheduler(slots: usize) -> (Arc<Scheduler>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let sched = Scheduler::new(
        KernelConfig {
            ppu_threads: slots,
            ..KernelConfig::default()
        },
        Arc::new(ThreadRegistry::new()),
        Arc::clone(&clock) as Arc<dyn GuestClock>,
    );
    (Arc::new(sched), clock)
}

fn ready_prios(sched: &Scheduler) -> Vec<i32> {
    sched.snapshot().ready.iter().map(|&(_, p)| p).collect()
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn ready_list_priority_never_decreases(
        ops in prop::collection::vec((0usize..10, 0i32..8, 0u8..4), 1..80),
    ) {
        let (sched, _) = scheduler(8);
        let threads: Vec<Arc<PpuThread>> =
            (0..10).map(|i| sched.threads().spawn(format!("t{i}"), 4)).collect();
        for (idx, prio, op) in ops {
            let t = &threads[idx];
            match op {
                0 => { sched.awake(t, PrioCommand::Enqueue); }
                1 => { sched.awake(t, PrioCommand::Set(prio)); }
                2 => { sched.yield_now(t); }
                _ => { sched.sleep(t, 0); }
            }
            let prios = ready_prios(&sched);
            prop_assert!(prios.windows(2).all(|w| w[0] <= w[1]), "{:?}", prios);
        }
    }

    #[test]
    fn timeouts_fire_in_deadline_order(
        timeouts in prop::collection::btree_set(1u64..100_000, 1..16),
        shuffle in any::<u64>(),
    ) {
        let (sched, clock) = scheduler(8);
        let mut timeouts: Vec<u64> = timeouts.into_iter().collect();
        let n = timeouts.len();
        timeouts.rotate_left(usize::try_from(shuffle % n as u64).unwrap());

        let threads: Vec<Arc<PpuThread>> = timeouts
            .iter()
            .map(|_| {
                let t = sched.threads().spawn("sleeper", 100);
                sched.awake(&t, PrioCommand::Enqueue);
                t
            })
            .collect();
        for (t, &timeout) in threads.iter().zip(&timeouts) {
            prop_assert!(sched.sleep(t, timeout));
        }

        let mut order: Vec<(u64, &Arc<PpuThread>)> =
            timeouts.iter().copied().zip(&threads).collect();
        order.sort_by_key(|&(timeout, _)| timeout);
        for (k, &(timeout, _)) in order.iter().enumerate() {
            clock.set(1_000 + timeout);
            sched.schedule_all(Timestamp::ZERO);
            for (j, &(_, t)) in order.iter().enumerate() {
                let fired = t.state().load().contains(CpuFlags::NOTIFY);
                prop_assert_eq!(fired, j <= k);
            }
        }
    }
}

#[test]
fn equal_priority_keeps_wake_order() {
    let (sched, _) = scheduler(8);
    let a = sched.threads().spawn("a", 50);
    let b = sched.threads().spawn("b", 50);
    let c = sched.threads().spawn("c", 10);
    assert!(sched.awake(&a, PrioCommand::Enqueue));
    assert!(sched.awake(&b, PrioCommand::Enqueue));
    assert!(sched.awake(&c, PrioCommand::Enqueue));
    assert_eq!(
        sched.snapshot().ready_slots(),
        [c.slot(), a.slot(), b.slot()]
    );
}

#[test]
fn yield_alone_is_noop_and_with_peers_goes_to_tail() {
    let (sched, _) = scheduler(8);
    let solo = sched.threads().spawn("solo", 5);
    let a = sched.threads().spawn("a", 9);
    let b = sched.threads().spawn("b", 9);
    let c = sched.threads().spawn("c", 9);
    for t in [&solo, &a, &b, &c] {
        sched.awake(t, PrioCommand::Enqueue);
    }
    let before = sched.snapshot();
    assert!(!sched.yield_now(&solo));
    assert_eq!(sched.snapshot(), before);

    assert!(sched.yield_now(&a));
    assert_eq!(
        sched.snapshot().ready_slots(),
        [solo.slot(), b.slot(), c.slot(), a.slot()]
    );
}

#[test]
fn reverse_wake_still_puts_best_priority_first() {
    let (sched, _) = scheduler(2);
    let p10 = sched.threads().spawn("p10", 10);
    let p5 = sched.threads().spawn("p5", 5);
    sched.awake(&p10, PrioCommand::Enqueue);
    sched.awake(&p5, PrioCommand::Enqueue);
    assert!(sched.sleep(&p10, 0));
    assert!(sched.sleep(&p5, 0));
    assert_eq!(sched.membership(p10.slot()), Membership::Blocked);

    assert!(sched.awake(&p10, PrioCommand::Enqueue));
    assert!(sched.awake(&p5, PrioCommand::Enqueue));
    let snap = sched.snapshot();
    assert_eq!(snap.ready.first(), Some(&(p5.slot(), 5)));
    assert_eq!(ready_prios(&sched), [5, 10]);
}

// ---------------------------------------------------------------------------
// Wake delivery
// ---------------------------------------------------------------------------

#[test]
fn explicit_wake_before_deadline_is_delivered_once() {
    let (sched, clock) = scheduler(2);
    let t = sched.threads().spawn("sleeper", 100);
    sched.awake(&t, PrioCommand::Enqueue);
    sched.check_state(&t).unwrap();
    assert!(sched.sleep(&t, 50_000));

    let worker = {
        let sched = Arc::clone(&sched);
        let t = Arc::clone(&t);
        std::thread::spawn(move || {
            let timed_out = sched.wait_timeout(50_000, Some(&t), true, AccuracyClass::Timer);
            (timed_out, sched.check_state(&t))
        })
    };
    std::thread::sleep(Duration::from_millis(5));
    assert!(sched.awake(&t, PrioCommand::Enqueue));
    let (timed_out, state) = worker.join().unwrap();
    assert!(!timed_out);
    assert_eq!(state, Ok(()));

    clock.advance(1_000_000);
    sched.schedule_all(Timestamp::ZERO);
    assert!(!t.state().load().contains(CpuFlags::NOTIFY));
    assert_eq!(sched.stats().timeouts, 0);
    assert_eq!(sched.stats().awakes, 2);
}

#[test]
fn displaced_worker_resumes_after_handshake() {
    let (sched, _) = scheduler(1);
    let low = sched.threads().spawn("low", 100);
    sched.awake(&low, PrioCommand::Enqueue);
    sched.check_state(&low).unwrap();

    let high = sched.threads().spawn("high", 1);
    sched.awake(&high, PrioCommand::Enqueue);
    assert_eq!(sched.membership(low.slot()), Membership::Pending);
    assert!(high.state().load().contains(CpuFlags::SUSPEND));

    // The displaced worker reaches its suspension point and parks there.
    let worker = {
        let sched = Arc::clone(&sched);
        let low = Arc::clone(&low);
        std::thread::spawn(move || sched.check_state(&low))
    };
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while high.state().load().contains(CpuFlags::SUSPEND) {
        assert!(std::time::Instant::now() < deadline, "high never admitted");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(sched.membership(low.slot()), Membership::Ready);

    // Once the better context blocks, the parked one runs again.
    sched.check_state(&high).unwrap();
    assert!(sched.sleep(&high, 0));
    assert_eq!(worker.join().unwrap(), Ok(()));
}

#[test]
fn stop_releases_parked_context() {
    let (sched, _) = scheduler(1);
    let a = sched.threads().spawn("a", 1);
    let b = sched.threads().spawn("b", 2);
    sched.awake(&a, PrioCommand::Enqueue);
    sched.awake(&b, PrioCommand::Enqueue);
    let worker = {
        let sched = Arc::clone(&sched);
        let b = Arc::clone(&b);
        std::thread::spawn(move || sched.check_state(&b))
    };
    std::thread::sleep(Duration::from_millis(5));
    sched.stop(&b);
    assert_eq!(worker.join().unwrap(), Err(lv2_core::CellError::Canceled));
}
