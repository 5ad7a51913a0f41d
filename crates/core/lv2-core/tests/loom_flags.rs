//! Loom model of the flag handshake between the scheduler and a worker.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test -p lv2-core --test loom_flags`.

#![cfg(loom)]

use loom::sync::Arc;
use lv2_core::{AtomicCpuFlags, CpuFlags};

#[test]
fn resume_and_cancel_race_keeps_both_bits() {
    loom::model(|| {
        let flags = Arc::new(AtomicCpuFlags::new(CpuFlags::SUSPEND));

        let sched = {
            let flags = Arc::clone(&flags);
            loom::thread::spawn(move || {
                flags.fetch_op(|f| {
                    if !f.contains(CpuFlags::SUSPEND) {
                        return false;
                    }
                    f.remove(CpuFlags::SUSPEND);
                    f.insert(CpuFlags::SIGNAL);
                    true
                })
            })
        };
        let canceller = {
            let flags = Arc::clone(&flags);
            loom::thread::spawn(move || flags.insert(CpuFlags::STOP))
        };

        let (_, resumed) = sched.join().unwrap();
        canceller.join().unwrap();

        assert!(resumed);
        let end = flags.load();
        assert!(end.contains(CpuFlags::SIGNAL | CpuFlags::STOP));
        assert!(!end.contains(CpuFlags::SUSPEND));
    });
}

#[test]
fn test_and_reset_consumes_signal_once() {
    loom::model(|| {
        let flags = Arc::new(AtomicCpuFlags::new(CpuFlags::SIGNAL));
        let other = {
            let flags = Arc::clone(&flags);
            loom::thread::spawn(move || flags.test_and_reset(CpuFlags::SIGNAL))
        };
        let mine = flags.test_and_reset(CpuFlags::SIGNAL);
        let theirs = other.join().unwrap();
        assert!(mine ^ theirs);
    });
}
