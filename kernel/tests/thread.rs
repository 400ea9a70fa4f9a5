use kernel::{
    Kernel, SchedulingPolicy, SystemConfigurationBuilder,
    sync::Semaphore,
    thread::{self, ThreadBuilder, ThreadStatus},
};
use machine::spinlock::SpinLock;
use std::sync::Arc;

fn boot() -> Arc<Kernel> {
    Kernel::boot(SystemConfigurationBuilder::new().set_quiet(true).build())
}

fn record(log: &SpinLock<Vec<String>>, event: impl Into<String>) {
    let mut log = log.lock();
    log.push(event.into());
    log.unlock();
}

fn take(log: &SpinLock<Vec<String>>) -> Vec<String> {
    let mut log = log.lock();
    let events = std::mem::take(&mut *log);
    log.unlock();
    events
}

/// Tests that join returns the value the child finished with.
///
/// This test ensures that:
/// - Joining a thread that already finished returns at once.
/// - Joining a thread that has not run yet waits for it.
#[test]
fn join_returns_exit_value() {
    boot().run(|| {
        let early = ThreadBuilder::new("early")
            .joinable(true)
            .spawn(|| thread::finish(7))
            .unwrap();
        thread::yield_now();
        assert_eq!(early.status(), ThreadStatus::Blocked);
        assert_eq!(early.join(), 7);

        let late = ThreadBuilder::new("late")
            .joinable(true)
            .spawn(|| {
                thread::yield_now();
                thread::finish(-3)
            })
            .unwrap();
        assert_eq!(late.join(), -3);
        assert_eq!(late.exit_value(), -3);
    });
}

/// Tests that a thread returning from its body finishes with 0.
#[test]
fn join_after_return() {
    boot().run(|| {
        let th = ThreadBuilder::new("child")
            .joinable(true)
            .spawn(|| {})
            .unwrap();
        assert_eq!(th.join(), 0);
    });
}

#[test]
#[should_panic(expected = "joined twice")]
fn join_twice() {
    boot().run(|| {
        let th = ThreadBuilder::new("child")
            .joinable(true)
            .spawn(|| {})
            .unwrap();
        th.join();
        th.join();
    });
}

#[test]
#[should_panic(expected = "cannot join itself")]
fn join_self() {
    boot().run(|| {
        let th = ThreadBuilder::new("narcissus").joinable(true).build();
        let me = th.clone();
        th.fork(move || {
            me.join();
        })
        .unwrap();
        thread::yield_now();
    });
}

#[test]
#[should_panic(expected = "is not joinable")]
fn join_detached() {
    boot().run(|| {
        let th = ThreadBuilder::new("detached").spawn(|| {}).unwrap();
        th.join();
    });
}

#[test]
#[should_panic(expected = "before it was forked")]
fn join_before_fork() {
    boot().run(|| {
        let th = ThreadBuilder::new("unborn").joinable(true).build();
        th.join();
    });
}

/// Tests that yielding threads of equal priority alternate.
#[test]
fn yield_alternates() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        let handles = ["a", "b"]
            .into_iter()
            .map(|name| {
                let lg = l.clone();
                ThreadBuilder::new(name)
                    .joinable(true)
                    .spawn(move || {
                        for i in 0..3 {
                            record(&lg, format!("{name}{i}"));
                            thread::yield_now();
                        }
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for th in handles {
            assert_eq!(th.join(), 0);
        }
    });
    assert_eq!(take(&log), ["a0", "b0", "a1", "b1", "a2", "b2"]);
}

/// Tests that the ready thread with the highest priority runs first.
#[test]
fn higher_priority_runs_first() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        for (name, priority) in [("low", 1), ("mid", 2), ("high", 3)] {
            let lg = l.clone();
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || record(&lg, name))
                .unwrap();
        }
        // Forking does not give the CPU away.
        assert!(take(&l).is_empty());
        thread::yield_now();
        record(&l, "main");
    });
    assert_eq!(take(&log), ["high", "mid", "low", "main"]);
}

/// Tests that the first-come-first-served scheduler ignores priorities.
#[test]
fn fifo_ignores_priority() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    let kernel = Kernel::boot(
        SystemConfigurationBuilder::new()
            .set_quiet(true)
            .set_scheduler(SchedulingPolicy::Fifo)
            .build(),
    );
    kernel.run(move || {
        for (name, priority) in [("low", 1), ("mid", 2), ("high", 3)] {
            let lg = l.clone();
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || record(&lg, name))
                .unwrap();
        }
    });
    assert_eq!(take(&log), ["low", "mid", "high"]);
}

/// Tests that a finished thread is reclaimed once another thread runs.
///
/// This test ensures that:
/// - A detached thread goes from finishing to destroyed.
/// - Its control block leaves the kernel.
#[test]
fn finished_thread_is_reclaimed() {
    let kernel = boot();
    let k = kernel.clone();
    kernel.run(move || {
        let before = k.live_threads();
        let th = ThreadBuilder::new("short").spawn(|| {}).unwrap();
        assert_eq!(th.status(), ThreadStatus::Ready);
        assert_eq!(k.live_threads(), before + 1);
        thread::yield_now();
        assert_eq!(th.status(), ThreadStatus::Destroyed);
        assert_eq!(k.live_threads(), before);
    });
}

/// Tests that a thread sleeping with nothing left to wake it is reported.
#[test]
#[should_panic(expected = "Deadlock")]
fn deadlock_is_detected() {
    boot().run(|| {
        let sema = Semaphore::new("never", 0);
        sema.p();
    });
}

/// Tests that a halt stops every thread and returns from the run.
#[test]
fn halt_stops_the_kernel() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    let kernel = boot();
    kernel.run(move || {
        let lg = l.clone();
        ThreadBuilder::new("halter")
            .spawn(move || {
                record(&lg, "halt");
                thread::kernel().halt()
            })
            .unwrap();
        thread::yield_now();
        record(&l, "unreachable");
    });
    assert_eq!(take(&log), ["halt"]);
    assert!(!kernel.is_running());
}

/// Tests that a yielding thread is queued by its current priority.
///
/// This test ensures that:
/// - A yield gives the CPU away even to a thread of lower priority.
/// - The yielding thread goes back ahead of the threads it outranks.
#[test]
fn yield_requeues_by_priority() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        for (name, priority) in [("one", 1), ("three", 3)] {
            let lg = l.clone();
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || record(&lg, name))
                .unwrap();
        }
        thread::current().set_priority(5);
        assert_eq!(thread::current().priority(), 5);
        thread::yield_now();
        record(&l, "main");
    });
    assert_eq!(take(&log), ["three", "main", "one"]);
}
