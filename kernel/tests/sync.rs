use kernel::{
    Kernel, KernelError, SystemConfigurationBuilder,
    pipe::Pipe,
    sync::{Condition, Lock, Mailbox, Semaphore},
    teletype::Teletype,
    thread::{self, ThreadBuilder},
};
use machine::spinlock::SpinLock;
use std::sync::Arc;

fn boot() -> Arc<Kernel> {
    Kernel::boot(SystemConfigurationBuilder::new().set_quiet(true).build())
}

fn record(log: &SpinLock<Vec<&'static str>>, event: &'static str) {
    let mut log = log.lock();
    log.push(event);
    log.unlock();
}

fn take(log: &SpinLock<Vec<&'static str>>) -> Vec<&'static str> {
    let mut log = log.lock();
    let events = std::mem::take(&mut *log);
    log.unlock();
    events
}

/// Tests that a V before any P is remembered.
///
/// This test ensures that:
/// - The value of the semaphore counts unmatched V operations.
/// - A P on a positive semaphore does not block.
#[test]
fn semaphore_counts_early_signals() {
    boot().run(|| {
        let sema = Semaphore::new("early", 0);
        sema.v();
        sema.v();
        assert_eq!(sema.value(), 2);
        sema.p();
        sema.p();
        assert_eq!(sema.value(), 0);
    });
}

/// Tests that P blocks until another thread calls V.
#[test]
fn semaphore_ping_pong() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        let ping = Arc::new(Semaphore::new("ping", 0));
        let pong = Arc::new(Semaphore::new("pong", 0));
        let (pi, po, lg) = (ping.clone(), pong.clone(), l.clone());
        ThreadBuilder::new("ponger")
            .spawn(move || {
                for _ in 0..3 {
                    pi.p();
                    record(&lg, "pong");
                    po.v();
                }
            })
            .unwrap();
        for _ in 0..3 {
            record(&l, "ping");
            ping.v();
            pong.p();
        }
    });
    assert_eq!(
        take(&log),
        ["ping", "pong", "ping", "pong", "ping", "pong"],
        "Semaphores must alternate the two threads."
    );
}

/// Tests mutual exclusion of the lock and the hand-off order of its waiters.
///
/// This test ensures that:
/// - A thread blocks while another one holds the lock.
/// - On release, the waiter with the highest priority gets the lock first.
#[test]
fn lock_hands_off_by_priority() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        let lock = Arc::new(Lock::new("contended"));
        lock.acquire();
        assert!(lock.is_held_by_current_thread());
        for (name, priority) in [("low", 1), ("high", 5)] {
            let (lk, lg) = (lock.clone(), l.clone());
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || {
                    lk.acquire();
                    record(&lg, name);
                    lk.release();
                })
                .unwrap();
        }
        // Both block on the lock.
        thread::yield_now();
        assert!(take(&l).is_empty(), "The lock must exclude waiters.");
        lock.release();
    });
    assert_eq!(take(&log), ["high", "low"]);
}

/// Tests that releasing a lock the caller does not hold panics.
#[test]
#[should_panic(expected = "does not hold it")]
fn lock_release_without_holding() {
    boot().run(|| {
        let lock = Arc::new(Lock::new("orphan"));
        let lk = lock.clone();
        let th = ThreadBuilder::new("holder")
            .joinable(true)
            .spawn(move || {
                lk.acquire();
            })
            .unwrap();
        th.join();
        lock.release();
    });
}

/// Tests that acquiring a lock twice panics instead of deadlocking.
#[test]
#[should_panic(expected = "acquired twice")]
fn lock_acquire_twice() {
    boot().run(|| {
        let lock = Lock::new("reentrant");
        lock.acquire();
        lock.acquire();
    });
}

/// Tests that destroying a held lock panics.
#[test]
#[should_panic(expected = "destroyed while held")]
fn lock_destroyed_while_held() {
    boot().run(|| {
        let lock = Lock::new("abandoned");
        lock.acquire();
        drop(lock);
    });
}

/// Tests that destroying a semaphore with a blocked waiter panics.
#[test]
#[should_panic(expected = "destroyed while 1 thread(s) wait")]
fn semaphore_destroyed_with_waiter() {
    boot().run(|| {
        let raw = Box::into_raw(Box::new(Semaphore::new("abandoned", 0)));
        // SAFETY: `raw` is never freed; the waiter stays blocked on it until
        // the kernel tears it down.
        let sema: &'static Semaphore = unsafe { &*raw };
        ThreadBuilder::new("waiter").spawn(move || sema.p()).unwrap();
        thread::yield_now();
        assert_eq!(sema.value(), 0);
        // SAFETY: the semaphore is dropped in place, its memory stays valid.
        unsafe { std::ptr::drop_in_place(raw) };
    });
}

/// Tests that a signal wakes exactly one waiter.
///
/// This test ensures that:
/// - Waiters release the lock while blocked.
/// - Each signal readies one waiter, in priority order.
#[test]
fn condition_signal_wakes_one() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        let lock = Arc::new(Lock::new("cv lock"));
        let cond = Arc::new(Condition::new("cv"));
        for (name, priority) in [("first", 1), ("second", 2)] {
            let (lk, cv, lg) = (lock.clone(), cond.clone(), l.clone());
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || {
                    lk.acquire();
                    cv.wait(&lk);
                    record(&lg, name);
                    lk.release();
                })
                .unwrap();
        }
        thread::yield_now();
        assert_eq!(cond.waiters(), 2);

        lock.acquire();
        cond.signal(&lock);
        lock.release();
        thread::yield_now();
        assert_eq!(take(&l), ["second"]);
        assert_eq!(cond.waiters(), 1);

        lock.acquire();
        cond.signal(&lock);
        lock.release();
        thread::yield_now();
        assert_eq!(take(&l), ["first"]);
    });
}

/// Tests that a broadcast wakes every waiter, and that a signal with no
/// waiter is lost.
#[test]
fn condition_broadcast_and_lost_signal() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        let lock = Arc::new(Lock::new("cv lock"));
        let cond = Arc::new(Condition::new("cv"));

        lock.acquire();
        cond.signal(&lock);
        lock.release();
        assert_eq!(cond.waiters(), 0);

        for name in ["a", "b", "c"] {
            let (lk, cv, lg) = (lock.clone(), cond.clone(), l.clone());
            ThreadBuilder::new(name)
                .spawn(move || {
                    lk.acquire();
                    cv.wait(&lk);
                    record(&lg, name);
                    lk.release();
                })
                .unwrap();
        }
        thread::yield_now();
        assert_eq!(cond.waiters(), 3, "The earlier signal must not be kept.");

        lock.acquire();
        cond.broadcast(&lock);
        lock.release();
        thread::yield_now();
        assert_eq!(cond.waiters(), 0);
    });
    assert_eq!(take(&log), ["a", "b", "c"]);
}

/// Tests that using a condition without its lock panics.
#[test]
#[should_panic(expected = "without holding lock")]
fn condition_requires_lock() {
    boot().run(|| {
        let lock = Lock::new("cv lock");
        let cond = Condition::new("cv");
        cond.signal(&lock);
    });
}

/// Tests that semaphore waiters are woken by priority, then by arrival.
#[test]
fn semaphore_wakes_by_priority() {
    let log = Arc::new(SpinLock::new(Vec::new()));
    let l = log.clone();
    boot().run(move || {
        let sema = Arc::new(Semaphore::new("gate", 0));
        for (name, priority) in [("a", 1), ("b", 3), ("c", 1), ("d", 2)] {
            let (s, lg) = (sema.clone(), l.clone());
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || {
                    s.p();
                    record(&lg, name);
                })
                .unwrap();
        }
        thread::yield_now();
        for _ in 0..4 {
            sema.v();
        }
    });
    assert_eq!(take(&log), ["b", "d", "a", "c"]);
}

/// Tests the rendezvous of the mailbox.
///
/// This test ensures that:
/// - Every message sent is received exactly once.
/// - A sender blocks until a receiver is waiting.
#[test]
fn mailbox_delivers_every_message() {
    boot().run(|| {
        let mailbox = Arc::new(Mailbox::new("box"));
        let senders = (0..4)
            .map(|i| {
                let mb = mailbox.clone();
                ThreadBuilder::new(format!("sender {i}"))
                    .joinable(true)
                    .spawn(move || mb.send(i))
                    .unwrap()
            })
            .collect::<Vec<_>>();
        thread::yield_now();

        let mut received = (0..4).map(|_| mailbox.receive()).collect::<Vec<_>>();
        received.sort();
        assert_eq!(received, [0, 1, 2, 3]);
        for th in senders {
            assert_eq!(th.join(), 0);
        }
    });
}

/// Tests the blocking behavior of a bounded pipe.
///
/// This test ensures that:
/// - A writer blocks while the pipe is full.
/// - A reader drains the pipe and then sees the end of the stream.
/// - Writing after the read end is closed fails.
#[test]
fn pipe_blocks_and_closes() {
    boot().run(|| {
        let pipe = Arc::new(Pipe::new(2));
        let p = pipe.clone();
        let writer = ThreadBuilder::new("writer")
            .joinable(true)
            .spawn(move || {
                let written = p.write(b"hello").unwrap();
                p.close_write();
                thread::finish(written as i32)
            })
            .unwrap();
        thread::yield_now();
        assert_eq!(pipe.len(), pipe.capacity(), "The writer must fill the pipe.");

        let mut buf = [0; 8];
        let n = pipe.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(pipe.read(&mut buf), Ok(0));
        assert_eq!(writer.join(), 5);

        let broken = Pipe::new(1);
        broken.close_read();
        assert_eq!(broken.write(b"x"), Err(KernelError::BrokenPipe));
    });
}
