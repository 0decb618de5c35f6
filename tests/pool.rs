//! End-to-end pool scenarios.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use ostinato::{Config, Error, HookArg, Passport, PoolState, ThreadPool, Worker};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .without_time()
        .try_init();
}

/// Spins until `condition` holds, failing the test if it takes too long.
fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition did not hold in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Forty distinct jobs on four workers, all observed exactly once, with a
/// quiescent pool after `wait` and a clean two-step teardown.
#[test]
fn smoke() {
    init_tracing();

    let pool = ThreadPool::with_config(Config {
        name_prefix: "t".into(),
        num_threads: 4,
        ..Config::default()
    })
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..40 {
        let seen = Arc::clone(&seen);
        pool.add_work(move |_| {
            seen.lock().unwrap().push(i);
        })
        .unwrap();
    }

    pool.wait().unwrap();
    assert_eq!(pool.num_threads_working().unwrap(), 0);

    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..40).collect::<Vec<_>>());

    pool.shutdown().unwrap();
    pool.destroy().unwrap();
}

/// With one worker and a bound of two, the third, fourth, and fifth
/// submissions each have to wait for a running job to finish.
#[test]
fn bounded_queue_applies_backpressure() {
    init_tracing();

    let pool = ThreadPool::with_config(Config {
        name_prefix: "bp".into(),
        num_threads: 1,
        work_num_max: 2,
        ..Config::default()
    })
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    for _ in 0..5 {
        let completed = Arc::clone(&completed);
        pool.add_work(move |_| {
            thread::sleep(Duration::from_millis(50));
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    // Submission five only fits after job three left the queue, which means
    // jobs one and two are already done.
    assert!(completed.load(Ordering::SeqCst) >= 2);

    pool.wait().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 5);
    // Five 50 ms jobs on a single worker cannot beat sequential time.
    assert!(started.elapsed() >= Duration::from_millis(250));

    pool.shutdown().unwrap();
    pool.destroy().unwrap();
}

/// `wait` pauses submission until `reactivate`.
#[test]
fn quiesce_blocks_submission_until_reactivate() {
    init_tracing();

    let pool = Arc::new(ThreadPool::new("q", 2).unwrap());

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        pool.add_work(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    pool.wait().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 10);

    let submitted = Arc::new(AtomicBool::new(false));
    let submitter = {
        let pool = Arc::clone(&pool);
        let counter = Arc::clone(&counter);
        let submitted = Arc::clone(&submitted);
        thread::spawn(move || {
            let result = pool.add_work(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            submitted.store(true, Ordering::SeqCst);
            result
        })
    };

    // The pool is quiesced; the submission must park.
    thread::sleep(Duration::from_millis(100));
    assert!(!submitted.load(Ordering::SeqCst));
    assert_eq!(counter.load(Ordering::SeqCst), 10);

    pool.reactivate().unwrap();
    submitter.join().unwrap().unwrap();
    eventually(|| counter.load(Ordering::SeqCst) == 11);

    pool.shutdown().unwrap();
    pool.destroy().unwrap();
}

/// The hook-argument destructor runs exactly once, only at destroy, after
/// every worker has exited.
#[test]
fn hook_arg_destructor_fires_once_at_destroy() {
    init_tracing();

    let destructed = Arc::new(AtomicUsize::new(0));
    let hook_runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&destructed);
    let runs = Arc::clone(&hook_runs);
    let pool = ThreadPool::with_config(Config {
        name_prefix: "hk".into(),
        num_threads: 3,
        hook_arg: Some(HookArg::with_destructor(String::from("shared"), move |value| {
            assert_eq!(value, "shared");
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        start_hook: Some(Box::new(move |arg: Option<&HookArg>, _: &Worker| {
            assert_eq!(arg.unwrap().downcast_ref::<String>().unwrap(), "shared");
            runs.fetch_add(1, Ordering::SeqCst);
        })),
        ..Config::default()
    })
    .unwrap();

    pool.add_work(|_| {}).unwrap();
    pool.wait().unwrap();

    pool.shutdown().unwrap();
    // Workers are gone but their bookkeeping still holds references.
    assert_eq!(hook_runs.load(Ordering::SeqCst), 3);
    assert_eq!(destructed.load(Ordering::SeqCst), 0);

    pool.destroy().unwrap();
    assert_eq!(destructed.load(Ordering::SeqCst), 1);
}

/// A worker that unrefs early does not break the exactly-once contract.
#[test]
fn early_unref_still_destructs_once() {
    init_tracing();

    let destructed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&destructed);
    let pool = ThreadPool::with_config(Config {
        name_prefix: "ur".into(),
        num_threads: 2,
        hook_arg: Some(HookArg::with_destructor((), move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        start_hook: Some(Box::new(|_: Option<&HookArg>, worker: &Worker| {
            worker.unref_hook_arg();
            // A second release is a no-op.
            worker.unref_hook_arg();
        })),
        ..Config::default()
    })
    .unwrap();

    pool.shutdown().unwrap();
    pool.destroy().unwrap();
    assert_eq!(destructed.load(Ordering::SeqCst), 1);
}

/// Lifecycle operations called from a pool's own worker are rejected
/// instead of deadlocking.
#[test]
fn lifecycle_calls_from_workers_are_rejected() {
    init_tracing();

    let pool = Arc::new(ThreadPool::new("self", 1).unwrap());
    let (tx, rx) = mpsc::channel();

    let inner = Arc::clone(&pool);
    pool.add_work(move |_| {
        tx.send((inner.wait(), inner.shutdown(), inner.destroy())).unwrap();
    })
    .unwrap();

    let (wait, shutdown, destroy) = rx.recv().unwrap();
    assert!(matches!(wait, Err(Error::Inval)));
    assert!(matches!(shutdown, Err(Error::Inval)));
    assert!(matches!(destroy, Err(Error::Inval)));

    // The rejections left the pool alive and working.
    let (tx, rx) = mpsc::channel();
    pool.add_work(move |_| tx.send(()).unwrap()).unwrap();
    rx.recv().unwrap();

    pool.shutdown().unwrap();
    pool.destroy().unwrap();
}

/// After destroy, the passport-checked surface reports the misuse instead
/// of touching freed bookkeeping.
#[test]
fn passport_gates_use_after_destroy() {
    init_tracing();

    let passport = Arc::new(Passport::new());
    let pool = ThreadPool::with_config(Config {
        name_prefix: "uaf".into(),
        num_threads: 2,
        passport: Some(Arc::clone(&passport)),
        ..Config::default()
    })
    .unwrap();

    pool.add_work_with_passport(&passport, |_| {}).unwrap();
    pool.wait_with_passport(&passport).unwrap();

    pool.shutdown_with_passport(&passport).unwrap();
    pool.destroy_with_passport(&passport).unwrap();
    assert_eq!(passport.state(), PoolState::Destroyed);

    assert!(matches!(
        pool.add_work_with_passport(&passport, |_| panic!("must never run")),
        Err(Error::Inval)
    ));
    assert!(matches!(
        pool.num_threads_working_with_passport(&passport),
        Err(Error::Inval)
    ));
    assert!(matches!(pool.wait_with_passport(&passport), Err(Error::Inval)));
}

/// A passport serves one pool, ever.
#[test]
fn passport_rebind_is_rejected() {
    init_tracing();

    let passport = Arc::new(Passport::new());
    let pool = ThreadPool::with_config(Config {
        name_prefix: "one".into(),
        num_threads: 1,
        passport: Some(Arc::clone(&passport)),
        ..Config::default()
    })
    .unwrap();

    let second = ThreadPool::with_config(Config {
        name_prefix: "two".into(),
        num_threads: 1,
        passport: Some(Arc::clone(&passport)),
        ..Config::default()
    });
    assert!(matches!(second, Err(Error::Rebind)));

    // The first pool is unaffected.
    pool.add_work(|_| {}).unwrap();
    pool.wait().unwrap();
    pool.shutdown().unwrap();
    pool.destroy().unwrap();
}

/// A passport bound to a different pool is refused by the checked surface.
#[test]
fn mismatched_passport_is_rejected() {
    init_tracing();

    let passport = Arc::new(Passport::new());
    let bound = ThreadPool::with_config(Config {
        name_prefix: "mine".into(),
        num_threads: 1,
        passport: Some(Arc::clone(&passport)),
        ..Config::default()
    })
    .unwrap();
    let other = ThreadPool::new("other", 1).unwrap();

    assert!(matches!(
        other.add_work_with_passport(&passport, |_| {}),
        Err(Error::Inval)
    ));

    drop(other);
    bound.shutdown().unwrap();
    bound.destroy().unwrap();
}

/// Jobs from a single submitter run in submission order on one worker.
#[test]
fn single_worker_preserves_fifo() {
    init_tracing();

    let pool = ThreadPool::new("fifo", 1).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..32 {
        let order = Arc::clone(&order);
        pool.add_work(move |_| {
            order.lock().unwrap().push(i);
        })
        .unwrap();
    }

    pool.wait().unwrap();
    assert_eq!(*order.lock().unwrap(), (0..32).collect::<Vec<_>>());
}

/// A submitter parked on a quiesced pool is canceled by shutdown.
#[test]
fn shutdown_cancels_parked_submitters() {
    init_tracing();

    let pool = Arc::new(ThreadPool::new("cxl", 1).unwrap());
    pool.wait().unwrap();

    let submitter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.add_work(|_| panic!("must never run")))
    };
    thread::sleep(Duration::from_millis(50));

    pool.shutdown().unwrap();
    assert!(matches!(submitter.join().unwrap(), Err(Error::Canceled)));
    pool.destroy().unwrap();
}

/// A waiter parked on a busy pool is canceled by shutdown.
#[test]
fn shutdown_cancels_parked_waiters() {
    init_tracing();

    let pool = Arc::new(ThreadPool::new("cxw", 1).unwrap());

    let (tx, rx) = mpsc::channel();
    pool.add_work(move |_| {
        tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(300));
    })
    .unwrap();
    // The job is running; a wait now has something to wait for.
    rx.recv().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.wait())
    };
    thread::sleep(Duration::from_millis(50));

    pool.shutdown().unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Canceled)));
    pool.destroy().unwrap();
}

/// Reactivating an active pool changes nothing.
#[test]
fn reactivate_is_a_noop_when_active() {
    init_tracing();

    let pool = ThreadPool::new("noop", 2).unwrap();
    pool.reactivate().unwrap();

    let (tx, rx) = mpsc::channel();
    pool.add_work(move |_| tx.send(()).unwrap()).unwrap();
    rx.recv().unwrap();

    pool.shutdown().unwrap();
    pool.destroy().unwrap();
}

/// Destroying an alive pool warns and shuts it down implicitly.
#[test]
fn destroy_from_alive_auto_shutdowns() {
    init_tracing();

    let passport = Arc::new(Passport::new());
    let pool = ThreadPool::with_config(Config {
        name_prefix: "auto".into(),
        num_threads: 2,
        passport: Some(Arc::clone(&passport)),
        ..Config::default()
    })
    .unwrap();

    pool.add_work(|_| {}).unwrap();
    pool.destroy().unwrap();
    assert_eq!(passport.state(), PoolState::Destroyed);

    // Everything after destroy is rejected.
    assert!(matches!(pool.shutdown(), Err(Error::Inval)));
    assert!(matches!(pool.destroy(), Err(Error::Inval)));
}

/// Repeated shutdown is an error, and gated calls after shutdown are
/// rejected before destroy even happens.
#[test]
fn shutdown_is_once_only() {
    init_tracing();

    let pool = ThreadPool::new("once", 1).unwrap();
    pool.shutdown().unwrap();

    assert!(matches!(pool.shutdown(), Err(Error::Inval)));
    assert!(matches!(pool.add_work(|_| {}), Err(Error::Inval)));
    assert!(matches!(pool.num_threads_working(), Err(Error::Inval)));

    pool.destroy().unwrap();
}

/// End hooks see the context a start hook stashed, and can consume it.
#[test]
fn context_flows_from_start_hook_to_end_hook() {
    init_tracing();

    let ends = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&ends);
    let pool = ThreadPool::with_config(Config {
        name_prefix: "ctx".into(),
        num_threads: 2,
        start_hook: Some(Box::new(|_: Option<&HookArg>, worker: &Worker| {
            worker.set_context(format!("state of {}", worker.name()));
        })),
        end_hook: Some(Box::new(move |worker: &Worker| {
            let state = worker.take_context::<String>().unwrap();
            assert_eq!(*state, format!("state of {}", worker.name()));
            observed.fetch_add(1, Ordering::SeqCst);
        })),
        ..Config::default()
    })
    .unwrap();

    // Jobs on the same worker see the same context value.
    let (tx, rx) = mpsc::channel();
    pool.add_work(move |worker| {
        let copy = worker.with_context(|ctx: Option<&mut String>| ctx.unwrap().clone());
        tx.send((copy, worker.name().to_string())).unwrap();
    })
    .unwrap();
    let (copy, name) = rx.recv().unwrap();
    assert_eq!(copy, format!("state of {name}"));

    pool.shutdown().unwrap();
    assert_eq!(ends.load(Ordering::SeqCst), 2);
    pool.destroy().unwrap();
}
