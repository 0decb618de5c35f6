//! A fixed-size worker-thread pool with an explicit lifecycle.
//!
//! Ostinato manages a set of long-lived worker threads that consume jobs from
//! a shared, optionally bounded queue. It is aimed at programs that want
//! direct control over the pool's life: the pool is created with a fixed
//! number of workers, can be quiesced and resumed ([`ThreadPool::wait`] /
//! [`ThreadPool::reactivate`]), and is torn down in two explicit steps
//! ([`ThreadPool::shutdown`] stops the workers, [`ThreadPool::destroy`] frees
//! their bookkeeping).
//!
//! Each worker carries a small amount of per-thread state: a numeric id, a
//! display name used for OS-level thread naming, and an opaque context slot
//! that hooks and jobs running on that worker may use to share data (a cached
//! database connection is the classic tenant). Optional start/end hooks run
//! once per worker, and a shared hook argument can be handed to every worker
//! with a destructor that runs exactly once after the last holder releases it.
//!
//! The pool's lifecycle is tracked on a separate [`Passport`]: a small block
//! holding the lifecycle state and a count of in-flight API calls. By default
//! the pool allocates its own passport, but callers debugging lifecycle
//! misuse in larger systems can create one themselves, keep it alive longer
//! than the pool, and use the `*_with_passport` surface: calls made after
//! the pool was destroyed are then reported as errors instead of silently
//! racing the teardown.
//!
//! ```no_run
//! use ostinato::{Config, ThreadPool};
//!
//! let pool = ThreadPool::with_config(Config {
//!     name_prefix: "crunch".into(),
//!     num_threads: 4,
//!     work_num_max: 64,
//!     ..Config::default()
//! })
//! .unwrap();
//!
//! for n in 0..40 {
//!     pool.add_work(move |worker| {
//!         println!("{} crunching {n}", worker.name());
//!     })
//!     .unwrap();
//! }
//!
//! // Block until the queue is empty and every worker is idle. The pool is
//! // quiesced afterwards; `reactivate` would resume it.
//! pool.wait().unwrap();
//!
//! pool.shutdown().unwrap();
//! pool.destroy().unwrap();
//! ```

// -----------------------------------------------------------------------------
// Modules

mod error;
mod hook;
mod job;
mod passport;
mod thread_pool;
mod unwind;
mod worker;

// -----------------------------------------------------------------------------
// Top-level exports

pub use error::Error;
pub use error::Result;
pub use hook::EndHook;
pub use hook::HookArg;
pub use hook::StartHook;
pub use passport::Passport;
pub use passport::PoolState;
pub use thread_pool::Config;
pub use thread_pool::ThreadPool;
pub use worker::Worker;

// -----------------------------------------------------------------------------
// Platform Support

// This crate uses `loom` for testing, which requires mocking all of the core
// threading primitives (`Mutex` and the like). Unfortunately there are some
// minor differences between `loom` and `std`.
//
// To make things a bit simpler, we re-export all the important types in the
// `platform` module. Where necessary we wrap the `std` implementation to make
// it match up with `loom`.

#[cfg(not(loom))]
mod platform {

    // Core exports

    pub use std::cell::Cell;
    pub use std::sync::atomic::AtomicBool;
    pub use std::sync::atomic::AtomicU32;
    pub use std::sync::atomic::AtomicU8;
    pub use std::sync::atomic::AtomicUsize;
    pub use std::sync::atomic::Ordering;
    pub use std::sync::Arc;
    pub use std::sync::Condvar;
    pub use std::sync::Mutex;
    pub use std::thread::Builder as ThreadBuilder;
    pub use std::thread::JoinHandle;
    pub use std::thread_local;

    /// Briefly pauses the calling thread. Used by the cold polling loops in
    /// pool creation and shutdown, which wait on counters that are already
    /// atomic and change only a handful of times per pool lifetime.
    pub fn poll_pause() {
        std::thread::sleep(core::time::Duration::from_millis(1));
    }
}

#[cfg(loom)]
mod platform {

    // Core exports

    pub use loom::cell::Cell;
    pub use loom::sync::atomic::AtomicBool;
    pub use loom::sync::atomic::AtomicU32;
    pub use loom::sync::atomic::AtomicU8;
    pub use loom::sync::atomic::AtomicUsize;
    pub use loom::sync::atomic::Ordering;
    pub use loom::sync::Arc;
    pub use loom::sync::Condvar;
    pub use loom::sync::Mutex;
    pub use loom::thread::Builder as ThreadBuilder;
    pub use loom::thread::JoinHandle;
    pub use loom::thread_local;

    /// Loom cannot model a timed sleep; yielding gives the model checker a
    /// scheduling point instead.
    pub fn poll_pause() {
        loom::thread::yield_now();
    }
}
