//! This module contains the pool itself: configuration, the lifecycle api,
//! the job queue protocol, and the worker loop.

use std::fmt;

use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::hook::EndHook;
use crate::hook::HookArg;
use crate::hook::StartHook;
use crate::job::Job;
use crate::job::JobQueue;
use crate::passport::Passport;
use crate::passport::PoolState;
use crate::platform::*;
use crate::unwind;
use crate::worker::clamp_name_prefix;
use crate::worker::Worker;

// -----------------------------------------------------------------------------
// Configuration

/// Configuration for a new pool, consumed by [`ThreadPool::with_config`].
///
/// Only [`num_threads`] has no useful default; everything else may be left
/// to [`Config::default`]:
///
/// ```no_run
/// use ostinato::{Config, ThreadPool};
///
/// let pool = ThreadPool::with_config(Config {
///     name_prefix: "io".into(),
///     num_threads: 2,
///     ..Config::default()
/// })
/// .unwrap();
/// ```
///
/// [`num_threads`]: Config::num_threads
pub struct Config {
    /// Prefix for worker thread names, which take the form "prefix-hexid".
    /// At most 6 characters are used, leaving room for the id within the
    /// 15 characters OS-level thread naming can carry.
    pub name_prefix: String,
    /// Number of worker threads to create. Must be positive; the default of
    /// zero makes [`ThreadPool::with_config`] fail.
    pub num_threads: usize,
    /// Maximum number of queued jobs. Submitters block while the queue is
    /// full. Zero means unbounded.
    pub work_num_max: usize,
    /// Hook run once by each worker before it starts pulling jobs.
    pub start_hook: Option<StartHook>,
    /// Hook run once by each worker just before it exits.
    pub end_hook: Option<EndHook>,
    /// Shared argument passed to every worker's start hook. See [`HookArg`]
    /// for the destructor and reference-counting contract.
    pub hook_arg: Option<HookArg>,
    /// Externally owned lifecycle passport. When set, the pool binds it and
    /// the `*_with_passport` surface becomes usable; the caller keeps the
    /// passport alive longer than the pool. When `None` the pool allocates
    /// its own, private passport.
    pub passport: Option<Arc<Passport>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name_prefix: String::from("pool"),
            num_threads: 0,
            work_num_max: 0,
            start_hook: None,
            end_hook: None,
            hook_arg: None,
            passport: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Pool internals

/// State shared between the pool handle and its worker threads.
struct PoolCore {
    /// Process-unique pool id; also what the owner-thread TSD stores.
    id: usize,
    name_prefix: String,
    num_threads_alive: AtomicU32,
    num_threads_working: AtomicU32,
    /// The job queue. Every queue access happens under this mutex; the
    /// queue type itself does no synchronization.
    queue: Mutex<JobQueue>,
    /// Signaled (broadcast) when the queue gains a job or the pool's gating
    /// state changes; workers park here.
    get_job_unblock: Condvar,
    /// Signaled (broadcast) when a bounded queue gains room or the pool's
    /// gating state changes; submitters park here.
    put_job_unblock: Condvar,
    /// Pairs with `all_idle`. Holding it across the idle check in `wait`
    /// closes the missed-wakeup window.
    all_idle_mutex: Mutex<()>,
    /// Broadcast by the worker that drops the working count to zero.
    all_idle: Condvar,
    /// Cleared exactly once, by shutdown. Workers exit their loop and every
    /// parked queue operation cancels when this goes false.
    keepalive: AtomicBool,
    /// False while the pool is quiesced. Cleared by `wait`, set by
    /// `reactivate`; both queue operations block while it is false.
    active: AtomicBool,
    start_hook: Option<StartHook>,
    end_hook: Option<EndHook>,
    passport: Arc<Passport>,
}

thread_local! {
    /// Id of the pool that owns the current thread, or zero for threads no
    /// pool owns. `wait`, `shutdown` and `destroy` consult this to reject
    /// calls from the pool's own workers, which could never complete.
    static OWNER_POOL: Cell<usize> = Cell::new(0);
}

fn next_pool_id() -> usize {
    // Pool ids only need uniqueness. This stays a std atomic even under
    // loom: it is not part of any modeled interleaving, and loom statics
    // would reset between iterations.
    static NEXT_POOL_ID: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);
    NEXT_POOL_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

impl PoolCore {
    fn is_owner_thread(&self) -> bool {
        OWNER_POOL.with(|owner| owner.get()) == self.id
    }

    /// Enqueues one job, blocking while the pool is quiesced or a bounded
    /// queue is full. Cancels if a shutdown intervenes.
    fn put_job(&self, job: Job) -> Result<()> {
        let mut queue = self.queue.lock().unwrap();
        while self.keepalive.load(Ordering::Acquire)
            && (!self.active.load(Ordering::Acquire) || queue.is_full())
        {
            queue = self.put_job_unblock.wait(queue).unwrap();
        }
        if !self.keepalive.load(Ordering::Acquire) {
            return Err(Error::Canceled);
        }

        queue.push(job);
        if queue.len() == 1 {
            // Broadcast, not signal: a woken worker reacquires the mutex in
            // the same race as any other waiter, so a single signal can be
            // swallowed by a peer and lost.
            self.get_job_unblock.notify_all();
        }
        Ok(())
    }

    /// Dequeues one job, blocking while the queue is empty or the pool is
    /// quiesced. Returns `None` when a shutdown intervenes.
    fn get_job(&self) -> Option<Job> {
        let mut queue = self.queue.lock().unwrap();
        while self.keepalive.load(Ordering::Acquire)
            && (queue.len() == 0 || !self.active.load(Ordering::Acquire))
        {
            queue = self.get_job_unblock.wait(queue).unwrap();
        }
        if !self.keepalive.load(Ordering::Acquire) {
            return None;
        }

        let job = queue.pop()?;
        // The working count rises while the queue lock is still held, so the
        // idle check in `wait` can never observe an empty queue with this
        // job unaccounted for.
        self.num_threads_working.fetch_add(1, Ordering::AcqRel);
        if queue.max_len() != 0 && queue.len() == queue.max_len() - 1 {
            self.put_job_unblock.notify_all();
        }
        Some(job)
    }

    /// Blocks until the queue is empty and no worker is executing, then
    /// quiesces the pool.
    fn wait_inner(&self) -> Result<()> {
        if self.is_owner_thread() {
            error!(
                "wait on pool {} called from one of its own workers",
                self.name_prefix
            );
            return Err(Error::Inval);
        }

        // Idle-then-queue is the only two-lock section in the pool; no other
        // path acquires both, and none acquires idle while holding queue.
        let mut idle = self.all_idle_mutex.lock().unwrap();
        loop {
            if !self.keepalive.load(Ordering::Acquire) {
                // A shutdown unparks every waiter.
                return Err(Error::Canceled);
            }
            let queue = self.queue.lock().unwrap();
            let working = self.num_threads_working.load(Ordering::Acquire);
            if queue.len() == 0 && working == 0 {
                // Quiesce while still holding the queue lock, so no worker
                // can pull a job between the idle observation and the pause
                // taking effect.
                self.active.store(false, Ordering::Release);
                drop(queue);
                break;
            }
            drop(queue);
            idle = self.all_idle.wait(idle).unwrap();
        }
        drop(idle);

        debug!("pool {} quiesced", self.name_prefix);
        Ok(())
    }

    /// Resumes a quiesced pool. A no-op when the pool is already active.
    fn reactivate_inner(&self) {
        let _queue = self.queue.lock().unwrap();
        self.active.store(true, Ordering::Release);
        self.get_job_unblock.notify_all();
        self.put_job_unblock.notify_all();
    }
}

// -----------------------------------------------------------------------------
// The api gate

/// Wraps one gated pool operation: counts the call in flight on the
/// passport, and rejects it when the pool is not alive. `shutdown` and
/// `destroy` deliberately bypass this; shutdown waits for the counter to
/// drain.
fn gated<R>(passport: &Passport, op: impl FnOnce() -> Result<R>) -> Result<R> {
    passport.enter_api();
    let result = match passport.state() {
        PoolState::Alive => op(),
        state => {
            error!("pool api used in state {}", state.name());
            Err(Error::Inval)
        }
    };
    passport.leave_api();
    result
}

// -----------------------------------------------------------------------------
// Thread pool handle

/// A fixed-size pool of worker threads fed from a shared, optionally
/// bounded job queue.
///
/// See the [crate docs](crate) for an overview and an example.
///
/// The handle is `Send + Sync`; wrap it in an [`Arc`] (or borrow it from a
/// scope) to drive the pool from several threads. Dropping the handle
/// destroys the pool, shutting it down first if the user never did.
///
/// [`Arc`]: std::sync::Arc
pub struct ThreadPool {
    core: Arc<PoolCore>,
    /// Worker bookkeeping, freed by `destroy`.
    workers: Mutex<Vec<Arc<Worker>>>,
    /// Join handles for the worker threads, reaped by `shutdown`.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Creates a pool with `num_threads` workers and default configuration.
    pub fn new(name_prefix: &str, num_threads: usize) -> Result<ThreadPool> {
        ThreadPool::with_config(Config {
            name_prefix: name_prefix.to_string(),
            num_threads,
            ..Config::default()
        })
    }

    /// Creates a pool from a [`Config`].
    ///
    /// Blocks until every successfully created worker reports alive. Worker
    /// creation is best-effort: if the OS refuses some of the requested
    /// threads the pool comes up with the subset that started, and only a
    /// pool with no workers at all is an error.
    pub fn with_config(config: Config) -> Result<ThreadPool> {
        let Config {
            name_prefix,
            num_threads,
            work_num_max,
            start_hook,
            end_hook,
            hook_arg,
            passport,
        } = config;

        if num_threads == 0 {
            error!("a pool needs at least one worker thread");
            return Err(Error::Inval);
        }

        let passport = passport.unwrap_or_default();
        let name_prefix = clamp_name_prefix(&name_prefix);
        let id = next_pool_id();

        // Binding can fail when the caller hands in a passport that already
        // served another pool. An internal passport cannot collide.
        passport.bind(id, &name_prefix)?;

        let core = Arc::new(PoolCore {
            id,
            name_prefix,
            num_threads_alive: AtomicU32::new(0),
            num_threads_working: AtomicU32::new(0),
            queue: Mutex::new(JobQueue::new(work_num_max)),
            get_job_unblock: Condvar::new(),
            put_job_unblock: Condvar::new(),
            all_idle_mutex: Mutex::new(()),
            all_idle: Condvar::new(),
            keepalive: AtomicBool::new(true),
            active: AtomicBool::new(true),
            start_hook,
            end_hook,
            passport: Arc::clone(&passport),
        });

        // Creation itself holds a hook-argument reference, released below
        // once worker creation has committed. Each worker holds its own.
        let hook_arg = hook_arg.map(Arc::new);

        let mut workers = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);
        let mut last_spawn_error = None;
        for worker_id in 0..num_threads {
            let worker = Arc::new(Worker::new(
                worker_id,
                &core.name_prefix,
                hook_arg.clone(),
            ));
            let thread_core = Arc::clone(&core);
            let thread_worker = Arc::clone(&worker);
            let spawned = ThreadBuilder::new()
                .name(worker.name().to_string())
                .spawn(move || worker_loop(thread_core, thread_worker));
            match spawned {
                Ok(handle) => {
                    debug!("created worker {} in pool {}", worker_id, core.name_prefix);
                    workers.push(worker);
                    handles.push(handle);
                }
                Err(err) => {
                    error!(
                        "could not spawn worker {} in pool {}: {err}",
                        worker_id, core.name_prefix
                    );
                    last_spawn_error = Some(err);
                }
            }
        }

        if workers.is_empty() {
            passport.unbind_after_failed_init();
            let err = last_spawn_error
                .unwrap_or_else(|| std::io::Error::other("no worker threads created"));
            return Err(Error::Spawn(err));
        }

        // Worker creation has committed; release creation's reference. Any
        // failed spawns above dropped their worker's reference with the
        // worker record.
        drop(hook_arg);

        let created = workers.len() as u32;
        while core.num_threads_alive.load(Ordering::Acquire) != created {
            poll_pause();
        }
        debug!(
            "pool {} up with {created} of {num_threads} requested workers",
            core.name_prefix
        );

        Ok(ThreadPool {
            core,
            workers: Mutex::new(workers),
            handles: Mutex::new(handles),
        })
    }

    /// Submits one job to the pool.
    ///
    /// Blocks while the pool is quiesced or a bounded queue is full, and
    /// fails with [`Error::Canceled`] if a shutdown interrupts the wait.
    pub fn add_work<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        gated(&self.core.passport, || self.core.put_job(Box::new(job)))
    }

    /// Blocks until the job queue is empty and every worker is idle, then
    /// quiesces the pool: submission and dispatch stay paused until
    /// [`reactivate`] resumes them.
    ///
    /// Forbidden from the pool's own worker threads. A second `wait` without
    /// an intervening `reactivate` may block until a shutdown cancels it.
    ///
    /// [`reactivate`]: ThreadPool::reactivate
    pub fn wait(&self) -> Result<()> {
        gated(&self.core.passport, || self.core.wait_inner())
    }

    /// Resumes a pool quiesced by [`wait`], unblocking parked submitters and
    /// workers. A no-op when the pool is already active.
    ///
    /// [`wait`]: ThreadPool::wait
    pub fn reactivate(&self) -> Result<()> {
        gated(&self.core.passport, || {
            self.core.reactivate_inner();
            Ok(())
        })
    }

    /// The number of workers currently executing a job.
    pub fn num_threads_working(&self) -> Result<usize> {
        gated(&self.core.passport, || {
            Ok(self.core.num_threads_working.load(Ordering::Acquire) as usize)
        })
    }

    /// Stops the pool: workers finish their current job and exit, parked
    /// queue operations cancel, pending jobs are discarded, and in-flight
    /// api calls are drained. Bookkeeping is not freed; that is
    /// [`destroy`]'s job.
    ///
    /// Forbidden from the pool's own worker threads, and only legal while
    /// the pool is alive.
    ///
    /// [`destroy`]: ThreadPool::destroy
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_inner(&self.core.passport)
    }

    /// Destroys the pool, freeing the worker bookkeeping (and with it the
    /// last hook-argument references). Requires a completed [`shutdown`];
    /// calling it on an alive pool logs a warning and shuts it down first.
    ///
    /// Forbidden from the pool's own worker threads.
    ///
    /// [`shutdown`]: ThreadPool::shutdown
    pub fn destroy(&self) -> Result<()> {
        self.destroy_inner(&self.core.passport)
    }

    fn shutdown_inner(&self, passport: &Passport) -> Result<()> {
        let core = &self.core;
        if core.is_owner_thread() {
            error!(
                "shutdown of pool {} called from one of its own workers",
                core.name_prefix
            );
            return Err(Error::Inval);
        }

        if let Err(observed) = passport.try_transition(PoolState::Alive, PoolState::ShuttingDown) {
            error!(
                "cannot shut down pool {} in state {}",
                core.name_prefix,
                observed.name()
            );
            return Err(Error::Inval);
        }
        debug!("pool {} shutting down", core.name_prefix);

        core.keepalive.store(false, Ordering::SeqCst);
        core.active.store(false, Ordering::SeqCst);

        // One broadcast per condvar unparks every worker and submitter; they
        // observe `keepalive` and cancel.
        {
            let _queue = core.queue.lock().unwrap();
            core.get_job_unblock.notify_all();
            core.put_job_unblock.notify_all();
        }
        // Waiters parked in `wait` cancel too. Taking the idle mutex first
        // means a waiter is either already parked (and receives this) or has
        // yet to check `keepalive` (and cancels on its own).
        {
            let _idle = core.all_idle_mutex.lock().unwrap();
            core.all_idle.notify_all();
        }

        while core.num_threads_alive.load(Ordering::Acquire) != 0 {
            poll_pause();
        }
        // The alive count only covers the loop body; joining reaps the
        // threads themselves.
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }

        while passport.api_use() != 0 {
            poll_pause();
        }

        core.queue.lock().unwrap().clear();

        passport.transition_or_abort(PoolState::ShuttingDown, PoolState::Shutdown, "shutdown");
        debug!("pool {} shut down", core.name_prefix);
        Ok(())
    }

    fn destroy_inner(&self, passport: &Passport) -> Result<()> {
        let core = &self.core;
        if core.is_owner_thread() {
            error!(
                "destroy of pool {} called from one of its own workers",
                core.name_prefix
            );
            return Err(Error::Inval);
        }

        loop {
            match passport.try_transition(PoolState::Shutdown, PoolState::Destroying) {
                Ok(()) => break,
                Err(PoolState::Alive) => {
                    warn!(
                        "pool {} has not been shut down; shutting it down now, \
                         but an explicit shutdown first is recommended",
                        core.name_prefix
                    );
                    let _ = self.shutdown_inner(passport);
                }
                Err(PoolState::ShuttingDown) => {
                    warn!("pool {} is shutting down, destroy waiting", core.name_prefix);
                    poll_pause();
                }
                Err(observed) => {
                    error!(
                        "cannot destroy pool {} in state {}",
                        core.name_prefix,
                        observed.name()
                    );
                    return Err(Error::Inval);
                }
            }
        }

        // Dropping the worker records releases their hook-argument
        // references; with no earlier unrefs this is where the destructor
        // runs. The workers themselves exited during shutdown.
        self.workers.lock().unwrap().clear();

        passport.transition_or_abort(PoolState::Destroying, PoolState::Destroyed, "destroy");
        debug!("pool {} destroyed", core.name_prefix);
        Ok(())
    }

    fn check_passport(&self, passport: &Passport) -> Result<()> {
        if !passport.is_bound_to(self.core.id) {
            error!(
                "passport is not bound to pool {}; rejecting the call",
                self.core.name_prefix
            );
            return Err(Error::Inval);
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// The diagnostic surface
//
// Every operation again, taking the externally owned passport the pool was
// configured with. The passport outlives the pool by contract, and the gate
// consults only the passport before touching anything else, so these remain
// safe to call (and fail cleanly) after `destroy`.

impl ThreadPool {
    /// [`add_work`], validated against the externally owned passport.
    ///
    /// [`add_work`]: ThreadPool::add_work
    pub fn add_work_with_passport<F>(&self, passport: &Passport, job: F) -> Result<()>
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        self.check_passport(passport)?;
        gated(passport, || self.core.put_job(Box::new(job)))
    }

    /// [`wait`], validated against the externally owned passport.
    ///
    /// [`wait`]: ThreadPool::wait
    pub fn wait_with_passport(&self, passport: &Passport) -> Result<()> {
        self.check_passport(passport)?;
        gated(passport, || self.core.wait_inner())
    }

    /// [`reactivate`], validated against the externally owned passport.
    ///
    /// [`reactivate`]: ThreadPool::reactivate
    pub fn reactivate_with_passport(&self, passport: &Passport) -> Result<()> {
        self.check_passport(passport)?;
        gated(passport, || {
            self.core.reactivate_inner();
            Ok(())
        })
    }

    /// [`num_threads_working`], validated against the externally owned
    /// passport.
    ///
    /// [`num_threads_working`]: ThreadPool::num_threads_working
    pub fn num_threads_working_with_passport(&self, passport: &Passport) -> Result<usize> {
        self.check_passport(passport)?;
        gated(passport, || {
            Ok(self.core.num_threads_working.load(Ordering::Acquire) as usize)
        })
    }

    /// [`shutdown`], validated against the externally owned passport.
    ///
    /// [`shutdown`]: ThreadPool::shutdown
    pub fn shutdown_with_passport(&self, passport: &Passport) -> Result<()> {
        self.check_passport(passport)?;
        self.shutdown_inner(passport)
    }

    /// [`destroy`], validated against the externally owned passport.
    ///
    /// [`destroy`]: ThreadPool::destroy
    pub fn destroy_with_passport(&self, passport: &Passport) -> Result<()> {
        self.check_passport(passport)?;
        self.destroy_inner(passport)
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name_prefix", &self.core.name_prefix)
            .field("num_threads", &self.workers.lock().unwrap().len())
            .field("state", &self.core.passport.state().name())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.core.passport.state() != PoolState::Destroyed {
            let _ = self.destroy();
        }
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// The body of every worker thread: register, run the start hook, pull and
/// execute jobs until shutdown, run the end hook, deregister.
fn worker_loop(core: Arc<PoolCore>, worker: Arc<Worker>) {
    OWNER_POOL.with(|owner| owner.set(core.id));

    core.num_threads_alive.fetch_add(1, Ordering::AcqRel);

    if let Some(hook) = &core.start_hook {
        let hook_arg = worker.hook_arg();
        if unwind::halt_unwinding(|| hook(hook_arg.as_deref(), &worker)).is_err() {
            error!("start hook panicked on worker {}", worker.name());
        }
    }

    while core.keepalive.load(Ordering::Acquire) {
        // `None` means the pool is shutting down.
        let Some(job) = core.get_job() else { break };

        if unwind::halt_unwinding(|| job(&worker)).is_err() {
            error!("job panicked on worker {}", worker.name());
        }

        // The decrement is lock-free so many workers can finish at once;
        // only the one that hits zero takes the idle mutex, so a waiter
        // that just read the counters under it cannot miss the broadcast.
        let working = core.num_threads_working.fetch_sub(1, Ordering::AcqRel) - 1;
        if working == 0 {
            let _idle = core.all_idle_mutex.lock().unwrap();
            core.all_idle.notify_all();
        }
    }

    if let Some(hook) = &core.end_hook {
        if unwind::halt_unwinding(|| hook(&worker)).is_err() {
            error!("end hook panicked on worker {}", worker.name());
        }
    }

    core.num_threads_alive.fetch_sub(1, Ordering::AcqRel);
}

// -----------------------------------------------------------------------------
// Tests
