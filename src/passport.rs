//! The lifecycle passport: a small state block that outlives pool teardown.
//!
//! Every pool tracks its lifecycle on a [`Passport`]. The passport carries
//! two things: the pool's lifecycle state (a tagged six-state machine,
//! advanced with compare-and-swap) and a counter of API calls currently in
//! flight. `shutdown` uses the counter to drain callers before it clears the
//! queue, and the state gates every other operation.
//!
//! A passport is ordinarily allocated by the pool itself. Callers chasing
//! lifecycle bugs in concurrent code can instead create their own, keep it
//! alive longer than the pool, and pass it to the pool's `*_with_passport`
//! surface: because the passport survives [`ThreadPool::destroy`], a call
//! made after the pool is gone is rejected with a precise diagnostic rather
//! than racing freed bookkeeping.
//!
//! [`ThreadPool::destroy`]: crate::ThreadPool::destroy

use std::process::abort;

use tracing::debug;
use tracing::error;

use crate::platform::*;

// -----------------------------------------------------------------------------
// Lifecycle states

/// The lifecycle state of a pool, as recorded on its passport.
///
/// Transitions are monotonic over a pool's lifetime; only pool creation and
/// its rollback move between [`Unbound`] and [`Alive`]. A bound passport ends
/// in [`Destroyed`] and stays there.
///
/// [`Unbound`]: PoolState::Unbound
/// [`Alive`]: PoolState::Alive
/// [`Destroyed`]: PoolState::Destroyed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    /// The passport exists but no pool has bound it.
    Unbound = 0,
    /// The pool is operational and accepting work.
    Alive = 1,
    /// Shutdown has begun; workers are finishing their current jobs.
    ShuttingDown = 2,
    /// All workers have exited and the queue is drained; bookkeeping remains.
    Shutdown = 3,
    /// Destruction has begun; bookkeeping is being released.
    Destroying = 4,
    /// The pool's bookkeeping is gone. Terminal.
    Destroyed = 5,
}

impl PoolState {
    fn from_u8(value: u8) -> PoolState {
        match value {
            0 => PoolState::Unbound,
            1 => PoolState::Alive,
            2 => PoolState::ShuttingDown,
            3 => PoolState::Shutdown,
            4 => PoolState::Destroying,
            5 => PoolState::Destroyed,
            // The atomic is only ever stored from `PoolState` discriminants.
            _ => unreachable!("invalid pool lifecycle state {value}"),
        }
    }

    /// The state's name, for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            PoolState::Unbound => "UNBOUND",
            PoolState::Alive => "ALIVE",
            PoolState::ShuttingDown => "SHUTTING_DOWN",
            PoolState::Shutdown => "SHUTDOWN",
            PoolState::Destroying => "DESTROYING",
            PoolState::Destroyed => "DESTROYED",
        }
    }
}

// -----------------------------------------------------------------------------
// Passport

/// The concurrency state block for one pool: its lifecycle state plus a
/// count of in-flight API calls.
///
/// Create one with [`Passport::new`], wrap it in an [`Arc`], and hand a clone
/// to [`Config::passport`] to enable the pool's `*_with_passport` diagnostic
/// surface. A passport binds to at most one pool, ever.
///
/// [`Arc`]: std::sync::Arc
/// [`Config::passport`]: crate::Config::passport
pub struct Passport {
    state: AtomicU8,
    /// Number of gated API calls currently executing against the bound pool.
    num_api_use: AtomicU32,
    /// Id of the bound pool, for validating the diagnostic surface. Zero
    /// while unbound.
    bound_pool: AtomicUsize,
    /// Copy of the bound pool's name prefix, used only in diagnostics.
    name: Mutex<String>,
}

impl Passport {
    /// Creates an unbound passport.
    pub fn new() -> Passport {
        Passport {
            state: AtomicU8::new(PoolState::Unbound as u8),
            num_api_use: AtomicU32::new(0),
            bound_pool: AtomicUsize::new(0),
            name: Mutex::new(String::new()),
        }
    }

    /// The current lifecycle state of the bound pool.
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attempts the transition `from → to`. The weak exchange retries only
    /// while it keeps observing `from` (a spurious failure); observing any
    /// other state returns it to the caller.
    pub(crate) fn try_transition(
        &self,
        from: PoolState,
        to: PoolState,
    ) -> core::result::Result<(), PoolState> {
        loop {
            match self.state.compare_exchange_weak(
                from as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) if observed == from as u8 => continue,
                Err(observed) => return Err(PoolState::from_u8(observed)),
            }
        }
    }

    /// Performs a transition that the state machine guarantees cannot be
    /// contended. Observing any state other than `from` here means the
    /// machine itself is broken, and the process aborts.
    pub(crate) fn transition_or_abort(&self, from: PoolState, to: PoolState, op: &str) {
        if let Err(observed) = self.try_transition(from, to) {
            error!(
                "{op} completed but pool {} is in state {}; aborting",
                self.describe(),
                observed.name(),
            );
            abort();
        }
    }

    /// Binds this passport to a pool, moving it `UNBOUND → ALIVE`.
    pub(crate) fn bind(&self, pool_id: usize, name_prefix: &str) -> crate::Result<()> {
        if let Err(observed) = self.try_transition(PoolState::Unbound, PoolState::Alive) {
            error!(
                "passport rebind! the old pool {} is in state {}",
                self.describe(),
                observed.name(),
            );
            return Err(crate::Error::Rebind);
        }
        self.bound_pool.store(pool_id, Ordering::SeqCst);
        *self.name.lock().unwrap() = name_prefix.to_string();
        Ok(())
    }

    /// Rolls a failed pool creation back to `UNBOUND`, releasing the
    /// passport for another pool.
    pub(crate) fn unbind_after_failed_init(&self) {
        if let Err(observed) = self.try_transition(PoolState::Alive, PoolState::Unbound) {
            // Nothing left to do about it; creation is already failing.
            error!(
                "passport unbind failed! pool {} is in state {}",
                self.describe(),
                observed.name(),
            );
        }
        self.bound_pool.store(0, Ordering::SeqCst);
        self.name.lock().unwrap().clear();
    }

    /// Whether this passport is bound to the pool with the given id. The
    /// binding survives `destroy`, so the diagnostic surface keeps matching
    /// after the pool is gone.
    pub(crate) fn is_bound_to(&self, pool_id: usize) -> bool {
        self.bound_pool.load(Ordering::SeqCst) == pool_id
    }

    pub(crate) fn enter_api(&self) {
        self.num_api_use.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_api(&self) {
        self.num_api_use.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of gated API calls currently in flight.
    pub(crate) fn api_use(&self) -> u32 {
        self.num_api_use.load(Ordering::Acquire)
    }

    /// A short description of the bound pool for log lines.
    fn describe(&self) -> String {
        let name = self.name.lock().unwrap();
        let id = self.bound_pool.load(Ordering::SeqCst);
        format!("#{id}:{name}")
    }
}

impl Default for Passport {
    fn default() -> Passport {
        Passport::new()
    }
}

impl Drop for Passport {
    fn drop(&mut self) {
        match self.state() {
            PoolState::Unbound | PoolState::Destroyed => {
                debug!("dropping passport for pool {}", self.describe());
            }
            state => {
                // The passport is contracted to outlive its pool; dropping it
                // mid-lifecycle means the pool can now be used after free
                // without detection.
                error!(
                    "passport for pool {} dropped in state {}; lifecycle misuse can no longer be caught",
                    self.describe(),
                    state.name(),
                );
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
