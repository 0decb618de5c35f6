//! Worker start/end hooks and the shared hook argument.
//!
//! A pool may be configured with a hook that runs once when each worker
//! starts (before it begins pulling jobs) and one that runs as it exits.
//! Both receive a handle to the worker, which they typically use to stash
//! per-thread state in the worker's context slot.
//!
//! The start hook additionally receives the shared [`HookArg`], a type-erased
//! value handed to every worker. When the argument carries a destructor, its
//! lifetime is reference counted: every worker holds a reference, released
//! either when the worker's bookkeeping is destroyed (during
//! [`ThreadPool::destroy`]) or earlier via [`Worker::unref_hook_arg`], and
//! the destructor runs exactly once after the last reference goes away.
//!
//! [`ThreadPool::destroy`]: crate::ThreadPool::destroy
//! [`Worker::unref_hook_arg`]: crate::Worker::unref_hook_arg

use std::any::Any;
use std::mem;
use std::sync::Mutex;

use tracing::debug;
use tracing::error;

use crate::worker::Worker;

/// Hook invoked by each worker thread once, after it has registered itself
/// as alive and before it starts pulling jobs. The first parameter is the
/// shared hook argument, if one was configured.
pub type StartHook = Box<dyn Fn(Option<&HookArg>, &Worker) + Send + Sync>;

/// Hook invoked by each worker thread once, just before it exits.
pub type EndHook = Box<dyn Fn(&Worker) + Send + Sync>;

type Erased = Box<dyn Any + Send + Sync>;

// -----------------------------------------------------------------------------
// Hook argument

/// A shared value handed to every worker's start hook, with an optional
/// destructor.
///
/// Without a destructor this is nothing more than a type-erased value whose
/// storage lives as long as the pool. With a destructor, ownership of the
/// value transfers to the pool on a successful [`ThreadPool::with_config`]
/// and the destructor runs exactly once, after every worker has released its
/// reference.
///
/// ```
/// use ostinato::HookArg;
///
/// let arg = HookArg::with_destructor(String::from("shared"), |value| {
///     drop(value);
/// });
/// assert_eq!(arg.downcast_ref::<String>().unwrap(), "shared");
/// ```
///
/// [`ThreadPool::with_config`]: crate::ThreadPool::with_config
pub struct HookArg {
    value: Erased,
    /// Consumed by `Drop`. The mutex never contends; it only makes the
    /// once-callable destructor shareable alongside the value.
    destructor: Mutex<Option<Box<dyn FnOnce(Erased) + Send>>>,
}

impl HookArg {
    /// Wraps a value with no destructor.
    pub fn new<T>(value: T) -> HookArg
    where
        T: Any + Send + Sync,
    {
        HookArg {
            value: Box::new(value),
            destructor: Mutex::new(None),
        }
    }

    /// Wraps a value together with a destructor that runs exactly once, when
    /// the last holder of the argument releases its reference.
    pub fn with_destructor<T, D>(value: T, destructor: D) -> HookArg
    where
        T: Any + Send + Sync,
        D: FnOnce(T) + Send + 'static,
    {
        HookArg {
            value: Box::new(value),
            destructor: Mutex::new(Some(Box::new(move |erased: Erased| {
                match erased.downcast::<T>() {
                    Ok(value) => destructor(*value),
                    // The value was boxed from T right above; the downcast
                    // cannot miss.
                    Err(_) => {
                        error!("hook argument destructor received a value of the wrong type")
                    }
                }
            }))),
        }
    }

    /// Borrows the wrapped value, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl Drop for HookArg {
    fn drop(&mut self) {
        if let Some(destructor) = self.destructor.get_mut().unwrap().take() {
            let value = mem::replace(&mut self.value, Box::new(()));
            destructor(value);
            debug!("hook argument destructed");
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
