//! Per-worker metadata and the worker-side api.
//!
//! Every worker thread owns a [`Worker`] record: its id, its display name,
//! an opaque context slot, and its reference to the shared hook argument.
//! The record is handed by reference to hooks and jobs running on that
//! worker; it is never vended to code running anywhere else. This replaces
//! the usual "look my metadata up from a thread-local" dance with a plain
//! capability.

use std::any::Any;

use crate::hook::HookArg;
use crate::platform::*;

/// Worker thread names are truncated to what OS-level thread naming can
/// carry (15 bytes on Linux, the tightest common bound).
const MAX_THREAD_NAME_LEN: usize = 15;

/// Name prefixes longer than this would leave no room for the hex id.
const MAX_NAME_PREFIX_LEN: usize = 6;

// -----------------------------------------------------------------------------
// Worker

/// A handle to one worker thread of a pool.
///
/// Hooks and jobs receive a `&Worker` for the thread executing them. Through
/// it they can read the worker's identity, manage the worker's context slot,
/// and release the worker's reference to the shared hook argument early.
pub struct Worker {
    /// Dense id, assigned at pool creation.
    id: usize,
    /// Display name, "prefix-hexid".
    name: String,
    /// Slot for user-managed per-thread context. The pool never looks
    /// inside; it only drops whatever is left when the worker is destroyed.
    context: Mutex<Option<Box<dyn Any + Send>>>,
    /// This worker's reference to the shared hook argument. `None` once
    /// released, so the release is idempotent.
    hook_arg: Mutex<Option<Arc<HookArg>>>,
}

impl Worker {
    pub(crate) fn new(id: usize, name_prefix: &str, hook_arg: Option<Arc<HookArg>>) -> Worker {
        let mut name = format!("{name_prefix}-{id:x}");
        name.truncate(MAX_THREAD_NAME_LEN);
        Worker {
            id,
            name,
            context: Mutex::new(None),
            hook_arg: Mutex::new(hook_arg),
        }
    }

    /// The worker's id, dense from 0 in creation order.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The worker's display name. The same name is applied to the OS thread
    /// on a best-effort basis.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores `context` in this worker's context slot, replacing (and
    /// dropping) whatever was there.
    ///
    /// The slot is meant for state shared between the hooks and the jobs
    /// that run on this worker, a reused connection being the typical case.
    pub fn set_context<C>(&self, context: C)
    where
        C: Any + Send,
    {
        *self.context.lock().unwrap() = Some(Box::new(context));
    }

    /// Calls `f` with the context currently in the slot, or with `None` when
    /// the slot is empty or holds a value of a different type.
    pub fn with_context<C, R, F>(&self, f: F) -> R
    where
        C: Any + Send,
        F: FnOnce(Option<&mut C>) -> R,
    {
        let mut slot = self.context.lock().unwrap();
        f(slot.as_mut().and_then(|context| context.downcast_mut()))
    }

    /// Removes the context from the slot and returns it, if it is a `C`.
    /// A value of a different type is left in place.
    pub fn take_context<C>(&self) -> Option<Box<C>>
    where
        C: Any + Send,
    {
        let mut slot = self.context.lock().unwrap();
        match slot.take()?.downcast() {
            Ok(context) => Some(context),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Clears the context slot, dropping its contents.
    pub fn unset_context(&self) {
        *self.context.lock().unwrap() = None;
    }

    /// Releases this worker's reference to the shared hook argument.
    ///
    /// When the argument carries a destructor, the destructor runs as soon
    /// as the last reference is gone; a worker that calls this must not
    /// touch the argument again afterwards. Calling it again, or when the
    /// pool has no hook argument, does nothing.
    pub fn unref_hook_arg(&self) {
        self.hook_arg.lock().unwrap().take();
    }

    /// A clone of this worker's hook-argument reference, used to pass the
    /// argument into the start hook.
    pub(crate) fn hook_arg(&self) -> Option<Arc<HookArg>> {
        self.hook_arg.lock().unwrap().clone()
    }
}

/// Clamps a configured name prefix to the length thread naming can afford.
pub(crate) fn clamp_name_prefix(prefix: &str) -> String {
    let mut prefix = prefix.to_string();
    if let Some((cut, _)) = prefix.char_indices().nth(MAX_NAME_PREFIX_LEN) {
        prefix.truncate(cut);
    }
    prefix
}

// -----------------------------------------------------------------------------
// Tests
