//! Unwinding recovery utilities taken from rayon.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::thread::Result;

/// Executes `f` and captures any panic, translating that panic into an `Err`
/// result. The pool logs captured panics instead of propagating them: a
/// panicking job or hook must not take its worker thread down with it, or the
/// alive-thread bookkeeping that `shutdown` waits on would never drain.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}
