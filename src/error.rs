//! The error type reported by the pool's public api.

/// A specialized result type for pool operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by pool operations.
///
/// Failed operations never corrupt pool state; any partially acquired
/// internal resources are released before the error is returned.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A bad argument or an operation in an illegal lifecycle state. Also
    /// covers passport mismatches and calls to [`ThreadPool::wait`],
    /// [`ThreadPool::shutdown`] or [`ThreadPool::destroy`] made from a worker
    /// thread of the same pool, which would otherwise deadlock.
    ///
    /// [`ThreadPool::wait`]: crate::ThreadPool::wait
    /// [`ThreadPool::shutdown`]: crate::ThreadPool::shutdown
    /// [`ThreadPool::destroy`]: crate::ThreadPool::destroy
    #[error("invalid argument or pool lifecycle state")]
    Inval,

    /// A blocking queue operation was interrupted by a pool shutdown.
    #[error("operation canceled by pool shutdown")]
    Canceled,

    /// The passport handed to [`Config::passport`] is already bound to
    /// another pool.
    ///
    /// [`Config::passport`]: crate::Config::passport
    #[error("passport is already bound to another pool")]
    Rebind,

    /// The operating system refused to start every requested worker thread.
    /// A pool starts with whatever subset of workers could be created; this
    /// error is returned only when that subset is empty.
    #[error("could not spawn any worker thread")]
    Spawn(#[source] std::io::Error),
}
