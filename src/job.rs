//! This module defines the pool's unit of work and the queue that holds it.
//!
//! A [`Job`] is an owned closure handed to [`ThreadPool::add_work`]. It is
//! owned by the queue while enqueued, owned by the executing worker while
//! running, and dropped immediately after it returns.
//!
//! The [`JobQueue`] itself is a plain FIFO and does no synchronization of its
//! own; every access happens with the pool's queue mutex held. The blocking
//! and signaling protocol lives on the pool.
//!
//! [`ThreadPool::add_work`]: crate::ThreadPool::add_work

use std::collections::VecDeque;

use crate::worker::Worker;

/// A unit of work: a closure invoked with a handle to the worker thread that
/// executes it.
pub(crate) type Job = Box<dyn FnOnce(&Worker) + Send>;

// -----------------------------------------------------------------------------
// Job queue

/// A FIFO of pending jobs with an optional upper bound on its length.
pub(crate) struct JobQueue {
    jobs: VecDeque<Job>,
    /// Maximum number of queued jobs; 0 means unbounded.
    max_len: usize,
}

impl JobQueue {
    pub fn new(max_len: usize) -> JobQueue {
        JobQueue {
            jobs: VecDeque::new(),
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Returns true when the queue is bounded and the bound is reached.
    pub fn is_full(&self) -> bool {
        self.max_len != 0 && self.jobs.len() >= self.max_len
    }

    pub fn push(&mut self, job: Job) {
        debug_assert!(!self.is_full());
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Discards every pending job. Used when a shutdown drains the queue.
    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}

// -----------------------------------------------------------------------------
// Tests
