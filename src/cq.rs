//! Completion queue shared between the engine and the application.
//!
//! The queue carries its own lock because it may be bound to several
//! endpoints; everything else in the engine is single-threaded and
//! lock-free.

use std::collections::VecDeque;
use std::sync::Mutex;

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// Flags describing a completed operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompletionFlags: u64 {
        const SEND           = 1 << 0;
        const RECV           = 1 << 1;
        const TAGGED         = 1 << 2;
        const RMA            = 1 << 3;
        const READ           = 1 << 4;
        const WRITE          = 1 << 5;
        /// Releases a multi-receive buffer back to the application.
        const MULTI_RECV     = 1 << 6;
        /// The `data` field carries remote CQ data.
        const REMOTE_CQ_DATA = 1 << 7;
        /// Completion of a remotely initiated write.
        const REMOTE_WRITE   = 1 << 8;
    }
}

/// Application-visible completion record.
#[derive(Debug)]
pub struct Completion {
    /// Opaque context passed at submit time.
    pub context: u64,
    pub flags: CompletionFlags,
    /// Bytes transferred.
    pub len: u64,
    /// Buffers returned to the application (receive payload, or the
    /// transmit segments handed back after a send).
    pub buf: Vec<Vec<u8>>,
    /// Remote CQ data, 0 when absent.
    pub data: u64,
    /// Message tag; 0 for RMA operations.
    pub tag: u64,
}

/// Error completion; adds the provider errno.
#[derive(Debug)]
pub struct ErrCompletion {
    pub completion: Completion,
    pub err: i32,
}

struct CqInner {
    queue: VecDeque<Completion>,
    err_queue: VecDeque<ErrCompletion>,
    capacity: usize,
}

/// Bounded completion queue.
pub struct CompletionQueue {
    inner: Mutex<CqInner>,
}

impl CompletionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CqInner {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                err_queue: VecDeque::new(),
                capacity,
            }),
        }
    }

    /// Pop the oldest completion.
    pub fn read(&self) -> Option<Completion> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Pop the oldest error completion.
    pub fn read_err(&self) -> Option<ErrCompletion> {
        self.inner.lock().unwrap().err_queue.pop_front()
    }

    /// Append a completion; fails with `Again` at capacity.
    pub fn write(&self, completion: Completion) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= inner.capacity {
            return Err(Error::Again);
        }
        inner.queue.push_back(completion);
        Ok(())
    }

    /// Append an error completion; fails with `Again` at capacity.
    pub fn write_err(&self, err: ErrCompletion) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.err_queue.len() >= inner.capacity {
            return Err(Error::Again);
        }
        inner.err_queue.push_back(err);
        Ok(())
    }

    /// Whether the queue has no room for another completion. The engine
    /// peeks this each pass to refresh its resource-management flags.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queue.len() >= inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }
}
