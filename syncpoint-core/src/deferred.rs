//! Deferred install requests.
//!
//! Install requests issued before the session is ready are parked here and
//! replayed, oldest first, once the client reaches `Ready`. The queue lives
//! in memory only; pending requests are lost on restart.

use std::collections::VecDeque;

use syncpoint_types::{DatabaseName, RequestId};

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredError {
    /// Queue is at capacity.
    Full {
        /// Configured capacity.
        capacity: usize,
    },
}

impl std::fmt::Display for DeferredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferredError::Full { capacity } => {
                write!(f, "deferred request queue full (capacity: {})", capacity)
            }
        }
    }
}

impl std::error::Error for DeferredError {}

/// An install request waiting for the session to become ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredInstall {
    /// Identifier returned to the caller.
    pub request_id: RequestId,
    /// Channel to find or create.
    pub channel_name: String,
    /// Local database to install into; a fresh one is created if `None`.
    pub local_database: Option<DatabaseName>,
}

impl DeferredInstall {
    /// Create a request with a fresh id.
    pub fn new(channel_name: impl Into<String>, local_database: Option<DatabaseName>) -> Self {
        Self {
            request_id: RequestId::new(),
            channel_name: channel_name.into(),
            local_database,
        }
    }
}

/// FIFO queue of deferred install requests with a size limit.
#[derive(Debug)]
pub struct DeferredRequestQueue {
    capacity: usize,
    queue: VecDeque<DeferredInstall>,
}

impl DeferredRequestQueue {
    /// Create an empty queue holding at most `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: VecDeque::new(),
        }
    }

    /// Append a request.
    pub fn enqueue(&mut self, request: DeferredInstall) -> Result<RequestId, DeferredError> {
        if self.queue.len() >= self.capacity {
            return Err(DeferredError::Full {
                capacity: self.capacity,
            });
        }
        let id = request.request_id;
        self.queue.push_back(request);
        Ok(id)
    }

    /// Take every queued request, oldest first, leaving the queue empty.
    ///
    /// Each request is handed out exactly once.
    pub fn drain(&mut self) -> Vec<DeferredInstall> {
        self.queue.drain(..).collect()
    }

    /// Drop every queued request, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
