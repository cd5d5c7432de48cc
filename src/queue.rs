//! Class Queues
//!
//! Bounded FIFO queues of admitted, not yet dispatched requests, one per
//! traffic class.
//!
//! ## Usage
//!
//! ```rust
//! use hybrid_scheduler::queue::ClassQueue;
//! use hybrid_scheduler::request::{RequestClass, RequestId};
//!
//! let mut queue = ClassQueue::new(RequestClass::Task, 2);
//! let (a, b, c) = (RequestId::new(), RequestId::new(), RequestId::new());
//!
//! queue.push_back(a).unwrap();
//! queue.push_back(b).unwrap();
//! assert!(queue.push_back(c).is_err()); // backpressure
//!
//! // preempted work goes to the front, even past the bound
//! queue.push_front(c);
//! assert_eq!(queue.pop_front(), Some(c));
//! assert_eq!(queue.pop_front(), Some(a));
//! ```

use std::collections::VecDeque;
use tracing::debug;

use crate::request::{RequestClass, RequestId};

/// FIFO queue for a single traffic class.
#[derive(Debug, Clone)]
pub struct ClassQueue {
    class: RequestClass,
    items: VecDeque<RequestId>,
    max_depth: usize,
}

impl ClassQueue {
    /// Create an empty queue that admits at most `max_depth` entries.
    pub fn new(class: RequestClass, max_depth: usize) -> Self {
        Self {
            class,
            items: VecDeque::new(),
            max_depth,
        }
    }

    /// Admit a request at the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueFull`] if the queue already holds
    /// `max_depth` entries. The queue is unchanged on error.
    pub fn push_back(&mut self, id: RequestId) -> Result<(), QueueError> {
        if self.items.len() >= self.max_depth {
            return Err(QueueError::QueueFull {
                class: self.class,
                depth: self.items.len(),
            });
        }
        self.items.push_back(id);
        debug!(
            class = %self.class,
            request_id = %id,
            queue_size = self.items.len(),
            "request enqueued"
        );
        Ok(())
    }

    /// Put an already-admitted request back ahead of everything else.
    ///
    /// Not subject to `max_depth`.
    pub fn push_front(&mut self, id: RequestId) {
        self.items.push_front(id);
        debug!(
            class = %self.class,
            request_id = %id,
            queue_size = self.items.len(),
            "request requeued at front"
        );
    }

    /// Re-admit an already-admitted request at the back.
    ///
    /// Not subject to `max_depth`.
    pub fn requeue_back(&mut self, id: RequestId) {
        self.items.push_back(id);
        debug!(
            class = %self.class,
            request_id = %id,
            queue_size = self.items.len(),
            "request requeued at back"
        );
    }

    /// Remove and return the oldest request.
    pub fn pop_front(&mut self) -> Option<RequestId> {
        self.items.pop_front()
    }

    /// Drain all queued ids in order.
    pub fn drain(&mut self) -> Vec<RequestId> {
        self.items.drain(..).collect()
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Queued ids, front first.
    pub fn ids(&self) -> Vec<RequestId> {
        self.items.iter().copied().collect()
    }

    /// Change the admission bound. Entries already queued are kept.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }
}

/// Queue error types
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has reached its maximum depth.
    #[error("{class} queue full ({depth} queued)")]
    QueueFull {
        /// Class of the full queue.
        class: RequestClass,
        /// Depth at the time of rejection.
        depth: usize,
    },
}
