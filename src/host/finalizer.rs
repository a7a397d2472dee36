//! Deferred finalization of collected host wrappers.
//!
//! ## Problem
//!
//! The host collector may run a wrapper's finalizer on a thread that is not
//! inside the host execution context (a concurrent or incremental GC thread).
//! Finalization touches shared lifecycle bookkeeping and may cascade into
//! native releases, which belong to the host context.
//!
//! ## Solution
//!
//! Queue the collected handle, then apply the queued finalizations the next
//! time the host context is entered (`ResourceContext::enter()`), or at
//! shutdown before the drain.
//!
//! ## Usage
//!
//! ```ignore
//! // From the collector's finalizer, on any thread
//! queue.defer(handle);
//!
//! // On the host context
//! queue.process_all(&lifecycles);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::lifecycle::Lifecycles;
use crate::resource::ResourceHandle;

/// Queue of wrappers whose host object was collected off the host context.
pub struct FinalizerQueue {
    /// Handles pending finalization
    queue: Mutex<VecDeque<Arc<ResourceHandle>>>,

    /// Fast check for pending items (avoids lock acquisition on hot path)
    pending_count: AtomicU64,
}

impl Default for FinalizerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FinalizerQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(8)),
            pending_count: AtomicU64::new(0),
        }
    }

    /// Queue a collected wrapper for finalization.
    ///
    /// Thread-safe; callable from any thread.
    pub fn defer(&self, handle: Arc<ResourceHandle>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(handle);
        self.pending_count.fetch_add(1, Ordering::Release);

        tracing::trace!("Deferred finalization (pending: {})", self.len());
    }

    /// Lock-free check for pending finalizations.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Apply every pending finalization against `lifecycles`.
    ///
    /// Returns the handles destroyed as a result (dependents first).
    pub fn process_all(&self, lifecycles: &Lifecycles) -> Vec<Arc<ResourceHandle>> {
        // Fast path: nothing pending
        if !self.has_pending() {
            return Vec::new();
        }

        let handles: VecDeque<Arc<ResourceHandle>> = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *queue)
        };

        let count = handles.len();

        if count == 0 {
            return Vec::new();
        }

        let destroyed: Vec<_> = handles
            .iter()
            .flat_map(|handle| lifecycles.relinquish(handle))
            .collect();

        self.pending_count
            .fetch_sub(count as u64, Ordering::Release);

        tracing::trace!(
            "Processed {} deferred finalizations, {} destroyed",
            count,
            destroyed.len()
        );

        destroyed
    }
}

impl std::fmt::Debug for FinalizerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerQueue")
            .field("pending_count", &self.len())
            .finish()
    }
}
