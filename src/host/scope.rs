//! HostScope - RAII marker for the host runtime's execution context.
//!
//! The host runtime runs on one logical execution context. Code that must run
//! there (completion callbacks, finalization bookkeeping) checks whether the
//! current thread is inside a scope for the right host, and defers otherwise.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one host runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(u64);

impl HostId {
    /// Allocate a fresh host identity.
    pub fn next() -> Self {
        static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

thread_local! {
    /// Host whose execution context this thread is currently in (if any).
    static CURRENT_HOST: Cell<Option<HostId>> = const { Cell::new(None) };
}

/// RAII guard marking the current thread as inside a host's execution context.
///
/// While this guard exists:
/// - `HostScope::current()` returns this host
/// - completions resolved on this thread for this host may run inline
/// - finalizations for this host are applied immediately instead of deferred
///
/// On drop the previous scope (for nested scopes) is restored. The guard is
/// tied to the thread that created it.
///
/// # Example
///
/// ```ignore
/// let _scope = context.enter();
/// // pending finalizations were applied on entry
/// queue.process_pending();
/// ```
pub struct HostScope {
    host: HostId,
    previous: Option<HostId>,
    _not_send: PhantomData<*const ()>,
}

impl HostScope {
    /// Enter the execution context of `host` on this thread.
    pub fn enter(host: HostId) -> Self {
        let previous = CURRENT_HOST.with(|c| c.replace(Some(host)));

        if previous.is_some_and(|p| p != host) {
            log::trace!("Nested host scope: {:?} inside {:?}", host, previous);
        }

        Self {
            host,
            previous,
            _not_send: PhantomData,
        }
    }

    /// The host whose scope this thread is in, if any.
    pub fn current() -> Option<HostId> {
        CURRENT_HOST.with(|c| c.get())
    }

    /// Whether this thread is inside a scope for `host`.
    pub fn is_active_for(host: HostId) -> bool {
        Self::current() == Some(host)
    }

    pub fn host(&self) -> HostId {
        self.host
    }
}

impl Drop for HostScope {
    fn drop(&mut self) {
        CURRENT_HOST.with(|c| c.set(self.previous));
        log::trace!("Left host scope {:?}", self.host);
    }
}

impl std::fmt::Debug for HostScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostScope")
            .field("host", &self.host)
            .field("previous", &self.previous)
            .finish()
    }
}
