//! Reference-counted deferred destruction.
//!
//! One [`LifecycleManager`] per resource kind tracks how many live
//! relationships currently need each wrapped resource: the host wrapper
//! itself, dependents created from it (a queue referencing its context), and
//! in-flight completions. The count is independent of collector timing.
//!
//! ## State machine
//!
//! ```text
//!   Untracked ──acquire──▶ Live(1) ──acquire──▶ Live(n+1)
//!       ▲                     │
//!       └──────release────────┘        (Live(n) ──release──▶ Live(n-1))
//!
//!   Live / Untracked ──drain or collection──▶ Destroyed
//! ```
//!
//! `release` alone never destroys. Destruction happens either through
//! collection (the wrapper was finalized and nothing else needs the
//! resource, see [`Lifecycles::relinquish`]) or through the shutdown
//! [`Lifecycles::drain`]. A completion giving back its reference collects
//! the resource only if its wrapper was already finalized.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::LifetimeConfig;
use crate::error::Error;
use crate::resource::{HandleId, NativeHandle, ResourceHandle, ResourceKind};

struct Tracked {
    handle: Arc<ResourceHandle>,
    refs: usize,
}

/// Live-set and reference counts for one resource kind.
pub struct LifecycleManager {
    kind: ResourceKind,
    strict: bool,
    tracked: Mutex<HashMap<HandleId, Tracked>>,
}

impl LifecycleManager {
    pub fn new(kind: ResourceKind, strict: bool) -> Self {
        Self {
            kind,
            strict,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Add one reference, tracking the handle at 1 if it was untracked.
    ///
    /// Returns the new count. A destroyed handle is never tracked: that is a
    /// use-after-destroy, fatal under strict invariants and ignored (count 0)
    /// otherwise.
    pub fn acquire(&self, handle: &Arc<ResourceHandle>) -> usize {
        match self.try_acquire(handle) {
            Some(refs) => refs,
            None => {
                self.use_after_destroy(handle);
                0
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but a destroyed handle is reported to
    /// the caller as `None` instead of tripping the strictness check.
    pub(crate) fn try_acquire(&self, handle: &Arc<ResourceHandle>) -> Option<usize> {
        debug_assert_eq!(handle.kind(), self.kind, "handle acquired by the wrong manager");

        if handle.is_destroyed() {
            return None;
        }

        let mut tracked = self.lock();
        let entry = tracked.entry(handle.id()).or_insert_with(|| Tracked {
            handle: Arc::clone(handle),
            refs: 0,
        });
        entry.refs += 1;

        tracing::trace!("Adding {} #{} refCount {}", self.kind, handle.id(), entry.refs);

        Some(entry.refs)
    }

    /// Drop one reference. Reaching zero untracks the handle without
    /// destroying it.
    ///
    /// Returns the remaining count, or `None` if the handle was not tracked
    /// (a no-op).
    pub fn release(&self, handle: &ResourceHandle) -> Option<usize> {
        let remaining = self.release_inner(handle);

        if remaining.is_none() {
            tracing::warn!(
                "Release of untracked {} #{} ignored (double release?)",
                self.kind,
                handle.id()
            );
        }

        remaining
    }

    /// Like [`release`](Self::release), without the untracked warning.
    pub(crate) fn release_quiet(&self, handle: &ResourceHandle) -> Option<usize> {
        self.release_inner(handle)
    }

    fn release_inner(&self, handle: &ResourceHandle) -> Option<usize> {
        let mut tracked = self.lock();
        let entry = tracked.get_mut(&handle.id())?;

        entry.refs -= 1;
        let remaining = entry.refs;

        if remaining == 0 {
            tracked.remove(&handle.id());
        }

        tracing::trace!("Removing {} #{} refCount {}", self.kind, handle.id(), remaining);

        Some(remaining)
    }

    /// Destroy every live handle and clear all bookkeeping.
    ///
    /// Deeper handles (more ancestors) go first. Handles already destroyed by
    /// their finalizer are skipped by `destroy` itself. Returns how many
    /// handles this call destroyed. Never panics on a poisoned lock.
    pub fn drain(&self) -> usize {
        let tracked = std::mem::take(
            &mut *self
                .tracked
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        if tracked.is_empty() {
            return 0;
        }

        let mut live: Vec<Tracked> = tracked.into_values().collect();
        live.sort_by_key(|t| (Reverse(t.handle.depth()), t.handle.id()));

        let mut destroyed = 0;

        for entry in &live {
            tracing::debug!(
                "[drain] {} #{}, refs {}",
                self.kind,
                entry.handle.id(),
                entry.refs
            );

            if entry.handle.destroy() {
                destroyed += 1;
            }
        }

        tracing::debug!("Drained {} {} handle(s), {} destroyed", live.len(), self.kind, destroyed);

        destroyed
    }

    /// The tracked wrapper for a raw native identity.
    pub fn find(&self, native: NativeHandle) -> Option<Arc<ResourceHandle>> {
        self.lock()
            .values()
            .find(|t| t.handle.matches(native) && !t.handle.is_destroyed())
            .map(|t| Arc::clone(&t.handle))
    }

    /// Current count for `handle`, 0 when untracked.
    pub fn count_of(&self, handle: &ResourceHandle) -> usize {
        self.lock().get(&handle.id()).map_or(0, |t| t.refs)
    }

    pub fn contains(&self, handle: &ResourceHandle) -> bool {
        self.lock().contains_key(&handle.id())
    }

    /// Snapshot of the live-set.
    pub fn live_handles(&self) -> Vec<Arc<ResourceHandle>> {
        self.lock().values().map(|t| Arc::clone(&t.handle)).collect()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn use_after_destroy(&self, handle: &ResourceHandle) {
        let err = Error::UseAfterDestroy {
            kind: handle.kind(),
            id: handle.id(),
        };

        if self.strict {
            panic!("{err}");
        }

        tracing::error!("{}; ignored", err);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HandleId, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("kind", &self.kind)
            .field("live", &self.len())
            .finish()
    }
}

/// Result of a shutdown drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Handles destroyed by the drain, over all kinds.
    pub destroyed: usize,
    /// Per-kind counts, in drain order.
    pub per_kind: Vec<(ResourceKind, usize)>,
}

/// One [`LifecycleManager`] per resource kind.
pub struct Lifecycles {
    managers: [LifecycleManager; ResourceKind::COUNT],
    drain_order: Vec<ResourceKind>,
    drained: AtomicBool,
}

impl Lifecycles {
    pub fn new(config: &LifetimeConfig) -> Self {
        Self {
            managers: std::array::from_fn(|i| {
                LifecycleManager::new(ResourceKind::ALL[i], config.strict_invariants)
            }),
            drain_order: config.effective_drain_order(),
            drained: AtomicBool::new(false),
        }
    }

    pub fn manager(&self, kind: ResourceKind) -> &LifecycleManager {
        &self.managers[kind.index()]
    }

    pub fn acquire(&self, handle: &Arc<ResourceHandle>) -> usize {
        self.manager(handle.kind()).acquire(handle)
    }

    pub fn release(&self, handle: &ResourceHandle) -> Option<usize> {
        self.manager(handle.kind()).release(handle)
    }

    pub fn count_of(&self, handle: &ResourceHandle) -> usize {
        self.manager(handle.kind()).count_of(handle)
    }

    pub fn find(&self, native: NativeHandle, kind: ResourceKind) -> Option<Arc<ResourceHandle>> {
        self.manager(kind).find(native)
    }

    /// Give up the collector's reference on a finalized wrapper and collect
    /// whatever is no longer needed.
    ///
    /// `handle` is marked finalized first. If it ends up untracked it is
    /// destroyed, and if it held a reference on its parent that reference is
    /// given back in turn. An untracked handle is destroyed directly. Returns
    /// the handles this call destroyed, dependents first.
    pub fn relinquish(&self, handle: &Arc<ResourceHandle>) -> Vec<Arc<ResourceHandle>> {
        handle.mark_finalized();
        self.collect(handle)
    }

    /// Give up a non-collector reference (a completion bridge's, say).
    ///
    /// Reaching zero destroys `handle` only if its wrapper was already
    /// finalized; a wrapper the host still holds is merely untracked.
    pub(crate) fn release_and_collect(
        &self,
        handle: &Arc<ResourceHandle>,
    ) -> Vec<Arc<ResourceHandle>> {
        self.collect(handle)
    }

    fn collect(&self, handle: &Arc<ResourceHandle>) -> Vec<Arc<ResourceHandle>> {
        let mut destroyed = Vec::new();
        let mut current = Some(Arc::clone(handle));

        while let Some(handle) = current.take() {
            let remaining = self.manager(handle.kind()).release_quiet(&handle);

            if remaining.is_some_and(|n| n > 0) || !handle.is_finalized() {
                break;
            }

            let destroyed_now = handle.destroy();

            // A tracked handle reaching zero gives up its parent exactly once,
            // even if someone destroyed it directly before.
            if handle.retains_parent() && (remaining == Some(0) || destroyed_now) {
                current = handle.parent();
            }

            if destroyed_now {
                destroyed.push(handle);
            }
        }

        destroyed
    }

    /// Destroy everything still live, kind by kind in drain order.
    ///
    /// Meant to run once at teardown; never panics.
    pub fn drain(&self) -> DrainReport {
        if self.drained.swap(true, Ordering::AcqRel) {
            tracing::warn!("Lifecycle drain requested more than once");
        }

        let mut report = DrainReport::default();

        for kind in &self.drain_order {
            let destroyed = self.manager(*kind).drain();
            report.destroyed += destroyed;
            report.per_kind.push((*kind, destroyed));
        }

        tracing::info!("Lifecycle drain destroyed {} handle(s)", report.destroyed);

        report
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Live handles over all kinds.
    pub fn live_count(&self) -> usize {
        self.managers.iter().map(LifecycleManager::len).sum()
    }
}

impl std::fmt::Debug for Lifecycles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycles")
            .field("live", &self.live_count())
            .field("drained", &self.is_drained())
            .finish()
    }
}
