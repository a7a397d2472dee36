//! Weak lookup index from native identity to wrapper.
//!
//! The driver hands back the same native handle across calls (querying a
//! device twice yields the same device id). The registry lets the host reuse
//! the wrapper it already has instead of creating a second one with its own
//! reference count. It never keeps a wrapper alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::Error;
use crate::resource::{NativeHandle, ResourceHandle, ResourceKind};

type RegistryKey = (NativeHandle, ResourceKind);

/// Outcome of [`ResourceRegistry::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// The handle is now the wrapper for its native identity.
    Inserted(Arc<ResourceHandle>),
    /// Another live wrapper already owns the identity; it is returned and the
    /// offered handle was not retained.
    Existing(Arc<ResourceHandle>),
    /// The handle has no identity matching the key and was not indexed.
    Unindexed(Arc<ResourceHandle>),
}

impl Registration {
    /// The wrapper callers should use.
    pub fn handle(&self) -> &Arc<ResourceHandle> {
        match self {
            Registration::Inserted(h) | Registration::Existing(h) | Registration::Unindexed(h) => h,
        }
    }

    pub fn into_handle(self) -> Arc<ResourceHandle> {
        match self {
            Registration::Inserted(h) | Registration::Existing(h) | Registration::Unindexed(h) => h,
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, Registration::Existing(_))
    }
}

/// Process-wide `(native identity, kind) → wrapper` index.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Mutex<HashMap<RegistryKey, Weak<ResourceHandle>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handle` as the wrapper for `native`. First wrap wins.
    pub fn register(&self, native: NativeHandle, handle: &Arc<ResourceHandle>) -> Registration {
        if !handle.matches(native) {
            tracing::debug!(
                "Not indexing {} #{}: identity does not match {}",
                handle.kind(),
                handle.id(),
                native
            );
            return Registration::Unindexed(handle.clone());
        }

        let key = (native, handle.kind());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = entries.get(&key).and_then(live)
            && !Arc::ptr_eq(&existing, handle)
        {
            let warning = Error::DuplicateResource {
                kind: handle.kind(),
                native,
            };
            tracing::warn!("{}; reusing wrapper #{}", warning, existing.id());
            return Registration::Existing(existing);
        }

        entries.insert(key, Arc::downgrade(handle));
        Registration::Inserted(handle.clone())
    }

    /// Remove the entry pointing at `handle`, if any.
    ///
    /// Not a reference-count operation.
    pub fn unregister(&self, handle: &ResourceHandle) -> bool {
        let Some(native) = handle.native() else {
            return false;
        };

        let key = (native, handle.kind());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let points_here = entries
            .get(&key)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), handle));

        if points_here {
            entries.remove(&key);
        }

        points_here
    }

    /// The live wrapper for `native` of the given kind.
    pub fn find(&self, native: NativeHandle, kind: ResourceKind) -> Option<Arc<ResourceHandle>> {
        let key = (native, kind);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(&key).map(live) {
            Some(Some(handle)) if handle.matches(native) => Some(handle),
            Some(_) => {
                // Wrapper gone or destroyed; the driver may reuse the address.
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Drop entries whose wrapper was dropped or destroyed.
    pub fn purge(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, weak| live(weak).is_some());
        before - entries.len()
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn live(weak: &Weak<ResourceHandle>) -> Option<Arc<ResourceHandle>> {
    weak.upgrade().filter(|handle| !handle.is_destroyed())
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
