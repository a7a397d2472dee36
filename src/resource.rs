//! Wrapped native resources.
//!
//! Every native object the host can see is wrapped in a [`ResourceHandle`].
//! The set of resource kinds is closed: [`NativeObject`] carries one variant
//! per kind, and identity comparison against a raw native handle dispatches on
//! that variant.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{ClError, Error, Status, error_name};

/// Type tag of a wrapped resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Platform,
    Device,
    Context,
    CommandQueue,
    Kernel,
    Program,
    Sampler,
    Event,
    MemoryObject,
    Exception,
}

impl ResourceKind {
    pub const COUNT: usize = 10;

    pub const ALL: [ResourceKind; Self::COUNT] = [
        ResourceKind::Platform,
        ResourceKind::Device,
        ResourceKind::Context,
        ResourceKind::CommandQueue,
        ResourceKind::Kernel,
        ResourceKind::Program,
        ResourceKind::Sampler,
        ResourceKind::Event,
        ResourceKind::MemoryObject,
        ResourceKind::Exception,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Platform => "Platform",
            ResourceKind::Device => "Device",
            ResourceKind::Context => "Context",
            ResourceKind::CommandQueue => "CommandQueue",
            ResourceKind::Kernel => "Kernel",
            ResourceKind::Program => "Program",
            ResourceKind::Sampler => "Sampler",
            ResourceKind::Event => "Event",
            ResourceKind::MemoryObject => "MemoryObject",
            ResourceKind::Exception => "Exception",
        }
    }

    /// Position in [`ResourceKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Decode a raw host-side tag. Tag 0 is "no type" and maps to `None`.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1..=10 => Some(Self::ALL[(tag - 1) as usize]),
            _ => None,
        }
    }

    /// Display name for a raw tag, `"UNKNOWN"` for anything unmapped.
    pub fn name_of_tag(tag: u32) -> &'static str {
        Self::from_tag(tag).map_or("UNKNOWN", Self::name)
    }

    /// Whether this kind wraps a native driver object.
    pub fn has_native(self) -> bool {
        !matches!(self, ResourceKind::Exception)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque pointer-sized identity of a driver object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(usize);

impl NativeHandle {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Process-unique identity of a wrapper (not of the native object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The native object behind a wrapper, one variant per resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeObject {
    Platform(NativeHandle),
    Device(NativeHandle),
    Context(NativeHandle),
    CommandQueue(NativeHandle),
    Kernel(NativeHandle),
    Program(NativeHandle),
    Sampler(NativeHandle),
    Event(NativeHandle),
    MemoryObject(NativeHandle),
    /// Host-side exception object; there is no driver object behind it.
    Exception(ClError),
}

impl NativeObject {
    /// Build the variant for `kind`. Returns `None` for [`ResourceKind::Exception`].
    pub fn with_kind(kind: ResourceKind, native: NativeHandle) -> Option<Self> {
        let object = match kind {
            ResourceKind::Platform => NativeObject::Platform(native),
            ResourceKind::Device => NativeObject::Device(native),
            ResourceKind::Context => NativeObject::Context(native),
            ResourceKind::CommandQueue => NativeObject::CommandQueue(native),
            ResourceKind::Kernel => NativeObject::Kernel(native),
            ResourceKind::Program => NativeObject::Program(native),
            ResourceKind::Sampler => NativeObject::Sampler(native),
            ResourceKind::Event => NativeObject::Event(native),
            ResourceKind::MemoryObject => NativeObject::MemoryObject(native),
            ResourceKind::Exception => return None,
        };
        Some(object)
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            NativeObject::Platform(_) => ResourceKind::Platform,
            NativeObject::Device(_) => ResourceKind::Device,
            NativeObject::Context(_) => ResourceKind::Context,
            NativeObject::CommandQueue(_) => ResourceKind::CommandQueue,
            NativeObject::Kernel(_) => ResourceKind::Kernel,
            NativeObject::Program(_) => ResourceKind::Program,
            NativeObject::Sampler(_) => ResourceKind::Sampler,
            NativeObject::Event(_) => ResourceKind::Event,
            NativeObject::MemoryObject(_) => ResourceKind::MemoryObject,
            NativeObject::Exception(_) => ResourceKind::Exception,
        }
    }

    /// The driver handle, if this variant has one.
    pub fn native(&self) -> Option<NativeHandle> {
        match self {
            NativeObject::Platform(h)
            | NativeObject::Device(h)
            | NativeObject::Context(h)
            | NativeObject::CommandQueue(h)
            | NativeObject::Kernel(h)
            | NativeObject::Program(h)
            | NativeObject::Sampler(h)
            | NativeObject::Event(h)
            | NativeObject::MemoryObject(h) => Some(*h),
            NativeObject::Exception(_) => None,
        }
    }

    /// Identity comparison against a raw driver handle.
    pub fn matches(&self, native: NativeHandle) -> bool {
        match self {
            NativeObject::Exception(_) => false,
            // Null is never a valid driver object.
            other => other.native().is_some_and(|h| h == native && !h.is_null()),
        }
    }
}

/// Driver hook used to release native objects.
///
/// Implementations call the driver's `clRelease*` for the given kind.
pub trait NativeRelease: Send + Sync {
    fn release(&self, kind: ResourceKind, native: NativeHandle) -> Result<(), Status>;
}

impl<F> NativeRelease for F
where
    F: Fn(ResourceKind, NativeHandle) -> Result<(), Status> + Send + Sync,
{
    fn release(&self, kind: ResourceKind, native: NativeHandle) -> Result<(), Status> {
        self(kind, native)
    }
}

/// A pending operation attached to a resource that must be settled if the
/// resource is destroyed first.
pub(crate) trait Attachment: Send + Sync {
    fn on_parent_destroyed(&self);
}

/// Wrapper around one native object.
pub struct ResourceHandle {
    id: HandleId,
    object: NativeObject,
    parent: Option<Weak<ResourceHandle>>,
    /// Whether this handle holds a counted reference on its parent.
    retains_parent: bool,
    destroyed: AtomicBool,
    finalized: AtomicBool,
    driver: Arc<dyn NativeRelease>,
    attachments: Mutex<Vec<(u64, Weak<dyn Attachment>)>>,
}

impl ResourceHandle {
    pub fn new(
        object: NativeObject,
        parent: Option<&Arc<ResourceHandle>>,
        driver: Arc<dyn NativeRelease>,
    ) -> Arc<Self> {
        Self::build(object, parent, false, driver)
    }

    pub(crate) fn build(
        object: NativeObject,
        parent: Option<&Arc<ResourceHandle>>,
        retains_parent: bool,
        driver: Arc<dyn NativeRelease>,
    ) -> Arc<Self> {
        let handle = Arc::new(Self {
            id: HandleId::next(),
            object,
            parent: parent.map(Arc::downgrade),
            retains_parent: retains_parent && parent.is_some(),
            destroyed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            driver,
            attachments: Mutex::new(Vec::new()),
        });

        tracing::trace!(
            "Wrapped {} #{} (native: {:?})",
            handle.kind(),
            handle.id,
            handle.native()
        );

        handle
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.object.kind()
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn object(&self) -> &NativeObject {
        &self.object
    }

    pub fn native(&self) -> Option<NativeHandle> {
        self.object.native()
    }

    pub fn matches(&self, native: NativeHandle) -> bool {
        self.object.matches(native)
    }

    /// The containing resource, if it is still alive.
    pub fn parent(&self) -> Option<Arc<ResourceHandle>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn retains_parent(&self) -> bool {
        self.retains_parent
    }

    /// Number of live ancestors.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();

        while let Some(handle) = current {
            depth += 1;
            current = handle.parent();
        }

        depth
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Release the native object.
    ///
    /// Idempotent: only the first call reaches the driver. Returns whether
    /// this call performed the destruction. Pending attachments are settled
    /// before the native release.
    pub fn destroy(&self) -> bool {
        // Flag and attachments change together so `attach` cannot slip in.
        let attachments = {
            let mut attachments = self.lock_attachments();

            if self.destroyed.swap(true, Ordering::AcqRel) {
                tracing::trace!("{} #{} already destroyed", self.kind(), self.id);
                return false;
            }

            std::mem::take(&mut *attachments)
        };

        for attachment in attachments.iter().filter_map(|(_, a)| a.upgrade()) {
            attachment.on_parent_destroyed();
        }

        if let Some(native) = self.native()
            && let Err(status) = self.driver.release(self.kind(), native)
        {
            tracing::warn!(
                "Releasing {} #{} ({}) failed: {}",
                self.kind(),
                self.id,
                native,
                error_name(status)
            );
        }

        tracing::debug!("Destroyed {} #{}", self.kind(), self.id);
        true
    }

    /// Attach a pending operation. Fails once the resource is destroyed.
    pub(crate) fn attach(&self, key: u64, attachment: Weak<dyn Attachment>) -> Result<(), Error> {
        let mut attachments = self.lock_attachments();

        if self.is_destroyed() {
            return Err(Error::UseAfterDestroy {
                kind: self.kind(),
                id: self.id,
            });
        }

        attachments.push((key, attachment));
        Ok(())
    }

    pub(crate) fn detach(&self, key: u64) {
        self.lock_attachments().retain(|(k, _)| *k != key);
    }

    /// Number of pending operations attached to this resource.
    pub fn pending_attachments(&self) -> usize {
        self.lock_attachments()
            .iter()
            .filter(|(_, a)| a.strong_count() > 0)
            .count()
    }

    /// Record that the host wrapper was collected.
    pub(crate) fn mark_finalized(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    /// Whether the host collector has reclaimed the wrapper. Only then may the
    /// count reaching zero destroy the resource.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn lock_attachments(&self) -> MutexGuard<'_, Vec<(u64, Weak<dyn Attachment>)>> {
        self.attachments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("parent", &self.parent().map(|p| p.id))
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
