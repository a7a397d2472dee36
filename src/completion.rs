//! Asynchronous completion bridge.
//!
//! A [`CompletionBridge`] is created right before an asynchronous native
//! operation is submitted and handed to the driver as the operation's opaque
//! context. The driver reports completion from whatever thread it likes by
//! calling [`CompletionBridge::resolve`] exactly once. The result is copied
//! out of driver memory and handed to the registered callback on the host
//! execution context:
//!
//! 1. Resolving thread: settle the bridge, copy and release native buffers
//! 2. Send the completion over the host's channel (or run it inline when the
//!    resolving thread already is the host context)
//! 3. Host: [`CompletionQueue::process_pending`] runs the callbacks
//!
//! While pending, a bridge holds a counted reference on its parent resource,
//! so the resource cannot be collected out from under it. If the parent is
//! force-destroyed first, the bridge settles with
//! [`RESOURCE_RELEASED`](crate::error::status::RESOURCE_RELEASED).

use std::any::Any;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ClError, Error, Result, Status, status};
use crate::host::{HostId, HostScope};
use crate::lifecycle::Lifecycles;
use crate::resource::{Attachment, ResourceHandle};

/// Opaque payload carried from submission to the callback.
pub type UserData = Box<dyn Any + Send>;

type Callback = Box<dyn FnOnce(Completion) + Send>;

/// A buffer owned by the native layer, valid only during `resolve`.
///
/// Its contents are copied into host memory, then the release hook (if any)
/// hands the buffer back to the driver.
pub struct NativeBuffer<'a> {
    bytes: &'a [u8],
    release: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> NativeBuffer<'a> {
    /// A buffer the driver frees on its own.
    pub fn borrowed(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            release: None,
        }
    }

    /// A buffer that must be handed back through `release` once copied.
    pub fn with_release<F>(bytes: &'a [u8], release: F) -> Self
    where
        F: FnOnce() + 'a,
    {
        Self {
            bytes,
            release: Some(Box::new(release)),
        }
    }

    fn into_bytes(self) -> Bytes {
        let copied = Bytes::copy_from_slice(self.bytes);
        self.give_back();
        copied
    }

    /// Copy as a C string: stops at the first NUL, lossy UTF-8.
    fn into_message(self) -> String {
        let end = self
            .bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.bytes.len());
        let message = String::from_utf8_lossy(&self.bytes[..end]).into_owned();
        self.give_back();
        message
    }

    fn give_back(self) {
        if let Some(release) = self.release {
            release();
        }
    }
}

/// Outcome of an asynchronous operation, as seen by the host callback.
pub struct Completion {
    pub status: Status,
    /// `Error::AsyncCompletion` when `status` is nonzero.
    pub error: Option<Error>,
    pub message: Option<String>,
    pub diagnostics: Option<Bytes>,
    pub user_data: Option<UserData>,
    /// The resource the operation reported against.
    pub source: Arc<ResourceHandle>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref()
    }

    /// Take the user data out if it is a `T`; leaves it in place otherwise.
    pub fn take_user_data<T: Any>(&mut self) -> Option<Box<T>> {
        match self.user_data.take()?.downcast::<T>() {
            Ok(data) => Some(data),
            Err(data) => {
                self.user_data = Some(data);
                None
            }
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("status", &self.status)
            .field("error", &self.error)
            .field("message", &self.message)
            .field("diagnostics", &self.diagnostics.as_ref().map(Bytes::len))
            .field("has_user_data", &self.user_data.is_some())
            .field("source", &self.source.id())
            .finish()
    }
}

/// A settled completion waiting to run on the host context.
pub struct CompletionMessage {
    bridge: u64,
    callback: Callback,
    completion: Completion,
}

impl CompletionMessage {
    pub fn bridge_id(&self) -> u64 {
        self.bridge
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Invoke the callback.
    pub fn run(self) {
        (self.callback)(self.completion)
    }
}

/// Create the submission side and the host side of a completion channel.
pub fn channel(
    host: HostId,
    lifecycles: Arc<Lifecycles>,
    inline: bool,
) -> (CompletionPort, CompletionQueue) {
    let (tx, rx) = mpsc::unbounded_channel();

    let port = CompletionPort {
        host,
        tx,
        lifecycles,
        inline,
        in_flight: Arc::new(AtomicUsize::new(0)),
    };

    (port, CompletionQueue { host, rx })
}

/// Submission side: creates bridges and delivers their completions.
#[derive(Clone)]
pub struct CompletionPort {
    host: HostId,
    tx: mpsc::UnboundedSender<CompletionMessage>,
    lifecycles: Arc<Lifecycles>,
    inline: bool,
    in_flight: Arc<AtomicUsize>,
}

impl CompletionPort {
    /// Create a bridge reporting against `resource`.
    ///
    /// Takes a counted reference on `resource` until the bridge settles.
    pub fn submit<F>(
        &self,
        resource: &Arc<ResourceHandle>,
        callback: F,
        user_data: Option<UserData>,
    ) -> Result<CompletionBridge>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let manager = self.lifecycles.manager(resource.kind());
        if manager.try_acquire(resource).is_none() {
            return Err(Error::UseAfterDestroy {
                kind: resource.kind(),
                id: resource.id(),
            });
        }

        let shared = Arc::new(Shared {
            id: next_bridge_id(),
            parent: Arc::clone(resource),
            port: self.clone(),
            state: Mutex::new(BridgeState::Pending(Pending {
                callback: Box::new(callback),
                user_data,
            })),
        });

        self.in_flight.fetch_add(1, Ordering::AcqRel);

        // Attaching is atomic with destroy: either the bridge is attached and
        // gets cancelled, or the resource is already gone and nothing is held.
        let attachment: Weak<dyn Attachment> = Arc::downgrade(&shared) as Weak<dyn Attachment>;
        if let Err(err) = resource.attach(shared.id, attachment) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            manager.release_quiet(resource);
            return Err(err);
        }

        tracing::trace!(
            "Bridge #{} submitted on {} #{}",
            shared.id,
            resource.kind(),
            resource.id()
        );

        Ok(CompletionBridge { shared })
    }

    /// Bridges submitted through this port and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    fn deliver(&self, message: CompletionMessage) {
        if self.inline && HostScope::is_active_for(self.host) {
            message.run();
            return;
        }

        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            tracing::warn!(
                "Host completion queue closed; dropping completion of bridge #{}",
                message.bridge
            );
        }
    }
}

impl std::fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionPort")
            .field("host", &self.host)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Host side: runs delivered completions on the host execution context.
pub struct CompletionQueue {
    host: HostId,
    rx: mpsc::UnboundedReceiver<CompletionMessage>,
}

impl CompletionQueue {
    pub fn host(&self) -> HostId {
        self.host
    }

    /// Run every completion delivered so far. Returns how many ran.
    pub fn process_pending(&mut self) -> usize {
        let _scope = HostScope::enter(self.host);
        let mut processed = 0;

        while let Ok(message) = self.rx.try_recv() {
            message.run();
            processed += 1;
        }

        processed
    }

    /// Wait for the next completion and run it.
    ///
    /// Returns `false` once every port is gone and the queue is empty.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(message) => {
                let _scope = HostScope::enter(self.host);
                message.run();
                true
            }
            None => false,
        }
    }

    /// Wait for the next completion without running it.
    pub async fn next(&mut self) -> Option<CompletionMessage> {
        self.rx.recv().await
    }

    /// Completions delivered and not yet run.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("host", &self.host)
            .field("pending", &self.pending())
            .finish()
    }
}

struct Pending {
    callback: Callback,
    user_data: Option<UserData>,
}

enum BridgeState {
    Pending(Pending),
    Resolved,
    /// Parent destroyed before the driver reported completion.
    Cancelled,
}

struct Shared {
    id: u64,
    parent: Arc<ResourceHandle>,
    port: CompletionPort,
    state: Mutex<BridgeState>,
}

impl Shared {
    fn settle(
        &self,
        pending: Pending,
        status: Status,
        message: Option<String>,
        diagnostics: Option<Bytes>,
    ) {
        let completion = Completion {
            status,
            error: ClError::from_status(status).map(Error::AsyncCompletion),
            message,
            diagnostics,
            user_data: pending.user_data,
            source: Arc::clone(&self.parent),
        };

        self.port.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.port.deliver(CompletionMessage {
            bridge: self.id,
            callback: pending.callback,
            completion,
        });
    }
}

impl Attachment for Shared {
    fn on_parent_destroyed(&self) {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, BridgeState::Cancelled) {
                BridgeState::Pending(pending) => pending,
                settled => {
                    *state = settled;
                    return;
                }
            }
        };

        tracing::debug!(
            "Bridge #{} cancelled: {} #{} released first",
            self.id,
            self.parent.kind(),
            self.parent.id()
        );

        self.settle(pending, status::RESOURCE_RELEASED, None, None);

        // The parent is mid-destroy; drop our reference without collecting it.
        self.port
            .lifecycles
            .manager(self.parent.kind())
            .release_quiet(&self.parent);
    }
}

fn next_bridge_id() -> u64 {
    static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Single-shot completion context for one asynchronous native operation.
#[derive(Clone)]
pub struct CompletionBridge {
    shared: Arc<Shared>,
}

impl CompletionBridge {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The resource this bridge reports against.
    pub fn parent(&self) -> &Arc<ResourceHandle> {
        &self.shared.parent
    }

    /// Whether the bridge has settled (resolved or cancelled).
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.lock_state(), BridgeState::Pending(_))
    }

    /// Report completion. Callable from any thread, once.
    ///
    /// Native buffers are copied and released before this returns. A call
    /// after the parent was force-destroyed is rejected with
    /// [`Error::DoubleResolve`] but still hands its buffers back to the
    /// driver. A true second call leaves its buffers untouched.
    pub fn resolve(
        &self,
        status: Status,
        message: Option<NativeBuffer<'_>>,
        diagnostics: Option<NativeBuffer<'_>>,
    ) -> Result<()> {
        let shared = &self.shared;

        let (pending, message, diagnostics) = {
            let mut state = self.lock_state();

            let pending = match std::mem::replace(&mut *state, BridgeState::Resolved) {
                BridgeState::Pending(pending) => pending,
                BridgeState::Cancelled => {
                    // The driver's only completion: the callback already ran.
                    for buffer in [message, diagnostics].into_iter().flatten() {
                        buffer.give_back();
                    }
                    drop(state);
                    return Err(self.reject(true));
                }
                BridgeState::Resolved => {
                    drop(state);
                    return Err(self.reject(false));
                }
            };

            (
                pending,
                message.map(NativeBuffer::into_message),
                diagnostics.map(NativeBuffer::into_bytes),
            )
        };

        shared.parent.detach(shared.id);

        tracing::trace!(
            "Bridge #{} resolved with {} on {} #{}",
            shared.id,
            crate::error::error_name(status),
            shared.parent.kind(),
            shared.parent.id()
        );

        shared.settle(pending, status, message, diagnostics);

        // Drop the in-flight reference; collects the parent only if its
        // wrapper was already finalized.
        shared.port.lifecycles.release_and_collect(&shared.parent);

        Ok(())
    }

    /// Hand the bridge to the driver as an opaque context pointer.
    pub fn into_raw(self) -> *const c_void {
        Arc::into_raw(self.shared) as *const c_void
    }

    /// Recover a bridge from [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and be passed here exactly once.
    pub unsafe fn from_raw(ptr: *const c_void) -> Self {
        // SAFETY: the caller guarantees ptr came from Arc::into_raw of a Shared
        let shared = unsafe { Arc::from_raw(ptr as *const Shared) };
        Self { shared }
    }

    fn reject(&self, cancelled: bool) -> Error {
        let err = Error::DoubleResolve {
            bridge: self.shared.id,
        };

        if cancelled {
            tracing::debug!("{}: owning resource was already released", err);
        } else {
            tracing::warn!("{}; ignored", err);
        }

        err
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BridgeState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CompletionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionBridge")
            .field("id", &self.shared.id)
            .field("parent", &self.shared.parent.id())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
