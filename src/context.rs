//! Per-runtime resource context.
//!
//! A [`ResourceContext`] owns everything one host runtime needs to manage
//! native lifetimes: the identity registry, one lifecycle manager per kind,
//! the deferred finalizer queue and the submission side of the completion
//! channel. It is constructed explicitly and passed to bindings; there is no
//! process-wide singleton.

use std::sync::Arc;

use crate::completion::{
    self, Completion, CompletionBridge, CompletionPort, CompletionQueue, UserData,
};
use crate::config::LifetimeConfig;
use crate::error::{ClError, Result};
use crate::host::{FinalizerQueue, HostId, HostScope};
use crate::lifecycle::{DrainReport, Lifecycles};
use crate::registry::{Registration, ResourceRegistry};
use crate::resource::{NativeHandle, NativeObject, NativeRelease, ResourceHandle, ResourceKind};

pub struct ResourceContext {
    config: LifetimeConfig,
    host: HostId,
    driver: Arc<dyn NativeRelease>,
    registry: ResourceRegistry,
    lifecycles: Arc<Lifecycles>,
    finalizers: FinalizerQueue,
    port: CompletionPort,
}

impl ResourceContext {
    /// Context with the default configuration.
    ///
    /// The returned queue is the host side of the completion channel; the
    /// host drives it with [`CompletionQueue::process_pending`].
    pub fn new(driver: Arc<dyn NativeRelease>) -> (Self, CompletionQueue) {
        Self::with_config(driver, LifetimeConfig::default())
    }

    pub fn with_config(
        driver: Arc<dyn NativeRelease>,
        config: LifetimeConfig,
    ) -> (Self, CompletionQueue) {
        let host = HostId::next();
        let lifecycles = Arc::new(Lifecycles::new(&config));
        let (port, queue) =
            completion::channel(host, Arc::clone(&lifecycles), config.inline_host_completions);

        tracing::debug!(
            "Created resource context for host #{} (strict: {}, inline completions: {})",
            host.get(),
            config.strict_invariants,
            config.inline_host_completions
        );

        let context = Self {
            config,
            host,
            driver,
            registry: ResourceRegistry::new(),
            lifecycles,
            finalizers: FinalizerQueue::new(),
            port,
        };

        (context, queue)
    }

    /// Enter the host execution context on this thread.
    ///
    /// Applies finalizations deferred while the host was not active.
    pub fn enter(&self) -> HostScope {
        let scope = HostScope::enter(self.host);
        self.process_finalizers();
        scope
    }

    /// Wrap a native object, reusing the live wrapper for its identity.
    ///
    /// Every call takes one counted reference, to be given back by
    /// [`finalize`](Self::finalize) when the host wrapper is collected.
    pub fn wrap(
        &self,
        object: NativeObject,
        parent: Option<&Arc<ResourceHandle>>,
    ) -> Arc<ResourceHandle> {
        self.wrap_inner(object, parent, false)
    }

    /// Wrap a native object that keeps `parent` alive (a queue created from
    /// a context, a kernel created from a program).
    ///
    /// The parent reference is given back when the dependent is collected.
    pub fn wrap_dependent(
        &self,
        object: NativeObject,
        parent: &Arc<ResourceHandle>,
    ) -> Arc<ResourceHandle> {
        self.wrap_inner(object, Some(parent), true)
    }

    fn wrap_inner(
        &self,
        object: NativeObject,
        parent: Option<&Arc<ResourceHandle>>,
        retains_parent: bool,
    ) -> Arc<ResourceHandle> {
        if let Some(native) = object.native()
            && let Some(existing) = self.registry.find(native, object.kind())
            && let Some(existing) = self.reuse(existing)
        {
            tracing::trace!("Reusing {} #{} for {}", existing.kind(), existing.id(), native);
            return existing;
        }

        let native = object.native();
        let handle =
            ResourceHandle::build(object, parent, retains_parent, Arc::clone(&self.driver));

        let handle = loop {
            match native.map(|native| self.registry.register(native, &handle)) {
                // Lost a race with another wrap of the same identity.
                Some(Registration::Existing(existing)) => {
                    if let Some(existing) = self.reuse(existing) {
                        return existing;
                    }
                    // Destroyed meanwhile, so it no longer owns the identity.
                }
                Some(registration) => break registration.into_handle(),
                None => break handle,
            }
        };

        if handle.retains_parent()
            && let Some(parent) = parent
        {
            self.lifecycles.acquire(parent);
        }

        self.lifecycles.acquire(&handle);
        handle
    }

    /// Take one more reference on a registered wrapper, unless it was
    /// destroyed since it was found.
    fn reuse(&self, existing: Arc<ResourceHandle>) -> Option<Arc<ResourceHandle>> {
        let manager = self.lifecycles.manager(existing.kind());

        match manager.try_acquire(&existing) {
            Some(_) if !existing.is_destroyed() => Some(existing),
            Some(_) => {
                manager.release_quiet(&existing);
                None
            }
            None => None,
        }
    }

    /// Wrap a status error as an exception handle.
    pub fn exception(&self, error: ClError) -> Arc<ResourceHandle> {
        self.wrap(NativeObject::Exception(error), None)
    }

    /// The live wrapper for a native identity.
    pub fn lookup(&self, native: NativeHandle, kind: ResourceKind) -> Option<Arc<ResourceHandle>> {
        self.registry
            .find(native, kind)
            .or_else(|| self.lifecycles.find(native, kind))
    }

    pub fn acquire(&self, handle: &Arc<ResourceHandle>) -> usize {
        self.lifecycles.acquire(handle)
    }

    pub fn release(&self, handle: &ResourceHandle) -> Option<usize> {
        self.lifecycles.release(handle)
    }

    /// Collector hook: the host wrapper for `handle` was reclaimed.
    ///
    /// Applied at once on the host context, deferred to the next
    /// [`enter`](Self::enter) otherwise.
    pub fn finalize(&self, handle: Arc<ResourceHandle>) {
        if !HostScope::is_active_for(self.host) {
            tracing::trace!("Deferring finalization of {} #{}", handle.kind(), handle.id());
            self.finalizers.defer(handle);
            return;
        }

        for destroyed in self.lifecycles.relinquish(&handle) {
            self.registry.unregister(&destroyed);
        }
    }

    /// Explicit release requested by the host (`object.release()`).
    ///
    /// Destroys the native object now; the wrapper's counted reference is
    /// still given back by [`finalize`](Self::finalize).
    pub fn destroy(&self, handle: &ResourceHandle) -> bool {
        let destroyed = handle.destroy();
        self.registry.unregister(handle);
        destroyed
    }

    /// Submit an asynchronous operation reporting against `resource`.
    pub fn submit<F>(
        &self,
        resource: &Arc<ResourceHandle>,
        callback: F,
        user_data: Option<UserData>,
    ) -> Result<CompletionBridge>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.port.submit(resource, callback, user_data)
    }

    /// Teardown: apply pending finalizations, then destroy everything still
    /// live and forget every identity.
    pub fn shutdown(&self) -> DrainReport {
        let finalized = self.process_finalizers();
        let report = self.lifecycles.drain();
        self.registry.clear();

        tracing::debug!(
            "Host #{} shut down: {} finalized, {} drained",
            self.host.get(),
            finalized,
            report.destroyed
        );

        report
    }

    fn process_finalizers(&self) -> usize {
        let destroyed = self.finalizers.process_all(&self.lifecycles);

        for handle in &destroyed {
            self.registry.unregister(handle);
        }

        destroyed.len()
    }

    pub fn config(&self) -> &LifetimeConfig {
        &self.config
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn lifecycles(&self) -> &Arc<Lifecycles> {
        &self.lifecycles
    }

    pub fn finalizers(&self) -> &FinalizerQueue {
        &self.finalizers
    }

    pub fn port(&self) -> &CompletionPort {
        &self.port
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        let live = self.lifecycles.live_count();

        if !self.lifecycles.is_drained() && live > 0 {
            tracing::warn!(
                "Resource context for host #{} dropped with {} live handle(s) without shutdown",
                self.host.get(),
                live
            );
        }
    }
}

impl std::fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceContext")
            .field("host", &self.host)
            .field("registry", &self.registry)
            .field("lifecycles", &self.lifecycles)
            .field("finalizers", &self.finalizers)
            .finish()
    }
}
