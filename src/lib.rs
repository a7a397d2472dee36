//! Native resource lifetime bridge for a WebCL host runtime.
//!
//! Wraps OpenCL objects owned by a native driver in host-visible handles and
//! keeps their lifetimes deterministic even though the host reclaims wrappers
//! on its own schedule:
//!
//! - [`ResourceRegistry`]: one wrapper per native identity
//! - [`Lifecycles`]: counted references, deferred destruction, shutdown drain
//! - [`CompletionBridge`]: asynchronous driver callbacks delivered on the host
//! - [`ResourceContext`]: the per-runtime bundle bindings are given

pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod registry;
pub mod resource;

// Core API
pub use completion::{Completion, CompletionBridge, CompletionPort, CompletionQueue, NativeBuffer};
pub use config::LifetimeConfig;
pub use context::ResourceContext;
pub use error::{ClError, Error, ErrorDescriptor, Result, Status, check, describe, status};
pub use host::{HostId, HostScope};
pub use lifecycle::{DrainReport, LifecycleManager, Lifecycles};
pub use registry::{Registration, ResourceRegistry};
pub use resource::{HandleId, NativeHandle, NativeObject, NativeRelease, ResourceHandle, ResourceKind};
