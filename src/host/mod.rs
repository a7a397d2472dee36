//! Host execution context tracking and deferred finalization.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HostScope (RAII)                                           │
//! │  ├── Thread-local "current host" marker                     │
//! │  ├── Entered through ResourceContext::enter()               │
//! │  └── Applies deferred finalizations on entry                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  FinalizerQueue                                             │
//! │  ├── Thread-safe queue of collected wrappers                │
//! │  ├── Filled by finalizers running outside the host scope    │
//! │  └── Processed on next scope entry or at shutdown           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Lifecycles::relinquish                                     │
//! │  ├── Drops the wrapper's reference                          │
//! │  ├── Destroys the resource once nothing needs it            │
//! │  └── Cascades to a retained parent                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod finalizer;
mod scope;

pub use finalizer::FinalizerQueue;
pub use scope::{HostId, HostScope};
