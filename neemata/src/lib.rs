//! Neemata — an async, dependency-injection-driven application server
//! framework: scoped container, namespaced procedure/task registry,
//! lifecycle hooks, an API dispatcher pipeline, and (behind feature
//! flags) a reference transport and a multi-process supervisor.
//!
//! This facade crate re-exports the sub-crates through a single
//! dependency, the way `r2e` sits over `r2e-core`/`r2e-security`/etc.
//! Import everything with:
//!
//! ```ignore
//! use neemata::prelude::*;
//! ```
//!
//! # Feature flags
//!
//! | Feature      | Default | Crate                |
//! |--------------|---------|----------------------|
//! | `transport`  | **yes** | `neemata-transport`  |
//! | `supervisor` | **yes** | `neemata-supervisor` |
//! | `full`       | no      | both of the above    |

pub extern crate neemata_core;

#[cfg(feature = "transport")]
pub extern crate neemata_transport;

#[cfg(feature = "supervisor")]
pub extern crate neemata_supervisor;

pub use neemata_core::*;

#[cfg(feature = "transport")]
pub use neemata_transport as transport;

#[cfg(feature = "supervisor")]
pub use neemata_supervisor as supervisor;

/// Import everything you need with a single `use neemata::prelude::*;`.
pub mod prelude {
    pub use neemata_core::config::{ConfigError, RuntimeConfig, RuntimeSettings};
    pub use neemata_core::connection::{CallContext, Connection, ConnectionId};
    pub use neemata_core::container::{Container, ContainerError, Provider, Scope, ScopeTag};
    pub use neemata_core::dispatch::ApiDispatcher;
    pub use neemata_core::error::{FieldError, RuntimeError, WireError};
    pub use neemata_core::format::{Format, FormatSelector};
    pub use neemata_core::hooks::{CallOptions, HookEngine, HookKind};
    pub use neemata_core::lifecycle::{Application, LifecycleState, WorkerRole};
    pub use neemata_core::registry::{Module, ModuleBuilder, Procedure, ProcedureBuilder, Registry, Task};
    pub use neemata_core::schema::{AnySchema, ObjectSchema, Schema};
    pub use neemata_core::server::{ApiHost, RpcRequest, RpcResponse};
    pub use neemata_core::stream::{Direction, Stream, StreamMeta, StreamRegistry, StreamState};
    pub use neemata_core::subscription::SubscriptionManager;
    pub use neemata_core::task_engine::{TaskEngine, TaskOffload};
    pub use neemata_core::wire::{ConnectionSink, Frame, FrameKind, Transport, TransportHost};

    #[cfg(feature = "transport")]
    pub use neemata_transport::{JsonFormat, LoopbackClient, LoopbackTransport};

    #[cfg(feature = "supervisor")]
    pub use neemata_supervisor::{Supervisor, SupervisorError, SupervisorOptions};
}
