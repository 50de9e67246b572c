//! `neemata-core`: the worker runtime — scoped DI container, registry,
//! hook engine, format selection, API dispatcher, task engine,
//! subscription manager, and stream registry.
//!
//! Concrete transports, wire formats, the CLI, and the supervisor's
//! process management live in sibling crates; this crate only specifies
//! the interfaces they meet (`wire::Transport`, `format::Format`,
//! `task_engine::TaskOffload`).

pub mod config;
pub mod connection;
pub mod container;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod hooks;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod server;
pub mod stream;
pub mod subscription;
pub mod task_engine;
pub mod wire;

pub use config::{ConfigError, RuntimeConfig, RuntimeSettings};
pub use connection::{CallContext, Connection, ConnectionId};
pub use container::{Container, ContainerError, Provider, Scope, ScopeTag};
pub use dispatch::ApiDispatcher;
pub use error::{FieldError, RuntimeError, WireError};
pub use format::{Format, FormatSelector};
pub use hooks::{CallOptions, HookEngine, HookKind};
pub use lifecycle::{Application, LifecycleState, WorkerRole};
pub use registry::{Module, ModuleBuilder, Procedure, ProcedureBuilder, Registry, Task};
pub use server::{ApiHost, RpcRequest, RpcResponse};
pub use schema::{AnySchema, ObjectSchema, Schema};
pub use stream::{Direction, Stream, StreamMeta, StreamRegistry, StreamState};
pub use subscription::SubscriptionManager;
pub use task_engine::{TaskEngine, TaskOffload};
pub use wire::{ConnectionSink, Frame, FrameKind, Transport, TransportHost};
