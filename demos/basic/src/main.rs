//! A single-process, no-supervisor demonstration of the core runtime:
//! registers a procedure and a task, wires them through `ApiHost` onto a
//! `LoopbackTransport`, drives the `Application` lifecycle, and exercises
//! a call and a subscription from a `LoopbackClient`. Multi-process
//! task offload is exercised by `neemata-supervisor`'s own integration
//! tests rather than here — this binary only needs one process to show
//! the dispatch pipeline end to end.

use std::sync::Arc;
use std::time::Duration;

use neemata_core::container::Container;
use neemata_core::dispatch::ApiDispatcher;
use neemata_core::format::FormatSelector;
use neemata_core::hooks::{HookEngine, HookKind};
use neemata_core::lifecycle::{Application, WorkerRole};
use neemata_core::registry::{ModuleBuilder, ProcedureBuilder, Registry, Task};
use neemata_core::schema::{AnySchema, ObjectSchema};
use neemata_core::server::{ApiHost, RpcRequest, RpcResponse};
use neemata_core::subscription::SubscriptionManager;
use neemata_core::wire::{Frame, FrameKind};
use neemata_core::RuntimeSettings;
use neemata_transport::{JsonFormat, LoopbackTransport};

fn build_registry() -> Registry {
    let registry = Registry::new();
    registry.register_module(
        ModuleBuilder::new("greet")
            .procedure(
                ProcedureBuilder::new(
                    "hello",
                    Arc::new(|_ctx, input| {
                        Box::pin(async move {
                            let name = input.get("name").and_then(|v| v.as_str()).unwrap_or("world");
                            Ok(serde_json::json!({ "message": format!("hello, {name}!") }))
                        })
                    }),
                )
                .input_schema(Arc::new(ObjectSchema::new().field("name", "string", |v| v.is_string())))
                .build(),
            )
            .task(Task {
                name: "square".into(),
                arg_schema: Arc::new(AnySchema),
                function: Arc::new(|_container, args| {
                    Box::pin(async move {
                        let n: i64 = serde_json::from_value(args).map_err(neemata_core::error::RuntimeError::internal)?;
                        Ok(serde_json::json!(n * n))
                    })
                }),
                local_only: true,
                timeout: None,
            })
            .build(),
    );
    registry
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = RuntimeSettings::default();
    let registry = Arc::new(build_registry());
    let global = Container::root();
    let hooks = Arc::new(HookEngine::new());
    hooks.on(HookKind::OnConnection, || {
        Box::pin(async {
            tracing::info!("client connected");
            Ok::<(), neemata_core::error::RuntimeError>(())
        })
    });

    let mut formats = FormatSelector::new();
    formats.register(Arc::new(JsonFormat));
    let dispatcher = Arc::new(ApiDispatcher::new(registry.clone(), formats, settings.call_timeout()));
    let subscriptions = Arc::new(SubscriptionManager::new());
    let host = ApiHost::new(dispatcher, subscriptions, hooks.clone(), global.clone(), settings.stream_window_bytes);

    let transport = Arc::new(LoopbackTransport::new("loopback", host.clone()));
    let application = Application::new(registry.clone(), global, hooks, WorkerRole::Api).with_transport(transport.clone());

    application.start().await.expect("application should start");

    let mut client = transport.connect().await;
    let request = RpcRequest {
        request_id: "demo-1".into(),
        procedure: "greet.hello".into(),
        payload: serde_json::json!({ "name": "neemata" }),
        timeout_ms: None,
    };
    client.send(Frame::new(FrameKind::Rpc, serde_json::to_vec(&request).unwrap())).await;

    if let Some(frame) = client.recv().await {
        let response: RpcResponse = serde_json::from_slice(&frame.payload).unwrap();
        tracing::info!(?response.payload, "received response");
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    application.stop().await.expect("application should stop cleanly");
}
