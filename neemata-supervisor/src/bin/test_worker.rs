//! A minimal worker-process fixture used by the integration tests under
//! `tests/`. Not part of the public API — it only needs to exercise the
//! supervisor's process-management behavior (readiness handshake, task
//! routing, crash/restart, shutdown), so its registry carries exactly two
//! tasks: `math.add` (instant) and `math.sleep` (used to keep a task
//! worker busy long enough for its sibling to be killed out from under
//! it).

use std::sync::Arc;
use std::time::Duration;

use neemata_core::container::Container;
use neemata_core::hooks::HookEngine;
use neemata_core::lifecycle::{Application, WorkerRole};
use neemata_core::registry::{ModuleBuilder, Registry, Task};
use neemata_core::schema::AnySchema;
use neemata_core::task_engine::TaskEngine;
use neemata_supervisor::{client, WorkerLaunch};

fn math_module() -> neemata_core::registry::Module {
    ModuleBuilder::new("math")
        .task(Task {
            name: "add".into(),
            arg_schema: Arc::new(AnySchema),
            function: Arc::new(|_container, args| {
                Box::pin(async move {
                    let nums: Vec<i64> = serde_json::from_value(args).map_err(neemata_core::error::RuntimeError::internal)?;
                    Ok(serde_json::json!(nums.iter().sum::<i64>()))
                })
            }),
            local_only: false,
            timeout: None,
        })
        .task(Task {
            name: "sleep".into(),
            arg_schema: Arc::new(AnySchema),
            function: Arc::new(|_container, args| {
                Box::pin(async move {
                    let millis: u64 = serde_json::from_value(args).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(serde_json::json!("slept"))
                })
            }),
            local_only: false,
            timeout: None,
        })
        .build()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").with_writer(std::io::stderr).init();

    let WorkerLaunch { id, worker_type } = match client::parse_launch_args() {
        Some(launch) => launch,
        None => {
            eprintln!("neemata-test-worker must be launched with {} <id> <api|task>", client::WORKER_FLAG);
            std::process::exit(2);
        }
    };

    let mut reader = client::stdin_reader();
    let worker_data = client::read_worker_data(&mut reader).await.expect("failed to read WorkerData");
    tracing::info!(id, ?worker_type, ?worker_data, "test worker starting");

    // Test-only self-destruct, used by the crash-recovery integration
    // test to simulate an unprompted task-worker death without needing a
    // full transport to drive a real task invocation into it. Scoped to
    // task workers only so the api-worker side of the same test run
    // stays alive and the worker count drop is unambiguous.
    if worker_type == neemata_core::protocol::WorkerType::Task {
        if let Ok(millis) = std::env::var("NEEMATA_TEST_CRASH_TASK_AFTER_MS") {
            if let Ok(millis) = millis.parse::<u64>() {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    std::process::exit(70);
                });
            }
        }
    }

    let registry = Arc::new(Registry::new());
    registry.register_module(math_module());

    let role = match worker_type {
        neemata_core::protocol::WorkerType::Api => WorkerRole::Api,
        neemata_core::protocol::WorkerType::Task => WorkerRole::Task,
    };
    let is_task_worker = role == WorkerRole::Task;

    let application = Application::new(registry.clone(), Container::root(), Arc::new(HookEngine::new()), role);

    let client = client::worker_client_from_stdout();
    let offload: Option<Arc<dyn neemata_core::task_engine::TaskOffload>> = if is_task_worker { None } else { Some(client.clone()) };
    let task_engine = Arc::new(TaskEngine::new(
        registry,
        application.container.clone(),
        is_task_worker,
        offload,
        Duration::from_secs(30),
        Duration::from_secs(30),
    ));

    let application = Arc::new(application.with_task_engine(task_engine.clone()));
    let runtime = client::WorkerRuntime { application, task_engine };

    if let Err(e) = client::serve(client, runtime, is_task_worker, reader).await {
        tracing::error!(error = %e, "worker exited with error");
        std::process::exit(1);
    }
}
