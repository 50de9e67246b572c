//! Local and offloaded task execution (§4.5).
//!
//! The decision of "is this worker allowed to offload" is injected via
//! [`TaskOffload`] rather than this crate depending on `neemata-supervisor`
//! directly — `neemata-supervisor` implements `TaskOffload` over its IPC
//! channel to the parent process and hands the implementation to
//! `Application` at startup, keeping the dependency arrow pointing the
//! right way (supervisor depends on core, not vice versa).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::container::{Container, ScopeTag};
use crate::error::RuntimeError;
use crate::registry::Registry;

/// Sends an `ExecuteInvoke` on to the supervisor. Implemented by
/// `neemata-supervisor`'s worker-side IPC client; fire-and-forget — the
/// result comes back later via [`TaskEngine::complete`], called by the
/// worker's message loop when an `ExecuteResult` arrives.
#[async_trait::async_trait]
pub trait TaskOffload: Send + Sync {
    async fn send_invoke(&self, correlation_id: String, task_name: String, args: serde_json::Value) -> Result<(), RuntimeError>;
}

struct Pending {
    reply: oneshot::Sender<Result<serde_json::Value, RuntimeError>>,
}

/// Runs tasks locally or routes them through [`TaskOffload`] to a task
/// worker, per the decision tree in §4.5.
pub struct TaskEngine {
    registry: Arc<Registry>,
    global: Arc<Container>,
    is_task_worker: bool,
    offload: Option<Arc<dyn TaskOffload>>,
    local_timeout: Duration,
    offload_timeout: Duration,
    pending: Mutex<HashMap<String, Pending>>,
    correlation_seq: AtomicU64,
}

impl TaskEngine {
    pub fn new(
        registry: Arc<Registry>,
        global: Arc<Container>,
        is_task_worker: bool,
        offload: Option<Arc<dyn TaskOffload>>,
        local_timeout: Duration,
        offload_timeout: Duration,
    ) -> Self {
        TaskEngine {
            registry,
            global,
            is_task_worker,
            offload,
            local_timeout,
            offload_timeout,
            pending: Mutex::new(HashMap::new()),
            correlation_seq: AtomicU64::new(1),
        }
    }

    fn next_correlation_id(&self) -> String {
        let seq = self.correlation_seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-{seq}", Uuid::new_v4())
    }

    /// `execute(taskRef, args)` (§4.5). Resolves the task, validates
    /// arguments, then runs it locally or offloads per the decision tree.
    pub async fn execute(&self, task_name: &str, args: serde_json::Value) -> Result<serde_json::Value, RuntimeError> {
        let task = self.registry.task(task_name).ok_or_else(|| RuntimeError::NotFound(task_name.to_string()))?;

        if let Err(fields) = task.arg_schema.validate(&args) {
            return Err(RuntimeError::ValidationError(fields));
        }

        let run_locally = self.is_task_worker || task.local_only || self.offload.is_none();
        let timeout = task.timeout.unwrap_or(self.local_timeout);

        if run_locally {
            return self.run_local(&task, args, timeout).await;
        }

        self.run_offloaded(task_name, args).await
    }

    async fn run_local(
        &self,
        task: &crate::registry::Task,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RuntimeError> {
        // No dedicated "Task" tier exists in the three-level Scope
        // enumeration (§3); a task execution gets a one-shot scope with
        // Call's tag, matching Call's own "one per invocation, disposed
        // when done" lifecycle. See DESIGN.md.
        let scope = self.global.create_scope(ScopeTag::Call);
        let function = task.function.clone();
        let scope_for_run = scope.clone();
        let result = tokio::time::timeout(timeout, function(scope_for_run, args)).await;
        scope.dispose().await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(RuntimeError::Timeout),
        }
    }

    async fn run_offloaded(&self, task_name: &str, args: serde_json::Value) -> Result<serde_json::Value, RuntimeError> {
        let offload = self.offload.clone().expect("checked by caller");
        let correlation_id = self.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(correlation_id.clone(), Pending { reply: tx });

        if let Err(e) = offload.send_invoke(correlation_id.clone(), task_name.to_string(), args).await {
            self.pending.lock().unwrap().remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(self.offload_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RuntimeError::TaskWorkerLost { worker_id: 0 }),
            Err(_) => {
                self.pending.lock().unwrap().remove(&correlation_id);
                Err(RuntimeError::TaskTimeout)
            }
        }
    }

    /// Called by the worker's message loop when an `ExecuteResult`
    /// arrives from the supervisor.
    pub fn complete(&self, correlation_id: &str, result: Result<serde_json::Value, RuntimeError>) {
        if let Some(pending) = self.pending.lock().unwrap().remove(correlation_id) {
            let _ = pending.reply.send(result);
        }
    }

    /// Fail every in-flight correlation with `TaskWorkerLost` — invoked
    /// when the supervisor connection itself is lost (not a specific
    /// worker crash, which the supervisor instead reports per-correlation
    /// via `complete`).
    pub fn fail_all_pending(&self, worker_id: u32) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, p) in pending {
            let _ = p.reply.send(Err(RuntimeError::TaskWorkerLost { worker_id }));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModuleBuilder, Task};
    use crate::schema::AnySchema;

    fn add_task() -> Task {
        Task {
            name: "add".into(),
            arg_schema: Arc::new(AnySchema),
            function: Arc::new(|_container, args| {
                Box::pin(async move {
                    let nums: Vec<i64> = serde_json::from_value(args).unwrap();
                    Ok(serde_json::json!(nums.iter().sum::<i64>()))
                })
            }),
            local_only: false,
            timeout: None,
        }
    }

    fn registry_with_add() -> Arc<Registry> {
        let registry = Registry::new();
        registry.register_module(ModuleBuilder::new("math").task(add_task()).build());
        registry.load().unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn local_execution_on_task_worker_returns_result() {
        let registry = registry_with_add();
        let engine = TaskEngine::new(
            registry,
            Container::root(),
            true,
            None,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let result = engine.execute("math.add", serde_json::json!([2, 3])).await.unwrap();
        assert_eq!(result, serde_json::json!(5));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let registry = registry_with_add();
        let engine = TaskEngine::new(registry, Container::root(), true, None, Duration::from_secs(1), Duration::from_secs(1));
        let err = engine.execute("math.missing", serde_json::json!([])).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    struct RecordingOffload {
        engine: std::sync::Weak<TaskEngine>,
    }

    #[async_trait::async_trait]
    impl TaskOffload for RecordingOffload {
        async fn send_invoke(&self, correlation_id: String, _task_name: String, args: serde_json::Value) -> Result<(), RuntimeError> {
            if let Some(engine) = self.engine.upgrade() {
                let nums: Vec<i64> = serde_json::from_value(args).unwrap();
                engine.complete(&correlation_id, Ok(serde_json::json!(nums.iter().sum::<i64>())));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn offload_round_trips_through_complete() {
        let registry = registry_with_add();
        let engine = Arc::new_cyclic(|weak| {
            let offload: Arc<dyn TaskOffload> = Arc::new(RecordingOffload { engine: weak.clone() });
            TaskEngine::new(registry, Container::root(), false, Some(offload), Duration::from_secs(1), Duration::from_secs(1))
        });
        let result = engine.execute("math.add", serde_json::json!([4, 5])).await.unwrap();
        assert_eq!(result, serde_json::json!(9));
    }

    #[tokio::test]
    async fn local_only_task_runs_locally_even_with_offload_available() {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("math")
                .task(Task { local_only: true, ..add_task() })
                .build(),
        );
        registry.load().unwrap();
        struct PanicOffload;
        #[async_trait::async_trait]
        impl TaskOffload for PanicOffload {
            async fn send_invoke(&self, _c: String, _t: String, _a: serde_json::Value) -> Result<(), RuntimeError> {
                panic!("should never offload a local-only task");
            }
        }
        let engine = TaskEngine::new(
            Arc::new(registry),
            Container::root(),
            false,
            Some(Arc::new(PanicOffload)),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let result = engine.execute("math.add", serde_json::json!([1, 1])).await.unwrap();
        assert_eq!(result, serde_json::json!(2));
    }

    #[tokio::test]
    async fn worker_crash_fails_pending_with_task_worker_lost() {
        let registry = registry_with_add();
        struct NeverReplies;
        #[async_trait::async_trait]
        impl TaskOffload for NeverReplies {
            async fn send_invoke(&self, _c: String, _t: String, _a: serde_json::Value) -> Result<(), RuntimeError> {
                Ok(())
            }
        }
        let engine = Arc::new(TaskEngine::new(
            registry,
            Container::root(),
            false,
            Some(Arc::new(NeverReplies)),
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        let e = engine.clone();
        let handle = tokio::spawn(async move { e.execute("math.add", serde_json::json!([1, 2])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.pending_count(), 1);
        engine.fail_all_pending(7);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RuntimeError::TaskWorkerLost { worker_id: 7 })));
    }
}
