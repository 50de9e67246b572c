//! Application lifecycle state machine (§4.8).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::container::Container;
use crate::error::RuntimeError;
use crate::hooks::{CallOptions, HookEngine, HookKind};
use crate::registry::Registry;
use crate::task_engine::TaskEngine;
use crate::wire::Transport;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Initializing = 1,
    Initialized = 2,
    Starting = 3,
    Running = 4,
    Stopping = 5,
    Terminating = 6,
    Terminated = 7,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifecycleState::Created,
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Initialized,
            3 => LifecycleState::Starting,
            4 => LifecycleState::Running,
            5 => LifecycleState::Stopping,
            6 => LifecycleState::Terminating,
            _ => LifecycleState::Terminated,
        }
    }
}

/// Whether this worker is an API worker (terminates transports, serves
/// procedures) or a Task worker (only executes offloaded tasks).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerRole {
    Api,
    Task,
}

/// Drives `initialize()` → `start()` → `stop()` → `terminate()`, per §4.8.
/// Owns the registry and Global container; transports are only started
/// for `WorkerRole::Api`.
pub struct Application {
    pub registry: Arc<Registry>,
    pub container: Arc<Container>,
    pub hooks: Arc<HookEngine>,
    pub role: WorkerRole,
    transports: Vec<Arc<dyn Transport>>,
    task_engine: Option<Arc<TaskEngine>>,
    state: AtomicU8,
}

impl Application {
    pub fn new(registry: Arc<Registry>, container: Arc<Container>, hooks: Arc<HookEngine>, role: WorkerRole) -> Self {
        Application {
            registry,
            container,
            hooks,
            role,
            transports: Vec::new(),
            task_engine: None,
            state: AtomicU8::new(LifecycleState::Created as u8),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Attach the task engine backing the essential `"task"` command
    /// (§4.8). Workers that never execute tasks may omit this; the
    /// command then fails with `Internal` if invoked.
    pub fn with_task_engine(mut self, task_engine: Arc<TaskEngine>) -> Self {
        self.task_engine = Some(task_engine);
        self
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn require(&self, allowed: &[LifecycleState], action: &str) -> Result<(), RuntimeError> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidState(format!("cannot {action} from state {current}")))
        }
    }

    /// `initialize()`: `BeforeInitialize` → essential registry entries →
    /// `registry.load()` → `container.load()` → `AfterInitialize`.
    pub async fn initialize(&self) -> Result<(), RuntimeError> {
        if self.state() != LifecycleState::Created {
            return Ok(());
        }
        self.require(&[LifecycleState::Created], "initialize")?;
        self.set_state(LifecycleState::Initializing);

        self.hooks.call(HookKind::BeforeInitialize, CallOptions::sequential()).await?;

        self.register_essentials();
        self.registry.load()?;
        self.container.load(&[]).await.map_err(|e| RuntimeError::internal(e))?;

        self.hooks.call(HookKind::AfterInitialize, CallOptions::sequential()).await?;
        self.set_state(LifecycleState::Initialized);
        tracing::info!("application initialized");
        Ok(())
    }

    /// Registers the essential commands every worker carries regardless of
    /// user modules: the task-invocation command and the registry-print
    /// command, per §4.8.
    fn register_essentials(&self) {
        let registry = self.registry.clone();
        self.registry.register_command(
            "neemata",
            "registry:print",
            Arc::new(move |_args| {
                let registry = registry.clone();
                Box::pin(async move {
                    registry.print();
                    Ok(())
                })
            }),
        );

        let task_engine = self.task_engine.clone();
        self.registry.register_command(
            "neemata",
            "task",
            Arc::new(move |args| {
                let task_engine = task_engine.clone();
                Box::pin(async move {
                    let task_engine = task_engine.ok_or_else(|| RuntimeError::Internal {
                        message: "no task engine configured for this worker".into(),
                        source: None,
                    })?;
                    let name = args.first().ok_or_else(|| RuntimeError::Internal {
                        message: "task command requires a task name".into(),
                        source: None,
                    })?;
                    let task_args = match args.get(1) {
                        Some(raw) => serde_json::from_str(raw).map_err(RuntimeError::internal)?,
                        None => serde_json::Value::Null,
                    };
                    let result = task_engine.execute(name, task_args).await?;
                    tracing::info!(task = %name, ?result, "task command completed");
                    Ok(())
                })
            }),
        );
    }

    /// `start()`: `initialize()` if needed → `BeforeStart` → (Api workers
    /// only) start every transport → `AfterStart`. Enters `Running`.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        if self.state() == LifecycleState::Created {
            self.initialize().await?;
        }
        self.require(&[LifecycleState::Initialized], "start")?;
        self.set_state(LifecycleState::Starting);

        self.hooks.call(HookKind::BeforeStart, CallOptions::sequential()).await?;

        if self.role == WorkerRole::Api {
            self.start_transports().await?;
        }

        self.hooks.call(HookKind::AfterStart, CallOptions::sequential()).await?;
        self.set_state(LifecycleState::Running);
        tracing::info!(role = ?self.role, "application running");
        Ok(())
    }

    async fn start_transports(&self) -> Result<(), RuntimeError> {
        if self.transports.is_empty() {
            return Ok(());
        }
        let mut failures = 0;
        for transport in &self.transports {
            if let Err(e) = transport.start().await {
                tracing::error!(transport = transport.name(), error = %e, "transport failed to start");
                failures += 1;
            }
        }
        if failures == self.transports.len() {
            return Err(RuntimeError::internal(std::io::Error::new(
                std::io::ErrorKind::Other,
                "all transports failed to start",
            )));
        }
        Ok(())
    }

    /// `stop()`: `BeforeStop` → stop transports (failures logged) →
    /// `AfterStop` → `terminate()`.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.require(&[LifecycleState::Running], "stop")?;
        self.set_state(LifecycleState::Stopping);

        self.hooks.call(HookKind::BeforeStop, CallOptions::sequential()).await.ok();

        for transport in &self.transports {
            if let Err(e) = transport.stop().await {
                tracing::error!(transport = transport.name(), error = %e, "transport failed to stop");
            }
        }

        self.hooks.call(HookKind::AfterStop, CallOptions::sequential()).await.ok();

        self.terminate().await
    }

    /// `terminate()`: `BeforeTerminate` (reverse, sequential) →
    /// `container.dispose()` → `registry.clear()` → `AfterTerminate`
    /// (reverse, sequential). Idempotent.
    pub async fn terminate(&self) -> Result<(), RuntimeError> {
        if self.state() == LifecycleState::Terminated {
            return Ok(());
        }
        self.set_state(LifecycleState::Terminating);

        self.hooks
            .call(HookKind::BeforeTerminate, CallOptions::sequential().reverse())
            .await
            .ok();

        self.container.dispose().await;
        self.registry.clear();

        self.hooks
            .call(HookKind::AfterTerminate, CallOptions::sequential().reverse())
            .await
            .ok();

        self.set_state(LifecycleState::Terminated);
        tracing::info!("application terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn app(role: WorkerRole) -> Application {
        Application::new(Arc::new(Registry::new()), Container::root(), Arc::new(HookEngine::new()), role)
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_terminated() {
        let a = app(WorkerRole::Task);
        a.start().await.unwrap();
        assert_eq!(a.state(), LifecycleState::Running);
        a.stop().await.unwrap();
        assert_eq!(a.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn terminate_called_twice_is_a_no_op() {
        let a = app(WorkerRole::Task);
        a.start().await.unwrap();
        a.terminate().await.unwrap();
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        a.hooks.on(HookKind::AfterTerminate, move || {
            let c = c.clone();
            async move {
                *c.lock().unwrap() += 1;
                Ok(())
            }
        });
        a.terminate().await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn start_from_stopping_is_invalid_state() {
        let a = app(WorkerRole::Task);
        a.start().await.unwrap();
        a.set_state(LifecycleState::Stopping);
        let err = a.start().await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState(_)));
    }

    #[tokio::test]
    async fn ordered_shutdown_hooks_fire_in_expected_order() {
        let a = app(WorkerRole::Api);
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        for (kind, label) in [
            (HookKind::BeforeStop, "before-stop"),
            (HookKind::AfterStop, "after-stop"),
        ] {
            let log = log.clone();
            a.hooks.on(kind, move || {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(label);
                    Ok(())
                }
            });
        }
        for (i, label) in ["term-0", "term-1"].into_iter().enumerate() {
            let log = log.clone();
            let _ = i;
            a.hooks.on(HookKind::BeforeTerminate, move || {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(label);
                    Ok(())
                }
            });
        }

        a.start().await.unwrap();
        a.stop().await.unwrap();

        let observed = log.lock().unwrap().clone();
        assert_eq!(observed[0], "before-stop");
        assert_eq!(observed[1], "after-stop");
        // BeforeTerminate runs reverse of registration order.
        assert_eq!(observed[2], "term-1");
        assert_eq!(observed[3], "term-0");
    }
}
