//! Module tree, procedure/task/command registration, and the flattening
//! `load()`/`clear()` pass.
//!
//! Modeled on `r2e_core::builder::AppBuilder`'s fluent registration (here,
//! [`ModuleBuilder`]) plus `r2e_core::meta::MetaRegistry`'s "collect, then
//! walk once" shape, but namespaced the way spec.md §4.2 asks: modules
//! nest, and `Registry::load()` flattens the tree into dotted names
//! (`orders.create`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::connection::CallContext;
use crate::container::Container;
use crate::error::RuntimeError;
use crate::schema::{AnySchema, Schema};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type GuardFn = Arc<dyn Fn(Arc<CallContext>) -> BoxFuture<'static, Result<bool, RuntimeError>> + Send + Sync>;
pub type HandlerFn =
    Arc<dyn Fn(Arc<CallContext>, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, RuntimeError>> + Send + Sync>;
/// A middleware wraps the rest of the chain (including the handler) as
/// `next`, matching "middlewares as nested handlers (outermost first)"
/// from §4.4 step 7.
pub type Next = Arc<dyn Fn(Arc<CallContext>, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, RuntimeError>> + Send + Sync>;
pub type MiddlewareFn =
    Arc<dyn Fn(Arc<CallContext>, serde_json::Value, Next) -> BoxFuture<'static, Result<serde_json::Value, RuntimeError>> + Send + Sync>;
pub type TaskFn =
    Arc<dyn Fn(Arc<Container>, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, RuntimeError>> + Send + Sync>;
pub type CommandFn = Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<(), RuntimeError>> + Send + Sync>;

/// A named request/response handler (§3). Immutable after registration.
pub struct Procedure {
    pub name: String,
    pub input_schema: Arc<dyn Schema>,
    pub output_schema: Arc<dyn Schema>,
    pub guards: Vec<GuardFn>,
    pub middlewares: Vec<MiddlewareFn>,
    pub handler: HandlerFn,
    pub timeout: Option<Duration>,
}

/// A named background unit of work (§3), executable locally or offloaded.
pub struct Task {
    pub name: String,
    pub arg_schema: Arc<dyn Schema>,
    pub function: TaskFn,
    pub local_only: bool,
    pub timeout: Option<Duration>,
}

/// A namespaced bundle of procedures, tasks, and nested modules.
#[derive(Default)]
pub struct Module {
    pub name: String,
    pub procedures: HashMap<String, Procedure>,
    pub tasks: HashMap<String, Task>,
    pub submodules: HashMap<String, Module>,
}

impl Module {
    /// Shallow-merge `other` into `self` (§4.2): procedure and task names
    /// shared by both are overridden by `other`'s entry; submodules sharing
    /// a name are merged recursively rather than replaced wholesale.
    fn merge(&mut self, other: Module) {
        for (name, procedure) in other.procedures {
            self.procedures.insert(name, procedure);
        }
        for (name, task) in other.tasks {
            self.tasks.insert(name, task);
        }
        for (name, submodule) in other.submodules {
            match self.submodules.remove(&name) {
                Some(mut existing) => {
                    existing.merge(submodule);
                    self.submodules.insert(name, existing);
                }
                None => {
                    self.submodules.insert(name, submodule);
                }
            }
        }
    }
}

/// Fluent module assembly, mirroring `AppBuilder`'s `.provide()`/`.with()`
/// chaining style.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ModuleBuilder { module: Module { name: name.into(), ..Default::default() } }
    }

    pub fn procedure(mut self, procedure: Procedure) -> Self {
        self.module.procedures.insert(procedure.name.clone(), procedure);
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.module.tasks.insert(task.name.clone(), task);
        self
    }

    pub fn module(mut self, submodule: Module) -> Self {
        match self.module.submodules.remove(&submodule.name) {
            Some(mut existing) => {
                existing.merge(submodule);
                self.module.submodules.insert(existing.name.clone(), existing);
            }
            None => {
                self.module.submodules.insert(submodule.name.clone(), submodule);
            }
        }
        self
    }

    pub fn build(self) -> Module {
        self.module
    }
}

/// A procedure builder defaulting to an any-accepting schema and no
/// guards/middlewares, so a minimal procedure needs only a name and
/// handler.
pub struct ProcedureBuilder {
    procedure: Procedure,
}

impl ProcedureBuilder {
    pub fn new(name: impl Into<String>, handler: HandlerFn) -> Self {
        ProcedureBuilder {
            procedure: Procedure {
                name: name.into(),
                input_schema: Arc::new(AnySchema),
                output_schema: Arc::new(AnySchema),
                guards: Vec::new(),
                middlewares: Vec::new(),
                handler,
                timeout: None,
            },
        }
    }

    pub fn input_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.procedure.input_schema = schema;
        self
    }

    pub fn output_schema(mut self, schema: Arc<dyn Schema>) -> Self {
        self.procedure.output_schema = schema;
        self
    }

    pub fn guard(mut self, guard: GuardFn) -> Self {
        self.procedure.guards.push(guard);
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareFn) -> Self {
        self.procedure.middlewares.push(middleware);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.procedure.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Procedure {
        self.procedure
    }
}

/// Collects modules, commands, and (via flattening) procedures/tasks;
/// fails with `DuplicateName` on namespace collision. Hook bindings live
/// on [`crate::hooks::HookEngine`] — the registry only owns the
/// module/procedure/task/command tree per §4.2.
#[derive(Default)]
pub struct Registry {
    modules: Mutex<HashMap<String, Module>>,
    procedures: DashMap<String, Arc<Procedure>>,
    tasks: DashMap<String, Arc<Task>>,
    commands: DashMap<(String, String), CommandFn>,
    loaded: std::sync::atomic::AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a top-level module. Must be called before `load()`. A
    /// second registration under a name already present is shallow-merged
    /// into the existing module rather than replacing it (§4.2).
    pub fn register_module(&self, module: Module) {
        let mut modules = self.modules.lock().unwrap();
        match modules.remove(&module.name) {
            Some(mut existing) => {
                existing.merge(module);
                modules.insert(existing.name.clone(), existing);
            }
            None => {
                modules.insert(module.name.clone(), module);
            }
        }
    }

    pub fn register_command(&self, namespace: impl Into<String>, name: impl Into<String>, f: CommandFn) {
        self.commands.insert((namespace.into(), name.into()), f);
    }

    /// Recursively walk the registered module tree, flattening procedures
    /// and tasks into dotted names. Fails with `DuplicateName` on
    /// collision within the flattened namespace.
    pub fn load(&self) -> Result<(), RuntimeError> {
        self.procedures.clear();
        self.tasks.clear();
        let modules = self.modules.lock().unwrap();
        for module in modules.values() {
            self.flatten(module, None)?;
        }
        self.loaded.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn flatten(&self, module: &Module, prefix: Option<&str>) -> Result<(), RuntimeError> {
        let base = match prefix {
            Some(p) => format!("{p}.{}", module.name),
            None => module.name.clone(),
        };
        for (name, procedure) in &module.procedures {
            let dotted = format!("{base}.{name}");
            if self.procedures.contains_key(&dotted) {
                return Err(RuntimeError::DuplicateName(dotted));
            }
            self.procedures.insert(
                dotted,
                Arc::new(Procedure {
                    name: procedure.name.clone(),
                    input_schema: procedure.input_schema.clone(),
                    output_schema: procedure.output_schema.clone(),
                    guards: procedure.guards.clone(),
                    middlewares: procedure.middlewares.clone(),
                    handler: procedure.handler.clone(),
                    timeout: procedure.timeout,
                }),
            );
        }
        for (name, task) in &module.tasks {
            let dotted = format!("{base}.{name}");
            if self.tasks.contains_key(&dotted) {
                return Err(RuntimeError::DuplicateName(dotted));
            }
            self.tasks.insert(
                dotted,
                Arc::new(Task {
                    name: task.name.clone(),
                    arg_schema: task.arg_schema.clone(),
                    function: task.function.clone(),
                    local_only: task.local_only,
                    timeout: task.timeout,
                }),
            );
        }
        for submodule in module.submodules.values() {
            self.flatten(submodule, Some(&base))?;
        }
        Ok(())
    }

    pub fn procedure(&self, dotted_name: &str) -> Option<Arc<Procedure>> {
        self.procedures.get(dotted_name).map(|e| e.clone())
    }

    pub fn task(&self, dotted_name: &str) -> Option<Arc<Task>> {
        self.tasks.get(dotted_name).map(|e| e.clone())
    }

    pub fn command(&self, namespace: &str, name: &str) -> Option<CommandFn> {
        self.commands.get(&(namespace.to_string(), name.to_string())).map(|e| e.clone())
    }

    pub fn procedure_names(&self) -> Vec<String> {
        self.procedures.iter().map(|e| e.key().clone()).collect()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }

    /// Clear all registered state. Callers must dispose the container
    /// beforehand per §4.2 ("After `clear()` the registry may be
    /// re-populated; the container must be disposed beforehand").
    pub fn clear(&self) {
        self.modules.lock().unwrap().clear();
        self.procedures.clear();
        self.tasks.clear();
        self.commands.clear();
        self.loaded.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Write a hierarchical listing to the tracing sink, mirroring
    /// `r2e_core`'s startup route table log.
    pub fn print(&self) {
        tracing::info!("registry: {} procedure(s), {} task(s)", self.procedures.len(), self.tasks.len());
        for name in self.procedure_names() {
            tracing::info!("  procedure {name}");
        }
        for name in self.task_names() {
            tracing::info!("  task {name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> HandlerFn {
        Arc::new(|_ctx, input| Box::pin(async move { Ok(input) }))
    }

    fn noop_task() -> TaskFn {
        Arc::new(|_container, args| Box::pin(async move { Ok(args) }))
    }

    #[test]
    fn load_flattens_nested_modules_into_dotted_names() {
        let registry = Registry::new();
        let inner = ModuleBuilder::new("create")
            .procedure(ProcedureBuilder::new("create", noop_handler()).build())
            .build();
        let orders = ModuleBuilder::new("orders").module(inner).build();
        registry.register_module(orders);
        registry.load().unwrap();
        // "orders.create.create" — module nesting flattens fully, the
        // leaf module's own name is the final segment.
        assert!(registry.procedure("orders.create.create").is_some());
    }

    #[test]
    fn load_top_level_procedure_is_addressable() {
        let registry = Registry::new();
        let orders = ModuleBuilder::new("orders")
            .procedure(ProcedureBuilder::new("list", noop_handler()).build())
            .task(Task {
                name: "reindex".into(),
                arg_schema: Arc::new(AnySchema),
                function: noop_task(),
                local_only: false,
                timeout: None,
            })
            .build();
        registry.register_module(orders);
        registry.load().unwrap();
        assert!(registry.procedure("orders.list").is_some());
        assert!(registry.task("orders.reindex").is_some());
    }

    #[test]
    fn duplicate_name_within_namespace_fails_load() {
        let registry = Registry::new();
        // "orders" with submodule "x" holding procedure "create" flattens
        // to "orders.x.create"; a top-level module literally named
        // "orders.x" holding procedure "create" flattens to the same
        // dotted name — a genuine collision between two distinct
        // top-level module registrations.
        registry.register_module(
            ModuleBuilder::new("orders")
                .module(ModuleBuilder::new("x").procedure(ProcedureBuilder::new("create", noop_handler()).build()).build())
                .build(),
        );
        registry.register_module(
            ModuleBuilder::new("orders.x").procedure(ProcedureBuilder::new("create", noop_handler()).build()).build(),
        );
        let err = registry.load();
        assert!(matches!(err, Err(RuntimeError::DuplicateName(_))));
    }

    #[test]
    fn second_registration_of_same_name_shallow_merges() {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("orders")
                .procedure(ProcedureBuilder::new("list", noop_handler()).build())
                .module(ModuleBuilder::new("items").procedure(ProcedureBuilder::new("count", noop_handler()).build()).build())
                .build(),
        );
        // A later registration under the same top-level name adds a
        // sibling procedure and extends the existing "items" submodule
        // rather than discarding what the first registration contributed.
        registry.register_module(
            ModuleBuilder::new("orders")
                .procedure(ProcedureBuilder::new("create", noop_handler()).build())
                .module(ModuleBuilder::new("items").procedure(ProcedureBuilder::new("add", noop_handler()).build()).build())
                .build(),
        );
        registry.load().unwrap();
        assert!(registry.procedure("orders.list").is_some());
        assert!(registry.procedure("orders.create").is_some());
        assert!(registry.procedure("orders.items.count").is_some());
        assert!(registry.procedure("orders.items.add").is_some());
    }

    #[test]
    fn clear_then_load_reproduces_same_names() {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("orders").procedure(ProcedureBuilder::new("list", noop_handler()).build()).build(),
        );
        registry.load().unwrap();
        let before = registry.procedure_names();
        registry.clear();
        registry.register_module(
            ModuleBuilder::new("orders").procedure(ProcedureBuilder::new("list", noop_handler()).build()).build(),
        );
        registry.load().unwrap();
        let after = registry.procedure_names();
        assert_eq!(before, after);
    }
}
