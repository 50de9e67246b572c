//! Lifecycle and connection hook engine.
//!
//! Mirrors the shape of `r2e_core::lifecycle` (`StartupHook`/`ShutdownHook`
//! as boxed `FnOnce` futures) but generalized to the closed set of hook
//! kinds in the component design and to *re-invocable* bindings — a
//! `HookEngine` is called once per lifecycle transition, not consumed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use crate::error::RuntimeError;

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send + 'a>>;
type HookFn = Box<dyn Fn() -> BoxFuture<'static> + Send + Sync>;

/// The closed set of hook kinds from the component design (§4.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeInitialize,
    AfterInitialize,
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
    BeforeTerminate,
    AfterTerminate,
    OnConnection,
    OnDisconnection,
}

impl HookKind {
    /// `*Initialize`/`*Start` kinds are "start-sensitive": the first
    /// failure in sequential mode aborts, and concurrent-mode failures are
    /// aggregated into a propagated error rather than only logged.
    pub fn is_start_sensitive(&self) -> bool {
        matches!(
            self,
            HookKind::BeforeInitialize
                | HookKind::AfterInitialize
                | HookKind::BeforeStart
                | HookKind::AfterStart
        )
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// How a set of bindings for one kind is invoked.
#[derive(Copy, Clone, Debug, Default)]
pub struct CallOptions {
    pub concurrent: bool,
    pub reverse: bool,
}

impl CallOptions {
    pub fn sequential() -> Self {
        CallOptions { concurrent: false, reverse: false }
    }

    pub fn concurrent() -> Self {
        CallOptions { concurrent: true, reverse: false }
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Aggregated failure from a concurrent hook call.
#[derive(Debug)]
pub struct MultiError(pub Vec<RuntimeError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hook(s) failed: ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Registry of hook bindings, keyed by kind, invoked in registration order
/// (or reverse) per `call`.
#[derive(Default)]
pub struct HookEngine {
    bindings: Mutex<Vec<(HookKind, HookFn)>>,
}

impl HookEngine {
    pub fn new() -> Self {
        HookEngine { bindings: Mutex::new(Vec::new()) }
    }

    /// Bind a hook to `kind`. The closure is re-invocable: it will be
    /// called every time `call(kind, ...)` runs, not consumed once.
    pub fn on<F, Fut>(&self, kind: HookKind, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RuntimeError>> + Send + 'static,
    {
        let boxed: HookFn = Box::new(move || Box::pin(f()));
        self.bindings.lock().unwrap().push((kind, boxed));
    }

    fn indices_for(&self, kind: HookKind) -> Vec<usize> {
        self.bindings
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, (k, _))| *k == kind)
            .map(|(i, _)| i)
            .collect()
    }

    async fn invoke_at(&self, idx: usize) -> Result<(), RuntimeError> {
        // Clone the future out from under the lock by re-grabbing the raw
        // pointer is unsound across await; instead we build the future
        // while holding the lock only long enough to get a raw call.
        let fut = {
            let bindings = self.bindings.lock().unwrap();
            let (_, f) = &bindings[idx];
            // Re-entrant call without holding the guard across .await:
            // HookFn is `Fn`, so invoking it here just builds the future;
            // polling happens after the lock is dropped.
            f()
        };
        fut.await
    }

    /// Invoke every binding registered for `kind`, per the sequential /
    /// concurrent semantics in §4.3. Returns `Ok` unless the kind's
    /// failure policy propagates an error (see `HookKind::is_start_sensitive`
    /// for sequential mode, or always for concurrent mode via `MultiError`).
    pub async fn call(&self, kind: HookKind, opts: CallOptions) -> Result<(), RuntimeError> {
        let mut indices = self.indices_for(kind);
        if opts.reverse {
            indices.reverse();
        }

        if opts.concurrent {
            let mut futs = Vec::with_capacity(indices.len());
            for idx in &indices {
                futs.push(self.invoke_at(*idx));
            }
            let results = futures_util::future::join_all(futs).await;
            let errors: Vec<RuntimeError> =
                results.into_iter().filter_map(Result::err).collect();
            if errors.is_empty() {
                return Ok(());
            }
            for e in &errors {
                tracing::error!(kind = %kind, error = %e, "hook failed");
            }
            if kind.is_start_sensitive() {
                return Err(RuntimeError::internal(MultiError(errors)));
            }
            return Ok(());
        }

        for idx in indices {
            if let Err(e) = self.invoke_at(idx).await {
                tracing::error!(kind = %kind, error = %e, "hook failed");
                if kind.is_start_sensitive() {
                    return Err(e);
                }
                // *Stop/*Terminate kinds: logged, remainder still runs.
            }
        }
        Ok(())
    }

    pub fn binding_count(&self, kind: HookKind) -> usize {
        self.indices_for(kind).len()
    }
}
