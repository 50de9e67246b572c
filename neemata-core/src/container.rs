//! Scoped dependency injection.
//!
//! Mirrors the shape of `r2e_core::beans` (a registry of factories
//! resolved against a shared context) but generalized for *scoped*
//! resolution: a [`Provider`] is tagged with a [`Scope`] and a value is
//! cached at the container whose scope matches, not in one flat graph.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::sync::OnceCell;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type AnyValue = Arc<dyn Any + Send + Sync>;
type DisposeFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), DisposeError>> + Send>;

/// The ordered lifetime tiers a provider's value may be cached at.
///
/// `Global ⊂ Connection ⊂ Call`: a provider tagged with a broader scope is
/// visible to narrower containers, never the reverse. [`ScopeTag::Transient`]
/// is not part of this chain — it means "never cache", see [`Scope`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeTag {
    Global = 0,
    Connection = 1,
    Call = 2,
}

impl fmt::Display for ScopeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeTag::Global => write!(f, "global"),
            ScopeTag::Connection => write!(f, "connection"),
            ScopeTag::Call => write!(f, "call"),
        }
    }
}

/// A provider's declared scope: one of the three container tiers, or
/// [`Scope::Transient`] which bypasses caching entirely — a transient
/// provider is reconstructed on every `resolve`, in whichever container
/// asked for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Tagged(ScopeTag),
    Transient,
}

impl From<ScopeTag> for Scope {
    fn from(tag: ScopeTag) -> Self {
        Scope::Tagged(tag)
    }
}

/// Identity of a registered provider. Providers are identity-addressed:
/// two providers that build the same Rust type are still distinct unless
/// they share a `ProviderId` — generated once, at registration time, not
/// derived from `TypeId`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

impl ProviderId {
    fn next() -> Self {
        ProviderId(NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Errors raised while resolving or disposing the container graph.
#[derive(Debug)]
pub enum ContainerError {
    /// `P.scope` is a strict descendant of the resolving container's scope.
    ScopeMismatch { provider: String, scope: Scope, container_scope: ScopeTag },
    /// The provider's factory returned an error.
    FactoryFailed { provider: String, message: String },
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::ScopeMismatch { provider, scope, container_scope } => write!(
                f,
                "provider '{provider}' is scoped {scope:?} but container is scoped {container_scope} (descendant scopes cannot be resolved from a shallower container)"
            ),
            ContainerError::FactoryFailed { provider, message } => {
                write!(f, "factory for provider '{provider}' failed: {message}")
            }
        }
    }
}

impl std::error::Error for ContainerError {}

#[derive(Debug)]
pub struct DisposeError(pub String);

impl fmt::Display for DisposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Factory<V> = Arc<
    dyn Fn(Arc<Container>) -> BoxFuture<'static, Result<V, ContainerError>> + Send + Sync,
>;
type Disposer<V> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<(), DisposeError>> + Send + Sync>;

/// A description of how to construct a value of type `V`: a factory, a
/// scope, and an optional disposer. Immutable once built; cloning a
/// `Provider` clones the handle, not the identity (two clones still
/// resolve to the same cached instance).
pub struct Provider<V: Clone + Send + Sync + 'static> {
    id: ProviderId,
    scope: Scope,
    description: String,
    factory: Factory<V>,
    disposer: Option<Disposer<V>>,
}

impl<V: Clone + Send + Sync + 'static> Clone for Provider<V> {
    fn clone(&self) -> Self {
        Provider {
            id: self.id,
            scope: self.scope,
            description: self.description.clone(),
            factory: self.factory.clone(),
            disposer: self.disposer.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Provider<V> {
    /// Declare a provider. `factory` receives the resolving [`Container`]
    /// and is expected to call [`Container::resolve`] on whatever other
    /// providers it depends on — dependency resolution is recursive and
    /// lazy, not precomputed as a topological sort.
    pub fn new<F, Fut>(description: impl Into<String>, scope: impl Into<Scope>, factory: F) -> Self
    where
        F: Fn(Arc<Container>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ContainerError>> + Send + 'static,
    {
        Provider {
            id: ProviderId::next(),
            scope: scope.into(),
            description: description.into(),
            factory: Arc::new(move |c| Box::pin(factory(c))),
            disposer: None,
        }
    }

    /// Attach a disposer, invoked (in reverse resolution order) when the
    /// owning container is disposed.
    pub fn with_disposer<F, Fut>(mut self, disposer: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DisposeError>> + Send + 'static,
    {
        self.disposer = Some(Arc::new(move |v| Box::pin(disposer(v))));
        self
    }

    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Object-safe handle used by [`Container::load`] to eagerly resolve a
/// heterogeneous set of "eager root" providers without the caller having
/// to know their concrete `V`.
#[async_trait::async_trait]
pub trait EagerRoot: Send + Sync {
    async fn load(&self, container: &Arc<Container>) -> Result<(), ContainerError>;
    fn description(&self) -> &str;
}

#[async_trait::async_trait]
impl<V: Clone + Send + Sync + 'static> EagerRoot for Provider<V> {
    async fn load(&self, container: &Arc<Container>) -> Result<(), ContainerError> {
        container.resolve(self).await.map(|_| ())
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// A scoped resolver. Created by a parent via [`Container::create_scope`],
/// or as the root `Global` container via [`Container::root`].
pub struct Container {
    parent: Option<Arc<Container>>,
    scope: ScopeTag,
    cache: DashMap<ProviderId, Arc<OnceCell<AnyValue>>>,
    /// Resolution order, append-only; disposal walks this in reverse.
    disposal_order: Mutex<Vec<(ProviderId, DisposeFn)>>,
    children: Mutex<Vec<Weak<Container>>>,
    disposed: std::sync::atomic::AtomicBool,
}

impl Container {
    /// Create the root `Global`-scope container.
    pub fn root() -> Arc<Self> {
        Arc::new(Container {
            parent: None,
            scope: ScopeTag::Global,
            cache: DashMap::new(),
            disposal_order: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            disposed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Create a child container one (or more) tiers deeper than `self`.
    pub fn create_scope(self: &Arc<Self>, scope: ScopeTag) -> Arc<Container> {
        let child = Arc::new(Container {
            parent: Some(self.clone()),
            scope,
            cache: DashMap::new(),
            disposal_order: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            disposed: std::sync::atomic::AtomicBool::new(false),
        });
        self.children.lock().unwrap().push(Arc::downgrade(&child));
        child
    }

    pub fn scope(&self) -> ScopeTag {
        self.scope
    }

    /// Pre-seed an already-constructed instance — `provider`'s factory is
    /// never invoked. The value still participates in disposal.
    pub fn provide<V: Clone + Send + Sync + 'static>(self: &Arc<Self>, provider: &Provider<V>, value: V) {
        let cell = self.cell_for(provider.id);
        // `set` only succeeds once; a provider that is pre-seeded twice
        // keeps its first value, matching "immutable after first registration".
        let _ = cell.set(Arc::new(value.clone()) as AnyValue);
        self.record_disposal(provider.id, provider.disposer.clone(), value);
    }

    fn cell_for(&self, id: ProviderId) -> Arc<OnceCell<AnyValue>> {
        self.cache.entry(id).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    }

    fn find_cached<V: Clone + Send + Sync + 'static>(&self, id: ProviderId) -> Option<V> {
        let mut cur = self;
        loop {
            if let Some(cell) = cur.cache.get(&id) {
                if let Some(any) = cell.get() {
                    return any.clone().downcast::<V>().ok().map(|v| (*v).clone());
                }
            }
            match &cur.parent {
                Some(p) => cur = p,
                None => return None,
            }
        }
    }

    fn find_owner(self: &Arc<Self>, scope: ScopeTag) -> Option<Arc<Self>> {
        let mut cur = self.clone();
        loop {
            if cur.scope == scope {
                return Some(cur);
            }
            match cur.parent.clone() {
                Some(p) => cur = p,
                None => return None,
            }
        }
    }

    fn record_disposal<V: Clone + Send + Sync + 'static>(
        &self,
        id: ProviderId,
        disposer: Option<Disposer<V>>,
        value: V,
    ) {
        if let Some(disposer) = disposer {
            let dispose_fn: DisposeFn = Box::new(move || disposer(value));
            self.disposal_order.lock().unwrap().push((id, dispose_fn));
        }
    }

    /// Resolve `provider` within this container, per the algorithm in the
    /// component design: cache lookup in self-or-ancestors first, then
    /// same-scope construction, ancestor delegation, or `ScopeMismatch`.
    pub async fn resolve<V: Clone + Send + Sync + 'static>(
        self: &Arc<Self>,
        provider: &Provider<V>,
    ) -> Result<V, ContainerError> {
        if let Some(cached) = self.find_cached::<V>(provider.id) {
            return Ok(cached);
        }
        match provider.scope {
            Scope::Transient => (provider.factory)(self.clone()).await,
            Scope::Tagged(tag) if tag == self.scope => self.construct(provider).await,
            Scope::Tagged(tag) if tag < self.scope => {
                let owner = self.find_owner(tag).ok_or_else(|| ContainerError::ScopeMismatch {
                    provider: provider.description.clone(),
                    scope: provider.scope,
                    container_scope: self.scope,
                })?;
                Box::pin(owner.resolve(provider)).await
            }
            Scope::Tagged(_) => Err(ContainerError::ScopeMismatch {
                provider: provider.description.clone(),
                scope: provider.scope,
                container_scope: self.scope,
            }),
        }
    }

    /// Construct (or await an in-flight construction of) `provider` in
    /// this exact container. Single-flight: concurrent callers share the
    /// same `OnceCell::get_or_try_init` future.
    async fn construct<V: Clone + Send + Sync + 'static>(
        self: &Arc<Self>,
        provider: &Provider<V>,
    ) -> Result<V, ContainerError> {
        let cell = self.cell_for(provider.id);
        let this = self.clone();
        let provider = provider.clone();
        let any = cell
            .get_or_try_init(|| async {
                let value = (provider.factory)(this.clone()).await?;
                this.record_disposal(provider.id, provider.disposer.clone(), value.clone());
                Ok::<AnyValue, ContainerError>(Arc::new(value) as AnyValue)
            })
            .await?;
        Ok(any.clone().downcast::<V>().expect("provider id/type mismatch").as_ref().clone())
    }

    /// Eagerly resolve every root in `roots` (and transitively, everything
    /// they depend on) within this container. Surfaces the first error
    /// instead of starting to serve with a broken graph.
    pub async fn load(self: &Arc<Self>, roots: &[Arc<dyn EagerRoot>]) -> Result<(), ContainerError> {
        for root in roots {
            root.load(self).await?;
        }
        Ok(())
    }

    /// Dispose this container: children first, then this container's own
    /// cache in strict reverse resolution order. Idempotent — a second
    /// call is a no-op. Disposer failures are logged, never propagated.
    pub async fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children: Vec<_> = std::mem::take(&mut *self.children.lock().unwrap());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.dispose().await;
            }
        }
        let order = std::mem::take(&mut *self.disposal_order.lock().unwrap());
        for (id, dispose_fn) in order.into_iter().rev() {
            if let Err(err) = dispose_fn().await {
                tracing::error!(provider_id = ?id, error = %err, "disposer failed; continuing teardown");
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// A non-generic snapshot used only for diagnostics/printing — container
/// internals otherwise stay behind `resolve`/`provide`.
pub struct ContainerStats {
    pub scope: ScopeTag,
    pub cached_count: usize,
}

impl Container {
    pub fn stats(&self) -> ContainerStats {
        ContainerStats { scope: self.scope, cached_count: self.cache.len() }
    }
}
