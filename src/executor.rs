//! Executor model
//!
//! An executor is an immutable node record: an async factory, a dependency
//! specification, and metadata tags. The four kinds (main, lazy, reactive,
//! static) form a closed variant; the lazy/reactive/static wrappers are
//! alternate dependency specifications pointing at the same main executor
//! identity, which is the key used for caching and ownership.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_stream::{Stream, StreamExt};

use crate::accessor::ErasedAccessor;
use crate::deps::Deps;
use crate::error::{ErrorContext, Stage, WeftError};
use crate::scope::Scope;
use crate::tag::{name_tag, TagId, TagSource, TaggedValue};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Values cached by a scope are type-erased behind `Arc`
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Process-unique executor identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(pub(crate) u64);

impl ExecutorId {
    fn next() -> Self {
        ExecutorId(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "executor#{}", self.0)
    }
}

/// The closed set of executor kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Main,
    Lazy,
    Reactive,
    Static,
}

/// How a dependency reference delivers its target to the factory
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Plain,
    Lazy,
    Reactive,
    Static,
}

/// Erased dependency reference
#[doc(hidden)]
#[derive(Clone)]
pub struct DepRef {
    pub(crate) kind: DepKind,
    pub(crate) target: Arc<ExecutorCore>,
}

/// Dependency arrangement as declared
#[doc(hidden)]
#[derive(Clone, Default)]
pub enum DepSpec {
    #[default]
    None,
    Single(DepRef),
    List(Vec<DepRef>),
    Map(Vec<(Arc<str>, DepRef)>),
}

/// One resolved dependency as handed to factory extraction
#[doc(hidden)]
pub struct ResolvedDep {
    pub(crate) name: Arc<str>,
    pub(crate) payload: DepPayload,
}

#[doc(hidden)]
pub enum DepPayload {
    Value(AnyValue),
    Accessor(ErasedAccessor),
}

/// Resolved dependencies in the declared arrangement
#[doc(hidden)]
pub enum ResolvedDeps {
    None,
    Single(ResolvedDep),
    List(Vec<ResolvedDep>),
    Map(Vec<(Arc<str>, ResolvedDep)>),
}

pub(crate) type FactoryFuture = BoxFuture<'static, Result<AnyValue, WeftError>>;
pub(crate) type BoxedFactory = Arc<dyn Fn(ResolvedDeps, Ctl) -> FactoryFuture + Send + Sync>;

/// Immutable executor record shared by an executor and its kind wrappers
pub(crate) struct ExecutorCore {
    pub(crate) id: ExecutorId,
    pub(crate) factory: Option<BoxedFactory>,
    pub(crate) dependencies: DepSpec,
    pub(crate) tags: Vec<TaggedValue>,
}

impl ExecutorCore {
    /// Best-effort display name: the name tag, else `executor#N`
    pub(crate) fn name(&self) -> Arc<str> {
        match name_tag().find(&self.tags) {
            Some(n) => Arc::from(n.as_str()),
            None => Arc::from(self.id.to_string()),
        }
    }
}

/// A main executor producing values of type `T`
pub struct Executor<T> {
    pub(crate) core: Arc<ExecutorCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Executor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.core.id)
            .field("name", &self.core.name())
            .finish()
    }
}

impl<T> Executor<T> {
    pub(crate) fn from_parts(factory: Option<BoxedFactory>, dependencies: DepSpec) -> Self {
        Self {
            core: Arc::new(ExecutorCore {
                id: ExecutorId::next(),
                factory,
                dependencies,
                tags: Vec::new(),
            }),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ExecutorId {
        self.core.id
    }

    pub fn name(&self) -> Arc<str> {
        self.core.name()
    }

    pub fn kind(&self) -> ExecutorKind {
        ExecutorKind::Main
    }

    pub fn is_main(&self) -> bool {
        true
    }

    /// Lazy sibling: the factory receives an accessor, no resolution happens
    pub fn lazy(&self) -> LazyRef<T> {
        LazyRef(self.clone())
    }

    /// Reactive sibling: the dependent is re-resolved when the target updates
    pub fn reactive(&self) -> ReactiveRef<T> {
        ReactiveRef(self.clone())
    }

    /// Static sibling: the factory receives an accessor, resolved eagerly
    pub fn static_ref(&self) -> StaticRef<T> {
        StaticRef(self.clone())
    }

    /// Metadata tags carried by this executor
    pub fn tags(&self) -> &[TaggedValue] {
        &self.core.tags
    }

    /// Attach a tagged value, keeping the executor identity
    pub fn with_tag(self, tag: TaggedValue) -> Self {
        let mut tags = self.core.tags.clone();
        tags.push(tag);
        self.rebuild(tags)
    }

    pub fn with_tags(self, extra: impl IntoIterator<Item = TaggedValue>) -> Self {
        let mut tags = self.core.tags.clone();
        tags.extend(extra);
        self.rebuild(tags)
    }

    /// Attach a display name (shorthand for the name tag)
    pub fn named(self, name: impl Into<String>) -> Self {
        let value = serde_json::Value::String(name.into());
        let tag = TaggedValue::new(name_tag().id(), Some(Arc::from("name")), value);
        self.with_tag(tag)
    }

    /// Erased handle for registries and diagnostics
    pub fn erase(&self) -> ErasedExecutor {
        ErasedExecutor {
            core: Arc::clone(&self.core),
        }
    }

    fn rebuild(self, tags: Vec<TaggedValue>) -> Self {
        Self {
            core: Arc::new(ExecutorCore {
                id: self.core.id,
                factory: self.core.factory.clone(),
                dependencies: self.core.dependencies.clone(),
                tags,
            }),
            _marker: PhantomData,
        }
    }
}

impl<T> TagSource for Executor<T> {
    fn lookup(&self, key: TagId) -> Option<serde_json::Value> {
        self.core.tags.lookup(key)
    }

    fn lookup_all(&self, key: TagId) -> Vec<serde_json::Value> {
        self.core.tags.lookup_all(key)
    }
}

macro_rules! kind_wrapper {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        pub struct $name<T>(pub(crate) Executor<T>);

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self(self.0.clone())
            }
        }

        impl<T> $name<T> {
            /// Identity of the main executor this wrapper points at
            pub fn id(&self) -> ExecutorId {
                self.0.id()
            }

            pub fn name(&self) -> Arc<str> {
                self.0.name()
            }

            pub fn kind(&self) -> ExecutorKind {
                $kind
            }

            pub fn is_main(&self) -> bool {
                false
            }

            /// The main executor behind this wrapper
            pub fn main(&self) -> Executor<T> {
                self.0.clone()
            }
        }
    };
}

kind_wrapper!(
    /// Lazy dependency reference to a main executor
    LazyRef,
    ExecutorKind::Lazy
);
kind_wrapper!(
    /// Reactive dependency reference to a main executor
    ReactiveRef,
    ExecutorKind::Reactive
);
kind_wrapper!(
    /// Static dependency reference to a main executor
    StaticRef,
    ExecutorKind::Static
);

/// Type-erased executor handle for registries and release sweeps
#[derive(Clone)]
pub struct ErasedExecutor {
    pub(crate) core: Arc<ExecutorCore>,
}

impl ErasedExecutor {
    pub fn id(&self) -> ExecutorId {
        self.core.id
    }

    pub fn name(&self) -> Arc<str> {
        self.core.name()
    }

    pub fn tags(&self) -> &[TaggedValue] {
        &self.core.tags
    }
}

/// Controller handed to every factory invocation
#[derive(Clone)]
pub struct Ctl {
    pub(crate) scope: Scope,
    pub(crate) core: Arc<ExecutorCore>,
}

impl Ctl {
    /// The scope (or pod) this resolution runs in
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Register a cleanup; cleanups run LIFO on update, release and disposal
    pub fn cleanup<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), WeftError> + Send + 'static,
    {
        self.scope.register_cleanup(self.core.id, Box::new(f));
    }

    /// Soft-release this executor's own cache entry
    pub async fn release(&self) -> Result<(), WeftError> {
        self.scope.release_entry(self.core.id, true).await
    }

    /// Schedule a forced re-resolution of this executor
    pub fn reload(&self) {
        let scope = self.scope.clone();
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let _ = scope.resolve_core(core, true, Vec::new()).await;
        });
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }
}

fn erase_future<T, Fut>(fut: Fut) -> FactoryFuture
where
    T: Send + Sync + 'static,
    Fut: Future<Output = Result<T, WeftError>> + Send + 'static,
{
    Box::pin(async move { fut.await.map(|v| Arc::new(v) as AnyValue) })
}

/// Create a main executor with no dependencies
pub fn provide<T, F, Fut>(factory: F) -> Executor<T>
where
    T: Send + Sync + 'static,
    F: Fn(Ctl) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, WeftError>> + Send + 'static,
{
    let boxed: BoxedFactory = Arc::new(move |_deps, ctl| erase_future(factory(ctl)));
    Executor::from_parts(Some(boxed), DepSpec::None)
}

/// Create a main executor from a dependency arrangement and a factory
///
/// `deps` may be a single reference, a tuple, a `Vec`, or a
/// [`Named`](crate::deps::Named) map; the factory receives the resolved
/// values in the same arrangement.
pub fn derive<D, T, F, Fut>(deps: D, factory: F) -> Executor<T>
where
    D: Deps,
    T: Send + Sync + 'static,
    F: Fn(D::Output, Ctl) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, WeftError>> + Send + 'static,
{
    let spec = deps.spec();
    let boxed: BoxedFactory = Arc::new(move |resolved, ctl| match D::extract(resolved) {
        Ok(shaped) => erase_future(factory(shaped, ctl)),
        Err(e) => Box::pin(std::future::ready(Err(e))),
    });
    Executor::from_parts(Some(boxed), spec)
}

fn drain_stream<T, S>(stream: S, ctl: Ctl) -> FactoryFuture
where
    T: Send + Sync + 'static,
    S: Stream<Item = Result<T, WeftError>> + Send + 'static,
{
    Box::pin(async move {
        tokio::pin!(stream);
        let mut last: Option<T> = None;
        loop {
            if ctl.is_cancelled() {
                return Err(WeftError::Cancelled);
            }
            match stream.next().await {
                Some(item) => last = Some(item?),
                None => break,
            }
        }
        match last {
            Some(v) => Ok(Arc::new(v) as AnyValue),
            None => Err(WeftError::FactoryExecution {
                context: ErrorContext::new(ctl.core.name(), Vec::new(), Stage::FactoryExecution),
                message: "stream factory yielded no value".into(),
                source: None,
            }),
        }
    })
}

/// Like [`provide`], but the factory yields a stream; the engine drains it
/// and caches the final item
pub fn provide_stream<T, F, S>(factory: F) -> Executor<T>
where
    T: Send + Sync + 'static,
    F: Fn(Ctl) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<T, WeftError>> + Send + 'static,
{
    let boxed: BoxedFactory = Arc::new(move |_deps, ctl| drain_stream(factory(ctl.clone()), ctl));
    Executor::from_parts(Some(boxed), DepSpec::None)
}

/// Like [`derive`], but the factory yields a stream; the final item is cached
pub fn derive_stream<D, T, F, S>(deps: D, factory: F) -> Executor<T>
where
    D: Deps,
    T: Send + Sync + 'static,
    F: Fn(D::Output, Ctl) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<T, WeftError>> + Send + 'static,
{
    let spec = deps.spec();
    let boxed: BoxedFactory = Arc::new(move |resolved, ctl| match D::extract(resolved) {
        Ok(shaped) => drain_stream(factory(shaped, ctl.clone()), ctl),
        Err(e) => Box::pin(std::future::ready(Err(e))),
    });
    Executor::from_parts(Some(boxed), spec)
}

/// An executor whose factory always fails unless a preset substitutes it
pub fn placeholder<T>() -> Executor<T>
where
    T: Send + Sync + 'static,
{
    Executor::from_parts(None, DepSpec::None)
}

#[derive(Clone)]
pub(crate) enum PresetAction {
    Value(AnyValue),
    Substitute(Arc<ExecutorCore>),
}

/// Initial substitution applied on an executor's first resolve
#[derive(Clone)]
pub struct Preset {
    pub(crate) target: Arc<ExecutorCore>,
    pub(crate) action: PresetAction,
}

impl Preset {
    pub fn target_name(&self) -> Arc<str> {
        self.target.name()
    }

    /// True when this preset swaps in another executor's factory rather
    /// than a concrete value
    pub fn is_substitute(&self) -> bool {
        matches!(self.action, PresetAction::Substitute(_))
    }
}

/// Preset an executor to a concrete value; its factory is never invoked
pub fn preset<T>(target: &Executor<T>, value: T) -> Preset
where
    T: Send + Sync + 'static,
{
    Preset {
        target: Arc::clone(&target.core),
        action: PresetAction::Value(Arc::new(value)),
    }
}

/// Preset an executor to resolve through a substitute's factory and
/// dependencies while keeping the target's cache identity
pub fn preset_with<T>(target: &Executor<T>, substitute: &Executor<T>) -> Preset {
    Preset {
        target: Arc::clone(&target.core),
        action: PresetAction::Substitute(Arc::clone(&substitute.core)),
    }
}
