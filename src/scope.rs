//! Scope: the resolution engine
//!
//! A scope resolves executors lazily, caches their values, runs cleanups,
//! applies presets, and propagates updates to reactive dependents. All
//! mutable state lives inside the scope; the cache is a lock-free map and
//! every pending resolution is a shared future so concurrent callers await
//! the same work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::accessor::{downcast_value, Accessor, ErasedAccessor};
use crate::error::{ErrorContext, Stage, WeftError};
use crate::executor::{
    AnyValue, Ctl, DepKind, DepPayload, DepRef, DepSpec, ErasedExecutor, Executor, ExecutorCore,
    ExecutorId, Preset, PresetAction, ResolvedDep, ResolvedDeps,
};
use crate::extension::{run_chain, Extension, Operation, TerminalFn};
use crate::pod::Pod;
use crate::tag::{TagId, TagSource, TagStore, TaggedValue};

static NEXT_PENDING_SEQ: AtomicU64 = AtomicU64::new(1);

type SharedResolution = Shared<BoxFuture<'static, Result<AnyValue, WeftError>>>;

#[derive(Clone)]
pub(crate) enum CacheEntry {
    Pending { seq: u64, fut: SharedResolution },
    Resolved(AnyValue),
    Rejected(WeftError),
}

/// Erased cache state handed to accessors
pub(crate) enum ErasedState {
    Pending,
    Resolved(AnyValue),
    Rejected(WeftError),
}

/// Cache entry kind as reported by [`Scope::entries`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Resolved,
    Rejected,
}

pub(crate) type CleanupFn = Box<dyn FnOnce() -> Result<(), WeftError> + Send>;

type UpdateCallback = Arc<dyn Fn(ErasedAccessor) + Send + Sync>;
type ChangeListener = Arc<dyn Fn(&ChangeEvent) -> Option<AnyValue> + Send + Sync>;
type ReleaseListener = Arc<dyn Fn(&ReleaseEvent) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&WeftError) + Send + Sync>;

/// Why a change listener is being notified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Resolve,
    Update,
}

/// Pre-commit notification for every resolve and update.
///
/// A listener may return a replacement value, which overrides what gets
/// cached.
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub executor: Arc<str>,
    pub value: AnyValue,
    pub scope: Scope,
}

impl ChangeEvent {
    /// Typed view of the value about to be committed
    pub fn value_as<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.value.downcast_ref::<T>().cloned()
    }
}

/// Notification fired when an executor's cache entry is released
pub struct ReleaseEvent {
    pub executor: Arc<str>,
    pub scope: Scope,
    /// Failures collected from cleanups; the release itself never aborts
    pub cleanup_errors: Vec<WeftError>,
}

struct SubscriberSet {
    target: Arc<ExecutorCore>,
    dependents: Vec<Arc<ExecutorCore>>,
    callbacks: Vec<(u64, UpdateCallback)>,
}

pub(crate) enum UpdateAction {
    Value(AnyValue),
    Updater(Box<dyn FnOnce(Option<AnyValue>) -> Result<AnyValue, WeftError> + Send>),
}

pub(crate) struct ScopeInner {
    cache: DashMap<ExecutorId, CacheEntry>,
    order: Mutex<Vec<ExecutorId>>,
    meta: DashMap<ExecutorId, Arc<str>>,
    cleanups: Mutex<HashMap<ExecutorId, Vec<CleanupFn>>>,
    subscribers: Mutex<HashMap<ExecutorId, SubscriberSet>>,
    change_listeners: Mutex<Vec<ChangeListener>>,
    release_listeners: Mutex<Vec<ReleaseListener>>,
    error_listeners: Mutex<Vec<(Option<ExecutorId>, ErrorListener)>>,
    extensions: Mutex<Vec<Arc<dyn Extension>>>,
    ext_init: tokio::sync::OnceCell<()>,
    presets: Mutex<HashMap<ExecutorId, PresetAction>>,
    registry: Mutex<Vec<ErasedExecutor>>,
    pods: Mutex<Vec<Weak<ScopeInner>>>,
    tags: Mutex<Vec<TaggedValue>>,
    pub(crate) parent: Option<Scope>,
    pub(crate) is_pod: bool,
    pub(crate) cancel: CancellationToken,
    sub_seq: AtomicU64,
    disposed: AtomicBool,
    disposing: AtomicBool,
}

/// Container resolving executors lazily with per-container caching
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Arc<ScopeInner>,
}

/// Options for [`Scope::builder`]
#[derive(Default)]
pub struct ScopeBuilder {
    initial_values: Vec<Preset>,
    registry: Vec<ErasedExecutor>,
    extensions: Vec<Arc<dyn Extension>>,
    tags: Vec<TaggedValue>,
}

impl ScopeBuilder {
    /// Presets applied on each target's first resolve
    pub fn initial_values(mut self, presets: impl IntoIterator<Item = Preset>) -> Self {
        self.initial_values.extend(presets);
        self
    }

    /// Discoverable executor list returned by [`Scope::registered_executors`]
    pub fn registry(mut self, executors: impl IntoIterator<Item = ErasedExecutor>) -> Self {
        self.registry.extend(executors);
        self
    }

    /// Register an extension; ordering is registration order, outermost first
    pub fn extension(mut self, ext: Arc<dyn Extension>) -> Self {
        self.extensions.push(ext);
        self
    }

    pub fn extensions(mut self, exts: impl IntoIterator<Item = Arc<dyn Extension>>) -> Self {
        self.extensions.extend(exts);
        self
    }

    /// Scope-level tagged values
    pub fn tags(mut self, tags: impl IntoIterator<Item = TaggedValue>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn build(self) -> Scope {
        Scope::from_options(
            self.initial_values,
            self.registry,
            self.extensions,
            self.tags,
            None,
            CancellationToken::new(),
        )
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::default()
    }

    fn from_options(
        initial_values: Vec<Preset>,
        registry: Vec<ErasedExecutor>,
        extensions: Vec<Arc<dyn Extension>>,
        tags: Vec<TaggedValue>,
        parent: Option<Scope>,
        cancel: CancellationToken,
    ) -> Self {
        let meta = DashMap::new();
        let mut presets = HashMap::new();
        for p in initial_values {
            meta.insert(p.target.id, p.target.name());
            presets.insert(p.target.id, p.action);
        }
        let is_pod = parent.is_some();
        Scope {
            inner: Arc::new(ScopeInner {
                cache: DashMap::new(),
                order: Mutex::new(Vec::new()),
                meta,
                cleanups: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                change_listeners: Mutex::new(Vec::new()),
                release_listeners: Mutex::new(Vec::new()),
                error_listeners: Mutex::new(Vec::new()),
                extensions: Mutex::new(extensions),
                ext_init: tokio::sync::OnceCell::new(),
                presets: Mutex::new(presets),
                registry: Mutex::new(registry),
                pods: Mutex::new(Vec::new()),
                tags: Mutex::new(tags),
                parent,
                is_pod,
                cancel,
                sub_seq: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
                disposing: AtomicBool::new(false),
            }),
        }
    }

    /// Fork a child scope for pod isolation: options copied, reactivity off
    pub(crate) fn fork(&self, presets: Vec<Preset>) -> Scope {
        let extensions = self.snapshot_extensions();
        let tags = self.inner.tags.lock().unwrap().clone();
        let registry = self.inner.registry.lock().unwrap().clone();
        let child = Scope::from_options(
            presets,
            registry,
            extensions,
            tags,
            Some(self.clone()),
            self.inner.cancel.child_token(),
        );
        self.inner
            .pods
            .lock()
            .unwrap()
            .push(Arc::downgrade(&child.inner));
        child
    }

    /// Presets of enclosing scopes, nearest first; pods inherit their
    /// parent's initial values for executors the parent never touched
    fn inherited_preset(&self, id: ExecutorId) -> Option<PresetAction> {
        let mut current = self.inner.parent.clone();
        while let Some(scope) = current {
            if let Some(action) = scope.inner.presets.lock().unwrap().get(&id) {
                return Some(action.clone());
            }
            current = scope.inner.parent.clone();
        }
        None
    }

    fn ensure_live(&self) -> Result<(), WeftError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(WeftError::ScopeDisposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// True when this scope is a pod fork
    pub fn is_pod(&self) -> bool {
        self.inner.is_pod
    }

    // ─── cache primitives ────────────────────────────────────────────

    fn entry(&self, id: ExecutorId) -> Option<CacheEntry> {
        self.inner.cache.get(&id).map(|e| e.clone())
    }

    pub(crate) fn entry_state(&self, id: ExecutorId) -> Option<ErasedState> {
        self.entry(id).map(|e| match e {
            CacheEntry::Pending { .. } => ErasedState::Pending,
            CacheEntry::Resolved(v) => ErasedState::Resolved(v),
            CacheEntry::Rejected(e) => ErasedState::Rejected(e),
        })
    }

    fn insert_entry(&self, id: ExecutorId, entry: CacheEntry) {
        let existed = self.inner.cache.insert(id, entry).is_some();
        if !existed {
            self.inner.order.lock().unwrap().push(id);
        }
    }

    fn remove_entry(&self, id: ExecutorId) {
        self.inner.cache.remove(&id);
        self.inner.order.lock().unwrap().retain(|e| *e != id);
    }

    fn commit_resolved(&self, id: ExecutorId, value: AnyValue) {
        self.insert_entry(id, CacheEntry::Resolved(value));
    }

    fn commit_rejected(&self, id: ExecutorId, error: WeftError) {
        // pod-reactivity and cancellation failures are never cached
        if matches!(
            error,
            WeftError::PodReactivityForbidden { .. } | WeftError::Cancelled
        ) {
            self.remove_entry(id);
        } else {
            self.insert_entry(id, CacheEntry::Rejected(error));
        }
    }

    /// Replace a still-pending entry with its settled result. Guarded by the
    /// pending sequence so an interleaved update or force-resolve wins.
    fn settle_pending(&self, id: ExecutorId, seq: u64, result: &Result<AnyValue, WeftError>) {
        use dashmap::mapref::entry::Entry;
        let mut remove = false;
        if let Entry::Occupied(mut occupied) = self.inner.cache.entry(id) {
            if let CacheEntry::Pending { seq: current, .. } = occupied.get() {
                if *current == seq {
                    match result {
                        Ok(v) => {
                            occupied.insert(CacheEntry::Resolved(v.clone()));
                        }
                        Err(e)
                            if matches!(
                                e,
                                WeftError::PodReactivityForbidden { .. } | WeftError::Cancelled
                            ) =>
                        {
                            occupied.remove();
                            remove = true;
                        }
                        Err(e) => {
                            occupied.insert(CacheEntry::Rejected(e.clone()));
                        }
                    }
                }
            }
        }
        if remove {
            self.inner.order.lock().unwrap().retain(|e| *e != id);
        }
    }

    async fn await_entry(
        &self,
        id: ExecutorId,
        entry: CacheEntry,
    ) -> Result<AnyValue, WeftError> {
        match entry {
            CacheEntry::Resolved(v) => Ok(v),
            CacheEntry::Rejected(e) => Err(e),
            CacheEntry::Pending { seq, fut } => {
                let result = fut.await;
                self.settle_pending(id, seq, &result);
                result
            }
        }
    }

    // ─── cleanups and subscribers ────────────────────────────────────

    pub(crate) fn register_cleanup(&self, id: ExecutorId, f: CleanupFn) {
        self.inner
            .cleanups
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(f);
    }

    /// Run an executor's cleanups in reverse registration order, collecting
    /// failures instead of aborting
    fn run_cleanups(&self, id: ExecutorId) -> Vec<WeftError> {
        let fns = self
            .inner
            .cleanups
            .lock()
            .unwrap()
            .remove(&id)
            .unwrap_or_default();
        let mut errors = Vec::new();
        for f in fns.into_iter().rev() {
            if let Err(e) = f() {
                errors.push(e);
            }
        }
        errors
    }

    fn record_dependent(&self, target: &Arc<ExecutorCore>, dependent: Arc<ExecutorCore>) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        let set = subs
            .entry(target.id)
            .or_insert_with(|| SubscriberSet {
                target: Arc::clone(target),
                dependents: Vec::new(),
                callbacks: Vec::new(),
            });
        if !set.dependents.iter().any(|d| d.id == dependent.id) {
            set.dependents.push(dependent);
        }
    }

    pub(crate) fn subscribe_erased(
        &self,
        core: Arc<ExecutorCore>,
        callback: UpdateCallback,
    ) -> Subscription {
        let token = self.inner.sub_seq.fetch_add(1, Ordering::Relaxed);
        let id = core.id;
        let mut subs = self.inner.subscribers.lock().unwrap();
        let set = subs.entry(id).or_insert_with(|| SubscriberSet {
            target: core,
            dependents: Vec::new(),
            callbacks: Vec::new(),
        });
        set.callbacks.push((token, callback));
        Subscription {
            scope: Arc::downgrade(&self.inner),
            executor: id,
            token,
        }
    }

    fn unsubscribe(&self, id: ExecutorId, token: u64) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        if let Some(set) = subs.get_mut(&id) {
            set.callbacks.retain(|(t, _)| *t != token);
        }
    }

    // ─── listeners ───────────────────────────────────────────────────

    pub(crate) fn snapshot_extensions(&self) -> Vec<Arc<dyn Extension>> {
        self.inner.extensions.lock().unwrap().clone()
    }

    async fn ensure_extensions_init(&self) -> Result<(), WeftError> {
        // pods inherit their root scope's extensions; init runs once there
        // and init_pod is the pod-level hook
        let mut root = self.clone();
        while root.inner.is_pod {
            match root.inner.parent.clone() {
                Some(parent) => root = parent,
                None => return Ok(()),
            }
        }
        let target = root.clone();
        root.inner
            .ext_init
            .get_or_try_init(|| async move {
                for ext in target.snapshot_extensions() {
                    ext.init(&target).await?;
                }
                Ok::<(), WeftError>(())
            })
            .await
            .map(|_| ())
    }

    /// Run change listeners; the last replacement wins
    fn apply_change_listeners(
        &self,
        kind: ChangeKind,
        executor: Arc<str>,
        value: AnyValue,
    ) -> AnyValue {
        let listeners = self.inner.change_listeners.lock().unwrap().clone();
        let mut current = value;
        for listener in listeners {
            let event = ChangeEvent {
                kind,
                executor: Arc::clone(&executor),
                value: current.clone(),
                scope: self.clone(),
            };
            if let Some(replacement) = listener(&event) {
                current = replacement;
            }
        }
        current
    }

    fn notify_release(&self, executor: &Arc<str>, cleanup_errors: &[WeftError]) {
        let listeners = self.inner.release_listeners.lock().unwrap().clone();
        if listeners.is_empty() {
            return;
        }
        let event = ReleaseEvent {
            executor: Arc::clone(executor),
            scope: self.clone(),
            cleanup_errors: cleanup_errors.to_vec(),
        };
        for listener in listeners {
            listener(&event);
        }
    }

    async fn notify_error(&self, id: Option<ExecutorId>, error: &WeftError) {
        let listeners = self.inner.error_listeners.lock().unwrap().clone();
        for (filter, listener) in listeners {
            if filter.is_none() || filter == id {
                listener(error);
            }
        }
        for ext in self.snapshot_extensions() {
            ext.on_error(error, self).await;
        }
    }

    // ─── resolve protocol ────────────────────────────────────────────

    pub(crate) fn resolve_core(
        &self,
        core: Arc<ExecutorCore>,
        force: bool,
        chain: Vec<(ExecutorId, Arc<str>)>,
    ) -> BoxFuture<'static, Result<AnyValue, WeftError>> {
        let scope = self.clone();
        Box::pin(async move {
            scope.ensure_live()?;
            if scope.is_cancelled() {
                return Err(WeftError::Cancelled);
            }
            scope.ensure_extensions_init().await?;

            let id = core.id;
            let name = core.name();
            if chain.iter().any(|(cid, _)| *cid == id) {
                let mut names: Vec<Arc<str>> =
                    chain.iter().map(|(_, n)| Arc::clone(n)).collect();
                names.push(name);
                return Err(WeftError::CircularDependency { chain: names });
            }
            scope.inner.meta.insert(id, Arc::clone(&name));

            // a pod's own presets shadow whatever the parent has resolved
            let own_preset = scope.inner.presets.lock().unwrap().get(&id).cloned();

            if !force {
                if let Some(entry) = scope.entry(id) {
                    return scope.await_entry(id, entry).await;
                }
                if scope.inner.is_pod && own_preset.is_none() {
                    if let Some(parent) = scope.inner.parent.clone() {
                        match parent.entry(id) {
                            Some(entry @ CacheEntry::Resolved(_))
                            | Some(entry @ CacheEntry::Pending { .. }) => {
                                trace!(executor = %name, "pod inherits parent cache state");
                                scope.insert_entry(id, entry.clone());
                                return scope.await_entry(id, entry).await;
                            }
                            _ => {}
                        }
                    }
                }
            } else if let Some(CacheEntry::Pending { fut, .. }) = scope.entry(id) {
                // the in-flight resolution settles before its replacement
                let _ = fut.await;
            }

            let preset_action = own_preset.or_else(|| scope.inherited_preset(id));
            let effective = match preset_action {
                Some(PresetAction::Value(v)) => {
                    trace!(executor = %name, "resolve served from preset value");
                    scope.commit_resolved(id, v.clone());
                    return Ok(v);
                }
                Some(PresetAction::Substitute(sub)) => sub,
                None => Arc::clone(&core),
            };

            let seq = NEXT_PENDING_SEQ.fetch_add(1, Ordering::Relaxed);
            let mut next_chain = chain;
            next_chain.push((id, Arc::clone(&name)));

            let work_scope = scope.clone();
            let work_core = Arc::clone(&core);
            let terminal: TerminalFn = Box::new(move || {
                work_scope.perform_resolve(work_core, effective, next_chain)
            });
            let op = Operation::Resolve {
                executor: Arc::clone(&name),
                force,
            };
            let chain_fut = run_chain(scope.snapshot_extensions(), op, scope.clone(), terminal);

            let commit_scope = scope.clone();
            let pending: BoxFuture<'static, Result<AnyValue, WeftError>> =
                Box::pin(async move {
                    let result = chain_fut.await;
                    match &result {
                        Ok(v) => commit_scope.commit_resolved(id, v.clone()),
                        Err(e) => {
                            commit_scope.commit_rejected(id, e.clone());
                            commit_scope.notify_error(Some(id), e).await;
                        }
                    }
                    result
                });
            let shared = pending.shared();
            scope.insert_entry(
                id,
                CacheEntry::Pending {
                    seq,
                    fut: shared.clone(),
                },
            );
            shared.await
        })
    }

    fn perform_resolve(
        &self,
        original: Arc<ExecutorCore>,
        effective: Arc<ExecutorCore>,
        chain: Vec<(ExecutorId, Arc<str>)>,
    ) -> BoxFuture<'static, Result<AnyValue, WeftError>> {
        let scope = self.clone();
        Box::pin(async move {
            let name = original.name();
            debug!(executor = %name, "resolving");
            let resolved = scope
                .resolve_spec(&effective.dependencies, &original, &chain)
                .await?;
            if scope.is_cancelled() {
                return Err(WeftError::Cancelled);
            }
            let factory = match &effective.factory {
                Some(f) => Arc::clone(f),
                None => {
                    return Err(WeftError::FactoryExecution {
                        context: ErrorContext::new(
                            Arc::clone(&name),
                            chain_names(&chain),
                            Stage::FactoryExecution,
                        ),
                        message: "placeholder executor resolved without a preset".into(),
                        source: None,
                    })
                }
            };
            let ctl = Ctl {
                scope: scope.clone(),
                core: Arc::clone(&original),
            };
            let raw = factory(resolved, ctl).await.map_err(|e| {
                if e.is_engine_signal() {
                    e
                } else {
                    WeftError::FactoryExecution {
                        context: ErrorContext::new(
                            Arc::clone(&name),
                            chain_names(&chain),
                            Stage::FactoryExecution,
                        ),
                        message: e.to_string(),
                        source: Some(Box::new(e)),
                    }
                }
            })?;
            Ok(scope.apply_change_listeners(ChangeKind::Resolve, name, raw))
        })
    }

    async fn resolve_spec(
        &self,
        spec: &DepSpec,
        dependent: &Arc<ExecutorCore>,
        chain: &[(ExecutorId, Arc<str>)],
    ) -> Result<ResolvedDeps, WeftError> {
        match spec {
            DepSpec::None => Ok(ResolvedDeps::None),
            DepSpec::Single(r) => Ok(ResolvedDeps::Single(
                self.resolve_dep(r, dependent, chain).await?,
            )),
            DepSpec::List(refs) => {
                let tasks = refs.iter().map(|r| self.resolve_dep(r, dependent, chain));
                Ok(ResolvedDeps::List(
                    futures::future::try_join_all(tasks).await?,
                ))
            }
            DepSpec::Map(pairs) => {
                let tasks = pairs
                    .iter()
                    .map(|(_, r)| self.resolve_dep(r, dependent, chain));
                let items = futures::future::try_join_all(tasks).await?;
                Ok(ResolvedDeps::Map(
                    pairs
                        .iter()
                        .map(|(n, _)| Arc::clone(n))
                        .zip(items)
                        .collect(),
                ))
            }
        }
    }

    async fn resolve_dep(
        &self,
        dep: &DepRef,
        dependent: &Arc<ExecutorCore>,
        chain: &[(ExecutorId, Arc<str>)],
    ) -> Result<ResolvedDep, WeftError> {
        let name = dep.target.name();
        let payload = match dep.kind {
            DepKind::Lazy => DepPayload::Accessor(ErasedAccessor {
                scope: self.clone(),
                core: Arc::clone(&dep.target),
            }),
            DepKind::Plain => DepPayload::Value(self.dep_value(dep, dependent, chain).await?),
            DepKind::Reactive => {
                if self.inner.is_pod {
                    return Err(WeftError::PodReactivityForbidden {
                        executor: dependent.name(),
                    });
                }
                self.record_dependent(&dep.target, Arc::clone(dependent));
                DepPayload::Value(self.dep_value(dep, dependent, chain).await?)
            }
            DepKind::Static => {
                self.dep_value(dep, dependent, chain).await?;
                DepPayload::Accessor(ErasedAccessor {
                    scope: self.clone(),
                    core: Arc::clone(&dep.target),
                })
            }
        };
        Ok(ResolvedDep { name, payload })
    }

    async fn dep_value(
        &self,
        dep: &DepRef,
        dependent: &Arc<ExecutorCore>,
        chain: &[(ExecutorId, Arc<str>)],
    ) -> Result<AnyValue, WeftError> {
        self.resolve_core(Arc::clone(&dep.target), false, chain.to_vec())
            .await
            .map_err(|e| {
                if e.is_engine_signal() {
                    e
                } else {
                    WeftError::DependencyResolution {
                        dependent: dependent.name(),
                        missing: Some(dep.target.name()),
                        source: Some(Box::new(e)),
                    }
                }
            })
    }

    // ─── update protocol ─────────────────────────────────────────────

    pub(crate) fn update_core(
        &self,
        core: Arc<ExecutorCore>,
        action: UpdateAction,
    ) -> BoxFuture<'static, Result<(), WeftError>> {
        let scope = self.clone();
        Box::pin(async move {
            if scope.inner.disposing.load(Ordering::SeqCst) {
                return Ok(());
            }
            scope.ensure_live()?;
            scope.ensure_extensions_init().await?;
            let id = core.id;
            let name = core.name();
            scope.inner.meta.insert(id, Arc::clone(&name));

            let errors = scope.run_cleanups(id);
            for e in &errors {
                scope.notify_error(Some(id), e).await;
            }

            let current = match scope.entry(id) {
                Some(CacheEntry::Resolved(v)) => Some(v),
                _ => None,
            };

            let update_scope = scope.clone();
            let update_name = Arc::clone(&name);
            let terminal: TerminalFn = Box::new(move || {
                Box::pin(async move {
                    let next = match action {
                        UpdateAction::Value(v) => v,
                        UpdateAction::Updater(f) => f(current)?,
                    };
                    Ok(update_scope.apply_change_listeners(
                        ChangeKind::Update,
                        update_name,
                        next,
                    ))
                })
            });
            let op = Operation::Resolve {
                executor: Arc::clone(&name),
                force: true,
            };
            let next =
                run_chain(scope.snapshot_extensions(), op, scope.clone(), terminal).await;
            let next = match next {
                Ok(v) => v,
                Err(e) => {
                    scope.notify_error(Some(id), &e).await;
                    return Err(e);
                }
            };
            scope.commit_resolved(id, next);
            debug!(executor = %name, "updated");
            scope.propagate(id).await;
            Ok(())
        })
    }

    /// Re-resolve reactive dependents in registration order, then invoke
    /// plain subscribers. Runs within the awaiting update, so `update(..)
    /// .await` implies all downstream dependents have settled.
    fn propagate(&self, id: ExecutorId) -> BoxFuture<'static, ()> {
        let scope = self.clone();
        Box::pin(async move {
            let (target, dependents, callbacks) = {
                let subs = scope.inner.subscribers.lock().unwrap();
                match subs.get(&id) {
                    Some(set) => (
                        Some(Arc::clone(&set.target)),
                        set.dependents.clone(),
                        set.callbacks.clone(),
                    ),
                    None => (None, Vec::new(), Vec::new()),
                }
            };
            for dependent in dependents {
                let errors = scope.run_cleanups(dependent.id);
                for e in &errors {
                    scope.notify_error(Some(dependent.id), e).await;
                }
                match scope
                    .resolve_core(Arc::clone(&dependent), true, Vec::new())
                    .await
                {
                    Ok(_) => scope.propagate(dependent.id).await,
                    Err(e) => {
                        // the failing branch halts; siblings keep their values
                        warn!(executor = %dependent.name(), error = %e, "reactive propagation halted");
                    }
                }
            }
            if let Some(target) = target {
                for (_, callback) in callbacks {
                    callback(ErasedAccessor {
                        scope: scope.clone(),
                        core: Arc::clone(&target),
                    });
                }
            }
        })
    }

    // ─── release protocol ────────────────────────────────────────────

    pub(crate) fn release_entry(
        &self,
        id: ExecutorId,
        soft: bool,
    ) -> BoxFuture<'static, Result<(), WeftError>> {
        let scope = self.clone();
        Box::pin(async move {
            if !scope.inner.disposing.load(Ordering::SeqCst) {
                scope.ensure_live()?;
            }
            let name = scope
                .inner
                .meta
                .get(&id)
                .map(|n| Arc::clone(&n))
                .unwrap_or_else(|| Arc::from(id.to_string()));

            if scope.entry(id).is_none() {
                if soft {
                    return Ok(());
                }
                return Err(WeftError::ExecutorNotResolved { executor: name });
            }

            let errors = scope.run_cleanups(id);
            scope.notify_release(&name, &errors);
            for e in &errors {
                scope.notify_error(Some(id), e).await;
            }

            let dependents = {
                let subs = scope.inner.subscribers.lock().unwrap();
                subs.get(&id)
                    .map(|s| s.dependents.clone())
                    .unwrap_or_default()
            };
            for dependent in dependents {
                let _ = scope.release_entry(dependent.id, true).await;
            }

            scope.remove_entry(id);
            {
                let mut subs = scope.inner.subscribers.lock().unwrap();
                subs.remove(&id);
                for set in subs.values_mut() {
                    set.dependents.retain(|d| d.id != id);
                }
            }
            scope.inner.meta.remove(&id);
            debug!(executor = %name, "released");
            Ok(())
        })
    }

    // ─── dispose protocol ────────────────────────────────────────────

    /// Dispose pods, extensions and every cached executor (reverse insertion
    /// order), then fail all further operations with `ScopeDisposed`
    #[instrument(skip(self), fields(is_pod = self.inner.is_pod))]
    pub async fn dispose(&self) -> Result<(), WeftError> {
        self.ensure_live()?;
        self.inner.disposing.store(true, Ordering::SeqCst);
        debug!("disposing scope");
        self.inner.cancel.cancel();

        let pods: Vec<Weak<ScopeInner>> =
            std::mem::take(&mut *self.inner.pods.lock().unwrap());
        for weak in pods {
            if let Some(inner) = weak.upgrade() {
                let pod_scope = Scope { inner };
                if !pod_scope.inner.disposed.load(Ordering::SeqCst) {
                    let _ = Box::pin(pod_scope.dispose()).await;
                }
            }
        }

        for ext in self.snapshot_extensions() {
            if self.inner.is_pod {
                ext.dispose_pod(&Pod::from_scope(self.clone())).await;
            } else {
                ext.dispose(self).await;
            }
        }

        let order: Vec<ExecutorId> = self.inner.order.lock().unwrap().clone();
        for id in order.into_iter().rev() {
            let _ = self.release_entry(id, true).await;
        }

        self.inner.cache.clear();
        self.inner.order.lock().unwrap().clear();
        self.inner.meta.clear();
        self.inner.cleanups.lock().unwrap().clear();
        self.inner.subscribers.lock().unwrap().clear();
        self.inner.change_listeners.lock().unwrap().clear();
        self.inner.release_listeners.lock().unwrap().clear();
        self.inner.error_listeners.lock().unwrap().clear();
        self.inner.presets.lock().unwrap().clear();
        self.inner.registry.lock().unwrap().clear();

        if let Some(parent) = &self.inner.parent {
            parent.inner.pods.lock().unwrap().retain(|w| {
                w.upgrade()
                    .map(|i| !Arc::ptr_eq(&i, &self.inner))
                    .unwrap_or(false)
            });
        }

        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.disposing.store(false, Ordering::SeqCst);
        Ok(())
    }

    // ─── public typed surface ────────────────────────────────────────

    /// Resolve an executor, sharing any in-flight resolution
    pub async fn resolve<T>(&self, executor: &Executor<T>) -> Result<T, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let value = self
            .resolve_core(Arc::clone(&executor.core), false, Vec::new())
            .await?;
        downcast_value(value, &executor.name())
    }

    /// Force a fresh resolution, replacing the cache entry
    pub async fn resolve_fresh<T>(&self, executor: &Executor<T>) -> Result<T, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let value = self
            .resolve_core(Arc::clone(&executor.core), true, Vec::new())
            .await?;
        downcast_value(value, &executor.name())
    }

    /// Runtime handle without driving resolution
    pub fn accessor<T>(&self, executor: &Executor<T>) -> Accessor<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        Accessor::new(self.clone(), Arc::clone(&executor.core))
    }

    /// Resolve, then hand back the accessor
    pub async fn resolve_accessor<T>(
        &self,
        executor: &Executor<T>,
    ) -> Result<Accessor<T>, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.resolve(executor).await?;
        Ok(self.accessor(executor))
    }

    /// Write a value: cleanups run, change listeners fire, reactive
    /// dependents re-resolve before this returns
    pub async fn update<T>(&self, executor: &Executor<T>, value: T) -> Result<(), WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.accessor(executor).update(value).await
    }

    /// Compute the next value from the current one, then update
    pub async fn update_with<T, F>(
        &self,
        executor: &Executor<T>,
        f: F,
    ) -> Result<(), WeftError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        self.accessor(executor).update_with(f).await
    }

    /// Alias of [`Scope::update`]
    pub async fn set<T>(&self, executor: &Executor<T>, value: T) -> Result<(), WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.update(executor, value).await
    }

    /// Release an executor's cache entry; `soft` tolerates a missing entry
    pub async fn release<T>(&self, executor: &Executor<T>, soft: bool) -> Result<(), WeftError> {
        self.inner.meta.insert(executor.core.id, executor.name());
        self.release_entry(executor.core.id, soft).await
    }

    /// Names and states of every cache entry, in insertion order
    pub fn entries(&self) -> Vec<(Arc<str>, EntryState)> {
        let order = self.inner.order.lock().unwrap().clone();
        order
            .into_iter()
            .filter_map(|id| {
                let state = match self.entry(id)? {
                    CacheEntry::Pending { .. } => EntryState::Pending,
                    CacheEntry::Resolved(_) => EntryState::Resolved,
                    CacheEntry::Rejected(_) => EntryState::Rejected,
                };
                let name = self
                    .inner
                    .meta
                    .get(&id)
                    .map(|n| Arc::clone(&n))
                    .unwrap_or_else(|| Arc::from(id.to_string()));
                Some((name, state))
            })
            .collect()
    }

    /// The discoverable executor list this scope was created with
    pub fn registered_executors(&self) -> Vec<ErasedExecutor> {
        self.inner.registry.lock().unwrap().clone()
    }

    /// Observe committed updates of one executor
    pub fn on_update<T, F>(&self, executor: &Executor<T>, callback: F) -> Subscription
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Accessor<T>) + Send + Sync + 'static,
    {
        self.accessor(executor).subscribe(callback)
    }

    /// Intercept every resolve/update before its value is committed
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&ChangeEvent) -> Option<AnyValue> + Send + Sync + 'static,
    {
        self.inner
            .change_listeners
            .lock()
            .unwrap()
            .push(Arc::new(listener));
    }

    /// Observe releases
    pub fn on_release<F>(&self, listener: F)
    where
        F: Fn(&ReleaseEvent) + Send + Sync + 'static,
    {
        self.inner
            .release_listeners
            .lock()
            .unwrap()
            .push(Arc::new(listener));
    }

    /// Observe every error surfaced by this scope
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&WeftError) + Send + Sync + 'static,
    {
        self.inner
            .error_listeners
            .lock()
            .unwrap()
            .push((None, Arc::new(listener)));
    }

    /// Observe errors of one executor
    pub fn on_executor_error<T, F>(&self, executor: &Executor<T>, listener: F)
    where
        F: Fn(&WeftError) + Send + Sync + 'static,
    {
        self.inner
            .error_listeners
            .lock()
            .unwrap()
            .push((Some(executor.core.id), Arc::new(listener)));
    }

    /// Register an extension after construction; it initializes immediately
    /// when the scope has already started operating
    pub async fn use_extension(&self, ext: Arc<dyn Extension>) -> Result<(), WeftError> {
        self.ensure_live()?;
        if self.inner.ext_init.initialized() {
            ext.init(self).await?;
        }
        self.inner.extensions.lock().unwrap().push(ext);
        Ok(())
    }

    /// Fork a pod with no extra presets
    pub fn pod(&self) -> Pod {
        Pod::fork(self, Vec::new())
    }

    /// Fork a pod, overlaying presets on the parent's
    pub fn pod_with(&self, presets: impl IntoIterator<Item = Preset>) -> Pod {
        Pod::fork(self, presets.into_iter().collect())
    }

    /// Dispose one pod; the parent cache is untouched
    pub async fn dispose_pod(&self, pod: &Pod) -> Result<(), WeftError> {
        pod.dispose().await
    }
}

fn chain_names(chain: &[(ExecutorId, Arc<str>)]) -> Vec<Arc<str>> {
    chain.iter().map(|(_, n)| Arc::clone(n)).collect()
}

impl TagSource for Scope {
    fn lookup(&self, key: TagId) -> Option<serde_json::Value> {
        self.inner.tags.lock().unwrap().lookup(key)
    }

    fn lookup_all(&self, key: TagId) -> Vec<serde_json::Value> {
        self.inner.tags.lock().unwrap().lookup_all(key)
    }
}

impl TagStore for Scope {
    fn put(&self, entry: TaggedValue) {
        let mut tags = self.inner.tags.lock().unwrap();
        if let Some(existing) = tags.iter_mut().find(|t| t.key() == entry.key()) {
            *existing = entry;
        } else {
            tags.push(entry);
        }
    }
}

/// Handle for a registered update callback; `cancel` removes it
pub struct Subscription {
    scope: Weak<ScopeInner>,
    executor: ExecutorId,
    token: u64,
}

impl Subscription {
    pub fn cancel(self) {
        if let Some(inner) = self.scope.upgrade() {
            Scope { inner }.unsubscribe(self.executor, self.token);
        }
    }
}
