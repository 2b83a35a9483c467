//! Executor accessors
//!
//! An accessor is the runtime handle of one executor inside one scope or
//! pod: state lookup, resolution, updates, release and subscription without
//! holding the executor itself. Reads (`get`, `lookup`) never mutate.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::WeftError;
use crate::executor::{AnyValue, ExecutorCore, ExecutorId};
use crate::scope::{Scope, Subscription, UpdateAction};

/// Cache state of an executor as seen through an accessor
#[derive(Debug, Clone)]
pub enum ResolveState<T> {
    /// A resolution is in flight
    Pending,
    /// A value is cached
    Resolved(T),
    /// The last resolution failed and the error is cached
    Rejected(WeftError),
}

impl<T> ResolveState<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolveState::Resolved(_))
    }
}

/// Type-erased accessor as carried through dependency resolution
#[derive(Clone)]
pub struct ErasedAccessor {
    pub(crate) scope: Scope,
    pub(crate) core: Arc<ExecutorCore>,
}

impl ErasedAccessor {
    pub fn id(&self) -> ExecutorId {
        self.core.id
    }

    pub fn name(&self) -> Arc<str> {
        self.core.name()
    }
}

pub(crate) fn downcast_value<T>(value: AnyValue, executor: &Arc<str>) -> Result<T, WeftError>
where
    T: Clone + Send + Sync + 'static,
{
    match value.downcast::<T>() {
        Ok(v) => Ok((*v).clone()),
        Err(_) => Err(WeftError::ExecutorNotResolved {
            executor: Arc::from(format!("{executor} (cached value has an unexpected type)")),
        }),
    }
}

/// Typed runtime handle of an executor in a scope or pod
pub struct Accessor<T> {
    pub(crate) raw: ErasedAccessor,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Accessor<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_erased(raw: ErasedAccessor) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn new(scope: Scope, core: Arc<ExecutorCore>) -> Self {
        Self::from_erased(ErasedAccessor { scope, core })
    }

    pub fn id(&self) -> ExecutorId {
        self.raw.core.id
    }

    pub fn name(&self) -> Arc<str> {
        self.raw.core.name()
    }

    pub fn scope(&self) -> &Scope {
        &self.raw.scope
    }

    /// Current cache state, `None` when the executor has no entry
    pub fn lookup(&self) -> Option<ResolveState<T>> {
        let name = self.name();
        self.raw
            .scope
            .entry_state(self.raw.core.id)
            .map(|state| match state {
                crate::scope::ErasedState::Pending => ResolveState::Pending,
                crate::scope::ErasedState::Resolved(v) => match downcast_value::<T>(v, &name) {
                    Ok(v) => ResolveState::Resolved(v),
                    Err(e) => ResolveState::Rejected(e),
                },
                crate::scope::ErasedState::Rejected(e) => ResolveState::Rejected(e),
            })
    }

    /// The cached value; fails when absent, pending or rejected
    pub fn get(&self) -> Result<T, WeftError> {
        match self.lookup() {
            Some(ResolveState::Resolved(v)) => Ok(v),
            Some(ResolveState::Rejected(e)) => Err(e),
            _ => Err(WeftError::ExecutorNotResolved {
                executor: self.name(),
            }),
        }
    }

    /// Drive resolution, sharing any in-flight pending entry
    pub async fn resolve(&self) -> Result<T, WeftError> {
        let value = self
            .raw
            .scope
            .resolve_core(Arc::clone(&self.raw.core), false, Vec::new())
            .await?;
        downcast_value(value, &self.name())
    }

    /// Force a fresh resolution, replacing the cache entry
    pub async fn resolve_fresh(&self) -> Result<T, WeftError> {
        let value = self
            .raw
            .scope
            .resolve_core(Arc::clone(&self.raw.core), true, Vec::new())
            .await?;
        downcast_value(value, &self.name())
    }

    /// Write a value, running cleanups and propagating to reactive dependents
    pub async fn update(&self, value: T) -> Result<(), WeftError> {
        self.raw
            .scope
            .update_core(
                Arc::clone(&self.raw.core),
                UpdateAction::Value(Arc::new(value) as AnyValue),
            )
            .await
    }

    /// Compute the next value from the current one, then update
    pub async fn update_with<F>(&self, f: F) -> Result<(), WeftError>
    where
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        let name = self.name();
        self.raw
            .scope
            .update_core(
                Arc::clone(&self.raw.core),
                UpdateAction::Updater(Box::new(move |prev| {
                    let prev = match prev {
                        Some(v) => Some(downcast_value::<T>(v, &name)?),
                        None => None,
                    };
                    Ok(Arc::new(f(prev)) as AnyValue)
                })),
            )
            .await
    }

    /// Alias of [`Accessor::update`] with value semantics
    pub async fn set(&self, value: T) -> Result<(), WeftError> {
        self.update(value).await
    }

    /// Release the cache entry; `soft` tolerates a missing entry
    pub async fn release(&self, soft: bool) -> Result<(), WeftError> {
        self.raw.scope.release_entry(self.raw.core.id, soft).await
    }

    /// Observe updates of this executor; the callback receives a fresh
    /// accessor after each committed update
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(Accessor<T>) + Send + Sync + 'static,
    {
        self.raw.scope.subscribe_erased(
            Arc::clone(&self.raw.core),
            Arc::new(move |erased: ErasedAccessor| f(Accessor::from_erased(erased))),
        )
    }
}
