//! Pod: forked scope isolation
//!
//! A pod is a scope forked from a parent: on first access it inherits the
//! parent's resolved state by snapshot (the factory is not re-invoked),
//! mutations stay local, and reactive dependencies are forbidden. Pods are
//! disposed independently; the parent cache is never touched.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::accessor::Accessor;
use crate::error::WeftError;
use crate::executor::{Executor, Preset};
use crate::scope::{EntryState, Scope};
use crate::tag::{TagId, TagSource, TagStore, TaggedValue};

/// An isolated fork of a scope, live for one short-lived execution
#[derive(Clone)]
pub struct Pod {
    pub(crate) scope: Scope,
}

impl Pod {
    pub(crate) fn fork(parent: &Scope, presets: Vec<Preset>) -> Pod {
        Pod {
            scope: parent.fork(presets),
        }
    }

    pub(crate) fn from_scope(scope: Scope) -> Pod {
        Pod { scope }
    }

    /// The pod's own scope (with `is_pod` set)
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The scope this pod was forked from
    pub fn parent(&self) -> Option<Scope> {
        self.scope.inner.parent.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.scope.cancel_token()
    }

    /// Resolve through the pod: own cache first, then the parent snapshot,
    /// then a normal resolution local to the pod
    pub async fn resolve<T>(&self, executor: &Executor<T>) -> Result<T, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.scope.resolve(executor).await
    }

    /// Force a fresh resolution inside the pod
    pub async fn resolve_fresh<T>(&self, executor: &Executor<T>) -> Result<T, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.scope.resolve_fresh(executor).await
    }

    pub fn accessor<T>(&self, executor: &Executor<T>) -> Accessor<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.scope.accessor(executor)
    }

    /// Update inside the pod; invisible to the parent and to sibling pods
    pub async fn update<T>(&self, executor: &Executor<T>, value: T) -> Result<(), WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.scope.update(executor, value).await
    }

    pub async fn update_with<T, F>(
        &self,
        executor: &Executor<T>,
        f: F,
    ) -> Result<(), WeftError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        self.scope.update_with(executor, f).await
    }

    pub async fn set<T>(&self, executor: &Executor<T>, value: T) -> Result<(), WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.scope.set(executor, value).await
    }

    pub async fn release<T>(&self, executor: &Executor<T>, soft: bool) -> Result<(), WeftError> {
        self.scope.release(executor, soft).await
    }

    pub fn entries(&self) -> Vec<(Arc<str>, EntryState)> {
        self.scope.entries()
    }

    /// Dispose the pod's own cache; the parent scope is untouched
    pub async fn dispose(&self) -> Result<(), WeftError> {
        self.scope.dispose().await
    }
}

impl TagSource for Pod {
    fn lookup(&self, key: TagId) -> Option<serde_json::Value> {
        self.scope.lookup(key)
    }

    fn lookup_all(&self, key: TagId) -> Vec<serde_json::Value> {
        self.scope.lookup_all(key)
    }
}

impl TagStore for Pod {
    fn put(&self, entry: TaggedValue) {
        self.scope.put(entry)
    }
}
