//! Flow execution context
//!
//! A `Ctx` is the per-execution, tree-shaped data carrier: tag-typed data
//! with copy-on-fork inheritance, the pod used for dependency resolution,
//! sub-flow execution, journaled steps, and parallel combinators. Lookups
//! walk own data, then the parent chain, then the owning scope's tags;
//! writes always land in the context's own data.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{SchemaError, WeftError};
use crate::executor::{AnyValue, Executor};
use crate::extension::{run_chain, Extension, Operation, ParallelKind, TerminalFn};
use crate::flow::{decode_output, invoke_flow_erased, Flow};
use crate::pod::Pod;
use crate::promised::{ExecutionData, ExecutionState, Promised};
use crate::scope::Scope;
use crate::tag::{Tag, TagId, TagSource, TagStore, TaggedValue};

/// Success/failure counts for a parallel gather
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Results plus stats from `ctx.parallel` / `ctx.parallel_settled`
#[derive(Debug)]
pub struct ParallelOutcome<T> {
    pub results: Vec<T>,
    pub stats: ParallelStats,
}

pub(crate) struct CtxInner {
    data: Mutex<HashMap<TagId, TaggedValue>>,
    parent: Option<Ctx>,
    pod: Pod,
    state: Arc<ExecutionState>,
    extensions: Vec<Arc<dyn Extension>>,
    external_cancel: Option<tokio_util::sync::CancellationToken>,
}

/// Per-execution context handed to flow handlers
#[derive(Clone)]
pub struct Ctx {
    inner: Arc<CtxInner>,
}

impl Ctx {
    pub(crate) fn root(
        pod: Pod,
        state: Arc<ExecutionState>,
        extensions: Vec<Arc<dyn Extension>>,
        tags: Vec<TaggedValue>,
        external_cancel: Option<tokio_util::sync::CancellationToken>,
    ) -> Ctx {
        let data = tags.into_iter().map(|t| (t.key(), t)).collect();
        Ctx {
            inner: Arc::new(CtxInner {
                data: Mutex::new(data),
                parent: None,
                pod,
                state,
                extensions,
                external_cancel,
            }),
        }
    }

    /// Child context for a sub-flow: data copied, parent linked, same pod
    pub(crate) fn fork(&self) -> Ctx {
        let data = self.inner.data.lock().unwrap().clone();
        Ctx {
            inner: Arc::new(CtxInner {
                data: Mutex::new(data),
                parent: Some(self.clone()),
                pod: self.inner.pod.clone(),
                state: Arc::clone(&self.inner.state),
                extensions: self.inner.extensions.clone(),
                external_cancel: self.inner.external_cancel.clone(),
            }),
        }
    }

    /// The pod dependencies resolve through during this execution
    pub fn pod(&self) -> &Pod {
        &self.inner.pod
    }

    /// The pod's scope
    pub fn scope(&self) -> &Scope {
        self.inner.pod.scope()
    }

    /// The enclosing context, `None` at the execution root
    pub fn parent(&self) -> Option<Ctx> {
        self.inner.parent.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.pod.scope().is_cancelled()
            || self
                .inner
                .external_cancel
                .as_ref()
                .is_some_and(|t| t.is_cancelled())
    }

    /// Snapshot of this execution's status, error and journal
    pub fn execution(&self) -> ExecutionData {
        self.inner.state.snapshot()
    }

    pub(crate) fn extensions(&self) -> Vec<Arc<dyn Extension>> {
        self.inner.extensions.clone()
    }

    pub(crate) fn state(&self) -> Arc<ExecutionState> {
        Arc::clone(&self.inner.state)
    }

    /// Record the cancellation on the execution and return the error
    pub(crate) fn mark_cancelled(&self) -> WeftError {
        let err = WeftError::Cancelled;
        self.inner.state.cancel(err.clone());
        err
    }

    // ─── tag-typed data ──────────────────────────────────────────────

    /// Typed read; fails with `TagMissing` when nothing carries the tag
    pub fn get<T>(&self, tag: &Tag<T>) -> Result<T, WeftError>
    where
        T: Serialize + DeserializeOwned,
    {
        tag.get(self)
    }

    /// Typed read falling back to the tag's default, then `None`
    pub fn find<T>(&self, tag: &Tag<T>) -> Option<T>
    where
        T: Serialize + DeserializeOwned,
    {
        tag.find(self)
    }

    /// Every value carried under the tag, across the context tree and scope
    pub fn some<T>(&self, tag: &Tag<T>) -> Vec<T>
    where
        T: Serialize + DeserializeOwned,
    {
        tag.some(self)
    }

    /// Validate and write into this context's own data
    pub fn set<T>(&self, tag: &Tag<T>, value: T) -> Result<(), WeftError>
    where
        T: Serialize + DeserializeOwned,
    {
        tag.set(self, value)
    }

    // ─── resolution and sub-flows ────────────────────────────────────

    /// Resolve an executor through this execution's pod
    pub async fn resolve<T>(&self, executor: &Executor<T>) -> Result<T, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner.pod.resolve(executor).await
    }

    /// Execute a sub-flow in a forked child context
    ///
    /// The child's data is a copy of this context's; writes inside the
    /// sub-flow are invisible here after it returns.
    pub fn exec<I, O>(&self, flow: &Flow<I, O>, input: I) -> Promised<O>
    where
        I: Serialize + DeserializeOwned + Send + Sync + 'static,
        O: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let child = self.fork();
        let def = Arc::clone(&flow.def);
        let handler_exec = flow.executor.clone();
        let state = self.state();
        let pod = self.inner.pod.clone();
        let fut = async move {
            let input_value =
                serde_json::to_value(input).map_err(|e| WeftError::FlowValidation {
                    flow: Arc::clone(&def.name),
                    target: crate::error::ValidationTarget::Input,
                    source: SchemaError::single("", e.to_string()),
                })?;
            let op = Operation::Subflow {
                flow: Arc::clone(&def.name),
            };
            let out =
                invoke_flow_erased(Arc::clone(&def), handler_exec, child, input_value, op)
                    .await?;
            decode_output::<O>(&def.name, out)
        };
        Promised::from_execution(Box::pin(fut), Some(state), Some(pod))
    }

    // ─── journal ─────────────────────────────────────────────────────

    /// Run a step under a stable journal key
    ///
    /// A key already present in the execution journal replays its recorded
    /// value without re-running `f`; extensions wrap the call (`journal` op)
    /// and may short-circuit earlier.
    pub async fn run<T, F, Fut>(&self, key: &str, f: F) -> Result<T, WeftError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WeftError>> + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(self.mark_cancelled());
        }
        if let Some(recorded) = self.inner.state.journal_get(key) {
            debug!(key, "journal replay");
            return serde_json::from_value(recorded)
                .map_err(|e| WeftError::Schema(SchemaError::single("", e.to_string())));
        }

        let key_arc: Arc<str> = Arc::from(key);
        let terminal: TerminalFn = Box::new(move || {
            Box::pin(async move {
                let value = f().await?;
                let raw = serde_json::to_value(&value)
                    .map_err(|e| WeftError::Schema(SchemaError::single("", e.to_string())))?;
                Ok(Arc::new(raw) as AnyValue)
            })
        });
        let result = run_chain(
            self.extensions(),
            Operation::Journal {
                key: Arc::clone(&key_arc),
            },
            self.scope().clone(),
            terminal,
        )
        .await?;
        let raw = result
            .downcast_ref::<Value>()
            .cloned()
            .ok_or_else(|| {
                WeftError::Schema(SchemaError::single("", "journal step produced a non-JSON value"))
            })?;
        self.inner.state.journal_put(&key_arc, raw.clone());
        serde_json::from_value(raw)
            .map_err(|e| WeftError::Schema(SchemaError::single("", e.to_string())))
    }

    // ─── parallel combinators ────────────────────────────────────────

    /// Gather promised results; the first rejection fails the gather
    pub async fn parallel<T>(
        &self,
        items: Vec<Promised<T>>,
    ) -> Result<ParallelOutcome<T>, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            return Err(self.mark_cancelled());
        }
        let total = items.len();
        let branches: Vec<_> = items.into_iter().map(|p| p.to_promise()).collect();
        let terminal: TerminalFn = Box::new(move || {
            Box::pin(async move {
                let results = futures::future::try_join_all(branches).await?;
                Ok(Arc::new(results) as AnyValue)
            })
        });
        let value = run_chain(
            self.extensions(),
            Operation::Parallel {
                kind: ParallelKind::FailFast,
                count: total,
            },
            self.scope().clone(),
            terminal,
        )
        .await?;
        let results = value
            .downcast_ref::<Vec<T>>()
            .cloned()
            .ok_or_else(|| {
                WeftError::Schema(SchemaError::single("", "parallel produced an unexpected value"))
            })?;
        Ok(ParallelOutcome {
            stats: ParallelStats {
                total,
                succeeded: results.len(),
                failed: 0,
            },
            results,
        })
    }

    /// Gather promised results; every branch settles, the gather never fails
    /// on branch errors
    pub async fn parallel_settled<T>(
        &self,
        items: Vec<Promised<T>>,
    ) -> Result<ParallelOutcome<Result<T, WeftError>>, WeftError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            return Err(self.mark_cancelled());
        }
        let total = items.len();
        let branches: Vec<_> = items.into_iter().map(|p| p.to_promise()).collect();
        let terminal: TerminalFn = Box::new(move || {
            Box::pin(async move {
                let results = futures::future::join_all(branches).await;
                Ok(Arc::new(results) as AnyValue)
            })
        });
        let value = run_chain(
            self.extensions(),
            Operation::Parallel {
                kind: ParallelKind::Settled,
                count: total,
            },
            self.scope().clone(),
            terminal,
        )
        .await?;
        let results = value
            .downcast_ref::<Vec<Result<T, WeftError>>>()
            .cloned()
            .ok_or_else(|| {
                WeftError::Schema(SchemaError::single("", "parallel produced an unexpected value"))
            })?;
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        Ok(ParallelOutcome {
            stats: ParallelStats {
                total,
                succeeded,
                failed: total - succeeded,
            },
            results,
        })
    }
}

impl TagSource for Ctx {
    fn lookup(&self, key: TagId) -> Option<Value> {
        if let Some(entry) = self.inner.data.lock().unwrap().get(&key) {
            return Some(entry.value().clone());
        }
        if let Some(parent) = &self.inner.parent {
            if let Some(value) = parent.lookup(key) {
                return Some(value);
            }
        }
        self.inner.pod.scope().lookup(key)
    }

    fn lookup_all(&self, key: TagId) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .inner
            .data
            .lock()
            .unwrap()
            .get(&key)
            .map(|e| vec![e.value().clone()])
            .unwrap_or_default();
        if let Some(parent) = &self.inner.parent {
            values.extend(parent.lookup_all(key));
        }
        values.extend(self.inner.pod.scope().lookup_all(key));
        values
    }
}

impl TagStore for Ctx {
    fn put(&self, entry: TaggedValue) {
        self.inner.data.lock().unwrap().insert(entry.key(), entry);
    }
}
