//! Extension pipeline
//!
//! Extensions are middleware registered on a scope. Every core operation
//! (resolve, flow execution, sub-flow, journal call, parallel combinator)
//! runs through the chain: each extension receives the operation descriptor
//! and a `Next` handle, and may short-circuit, substitute the value, or
//! translate errors. Registration order is outermost-first; the unwind runs
//! in reverse.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::ctx::Ctx;
use crate::error::WeftError;
use crate::executor::AnyValue;
use crate::pod::Pod;
use crate::scope::Scope;

/// Parallel combinator flavor carried in the operation descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelKind {
    /// `ctx.parallel`: first rejection fails the gather
    FailFast,
    /// `ctx.parallel_settled`: every branch settles
    Settled,
}

/// Descriptor of the operation an extension is wrapping
#[derive(Debug, Clone)]
pub enum Operation {
    /// A `Scope::resolve` or the re-resolution inside an update
    Resolve { executor: Arc<str>, force: bool },
    /// Top-level flow execution
    Execute { flow: Arc<str> },
    /// `ctx.exec` sub-flow invocation
    Subflow { flow: Arc<str> },
    /// `ctx.run` journal invocation
    Journal { key: Arc<str> },
    /// `ctx.parallel` / `ctx.parallel_settled`
    Parallel { kind: ParallelKind, count: usize },
}

impl Operation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::Resolve { .. } => "resolve",
            Operation::Execute { .. } => "execute",
            Operation::Subflow { .. } => "subflow",
            Operation::Journal { .. } => "journal",
            Operation::Parallel { .. } => "parallel",
        }
    }
}

pub(crate) type TerminalFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<AnyValue, WeftError>> + Send>;

/// Remainder of the extension chain; call [`Next::run`] to continue inward
pub struct Next {
    pub(crate) rest: Vec<Arc<dyn Extension>>,
    pub(crate) op: Operation,
    pub(crate) scope: Scope,
    pub(crate) terminal: TerminalFn,
}

impl Next {
    /// Run the remaining extensions and the wrapped operation
    pub fn run(self) -> BoxFuture<'static, Result<AnyValue, WeftError>> {
        let Next {
            mut rest,
            op,
            scope,
            terminal,
        } = self;
        if rest.is_empty() {
            return terminal();
        }
        let ext = rest.remove(0);
        Box::pin(async move {
            let next = Next {
                rest,
                op: op.clone(),
                scope: scope.clone(),
                terminal,
            };
            ext.wrap(&op, &scope, next).await
        })
    }
}

/// Build and run the full onion for one operation
pub(crate) fn run_chain(
    extensions: Vec<Arc<dyn Extension>>,
    op: Operation,
    scope: Scope,
    terminal: TerminalFn,
) -> BoxFuture<'static, Result<AnyValue, WeftError>> {
    Next {
        rest: extensions,
        op,
        scope,
        terminal,
    }
    .run()
}

/// Middleware wrapping every resolution and flow-execution operation
///
/// All hooks are optional; the default `wrap` is a pass-through. Values
/// cross the chain type-erased: resolve operations carry the executor's
/// value, flow operations carry the `serde_json::Value` at that boundary.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Display name used in diagnostics
    fn name(&self) -> &str {
        "extension"
    }

    /// Called once per scope, before the scope's first operation
    async fn init(&self, _scope: &Scope) -> Result<(), WeftError> {
        Ok(())
    }

    /// Called when a flow execution opens its pod
    async fn init_pod(&self, _pod: &Pod, _ctx: &Ctx) -> Result<(), WeftError> {
        Ok(())
    }

    /// Wrap one operation; call `next.run().await` to continue inward
    async fn wrap(
        &self,
        _op: &Operation,
        _scope: &Scope,
        next: Next,
    ) -> Result<AnyValue, WeftError> {
        next.run().await
    }

    /// Observes every error surfaced by scope operations
    async fn on_error(&self, _error: &WeftError, _scope: &Scope) {}

    /// Observes errors surfaced by flow executions
    async fn on_pod_error(&self, _error: &WeftError, _pod: &Pod, _ctx: &Ctx) {}

    /// Called during scope disposal, before cached executors are released
    async fn dispose(&self, _scope: &Scope) {}

    /// Called during pod disposal
    async fn dispose_pod(&self, _pod: &Pod) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!(
            Operation::Resolve {
                executor: Arc::from("e"),
                force: false
            }
            .kind_name(),
            "resolve"
        );
        assert_eq!(
            Operation::Parallel {
                kind: ParallelKind::Settled,
                count: 3
            }
            .kind_name(),
            "parallel"
        );
        assert_eq!(Operation::Journal { key: Arc::from("k") }.kind_name(), "journal");
    }
}
