//! Flow model
//!
//! A flow is a short-lived operation: a definition (name, input schema,
//! output schema) plus a handler. The flow itself is a main executor whose
//! resolved value is the erased handler, so handlers resolve through the
//! same engine as every other value. Execution opens a pod, builds a root
//! context, validates the boundary values, and returns a [`Promised`].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::ctx::Ctx;
use crate::error::{SchemaError, ValidationTarget, WeftError};
use crate::executor::{provide, AnyValue, Executor, Preset};
use crate::extension::{run_chain, Extension, Operation, TerminalFn};
use crate::promised::{ExecutionState, Promised};
use crate::schema::SchemaRef;
use crate::scope::Scope;
use crate::tag::TaggedValue;

/// Definition record of a flow: name, boundary schemas, version, tags
#[derive(Clone)]
pub struct FlowDef {
    pub name: Arc<str>,
    pub input: SchemaRef,
    pub output: SchemaRef,
    pub version: Option<Arc<str>>,
    pub tags: Vec<TaggedValue>,
}

impl FlowDef {
    pub fn new(name: impl Into<Arc<str>>, input: SchemaRef, output: SchemaRef) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            version: None,
            tags: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<Arc<str>>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = TaggedValue>) -> Self {
        self.tags.extend(tags);
        self
    }
}

/// The erased handler a flow executor resolves to
#[derive(Clone)]
pub struct FlowHandler(
    pub(crate) Arc<dyn Fn(Ctx, Value) -> BoxFuture<'static, Result<Value, WeftError>> + Send + Sync>,
);

/// A defined flow over typed input `I` and output `O`
pub struct Flow<I, O> {
    pub(crate) executor: Executor<FlowHandler>,
    pub(crate) def: Arc<FlowDef>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Flow<I, O> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            def: Arc::clone(&self.def),
            _marker: PhantomData,
        }
    }
}

/// Builder produced by [`Flow::define`]
pub struct FlowBuilder<I, O> {
    def: FlowDef,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Flow<I, O>
where
    I: DeserializeOwned + Send + Sync + 'static,
    O: Serialize + Send + 'static,
{
    /// Start defining a flow; finish with [`FlowBuilder::handler`]
    pub fn define(def: FlowDef) -> FlowBuilder<I, O> {
        FlowBuilder {
            def,
            _marker: PhantomData,
        }
    }
}

impl<I, O> FlowBuilder<I, O>
where
    I: DeserializeOwned + Send + Sync + 'static,
    O: Serialize + Send + 'static,
{
    /// Attach the handler, producing the flow executor
    pub fn handler<F, Fut>(self, f: F) -> Flow<I, O>
    where
        F: Fn(Ctx, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WeftError>> + Send + 'static,
    {
        let def = Arc::new(self.def);
        let flow_name = Arc::clone(&def.name);
        let handler = FlowHandler(Arc::new(move |ctx, input| {
            let flow_name = Arc::clone(&flow_name);
            match serde_json::from_value::<I>(input) {
                Ok(typed) => {
                    let fut = f(ctx, typed);
                    Box::pin(async move {
                        let out = fut.await?;
                        serde_json::to_value(out).map_err(|e| WeftError::FlowValidation {
                            flow: flow_name,
                            target: ValidationTarget::Output,
                            source: SchemaError::single("", e.to_string()),
                        })
                    })
                }
                Err(e) => Box::pin(std::future::ready(Err(WeftError::FlowValidation {
                    flow: flow_name,
                    target: ValidationTarget::Input,
                    source: SchemaError::single("", e.to_string()),
                }))),
            }
        }));
        let executor = provide(move |_| {
            let handler = handler.clone();
            async move { Ok(handler) }
        })
        .named(def.name.to_string())
        .with_tags(def.tags.clone());
        Flow {
            executor,
            def,
            _marker: PhantomData,
        }
    }
}

/// One-shot form: `flow(def, handler)`
pub fn flow<I, O, F, Fut>(def: FlowDef, handler: F) -> Flow<I, O>
where
    I: DeserializeOwned + Send + Sync + 'static,
    O: Serialize + Send + 'static,
    F: Fn(Ctx, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, WeftError>> + Send + 'static,
{
    Flow::define(def).handler(handler)
}

/// Options for [`Flow::execute`]
#[derive(Default)]
pub struct ExecuteOptions {
    /// Borrow an existing scope; a fresh one is created (and disposed after
    /// the execution) when absent
    pub scope: Option<Scope>,
    /// Presets overlaid on the execution's pod
    pub presets: Vec<Preset>,
    /// Extra extensions for this execution, appended after the scope's
    pub extensions: Vec<Arc<dyn Extension>>,
    /// Initial context data
    pub tags: Vec<TaggedValue>,
    /// External cancel signal, forwarded to the pod
    pub cancel: Option<CancellationToken>,
}

impl<I, O> Flow<I, O> {
    pub fn name(&self) -> Arc<str> {
        Arc::clone(&self.def.name)
    }

    pub fn definition(&self) -> &FlowDef {
        &self.def
    }
}

impl<I, O> Flow<I, O>
where
    I: Serialize + DeserializeOwned + Send + Sync + 'static,
    O: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Execute the flow: open a pod, build the root context, validate the
    /// boundary values, run the handler through the extension chain
    #[instrument(skip(self, input, options), fields(flow = %self.def.name))]
    pub fn execute(&self, input: I, options: ExecuteOptions) -> Promised<O> {
        debug!("executing flow");
        let def = Arc::clone(&self.def);
        let handler_exec = self.executor.clone();
        let state = Arc::new(ExecutionState::new(Arc::clone(&def.name)));

        let (scope, owned_scope) = match options.scope {
            Some(s) => (s, false),
            None => (Scope::new(), true),
        };
        let pod = scope.pod_with(options.presets);
        let mut extensions = scope.snapshot_extensions();
        extensions.extend(options.extensions);
        let external_cancel = options.cancel;
        let ctx = Ctx::root(
            pod.clone(),
            Arc::clone(&state),
            extensions.clone(),
            options.tags,
            external_cancel.clone(),
        );

        let run = {
            let def = Arc::clone(&def);
            let ctx = ctx.clone();
            let pod = pod.clone();
            let state = Arc::clone(&state);
            let extensions = extensions.clone();
            async move {
                state.set_running();
                if let Some(external) = external_cancel {
                    let pod_token = pod.cancel_token();
                    if external.is_cancelled() {
                        pod_token.cancel();
                    } else {
                        tokio::spawn(async move {
                            external.cancelled().await;
                            pod_token.cancel();
                        });
                    }
                }
                for ext in &extensions {
                    ext.init_pod(&pod, &ctx).await?;
                }
                let input_value =
                    serde_json::to_value(input).map_err(|e| WeftError::FlowValidation {
                        flow: Arc::clone(&def.name),
                        target: ValidationTarget::Input,
                        source: SchemaError::single("", e.to_string()),
                    })?;
                let op = Operation::Execute {
                    flow: Arc::clone(&def.name),
                };
                let out =
                    invoke_flow_erased(Arc::clone(&def), handler_exec, ctx, input_value, op)
                        .await?;
                decode_output::<O>(&def.name, out)
            }
        };

        let wrapped = {
            let state = Arc::clone(&state);
            let pod_for_hooks = pod.clone();
            async move {
                let result = run.await;
                match &result {
                    Ok(_) => state.complete(),
                    Err(e) if matches!(e, WeftError::Cancelled) => state.cancel(e.clone()),
                    Err(e) => {
                        state.fail(e.clone());
                        for ext in &extensions {
                            ext.on_pod_error(e, &pod_for_hooks, &ctx).await;
                        }
                    }
                }
                let _ = pod_for_hooks.dispose().await;
                if owned_scope {
                    let _ = scope.dispose().await;
                }
                result
            }
        };

        Promised::from_execution(Box::pin(wrapped), Some(state), Some(pod))
    }
}

/// Run one flow invocation against an already-built context: cancellation
/// check, input validation, handler resolution through the pod, extension
/// chain, output validation
pub(crate) fn invoke_flow_erased(
    def: Arc<FlowDef>,
    handler_exec: Executor<FlowHandler>,
    ctx: Ctx,
    input: Value,
    op: Operation,
) -> BoxFuture<'static, Result<Value, WeftError>> {
    Box::pin(async move {
        if ctx.is_cancelled() {
            return Err(ctx.mark_cancelled());
        }
        let input = def
            .input
            .validate(&input)
            .map_err(|e| WeftError::FlowValidation {
                flow: Arc::clone(&def.name),
                target: ValidationTarget::Input,
                source: e,
            })?;
        let handler = ctx.pod().resolve(&handler_exec).await?;

        let terminal_ctx = ctx.clone();
        let terminal: TerminalFn = Box::new(move || {
            Box::pin(async move {
                let out = (handler.0)(terminal_ctx, input).await?;
                Ok(Arc::new(out) as AnyValue)
            })
        });
        let result = run_chain(
            ctx.extensions(),
            op,
            ctx.pod().scope().clone(),
            terminal,
        )
        .await?;
        let out = result
            .downcast_ref::<Value>()
            .cloned()
            .ok_or_else(|| WeftError::FlowValidation {
                flow: Arc::clone(&def.name),
                target: ValidationTarget::Output,
                source: SchemaError::single("", "extension returned a non-JSON value"),
            })?;
        def.output
            .validate(&out)
            .map_err(|e| WeftError::FlowValidation {
                flow: Arc::clone(&def.name),
                target: ValidationTarget::Output,
                source: e,
            })
    })
}

pub(crate) fn decode_output<O: DeserializeOwned>(
    flow: &Arc<str>,
    value: Value,
) -> Result<O, WeftError> {
    serde_json::from_value(value).map_err(|e| WeftError::FlowValidation {
        flow: Arc::clone(flow),
        target: ValidationTarget::Output,
        source: SchemaError::single("", e.to_string()),
    })
}
