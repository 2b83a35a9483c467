//! # Weft
//!
//! A dependency-graph runtime: applications are graphs of named
//! value-producing nodes (*executors*) whose values are resolved lazily,
//! cached per container (*scope*), propagated reactively, and optionally
//! scoped to short-lived isolated executions (*flows*) running inside
//! forked scopes (*pods*).
//!
//! ## Building blocks
//!
//! | Piece | What it is |
//! |-------|------------|
//! | [`Executor`] | A node: async factory + dependency arrangement + tags |
//! | `lazy` / `reactive` / `static` | Sibling references sharing the main executor's identity |
//! | [`Scope`] | Lazy, caching, concurrency-safe resolver with cleanups and events |
//! | [`Pod`] | Forked scope: snapshot inheritance, local mutation, no reactivity |
//! | [`Flow`] | Short-lived handler with schema-checked input/output |
//! | [`Ctx`] | Per-execution context tree: tag data, sub-flows, journal, parallel |
//! | [`Extension`] | Middleware wrapping every resolve and flow operation |
//! | [`Tag`] | Typed, schema-validated key addressing values in any source |
//! | [`Promised`] | Lazy composable result carrying execution data |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use weft::{provide, derive, Scope};
//!
//! let counter = provide(|_| async { Ok(0) }).named("counter");
//! let doubled = derive(counter.reactive(), |c: i32, _| async move { Ok(c * 2) });
//!
//! let scope = Scope::new();
//! assert_eq!(scope.resolve(&doubled).await?, 0);
//! scope.update(&counter, 5).await?;
//! assert_eq!(scope.resolve(&doubled).await?, 10);
//! # Ok::<(), weft::WeftError>(())
//! ```
//!
//! ## Modules
//!
//! - [`executor`] - executor records, kinds, presets, the factory controller
//! - [`deps`] - dependency arrangements (single, tuple, vec, named map)
//! - [`scope`] - the resolution engine: cache, cleanups, events, disposal
//! - [`accessor`] - per-executor runtime handles
//! - [`pod`] - forked-scope isolation
//! - [`flow`] - flow definitions and execution
//! - [`ctx`] - execution contexts
//! - [`extension`] - the middleware pipeline
//! - [`promised`] - lazy composable results
//! - [`tag`] - typed keys and tagged values
//! - [`schema`] - schema adapters (JSON Schema, serde round-trip)
//! - [`multi`] - keyed executor pools
//! - [`error`] - the error taxonomy

pub mod accessor;
pub mod ctx;
pub mod deps;
pub mod error;
pub mod executor;
pub mod extension;
pub mod flow;
pub mod multi;
pub mod pod;
pub mod promised;
pub mod schema;
pub mod scope;
pub mod tag;

pub use accessor::{Accessor, ResolveState};
pub use ctx::{Ctx, ParallelOutcome, ParallelStats};
pub use deps::{named, Dependency, Deps, Named};
pub use error::{ErrorContext, SchemaError, SchemaIssue, Stage, ValidationTarget, WeftError};
pub use executor::{
    derive, derive_stream, placeholder, preset, preset_with, provide, provide_stream, AnyValue,
    Ctl, ErasedExecutor, Executor, ExecutorId, ExecutorKind, LazyRef, Preset, ReactiveRef,
    StaticRef,
};
pub use extension::{Extension, Next, Operation, ParallelKind};
pub use flow::{flow, ExecuteOptions, Flow, FlowBuilder, FlowDef, FlowHandler};
pub use multi::{multi, MultiExecutor};
pub use pod::Pod;
pub use promised::{ExecutionData, ExecutionDetails, FlowStatus, Promised};
pub use schema::{any_schema, typed, JsonSchema, Schema, SchemaRef, Typed};
pub use scope::{
    ChangeEvent, ChangeKind, EntryState, ReleaseEvent, Scope, ScopeBuilder, Subscription,
};
pub use tag::{name_tag, Tag, TagId, TagMap, TagSource, TagStore, TaggedValue};
