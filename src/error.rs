//! Error taxonomy for the weft runtime
//!
//! One top-level enum (`WeftError`) surfaces every failure the engine can
//! produce, plus the structures attached to the interesting ones:
//! `SchemaError` for validation issues and `ErrorContext` for factory
//! failures. Errors are `Clone` so a rejected cache entry can fan out to
//! every awaiter of a shared pending resolution.

use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

/// A single validation issue produced by a schema adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaIssue {
    /// Location of the offending value (instance path, `""` for the root)
    pub path: String,
    /// Human-readable description
    pub message: String,
}

impl SchemaIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Validation failure carrying every issue the schema reported.
#[derive(Debug, Clone, Error)]
#[error("schema validation failed: {}", format_issues(.issues))]
pub struct SchemaError {
    pub issues: Vec<SchemaIssue>,
}

impl SchemaError {
    pub fn new(issues: Vec<SchemaIssue>) -> Self {
        Self { issues }
    }

    /// Single-issue convenience constructor
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![SchemaIssue::new(path, message)],
        }
    }
}

fn format_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Stage of a resolution at which a failure was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DependencyResolution,
    FactoryExecution,
    Validation,
    PostProcessing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::DependencyResolution => write!(f, "dependency-resolution"),
            Stage::FactoryExecution => write!(f, "factory-execution"),
            Stage::Validation => write!(f, "validation"),
            Stage::PostProcessing => write!(f, "post-processing"),
        }
    }
}

/// Context captured when a factory or dependency fails
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Best-effort executor name (from its name tag, else `executor#N`)
    pub executor: Arc<str>,
    /// Executor stack at the failure point, outermost first
    pub chain: Vec<Arc<str>>,
    /// Stage the failure was observed in
    pub stage: Stage,
    /// Wall-clock capture time
    pub at: SystemTime,
    /// Free-form additional info
    pub detail: Option<String>,
}

impl ErrorContext {
    pub fn new(executor: Arc<str>, chain: Vec<Arc<str>>, stage: Stage) -> Self {
        Self {
            executor,
            chain,
            stage,
            at: SystemTime::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Whether a flow validation failure concerned the input or the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTarget {
    Input,
    Output,
}

impl std::fmt::Display for ValidationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationTarget::Input => write!(f, "input"),
            ValidationTarget::Output => write!(f, "output"),
        }
    }
}

/// Top-level error type for the weft runtime
#[derive(Debug, Clone, Error)]
pub enum WeftError {
    /// Any operation against a scope that has already been disposed
    #[error("scope has been disposed")]
    ScopeDisposed,

    /// `Accessor::get` on an executor with no settled value
    #[error("executor '{executor}' is not resolved")]
    ExecutorNotResolved { executor: Arc<str> },

    /// A dependency of `dependent` could not be resolved
    #[error("failed to resolve dependency{} of '{dependent}'", .missing.as_deref().map(|m| format!(" '{m}'")).unwrap_or_default())]
    DependencyResolution {
        dependent: Arc<str>,
        missing: Option<Arc<str>>,
        #[source]
        source: Option<Box<WeftError>>,
    },

    /// A factory returned an error; the chain and stage are in `context`
    #[error("factory for '{}' failed: {message}", .context.executor)]
    FactoryExecution {
        context: ErrorContext,
        message: String,
        #[source]
        source: Option<Box<WeftError>>,
    },

    /// Schema validation failure (tag write, flow boundary, multi key)
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Tag lookup found nothing and the tag has no default
    #[error("tag '{label}' not found in source")]
    TagMissing { label: Arc<str> },

    /// A reactive dependency was declared while resolving through a pod
    #[error("executor '{executor}' declares a reactive dependency, which is forbidden in pods")]
    PodReactivityForbidden { executor: Arc<str> },

    /// Flow input or output failed its schema
    #[error("flow '{flow}' {target} validation failed")]
    FlowValidation {
        flow: Arc<str>,
        target: ValidationTarget,
        #[source]
        source: SchemaError,
    },

    /// Raised by timeout extensions racing `next()` against a timer
    #[error("flow timed out after {after_ms}ms")]
    FlowTimeout { after_ms: u64 },

    /// Domain failure signalled by a flow handler
    #[error("flow error [{code}]")]
    Flow {
        code: Arc<str>,
        data: Option<serde_json::Value>,
    },

    /// A resolution re-entered an executor already on the request stack
    #[error("circular dependency: {}", .chain.iter().map(|c| c.as_ref()).collect::<Vec<_>>().join(" -> "))]
    CircularDependency { chain: Vec<Arc<str>> },

    /// Cooperative cancellation observed at an engine checkpoint
    #[error("execution cancelled")]
    Cancelled,
}

impl WeftError {
    /// Flow-handler convenience constructor
    pub fn flow(code: impl Into<Arc<str>>) -> Self {
        WeftError::Flow {
            code: code.into(),
            data: None,
        }
    }

    /// Flow-handler constructor with attached data
    pub fn flow_with(code: impl Into<Arc<str>>, data: serde_json::Value) -> Self {
        WeftError::Flow {
            code: code.into(),
            data: Some(data),
        }
    }

    /// True for the engine signals that must pass through factory-error
    /// wrapping untouched.
    pub(crate) fn is_engine_signal(&self) -> bool {
        matches!(
            self,
            WeftError::Cancelled | WeftError::ScopeDisposed | WeftError::CircularDependency { .. }
        )
    }
}
