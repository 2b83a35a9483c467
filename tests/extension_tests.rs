//! # Extension pipeline tests
//!
//! The middleware onion around every core operation:
//! - Registration order is outermost-first; the unwind runs in reverse
//! - Short-circuiting (replay caches) and value substitution
//! - Error translation on the unwind path
//! - Lifecycle hooks (init, init_pod, dispose) and error hooks
//! - A timeout extension racing `next()` (the documented FlowTimeout recipe)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weft::{
    flow, provide, typed, AnyValue, ExecuteOptions, Extension, FlowDef, Next, Operation, Scope,
    WeftError,
};

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Records enter/exit events under a label
struct Tracer {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Extension for Tracer {
    fn name(&self) -> &str {
        self.label
    }

    async fn wrap(
        &self,
        op: &Operation,
        _scope: &Scope,
        next: Next,
    ) -> Result<AnyValue, WeftError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:enter:{}", self.label, op.kind_name()));
        let result = next.run().await;
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:exit:{}", self.label, op.kind_name()));
        result
    }
}

// ============================================================================
// ORDERING
// ============================================================================

#[tokio::test]
async fn wrap_order_is_onion() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::builder()
        .extension(Arc::new(Tracer {
            label: "outer",
            log: Arc::clone(&log),
        }))
        .extension(Arc::new(Tracer {
            label: "inner",
            log: Arc::clone(&log),
        }))
        .build();

    let one = provide(|_| async { Ok(1) });
    scope.resolve(&one).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "outer:enter:resolve",
            "inner:enter:resolve",
            "inner:exit:resolve",
            "outer:exit:resolve",
        ]
    );
}

#[tokio::test]
async fn flow_operations_traverse_the_chain() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let scope = Scope::builder()
        .extension(Arc::new(Tracer {
            label: "t",
            log: Arc::clone(&log),
        }))
        .build();

    let noop = flow(
        FlowDef::new("noop", typed::<i64>(), typed::<i64>()),
        |ctx, x: i64| async move {
            let y: i64 = ctx.run("step", move || async move { Ok(x) }).await?;
            Ok(y)
        },
    );
    noop.execute(
        1,
        ExecuteOptions {
            scope: Some(scope.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    scope.dispose().await.unwrap();

    let log = log.lock().unwrap();
    let pos = |needle: &str| log.iter().position(|l| l == needle).unwrap();
    // the handler executor resolves first, then the execute op wraps the
    // handler run with the journal op inside it
    assert!(pos("t:enter:resolve") < pos("t:enter:execute"));
    assert!(pos("t:enter:execute") < pos("t:enter:journal"));
    assert!(pos("t:exit:journal") < pos("t:exit:execute"));
    assert_eq!(log.last().unwrap(), "t:exit:execute");
}

// ============================================================================
// SHORT-CIRCUIT AND SUBSTITUTION
// ============================================================================

/// Replays journal steps from a fixed table without calling `next`
struct JournalReplay {
    table: Mutex<std::collections::HashMap<String, Value>>,
    hits: AtomicUsize,
}

#[async_trait]
impl Extension for JournalReplay {
    fn name(&self) -> &str {
        "journal-replay"
    }

    async fn wrap(
        &self,
        op: &Operation,
        _scope: &Scope,
        next: Next,
    ) -> Result<AnyValue, WeftError> {
        if let Operation::Journal { key } = op {
            if let Some(v) = self.table.lock().unwrap().get(key.as_ref()) {
                self.hits.fetch_add(1, Ordering::SeqCst);
                return Ok(Arc::new(v.clone()) as AnyValue);
            }
        }
        next.run().await
    }
}

#[tokio::test]
async fn extension_can_replay_journal_steps() {
    let replay = Arc::new(JournalReplay {
        table: Mutex::new(
            [("fetch".to_string(), Value::from(99i64))].into_iter().collect(),
        ),
        hits: AtomicUsize::new(0),
    });
    let scope = Scope::builder().extension(replay.clone()).build();

    let ran = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&ran);
    let f = flow(
        FlowDef::new("fetcher", typed::<i64>(), typed::<i64>()),
        move |ctx, _x: i64| {
            let ran = Arc::clone(&observed);
            async move {
                ctx.run("fetch", move || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(0i64)
                })
                .await
            }
        },
    );

    let result = f
        .execute(
            0,
            ExecuteOptions {
                scope: Some(scope.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, 99, "the replayed value wins");
    assert_eq!(ran.load(Ordering::SeqCst), 0, "the step body never ran");
    assert_eq!(replay.hits.load(Ordering::SeqCst), 1);
    scope.dispose().await.unwrap();
}

struct ValueDoubler;

#[async_trait]
impl Extension for ValueDoubler {
    async fn wrap(
        &self,
        op: &Operation,
        _scope: &Scope,
        next: Next,
    ) -> Result<AnyValue, WeftError> {
        let value = next.run().await?;
        if matches!(op, Operation::Resolve { .. }) {
            if let Some(v) = value.downcast_ref::<i32>() {
                return Ok(Arc::new(v * 2) as AnyValue);
            }
        }
        Ok(value)
    }
}

#[tokio::test]
async fn extension_can_substitute_resolved_values() {
    let scope = Scope::builder().extension(Arc::new(ValueDoubler)).build();
    let ten = provide(|_| async { Ok(10i32) });
    assert_eq!(scope.resolve(&ten).await.unwrap(), 20);
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

struct ErrorTranslator;

#[async_trait]
impl Extension for ErrorTranslator {
    async fn wrap(
        &self,
        _op: &Operation,
        _scope: &Scope,
        next: Next,
    ) -> Result<AnyValue, WeftError> {
        next.run().await.map_err(|e| match e {
            WeftError::FactoryExecution { .. } => WeftError::flow("translated"),
            other => other,
        })
    }
}

#[tokio::test]
async fn extension_translates_errors_on_unwind() {
    let scope = Scope::builder().extension(Arc::new(ErrorTranslator)).build();
    let broken = provide(|_| async { Err::<i32, _>(WeftError::flow("inner")) });

    let err = scope.resolve(&broken).await.unwrap_err();
    assert!(matches!(err, WeftError::Flow { ref code, .. } if code.as_ref() == "translated"));
}

struct ErrorCounter {
    seen: AtomicUsize,
}

#[async_trait]
impl Extension for ErrorCounter {
    async fn on_error(&self, _error: &WeftError, _scope: &Scope) {
        self.seen.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn on_error_hook_observes_failures() {
    let counter = Arc::new(ErrorCounter {
        seen: AtomicUsize::new(0),
    });
    let scope = Scope::builder().extension(counter.clone()).build();
    let broken = provide(|_| async { Err::<i32, _>(WeftError::flow("x")) });

    let _ = scope.resolve(&broken).await;
    assert!(counter.seen.load(Ordering::SeqCst) >= 1);
}

// ============================================================================
// LIFECYCLE HOOKS
// ============================================================================

#[derive(Default)]
struct LifecycleProbe {
    inits: AtomicUsize,
    pod_inits: AtomicUsize,
    disposes: AtomicUsize,
    pod_disposes: AtomicUsize,
}

#[async_trait]
impl Extension for LifecycleProbe {
    async fn init(&self, _scope: &Scope) -> Result<(), WeftError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn init_pod(&self, _pod: &weft::Pod, _ctx: &weft::Ctx) -> Result<(), WeftError> {
        self.pod_inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self, _scope: &Scope) {
        self.disposes.fetch_add(1, Ordering::SeqCst);
    }

    async fn dispose_pod(&self, _pod: &weft::Pod) {
        self.pod_disposes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn lifecycle_hooks_fire_once_each() {
    let probe = Arc::new(LifecycleProbe::default());
    let scope = Scope::builder().extension(probe.clone()).build();

    let f = flow(
        FlowDef::new("touch", typed::<i64>(), typed::<i64>()),
        |_ctx, x: i64| async move { Ok(x) },
    );
    f.execute(
        1,
        ExecuteOptions {
            scope: Some(scope.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    scope.dispose().await.unwrap();

    assert_eq!(probe.inits.load(Ordering::SeqCst), 1);
    assert_eq!(probe.pod_inits.load(Ordering::SeqCst), 1);
    assert_eq!(probe.disposes.load(Ordering::SeqCst), 1);
    assert_eq!(probe.pod_disposes.load(Ordering::SeqCst), 1);
}

// ============================================================================
// TIMEOUT RECIPE
// ============================================================================

/// Timeouts are not built in; an extension races `next()` against a timer
struct Timeout {
    after: Duration,
}

#[async_trait]
impl Extension for Timeout {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn wrap(
        &self,
        op: &Operation,
        _scope: &Scope,
        next: Next,
    ) -> Result<AnyValue, WeftError> {
        if !matches!(op, Operation::Execute { .. }) {
            return next.run().await;
        }
        match tokio::time::timeout(self.after, next.run()).await {
            Ok(result) => result,
            Err(_) => Err(WeftError::FlowTimeout {
                after_ms: self.after.as_millis() as u64,
            }),
        }
    }
}

#[tokio::test]
async fn timeout_extension_raises_flow_timeout() {
    let slow = flow(
        FlowDef::new("slow", typed::<i64>(), typed::<i64>()),
        |_ctx, x: i64| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(x)
        },
    );

    let err = slow
        .execute(
            1,
            ExecuteOptions {
                extensions: vec![Arc::new(Timeout {
                    after: Duration::from_millis(20),
                })],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::FlowTimeout { .. }));
}
