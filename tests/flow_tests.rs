//! # Flow execution tests
//!
//! End-to-end flow scenarios:
//! - Sub-flow composition (`ctx.exec`) with context forking
//! - Dependency resolution through the execution pod
//! - Journaled steps and parallel gathers inside handlers
//! - Cancellation, mid-flight and pre-flight
//! - `Promised` chaining over execution results

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use weft::{
    flow, preset, provide, typed, Ctl, ExecuteOptions, Flow, FlowDef, FlowStatus, Promised, Scope,
    Tag, WeftError,
};

// ============================================================================
// TEST HELPERS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddInput {
    a: i64,
    b: i64,
}

fn add_flow() -> Flow<AddInput, i64> {
    flow(
        FlowDef::new("add", typed::<AddInput>(), typed::<i64>()),
        |_ctx, input: AddInput| async move { Ok(input.a + input.b) },
    )
}

// ============================================================================
// SUB-FLOW COMPOSITION
// ============================================================================

#[tokio::test]
async fn add_then_double_via_subflow() {
    let add = add_flow();
    let run = flow(
        FlowDef::new("run", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let add = add.clone();
            async move {
                let sum = ctx.exec(&add, AddInput { a: x, b: 1 }).await?;
                Ok(sum * 2)
            }
        },
    );

    assert_eq!(run.execute(3, ExecuteOptions::default()).await.unwrap(), 8);
}

#[tokio::test]
async fn subflow_shares_the_execution_pod() {
    let session = provide(|_| async { Ok(7i64) });

    let inner_session = session.clone();
    let inner = flow(
        FlowDef::new("inner", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let session = inner_session.clone();
            async move {
                let s = ctx.resolve(&session).await?;
                Ok(s + x)
            }
        },
    );

    let outer_session = session.clone();
    let outer = flow(
        FlowDef::new("outer", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let session = outer_session.clone();
            let inner = inner.clone();
            async move {
                // both resolutions hit the same pod cache entry
                let mine = ctx.resolve(&session).await?;
                let theirs = ctx.exec(&inner, x).await?;
                Ok(mine + theirs)
            }
        },
    );

    // preset the session inside the pod only
    let result = outer
        .execute(
            1,
            ExecuteOptions {
                presets: vec![preset(&session, 100)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, 201);
}

// ============================================================================
// JOURNAL AND PARALLEL INSIDE HANDLERS
// ============================================================================

#[tokio::test]
async fn journal_keys_are_stable_across_subflow_boundaries() {
    let side_effects = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&side_effects);
    let journaled = flow(
        FlowDef::new("journaled", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let side_effects = Arc::clone(&observed);
            async move {
                let a: i64 = {
                    let side_effects = Arc::clone(&side_effects);
                    ctx.run("fetch", move || async move {
                        side_effects.fetch_add(1, Ordering::SeqCst);
                        Ok(x * 10)
                    })
                    .await?
                };
                let b: i64 = ctx
                    .run("fetch", move || async move { Ok(-1) })
                    .await?;
                Ok(a + b)
            }
        },
    );

    // second run("fetch") replays the journal entry
    assert_eq!(
        journaled.execute(2, ExecuteOptions::default()).await.unwrap(),
        40
    );
    assert_eq!(side_effects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_subflows_gather() {
    let add = add_flow();
    let fan_out = flow(
        FlowDef::new("fan-out", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let add = add.clone();
            async move {
                let outcome = ctx
                    .parallel(vec![
                        ctx.exec(&add, AddInput { a: x, b: 1 }),
                        ctx.exec(&add, AddInput { a: x, b: 2 }),
                        ctx.exec(&add, AddInput { a: x, b: 3 }),
                    ])
                    .await?;
                assert_eq!(outcome.stats.succeeded, 3);
                Ok(outcome.results.into_iter().sum::<i64>())
            }
        },
    );

    // (10+1) + (10+2) + (10+3)
    assert_eq!(
        fan_out.execute(10, ExecuteOptions::default()).await.unwrap(),
        36
    );
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn cancelling_before_the_first_await_skips_the_handler() {
    let entered = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&entered);
    let f = flow(
        FlowDef::new("never", typed::<i64>(), typed::<i64>()),
        move |_ctx, x: i64| {
            let entered = Arc::clone(&observed);
            async move {
                entered.fetch_add(1, Ordering::SeqCst);
                Ok(x)
            }
        },
    );

    let token = CancellationToken::new();
    token.cancel();
    let details = f
        .execute(
            1,
            ExecuteOptions {
                cancel: Some(token),
                ..Default::default()
            },
        )
        .in_details()
        .await;

    assert!(matches!(details.result.unwrap_err(), WeftError::Cancelled));
    let data = details.data.unwrap();
    assert_eq!(data.status, FlowStatus::Cancelled);
    assert!(data.error.is_some());
    assert_eq!(entered.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_mid_flow_halts_subflow_dispatch() {
    let add = add_flow();
    let token = CancellationToken::new();
    let trigger = token.clone();

    let chained = flow(
        FlowDef::new("chained", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let add = add.clone();
            let trigger = trigger.clone();
            async move {
                let first = ctx.exec(&add, AddInput { a: x, b: 1 }).await?;
                trigger.cancel();
                // the next dispatch observes the cancellation
                let second = ctx.exec(&add, AddInput { a: first, b: 1 }).await?;
                Ok(second)
            }
        },
    );

    let details = chained
        .execute(
            0,
            ExecuteOptions {
                cancel: Some(token),
                ..Default::default()
            },
        )
        .in_details()
        .await;
    assert!(matches!(details.result.unwrap_err(), WeftError::Cancelled));
    assert_eq!(details.data.unwrap().status, FlowStatus::Cancelled);
}

#[tokio::test]
async fn pod_cleanups_run_despite_cancellation() {
    let released = Arc::new(AtomicUsize::new(0));
    let resource = {
        let released = Arc::clone(&released);
        provide(move |ctl: Ctl| {
            let released = Arc::clone(&released);
            async move {
                ctl.cleanup(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(1i64)
            }
        })
    };

    let token = CancellationToken::new();
    let trigger = token.clone();
    let resource_in = resource.clone();
    let f = flow(
        FlowDef::new("leaky", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let resource = resource_in.clone();
            let trigger = trigger.clone();
            async move {
                let v = ctx.resolve(&resource).await?;
                trigger.cancel();
                let doubled = ctx
                    .run("double", move || async move { Ok(v * 2) })
                    .await?;
                Ok(doubled + x)
            }
        },
    );

    let result = f
        .execute(
            0,
            ExecuteOptions {
                cancel: Some(token),
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_err());
    assert_eq!(released.load(Ordering::SeqCst), 1, "pod disposal ran cleanups");
}

// ============================================================================
// PROMISED CHAINING OVER EXECUTIONS
// ============================================================================

#[tokio::test]
async fn promised_chains_keep_execution_data() {
    let promised = add_flow()
        .execute(AddInput { a: 2, b: 2 }, ExecuteOptions::default())
        .map(|v| v * 10);

    assert_eq!(promised.ctx().unwrap().flow.as_ref(), "add");
    assert_eq!(promised.await.unwrap(), 40);
}

#[tokio::test]
async fn promised_all_gathers_executions() {
    let add = add_flow();
    let batch = Promised::all(vec![
        add.execute(AddInput { a: 1, b: 1 }, ExecuteOptions::default()),
        add.execute(AddInput { a: 2, b: 2 }, ExecuteOptions::default()),
    ]);
    assert_eq!(batch.await.unwrap(), vec![2, 4]);
}

#[tokio::test]
async fn tags_seed_the_root_context() {
    let user: Tag<String> = Tag::typed().with_label("user");
    let tag = user.clone();
    let whoami = flow(
        FlowDef::new("whoami", typed::<i64>(), typed::<String>()),
        move |ctx, _x: i64| {
            let tag = tag.clone();
            async move { ctx.get(&tag) }
        },
    );

    let result = whoami
        .execute(
            0,
            ExecuteOptions {
                tags: vec![user.entry("amelie".to_string()).unwrap()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result, "amelie");
}

#[tokio::test]
async fn flow_borrowing_a_scope_leaves_it_usable() {
    let hits = Arc::new(AtomicUsize::new(0));
    let shared = {
        let hits = Arc::clone(&hits);
        provide(move |_| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(5i64)
            }
        })
    };

    let shared_in = shared.clone();
    let f = flow(
        FlowDef::new("reader", typed::<i64>(), typed::<i64>()),
        move |ctx, x: i64| {
            let shared = shared_in.clone();
            async move {
                let v = ctx.resolve(&shared).await?;
                Ok(v + x)
            }
        },
    );

    let scope = Scope::new();
    scope.resolve(&shared).await.unwrap();

    // two executions inherit the parent's resolved value by snapshot
    for x in [1, 2] {
        let opts = ExecuteOptions {
            scope: Some(scope.clone()),
            ..Default::default()
        };
        assert_eq!(f.execute(x, opts).await.unwrap(), 5 + x);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1, "factory ran once, in the parent");

    // the borrowed scope is still live
    assert_eq!(scope.resolve(&shared).await.unwrap(), 5);
    scope.dispose().await.unwrap();
}
