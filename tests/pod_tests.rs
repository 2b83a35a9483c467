//! # Pod isolation tests
//!
//! Forked-scope behavior across the public surface:
//! - Snapshot inheritance of resolved and in-flight parent state
//! - Mutation locality (parent and sibling pods unaffected)
//! - Reactivity forbidden during pod resolution
//! - Disposal independence

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft::{derive, preset, provide, Executor, Scope, WeftError};

// ============================================================================
// TEST HELPERS
// ============================================================================

fn slow_counting(value: i32, calls: Arc<AtomicUsize>) -> Executor<i32> {
    provide(move |_| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(value)
        }
    })
}

// ============================================================================
// SNAPSHOT INHERITANCE
// ============================================================================

#[tokio::test]
async fn pod_preset_shadows_parent_while_parent_keeps_its_value() {
    let counter = provide(|_| async { Ok(0) });
    let scope = Scope::new();
    scope.resolve(&counter).await.unwrap();

    let pod = scope.pod_with([preset(&counter, 7)]);
    assert_eq!(pod.resolve(&counter).await.unwrap(), 7);
    assert_eq!(scope.resolve(&counter).await.unwrap(), 0);
}

#[tokio::test]
async fn pod_shares_an_in_flight_parent_resolution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let exec = slow_counting(5, Arc::clone(&calls));
    let scope = Scope::new();
    let pod = scope.pod();

    // start in the parent, join from the pod while still pending
    let (parent_value, pod_value) = tokio::join!(scope.resolve(&exec), pod.resolve(&exec));
    assert_eq!(parent_value.unwrap(), 5);
    assert_eq!(pod_value.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one factory run, shared");
}

#[tokio::test]
async fn pod_resolves_locally_when_parent_has_no_entry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let exec = slow_counting(9, Arc::clone(&calls));
    let scope = Scope::new();
    let pod = scope.pod();

    assert_eq!(pod.resolve(&exec).await.unwrap(), 9);
    // the value lives in the pod only
    assert!(scope.accessor(&exec).lookup().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// MUTATION LOCALITY
// ============================================================================

#[tokio::test]
async fn updates_in_one_pod_are_invisible_everywhere_else() {
    let counter = provide(|_| async { Ok(0) });
    let scope = Scope::new();
    scope.resolve(&counter).await.unwrap();

    let left = scope.pod();
    let right = scope.pod();
    left.resolve(&counter).await.unwrap();
    right.resolve(&counter).await.unwrap();

    left.update(&counter, 10).await.unwrap();
    assert_eq!(left.resolve(&counter).await.unwrap(), 10);
    assert_eq!(right.resolve(&counter).await.unwrap(), 0);
    assert_eq!(scope.resolve(&counter).await.unwrap(), 0);
}

#[tokio::test]
async fn dispose_pod_leaves_the_parent_cache_unchanged() {
    let counter = provide(|_| async { Ok(3) });
    let scope = Scope::new();
    scope.resolve(&counter).await.unwrap();

    let pod = scope.pod();
    pod.resolve(&counter).await.unwrap();
    pod.update(&counter, 42).await.unwrap();
    scope.dispose_pod(&pod).await.unwrap();

    assert_eq!(scope.resolve(&counter).await.unwrap(), 3);
}

// ============================================================================
// REACTIVITY
// ============================================================================

#[tokio::test]
async fn reactive_resolution_fails_in_pods_without_caching() {
    let counter = provide(|_| async { Ok(1) });
    let doubled = derive(counter.reactive(), |c: i32, _| async move { Ok(c * 2) });
    let scope = Scope::new();
    let pod = scope.pod();

    for _ in 0..2 {
        let err = pod.resolve(&doubled).await.unwrap_err();
        assert!(matches!(err, WeftError::PodReactivityForbidden { .. }));
        assert!(pod.accessor(&doubled).lookup().is_none());
    }

    // resolved in the parent first, the pod inherits the value by snapshot
    assert_eq!(scope.resolve(&doubled).await.unwrap(), 2);
    let fresh = scope.pod();
    assert_eq!(fresh.resolve(&doubled).await.unwrap(), 2);
}

#[tokio::test]
async fn plain_and_lazy_dependencies_still_work_in_pods() {
    let base = provide(|_| async { Ok(4) });
    let plain = derive(base.clone(), |b: i32, _| async move { Ok(b + 1) });
    let lazy = derive(base.lazy(), |acc: weft::Accessor<i32>, _| async move {
        let v = acc.resolve().await?;
        Ok(v + 2)
    });

    let scope = Scope::new();
    let pod = scope.pod();
    assert_eq!(pod.resolve(&plain).await.unwrap(), 5);
    assert_eq!(pod.resolve(&lazy).await.unwrap(), 6);
}
