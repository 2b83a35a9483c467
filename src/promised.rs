//! Promised: lazy, composable flow results
//!
//! A `Promised<T>` wraps a shared future together with the execution-state
//! channel of the flow that produced it (status, error, journal) and the
//! originating pod, so chained operations stay bound to the same isolation
//! unit. Awaiting it yields `Result<T, WeftError>`.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;

use crate::error::WeftError;
use crate::pod::Pod;

/// Lifecycle of one flow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Mutable per-execution record shared between a flow's ctx tree and its
/// `Promised` results
pub(crate) struct ExecutionState {
    flow: Arc<str>,
    status: Mutex<FlowStatus>,
    error: Mutex<Option<WeftError>>,
    journal: Mutex<HashMap<String, Value>>,
}

impl ExecutionState {
    pub(crate) fn new(flow: Arc<str>) -> Self {
        Self {
            flow,
            status: Mutex::new(FlowStatus::Pending),
            error: Mutex::new(None),
            journal: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_running(&self) {
        *self.status.lock().unwrap() = FlowStatus::Running;
    }

    pub(crate) fn complete(&self) {
        *self.status.lock().unwrap() = FlowStatus::Completed;
    }

    pub(crate) fn fail(&self, error: WeftError) {
        *self.status.lock().unwrap() = FlowStatus::Failed;
        *self.error.lock().unwrap() = Some(error);
    }

    pub(crate) fn cancel(&self, error: WeftError) {
        *self.status.lock().unwrap() = FlowStatus::Cancelled;
        *self.error.lock().unwrap() = Some(error);
    }

    pub(crate) fn journal_get(&self, key: &str) -> Option<Value> {
        self.journal.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn journal_put(&self, key: &str, value: Value) {
        self.journal.lock().unwrap().insert(key.to_string(), value);
    }

    pub(crate) fn snapshot(&self) -> ExecutionData {
        ExecutionData {
            flow: Arc::clone(&self.flow),
            status: *self.status.lock().unwrap(),
            error: self.error.lock().unwrap().clone(),
            journal: self.journal.lock().unwrap().clone(),
        }
    }
}

/// Point-in-time snapshot of an execution's data
#[derive(Debug, Clone)]
pub struct ExecutionData {
    pub flow: Arc<str>,
    pub status: FlowStatus,
    pub error: Option<WeftError>,
    pub journal: HashMap<String, Value>,
}

/// Result plus execution data, from [`Promised::in_details`]
#[derive(Debug)]
pub struct ExecutionDetails<T> {
    pub result: Result<T, WeftError>,
    pub data: Option<ExecutionData>,
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, WeftError>>>;

/// Lazy composable result of a flow execution
pub struct Promised<T> {
    fut: SharedResult<T>,
    state: Option<Arc<ExecutionState>>,
    pod: Option<Pod>,
}

impl<T> Clone for Promised<T> {
    fn clone(&self) -> Self {
        Self {
            fut: self.fut.clone(),
            state: self.state.clone(),
            pod: self.pod.clone(),
        }
    }
}

impl<T> Promised<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_execution(
        fut: BoxFuture<'static, Result<T, WeftError>>,
        state: Option<Arc<ExecutionState>>,
        pod: Option<Pod>,
    ) -> Self {
        Self {
            fut: fut.shared(),
            state,
            pod,
        }
    }

    /// Wrap an arbitrary future
    pub fn from_future<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = Result<T, WeftError>> + Send + 'static,
    {
        Self::from_execution(Box::pin(fut), None, None)
    }

    /// Capture a fallible synchronous entry point lazily
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, WeftError> + Send + 'static,
    {
        Self::from_future(async move { f() })
    }

    /// Already-settled success
    pub fn resolved(value: T) -> Self {
        Self::from_future(std::future::ready(Ok(value)))
    }

    /// Already-settled failure
    pub fn rejected(error: WeftError) -> Self {
        Self::from_future(std::future::ready(Err(error)))
    }

    fn derive<U, Fut>(self, fut: Fut) -> Promised<U>
    where
        U: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<U, WeftError>> + Send + 'static,
    {
        Promised {
            fut: (Box::pin(fut) as BoxFuture<'static, Result<U, WeftError>>).shared(),
            state: self.state,
            pod: self.pod,
        }
    }

    /// Transform a success value
    pub fn map<U, F>(self, f: F) -> Promised<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let fut = self.fut.clone();
        self.derive(async move { fut.await.map(f) })
    }

    /// Chain into another promised computation (flat-map)
    pub fn switch<U, F>(self, f: F) -> Promised<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Promised<U> + Send + 'static,
    {
        let fut = self.fut.clone();
        self.derive(async move {
            match fut.await {
                Ok(v) => f(v).await,
                Err(e) => Err(e),
            }
        })
    }

    /// Transform a failure
    pub fn map_error<F>(self, f: F) -> Promised<T>
    where
        F: FnOnce(WeftError) -> WeftError + Send + 'static,
    {
        let fut = self.fut.clone();
        self.derive(async move { fut.await.map_err(f) })
    }

    /// Recover from a failure with another promised computation
    pub fn switch_error<F>(self, f: F) -> Promised<T>
    where
        F: FnOnce(WeftError) -> Promised<T> + Send + 'static,
    {
        let fut = self.fut.clone();
        self.derive(async move {
            match fut.await {
                Ok(v) => Ok(v),
                Err(e) => f(e).await,
            }
        })
    }

    /// Execution data of the originating flow, when there is one
    pub fn ctx(&self) -> Option<ExecutionData> {
        self.state.as_ref().map(|s| s.snapshot())
    }

    /// The pod this result is bound to, when produced by a flow
    pub fn pod(&self) -> Option<&Pod> {
        self.pod.as_ref()
    }

    /// Await the result together with the final execution data
    pub async fn in_details(self) -> ExecutionDetails<T> {
        let result = self.fut.clone().await;
        ExecutionDetails {
            result,
            data: self.state.as_ref().map(|s| s.snapshot()),
        }
    }

    /// Plain future view of this result
    pub fn to_promise(self) -> BoxFuture<'static, Result<T, WeftError>> {
        Box::pin(self.fut)
    }

    /// Gather every result; the first rejection fails the whole gather
    pub fn all(items: Vec<Promised<T>>) -> Promised<Vec<T>> {
        let pod = items.iter().find_map(|p| p.pod.clone());
        let branches: Vec<_> = items.into_iter().map(|p| p.fut).collect();
        Promised {
            fut: (Box::pin(futures::future::try_join_all(branches))
                as BoxFuture<'static, Result<Vec<T>, WeftError>>)
                .shared(),
            state: None,
            pod,
        }
    }

    /// First settled result wins
    pub fn race(items: Vec<Promised<T>>) -> Promised<T> {
        if items.is_empty() {
            return Promised::rejected(WeftError::flow("parallel/empty"));
        }
        let pod = items.iter().find_map(|p| p.pod.clone());
        let branches: Vec<_> = items.into_iter().map(|p| p.fut).collect();
        Promised {
            fut: (Box::pin(async move {
                let (result, _, _) = futures::future::select_all(branches).await;
                result
            }) as BoxFuture<'static, Result<T, WeftError>>)
                .shared(),
            state: None,
            pod,
        }
    }

    /// Gather every result without failing; rejections settle in place
    pub fn all_settled(items: Vec<Promised<T>>) -> Promised<Vec<Result<T, WeftError>>> {
        let pod = items.iter().find_map(|p| p.pod.clone());
        let branches: Vec<_> = items.into_iter().map(|p| p.fut).collect();
        Promised {
            fut: (Box::pin(async move {
                Ok(futures::future::join_all(branches).await)
            })
                as BoxFuture<'static, Result<Vec<Result<T, WeftError>>, WeftError>>)
                .shared(),
            state: None,
            pod,
        }
    }
}

impl<T> IntoFuture for Promised<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, WeftError>;
    type IntoFuture = SharedResult<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.fut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn map_transforms_success() {
        let p = Promised::resolved(4).map(|v| v * 10);
        assert_eq!(p.await.unwrap(), 40);
    }

    #[tokio::test]
    async fn switch_chains() {
        let p = Promised::resolved(2).switch(|v| Promised::resolved(v + 1));
        assert_eq!(p.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn map_error_translates() {
        let p = Promised::<i32>::rejected(WeftError::flow("inner"))
            .map_error(|_| WeftError::flow("outer"));
        let err = p.await.unwrap_err();
        assert!(err.to_string().contains("outer"));
    }

    #[tokio::test]
    async fn switch_error_recovers() {
        let p = Promised::<i32>::rejected(WeftError::flow("x")).switch_error(|_| {
            Promised::resolved(9)
        });
        assert_eq!(p.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn all_gathers_in_order() {
        let p = Promised::all(vec![
            Promised::resolved(1),
            Promised::resolved(2),
            Promised::resolved(3),
        ]);
        assert_eq!(p.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn all_fails_fast() {
        let p = Promised::all(vec![
            Promised::resolved(1),
            Promised::rejected(WeftError::flow("broken")),
        ]);
        assert!(p.await.is_err());
    }

    #[tokio::test]
    async fn all_settled_never_fails() {
        let p = Promised::all_settled(vec![
            Promised::resolved(1),
            Promised::rejected(WeftError::flow("broken")),
        ]);
        let settled = p.await.unwrap();
        assert!(settled[0].is_ok());
        assert!(settled[1].is_err());
    }

    #[tokio::test]
    async fn race_returns_a_winner() {
        let p = Promised::race(vec![Promised::resolved(7), Promised::resolved(8)]);
        let v = p.await.unwrap();
        assert!(v == 7 || v == 8);
    }

    #[tokio::test]
    async fn race_of_nothing_rejects() {
        let p = Promised::<i32>::race(vec![]);
        assert!(p.await.is_err());
    }

    #[tokio::test]
    async fn from_fn_is_lazy_and_shared() {
        let p = Promised::from_fn(|| Ok(5));
        let a = p.clone().await.unwrap();
        let b = p.await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn in_details_without_execution_has_no_data() {
        let details = Promised::resolved(1).in_details().await;
        assert_eq!(details.result.unwrap(), 1);
        assert!(details.data.is_none());
    }
}
