//! Completion plumbing for operations that finish on another task.
//!
//! An operation returns immediately and reports its outcome later, exactly
//! once, through a continuation, a future, or both. `OpContext` is the value
//! that travels across the suspension point: the subject being mutated plus
//! whichever of the two channels the caller attached.

use crate::errors::{OrchestratorError, OrchestratorResult};
use futures::{
    FutureExt,
    future::{BoxFuture, Future},
};
use std::{
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Continuation<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, ()> + Send>;

/// A continuation invoked once with the outcome of an operation.
pub struct AsyncCompletionCallback<T> {
    inner: Continuation<T>,
}

impl<T: Send + 'static> AsyncCompletionCallback<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Box::new(move |result| f(result).boxed()),
        }
    }

    /// Run the continuation. Consumes the callback so it can only fire once.
    pub async fn complete(self, result: T) {
        (self.inner)(result).await
    }
}

impl<T> std::fmt::Debug for AsyncCompletionCallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncCompletionCallback")
    }
}

/// Write half of an [`AsyncCallFuture`].
#[derive(Debug)]
pub struct FutureCompleter<T> {
    tx: oneshot::Sender<T>,
}

impl<T> FutureCompleter<T> {
    /// Deliver the result. Returns false when the caller already dropped the future.
    pub fn complete(self, result: T) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Handle a synchronous caller can await for the outcome of an operation.
///
/// Resolves to `CompletionDropped` if the completer is dropped without
/// delivering, which only happens when a collaborator breaks the
/// exactly-once contract.
#[derive(Debug)]
pub struct AsyncCallFuture<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> AsyncCallFuture<T> {
    /// A future that is already resolved.
    pub fn completed(result: T) -> Self {
        let (completer, future) = async_call_future();
        completer.complete(result);
        future
    }
}

impl<T> Future for AsyncCallFuture<T> {
    type Output = OrchestratorResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|res| res.map_err(|_| OrchestratorError::CompletionDropped))
    }
}

/// Create a connected completer/future pair.
pub fn async_call_future<T>() -> (FutureCompleter<T>, AsyncCallFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (FutureCompleter { tx }, AsyncCallFuture { rx })
}

/// Run `work` to completion, substituting `fallback()` if it panics.
///
/// Continuations use this around the bookkeeping that produces their result,
/// so a caller always hears back with a failure instead of a dropped future.
pub async fn settle<T, F>(work: F, fallback: impl FnOnce() -> T) -> T
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!("completion processing panicked; reporting failure instead");
            fallback()
        }
    }
}

/// State carried from dispatch to completion of one operation.
#[derive(Debug)]
pub struct OpContext<S, T> {
    subject: S,
    parent: Option<AsyncCompletionCallback<T>>,
    future: Option<FutureCompleter<T>>,
}

impl<S, T> OpContext<S, T>
where
    T: Clone + Send + 'static,
{
    pub fn new(
        subject: S,
        parent: Option<AsyncCompletionCallback<T>>,
        future: Option<FutureCompleter<T>>,
    ) -> Self {
        Self {
            subject,
            parent,
            future,
        }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    /// Deliver `result` to the continuation first, then to the future.
    ///
    /// A panicking continuation is contained here so the future still
    /// receives the same result.
    pub async fn complete(self, result: T) {
        if let Some(parent) = self.parent {
            let delivered = AssertUnwindSafe(parent.complete(result.clone()))
                .catch_unwind()
                .await;
            if delivered.is_err() {
                warn!("completion continuation panicked; result still forwarded to future");
            }
        }
        if let Some(future) = self.future {
            if !future.complete(result) {
                debug!("caller dropped the future before the operation completed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn continuation_runs_before_future() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let callback = AsyncCompletionCallback::new(move |v: u32| async move {
            seen.lock().unwrap().push(format!("callback:{v}"));
        });
        let (completer, future) = async_call_future();
        let ctx = OpContext::new("tmpl", Some(callback), Some(completer));
        assert_eq!(*ctx.subject(), "tmpl");

        ctx.complete(7).await;
        order.lock().unwrap().push("completed".to_string());

        assert_eq!(future.await.unwrap(), 7);
        assert_eq!(*order.lock().unwrap(), vec!["callback:7", "completed"]);
    }

    #[tokio::test]
    async fn future_only_context() {
        let (completer, future) = async_call_future();
        let ctx: OpContext<(), String> = OpContext::new((), None, Some(completer));
        tokio::spawn(async move { ctx.complete("done".to_string()).await });
        assert_eq!(future.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn dropped_completer_reports_error() {
        let (completer, future) = async_call_future::<u8>();
        drop(completer);
        assert!(matches!(
            future.await,
            Err(OrchestratorError::CompletionDropped)
        ));
    }

    #[tokio::test]
    async fn panicking_continuation_still_completes_future() {
        let callback = AsyncCompletionCallback::new(|v: u8| async move {
            if v > 0 {
                panic!("continuation blew up");
            }
        });
        let (completer, future) = async_call_future();
        OpContext::new((), Some(callback), Some(completer))
            .complete(3)
            .await;
        assert_eq!(future.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn settle_turns_panic_into_fallback() {
        let ok = settle(async { 1 }, || 0).await;
        assert_eq!(ok, 1);

        let recovered = settle(
            async {
                if ok == 1 {
                    panic!("bookkeeping blew up");
                }
                1
            },
            || 0,
        )
        .await;
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn completed_future_resolves_immediately() {
        assert_eq!(AsyncCallFuture::completed(5).await.unwrap(), 5);
    }
}
