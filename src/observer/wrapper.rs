//! Converts user observer failures into [`Error::Observer`].

use crate::error::{Error, ObserverError, Result};
use crate::observer::{BoxError, ChangeFeedObserver, CloseReason, ObserverContext, ObserverResult, PartitionObserver};
use crate::types::ChangeRecord;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::warn;

/// Runs a user observer so that whatever it does, the engine only ever sees
/// a typed error.
///
/// Only `LeaseLost`, as returned by [`ObserverContext::checkpoint`] when
/// ownership is gone, keeps its kind. Any other error, including engine
/// errors the user code returned itself, becomes [`Error::Observer`] so it
/// cannot trigger split or retirement handling for a live partition.
pub struct ObserverExceptionWrapper {
    inner: Box<dyn ChangeFeedObserver>,
}

impl ObserverExceptionWrapper {
    /// Wrap a user observer.
    pub fn new(inner: Box<dyn ChangeFeedObserver>) -> Self {
        Self { inner }
    }

    async fn guard<F>(&self, operation: &'static str, partition_id: &str, call: F) -> Result<()>
    where
        F: Future<Output = ObserverResult> + Send,
    {
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(classify(e, operation, partition_id)),
            Err(panic) => {
                let message = panic_message(panic);
                warn!(partition_id, operation, panic = %message, "Observer panicked");
                Err(Error::Observer(ObserverError::new(format!(
                    "observer panicked in {operation}: {message}"
                ))))
            }
        }
    }
}

fn classify(error: BoxError, operation: &'static str, partition_id: &str) -> Error {
    let cause: BoxError = match error.downcast::<Error>() {
        Ok(engine) if engine.is_lease_lost() => return *engine,
        Ok(engine) => engine as BoxError,
        Err(user) => user,
    };
    warn!(partition_id, operation, error = %cause, "Observer failed");
    Error::Observer(ObserverError::new(cause))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl PartitionObserver for ObserverExceptionWrapper {
    async fn open(&self, context: &ObserverContext) -> Result<()> {
        self.guard("open", context.partition_id(), self.inner.open(context))
            .await
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> Result<()> {
        self.guard("close", context.partition_id(), self.inner.close(context, reason))
            .await
    }

    async fn process_changes(&self, context: &ObserverContext, changes: &[ChangeRecord]) -> Result<()> {
        self.guard(
            "process_changes",
            context.partition_id(),
            self.inner.process_changes(context, changes),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LeaseLostReason;
    use crate::observer::PartitionCheckpointer;
    use std::sync::Arc;

    #[derive(Debug)]
    struct NoopCheckpointer;

    #[async_trait]
    impl PartitionCheckpointer for NoopCheckpointer {
        async fn checkpoint_partition(&self, _continuation: &str) -> Result<()> {
            Ok(())
        }
    }

    enum Behavior {
        Succeed,
        Fail,
        Panic,
        LoseLease,
        ClaimGone,
    }

    struct ScriptedObserver(Behavior);

    #[async_trait]
    impl ChangeFeedObserver for ScriptedObserver {
        async fn process_changes(&self, _context: &ObserverContext, _changes: &[ChangeRecord]) -> ObserverResult {
            match self.0 {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err("bad document".into()),
                Behavior::Panic => panic!("observer bug"),
                Behavior::LoseLease => Err(Box::new(Error::LeaseLost {
                    lease_token: "0".into(),
                    reason: LeaseLostReason::OwnerChanged,
                    server_lease: None,
                })),
                Behavior::ClaimGone => Err(Box::new(Error::PartitionNotFound {
                    partition_id: "0".into(),
                    last_continuation: None,
                })),
            }
        }
    }

    fn context() -> ObserverContext {
        ObserverContext::new("0", Arc::new(NoopCheckpointer))
    }

    async fn run(behavior: Behavior) -> Result<()> {
        let wrapper = ObserverExceptionWrapper::new(Box::new(ScriptedObserver(behavior)));
        wrapper.process_changes(&context(), &[]).await
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        assert!(run(Behavior::Succeed).await.is_ok());
    }

    #[tokio::test]
    async fn test_user_error_is_wrapped() {
        let err = run(Behavior::Fail).await.unwrap_err();
        match err {
            Error::Observer(e) => assert_eq!(e.cause().to_string(), "bad document"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_wrapped() {
        let err = run(Behavior::Panic).await.unwrap_err();
        match err {
            Error::Observer(e) => assert!(e.to_string().contains("observer bug")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_engine_error_keeps_its_kind() {
        let err = run(Behavior::LoseLease).await.unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_other_engine_errors_from_user_code_are_wrapped() {
        let err = run(Behavior::ClaimGone).await.unwrap_err();
        match err {
            Error::Observer(e) => assert!(e.cause().to_string().contains("partition not found")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_open_and_close() {
        let wrapper = ObserverExceptionWrapper::new(Box::new(ScriptedObserver(Behavior::Succeed)));
        wrapper.open(&context()).await.unwrap();
        wrapper.close(&context(), CloseReason::Shutdown).await.unwrap();
    }
}
