//! Type-erased stage transforms.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::conveyor_error;
use crate::error::{ConveyorResult, ErrorKind};

/// A shareable async function turning a stage input payload into an output payload.
///
/// Every worker of a pool holds a clone, so the function itself must be `Send + Sync`.
pub type BoxedTransform<I, O> =
    Arc<dyn Fn(I) -> BoxFuture<'static, ConveyorResult<O>> + Send + Sync + 'static>;

/// Erases the concrete closure and future types of `transform`.
pub fn boxed_transform<I, O, F, Fut>(transform: F) -> BoxedTransform<I, O>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConveyorResult<O>> + Send + 'static,
{
    Arc::new(move |input| transform(input).boxed())
}

/// Runs `transform` on `payload`, turning a panic into an [`ErrorKind::TaskPanicked`] error.
///
/// Panics raised while the future is created or polled are both captured, so a misbehaving
/// transform never takes its worker down.
pub async fn run_transform<I, O>(transform: &BoxedTransform<I, O>, payload: I) -> ConveyorResult<O> {
    let result = AssertUnwindSafe(async move { transform(payload).await })
        .catch_unwind()
        .await;

    match result {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());

            Err(conveyor_error!(
                ErrorKind::TaskPanicked,
                "Transform panicked",
                detail = message
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bail;

    #[tokio::test]
    async fn successful_transform_returns_value() {
        let transform = boxed_transform(|x: u32| async move { Ok(x * 2) });

        assert_eq!(run_transform(&transform, 21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn failing_transform_returns_its_error() {
        let transform = boxed_transform(|x: u32| async move {
            if x == 0 {
                bail!(ErrorKind::TaskFailed, "Zero is not accepted");
            }
            Ok(x)
        });

        let err = run_transform(&transform, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
    }

    #[tokio::test]
    async fn panicking_transform_is_captured() {
        let transform = boxed_transform(|x: u32| async move {
            if x > 1 {
                panic!("value {x} too large");
            }
            Ok(x)
        });

        let err = run_transform(&transform, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskPanicked);
        assert_eq!(err.detail(), Some("value 5 too large"));
    }

    #[tokio::test]
    async fn panic_while_creating_future_is_captured() {
        fn eager_panic(_: u32) -> BoxFuture<'static, ConveyorResult<u32>> {
            panic!("eager panic")
        }
        let transform: BoxedTransform<u32, u32> = Arc::new(eager_panic);

        let err = run_transform(&transform, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskPanicked);
        assert_eq!(err.detail(), Some("eager panic"));
    }
}
