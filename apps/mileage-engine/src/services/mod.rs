pub mod coupon_service;
pub mod ledger_service;
pub mod notification_service;
pub mod policy_service;
pub mod redemption_service;
pub mod registry_service;
pub mod reward_service;

use backon::{ExponentialBuilder, Retryable};
use mileage_db::{MileageError, MileageResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff between attempts of one atomic unit after a write conflict.
///
/// - Min delay: 10ms
/// - Max delay: 500ms
/// - Retries: `max_retries`
/// - Jitter enabled
pub(crate) fn conflict_backoff(max_retries: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(max_retries as usize)
        .with_jitter()
}

/// Re-runs a whole atomic unit after a write conflict, up to `max_retries`
/// extra attempts. Any other outcome is returned as is.
pub(crate) async fn with_conflict_retry<T, F, Fut>(
    op: &str,
    max_retries: u32,
    unit: F,
) -> MileageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MileageResult<T>>,
{
    unit.retry(conflict_backoff(max_retries))
        .when(MileageError::is_retryable)
        .notify(|e: &MileageError, delay: Duration| {
            warn!("{} hit a write conflict, retrying in {:?}: {}", op, delay, e);
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_only_conflicts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_conflict_retry("test", 3, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MileageError::PersistenceConflict("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: MileageResult<()> = with_conflict_retry("test", 3, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MileageError::InvalidAmount(0))
        })
        .await;
        assert!(matches!(result, Err(MileageError::InvalidAmount(0))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: MileageResult<()> = with_conflict_retry("test", 2, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MileageError::PersistenceConflict("busy".into()))
        })
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(conflict_backoff(3).build().count(), 3);
        assert_eq!(conflict_backoff(0).build().count(), 0);
    }
}
