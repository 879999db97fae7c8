//! Run a command under Ctrl-C supervision.
//!
//! The first interrupt cancels the token and gives the work a grace period
//! to abort what it started. A second interrupt, or the end of the grace
//! period, gives up on it.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long cancelled work may take to clean up before the process exits
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
pub enum Supervised<T> {
    /// The work finished without an interrupt
    Completed(T),
    /// An interrupt arrived. Holds the result if the work wound down in time.
    Cancelled(Option<T>),
}

/// Drive `work` until it finishes or `interrupt` resolves
///
/// `interrupt` is called once per signal to wait for.
pub async fn supervise<T, W, I, F>(
    work: W,
    mut interrupt: I,
    cancel: CancellationToken,
    grace: Duration,
) -> Supervised<T>
where
    W: Future<Output = T>,
    I: FnMut() -> F,
    F: Future<Output = ()>,
{
    tokio::pin!(work);

    tokio::select! {
        result = &mut work => return Supervised::Completed(result),
        _ = interrupt() => {}
    }

    warn!("Interrupted, cancelling (press Ctrl-C again to exit now)");
    cancel.cancel();

    tokio::select! {
        result = tokio::time::timeout(grace, &mut work) => match result {
            Ok(result) => Supervised::Cancelled(Some(result)),
            Err(_) => {
                warn!("Gave up waiting {:?} for cancelled work", grace);
                Supervised::Cancelled(None)
            }
        },
        _ = interrupt() => {
            warn!("Interrupted again, exiting");
            Supervised::Cancelled(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn never() -> impl Future<Output = ()> {
        std::future::pending()
    }

    /// Each call resolves while a permit is left
    fn signals(count: usize) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        let permits = Arc::new(Semaphore::new(count));
        move || {
            let permits = permits.clone();
            Box::pin(async move {
                match permits.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => std::future::pending::<()>().await,
                }
            })
        }
    }

    #[tokio::test]
    async fn test_work_completes_without_interrupt() {
        let cancel = CancellationToken::new();
        let result = supervise(async { 7 }, never, cancel.clone(), DEFAULT_GRACE).await;

        assert_eq!(result, Supervised::Completed(7));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_and_waits_for_cleanup() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let work = async move {
            token.cancelled().await;
            "aborted"
        };

        let result = supervise(work, signals(1), cancel.clone(), DEFAULT_GRACE).await;

        assert_eq!(result, Supervised::Cancelled(Some("aborted")));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_period_bounds_the_wait() {
        let cancel = CancellationToken::new();
        let result = supervise(
            std::future::pending::<()>(),
            signals(1),
            cancel.clone(),
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(result, Supervised::Cancelled(None));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_second_interrupt_exits_immediately() {
        let cancel = CancellationToken::new();
        let result = supervise(
            std::future::pending::<()>(),
            signals(2),
            cancel.clone(),
            Duration::from_secs(3600),
        )
        .await;

        assert_eq!(result, Supervised::Cancelled(None));
    }
}
