//! Bounded polling
//!
//! Every poll runs at a fixed interval, gives up after a maximum duration and
//! stops as soon as the shutdown token fires.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PollSettings;
use crate::error::{Error, Result};

/// Call `check` until it returns `Ok(true)`.
///
/// Errors from `check` count as "not yet" and are logged; only the deadline
/// and cancellation end the poll unsuccessfully.
pub async fn poll_until<F, Fut>(
    what: &str,
    settings: PollSettings,
    shutdown: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + settings.timeout;

    loop {
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!(what, error = %e, "Poll check failed, retrying"),
        }

        if tokio::time::Instant::now() + settings.interval > deadline {
            return Err(Error::Timeout(format!(
                "{} after {}s",
                what,
                settings.timeout.as_secs()
            )));
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(Error::Cancelled(what.to_string()));
            }
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(interval: u64, timeout: u64) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let counter = calls.clone();

        let result = poll_until("job", settings(3, 60), &token, || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let counter = calls.clone();

        let result = poll_until("job", settings(1, 60), &token, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::NotFound("job".into()))
                } else {
                    Ok(true)
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let token = CancellationToken::new();
        let result = poll_until("job", settings(3, 10), &token, || async { Ok(false) }).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancellation() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            child.cancel();
        });

        let result = poll_until("job", settings(3, 600), &token, || async { Ok(false) }).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
