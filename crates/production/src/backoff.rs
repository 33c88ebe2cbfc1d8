//! Exponential backoff for unreliable external calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry `operation` until it succeeds, sleeping with exponential backoff
/// between attempts. The delay starts at `base` and doubles up to `max`.
///
/// Never gives up; callers that need a bound should wrap the future in
/// `tokio::time::timeout`.
pub async fn retry_until_ok<T, E, F, Fut>(base: Duration, max: Duration, mut operation: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delay = base;
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => return value,
            Err(reason) => {
                warn!(attempt, %reason, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_returns_first_success() {
        let value: u32 =
            retry_until_ok(Duration::from_millis(1), Duration::from_millis(1), || async {
                Ok::<_, &str>(42)
            })
            .await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let attempts = AtomicU32::new(0);
        let value = retry_until_ok(Duration::from_millis(1), Duration::from_millis(4), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_doubles_and_caps() {
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        retry_until_ok(Duration::from_millis(10), Duration::from_millis(20), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok(())
                }
            }
        })
        .await;
        // Delays: 10 + 20 + 20 (capped) = 50ms of virtual time.
        assert_eq!(started.elapsed(), Duration::from_millis(50));
    }
}
