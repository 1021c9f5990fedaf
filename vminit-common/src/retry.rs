//! Bounded retry helper shared by unmount (§4.10) and cgroup delete (§4.9).

use std::time::Duration;

/// Retry `f` up to `attempts` times with exponential backoff starting at
/// `base`, doubling each time, as long as `should_retry` accepts the error.
/// Returns the last error if the budget is exhausted.
pub async fn retry_on<F, Fut, T, E>(
    attempts: u32,
    base: Duration,
    mut f: F,
    should_retry: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut delay = base;
    let mut last_err = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !should_retry(&e) || attempt + 1 == attempts {
                    return Err(e);
                }
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    // Unreachable in practice (attempts >= 1 always returns above), but keeps
    // the compiler happy for attempts == 0.
    Err(last_err.expect("retry_on called with zero attempts"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_on(
            5,
            Duration::from_millis(1),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("busy")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let result: Result<u32, &str> = retry_on(
            3,
            Duration::from_millis(1),
            || async { Err("still busy") },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("still busy"));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_on(
            5,
            Duration::from_millis(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
            |_| false,
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
