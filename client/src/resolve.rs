//! Bounded retry loop for resources that appear asynchronously, such as the
//! compute environment's public key after a cluster restart.

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Fixed-interval retry schedule.
#[derive(Clone, Copy, Debug)]
pub struct RetrySchedule {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(500),
        }
    }
}

/// Poll `fetch` until it yields a value or the schedule is exhausted.
/// Transport errors abort immediately; `Ok(None)` means "not there yet" and
/// is retried.
pub(crate) async fn resolve_with_retry<T, F, Fut>(
    schedule: &RetrySchedule,
    what: &'static str,
    mut fetch: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 0..schedule.attempts {
        if let Some(value) = fetch().await? {
            return Ok(Some(value));
        }
        debug!(what, attempt, "resource not available yet");
        if attempt + 1 < schedule.attempts {
            tokio::time::sleep(schedule.delay).await;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn resolves_once_available() {
        let calls = AtomicU32::new(0);
        let schedule = RetrySchedule {
            attempts: 5,
            delay: Duration::ZERO,
        };
        let value = resolve_with_retry(&schedule, "thing", || async {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if attempt >= 2 { Some(42u32) } else { None })
        })
        .await
        .unwrap();
        assert_eq!(value, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_schedule() {
        let calls = AtomicU32::new(0);
        let schedule = RetrySchedule {
            attempts: 4,
            delay: Duration::ZERO,
        };
        let value: Option<u32> = resolve_with_retry(&schedule, "thing", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await
        .unwrap();
        assert_eq!(value, None);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
