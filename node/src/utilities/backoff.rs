//! Retrying with exponential backoff.
//!
//! Register and store drivers face transient failures that resolve
//! themselves; the policy here is to keep retrying with growing, capped
//! delays until the operation succeeds or the caller cancels.

use std::future::Future;
use std::time::Duration;

use log::warn;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The retried operation was cancelled before it succeeded.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Interrupted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay,
            max_delay,
        }
    }

    /// Endless sequence of delays: initial, doubled each time, capped.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial = self.initial_delay;
        let max = self.max_delay;
        (0u32..).map(move |attempt| {
            let delay = initial.saturating_mul(1u32 << attempt.min(16));
            delay.min(max)
        })
    }
}

/// Runs `op` until it succeeds, sleeping between attempts per `policy`.
/// Cancellation interrupts both an in-flight attempt and a pending delay.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, Interrupted>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = policy.delays();
    loop {
        tokio::select! {
            result = op() => match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = delays.next().expect("delay sequence is endless");
                    warn!("Operation failed, retrying in {delay:?}: {err}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(Interrupted),
                    }
                }
            },
            _ = token.cancelled() => return Err(Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(35));
        let delays: Vec<_> = policy.delays().take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(35),
                Duration::from_millis(35),
            ]
        );
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        let token = CancellationToken::new();

        let result = retry(&fast_policy(), &token, move || {
            let counted = counted.clone();
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_loop() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), Interrupted> = retry(&fast_policy(), &token, || async {
            Err::<(), _>("always failing")
        })
        .await;

        assert_eq!(result, Err(Interrupted));
    }
}
