//! Shared retry policy: exponential backoff with full jitter.
//!
//! Used for publish retries, resume-token writes, change-stream restarts,
//! and startup connection attempts. Streaming-path retries have no ceiling
//! on the number of attempts; the caller stops on shutdown, a fatal error,
//! or an explicit deadline.

use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub const BASE: Duration = Duration::from_millis(100);
    pub const CAP: Duration = Duration::from_secs(30);

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Next sleep duration: uniformly sampled from `[0, min(cap, base * 2^n)]`.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(20);
        let ceiling = self
            .base
            .saturating_mul(1u32 << shift)
            .min(self.cap)
            .as_millis() as f64;
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((rand::random::<f64>() * ceiling) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::BASE, Self::CAP)
    }
}

/// Sleep for `delay` unless the shutdown signal fires first.
///
/// Returns `true` if the full delay elapsed, `false` on shutdown (including
/// a dropped sender).
pub async fn sleep(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

/// Retry an operation on the shared schedule until it succeeds or the
/// deadline passes, surfacing the last error. Not shutdown-aware: meant for
/// startup work that runs before the cancellation signal is wired up.
pub async fn retry_with_deadline<T, E, F, Fut>(
    deadline: Duration,
    operation: &str,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = tokio::time::Instant::now();
    let mut policy = Backoff::default();
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if started.elapsed() >= deadline {
                    warn!(operation, error = %e, "Giving up");
                    return Err(e);
                }
                let delay = policy.next_delay();
                warn!(operation, error = %e, delay_ms = delay.as_millis() as u64, "Retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn delays_stay_under_exponential_ceiling() {
        let mut backoff = Backoff::default();
        for attempt in 0..12 {
            let ceiling = Backoff::BASE
                .saturating_mul(1u32 << attempt.min(20))
                .min(Backoff::CAP);
            let delay = backoff.next_delay();
            assert!(
                delay <= ceiling,
                "attempt {attempt}: {delay:?} exceeds {ceiling:?}"
            );
        }
    }

    #[test]
    fn delays_never_exceed_cap() {
        let mut backoff = Backoff::default();
        for _ in 0..64 {
            assert!(backoff.next_delay() <= Backoff::CAP);
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn sleep_completes_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep(Duration::from_millis(10), &mut rx).await);
    }

    #[tokio::test]
    async fn shutdown_preempts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let start = Instant::now();
        let handle = tokio::spawn(async move { sleep(Duration::from_secs(30), &mut rx).await });
        tx.send(true).unwrap();
        assert!(!handle.await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sleep_returns_immediately_when_already_shut_down() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!sleep(Duration::from_secs(30), &mut rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_deadline_returns_first_success() {
        let mut failures_left = 2;
        let result = retry_with_deadline(Duration::from_secs(60), "connect", move || {
            let fail = failures_left > 0;
            if fail {
                failures_left -= 1;
            }
            async move {
                if fail {
                    Err("connection refused".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_deadline_surfaces_the_last_error() {
        let result: Result<i32, String> =
            retry_with_deadline(Duration::from_millis(500), "connect", || async {
                Err("still down".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "still down");
    }
}
