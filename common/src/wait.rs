use anyhow::{Result, bail};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);
const MAX_BACKOFF_STEPS: usize = 50;

/// Sleep for `delay` unless cancelled first.
pub async fn sleep_with_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => bail!("Context cancelled"),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

pub async fn wait(cancel: &CancellationToken, n: usize) -> Result<()> {
    wait_with_backoff(cancel, n, DEFAULT_BACKOFF_CAP).await
}

/// Run `n` jittered backoff sleeps, bailing out as soon as the token is
/// cancelled.
pub async fn wait_with_backoff(cancel: &CancellationToken, n: usize, cap: Duration) -> Result<()> {
    for attempt in 0..n.clamp(1, MAX_BACKOFF_STEPS) {
        let delay = backoff_full_jitter(BACKOFF_BASE, cap, attempt);
        sleep_with_cancel(cancel, delay).await?;
    }
    Ok(())
}

/// Full-jitter backoff: a uniformly random sleep in
/// [0, min(cap, base * 2^attempt)]. Randomizing the whole window keeps
/// retrying replicas from falling into lockstep with each other.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let window = backoff_window_millis(base, cap, attempt);
    Duration::from_millis(rand::random_range(0..=window))
}

/// min(cap, base * 2^attempt) in whole milliseconds. Saturates on large
/// attempt counts and never returns zero, so the jitter range above stays
/// non-degenerate.
fn backoff_window_millis(base: Duration, cap: Duration, attempt: usize) -> u64 {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;
    let factor = 1u64 << attempt.min(63);
    base_ms.saturating_mul(factor).min(cap_ms).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_below_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        for attempt in 0..20 {
            let d = backoff_full_jitter(base, cap, attempt);
            assert!(d <= cap, "attempt {attempt} produced {d:?}");
        }
    }

    #[test]
    fn window_widens_then_saturates_at_the_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        assert_eq!(backoff_window_millis(base, cap, 0), 100);
        assert_eq!(backoff_window_millis(base, cap, 3), 800);
        assert_eq!(backoff_window_millis(base, cap, 10), 2_000);
        assert_eq!(backoff_window_millis(base, cap, 5_000), 2_000);
    }

    #[tokio::test]
    async fn sleep_aborts_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = sleep_with_cancel(&cancel, Duration::from_secs(60)).await;
        assert!(res.is_err());
    }
}
