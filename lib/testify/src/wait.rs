use std::time::{Duration, Instant};

/// Pollers in tests tick every few milliseconds, so start retrying fast.
const FIRST_PAUSE: Duration = Duration::from_millis(5);
const MAX_PAUSE: Duration = Duration::from_millis(200);

/// Retry `f` with a doubling pause until it holds, panics once `timeout`
/// has elapsed.
pub async fn wait_for_duration<F>(mut f: F, timeout: Duration)
where
    F: AsyncFnMut() -> bool,
{
    let started = Instant::now();
    let mut pause = FIRST_PAUSE;

    while !f().await {
        if started.elapsed() > timeout {
            panic!("condition still false after {timeout:?}");
        }

        tokio::time::sleep(pause).await;
        pause = (pause * 2).min(MAX_PAUSE);
    }
}

/// `wait_for_duration` with a 5s timeout.
pub async fn wait_for<F>(f: F)
where
    F: AsyncFnMut() -> bool,
{
    wait_for_duration(f, Duration::from_secs(5)).await
}
