//! Shared test plumbing.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Polls `f` until it returns `true`, panicking after `timeout`.
pub async fn eventually<F, Fut>(what: &str, timeout: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if f().await {
            return;
        }

        if Instant::now() > deadline {
            panic!("condition not met within {timeout:?}: {what}");
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
