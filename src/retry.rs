use log::warn;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Attempts made by `call_for_success` before giving up.
pub const DEFAULT_ATTEMPTS: usize = 20;

/// Pause between two attempts of `call_for_success`.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

/// Call a flaky network operation until it answers.
/// Public backends drop requests regularly, so every RPC goes through here.
pub async fn call_for_success<T, E, F, Fut>(op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with(op, DEFAULT_ATTEMPTS, DEFAULT_DELAY).await
}

/// Run `op` up to `attempts` times with a fixed `delay` between failures.
/// Returns the first success, or the last error once attempts run out.
/// No backoff growth, no jitter.
pub async fn retry_with<T, E, F, Fut>(mut op: F, attempts: usize, delay: Duration) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut tried = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tried += 1;
                if tried >= attempts {
                    warn!("error after attempts {}: {}", tried, err);
                    return Err(err);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
