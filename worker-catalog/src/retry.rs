//! Bounded retry combinators.
//!
//! Both the catalog's "wait for a starting worker to register" loop and its
//! "retry a failing stop" loop are expressed with these helpers, driven by a
//! [`RetryPolicy`].

use crate::config::RetryPolicy;
use crate::error::RetryError;
use std::fmt;
use std::future::Future;
use tokio::time::sleep;
use tracing::debug;

/// Run `operation` until it succeeds or `policy.max_attempts` is reached.
///
/// The closure receives the 1-based attempt number. On success the value is
/// returned together with the attempt that produced it. No delay follows the
/// final attempt.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display + fmt::Debug,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok((value, attempt));
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        last_error: e,
                    });
                }

                let delay = policy.delay_after(attempt);
                debug!(
                    "{} failed on attempt {} ({}), retrying in {}ms",
                    operation_name,
                    attempt,
                    e,
                    delay.as_millis()
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug)]
struct NotYet;

impl fmt::Display for NotYet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not available yet")
    }
}

/// Poll `probe` until it yields a value or the policy's attempts run out.
///
/// Returns the value and the attempt it was observed on, or `None` once every
/// attempt came back empty.
pub async fn poll_until<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut probe: F,
) -> Option<(T, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    retry_with_policy(policy, operation_name, |attempt| {
        let fut = probe(attempt);
        async move { fut.await.ok_or(NotYet) }
    })
    .await
    .ok()
}
