//! Scoped acquisition around outbound calls to a worker's API.

use crate::error::LimiterError;
use crate::limiter::ConcurrencyLimiter;
use std::future::Future;
use tracing::debug;

/// Result of a wrapped outbound call, as seen at the wrapper boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T, E> {
    Ok(T),
    /// The call was aborted by its caller
    Cancelled,
    Err(E),
}

/// Classifies errors that represent a caller-initiated abort
pub trait IsCancelled {
    fn is_cancelled(&self) -> bool;
}

impl IsCancelled for tokio::task::JoinError {
    fn is_cancelled(&self) -> bool {
        tokio::task::JoinError::is_cancelled(self)
    }
}

impl<T, E: IsCancelled> From<Result<T, E>> for CallOutcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => CallOutcome::Ok(value),
            Err(e) if e.is_cancelled() => CallOutcome::Cancelled,
            Err(e) => CallOutcome::Err(e),
        }
    }
}

/// Gates every outbound call through a shared [`ConcurrencyLimiter`].
///
/// The permit is held for the duration of the call and released on every exit
/// path, including the call future being dropped mid-flight.
#[derive(Debug, Clone, Default)]
pub struct LimitedClient {
    limiter: ConcurrencyLimiter,
}

impl LimitedClient {
    pub fn new(limiter: ConcurrencyLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Run a call under a permit. `Cancelled` becomes an empty success; errors
    /// are returned unchanged after the permit is released.
    pub async fn call<T, E, Fut>(&self, call: Fut) -> Result<T, E>
    where
        T: Default,
        E: From<LimiterError>,
        Fut: Future<Output = CallOutcome<T, E>>,
    {
        let permit = self.limiter.acquire().await?;
        let outcome = call.await;
        permit.release();

        match outcome {
            CallOutcome::Ok(value) => Ok(value),
            CallOutcome::Cancelled => {
                debug!("Outbound call was cancelled, returning empty result");
                Ok(T::default())
            }
            CallOutcome::Err(e) => Err(e),
        }
    }

    /// Like [`LimitedClient::call`] for plain `Result`s whose error type knows
    /// whether it represents an abort.
    pub async fn call_result<T, E, Fut>(&self, call: Fut) -> Result<T, E>
    where
        T: Default,
        E: From<LimiterError> + IsCancelled,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call(async move { CallOutcome::from(call.await) })
            .await
    }

    /// Race the call (including the wait for a permit) against `abort`. If the
    /// abort signal fires first the call is dropped and an empty result returned.
    pub async fn call_with_abort<T, E, Fut, A>(&self, call: Fut, abort: A) -> Result<T, E>
    where
        T: Default,
        E: From<LimiterError>,
        Fut: Future<Output = CallOutcome<T, E>>,
        A: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = abort => {
                debug!("Outbound call aborted by caller");
                Ok(T::default())
            }
            result = self.call(call) => result,
        }
    }
}
