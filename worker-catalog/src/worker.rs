use crate::session::SessionDescriptor;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// One out-of-process analysis engine bound to one session.
///
/// Implementations are shared behind `Arc` between the catalog and request
/// routing code, so both methods take `&self`.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Bring the worker up. `Ok(false)` means the worker could not become ready;
    /// an `Err` is treated the same way by the catalog.
    async fn start(&self) -> Result<bool>;

    /// Shut the worker down. May be retried by the caller on failure.
    async fn stop(&self) -> Result<()>;
}

/// Produces a fresh, not yet started worker for a session.
///
/// Called while the session's catalog slot is reserved: `create` must be quick
/// and must not call back into the catalog.
pub trait WorkerFactory: Send + Sync + 'static {
    fn create(&self, session: &SessionDescriptor) -> Arc<dyn Worker>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&SessionDescriptor) -> Arc<dyn Worker> + Send + Sync + 'static,
{
    fn create(&self, session: &SessionDescriptor) -> Arc<dyn Worker> {
        self(session)
    }
}
