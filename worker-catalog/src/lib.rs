// Worker Catalog Library
// Session-scoped analysis workers and the concurrency limiter gating calls into them

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod process_worker;
pub mod retry;
pub mod session;
pub mod worker;

// Re-export commonly used types
pub use catalog::{SessionStatus, StopOutcome, WorkerCatalog, WorkerState};
pub use client::{CallOutcome, IsCancelled, LimitedClient};
pub use config::{Backoff, CatalogConfig, Config, LimiterConfig, RetryPolicy, WorkerConfig};
pub use error::{CatalogError, ConfigError, LimiterError, RetryError};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use logging::{init_tracing, LogBuffer, LogEntry, LogLevel, MemoryLogLayer};
pub use process_worker::{ProcessWorker, ProcessWorkerFactory};
pub use session::{SessionDescriptor, SessionId};
pub use worker::{Worker, WorkerFactory};
