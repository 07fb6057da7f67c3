pub mod log_buffer;

pub use log_buffer::{LogBuffer, LogEntry, LogLevel, MemoryLogLayer};

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `RUST_LOG` (or `default_level`) filtering,
/// stderr output, and an in-memory copy of every event in `buffer`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_level: &str, buffer: LogBuffer) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(MemoryLogLayer::new(buffer))
        .with(fmt_layer);

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::debug!("Tracing initialized with memory and stderr logging");
        true
    } else {
        false
    }
}
