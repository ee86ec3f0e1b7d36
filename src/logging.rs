//! Tracing setup shared by the runtime, tests and embedding binaries.
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Install a fmt subscriber filtered by `RUST_LOG` (falling back to `info`).
///
/// Uses `try_init`, so calling it more than once, or after the host already
/// installed a subscriber, is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}
