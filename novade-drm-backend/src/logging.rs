//! Logging setup for the backend's driver binary and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Directives used when `RUST_LOG` is unset or invalid: the backend and the
/// probe binary at `info`, everything else (calloop, drm) at `warn`.
pub const DEFAULT_FILTER: &str = "warn,novade_drm_backend=info,novade_drm_probe=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a `stderr` fmt subscriber filtered by `RUST_LOG` or [`DEFAULT_FILTER`].
///
/// Does nothing if a global subscriber is already set.
pub fn init_minimal_logging() {
    let _ = fmt::Subscriber::builder()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
