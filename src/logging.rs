//! Tracing setup shared by the library's tests and the `volmanctl` binary.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_ansi(true)
            .try_init()
            .ok();
    });
}
