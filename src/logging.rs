//! Tracing subscriber setup

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber once.
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call repeatedly, and a
/// subscriber installed by the embedding application wins silently.
pub fn init_logging() {
    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
