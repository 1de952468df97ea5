//! Tracing setup.

use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// # Panics
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_tracing`] where that can happen.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .init();
}

/// Like [`init_tracing`], but does nothing if a subscriber is already set.
///
/// Safe to call from every test.
pub fn try_init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_test_writer()
        .try_init();
}
