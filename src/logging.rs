// Logging setup for the binary
//
// Library code only ever emits through `tracing` macros; this is the one
// place a subscriber is installed. RUST_LOG overrides the default filter.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Safe to call once per process.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
