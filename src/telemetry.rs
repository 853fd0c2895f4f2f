//! Tracing initialisation
//!
//! Structured logs through `tracing`, filtered by `RUST_LOG` with a quiet
//! default. Secret material never enters log fields.

use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber; safe to call more than once
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("orka=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
