// src/logging/mod.rs

// Logging setup
// RUST_LOG wins; otherwise `default_level` applies.

use env_logger::{Builder, Env};

/// Install the global logger. Calling this more than once is harmless.
pub fn init(default_level: &str) {
    let _ = Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init();
}
