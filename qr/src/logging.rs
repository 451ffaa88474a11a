//! Tracing subscriber setup for embedders and tests

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a global tracing subscriber honoring `RUST_LOG`, falling back
/// to the given default filter. Safe to call more than once.
pub fn init(default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("warn");
        init("debug");
    }
}
