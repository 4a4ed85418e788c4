//! Log output for hosts that have no `tracing` subscriber of their own.
//!
//! The filter comes from `RUST_LOG`, falling back to `hatcore=info`. Output
//! goes to stderr.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "hatcore=info";

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Same as [`init`] with a different fallback filter (e.g. `hatcore=debug`).
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init();
        init_with_default("hatcore=debug");
    }
}
