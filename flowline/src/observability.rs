//! Tracing setup helpers.

use tracing_subscriber::EnvFilter;

/// Initializes a global tracing subscriber with env-filter support.
///
/// Reads `RUST_LOG`, defaulting to `info`. Safe to call more than once;
/// only the first call installs the subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_reentrant() {
        init_tracing();
        init_tracing();
        // Second call must not panic
    }
}
