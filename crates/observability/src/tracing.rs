//! Tracing/logging initialization.
//!
//! JSON lines with timestamps. `RUST_LOG` overrides the default directive,
//! e.g. `RUST_LOG=payremind_infra=debug`.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// `default_directive` is used when `RUST_LOG` is unset or unparsable.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true)
        .with_target(true)
        .try_init();
}

/// Test-friendly subscriber writing through the test harness's captured output.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
