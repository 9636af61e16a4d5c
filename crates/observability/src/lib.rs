//! Tracing/logging setup shared by every process that runs the scheduler.

/// Initialize process-wide tracing with the default `info` filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Tracing configuration (filters, layers).
pub mod tracing;

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_init_is_a_no_op() {
        super::init();
        super::init();
        super::tracing::init_for_tests();
        ::tracing::info!(target: "payremind_observability", "still logging");
    }
}
