//! Shared tracing setup for ledger processes and tests.

/// Subscriber installation (filters, formats).
pub mod tracing;

/// Initialize process-wide JSON logging.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize human-readable logging captured by the test harness.
pub fn init_for_tests() {
    tracing::init_for_tests();
}
