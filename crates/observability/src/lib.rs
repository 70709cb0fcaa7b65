//! Tracing and logging setup shared by binaries and tests embedding the queue.

/// Tracing configuration (filters, formatting).
pub mod tracing;

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize human-readable tracing, intended for tests.
pub fn init_for_tests() {
    tracing::init_pretty("debug");
}
