//! Process-wide tracing setup shared by dispatchq binaries.

/// Initialize JSON tracing with the default `info` filter.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init("info");
}

/// Tracing configuration (filters, layers).
pub mod tracing;
