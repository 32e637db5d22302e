//! Tracing and logging setup shared by the finsync binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// Format comes from `LOG_FORMAT` (JSON unless set to `pretty`). This is safe
/// to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;
