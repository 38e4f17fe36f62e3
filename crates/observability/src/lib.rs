//! Process-wide tracing setup shared by the binaries and tests.

pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize tracing from `RUST_LOG` (default `info`) and `LOG_FORMAT`.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    self::tracing::init(LogFormat::from_env());
}

/// Human-readable output captured by the test harness.
pub fn init_for_tests() {
    self::tracing::init_test_writer();
}
