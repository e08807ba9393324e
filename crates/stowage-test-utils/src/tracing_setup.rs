//! Tracing initialisation for tests.
//!
//! [`init_test_tracing`] routes events to the test-harness writer so they
//! show up next to the failing test. It installs at most one subscriber per
//! process and can be called from every test.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset: request-level detail from the
/// persistence crates, warnings from everything else.
const DEFAULT_FILTER: &str = "warn,stowage_core=debug,stowage_test_utils=debug";

/// Install a test-writer subscriber honouring `RUST_LOG`. Later calls are
/// ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_test_writer()
        .try_init();
}
