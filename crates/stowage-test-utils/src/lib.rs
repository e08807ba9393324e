#![deny(unsafe_code)]

//! Shared test utilities for the Stowage workspace.
//!
//! Provides a mock backend, session fixtures, config builders, and tracing
//! helpers so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! stowage-test-utils = { workspace = true }
//! ```

pub mod backend;
pub mod config;
pub mod session;
pub mod tracing_setup;

pub use backend::{Faults, MockBackend};
pub use config::TestConfigBuilder;
pub use session::TestSession;
