//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. Timeouts default far below
//! production values so failing tests fail fast.

use std::path::Path;

use stowage_config::{AppConfig, StorageMode};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .remote(backend.socket_path())
///     .request_timeout_ms(200)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.reconnect.interval_ms = 20;
        config.reconnect.max_interval_ms = 20;
        config.reconnect.ready_timeout_ms = 2_000;
        config.request.timeout_ms = 2_000;
        config.request.idle_backoff_ms = 5;
        Self { config }
    }

    /// Local mode rooted at `root`.
    pub fn local(mut self, root: &Path) -> Self {
        self.config.storage.mode = StorageMode::Local;
        self.config.storage.local_path = root.display().to_string();
        self
    }

    /// Remote mode against the socket at `socket_path`.
    pub fn remote(mut self, socket_path: &Path) -> Self {
        self.config.storage.mode = StorageMode::Remote;
        self.config.ipc.socket_path = Some(socket_path.display().to_string());
        self
    }

    pub fn reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.config.reconnect.interval_ms = ms;
        self.config.reconnect.max_interval_ms = self.config.reconnect.max_interval_ms.max(ms);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    pub fn ready_timeout_ms(mut self, ms: u64) -> Self {
        self.config.reconnect.ready_timeout_ms = ms;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request.timeout_ms = ms;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
