//! Persistence session fixtures.
//!
//! Sessions built here own their temp directory, so local save files and
//! config files are removed when the fixture drops, even on panic.

use std::path::{Path, PathBuf};

use stowage_config::AppConfig;
use stowage_core::Persistence;
use tempfile::TempDir;

use crate::config::TestConfigBuilder;

/// A local-mode session rooted in a temp directory.
pub struct TestSession {
    pub session: Persistence,
    pub config: AppConfig,
    dir: TempDir,
}

impl TestSession {
    /// Local session with default settings. Must run inside a tokio runtime.
    pub fn local() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = TestConfigBuilder::new().local(dir.path()).build();
        let session = Persistence::init(&config).expect("failed to init local session");
        Self {
            session,
            config,
            dir,
        }
    }

    /// Session built from a TOML file written into the temp directory.
    /// A relative `local_path` resolves against that directory.
    pub async fn with_toml(toml_content: &str) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config_path = dir.path().join("stowage.toml");
        tokio::fs::write(&config_path, toml_content)
            .await
            .expect("failed to write test config");

        let mut config = AppConfig::load(&config_path)
            .await
            .expect("failed to parse test config");
        if Path::new(&config.storage.local_path).is_relative() {
            config.storage.local_path = dir
                .path()
                .join(&config.storage.local_path)
                .display()
                .to_string();
        }

        let session = Persistence::init(&config).expect("failed to init session");
        Self {
            session,
            config,
            dir,
        }
    }

    /// Root of the session's temp directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Backing file for `group`.
    pub fn save_file(&self, group: &str) -> PathBuf {
        Path::new(&self.config.storage.local_path).join(format!("{group}.save"))
    }
}
