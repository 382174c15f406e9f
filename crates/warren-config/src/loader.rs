//! Configuration loader with multi-source merging.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::WarrenConfig;

/// Builder-style loader: defaults, then `warren.toml`, then `WARREN_*` env.
pub struct ConfigLoader {
    config_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/warren"),
            env_prefix: "WARREN".to_string(),
        }
    }

    pub fn with_config_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence.
    pub fn load(self) -> Result<WarrenConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = WarrenConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. warren.toml
        let config_file = self.config_dir.join("warren.toml");
        if config_file.exists() {
            builder = builder.add_source(
                config::File::from(config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Environment (WARREN_MANAGER_LISTEN_ADDR=..., one level deep)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build().context("failed to merge configuration")?;
        merged
            .try_deserialize()
            .context("failed to deserialize configuration")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_load_without_any_files() {
        let dir = tempdir().unwrap();
        let config = ConfigLoader::new()
            .with_config_dir(dir.path())
            .with_env_prefix("WARREN_TEST_NONE")
            .load()
            .unwrap();

        assert_eq!(config.scheduler.tick_ms, 5_000);
        assert_eq!(config.reconciler.tick_ms, 10_000);
        assert_eq!(config.reconciler.down_threshold_ms, 20_000);
        assert_eq!(config.worker.heartbeat_ms, 5_000);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("warren.toml"),
            r#"
[reconciler]
down_threshold_ms = 30000

[manager]
listen_addr = "0.0.0.0:9000"
"#,
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_config_dir(dir.path())
            .with_env_prefix("WARREN_TEST_FILE")
            .load()
            .unwrap();

        assert_eq!(config.reconciler.down_threshold_ms, 30_000);
        assert_eq!(config.manager.listen_addr, "0.0.0.0:9000");
        // Untouched sections keep their defaults.
        assert_eq!(config.scheduler.tick_ms, 5_000);
    }
}
