//! `foundry.toml` loading.
//!
//! Every section is optional: a missing file or an empty document yields the
//! built-in pipeline and queue defaults. `FOUNDRY_DB` overrides the database
//! path after the file is read.

use foundry_core::{PipelineConfig, QueueConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding [`FoundryConfig::database`].
pub const DB_ENV: &str = "FOUNDRY_DB";

/// Top-level `foundry.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FoundryConfig {
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Pipeline layout.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Job queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for FoundryConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            pipeline: PipelineConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("./data/foundry.db")
}

impl FoundryConfig {
    /// Read and validate `path`. A missing file is not an error.
    pub fn load(path: &Path) -> anyhow::Result<(Self, bool)> {
        let (mut config, found) = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
            })?;
            (Self::parse(&text)?, true)
        } else {
            (Self::default(), false)
        };
        if let Ok(db) = std::env::var(DB_ENV) {
            if !db.trim().is_empty() {
                config.database = PathBuf::from(db);
            }
        }
        Ok((config, found))
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.pipeline.validate()?;
        config.queue.validate()?;
        Ok(config)
    }
}
