//! Stack configuration: layered loading with environment overrides.
//!
//! Sources, lowest to highest precedence: built-in defaults, an optional
//! TOML file, then `STRATUM__`-prefixed environment variables (e.g.
//! `STRATUM__STORE__IN_MEMORY=true`).

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::StackError;
use crate::logging::LoggingConfig;
use crate::store::StoreOptions;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// On-disk store location; `None` selects an in-memory store.
    pub store_path: Option<PathBuf>,

    /// Store open options
    pub store: StoreOptions,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl StackConfig {
    /// Load configuration, merging `file` (when given and present) and the
    /// environment over the defaults.
    pub fn load(file: Option<&Path>) -> Result<StackConfig, StackError> {
        let mut builder = Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(
                File::with_name(&path.to_string_lossy()).required(false),
            );
        }

        let config = builder
            .add_source(
                Environment::with_prefix("STRATUM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
