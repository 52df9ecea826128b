//! Command line configuration.
//!
//! Loaded via the `config` crate from an optional file, then from
//! `STRATA__*` environment variables (`STRATA__RUNNER__MAX_WORKERS=4`).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use strata_workflow::RunnerConfig;

#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Directory holding persisted dispatch states.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Scheduler settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Worker count of the local and background job executors.
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".strata/states")
}

fn default_local_workers() -> usize {
    4
}

impl CliConfig {
    /// Loads configuration from `file` (if given) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read or a value is invalid.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file));
        }
        builder
            .add_source(
                config::Environment::with_prefix("STRATA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
