// Engine configuration
// Defaults, optional file and LIFECYCLE__* environment overrides

//! # Engine Configuration
//!
//! [`EngineConfig`] is assembled with the `config` crate from three layers,
//! later ones winning:
//!
//! 1. built-in defaults
//! 2. an optional file (`lifecycle.toml` unless another path is given)
//! 3. environment variables prefixed `LIFECYCLE__`, with `__` between
//!    section and key, e.g. `LIFECYCLE__DISPATCH__WORKERS=8`
//!
//! ```toml
//! log_level = "debug"
//!
//! [dispatch]
//! queue_capacity = 256
//! workers = 2
//!
//! [transaction]
//! commit_failure_policy = "poison"
//! ```

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::CommitFailurePolicy;
use crate::Result;

pub const DEFAULT_CONFIG_FILE: &str = "lifecycle.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Bound of the job notification queue
    pub queue_capacity: usize,
    /// Number of worker tasks draining the queue
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            queue_capacity: 1024,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub commit_failure_policy: CommitFailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionsConfig {
    /// Fall back to the packaged `Default` and `CompositeActivity` machines
    pub bootstrap_defaults: bool,
}

impl Default for DefinitionsConfig {
    fn default() -> Self {
        DefinitionsConfig { bootstrap_defaults: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub definitions: DefinitionsConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dispatch: DispatchConfig::default(),
            transaction: TransactionConfig::default(),
            definitions: DefinitionsConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load from defaults, `lifecycle.toml` if present, and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE), false)
    }

    /// Load with an explicit file; `required` makes a missing file an error
    pub fn load_from(path: &Path, required: bool) -> Result<Self> {
        let defaults = EngineConfig::default();
        let config = Config::builder()
            .set_default("dispatch.queue_capacity", defaults.dispatch.queue_capacity as i64)?
            .set_default("dispatch.workers", defaults.dispatch.workers as i64)?
            .set_default("transaction.commit_failure_policy", "abort")?
            .set_default("definitions.bootstrap_defaults", defaults.definitions.bootstrap_defaults)?
            .set_default("log_level", defaults.log_level)?
            .add_source(File::from(path).required(required))
            .add_source(
                Environment::with_prefix("LIFECYCLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate().map_err(crate::LifecycleError::InvalidData)?;
        Ok(engine_config)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.dispatch.queue_capacity == 0 {
            return Err("dispatch.queue_capacity must be at least 1".to_string());
        }
        if self.dispatch.workers == 0 {
            return Err("dispatch.workers must be at least 1".to_string());
        }
        Ok(())
    }
}
