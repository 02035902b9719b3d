//! Configuration module for flowbridge
//!
//! Controls how stages are primed and how much output a stage may produce
//! ahead of downstream demand.
//!
//! # Files
//!
//! Configs are stored as JSON (primary format). Paths ending in `.toml` are
//! read and written as TOML instead.
//!
//! # Example
//!
//! ```ignore
//! use flowbridge::config::{FlowConfig, Priming};
//!
//! let mut config = FlowConfig::load_or_default("flow.json");
//! config.priming.duplex = Priming::Eager;
//! config.save("flow.json")?;
//! ```

use crate::error::{FlowError, Result};
use crate::pipeline::Role;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default readable-side high-water mark (items per demand callback)
pub const DEFAULT_HIGH_WATER_MARK: usize = 1;

/// Default capacity of an eager stage's prefetch buffer
pub const DEFAULT_PREFETCH: usize = 1;

/// Default prefix for pump and worker thread names
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "flowbridge";

/// When a stage function is first advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priming {
    /// Start immediately, before anything asks for output.
    Eager,
    /// Start only when downstream demand (or the first write) arrives.
    OnDemand,
}

impl std::fmt::Display for Priming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priming::Eager => write!(f, "eager"),
            Priming::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Priming choice per stage role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimingConfig {
    pub source: Priming,
    pub duplex: Priming,
    pub sink: Priming,
}

impl PrimingConfig {
    pub fn for_role(&self, role: Role) -> Priming {
        match role {
            Role::Source => self.source,
            Role::Duplex => self.duplex,
            Role::Sink => self.sink,
        }
    }
}

impl Default for PrimingConfig {
    fn default() -> Self {
        Self {
            source: Priming::OnDemand,
            duplex: Priming::OnDemand,
            // Nothing pulls a sink's output, so it has to start itself.
            sink: Priming::Eager,
        }
    }
}

/// Pipeline-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Items a stage may push per downstream demand callback
    pub high_water_mark: usize,

    /// Capacity of the buffer filled by eagerly primed sources and duplexes.
    /// Applied when a stage is built with `StageOptions::from_config`.
    pub prefetch: usize,

    /// Priming per stage role. Like `prefetch`, this is fixed when a stage
    /// is built; a pipeline only logs stages that disagree with it.
    pub priming: PrimingConfig,

    /// Prefix for spawned thread names
    pub thread_name_prefix: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            prefetch: DEFAULT_PREFETCH,
            priming: PrimingConfig::default(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl FlowConfig {
    /// Check the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark == 0 {
            return Err(FlowError::Config(
                "high_water_mark must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(FlowError::Config(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a config file (JSON, or TOML for `.toml` paths)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                FlowError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                FlowError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load flow config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config (JSON, or TOML for `.toml` paths)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| FlowError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| FlowError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            FlowError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}
