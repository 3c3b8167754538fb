//! Engine configuration

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pipeline engine configuration
///
/// ```toml
/// parallel = true
/// max_threads = 4
/// check_history = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Evaluate independent terms of the same rank on a thread pool
    pub parallel: bool,
    /// Size of the evaluation thread pool (None = rayon default)
    pub max_threads: Option<usize>,
    /// Check the look-back range against the bar store before fetching
    pub check_history: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_threads: None,
            check_history: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parallel configuration with an optional pool size
    pub fn parallel(max_threads: Option<usize>) -> Self {
        Self {
            parallel: true,
            max_threads,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_threads == Some(0) {
            return Err(PipelineError::ConfigError(
                "max_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
