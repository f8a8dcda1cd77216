//! Configuration loading for mockscope
//!
//! Loads `mockscope.toml`, found by walking up from a start directory or
//! given explicitly. `MOCKSCOPE_STORE` overrides the store strategy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::adapter::MarkerTable;
use crate::error::ConfigError;
use crate::store::StoreStrategy;

pub const CONFIG_FILE_NAME: &str = "mockscope.toml";
pub const STORE_ENV_VAR: &str = "MOCKSCOPE_STORE";

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct MockscopeConfig {
    /// Store strategy backing every scope level
    #[serde(default)]
    pub store: StoreStrategy,

    /// Allow `CreateScopedOrFallbackLocal` to fall back to a caller-keyed store
    #[serde(default = "default_local_fallback")]
    pub local_fallback: bool,

    /// Framework names to activate (empty means any available one)
    #[serde(default)]
    pub enable: Vec<String>,

    /// Extra framework marker tables, probed before the built-in presets
    #[serde(default)]
    pub frameworks: Vec<MarkerTable>,

    /// Modules treated as part of the mocking system itself
    #[serde(default)]
    pub internal_modules: Vec<String>,
}

impl Default for MockscopeConfig {
    fn default() -> Self {
        Self {
            store: StoreStrategy::default(),
            local_fallback: true,
            enable: Vec::new(),
            frameworks: Vec::new(),
            internal_modules: Vec::new(),
        }
    }
}

fn default_local_fallback() -> bool {
    true
}

impl MockscopeConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `MOCKSCOPE_STORE` when set.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = std::env::var(STORE_ENV_VAR) {
            self.store = parse_store(&value)?;
        }
        Ok(self)
    }
}

pub fn parse_store(value: &str) -> Result<StoreStrategy, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "strong" => Ok(StoreStrategy::Strong),
        "weak" => Ok(StoreStrategy::Weak),
        _ => Err(ConfigError::UnknownStore {
            value: value.to_string(),
        }),
    }
}

/// Find mockscope.toml starting from a path and walking up
pub fn find_config(start_path: &Path) -> Option<PathBuf> {
    let mut current = if start_path.is_file() {
        start_path.parent()?
    } else {
        start_path
    };

    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }

        current = current.parent()?;
    }
}

/// Load configuration from `path`, or discover it from the working directory.
///
/// Returns `Ok(None)` when no file exists; a file that exists but cannot be
/// read or parsed is an error.
pub fn load_config(path: Option<&Path>) -> Result<Option<MockscopeConfig>, ConfigError> {
    let config_path = match path {
        Some(p) if p.exists() => p.to_path_buf(),
        Some(_) => return Ok(None),
        None => {
            let Ok(cwd) = std::env::current_dir() else {
                return Ok(None);
            };
            match find_config(&cwd) {
                Some(found) => found,
                None => return Ok(None),
            }
        }
    };

    let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let config = MockscopeConfig::from_toml_str(&content, &config_path)?;
    log::debug!("loaded mockscope config from {}", config_path.display());
    Ok(Some(config))
}
