//! Configuration file loading.
//!
//! The environments file is a YAML document with a top-level `project`
//! and a list of environments. Loading produces fresh [`Environment`]
//! values every time; nothing is cached across reconciliation cycles.

use std::path::Path;

use serde::Deserialize;

use crate::environment::Environment;
use crate::SpecError;

/// Top-level structure of the environments configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Project name, used as the image path component
    #[serde(default)]
    pub project: String,
    /// All managed environments
    #[serde(default)]
    pub environments: Vec<Environment>,
}

/// Loads and validates the whole configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ConfigFile, SpecError> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// Loads a single named environment from the configuration file.
pub fn load_environment(path: impl AsRef<Path>, name: &str) -> Result<Environment, SpecError> {
    let path = path.as_ref();
    let config = load_config(path)?;
    config
        .environments
        .into_iter()
        .find(|e| e.name == name)
        .ok_or_else(|| SpecError::EnvironmentNotFound {
            name: name.to_string(),
            path: path.display().to_string(),
        })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
