//! Operator configuration.
//!
//! All settings come from environment variables, matching how the
//! operator is configured when deployed as a pod. Only the environment
//! name is mandatory; everything else has a working default.

use std::env;
use std::time::Duration;

use crate::error::OperatorError;

/// Runtime configuration for the operator.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Logical environment name to manage
    pub environment: String,
    /// Namespace the environment lives in
    pub namespace: String,
    /// Path to the synced environments configuration file
    pub config_path: String,
    /// Docker registry prefix for built images
    pub registry: String,
    /// Project name, the second image path component
    pub project: String,
    /// Comma-separated image pull secret names
    pub registry_secrets: String,
    /// Period of the reconciliation loop
    pub interval: Duration,
}

impl OperatorConfig {
    /// Reads configuration from environment variables.
    pub fn from_env() -> Result<Self, OperatorError> {
        let environment = env::var("ENVIRONMENT_NAME").map_err(|_| {
            OperatorError::InvalidConfig(
                "ENVIRONMENT_NAME environment variable is required".to_string(),
            )
        })?;
        let namespace = env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let config_path = env::var("CONFIG_PATH")
            .unwrap_or_else(|_| "/etc/operator/environments.yaml".to_string());
        let registry = env::var("DOCKER_REGISTRY").unwrap_or_default();
        let project = env::var("PROJECT").unwrap_or_default();
        let registry_secrets = env::var("DOCKER_PULL_SECRETS").unwrap_or_default();

        let interval_secs = match env::var("RECONCILE_INTERVAL_SECONDS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                OperatorError::InvalidConfig(format!(
                    "RECONCILE_INTERVAL_SECONDS: not a number: {raw:?}"
                ))
            })?,
            Err(_) => 30,
        };

        Ok(OperatorConfig {
            environment,
            namespace,
            config_path,
            registry,
            project,
            registry_secrets,
            interval: Duration::from_secs(interval_secs),
        })
    }

    /// Full image reference for an application at a version.
    pub fn image(&self, application: &str, version: &str) -> String {
        format!("{}/{}/{application}:{version}", self.registry, self.project)
    }
}
