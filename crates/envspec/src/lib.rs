//! Environment Model
//!
//! Declarative model of a managed environment: services, their workload
//! shape, autoscaling, volumes and ingress endpoints. An [`Environment`]
//! value is produced either by parsing the environments configuration
//! file or by aggregating live cluster state, so both sides of the
//! reconciliation diff share one representation.

pub mod config;
pub mod environment;
pub mod quantity;
pub mod service;

pub use config::{ConfigFile, load_config, load_environment};
pub use environment::{DeploymentSettings, Environment, Test};
pub use service::{
    DatabaseKind, EnvVar, HealthCheck, Hpa, Limits, Requests, Service, ServiceKind, ServiceStatus,
    Volume,
};

use thiserror::Error;

/// Errors produced while loading or validating environment configuration.
#[derive(Debug, Error)]
pub enum SpecError {
    /// Configuration file could not be read
    #[error("error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("error parsing configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsed but violates a model invariant
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Named environment is not present in the configuration file
    #[error("environment {name} not found in {path}")]
    EnvironmentNotFound {
        /// Environment name requested
        name: String,
        /// Path of the configuration file searched
        path: String,
    },
}
