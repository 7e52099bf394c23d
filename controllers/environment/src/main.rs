//! Environment Operator
//!
//! Converges a Kubernetes namespace onto the declarative environment
//! definition held in a synced configuration file. Every cycle the
//! operator loads the desired environment, aggregates the actual state
//! from the cluster, diffs the two, applies what drifted and reaps what
//! is no longer declared.

mod aggregator;
mod cluster;
mod config;
mod controller;
mod diff;
mod error;
mod mapper;
mod reaper;
mod reconciler;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::OperatorConfig;
use crate::controller::Controller;
use crate::error::OperatorError;

#[tokio::main]
async fn main() -> Result<(), OperatorError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OperatorConfig::from_env()?;
    info!(
        environment = %config.environment,
        namespace = %config.namespace,
        config_path = %config.config_path,
        interval = ?config.interval,
        "starting environment operator"
    );

    let controller = Controller::new(config).await?;
    controller.run().await
}
