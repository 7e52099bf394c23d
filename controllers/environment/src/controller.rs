//! Main control loop.
//!
//! Runs on a fixed period: load the desired environment from the synced
//! configuration file, aggregate the actual state, diff, reconcile, then
//! launch cleanup in the background. Cleanup from one iteration is never
//! awaited by the loop, but a new one is not started while the previous
//! is still running, so at most one reaper pass is in flight.

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator;
use crate::cluster::Cluster;
use crate::config::OperatorConfig;
use crate::diff;
use crate::error::OperatorError;
use crate::reaper::Reaper;
use crate::reconciler::Reconciler;

/// Periodic reconciliation driver for one environment.
pub struct Controller {
    cluster: Cluster,
    config: OperatorConfig,
}

impl Controller {
    /// Connects to the cluster. Failure here is fatal; everything after
    /// startup is retried on the next cycle instead.
    pub async fn new(config: OperatorConfig) -> Result<Self, OperatorError> {
        let cluster = Cluster::connect().await?;
        Ok(Controller { cluster, config })
    }

    /// Runs the reconciliation loop forever.
    pub async fn run(&self) -> Result<(), OperatorError> {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup: Option<JoinHandle<()>> = None;

        loop {
            ticker.tick().await;
            self.run_cycle(&mut cleanup).await;
        }
    }

    async fn run_cycle(&self, cleanup: &mut Option<JoinHandle<()>>) {
        // A failed config load means no desired state this cycle; skip
        // reconciliation and reaping rather than act on nothing
        let mut desired =
            match envspec::load_environment(&self.config.config_path, &self.config.environment) {
                Ok(environment) => environment,
                Err(e) => {
                    warn!(error = %e, "error loading desired environment, skipping cycle");
                    return;
                }
            };
        if desired.namespace.is_empty() {
            desired.namespace = self.config.namespace.clone();
        }
        let namespace = desired.namespace.clone();

        let actual = match aggregator::load_environment(&self.cluster, &namespace).await {
            Ok(environment) => environment,
            Err(e) => {
                error!(error = %e, "error loading actual environment, skipping cycle");
                return;
            }
        };

        let changes = diff::compare(&mut desired, &actual);
        if changes.is_empty() {
            debug!(environment = %desired.name, "no changes detected");
        } else {
            info!(environment = %desired.name, changes = %changes, "changes detected");
        }

        Reconciler::new(&self.cluster, &self.config)
            .apply(&desired, &changes)
            .await;

        self.spawn_cleanup(cleanup, desired);
    }

    /// Fires cleanup in the background without awaiting it. A pass still
    /// running from an earlier cycle keeps the slot; overlapping reapers
    /// could delete from state another pass is mutating.
    fn spawn_cleanup(&self, cleanup: &mut Option<JoinHandle<()>>, desired: envspec::Environment) {
        if cleanup.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("previous cleanup pass still running, not starting another");
            return;
        }
        let cluster = self.cluster.clone();
        *cleanup = Some(tokio::spawn(async move {
            let reaper = Reaper::new(&cluster, &desired.namespace);
            if let Err(e) = reaper.cleanup(&desired).await {
                error!(error = %e, "cleanup pass failed");
            }
        }));
    }
}
