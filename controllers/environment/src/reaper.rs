//! Orphan cleanup.
//!
//! After reconciliation, any owned service still present in the cluster
//! but absent from the desired configuration is an orphan and gets its
//! child resources deleted. The actual state is reloaded fresh here:
//! deleting from possibly-stale data is worse than skipping a pass, so
//! a failed reload aborts cleanup entirely.

use envspec::{Environment, Service, ServiceKind};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service as CoreService};
use k8s_openapi::api::networking::v1::Ingress;
use tracing::{error, info, warn};

use crate::aggregator;
use crate::cluster::Cluster;
use crate::error::OperatorError;

/// Deletes cluster resources belonging to services that are no longer
/// part of the desired environment.
pub struct Reaper<'a> {
    cluster: &'a Cluster,
    namespace: &'a str,
}

/// Splits the actual services into deletable orphans and orphans that
/// carry the delete-protection marker.
fn partition_orphans<'e>(
    desired: &Environment,
    actual: &'e Environment,
) -> (Vec<&'e Service>, Vec<String>) {
    let mut orphans = Vec::new();
    let mut protected = Vec::new();
    for service in &actual.services {
        if desired.find_service(&service.name).is_some() {
            continue;
        }
        if service.protected {
            protected.push(service.name.clone());
        } else {
            orphans.push(service);
        }
    }
    (orphans, protected)
}

impl<'a> Reaper<'a> {
    /// Builds a reaper over a cluster connection.
    pub fn new(cluster: &'a Cluster, namespace: &'a str) -> Self {
        Reaper { cluster, namespace }
    }

    /// Deletes every orphaned service's child resources.
    ///
    /// Protected orphans are refused and reported as an error after the
    /// deletable ones have been handled; they are never silently
    /// skipped.
    pub async fn cleanup(&self, desired: &Environment) -> Result<(), OperatorError> {
        let actual = aggregator::load_environment(self.cluster, self.namespace)
            .await
            .map_err(|e| OperatorError::CleanupAborted(e.to_string()))?;

        let (orphans, protected) = partition_orphans(desired, &actual);
        for service in orphans {
            info!(service = %service.name, "found orphan service, deleting");
            self.delete_service(service).await;
        }

        if protected.is_empty() {
            Ok(())
        } else {
            warn!(services = %protected.join(", "), "refusing to delete protected services");
            Err(OperatorError::DeleteProtected(protected.join(", ")))
        }
    }

    /// Deletes the child resources of one orphan. Individual delete
    /// failures are logged; the remaining children are still attempted.
    async fn delete_service(&self, service: &Service) {
        let name = service.name.as_str();

        if let Err(e) = self.cluster.delete_if_exists::<Ingress>(self.namespace, name).await {
            error!(service = name, error = %e, "error deleting ingress");
        }
        if let Err(e) = self
            .cluster
            .delete_if_exists::<Deployment>(self.namespace, name)
            .await
        {
            error!(service = name, error = %e, "error deleting deployment");
        }
        if matches!(service.kind, ServiceKind::StatefulDatabase(_)) {
            if let Err(e) = self
                .cluster
                .delete_if_exists::<StatefulSet>(self.namespace, name)
                .await
            {
                error!(service = name, error = %e, "error deleting statefulset");
            }
        }
        if let Err(e) = self
            .cluster
            .delete_if_exists::<CoreService>(self.namespace, name)
            .await
        {
            error!(service = name, error = %e, "error deleting service");
        }
        for volume in &service.volumes {
            if let Err(e) = self
                .cluster
                .delete_if_exists::<PersistentVolumeClaim>(self.namespace, &volume.name)
                .await
            {
                error!(service = name, volume = %volume.name, error = %e, "error deleting volume claim");
            }
        }
        if let Some(kind) = service.kind.external_kind() {
            if let Err(e) = self
                .cluster
                .delete_external_if_exists(self.namespace, kind, name)
                .await
            {
                error!(service = name, kind, error = %e, "error deleting external resource");
            }
        }
    }
}

#[cfg(test)]
#[path = "reaper_test.rs"]
mod reaper_test;
