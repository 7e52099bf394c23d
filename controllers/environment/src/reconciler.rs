//! Reconciliation of desired state into the cluster.
//!
//! Walks the desired services and applies the manifests each one needs.
//! A failed apply is logged and never aborts the pass; the control loop
//! is periodic, so the failed resource is retried on the next cycle.

use envspec::{Environment, Service, ServiceKind};
use tracing::{debug, error, info};

use crate::cluster::{Cluster, preserve};
use crate::config::OperatorConfig;
use crate::diff::ChangeSet;
use crate::error::OperatorError;
use crate::mapper::Mapper;

/// Applies desired environments against the cluster.
pub struct Reconciler<'a> {
    cluster: &'a Cluster,
    config: &'a OperatorConfig,
}

/// Workload mutation is gated on the service being deployable at all
/// (already running, or with a configured version) and actually drifted.
/// HPA and Ingress application is not gated.
fn should_deploy(service: &Service, changes: &ChangeSet) -> bool {
    (!service.status.deployed_at.is_empty() || !service.version.is_empty())
        && changes.changed(&service.name)
}

impl<'a> Reconciler<'a> {
    /// Builds a reconciler over a cluster connection.
    pub fn new(cluster: &'a Cluster, config: &'a OperatorConfig) -> Self {
        Reconciler { cluster, config }
    }

    /// Applies every service of the desired environment. Individual
    /// resource failures are logged and skipped.
    pub async fn apply(&self, desired: &Environment, changes: &ChangeSet) {
        for service in &desired.services {
            if let Err(e) = self.apply_service(desired, service, changes).await {
                error!(service = %service.name, error = %e, "error reconciling service");
            }
        }
    }

    async fn apply_service(
        &self,
        desired: &Environment,
        service: &Service,
        changes: &ChangeSet,
    ) -> Result<(), OperatorError> {
        let namespace = desired.namespace.as_str();
        let mapper = Mapper::new(service, namespace, self.config);

        if let Some(kind) = service.kind.external_kind() {
            let resource = mapper.external_resource()?;
            info!(service = %service.name, kind, "applying external resource");
            return self.cluster.apply_external(namespace, kind, resource).await;
        }

        if should_deploy(service, changes) {
            match &service.kind {
                ServiceKind::StatefulDatabase(_) => {
                    self.apply_database(namespace, service, &mapper).await;
                }
                _ => {
                    self.apply_workload(namespace, service, &mapper).await;
                }
            }
        } else {
            debug!(service = %service.name, "no deployable change, skipping workload");
        }

        // Update of an existing autoscaler is unconditional; creation
        // only happens once a minimum is configured
        self.apply_hpa(namespace, service, &mapper).await;

        if service.has_external_url() {
            match mapper.ingress() {
                Ok(ingress) => {
                    if let Err(e) = self
                        .cluster
                        .apply(namespace, ingress, preserve::ingress)
                        .await
                    {
                        error!(service = %service.name, error = %e, "error applying ingress");
                    }
                }
                Err(e) => error!(service = %service.name, error = %e, "error building ingress"),
            }
        }

        Ok(())
    }

    async fn apply_workload(&self, namespace: &str, service: &Service, mapper: &Mapper<'_>) {
        info!(service = %service.name, version = %service.version, "deploying service");
        match mapper.deployment() {
            Ok(deployment) => {
                if let Err(e) = self
                    .cluster
                    .apply(namespace, deployment, preserve::deployment)
                    .await
                {
                    error!(service = %service.name, error = %e, "error applying deployment");
                }
            }
            Err(e) => error!(service = %service.name, error = %e, "error building deployment"),
        }

        for claim in mapper.volume_claims() {
            if let Err(e) = self
                .cluster
                .apply(namespace, claim, preserve::volume_claim)
                .await
            {
                error!(service = %service.name, error = %e, "error applying volume claim");
            }
        }

        if let Err(e) = self
            .cluster
            .apply(namespace, mapper.service(), preserve::service)
            .await
        {
            error!(service = %service.name, error = %e, "error applying service");
        }
    }

    async fn apply_database(&self, namespace: &str, service: &Service, mapper: &Mapper<'_>) {
        info!(service = %service.name, version = %service.version, "deploying stateful database");

        // The keyfile is load-bearing for a running replica set; it must
        // never be regenerated once members authenticate with it
        if let Err(e) = self
            .cluster
            .create_if_absent(namespace, mapper.mongo_secret())
            .await
        {
            error!(service = %service.name, error = %e, "error ensuring database secret");
        }

        match mapper.mongo_stateful_set() {
            Ok(set) => {
                if let Err(e) = self
                    .cluster
                    .apply(namespace, set, preserve::stateful_set)
                    .await
                {
                    error!(service = %service.name, error = %e, "error applying statefulset");
                }
            }
            Err(e) => error!(service = %service.name, error = %e, "error building statefulset"),
        }

        if let Err(e) = self
            .cluster
            .apply(namespace, mapper.headless_service(), preserve::service)
            .await
        {
            error!(service = %service.name, error = %e, "error applying headless service");
        }
    }

    async fn apply_hpa(&self, namespace: &str, service: &Service, mapper: &Mapper<'_>) {
        use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;

        let exists = match self
            .cluster
            .get_opt::<HorizontalPodAutoscaler>(namespace, &service.name)
            .await
        {
            Ok(current) => current.is_some(),
            Err(e) => {
                error!(service = %service.name, error = %e, "error reading autoscaler");
                return;
            }
        };
        if !exists && service.hpa.min_replicas == 0 {
            return;
        }
        if let Err(e) = self
            .cluster
            .apply(namespace, mapper.hpa(), preserve::hpa)
            .await
        {
            error!(service = %service.name, error = %e, "error applying autoscaler");
        }
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
