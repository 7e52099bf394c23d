//! State aggregation.
//!
//! Reconstructs the actual [`Environment`] by joining operator-owned
//! Kubernetes objects of several kinds into one [`Service`] record per
//! resource name. A placeholder record is created on first sighting of
//! any matching kind and enriched as further kinds are folded in;
//! unresolved fields stay at their zero value.
//!
//! A failure to list one resource kind is logged and treated as "no
//! resources of that kind found" so that a degraded read never blocks
//! reconciliation of the kinds that did load.

use std::collections::BTreeMap;

use envspec::{DatabaseKind, EnvVar, Environment, HealthCheck, Service, ServiceKind, ServiceStatus, Volume};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodSpec, Service as CoreService};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use tracing::error;

use crate::cluster::{Cluster, PROTECTED_LABEL, SUPPORTED_EXTERNAL_KINDS};
use crate::error::OperatorError;
use crate::mapper::ExternalResourceSpec;

/// Accumulates one [`Service`] record per resource name while cluster
/// objects are folded in kind by kind.
#[derive(Debug, Default)]
pub struct ServiceMap(BTreeMap<String, Service>);

fn label(meta: &ObjectMeta, key: &str) -> String {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .cloned()
        .unwrap_or_default()
}

/// Decodes the label-safe encoding of a mount path ("/" is stored as
/// "2F" because label values cannot contain slashes).
pub fn unescape_mount_path(escaped: &str) -> String {
    escaped.replace("2F", "/")
}

fn quantity_string(resources: Option<&BTreeMap<String, Quantity>>, key: &str) -> String {
    resources
        .and_then(|r| r.get(key))
        .map(|q| q.0.clone())
        .unwrap_or_default()
}

fn env_vars(pod: &PodSpec) -> Vec<EnvVar> {
    let Some(container) = pod.containers.first() else {
        return Vec::new();
    };
    let mut retval = Vec::new();
    for e in container.env.iter().flatten() {
        let var = match e.value_from.as_ref() {
            Some(source) if source.secret_key_ref.is_some() => {
                let selector = source.secret_key_ref.as_ref();
                let secret_name = selector.map(|s| s.name.clone()).unwrap_or_default();
                let key = selector.map(|s| s.key.clone()).unwrap_or_default();
                // Reconstruct the configuration spelling: plain key when
                // the secret is named after it, "secret/key" otherwise
                let value = if secret_name == key || secret_name.is_empty() {
                    key
                } else {
                    format!("{secret_name}/{key}")
                };
                EnvVar {
                    secret: e.name.clone(),
                    value,
                    ..EnvVar::default()
                }
            }
            Some(source) if source.field_ref.is_some() => EnvVar {
                name: e.name.clone(),
                pod_field: source
                    .field_ref
                    .as_ref()
                    .map(|f| f.field_path.clone())
                    .unwrap_or_default(),
                ..EnvVar::default()
            },
            _ => EnvVar {
                name: e.name.clone(),
                value: e.value.clone().unwrap_or_default(),
                ..EnvVar::default()
            },
        };
        retval.push(var);
    }
    retval
}

fn health_check(pod: &PodSpec) -> Option<HealthCheck> {
    let probe = pod.containers.first()?.liveness_probe.as_ref()?;
    let exec = probe.exec.as_ref()?;
    Some(HealthCheck {
        command: exec.command.clone().unwrap_or_default(),
        initial_delay: probe.initial_delay_seconds.unwrap_or(0),
        timeout: probe.timeout_seconds.unwrap_or(0),
    })
}

fn access_modes_string(modes: Option<&Vec<String>>) -> String {
    modes.map(|m| m.join(",")).unwrap_or_default()
}

impl ServiceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        ServiceMap::default()
    }

    fn create_or_get(&mut self, name: &str) -> &mut Service {
        self.0
            .entry(name.to_string())
            .or_insert_with(|| Service::named(name))
    }

    /// Folds in a core Service: ports, application label, and the
    /// delete-protection marker.
    pub fn add_service(&mut self, svc: &CoreService) {
        let name = svc.metadata.name.clone().unwrap_or_default();
        let application = label(&svc.metadata, "application");
        let protected = !label(&svc.metadata, PROTECTED_LABEL).is_empty();

        let record = self.create_or_get(&name);
        record.application = application;
        record.protected = protected;
        if let Some(ports) = svc.spec.as_ref().and_then(|s| s.ports.as_ref()) {
            for port in ports {
                record.ports.push(port.port);
            }
        }
    }

    /// Folds in a Deployment: replica count, labels, resources, env
    /// vars, probe, pod-template annotations and status.
    pub fn add_deployment(&mut self, deployment: &Deployment) {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let meta = &deployment.metadata;

        let ssl = label(meta, "ssl");
        let version = label(meta, "version");
        let application = label(meta, "application");
        let https_only = label(meta, "httpsOnly");
        let https_backend = label(meta, "httpsBackend");

        let record = self.create_or_get(&name);
        record.replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        record.ssl = ssl;
        record.version = version;
        record.application = application;
        record.https_only = https_only;
        record.https_backend = https_backend;

        if let Some(template) = deployment.spec.as_ref().map(|s| &s.template) {
            if let Some(annotations) = template.metadata.as_ref().and_then(|m| m.annotations.as_ref())
            {
                record.annotations = annotations.clone();
            }
            if let Some(pod) = template.spec.as_ref() {
                record.env_vars = env_vars(pod);
                record.health_check = health_check(pod);
                if let Some(container) = pod.containers.first() {
                    record.commands = container.command.clone().unwrap_or_default();
                    if let Some(resources) = container.resources.as_ref() {
                        record.requests.cpu = quantity_string(resources.requests.as_ref(), "cpu");
                        record.requests.memory =
                            quantity_string(resources.requests.as_ref(), "memory");
                        record.limits.cpu = quantity_string(resources.limits.as_ref(), "cpu");
                        record.limits.memory = quantity_string(resources.limits.as_ref(), "memory");
                    }
                }
            }
        }

        let status = deployment.status.as_ref();
        record.status = ServiceStatus {
            available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
            desired_replicas: status.and_then(|s| s.replicas).unwrap_or(0),
            current_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
            deployed_at: meta
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339())
                .unwrap_or_default(),
        };
    }

    /// Folds in a mongo StatefulSet; same enrichment as a Deployment
    /// plus the stateful-database service kind.
    pub fn add_mongo_stateful_set(&mut self, set: &StatefulSet) {
        let name = set.metadata.name.clone().unwrap_or_default();
        let meta = &set.metadata;

        let version = label(meta, "version");
        let application = label(meta, "application");

        let record = self.create_or_get(&name);
        record.kind = ServiceKind::StatefulDatabase(DatabaseKind::Mongo);
        record.replicas = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        record.version = version;
        record.application = application;

        if let Some(template) = set.spec.as_ref().map(|s| &s.template) {
            if let Some(annotations) = template.metadata.as_ref().and_then(|m| m.annotations.as_ref())
            {
                record.annotations = annotations.clone();
            }
            if let Some(pod) = template.spec.as_ref() {
                record.env_vars = env_vars(pod);
                record.health_check = health_check(pod);
                if let Some(resources) =
                    pod.containers.first().and_then(|c| c.resources.as_ref())
                {
                    record.requests.cpu = quantity_string(resources.requests.as_ref(), "cpu");
                    record.requests.memory = quantity_string(resources.requests.as_ref(), "memory");
                    record.limits.cpu = quantity_string(resources.limits.as_ref(), "cpu");
                    record.limits.memory = quantity_string(resources.limits.as_ref(), "memory");
                }
            }
        }

        let status = set.status.as_ref();
        record.status = ServiceStatus {
            available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
            desired_replicas: status.map(|s| s.replicas).unwrap_or(0),
            current_replicas: status.and_then(|s| s.current_replicas).unwrap_or(0),
            deployed_at: meta
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339())
                .unwrap_or_default(),
        };
    }

    /// Folds in an autoscaler: replica bounds and utilization target.
    pub fn add_hpa(&mut self, hpa: &HorizontalPodAutoscaler) {
        let name = hpa.metadata.name.clone().unwrap_or_default();
        let record = self.create_or_get(&name);
        if let Some(spec) = hpa.spec.as_ref() {
            record.hpa.min_replicas = spec.min_replicas.unwrap_or(0);
            record.hpa.max_replicas = spec.max_replicas;
            record.hpa.target_cpu_utilization_percentage =
                spec.target_cpu_utilization_percentage.unwrap_or(0);
        }
    }

    /// Folds in a volume claim, keyed by the `deployment` label it
    /// carries; claims without the label are ignored.
    pub fn add_volume_claim(&mut self, claim: &PersistentVolumeClaim) {
        let owner = label(&claim.metadata, "deployment");
        if owner.is_empty() {
            return;
        }
        let volume = Volume {
            name: claim.metadata.name.clone().unwrap_or_default(),
            path: unescape_mount_path(&label(&claim.metadata, "mount_path")),
            modes: access_modes_string(claim.spec.as_ref().and_then(|s| s.access_modes.as_ref())),
            size: label(&claim.metadata, "size"),
            provisioning: String::new(),
        };
        self.create_or_get(&owner).volumes.push(volume);
    }

    /// Folds in an ingress: one external URL per rule, and a backend
    /// override when the rule points somewhere other than the service's
    /// own name and primary port.
    pub fn add_ingress(&mut self, ingress: &Ingress) {
        let name = ingress.metadata.name.clone().unwrap_or_default();
        let record = self.create_or_get(&name);

        let rules = ingress
            .spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default();

        for rule in rules {
            if let Some(host) = rule.host.clone() {
                record.external_url.push(host);
            }
        }

        let backend = rules
            .first()
            .and_then(|r| r.http.as_ref())
            .and_then(|h| h.paths.first())
            .and_then(|p| p.backend.service.as_ref());
        if let Some(backend) = backend {
            if backend.name != record.name {
                record.backend = backend.name.clone();
            }
            if let Some(number) = backend.port.as_ref().and_then(|p| p.number) {
                if record.ports.first() != Some(&number) {
                    record.backend_port = number;
                }
            }
        }
    }

    /// Folds in an externally-managed custom resource.
    pub fn add_external(&mut self, resource: &DynamicObject, kind: &str) {
        let name = resource.metadata.name.clone().unwrap_or_default();
        let record = self.create_or_get(&name);
        record.kind = ServiceKind::External(kind.to_lowercase());

        let spec: ExternalResourceSpec = resource
            .data
            .get("spec")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        record.version = spec.version;
        record.options = spec.options;
        if spec.replicas != 0 {
            record.replicas = spec.replicas;
        }
    }

    /// Consumes the map, yielding the accumulated records sorted by
    /// name. Deterministic ordering is required for diffing.
    pub fn services(self) -> Vec<Service> {
        self.0.into_values().collect()
    }
}

/// Loads the actual environment from the cluster.
///
/// The namespace itself must resolve (its `environment` label names the
/// logical environment); every per-kind list failure is tolerated.
pub async fn load_environment(
    cluster: &Cluster,
    namespace: &str,
) -> Result<Environment, OperatorError> {
    let ns = cluster.namespace_info(namespace).await?;
    let environment_name = label(&ns.metadata, "environment");

    let mut map = ServiceMap::new();

    match cluster.list::<CoreService>(namespace).await {
        Ok(services) => {
            for svc in &services {
                map.add_service(svc);
            }
        }
        Err(e) => error!(error = %e, "error loading kubernetes services"),
    }

    match cluster.list::<Deployment>(namespace).await {
        Ok(deployments) => {
            for deployment in &deployments {
                map.add_deployment(deployment);
            }
        }
        Err(e) => error!(error = %e, "error loading kubernetes deployments"),
    }

    match cluster.list::<StatefulSet>(namespace).await {
        Ok(sets) => {
            for set in &sets {
                map.add_mongo_stateful_set(set);
            }
        }
        Err(e) => error!(error = %e, "error loading kubernetes statefulsets"),
    }

    match cluster.list::<HorizontalPodAutoscaler>(namespace).await {
        Ok(hpas) => {
            for hpa in &hpas {
                map.add_hpa(hpa);
            }
        }
        Err(e) => error!(error = %e, "error loading kubernetes autoscalers"),
    }

    match cluster.list::<Ingress>(namespace).await {
        Ok(ingresses) => {
            for ingress in &ingresses {
                map.add_ingress(ingress);
            }
        }
        Err(e) => error!(error = %e, "error loading kubernetes ingresses"),
    }

    match cluster.list::<PersistentVolumeClaim>(namespace).await {
        Ok(claims) => {
            for claim in &claims {
                map.add_volume_claim(claim);
            }
        }
        Err(e) => error!(error = %e, "error loading kubernetes volume claims"),
    }

    for kind in SUPPORTED_EXTERNAL_KINDS {
        match cluster.list_external(namespace, kind).await {
            Ok(resources) => {
                for resource in &resources {
                    map.add_external(resource, kind);
                }
            }
            Err(e) => error!(error = %e, kind, "error loading external resources"),
        }
    }

    Ok(Environment {
        name: environment_name,
        namespace: namespace.to_string(),
        deployment: None,
        services: map.services(),
        tests: Vec::new(),
    })
}

#[cfg(test)]
#[path = "aggregator_test.rs"]
mod aggregator_test;
