//! Cluster access.
//!
//! Wraps the Kubernetes client with the small set of operations the
//! operator needs: list-by-ownership-label, and an idempotent
//! create-or-update primitive. Fields that the cluster owns (resource
//! version, cluster IP, the running image) are carried over on update
//! through a per-kind preserve policy instead of ad-hoc copying at each
//! call site.

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::OperatorError;

/// Label selector identifying resources owned by the operator.
pub const OWNER_SELECTOR: &str = "creator=pipeline";

/// Label marking a Service the reaper must never delete. Any value
/// counts; existing deployments set it to "yes".
pub const PROTECTED_LABEL: &str = "delete-protected";

/// External resource kinds the operator knows how to manage.
pub const SUPPORTED_EXTERNAL_KINDS: [&str; 4] = ["mongo", "mysql", "cassandra", "redis"];

/// API group serving external resource kinds.
pub const EXTERNAL_GROUP: &str = "environments.microscaler.io";

/// API version of the external resource group.
pub const EXTERNAL_VERSION: &str = "v1";

/// Preserve policy applied while updating an existing resource: copies
/// cluster-owned fields from `current` onto the freshly mapped object.
pub type PreservePolicy<K> = fn(&mut K, &K);

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Title-cases an external kind for use as a resource `kind` ("mysql"
/// becomes "Mysql").
pub fn external_kind_name(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn external_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        EXTERNAL_GROUP,
        EXTERNAL_VERSION,
        &external_kind_name(kind),
    ))
}

/// Kubernetes client wrapper scoped to the operations the operator uses.
#[derive(Clone)]
pub struct Cluster {
    client: Client,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").finish_non_exhaustive()
    }
}

impl Cluster {
    /// Builds a client from the default (in-cluster or kubeconfig)
    /// configuration. Failure here is fatal to startup.
    pub async fn connect() -> Result<Self, OperatorError> {
        let client = Client::try_default().await?;
        Ok(Cluster { client })
    }

    /// Wraps an already-constructed client (used by tests).
    pub fn with_client(client: Client) -> Self {
        Cluster { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Lists operator-owned resources of one kind in a namespace.
    pub async fn list<K>(&self, namespace: &str) -> Result<Vec<K>, OperatorError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let params = ListParams::default().labels(OWNER_SELECTOR);
        let list = self.api::<K>(namespace).list(&params).await?;
        Ok(list.items)
    }

    /// Fetches a resource by name; a missing resource is `None`, not an
    /// error.
    pub async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, OperatorError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        match self.api::<K>(namespace).get(name).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create-or-update primitive used for every resource kind.
    ///
    /// When the resource exists, the update carries over the current
    /// resource version and whatever the kind's preserve policy keeps;
    /// otherwise the resource is created as mapped.
    pub async fn apply<K>(
        &self,
        namespace: &str,
        mut resource: K,
        preserve: PreservePolicy<K>,
    ) -> Result<(), OperatorError>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api = self.api::<K>(namespace);
        let name = resource.name_any();
        match self.get_opt::<K>(namespace, &name).await? {
            Some(current) => {
                debug!(resource = %name, "updating existing resource");
                resource.meta_mut().resource_version = current.meta().resource_version.clone();
                preserve(&mut resource, &current);
                api.replace(&name, &PostParams::default(), &resource).await?;
            }
            None => {
                debug!(resource = %name, "creating resource");
                api.create(&PostParams::default(), &resource).await?;
            }
        }
        Ok(())
    }

    /// Creates a resource only when absent; an existing resource is left
    /// untouched. Used for load-bearing secrets that must never be
    /// rotated by reconciliation.
    pub async fn create_if_absent<K>(&self, namespace: &str, resource: K) -> Result<(), OperatorError>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let name = resource.name_any();
        if self.get_opt::<K>(namespace, &name).await?.is_some() {
            return Ok(());
        }
        self.api::<K>(namespace)
            .create(&PostParams::default(), &resource)
            .await?;
        Ok(())
    }

    /// Deletes a resource; a missing resource is not an error.
    pub async fn delete_if_exists<K>(&self, namespace: &str, name: &str) -> Result<(), OperatorError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Retrieves namespace metadata; used to recover the logical
    /// environment name from the namespace's `environment` label.
    pub async fn namespace_info(&self, namespace: &str) -> Result<Namespace, OperatorError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(namespace).await {
            Ok(ns) => Ok(ns),
            Err(e) if is_not_found(&e) => {
                Err(OperatorError::NamespaceNotFound(namespace.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn external_api(&self, namespace: &str, kind: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &external_resource(kind))
    }

    /// Lists external resources of one supported kind.
    pub async fn list_external(
        &self,
        namespace: &str,
        kind: &str,
    ) -> Result<Vec<DynamicObject>, OperatorError> {
        let list = self
            .external_api(namespace, kind)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    /// Create-or-update for an external resource.
    pub async fn apply_external(
        &self,
        namespace: &str,
        kind: &str,
        mut resource: DynamicObject,
    ) -> Result<(), OperatorError> {
        let api = self.external_api(namespace, kind);
        let name = resource.name_any();
        match api.get(&name).await {
            Ok(current) => {
                debug!(resource = %name, kind, "updating external resource");
                resource.metadata.resource_version = current.metadata.resource_version.clone();
                api.replace(&name, &PostParams::default(), &resource).await?;
            }
            Err(e) if is_not_found(&e) => {
                debug!(resource = %name, kind, "creating external resource");
                api.create(&PostParams::default(), &resource).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Deletes an external resource; missing resources are ignored.
    pub async fn delete_external_if_exists(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<(), OperatorError> {
        match self
            .external_api(namespace, kind)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Preserve-on-update policies, one per resource kind. Evaluated
/// uniformly by [`Cluster::apply`] after the resource version carry-over.
pub mod preserve {
    use super::{Deployment, Secret, Service, StatefulSet};
    use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use k8s_openapi::api::networking::v1::Ingress;

    /// The cluster assigns the ClusterIP; it is immutable after create.
    pub fn service(new: &mut Service, current: &Service) {
        if let Some(current_spec) = &current.spec {
            if let Some(new_spec) = &mut new.spec {
                new_spec.cluster_ip = current_spec.cluster_ip.clone();
            }
        }
    }

    /// Keeps the running image when the new spec leaves it unset, and the
    /// existing version label when not explicitly superseded.
    pub fn deployment(new: &mut Deployment, current: &Deployment) {
        let new_labels = new.metadata.labels.get_or_insert_with(Default::default);
        if new_labels.get("version").is_none_or(String::is_empty) {
            if let Some(version) = current
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("version"))
            {
                new_labels.insert("version".to_string(), version.clone());
            }
        }

        let current_image = current
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone());
        if let Some(container) = new
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|s| s.containers.first_mut())
        {
            if container.image.as_deref().unwrap_or_default().is_empty() {
                container.image = current_image;
            }
        }
    }

    /// Selector, service name and volume claim templates are immutable on
    /// a StatefulSet; updates keep what the cluster already has.
    pub fn stateful_set(new: &mut StatefulSet, current: &StatefulSet) {
        if let (Some(new_spec), Some(current_spec)) = (new.spec.as_mut(), current.spec.as_ref()) {
            new_spec.selector = current_spec.selector.clone();
            new_spec.service_name = current_spec.service_name.clone();
            new_spec.volume_claim_templates = current_spec.volume_claim_templates.clone();
        }
    }

    /// Nothing beyond resource version to carry over.
    pub fn hpa(_new: &mut HorizontalPodAutoscaler, _current: &HorizontalPodAutoscaler) {}

    /// Nothing beyond resource version to carry over.
    pub fn ingress(_new: &mut Ingress, _current: &Ingress) {}

    /// Nothing beyond resource version to carry over.
    pub fn volume_claim(_new: &mut PersistentVolumeClaim, _current: &PersistentVolumeClaim) {}

    /// Secrets are create-only in practice; policy exists for symmetry.
    pub fn secret(_new: &mut Secret, _current: &Secret) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ServiceSpec};
    use std::collections::BTreeMap;

    fn deployment_with(image: Option<&str>, version_label: Option<&str>) -> Deployment {
        let mut labels = BTreeMap::new();
        if let Some(v) = version_label {
            labels.insert("version".to_string(), v.to_string());
        }
        Deployment {
            metadata: kube::core::ObjectMeta {
                name: Some("web".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_string(),
                            image: image.map(str::to_string),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_update_keeps_cluster_ip() {
        let mut new = Service {
            spec: Some(ServiceSpec::default()),
            ..Default::default()
        };
        let current = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.3.0.17".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        preserve::service(&mut new, &current);
        assert_eq!(
            new.spec.and_then(|s| s.cluster_ip),
            Some("10.3.0.17".to_string())
        );
    }

    #[test]
    fn deployment_update_keeps_running_image_when_unset() {
        let mut new = deployment_with(None, Some("2"));
        let current = deployment_with(Some("registry/app:1"), Some("1"));
        preserve::deployment(&mut new, &current);

        let image = new
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone());
        assert_eq!(image, Some("registry/app:1".to_string()));
        // Explicit version label wins
        let version = new
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("version"))
            .cloned();
        assert_eq!(version, Some("2".to_string()));
    }

    #[test]
    fn deployment_update_inherits_version_label_when_unset() {
        let mut new = deployment_with(Some("registry/app:2"), None);
        let current = deployment_with(Some("registry/app:1"), Some("1"));
        preserve::deployment(&mut new, &current);
        let version = new
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("version"))
            .cloned();
        assert_eq!(version, Some("1".to_string()));
    }

    #[test]
    fn external_kind_title_case() {
        assert_eq!(external_kind_name("mysql"), "Mysql");
        assert_eq!(external_kind_name("mongo"), "Mongo");
        assert_eq!(external_kind_name(""), "");
    }
}
