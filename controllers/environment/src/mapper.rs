//! Manifest construction.
//!
//! Turns one [`Service`] into the concrete Kubernetes objects the
//! reconciler applies. Every object carries the `creator=pipeline`
//! ownership label so the state aggregator and the reaper can find it
//! again.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use envspec::Service;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar as K8sEnvVar, EnvVarSource, ExecAction, LocalObjectReference,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, Secret, SecretKeySelector,
    SecretVolumeSource, Service as CoreService, ServicePort, ServiceSpec, Volume as PodVolume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{EXTERNAL_GROUP, EXTERNAL_VERSION, external_kind_name};
use crate::config::OperatorConfig;
use crate::error::OperatorError;

/// Secret every mongo replica set member authenticates with. Created
/// once and never rotated by reconciliation.
pub const MONGO_SECRET_NAME: &str = "mongo-bootstrap-data";

/// Data key holding the mongo keyfile inside [`MONGO_SECRET_NAME`].
pub const MONGO_KEYFILE_KEY: &str = "internal-auth-mongodb-keyfile";

/// Spec payload of an externally-managed custom resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalResourceSpec {
    /// Engine version, e.g. "8.0"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Free-form engine options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    /// Replica count, zero when the kind has no notion of replicas
    #[serde(default, skip_serializing_if = "is_zero")]
    pub replicas: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

/// Builds Kubernetes manifests for one service of an environment.
pub struct Mapper<'a> {
    service: &'a Service,
    namespace: &'a str,
    config: &'a OperatorConfig,
}

impl<'a> Mapper<'a> {
    /// Scopes manifest construction to one service.
    pub fn new(service: &'a Service, namespace: &'a str, config: &'a OperatorConfig) -> Self {
        Mapper {
            service,
            namespace,
            config,
        }
    }

    fn manifest_error(&self, reason: impl Into<String>) -> OperatorError {
        OperatorError::Manifest {
            service: self.service.name.clone(),
            reason: reason.into(),
        }
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("creator".to_string(), "pipeline".to_string()),
            ("name".to_string(), self.service.name.clone()),
            ("application".to_string(), self.service.application.clone()),
        ])
    }

    fn workload_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert("version".to_string(), self.service.version.clone());
        labels
    }

    fn selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([
                ("creator".to_string(), "pipeline".to_string()),
                ("name".to_string(), self.service.name.clone()),
            ])),
            ..Default::default()
        }
    }

    fn metadata(&self, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.service.name.clone()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    fn service_ports(&self) -> Vec<ServicePort> {
        self.service
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(format!("tcp-port-{p}")),
                port: *p,
                target_port: Some(IntOrString::Int(*p)),
                ..Default::default()
            })
            .collect()
    }

    /// ClusterIP Service fronting the workload.
    pub fn service(&self) -> CoreService {
        CoreService {
            metadata: self.metadata(self.labels()),
            spec: Some(ServiceSpec {
                ports: Some(self.service_ports()),
                selector: self.selector().match_labels,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Headless Service for a stateful database; replica set members
    /// address each other by pod DNS, so no cluster IP is allocated.
    pub fn headless_service(&self) -> CoreService {
        let mut svc = self.service();
        if let Some(spec) = svc.spec.as_mut() {
            spec.cluster_ip = Some("None".to_string());
        }
        svc
    }

    /// One claim per declared volume. The mount path is carried in a
    /// label with "/" escaped, so the aggregator can reconstruct it.
    pub fn volume_claims(&self) -> Vec<PersistentVolumeClaim> {
        self.service
            .volumes
            .iter()
            .map(|vol| {
                let labels = BTreeMap::from([
                    ("creator".to_string(), "pipeline".to_string()),
                    ("deployment".to_string(), self.service.name.clone()),
                    ("mount_path".to_string(), vol.path.replace('/', "2F")),
                    ("size".to_string(), vol.size.clone()),
                ]);
                let mut spec = PersistentVolumeClaimSpec {
                    access_modes: Some(
                        vol.modes.split(',').map(|m| m.trim().to_string()).collect(),
                    ),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(vol.size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                if vol.has_manual_provisioning() {
                    // Bind to the pre-provisioned volume of the same name
                    spec.volume_name = Some(vol.name.clone());
                    spec.selector = Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            "name".to_string(),
                            vol.name.clone(),
                        )])),
                        ..Default::default()
                    });
                }
                PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(vol.name.clone()),
                        namespace: Some(self.namespace.to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    },
                    spec: Some(spec),
                    ..Default::default()
                }
            })
            .collect()
    }

    /// Keyfile secret for mongo internal auth. The value only matters at
    /// replica set bootstrap; once members run with it, rotating it
    /// would lock them out, hence create-if-absent semantics upstream.
    pub fn mongo_secret(&self) -> Secret {
        let mut keyfile = String::new();
        while keyfile.len() < 700 {
            keyfile.push_str(&Uuid::new_v4().simple().to_string());
        }
        keyfile.truncate(700);
        let value = BASE64.encode(keyfile.as_bytes());

        Secret {
            metadata: ObjectMeta {
                name: Some(MONGO_SECRET_NAME.to_string()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(BTreeMap::from([
                    ("creator".to_string(), "pipeline".to_string()),
                    ("deployment".to_string(), self.service.name.clone()),
                ])),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(MONGO_KEYFILE_KEY.to_string(), value)])),
            ..Default::default()
        }
    }

    /// StatefulSet running the mongo replica set.
    pub fn mongo_stateful_set(&self) -> Result<StatefulSet, OperatorError> {
        let port = *self
            .service
            .ports
            .first()
            .ok_or_else(|| self.manifest_error("database needs at least one port"))?;
        let volume = self
            .service
            .volumes
            .first()
            .ok_or_else(|| self.manifest_error("database needs a data volume"))?;

        let mut mounts = self.volume_mounts()?;
        mounts.push(VolumeMount {
            name: "secrets-volume".to_string(),
            mount_path: "/etc/secrets-volume".to_string(),
            read_only: Some(true),
            ..Default::default()
        });

        let engine = match &self.service.kind {
            envspec::ServiceKind::StatefulDatabase(db) => db.to_string(),
            _ => return Err(self.manifest_error("not a stateful database")),
        };

        let container = Container {
            name: engine.clone(),
            image: Some(format!("{engine}:{}", self.service.version)),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![
                "mongod".to_string(),
                "--replSet".to_string(),
                "mongo".to_string(),
                "--auth".to_string(),
                "--clusterAuthMode".to_string(),
                "keyFile".to_string(),
                "--keyFile".to_string(),
                format!("/etc/secrets-volume/{MONGO_KEYFILE_KEY}"),
                "--setParameter".to_string(),
                "authenticationMechanisms=SCRAM-SHA-1".to_string(),
            ]),
            ports: Some(vec![ContainerPort {
                container_port: port,
                ..Default::default()
            }]),
            volume_mounts: Some(mounts),
            resources: Some(self.resources()),
            ..Default::default()
        };

        let mut template_labels = self.workload_labels();
        template_labels.insert("role".to_string(), "mongo".to_string());

        let claim_template = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(volume.name.clone()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(BTreeMap::from([
                    ("creator".to_string(), "pipeline".to_string()),
                    ("deployment".to_string(), self.service.name.clone()),
                    ("mount_path".to_string(), volume.path.replace('/', "2F")),
                    ("size".to_string(), volume.size.clone()),
                ])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(
                    volume
                        .modes
                        .split(',')
                        .map(|m| m.trim().to_string())
                        .collect(),
                ),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(volume.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        Ok(StatefulSet {
            metadata: self.metadata(self.workload_labels()),
            spec: Some(StatefulSetSpec {
                service_name: Some(self.service.name.clone()),
                replicas: Some(self.service.replicas),
                selector: self.selector(),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(self.service.name.clone()),
                        labels: Some(template_labels),
                        annotations: annotations(&self.service.annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        termination_grace_period_seconds: Some(10),
                        containers: vec![container],
                        image_pull_secrets: self.image_pull_secrets(),
                        volumes: Some(vec![PodVolume {
                            name: "secrets-volume".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(MONGO_SECRET_NAME.to_string()),
                                default_mode: Some(0o400),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![claim_template]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Deployment for a stateless service. The image is only set when a
    /// version is configured; otherwise the update path keeps whatever
    /// image currently runs.
    pub fn deployment(&self) -> Result<Deployment, OperatorError> {
        let mut container = self.container()?;
        if !self.service.version.is_empty() {
            container.image = Some(
                self.config
                    .image(&self.service.application, &self.service.version),
            );
        }

        // The ssl flags live as labels on the Deployment; the state
        // aggregator reads them back from there
        let mut labels = self.workload_labels();
        for (key, value) in [
            ("ssl", &self.service.ssl),
            ("httpsOnly", &self.service.https_only),
            ("httpsBackend", &self.service.https_backend),
        ] {
            if !value.is_empty() {
                labels.insert(key.to_string(), value.clone());
            }
        }

        Ok(Deployment {
            metadata: self.metadata(labels),
            spec: Some(DeploymentSpec {
                replicas: Some(self.service.replicas),
                selector: self.selector(),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(self.service.name.clone()),
                        labels: Some(self.workload_labels()),
                        annotations: annotations(&self.service.annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        image_pull_secrets: self.image_pull_secrets(),
                        volumes: self.pod_volumes(),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Autoscaler targeting the service's Deployment.
    pub fn hpa(&self) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: self.metadata(self.workload_labels()),
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    kind: "Deployment".to_string(),
                    name: self.service.name.clone(),
                    api_version: Some("apps/v1".to_string()),
                },
                min_replicas: Some(self.service.hpa.min_replicas),
                max_replicas: self.service.hpa.max_replicas,
                target_cpu_utilization_percentage: Some(
                    self.service.hpa.target_cpu_utilization_percentage,
                ),
            }),
            ..Default::default()
        }
    }

    /// Ingress with one rule per external URL, all pointing at the
    /// service's primary port unless a backend override is declared.
    pub fn ingress(&self) -> Result<Ingress, OperatorError> {
        let primary_port = *self
            .service
            .ports
            .first()
            .ok_or_else(|| self.manifest_error("ingress needs at least one port"))?;

        let mut labels = self.labels();
        for (key, value) in [
            ("ssl", &self.service.ssl),
            ("httpsOnly", &self.service.https_only),
            ("httpsBackend", &self.service.https_backend),
        ] {
            if !value.is_empty() {
                labels.insert(key.to_string(), value.clone());
            }
        }

        let backend_name = if self.service.backend.is_empty() {
            self.service.name.clone()
        } else {
            self.service.backend.clone()
        };
        let backend_port = if self.service.backend_port == 0 {
            primary_port
        } else {
            self.service.backend_port
        };

        let rules = self
            .service
            .external_url
            .iter()
            .map(|url| IngressRule {
                host: Some(url.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: backend_name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(backend_port),
                                    name: None,
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            })
            .collect();

        Ok(Ingress {
            metadata: ObjectMeta {
                name: Some(self.service.name.clone()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(rules),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Custom resource for an externally-managed service.
    pub fn external_resource(&self) -> Result<DynamicObject, OperatorError> {
        let kind = self
            .service
            .kind
            .external_kind()
            .ok_or_else(|| self.manifest_error("not an externally-managed service"))?;
        let resource_type = ApiResource::from_gvk(&GroupVersionKind::gvk(
            EXTERNAL_GROUP,
            EXTERNAL_VERSION,
            &external_kind_name(kind),
        ));

        let spec = ExternalResourceSpec {
            version: self.service.version.clone(),
            options: self.service.options.clone(),
            replicas: 0,
        };

        let mut obj = DynamicObject::new(&self.service.name, &resource_type);
        obj.metadata.namespace = Some(self.namespace.to_string());
        obj.metadata.labels = Some(BTreeMap::from([
            ("creator".to_string(), "pipeline".to_string()),
            ("name".to_string(), self.service.name.clone()),
        ]));
        obj.data = serde_json::json!({ "spec": spec });
        Ok(obj)
    }

    fn container(&self) -> Result<Container, OperatorError> {
        Ok(Container {
            name: self.service.name.clone(),
            env: Some(self.env_vars()),
            volume_mounts: Some(self.volume_mounts()?),
            resources: Some(self.resources()),
            command: if self.service.commands.is_empty() {
                None
            } else {
                Some(self.service.commands.clone())
            },
            liveness_probe: self.liveness_probe(),
            ..Default::default()
        })
    }

    fn liveness_probe(&self) -> Option<Probe> {
        self.service.health_check.as_ref().map(|check| Probe {
            exec: Some(ExecAction {
                command: Some(check.command.clone()),
            }),
            initial_delay_seconds: (check.initial_delay != 0).then_some(check.initial_delay),
            timeout_seconds: (check.timeout != 0).then_some(check.timeout),
            ..Default::default()
        })
    }

    fn env_vars(&self) -> Vec<K8sEnvVar> {
        self.service
            .env_vars
            .iter()
            .map(|e| {
                if !e.secret.is_empty() {
                    // "secret-name/data-key", or a bare name doubling as
                    // its own key
                    let (secret_name, key) = match e.value.split_once('/') {
                        Some((name, key)) => (name.to_string(), key.to_string()),
                        None => (e.value.clone(), e.value.clone()),
                    };
                    K8sEnvVar {
                        name: e.secret.clone(),
                        value_from: Some(EnvVarSource {
                            secret_key_ref: Some(SecretKeySelector {
                                name: secret_name,
                                key,
                                optional: None,
                            }),
                            ..Default::default()
                        }),
                        value: None,
                    }
                } else if !e.pod_field.is_empty() {
                    K8sEnvVar {
                        name: e.name.clone(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: e.pod_field.clone(),
                                api_version: None,
                            }),
                            ..Default::default()
                        }),
                        value: None,
                    }
                } else {
                    K8sEnvVar {
                        name: e.name.clone(),
                        value: Some(e.value.clone()),
                        value_from: None,
                    }
                }
            })
            .collect()
    }

    fn volume_mounts(&self) -> Result<Vec<VolumeMount>, OperatorError> {
        self.service
            .volumes
            .iter()
            .map(|v| {
                if v.name.is_empty() || v.path.is_empty() {
                    return Err(self.manifest_error("volume must have both name and path set"));
                }
                Ok(VolumeMount {
                    name: v.name.clone(),
                    mount_path: v.path.clone(),
                    ..Default::default()
                })
            })
            .collect()
    }

    fn pod_volumes(&self) -> Option<Vec<PodVolume>> {
        if self.service.volumes.is_empty() {
            return None;
        }
        Some(
            self.service
                .volumes
                .iter()
                .map(|v| PodVolume {
                    name: v.name.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: v.name.clone(),
                        read_only: None,
                    }),
                    ..Default::default()
                })
                .collect(),
        )
    }

    fn image_pull_secrets(&self) -> Option<Vec<LocalObjectReference>> {
        if self.config.registry_secrets.is_empty() {
            return None;
        }
        Some(
            self.config
                .registry_secrets
                .split(',')
                .map(|name| LocalObjectReference {
                    name: name.trim().to_string(),
                })
                .collect(),
        )
    }

    fn resources(&self) -> ResourceRequirements {
        let mut requests = BTreeMap::new();
        if !self.service.requests.cpu.is_empty() {
            requests.insert("cpu".to_string(), Quantity(self.service.requests.cpu.clone()));
        }
        if !self.service.requests.memory.is_empty() {
            requests.insert(
                "memory".to_string(),
                Quantity(self.service.requests.memory.clone()),
            );
        }
        let mut limits = BTreeMap::new();
        if !self.service.limits.cpu.is_empty() {
            limits.insert("cpu".to_string(), Quantity(self.service.limits.cpu.clone()));
        }
        if !self.service.limits.memory.is_empty() {
            limits.insert(
                "memory".to_string(),
                Quantity(self.service.limits.memory.clone()),
            );
        }
        ResourceRequirements {
            requests: (!requests.is_empty()).then_some(requests),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        }
    }
}

fn annotations(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then(|| map.clone())
}

#[cfg(test)]
#[path = "mapper_test.rs"]
mod mapper_test;
