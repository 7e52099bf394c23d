use std::collections::BTreeMap;

use envspec::{DatabaseKind, ServiceKind};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    Container, EnvVar as K8sEnvVar, EnvVarSource, ExecAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretKeySelector, Service as CoreService, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

use super::{ServiceMap, unescape_mount_path};

fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

fn core_service(name: &str, ports: &[i32], labels: &[(&str, &str)]) -> CoreService {
    CoreService {
        metadata: meta(name, labels),
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|p| ServicePort {
                        port: *p,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment(name: &str, labels: &[(&str, &str)], container: Container) -> Deployment {
    Deployment {
        metadata: meta(name, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(3),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    annotations: Some(BTreeMap::from([(
                        "prometheus.io/scrape".to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            available_replicas: Some(2),
            replicas: Some(3),
            updated_replicas: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn service_fold_sets_ports_and_protection() {
    let mut map = ServiceMap::new();
    map.add_service(&core_service(
        "web",
        &[80, 8081],
        &[("application", "frontend"), ("delete-protected", "yes")],
    ));

    let services = map.services();
    assert_eq!(services.len(), 1);
    let web = &services[0];
    assert_eq!(web.name, "web");
    assert_eq!(web.ports, vec![80, 8081]);
    assert_eq!(web.application, "frontend");
    assert!(web.protected);
}

#[test]
fn delete_protection_marker_counts_regardless_of_value() {
    let mut map = ServiceMap::new();
    map.add_service(&core_service("legacy", &[80], &[("delete-protected", "yes")]));
    map.add_service(&core_service("newer", &[80], &[("delete-protected", "true")]));
    map.add_service(&core_service("plain", &[80], &[]));

    let services = map.services();
    assert!(services.iter().find(|s| s.name == "legacy").expect("legacy").protected);
    assert!(services.iter().find(|s| s.name == "newer").expect("newer").protected);
    assert!(!services.iter().find(|s| s.name == "plain").expect("plain").protected);
}

#[test]
fn placeholder_created_on_first_sighting_of_any_kind() {
    let mut map = ServiceMap::new();
    map.add_hpa(&HorizontalPodAutoscaler {
        metadata: meta("api", &[]),
        spec: Some(HorizontalPodAutoscalerSpec {
            min_replicas: Some(2),
            max_replicas: 6,
            target_cpu_utilization_percentage: Some(70),
            scale_target_ref: CrossVersionObjectReference::default(),
        }),
        ..Default::default()
    });

    let services = map.services();
    assert_eq!(services[0].name, "api");
    assert_eq!(services[0].replicas, 1);
    assert_eq!(services[0].hpa.min_replicas, 2);
    assert_eq!(services[0].hpa.max_replicas, 6);
}

#[test]
fn deployment_fold_reconstructs_env_vars() {
    let container = Container {
        name: "api".to_string(),
        env: Some(vec![
            K8sEnvVar {
                name: "LOG_LEVEL".to_string(),
                value: Some("debug".to_string()),
                value_from: None,
            },
            K8sEnvVar {
                name: "DB_PASSWORD".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: "db-credentials".to_string(),
                        key: "password".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            },
            K8sEnvVar {
                name: "API_TOKEN".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: "api-token".to_string(),
                        key: "api-token".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            },
            K8sEnvVar {
                name: "POD_NAME".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.name".to_string(),
                        api_version: None,
                    }),
                    ..Default::default()
                }),
            },
        ]),
        ..Default::default()
    };

    let mut map = ServiceMap::new();
    map.add_deployment(&deployment("api", &[("version", "1.2.0")], container));
    let services = map.services();
    let vars = &services[0].env_vars;

    assert_eq!(vars[0].name, "LOG_LEVEL");
    assert_eq!(vars[0].value, "debug");
    // Secret named differently from its key keeps the "name/key" spelling
    assert_eq!(vars[1].secret, "DB_PASSWORD");
    assert_eq!(vars[1].value, "db-credentials/password");
    // Secret named after its key collapses to the bare key
    assert_eq!(vars[2].value, "api-token");
    assert_eq!(vars[3].name, "POD_NAME");
    assert_eq!(vars[3].pod_field, "metadata.name");
}

#[test]
fn deployment_fold_sets_labels_resources_and_status() {
    let container = Container {
        name: "api".to_string(),
        liveness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec!["pgrep".to_string(), "api".to_string()]),
            }),
            initial_delay_seconds: Some(10),
            timeout_seconds: Some(5),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("500m".to_string())),
                ("memory".to_string(), Quantity("256Mi".to_string())),
            ])),
            limits: Some(BTreeMap::from([(
                "memory".to_string(),
                Quantity("512Mi".to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut map = ServiceMap::new();
    map.add_deployment(&deployment(
        "api",
        &[
            ("version", "1.2.0"),
            ("application", "backend"),
            ("ssl", "true"),
            ("httpsOnly", "true"),
        ],
        container,
    ));
    let services = map.services();
    let api = &services[0];

    assert_eq!(api.replicas, 3);
    assert_eq!(api.version, "1.2.0");
    assert_eq!(api.application, "backend");
    assert_eq!(api.ssl, "true");
    assert_eq!(api.https_only, "true");
    assert_eq!(api.https_backend, "");
    assert_eq!(api.requests.cpu, "500m");
    assert_eq!(api.requests.memory, "256Mi");
    assert_eq!(api.limits.memory, "512Mi");
    assert_eq!(api.limits.cpu, "");
    let check = api.health_check.as_ref().expect("health check");
    assert_eq!(check.command, ["pgrep", "api"]);
    assert_eq!(check.initial_delay, 10);
    assert_eq!(check.timeout, 5);
    assert_eq!(
        api.annotations.get("prometheus.io/scrape"),
        Some(&"true".to_string())
    );
    assert_eq!(api.status.available_replicas, 2);
    assert_eq!(api.status.desired_replicas, 3);
}

#[test]
fn stateful_set_fold_marks_database_kind() {
    let set = StatefulSet {
        metadata: meta("db", &[("version", "3.4")]),
        spec: Some(StatefulSetSpec {
            replicas: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut map = ServiceMap::new();
    map.add_mongo_stateful_set(&set);
    let services = map.services();
    assert_eq!(
        services[0].kind,
        ServiceKind::StatefulDatabase(DatabaseKind::Mongo)
    );
    assert_eq!(services[0].replicas, 3);
    assert_eq!(services[0].version, "3.4");
}

#[test]
fn volume_claims_attach_through_deployment_label() {
    let claim = PersistentVolumeClaim {
        metadata: meta(
            "db-data",
            &[
                ("deployment", "db"),
                ("mount_path", "2Fvar2Fdata"),
                ("size", "10Gi"),
            ],
        ),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut map = ServiceMap::new();
    map.add_volume_claim(&claim);
    let services = map.services();
    assert_eq!(services[0].name, "db");
    let vol = &services[0].volumes[0];
    assert_eq!(vol.name, "db-data");
    assert_eq!(vol.path, "/var/data");
    assert_eq!(vol.modes, "ReadWriteOnce");
    assert_eq!(vol.size, "10Gi");
}

#[test]
fn volume_claim_without_owner_label_is_ignored() {
    let claim = PersistentVolumeClaim {
        metadata: meta("stray", &[]),
        ..Default::default()
    };
    let mut map = ServiceMap::new();
    map.add_volume_claim(&claim);
    assert!(map.services().is_empty());
}

fn ingress(name: &str, hosts: &[&str], backend_name: &str, backend_port: i32) -> Ingress {
    let rules = hosts
        .iter()
        .map(|host| IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: backend_name.to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(backend_port),
                                name: None,
                            }),
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
            }),
        })
        .collect();
    Ingress {
        metadata: meta(name, &[]),
        spec: Some(IngressSpec {
            rules: Some(rules),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn ingress_fold_collects_hosts_without_backend_override() {
    let mut map = ServiceMap::new();
    map.add_service(&core_service("web", &[80], &[]));
    map.add_ingress(&ingress("web", &["web.example.com", "www.example.com"], "web", 80));
    let services = map.services();
    assert_eq!(services[0].external_url, ["web.example.com", "www.example.com"]);
    assert_eq!(services[0].backend, "");
    assert_eq!(services[0].backend_port, 0);
}

#[test]
fn ingress_fold_detects_backend_override() {
    let mut map = ServiceMap::new();
    map.add_service(&core_service("web", &[80], &[]));
    map.add_ingress(&ingress("web", &["web.example.com"], "web-canary", 8080));
    let services = map.services();
    assert_eq!(services[0].backend, "web-canary");
    assert_eq!(services[0].backend_port, 8080);
}

#[test]
fn external_resource_fold_parses_spec() {
    let resource_type =
        ApiResource::from_gvk(&GroupVersionKind::gvk("environments.microscaler.io", "v1", "Mysql"));
    let mut obj = DynamicObject::new("orders-db", &resource_type);
    obj.data = serde_json::json!({
        "spec": {
            "version": "8.0",
            "options": {"character_set": "utf8mb4"},
            "replicas": 2,
        }
    });

    let mut map = ServiceMap::new();
    map.add_external(&obj, "mysql");
    let services = map.services();
    assert_eq!(services[0].kind, ServiceKind::External("mysql".to_string()));
    assert_eq!(services[0].version, "8.0");
    assert_eq!(services[0].replicas, 2);
    assert_eq!(
        services[0].options.get("character_set"),
        Some(&"utf8mb4".to_string())
    );
}

#[test]
fn services_come_out_name_sorted() {
    let mut map = ServiceMap::new();
    map.add_service(&core_service("zeta", &[80], &[]));
    map.add_service(&core_service("alpha", &[80], &[]));
    map.add_service(&core_service("mid", &[80], &[]));
    let names: Vec<String> = map.services().into_iter().map(|s| s.name).collect();
    assert_eq!(names, ["alpha", "mid", "zeta"]);
}

#[test]
fn mount_path_unescaping() {
    assert_eq!(unescape_mount_path("2Fdata"), "/data");
    assert_eq!(unescape_mount_path("2F"), "/");
    assert_eq!(unescape_mount_path("plain"), "plain");
}
