//! Service model.
//!
//! A [`Service`] describes one deployable unit of an environment. Desired
//! services are parsed from the configuration file; actual services are
//! folded together from cluster objects by the state aggregator. The
//! serialized form deliberately skips zero values so the structural diff
//! only ever sees fields that carry a real signal.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Workload shape of a service, decided once when the service is
/// constructed. The reconciler dispatches on this closed set instead of
/// re-deriving behavior from string fields at each call site.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Regular stateless microservice: Deployment + ClusterIP Service
    #[default]
    Plain,
    /// Stateful database run in-cluster: StatefulSet + headless Service
    StatefulDatabase(DatabaseKind),
    /// Externally-managed resource represented by a custom resource;
    /// carries the lower-cased resource kind (e.g. "mysql")
    External(String),
}

impl ServiceKind {
    /// True for the default stateless shape.
    pub fn is_plain(&self) -> bool {
        matches!(self, ServiceKind::Plain)
    }

    /// Lower-cased custom resource kind for externally-managed services.
    pub fn external_kind(&self) -> Option<&str> {
        match self {
            ServiceKind::External(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Database engines supported on the stateful-set code path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    /// MongoDB replica set
    Mongo,
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::Mongo => write!(f, "mongo"),
        }
    }
}

/// Horizontal pod autoscaler bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hpa {
    /// Lower replica bound; zero means autoscaling is not desired
    #[serde(default)]
    pub min_replicas: i32,
    /// Upper replica bound
    #[serde(default)]
    pub max_replicas: i32,
    /// CPU utilization target in percent
    #[serde(default)]
    pub target_cpu_utilization_percentage: i32,
}

impl Hpa {
    /// True when no autoscaling is configured.
    pub fn is_disabled(&self) -> bool {
        *self == Hpa::default()
    }
}

/// Requested container resources as unit-suffixed quantity strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Requests {
    /// CPU request, e.g. "500m"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu: String,
    /// Memory request, e.g. "512Mi"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
}

impl Requests {
    /// True when neither quantity is set.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty()
    }
}

/// Container resource limits as unit-suffixed quantity strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Limits {
    /// CPU limit
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpu: String,
    /// Memory limit
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory: String,
}

impl Limits {
    /// True when neither quantity is set.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty()
    }
}

/// Exec-based liveness probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe command line
    #[serde(default)]
    pub command: Vec<String>,
    /// Seconds before the first probe
    #[serde(default)]
    pub initial_delay: i32,
    /// Probe timeout in seconds
    #[serde(default)]
    pub timeout: i32,
}

/// Environment variable: a literal value, a reference into a secret, or a
/// reference to a pod metadata field. Exactly one source is expected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name (unused for secret-backed variables, where `secret`
    /// carries the name)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Literal value, or `secret-name/data-key` for secret-backed vars
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Name the variable is exposed under when backed by a secret
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    /// Pod metadata field path, e.g. "metadata.name"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_field: String,
}

/// Persistent volume attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Volume {
    /// Claim name
    #[serde(default)]
    pub name: String,
    /// Mount path inside the container
    #[serde(default)]
    pub path: String,
    /// Comma-joined access modes, e.g. "ReadWriteOnce"
    #[serde(default)]
    pub modes: String,
    /// Requested size, e.g. "10Gi"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
    /// "dynamic" or "manual"; authoring detail only, so excluded from
    /// serialization and thereby from the diff
    #[serde(default, skip_serializing)]
    pub provisioning: String,
}

impl Volume {
    /// True when the volume expects a pre-provisioned persistent volume.
    pub fn has_manual_provisioning(&self) -> bool {
        self.provisioning == "manual"
    }
}

/// Cluster-sourced deployment status. Never authored in configuration and
/// excluded from serialization so it cannot register in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceStatus {
    /// Creation timestamp of the workload, empty if never deployed
    pub deployed_at: String,
    /// Replicas passing readiness
    pub available_replicas: i32,
    /// Replicas the workload wants
    pub desired_replicas: i32,
    /// Replicas at the current template revision
    pub current_replicas: i32,
}

/// A single service and its configuration within an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawService")]
pub struct Service {
    /// Service name; the join key across all resource kinds
    pub name: String,
    /// Exposed ports
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<i32>,
    /// Deployed application version; empty until first deploy
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Image name component
    #[serde(skip_serializing_if = "String::is_empty")]
    pub application: String,
    /// Desired replica count
    pub replicas: i32,
    /// Workload shape
    #[serde(skip_serializing_if = "ServiceKind::is_plain")]
    pub kind: ServiceKind,
    /// Autoscaler bounds
    #[serde(skip_serializing_if = "Hpa::is_disabled")]
    pub hpa: Hpa,
    /// Resource requests
    #[serde(skip_serializing_if = "Requests::is_empty")]
    pub requests: Requests,
    /// Resource limits
    #[serde(skip_serializing_if = "Limits::is_empty")]
    pub limits: Limits,
    /// Liveness probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    /// Environment variables
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<EnvVar>,
    /// Container entrypoint override
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Pod template annotations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Persistent volumes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Free-form options for externally-managed resources
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    /// External hostnames served through an ingress
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_url: Vec<String>,
    /// Ingress backend service override
    #[serde(skip_serializing_if = "String::is_empty")]
    pub backend: String,
    /// Ingress backend port override
    #[serde(skip_serializing_if = "is_zero")]
    pub backend_port: i32,
    /// "true"/"false" ssl label passthrough
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ssl: String,
    /// "true"/"false" httpsOnly label passthrough
    #[serde(rename = "httpsOnly", skip_serializing_if = "String::is_empty")]
    pub https_only: String,
    /// "true"/"false" httpsBackend label passthrough
    #[serde(rename = "httpsBackend", skip_serializing_if = "String::is_empty")]
    pub https_backend: String,
    /// Cluster-sourced status, never diffed
    #[serde(skip)]
    pub status: ServiceStatus,
    /// Delete-protection marker carried on the cluster Service object
    #[serde(skip)]
    pub protected: bool,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl Default for Service {
    fn default() -> Self {
        Service {
            name: String::new(),
            ports: Vec::new(),
            version: String::new(),
            application: String::new(),
            replicas: 1,
            kind: ServiceKind::default(),
            hpa: Hpa::default(),
            requests: Requests::default(),
            limits: Limits::default(),
            health_check: None,
            env_vars: Vec::new(),
            commands: Vec::new(),
            annotations: BTreeMap::new(),
            volumes: Vec::new(),
            options: BTreeMap::new(),
            external_url: Vec::new(),
            backend: String::new(),
            backend_port: 0,
            ssl: String::new(),
            https_only: String::new(),
            https_backend: String::new(),
            status: ServiceStatus::default(),
            protected: false,
        }
    }
}

impl Service {
    /// Returns a placeholder service with the given name and defaults
    /// matching what the aggregator assumes before any workload is seen.
    pub fn named(name: &str) -> Self {
        Service {
            name: name.to_string(),
            ..Service::default()
        }
    }

    /// True when at least one external hostname is declared.
    pub fn has_external_url(&self) -> bool {
        !self.external_url.is_empty()
    }
}

/// Raw YAML shape of a service entry. Ports, annotations and external
/// URLs accept several spellings in the configuration format, so parsing
/// goes through this intermediate before validation.
#[derive(Debug, Deserialize)]
struct RawService {
    name: String,
    #[serde(default)]
    port: Option<PortSpec>,
    #[serde(default)]
    ports: Option<PortSpec>,
    #[serde(default)]
    external_url: Option<OneOrMany>,
    #[serde(default)]
    ssl: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    application: Option<String>,
    #[serde(default)]
    replicas: Option<i32>,
    #[serde(default)]
    hpa: Option<Hpa>,
    #[serde(default)]
    requests: Option<Requests>,
    #[serde(default)]
    limits: Option<Limits>,
    #[serde(default)]
    health_check: Option<HealthCheck>,
    #[serde(default)]
    env: Vec<EnvVar>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    annotations: Vec<RawAnnotation>,
    #[serde(default)]
    volumes: Vec<Volume>,
    #[serde(default)]
    options: BTreeMap<String, String>,
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    backend_port: Option<i32>,
    #[serde(default, rename = "httpsOnly")]
    https_only: Option<String>,
    #[serde(default, rename = "httpsBackend")]
    https_backend: Option<String>,
    #[serde(default, rename = "type")]
    service_type: Option<String>,
    #[serde(default)]
    database_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Number(i64),
    List(String),
}

impl PortSpec {
    fn to_ports(&self) -> Result<Vec<i32>, String> {
        match self {
            PortSpec::Number(n) => Ok(vec![valid_port(*n)?]),
            PortSpec::List(s) => s
                .split(',')
                .filter_map(|p| p.trim().parse::<i64>().ok())
                .map(valid_port)
                .collect(),
        }
    }
}

fn valid_port(n: i64) -> Result<i32, String> {
    i32::try_from(n)
        .ok()
        .filter(|p| (1..=65_535).contains(p))
        .ok_or_else(|| format!("service.ports: {n} is outside 1-65535"))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    name: String,
    value: String,
}

fn validate_flag(field: &str, value: &str) -> Result<(), String> {
    match value {
        "" | "true" | "false" => Ok(()),
        other => Err(format!("service.{field}: expected true or false, got {other:?}")),
    }
}

impl TryFrom<RawService> for Service {
    type Error = String;

    fn try_from(raw: RawService) -> Result<Self, Self::Error> {
        if raw.name.is_empty() {
            return Err("service.name: must not be empty".to_string());
        }

        let ssl = raw.ssl.unwrap_or_default();
        let https_only = raw.https_only.unwrap_or_default();
        let https_backend = raw.https_backend.unwrap_or_default();
        validate_flag("ssl", &ssl)?;
        validate_flag("httpsOnly", &https_only)?;
        validate_flag("httpsBackend", &https_backend)?;

        let service_type = raw.service_type.unwrap_or_default();
        let database_type = raw.database_type.unwrap_or_default();
        let kind = if !service_type.is_empty() {
            ServiceKind::External(service_type.to_lowercase())
        } else {
            match database_type.as_str() {
                "" => ServiceKind::Plain,
                "mongo" => ServiceKind::StatefulDatabase(DatabaseKind::Mongo),
                other => {
                    return Err(format!("service.database_type: unsupported value {other:?}"));
                }
            }
        };

        // Externally-managed resources carry no ports of their own
        let ports = if kind.external_kind().is_some() {
            Vec::new()
        } else {
            match raw.ports.or(raw.port) {
                Some(p) => p.to_ports()?,
                None => vec![80],
            }
        };

        for vol in &raw.volumes {
            if !vol.provisioning.is_empty() && !matches!(vol.provisioning.as_str(), "dynamic" | "manual") {
                return Err(format!(
                    "service.volumes.provisioning: expected dynamic or manual, got {:?}",
                    vol.provisioning
                ));
            }
        }
        let volumes = raw
            .volumes
            .into_iter()
            .map(|mut vol| {
                if vol.modes.is_empty() {
                    vol.modes = "ReadWriteOnce".to_string();
                }
                if vol.provisioning.is_empty() {
                    vol.provisioning = "dynamic".to_string();
                }
                vol
            })
            .collect();

        let hpa = raw.hpa.unwrap_or_default();
        // Once autoscaling is configured, the minimum owns the static count
        let replicas = if hpa.min_replicas != 0 {
            hpa.min_replicas
        } else {
            raw.replicas.unwrap_or(1)
        };

        let external_url = match raw.external_url {
            None => Vec::new(),
            Some(OneOrMany::One(url)) => vec![url],
            Some(OneOrMany::Many(urls)) => urls,
        };

        let annotations = raw
            .annotations
            .into_iter()
            .map(|a| (a.name, a.value))
            .collect();

        Ok(Service {
            name: raw.name,
            ports,
            version: raw.version.unwrap_or_default(),
            application: raw.application.unwrap_or_default(),
            replicas,
            kind,
            hpa,
            requests: raw.requests.unwrap_or_default(),
            limits: raw.limits.unwrap_or_default(),
            health_check: raw.health_check,
            env_vars: raw.env,
            commands: raw.command,
            annotations,
            volumes,
            options: raw.options,
            external_url,
            backend: raw.backend.unwrap_or_default(),
            backend_port: raw.backend_port.unwrap_or(0),
            ssl,
            https_only,
            https_backend,
            status: ServiceStatus::default(),
            protected: false,
        })
    }
}
