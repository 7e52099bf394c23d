//! Environment model.

use serde::{Deserialize, Serialize};

use crate::service::Service;

/// Deployment-strategy settings. Carried through from configuration but
/// excluded from diffing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeploymentSettings {
    /// "bluegreen" or "rolling-upgrade"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// "manual" or "auto"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    /// Active color for bluegreen deployments
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active: String,
}

/// Test definition. Parsed for configuration compatibility only; the
/// operator itself never runs tests and the diff engine ignores them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Test {
    /// Test name
    #[serde(default)]
    pub name: String,
    /// Source repository for the test suite
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    /// Branch to run against
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
}

/// A full managed environment: either the desired state parsed from
/// configuration or the actual state reconstructed from the cluster.
///
/// Services are kept sorted by name; deterministic ordering is a
/// correctness requirement for the structural diff, not cosmetic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawEnvironment")]
pub struct Environment {
    /// Logical environment name
    pub name: String,
    /// Kubernetes namespace backing the environment
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Deployment-strategy block; never diffed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentSettings>,
    /// Services sorted by name
    pub services: Vec<Service>,
    /// Test definitions; never diffed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<Test>,
}

impl Environment {
    /// Builds an environment, sorting services and enforcing name
    /// uniqueness.
    pub fn new(
        name: String,
        namespace: String,
        mut services: Vec<Service>,
    ) -> Result<Self, String> {
        services.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in services.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(format!("duplicate service name {:?}", pair[0].name));
            }
        }
        Ok(Environment {
            name,
            namespace,
            deployment: None,
            services,
            tests: Vec::new(),
        })
    }

    /// Returns the service with the given name, if declared.
    pub fn find_service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvironment {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    deployment: Option<DeploymentSettings>,
    #[serde(default)]
    services: Vec<Service>,
    #[serde(default)]
    tests: Vec<Test>,
}

impl TryFrom<RawEnvironment> for Environment {
    type Error = String;

    fn try_from(raw: RawEnvironment) -> Result<Self, Self::Error> {
        if raw.name.is_empty() {
            return Err("environment.name: must not be empty".to_string());
        }
        if !raw
            .namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("environment.namespace: invalid value {:?}", raw.namespace));
        }
        let mut env = Environment::new(raw.name, raw.namespace, raw.services)
            .map_err(|e| format!("environment.{e}"))?;
        env.deployment = raw.deployment;
        env.tests = raw.tests;
        Ok(env)
    }
}
