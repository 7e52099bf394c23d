//! Structural diffing of desired against actual state.
//!
//! [`compare`] aligns every desired service against its actual
//! counterpart (cluster-owned fields are copied forward so they never
//! register as drift), then renders a structural diff per service. The
//! result is an explicit [`ChangeSet`] value handed to the reconciler,
//! so each cycle starts from a fresh set and nothing accumulates across
//! iterations.

use std::collections::BTreeMap;
use std::fmt;

use envspec::{Environment, Service, quantity};
use serde_yaml::Value;
use tracing::debug;

/// Per-cycle record of which services drifted and how.
#[derive(Debug, Default)]
pub struct ChangeSet {
    changes: BTreeMap<String, String>,
}

impl ChangeSet {
    /// True when no service drifted this cycle.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The gate the reconciler consults before mutating a service's
    /// resources.
    pub fn changed(&self, name: &str) -> bool {
        if let Some(diff) = self.changes.get(name) {
            debug!(service = name, %diff, "service has pending changes");
            return true;
        }
        false
    }

    /// Rendered diff for one service, if it drifted.
    pub fn diff_for(&self, name: &str) -> Option<&str> {
        self.changes.get(name).map(String::as_str)
    }

    fn record(&mut self, name: &str, diff: String) {
        self.changes.insert(name.to_string(), diff);
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, diff) in &self.changes {
            writeln!(f, "{name}:")?;
            for line in diff.lines() {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}

/// Mutates `desired` in place to be diff-comparable with `actual`,
/// copying forward every field the cluster owns.
pub fn align(desired: &mut Service, actual: &Service) {
    // A service not yet versioned in config inherits the deployed
    // version rather than appearing to regress
    if desired.version.is_empty() {
        desired.version = actual.version.clone();
    }
    if desired.application.is_empty() && !actual.application.is_empty() {
        desired.application = actual.application.clone();
    }
    // Status is never authored
    desired.status = actual.status.clone();

    // Externally-managed resources never surface limits, so a desired
    // value there is not a real signal
    if desired.kind.external_kind().is_some() {
        desired.limits = actual.limits.clone();
    }

    align_quantity(&mut desired.requests.cpu, &actual.requests.cpu);
    align_quantity(&mut desired.requests.memory, &actual.requests.memory);
    align_quantity(&mut desired.limits.cpu, &actual.limits.cpu);
    align_quantity(&mut desired.limits.memory, &actual.limits.memory);

    // Replica count is owned by the autoscaler once one is active
    if actual.hpa.min_replicas != 0 {
        desired.replicas = actual.replicas;
    }

    // Probe timings left at zero get server defaults; the cluster's
    // values are authoritative for them
    if let (Some(desired_check), Some(actual_check)) =
        (desired.health_check.as_mut(), actual.health_check.as_ref())
    {
        if desired_check.timeout == 0 {
            desired_check.timeout = actual_check.timeout;
        }
        if desired_check.initial_delay == 0 {
            desired_check.initial_delay = actual_check.initial_delay;
        }
    }

    if actual.version.is_empty() {
        // Annotations have no meaning before a workload exists
        desired.annotations.clear();
    } else {
        for (key, value) in &actual.annotations {
            desired
                .annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

fn align_quantity(desired: &mut String, actual: &str) {
    if desired != actual && quantity::equal(desired, actual) {
        actual.clone_into(desired);
    }
}

/// Aligns every desired service in place and returns the set of
/// services whose serialized form still differs from the cluster's.
///
/// A pair is only compared when at least one side carries a version;
/// services that were never versioned and never deployed are treated as
/// not yet relevant. Environment name, tests and the deployment block
/// are excluded from serialization, so they can never register here.
pub fn compare(desired: &mut Environment, actual: &Environment) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for service in &mut desired.services {
        let counterpart = actual.find_service(&service.name);
        if let Some(counterpart) = counterpart {
            align(service, counterpart);
        }

        let actual_version = counterpart.map(|c| c.version.as_str()).unwrap_or_default();
        if service.version.is_empty() && actual_version.is_empty() {
            continue;
        }

        let rendered = match counterpart {
            Some(counterpart) => render_diff(service, counterpart),
            None => render_diff(service, &Service::named(&service.name)),
        };
        if let Some(diff) = rendered {
            changes.record(&service.name, diff);
        }
    }

    changes
}

fn render_diff(desired: &Service, actual: &Service) -> Option<String> {
    let desired_value = serde_yaml::to_value(desired).unwrap_or(Value::Null);
    let actual_value = serde_yaml::to_value(actual).unwrap_or(Value::Null);
    if desired_value == actual_value {
        return None;
    }
    let mut lines = Vec::new();
    diff_value("", &actual_value, &desired_value, &mut lines);
    Some(lines.join("\n"))
}

/// Walks two serialized values in parallel, emitting one
/// `path: actual => desired` line per differing leaf.
fn diff_value(path: &str, actual: &Value, desired: &Value, out: &mut Vec<String>) {
    match (actual, desired) {
        (Value::Mapping(a), Value::Mapping(d)) => {
            let mut keys: Vec<&Value> = a.keys().chain(d.keys()).collect();
            keys.sort_by_key(|k| k.as_str().unwrap_or_default());
            keys.dedup();
            for key in keys {
                let name = key.as_str().unwrap_or_default();
                let child = join_path(path, name);
                diff_value(
                    &child,
                    a.get(key).unwrap_or(&Value::Null),
                    d.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (Value::Sequence(a), Value::Sequence(d)) => {
            for i in 0..a.len().max(d.len()) {
                let child = format!("{path}[{i}]");
                diff_value(
                    &child,
                    a.get(i).unwrap_or(&Value::Null),
                    d.get(i).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        _ if actual != desired => {
            out.push(format!("{path}: {} => {}", scalar(actual), scalar(desired)));
        }
        _ => {}
    }
}

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "<none>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

#[cfg(test)]
#[path = "diff_test.rs"]
mod diff_test;
