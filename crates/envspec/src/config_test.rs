//! Configuration parsing tests.

use crate::service::{DatabaseKind, ServiceKind};
use crate::ConfigFile;

fn parse(yaml: &str) -> ConfigFile {
    serde_yaml::from_str(yaml).expect("valid config")
}

fn parse_err(yaml: &str) -> String {
    serde_yaml::from_str::<ConfigFile>(yaml)
        .expect_err("invalid config")
        .to_string()
}

#[test]
fn full_document_parses() {
    let config = parse(
        r#"
project: pidgeon
environments:
  - name: dev
    namespace: pidgeon-dev
    deployment:
      method: rolling-upgrade
    services:
      - name: api
        application: pidgeon-api
        version: "1.2.0"
        port: 8080
        replicas: 2
        requests:
          cpu: 500m
          memory: 256Mi
        limits:
          cpu: "1"
          memory: 512Mi
        env:
          - name: MODE
            value: production
          - secret: DB_PASSWORD
            value: pidgeon-secrets/db-password
        health_check:
          command: ["/bin/check"]
          initial_delay: 10
          timeout: 5
        external_url: api.example.com
      - name: worker
        ports: "8080,9090"
"#,
    );
    assert_eq!(config.project, "pidgeon");
    assert_eq!(config.environments.len(), 1);

    let env = &config.environments[0];
    assert_eq!(env.namespace, "pidgeon-dev");
    let api = env.find_service("api").expect("api service");
    assert_eq!(api.ports, [8080]);
    assert_eq!(api.replicas, 2);
    assert_eq!(api.requests.cpu, "500m");
    assert_eq!(api.env_vars[1].secret, "DB_PASSWORD");
    assert_eq!(api.external_url, ["api.example.com"]);
    assert_eq!(
        api.health_check.as_ref().expect("probe").command,
        ["/bin/check"]
    );

    let worker = env.find_service("worker").expect("worker service");
    assert_eq!(worker.ports, [8080, 9090]);
    assert_eq!(worker.replicas, 1);
}

#[test]
fn ports_default_to_80() {
    let config = parse(
        "environments:\n  - name: dev\n    services:\n      - name: web\n",
    );
    assert_eq!(config.environments[0].services[0].ports, [80]);
}

#[test]
fn out_of_range_port_rejected() {
    let err = parse_err(
        "environments:\n  - name: dev\n    services:\n      - name: web\n        port: 5000000000\n",
    );
    assert!(err.contains("65535"), "unexpected error: {err}");

    let err = parse_err(
        "environments:\n  - name: dev\n    services:\n      - name: web\n        ports: \"80,0\"\n",
    );
    assert!(err.contains("65535"), "unexpected error: {err}");
}

#[test]
fn external_url_accepts_list() {
    let config = parse(
        r#"
environments:
  - name: dev
    services:
      - name: web
        external_url:
          - a.example.com
          - b.example.com
"#,
    );
    assert_eq!(
        config.environments[0].services[0].external_url,
        ["a.example.com", "b.example.com"]
    );
}

#[test]
fn annotations_fold_into_map() {
    let config = parse(
        r#"
environments:
  - name: dev
    services:
      - name: web
        annotations:
          - name: owner
            value: team-a
          - name: tier
            value: frontend
"#,
    );
    let svc = &config.environments[0].services[0];
    assert_eq!(svc.annotations.get("owner").map(String::as_str), Some("team-a"));
    assert_eq!(svc.annotations.get("tier").map(String::as_str), Some("frontend"));
}

#[test]
fn external_type_suppresses_ports() {
    let config = parse(
        r#"
environments:
  - name: dev
    services:
      - name: db
        type: MySQL
        version: "5.7"
        options:
          instance_class: db.t2.medium
"#,
    );
    let svc = &config.environments[0].services[0];
    assert_eq!(svc.kind, ServiceKind::External("mysql".to_string()));
    assert!(svc.ports.is_empty());
    assert_eq!(
        svc.options.get("instance_class").map(String::as_str),
        Some("db.t2.medium")
    );
}

#[test]
fn mongo_database_type_selects_stateful_kind() {
    let config = parse(
        r#"
environments:
  - name: dev
    services:
      - name: mongo
        database_type: mongo
        version: "3.4"
        volumes:
          - name: mongo-data
            path: /data/db
            size: 10Gi
"#,
    );
    let svc = &config.environments[0].services[0];
    assert_eq!(svc.kind, ServiceKind::StatefulDatabase(DatabaseKind::Mongo));
    assert_eq!(svc.volumes[0].modes, "ReadWriteOnce");
    assert_eq!(svc.volumes[0].provisioning, "dynamic");
}

#[test]
fn hpa_minimum_owns_replica_count() {
    let config = parse(
        r#"
environments:
  - name: dev
    services:
      - name: web
        replicas: 2
        hpa:
          min_replicas: 3
          max_replicas: 6
          target_cpu_utilization_percentage: 70
"#,
    );
    assert_eq!(config.environments[0].services[0].replicas, 3);
}

#[test]
fn services_sorted_within_environment() {
    let config = parse(
        "environments:\n  - name: dev\n    services:\n      - name: zeta\n      - name: alpha\n",
    );
    let names: Vec<&str> = config.environments[0]
        .services
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, ["alpha", "zeta"]);
}

#[test]
fn invalid_ssl_flag_rejected() {
    let err = parse_err(
        "environments:\n  - name: dev\n    services:\n      - name: web\n        ssl: maybe\n",
    );
    assert!(err.contains("ssl"), "unexpected error: {err}");
}

#[test]
fn unsupported_database_type_rejected() {
    let err = parse_err(
        "environments:\n  - name: dev\n    services:\n      - name: db\n        database_type: oracle\n",
    );
    assert!(err.contains("database_type"), "unexpected error: {err}");
}

#[test]
fn duplicate_service_names_rejected() {
    let err = parse_err(
        "environments:\n  - name: dev\n    services:\n      - name: web\n      - name: web\n",
    );
    assert!(err.contains("duplicate"), "unexpected error: {err}");
}

#[test]
fn invalid_volume_provisioning_rejected() {
    let err = parse_err(
        r#"
environments:
  - name: dev
    services:
      - name: web
        volumes:
          - name: data
            path: /data
            provisioning: psychic
"#,
    );
    assert!(err.contains("provisioning"), "unexpected error: {err}");
}

#[test]
fn missing_environment_reported_with_path() {
    let dir = std::env::temp_dir().join("envspec-config-test");
    std::fs::create_dir_all(&dir).expect("tempdir");
    let path = dir.join("environments.yaml");
    std::fs::write(&path, "environments:\n  - name: dev\n    services: []\n").expect("write");

    let err = crate::load_environment(&path, "prod").expect_err("missing environment");
    assert!(err.to_string().contains("prod"), "unexpected error: {err}");

    let env = crate::load_environment(&path, "dev").expect("dev environment");
    assert!(env.services.is_empty());
}
