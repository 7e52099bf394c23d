use envspec::{Environment, Service, ServiceStatus};

use super::should_deploy;
use crate::diff::{ChangeSet, compare};

fn environment(services: Vec<Service>) -> Environment {
    Environment::new("dev".to_string(), "dev-ns".to_string(), services).expect("environment")
}

fn changed_set_for(desired_svc: Service, actual_svc: Service) -> (Environment, ChangeSet) {
    let mut desired = environment(vec![desired_svc]);
    let actual = environment(vec![actual_svc]);
    let changes = compare(&mut desired, &actual);
    (desired, changes)
}

#[test]
fn versioned_change_deploys() {
    let desired_svc = Service {
        version: "2".to_string(),
        ..Service::named("web")
    };
    let actual_svc = Service {
        version: "1".to_string(),
        status: ServiceStatus {
            deployed_at: "2026-08-01T00:00:00+00:00".to_string(),
            ..Default::default()
        },
        ..Service::named("web")
    };
    let (desired, changes) = changed_set_for(desired_svc, actual_svc);
    assert!(changes.changed("web"));
    assert!(should_deploy(&desired.services[0], &changes));
}

#[test]
fn unchanged_service_does_not_deploy() {
    let svc = Service {
        version: "1".to_string(),
        ..Service::named("web")
    };
    let (desired, changes) = changed_set_for(svc.clone(), svc);
    assert!(!should_deploy(&desired.services[0], &changes));
}

#[test]
fn deployed_service_with_inherited_version_still_deploys_on_drift() {
    // Desired has no version of its own; the deployed one is inherited
    // during alignment, and replica drift still triggers a deploy
    let desired_svc = Service {
        replicas: 4,
        ..Service::named("web")
    };
    let actual_svc = Service {
        version: "1".to_string(),
        replicas: 2,
        status: ServiceStatus {
            deployed_at: "2026-08-01T00:00:00+00:00".to_string(),
            ..Default::default()
        },
        ..Service::named("web")
    };
    let (desired, changes) = changed_set_for(desired_svc, actual_svc);
    assert!(changes.changed("web"));
    assert!(should_deploy(&desired.services[0], &changes));
    assert_eq!(desired.services[0].version, "1");
}

#[test]
fn undeployable_service_is_skipped_even_when_marked_changed() {
    let desired_svc = Service {
        version: "1".to_string(),
        ..Service::named("web")
    };
    let (_, changes) = changed_set_for(desired_svc, Service::named("web"));
    assert!(changes.changed("web"));

    // A service with neither a deploy timestamp nor a version never
    // passes the gate, whatever the change set says
    let bare = Service::named("web");
    assert!(!should_deploy(&bare, &changes));
}

#[test]
fn empty_change_set_gates_everything_off() {
    let svc = Service {
        version: "5".to_string(),
        status: ServiceStatus {
            deployed_at: "2026-08-01T00:00:00+00:00".to_string(),
            ..Default::default()
        },
        ..Service::named("web")
    };
    assert!(!should_deploy(&svc, &ChangeSet::default()));
}
