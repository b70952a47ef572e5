//! The lifecycle of one load-balanced Service

use tokio_util::sync::CancellationToken;

use lbstack_common::Error;
use lbstack_deploy::memory::Operation;
use lbstack_deploy::CloudError;
use lbstack_model::{ResourceKind, ResourceRef};

use crate::helpers::*;

fn node(kind: ResourceKind, id: &str) -> ResourceRef {
    ResourceRef::new(kind, id)
}

/// Two backend ports become one load balancer, two target groups and two
/// listeners, and the load balancer's DNS name is available to the caller.
#[tokio::test]
async fn first_deploy_creates_five_resources() {
    let cloud = cloud();
    let stack = service_stack("web", &[80, 443]);
    assert_eq!(stack.resources_of(ResourceKind::ListenerRule).count(), 0);

    let report = deployer(&cloud)
        .deploy(&stack, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.created.len(), 5);
    assert_eq!(cloud.creates(), 5);
    assert_eq!(cloud.resources_of(ResourceKind::LoadBalancer).len(), 1);
    assert_eq!(cloud.resources_of(ResourceKind::TargetGroup).len(), 2);
    assert_eq!(cloud.resources_of(ResourceKind::Listener).len(), 2);

    let lb = cloud.resources_of(ResourceKind::LoadBalancer).remove(0);
    assert_eq!(
        report.dns_name(&node(ResourceKind::LoadBalancer, "LoadBalancer")),
        lb.dns_name.as_deref()
    );
}

/// Adding a port creates exactly its target group and listener.
#[tokio::test]
async fn added_port_creates_only_the_delta() {
    let cloud = cloud();
    let deployer = deployer(&cloud);
    deployer
        .deploy(&service_stack("web", &[80, 443]), &CancellationToken::new())
        .await
        .unwrap();

    let report = deployer
        .deploy(&service_stack("web", &[80, 443, 8443]), &CancellationToken::new())
        .await
        .unwrap();

    let mut created = report.created.clone();
    created.sort();
    assert_eq!(
        created,
        vec![
            node(ResourceKind::TargetGroup, "default/web:8443"),
            node(ResourceKind::Listener, "8443"),
        ]
    );
    assert!(report.updated.is_empty());
    assert!(report.deleted.is_empty());
    assert_eq!(report.unchanged.len(), 5);
}

/// Removing a port deletes its listener before its target group.
#[tokio::test]
async fn removed_port_deletes_listener_then_target_group() {
    let cloud = cloud();
    let deployer = deployer(&cloud);
    deployer
        .deploy(&service_stack("web", &[80, 443]), &CancellationToken::new())
        .await
        .unwrap();
    cloud.reset_counters();

    let report = deployer
        .deploy(&service_stack("web", &[80]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.deleted.len(), 2);
    let order: Vec<_> = cloud.journal().iter().map(|e| (e.operation, e.kind)).collect();
    assert_eq!(
        order,
        vec![
            (Operation::Delete, Some(ResourceKind::Listener)),
            (Operation::Delete, Some(ResourceKind::TargetGroup)),
        ]
    );
}

/// Teardown deletes all five resources, dependents first.
#[tokio::test]
async fn teardown_deletes_in_reverse_dependency_order() {
    let cloud = cloud();
    let deployer = deployer(&cloud);
    deployer
        .deploy(&service_stack("web", &[80, 443]), &CancellationToken::new())
        .await
        .unwrap();
    cloud.reset_counters();

    let report = deployer
        .deploy(&service_teardown("web"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.deleted.len(), 5);
    assert!(cloud.is_empty());
    let kinds: Vec<_> = cloud.journal().iter().filter_map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Listener,
            ResourceKind::Listener,
            ResourceKind::TargetGroup,
            ResourceKind::TargetGroup,
            ResourceKind::LoadBalancer,
        ]
    );
}

/// A teardown blocked by a failing delete leaves the rest for the next attempt.
#[tokio::test]
async fn failed_teardown_is_finished_by_the_next_one() {
    let cloud = cloud();
    let deployer = deployer(&cloud);
    deployer
        .deploy(&service_stack("web", &[80, 443]), &CancellationToken::new())
        .await
        .unwrap();

    cloud.inject_fault(
        Operation::Delete,
        Some(ResourceKind::TargetGroup),
        Some("default/web:443"),
        CloudError::AccessDenied("denied".into()),
        1,
    );
    assert!(deployer
        .deploy(&service_teardown("web"), &CancellationToken::new())
        .await
        .is_err());
    assert_eq!(cloud.resources_of(ResourceKind::LoadBalancer).len(), 1);
    assert!(cloud.resources_of(ResourceKind::Listener).is_empty());

    let report = deployer
        .deploy(&service_teardown("web"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.deleted.len(), 2);
    assert!(cloud.is_empty());
}

/// A target group that keeps throttling fails the deploy once its retries
/// run out; the next deploy creates only what is still missing.
#[tokio::test]
async fn exhausted_transient_failure_is_retried_by_next_deploy() {
    let cloud = cloud();
    let deployer = deployer(&cloud);
    let stack = service_stack("web", &[80, 443]);

    cloud.inject_fault(
        Operation::Create,
        Some(ResourceKind::TargetGroup),
        Some("default/web:443"),
        CloudError::Throttled("rate exceeded".into()),
        ATTEMPTS,
    );
    let err = deployer
        .deploy(&stack, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        Error::Deploy { failures, .. } => {
            assert!(failures.iter().any(|f| matches!(
                f,
                Error::Cloud { resource, retryable: true, .. }
                    if resource == "TargetGroup/default/web:443"
            )));
        }
        other => panic!("expected Deploy, got {:?}", other),
    }
    assert_eq!(cloud.creates(), 3);

    let report = deployer.deploy(&stack, &CancellationToken::new()).await.unwrap();
    let mut created = report.created.clone();
    created.sort();
    assert_eq!(
        created,
        vec![
            node(ResourceKind::TargetGroup, "default/web:443"),
            node(ResourceKind::Listener, "443"),
        ]
    );
    let mut unchanged = report.unchanged.clone();
    unchanged.sort();
    assert_eq!(
        unchanged,
        vec![
            node(ResourceKind::LoadBalancer, "LoadBalancer"),
            node(ResourceKind::TargetGroup, "default/web:80"),
            node(ResourceKind::Listener, "80"),
        ]
    );
}

/// A throttled call that recovers within its retry bound never surfaces.
#[tokio::test]
async fn short_throttling_is_absorbed_in_place() {
    let cloud = cloud();
    cloud.inject_fault(
        Operation::Create,
        Some(ResourceKind::LoadBalancer),
        None,
        CloudError::Throttled("rate exceeded".into()),
        ATTEMPTS - 1,
    );

    let report = deployer(&cloud)
        .deploy(&service_stack("web", &[80]), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.created.len(), 3);
}
