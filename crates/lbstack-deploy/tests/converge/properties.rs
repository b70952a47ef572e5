//! Guarantees every deploy keeps

use std::collections::BTreeSet;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use lbstack_deploy::memory::Operation;
use lbstack_deploy::shared::owner_of;
use lbstack_deploy::{CloudError, InMemoryCloud};
use lbstack_model::ResourceKind;

use crate::helpers::*;

// =============================================================================
// Idempotence
// =============================================================================

/// Deploying a stack that already converged makes no mutating call.
#[tokio::test]
async fn second_deploy_makes_no_mutating_calls() {
    let cloud = cloud();
    let deployer = deployer(&cloud);
    let stack = service_stack("web", &[80, 443]);

    deployer.deploy(&stack, &CancellationToken::new()).await.unwrap();
    cloud.reset_counters();

    let report = deployer.deploy(&stack, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.mutations(), 0);
    assert_eq!(report.unchanged.len(), 5);
    assert_eq!(cloud.mutations(), 0);
}

/// The same holds for ingress stacks that contribute shared rules.
#[tokio::test]
async fn shared_rules_are_idempotent_too() {
    let cloud = cloud();
    let deployer = deployer_with_shared(&cloud);
    let stack = ingress_stack("shop", "shop", 31080);

    deployer.deploy(&stack, &CancellationToken::new()).await.unwrap();
    assert_eq!(cloud.rules_of(SHARED_GROUP).len(), 1);
    cloud.reset_counters();

    deployer.deploy(&stack, &CancellationToken::new()).await.unwrap();
    assert_eq!(cloud.mutations(), 0);
}

// =============================================================================
// Resumability
// =============================================================================

/// Whichever resource's creation fails first, the next deploy finishes the job
/// without creating anything twice and ends in the uninterrupted terminal state.
#[tokio::test]
async fn interrupted_deploy_resumes_to_same_terminal_state() {
    let stack = service_stack("web", &[80, 443]);

    let reference = cloud();
    deployer(&reference)
        .deploy(&stack, &CancellationToken::new())
        .await
        .unwrap();
    let expected = logical_inventory(&reference.snapshot());

    for node in stack.sequence().creation_order() {
        let cloud = cloud();
        let deployer = deployer(&cloud);
        cloud.inject_fault(
            Operation::Create,
            Some(node.kind),
            Some(&node.id),
            CloudError::AccessDenied("denied".into()),
            1,
        );

        assert!(
            deployer.deploy(&stack, &CancellationToken::new()).await.is_err(),
            "deploy with {} failing should fail",
            node
        );
        assert!(cloud.len() < stack.len());

        deployer.deploy(&stack, &CancellationToken::new()).await.unwrap();
        assert_eq!(logical_inventory(&cloud.snapshot()), expected, "resumed after {}", node);
        assert_eq!(cloud.creates() as usize, stack.len(), "nothing created twice after {}", node);
        assert_eq!(cloud.deletes(), 0);
    }
}

// =============================================================================
// Deletion completeness and isolation
// =============================================================================

/// Tearing down one stack removes exactly its resources, even when another
/// kind of object shares its namespace and name.
#[tokio::test]
async fn teardown_removes_only_the_owning_stack() {
    let cloud = cloud();
    let deployer = deployer_with_shared(&cloud);

    deployer
        .deploy(&service_stack("web", &[80, 443]), &CancellationToken::new())
        .await
        .unwrap();
    let untouched_stacks = [service_stack("api", &[8080]), ingress_stack("web", "web", 30080)];
    for stack in &untouched_stacks {
        deployer.deploy(stack, &CancellationToken::new()).await.unwrap();
    }
    let web_ids: BTreeSet<String> = cloud
        .snapshot()
        .into_iter()
        .filter(|r| {
            r.tags.get("service.lbstack.io/stack").map(String::as_str) == Some("prod/default/web")
        })
        .map(|r| r.cloud_id)
        .collect();
    assert_eq!(web_ids.len(), 5);
    let before: Vec<_> = cloud
        .snapshot()
        .into_iter()
        .filter(|r| !web_ids.contains(&r.cloud_id))
        .collect();
    let rules_before = cloud.rules_of(SHARED_GROUP);

    let report = deployer
        .deploy(&service_teardown("web"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.deleted.len(), 5);
    assert_eq!(cloud.snapshot(), before);
    assert_eq!(cloud.rules_of(SHARED_GROUP), rules_before);
}

/// A teardown of something that never existed is a no-op.
#[tokio::test]
async fn teardown_of_unknown_stack_is_a_no_op() {
    let cloud = cloud();
    let report = deployer(&cloud)
        .deploy(&service_teardown("ghost"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.mutations(), 0);
    assert_eq!(cloud.mutations(), 0);
}

// =============================================================================
// Dependency ordering
// =============================================================================

/// Every node is created after all of its dependencies, and deleted before them.
#[tokio::test]
async fn creates_follow_and_deletes_precede_dependencies() {
    let cloud = cloud();
    let deployer = deployer_with_shared(&cloud);

    for stack in [service_stack("web", &[80, 443, 8443]), ingress_stack("shop", "shop", 31080)] {
        cloud.reset_counters();
        deployer.deploy(&stack, &CancellationToken::new()).await.unwrap();
        let created = journal_positions(&cloud.journal(), Operation::Create);
        assert_eq!(created.len(), stack.len());

        for (node, _) in stack.resources() {
            for dep in stack.dependencies_of(node) {
                assert!(created[dep] < created[node], "{} created before {}", dep, node);
            }
        }

        cloud.reset_counters();
        let teardown = match stack.tag_prefix() {
            lbstack_common::SERVICE_TAG_PREFIX => service_teardown(&stack.id().name),
            _ => ingress_teardown(&stack.id().name),
        };
        deployer.deploy(&teardown, &CancellationToken::new()).await.unwrap();
        let deleted = journal_positions(&cloud.journal(), Operation::Delete);
        assert_eq!(deleted.len(), stack.len());

        for (node, _) in stack.resources() {
            for dep in stack.dependencies_of(node) {
                assert!(deleted[node] < deleted[dep], "{} deleted before {}", node, dep);
            }
        }
    }
    assert!(cloud.is_empty());
}

// =============================================================================
// Shared rule convergence
// =============================================================================

fn owners(cloud: &InMemoryCloud) -> BTreeSet<String> {
    cloud
        .rules_of(SHARED_GROUP)
        .iter()
        .filter_map(|r| owner_of(r).map(str::to_string))
        .collect()
}

/// Concurrent deploys never lose each other's shared rule contributions, and
/// concurrent teardowns remove exactly the departing stacks' rules.
#[tokio::test]
async fn concurrent_shared_rule_writes_converge_to_the_union() {
    let cloud = std::sync::Arc::new(
        InMemoryCloud::new().with_latency(std::time::Duration::from_millis(1)),
    );
    let deployer = deployer_with_shared(&cloud);

    let stacks: Vec<_> = (0..8u16)
        .map(|i| ingress_stack(&format!("shop-{i}"), &format!("backend-{i}"), 31000 + i))
        .collect();
    let cancel = CancellationToken::new();

    let results = join_all(stacks.iter().map(|s| deployer.deploy(s, &cancel))).await;
    assert!(results.iter().all(Result::is_ok));

    let all: BTreeSet<String> = stacks.iter().map(|s| s.owner_key()).collect();
    assert_eq!(owners(&cloud), all);
    assert_eq!(cloud.rules_of(SHARED_GROUP).len(), stacks.len());

    let departing: Vec<_> = (0..3).map(|i| ingress_teardown(&format!("shop-{i}"))).collect();
    let results = join_all(departing.iter().map(|s| deployer.deploy(s, &cancel))).await;
    assert!(results.iter().all(Result::is_ok));

    let remaining: BTreeSet<String> = stacks[3..].iter().map(|s| s.owner_key()).collect();
    assert_eq!(owners(&cloud), remaining);
    assert_eq!(cloud.resources_of(ResourceKind::LoadBalancer).len(), 5);
}
