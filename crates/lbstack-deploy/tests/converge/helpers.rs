//! Fixtures shared by the convergence tests

use std::collections::BTreeMap;
use std::sync::Arc;

use lbstack_common::retry::RetryConfig;
use lbstack_common::{INGRESS_TAG_PREFIX, SERVICE_TAG_PREFIX};
use lbstack_deploy::memory::{JournalEntry, Operation};
use lbstack_deploy::{InMemoryCloud, LiveResource, SharedSecurityGroupReconciler, StackDeployer};
use lbstack_model::intent::ServicePortIntent;
use lbstack_model::resource::Protocol;
use lbstack_model::{
    BackendPort, BackendRef, BuildEnvironment, DesiredState, Frontend, LoadBalancerSettings,
    ObjectKind, ResolvedBackend, ResourceKind, ResourceRef, Stack, StackBuilder, StackId,
};

/// Cluster every test stack belongs to
pub const CLUSTER: &str = "prod";

/// Namespace every test object lives in
pub const NAMESPACE: &str = "default";

/// Shared backend security group used by ingress tests
pub const SHARED_GROUP: &str = "sg-shared";

/// Attempts per converge step; small so exhausted retries stay fast
pub const ATTEMPTS: u32 = 3;

pub fn cloud() -> Arc<InMemoryCloud> {
    Arc::new(InMemoryCloud::new())
}

pub fn deployer(cloud: &Arc<InMemoryCloud>) -> StackDeployer {
    StackDeployer::new(cloud.clone()).with_retry(RetryConfig::immediate(ATTEMPTS))
}

pub fn deployer_with_shared(cloud: &Arc<InMemoryCloud>) -> StackDeployer {
    let shared = SharedSecurityGroupReconciler::new(
        cloud.clone(),
        SHARED_GROUP,
        RetryConfig::immediate(ATTEMPTS),
    );
    deployer(cloud).with_shared_security_group(Arc::new(shared))
}

fn backend(service: &str, port: u16) -> BackendRef {
    BackendRef {
        namespace: NAMESPACE.to_string(),
        service: service.to_string(),
        port: BackendPort::Number(port),
    }
}

fn resolved(port: u16, node_port: u16) -> ResolvedBackend {
    ResolvedBackend {
        port,
        target_port: Some(8080),
        node_port: Some(node_port),
    }
}

/// A LoadBalancer Service named `name` exposing `ports`
pub fn service_stack(name: &str, ports: &[u16]) -> Stack {
    let desired = DesiredState {
        kind: ObjectKind::Service,
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
        frontend: Frontend::Network {
            ports: ports
                .iter()
                .map(|&port| ServicePortIntent {
                    name: None,
                    port,
                    protocol: Protocol::Tcp,
                    backend: backend(name, port),
                })
                .collect(),
        },
    };
    let env = BuildEnvironment {
        subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
        backends: ports
            .iter()
            .map(|&port| (backend(name, port), resolved(port, 30000 + port)))
            .collect(),
        shared_backend_security_group: None,
        settings: LoadBalancerSettings::default(),
    };
    StackBuilder::new(CLUSTER)
        .build(&desired, &env)
        .map(|(stack, _)| stack)
        .expect("service stack builds")
}

/// An Ingress named `name` routing everything to service `backend_service:80`
///
/// Its backend listens on node port `node_port`, which becomes the port of its
/// shared security group rule.
pub fn ingress_stack(name: &str, backend_service: &str, node_port: u16) -> Stack {
    let default_backend = backend(backend_service, 80);
    let desired = DesiredState {
        kind: ObjectKind::Ingress,
        namespace: NAMESPACE.to_string(),
        name: name.to_string(),
        frontend: Frontend::Application {
            default_backend: Some(default_backend.clone()),
            rules: Vec::new(),
        },
    };
    let env = BuildEnvironment {
        subnets: vec!["subnet-a".to_string()],
        backends: BTreeMap::from([(default_backend, resolved(80, node_port))]),
        shared_backend_security_group: Some(SHARED_GROUP.to_string()),
        settings: LoadBalancerSettings::default(),
    };
    StackBuilder::new(CLUSTER)
        .build(&desired, &env)
        .map(|(stack, _)| stack)
        .expect("ingress stack builds")
}

pub fn service_teardown(name: &str) -> Stack {
    StackBuilder::new(CLUSTER)
        .build_teardown(StackId::new(CLUSTER, NAMESPACE, name), SERVICE_TAG_PREFIX)
}

pub fn ingress_teardown(name: &str) -> Stack {
    StackBuilder::new(CLUSTER)
        .build_teardown(StackId::new(CLUSTER, NAMESPACE, name), INGRESS_TAG_PREFIX)
}

/// `(kind, logical ID)` of every live resource, for comparing terminal states
pub fn logical_inventory(resources: &[LiveResource]) -> Vec<(ResourceKind, String)> {
    let mut inventory: Vec<(ResourceKind, String)> = resources
        .iter()
        .map(|r| {
            let id = r
                .tags
                .iter()
                .find(|(k, _)| k.ends_with("/resource"))
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            (r.kind, id)
        })
        .collect();
    inventory.sort();
    inventory
}

/// Position of each node in the journal entries of one operation
pub fn journal_positions(
    journal: &[JournalEntry],
    operation: Operation,
) -> BTreeMap<ResourceRef, usize> {
    journal
        .iter()
        .filter(|e| e.operation == operation)
        .enumerate()
        .filter_map(|(i, e)| Some((ResourceRef::new(e.kind?, e.logical_id.clone()?), i)))
        .collect()
}
