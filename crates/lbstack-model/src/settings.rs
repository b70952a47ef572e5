//! Typed inputs to the stack builder
//!
//! Nothing here is parsed from annotations: callers hand the builder
//! already-resolved settings, subnets and backend ports.

use std::collections::BTreeMap;

use crate::intent::BackendRef;
use crate::resource::{Protocol, Scheme, TargetType};

/// A port the load balancer listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenPort {
    /// Port number
    pub port: u16,
    /// Listener protocol
    pub protocol: Protocol,
}

/// Per-object load balancer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerSettings {
    /// Internal or internet-facing
    pub scheme: Scheme,
    /// Target registration mode
    pub target_type: TargetType,
    /// Ingress listen ports
    pub listen_ports: Vec<ListenPort>,
    /// Certificate for HTTPS listeners
    pub certificate_arn: Option<String>,
    /// Explicit security groups; when empty, ingress stacks manage their own
    pub security_groups: Vec<String>,
    /// Health check path for HTTP target groups
    pub health_check_path: String,
    /// Source ranges admitted by a managed security group
    pub inbound_cidrs: Vec<String>,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            scheme: Scheme::Internal,
            target_type: TargetType::Instance,
            listen_ports: vec![ListenPort {
                port: 80,
                protocol: Protocol::Http,
            }],
            certificate_arn: None,
            security_groups: Vec::new(),
            health_check_path: "/".to_string(),
            inbound_cidrs: vec!["0.0.0.0/0".to_string()],
        }
    }
}

/// Ports of a backend service port, as seen by the load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBackend {
    /// Service port
    pub port: u16,
    /// Numeric container port, if the service declares one
    pub target_port: Option<u16>,
    /// Node port, if the service has one
    pub node_port: Option<u16>,
}

/// Externally resolved inputs to a build
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildEnvironment {
    /// Subnets available for load balancer placement
    pub subnets: Vec<String>,
    /// Every backend the object references, resolved to concrete ports
    pub backends: BTreeMap<BackendRef, ResolvedBackend>,
    /// Cluster-wide security group that admits load balancer traffic to nodes
    pub shared_backend_security_group: Option<String>,
    /// Per-object settings
    pub settings: LoadBalancerSettings,
}
