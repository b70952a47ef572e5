//! Resource nodes and the references between them
//!
//! Every node in a stack is a [`ResourceSpec`] addressed by a [`ResourceRef`]
//! (kind plus deterministic logical ID). A node that needs another node's
//! cloud-assigned identifier holds a [`Resolvable::Ref`], which the deployer
//! turns into a literal through the [`ReferenceTable`] once the dependency has
//! been realized.

use std::fmt;
use std::str::FromStr;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use lbstack_common::{Error, Result};

/// Infrastructure resource types, declared in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Security group fronting a load balancer
    SecurityGroup,
    /// The primary load-balancing resource
    LoadBalancer,
    /// Target group fed by a backend service port
    TargetGroup,
    /// Listener on a load balancer port
    Listener,
    /// Host/path rule on a listener
    ListenerRule,
    /// Binding of a target group to a backend service's endpoints
    TargetGroupBinding,
}

impl ResourceKind {
    /// Dependencies before dependents. Deletion walks this in reverse.
    pub const CREATION_ORDER: [ResourceKind; 6] = [
        ResourceKind::SecurityGroup,
        ResourceKind::LoadBalancer,
        ResourceKind::TargetGroup,
        ResourceKind::Listener,
        ResourceKind::ListenerRule,
        ResourceKind::TargetGroupBinding,
    ];

    /// Stable name used in logs, tags and JSON
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::SecurityGroup => "SecurityGroup",
            ResourceKind::LoadBalancer => "LoadBalancer",
            ResourceKind::TargetGroup => "TargetGroup",
            ResourceKind::Listener => "Listener",
            ResourceKind::ListenerRule => "ListenerRule",
            ResourceKind::TargetGroupBinding => "TargetGroupBinding",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a node within a stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource type
    pub kind: ResourceKind,
    /// Logical ID, deterministic from the node's position in the graph
    pub id: String,
}

impl ResourceRef {
    /// Create a reference
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A value that is either known at build time or produced by another node's deploy
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resolvable {
    /// Known identifier
    Literal(String),
    /// Cloud identifier of another node in the same stack
    Ref(ResourceRef),
}

impl Resolvable {
    /// The referenced node, if any
    pub fn reference(&self) -> Option<&ResourceRef> {
        match self {
            Resolvable::Literal(_) => None,
            Resolvable::Ref(r) => Some(r),
        }
    }

    /// Replace a reference with the realized identifier from `table`
    pub fn resolved(&self, table: &ReferenceTable) -> Result<Resolvable> {
        match self {
            Resolvable::Literal(v) => Ok(Resolvable::Literal(v.clone())),
            Resolvable::Ref(r) => Ok(Resolvable::Literal(table.resolve(r)?)),
        }
    }
}

impl From<ResourceRef> for Resolvable {
    fn from(r: ResourceRef) -> Self {
        Resolvable::Ref(r)
    }
}

/// Transport protocol of a listener or target group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Layer 4 TCP
    Tcp,
    /// Layer 4 UDP
    Udp,
    /// Layer 4 TLS termination
    Tls,
    /// Layer 7 HTTP
    Http,
    /// Layer 7 HTTPS
    Https,
}

impl Protocol {
    /// Parse a Kubernetes service port protocol
    pub fn from_service_protocol(protocol: Option<&str>) -> Option<Self> {
        match protocol.unwrap_or("TCP") {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            _ => None,
        }
    }

    /// Whether the listener terminates TLS and needs a certificate
    pub fn needs_certificate(&self) -> bool {
        matches!(self, Protocol::Tls | Protocol::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Tls => "TLS",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        };
        f.write_str(s)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "TLS" => Ok(Protocol::Tls),
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// How targets are registered with a target group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// Nodes, addressed through the service node port
    #[default]
    Instance,
    /// Pod IPs, addressed through the target port
    Ip,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Instance => f.write_str("instance"),
            TargetType::Ip => f.write_str("ip"),
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "instance" => Ok(TargetType::Instance),
            "ip" => Ok(TargetType::Ip),
            other => Err(format!("unknown target type '{other}' (expected instance or ip)")),
        }
    }
}

/// Load balancer reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    /// Reachable only inside the network
    #[default]
    Internal,
    /// Publicly reachable
    InternetFacing,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Internal => f.write_str("internal"),
            Scheme::InternetFacing => f.write_str("internet-facing"),
        }
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Scheme::Internal),
            "internet-facing" => Ok(Scheme::InternetFacing),
            other => Err(format!(
                "unknown scheme '{other}' (expected internal or internet-facing)"
            )),
        }
    }
}

/// Flavor of load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerType {
    /// Layer 4, fronting Services
    Network,
    /// Layer 7, fronting Ingresses
    Application,
}

/// One inbound permission on a security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPermission {
    /// IP protocol ("tcp", "udp")
    pub protocol: String,
    /// First port of the range
    pub from_port: u16,
    /// Last port of the range
    pub to_port: u16,
    /// Allowed source range
    pub cidr: String,
}

/// Managed security group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    /// Group name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Inbound permissions
    pub ingress: Vec<IngressPermission>,
}

/// The primary load-balancing resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    /// Load balancer name (at most 32 characters)
    pub name: String,
    /// Network or application
    #[serde(rename = "type")]
    pub lb_type: LoadBalancerType,
    /// Reachability
    pub scheme: Scheme,
    /// Subnets the load balancer is placed in
    pub subnets: Vec<String>,
    /// Attached security groups
    pub security_groups: Vec<Resolvable>,
}

/// Health check settings of a target group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Probe protocol
    pub protocol: Protocol,
    /// Probe path for HTTP(S) checks
    pub path: Option<String>,
    /// Probe port ("traffic-port" or a number)
    pub port: String,
}

/// Target group fed by one backend service port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupSpec {
    /// Target group name (at most 32 characters)
    pub name: String,
    /// Port targets receive traffic on
    pub port: u16,
    /// Target protocol
    pub protocol: Protocol,
    /// Target registration mode
    pub target_type: TargetType,
    /// Health check
    pub health_check: HealthCheck,
}

/// What a listener or rule does with a matching request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ListenerAction {
    /// Forward to a target group
    Forward {
        /// Destination target group
        target_group: Resolvable,
    },
    /// Answer directly without a backend
    FixedResponse {
        /// HTTP status code
        status_code: u16,
        /// Response content type
        content_type: String,
    },
}

impl ListenerAction {
    fn references(&self) -> Vec<&ResourceRef> {
        match self {
            ListenerAction::Forward { target_group } => {
                target_group.reference().into_iter().collect()
            }
            ListenerAction::FixedResponse { .. } => Vec::new(),
        }
    }

    fn resolved(&self, table: &ReferenceTable) -> Result<Self> {
        match self {
            ListenerAction::Forward { target_group } => Ok(ListenerAction::Forward {
                target_group: target_group.resolved(table)?,
            }),
            other => Ok(other.clone()),
        }
    }
}

/// Listener on one load balancer port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSpec {
    /// Owning load balancer
    pub load_balancer: Resolvable,
    /// Listen port
    pub port: u16,
    /// Listen protocol
    pub protocol: Protocol,
    /// Certificate for TLS/HTTPS listeners
    pub certificate_arn: Option<String>,
    /// Action when no rule matches
    pub default_action: ListenerAction,
}

/// Match condition of a listener rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "values", rename_all = "kebab-case")]
pub enum RuleCondition {
    /// Host header must match one of the values
    HostHeader(Vec<String>),
    /// Path must match one of the patterns
    PathPattern(Vec<String>),
}

/// Host/path rule on a listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRuleSpec {
    /// Owning listener
    pub listener: Resolvable,
    /// Evaluation priority, lower first
    pub priority: u32,
    /// All conditions must match
    pub conditions: Vec<RuleCondition>,
    /// Action on match
    pub action: ListenerAction,
}

/// Binding that keeps a target group's registrations in sync with a Service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupBindingSpec {
    /// Bound target group
    pub target_group: Resolvable,
    /// Backend service namespace
    pub service_namespace: String,
    /// Backend service name
    pub service_name: String,
    /// Backend service port
    pub service_port: u16,
    /// Target registration mode
    pub target_type: TargetType,
}

/// Desired attributes of one resource node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResourceSpec {
    /// Managed security group
    SecurityGroup(SecurityGroupSpec),
    /// Load balancer
    LoadBalancer(LoadBalancerSpec),
    /// Target group
    TargetGroup(TargetGroupSpec),
    /// Listener
    Listener(ListenerSpec),
    /// Listener rule
    ListenerRule(ListenerRuleSpec),
    /// Target group binding
    TargetGroupBinding(TargetGroupBindingSpec),
}

impl ResourceSpec {
    /// Resource type of this node
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::SecurityGroup(_) => ResourceKind::SecurityGroup,
            ResourceSpec::LoadBalancer(_) => ResourceKind::LoadBalancer,
            ResourceSpec::TargetGroup(_) => ResourceKind::TargetGroup,
            ResourceSpec::Listener(_) => ResourceKind::Listener,
            ResourceSpec::ListenerRule(_) => ResourceKind::ListenerRule,
            ResourceSpec::TargetGroupBinding(_) => ResourceKind::TargetGroupBinding,
        }
    }

    /// Every node this one points at
    pub fn references(&self) -> Vec<&ResourceRef> {
        match self {
            ResourceSpec::SecurityGroup(_) | ResourceSpec::TargetGroup(_) => Vec::new(),
            ResourceSpec::LoadBalancer(lb) => lb
                .security_groups
                .iter()
                .filter_map(Resolvable::reference)
                .collect(),
            ResourceSpec::Listener(l) => {
                let mut refs: Vec<&ResourceRef> = l.load_balancer.reference().into_iter().collect();
                refs.extend(l.default_action.references());
                refs
            }
            ResourceSpec::ListenerRule(r) => {
                let mut refs: Vec<&ResourceRef> = r.listener.reference().into_iter().collect();
                refs.extend(r.action.references());
                refs
            }
            ResourceSpec::TargetGroupBinding(b) => b.target_group.reference().into_iter().collect(),
        }
    }

    /// Copy of this spec with every reference replaced by its realized identifier
    pub fn resolve(&self, table: &ReferenceTable) -> Result<ResourceSpec> {
        Ok(match self {
            ResourceSpec::SecurityGroup(_) | ResourceSpec::TargetGroup(_) => self.clone(),
            ResourceSpec::LoadBalancer(lb) => ResourceSpec::LoadBalancer(LoadBalancerSpec {
                security_groups: lb
                    .security_groups
                    .iter()
                    .map(|sg| sg.resolved(table))
                    .collect::<Result<_>>()?,
                ..lb.clone()
            }),
            ResourceSpec::Listener(l) => ResourceSpec::Listener(ListenerSpec {
                load_balancer: l.load_balancer.resolved(table)?,
                default_action: l.default_action.resolved(table)?,
                ..l.clone()
            }),
            ResourceSpec::ListenerRule(r) => ResourceSpec::ListenerRule(ListenerRuleSpec {
                listener: r.listener.resolved(table)?,
                action: r.action.resolved(table)?,
                ..r.clone()
            }),
            ResourceSpec::TargetGroupBinding(b) => {
                ResourceSpec::TargetGroupBinding(TargetGroupBindingSpec {
                    target_group: b.target_group.resolved(table)?,
                    ..b.clone()
                })
            }
        })
    }

    /// Attribute document sent to and compared against the infrastructure API
    pub fn to_attributes(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Attributes assigned by the infrastructure once a node exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realized {
    /// Cloud-assigned identifier
    pub cloud_id: String,
    /// DNS name, for load balancers
    pub dns_name: Option<String>,
}

/// Single-assignment cells holding each node's realized attributes
///
/// A producer step publishes exactly once per deploy cycle; any number of
/// consumer steps read afterwards. Reading an unpublished cell is an
/// [`Error::UnresolvedReference`].
#[derive(Debug, Default)]
pub struct ReferenceTable {
    cells: DashMap<ResourceRef, Realized>,
}

impl ReferenceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the realized attributes of `reference`.
    ///
    /// Fails if the reference was already published in this cycle.
    pub fn publish(&self, reference: ResourceRef, realized: Realized) -> Result<()> {
        match self.cells.entry(reference) {
            Entry::Occupied(e) => Err(Error::internal_with_context(
                "reference_table",
                format!("{} published twice", e.key()),
            )),
            Entry::Vacant(e) => {
                e.insert(realized);
                Ok(())
            }
        }
    }

    /// Cloud identifier of a published node
    pub fn resolve(&self, reference: &ResourceRef) -> Result<String> {
        self.cells
            .get(reference)
            .map(|r| r.cloud_id.clone())
            .ok_or_else(|| Error::unresolved(reference.to_string()))
    }

    /// Full realized record of a published node
    pub fn get(&self, reference: &ResourceRef) -> Option<Realized> {
        self.cells.get(reference).map(|r| r.value().clone())
    }

    /// Number of published nodes
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether nothing has been published
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
