//! Intent objects: the Services and Ingresses the controller acts on
//!
//! [`IntentObject`] is a closed set over the two watched kinds. Everything
//! kind-specific (tag prefix, finalizer, status shape, translation into a
//! [`DesiredState`]) is an exhaustive match on it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use lbstack_common::kube_utils::has_finalizer;
use lbstack_common::{
    Error, Result, INGRESS_CLASS_ANNOTATION, INGRESS_FINALIZER, INGRESS_TAG_PREFIX,
    SERVICE_FINALIZER, SERVICE_TAG_PREFIX,
};

use crate::resource::Protocol;
use crate::settings::ResolvedBackend;
use crate::stack::StackId;

/// The watched object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// core/v1 Service of type LoadBalancer
    Service,
    /// networking.k8s.io/v1 Ingress
    Ingress,
}

impl ObjectKind {
    /// Ownership tag prefix
    pub fn tag_prefix(&self) -> &'static str {
        match self {
            ObjectKind::Service => SERVICE_TAG_PREFIX,
            ObjectKind::Ingress => INGRESS_TAG_PREFIX,
        }
    }

    /// Finalizer token
    pub fn finalizer(&self) -> &'static str {
        match self {
            ObjectKind::Service => SERVICE_FINALIZER,
            ObjectKind::Ingress => INGRESS_FINALIZER,
        }
    }

    /// Kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Service => "Service",
            ObjectKind::Ingress => "Ingress",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port of a backend service, by number or by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendPort {
    /// Service port number
    Number(u16),
    /// Service port name
    Name(String),
}

impl fmt::Display for BackendPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPort::Number(n) => write!(f, "{n}"),
            BackendPort::Name(n) => f.write_str(n),
        }
    }
}

/// A service port traffic is routed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendRef {
    /// Service namespace
    pub namespace: String,
    /// Service name
    pub service: String,
    /// Service port
    pub port: BackendPort,
}

impl BackendRef {
    /// `namespace/name` of the backend service
    pub fn service_key(&self) -> String {
        format!("{}/{}", self.namespace, self.service)
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.service, self.port)
    }
}

/// How a rule's path is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    /// The path exactly
    Exact,
    /// The path and everything below it
    Prefix,
    /// The path used verbatim as a pattern
    Pattern,
}

/// One host/path routing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Host header to match
    pub host: Option<String>,
    /// Path to match
    pub path: Option<String>,
    /// Path semantics
    pub path_match: PathMatch,
    /// Destination
    pub backend: BackendRef,
}

/// One port of a load-balanced Service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortIntent {
    /// Port name
    pub name: Option<String>,
    /// Listen port
    pub port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// The service port itself, as a backend
    pub backend: BackendRef,
}

/// What the object asks the load balancer to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frontend {
    /// Layer 4: one listener per service port
    Network {
        /// Declared ports
        ports: Vec<ServicePortIntent>,
    },
    /// Layer 7: host/path routing on the configured listen ports
    Application {
        /// Backend for requests no rule matches
        default_backend: Option<BackendRef>,
        /// Rules in declaration order
        rules: Vec<RouteRule>,
    },
}

/// Normalized, kind-independent view of an intent object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    /// Owning object kind
    pub kind: ObjectKind,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Requested routing
    pub frontend: Frontend,
}

impl DesiredState {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Every backend referenced, deduplicated
    pub fn backends(&self) -> BTreeSet<&BackendRef> {
        match &self.frontend {
            Frontend::Network { ports } => ports.iter().map(|p| &p.backend).collect(),
            Frontend::Application {
                default_backend,
                rules,
            } => default_backend
                .iter()
                .chain(rules.iter().map(|r| &r.backend))
                .collect(),
        }
    }
}

/// A watched object, tagged by kind
#[derive(Debug, Clone)]
pub enum IntentObject {
    /// A Service
    Service(Arc<Service>),
    /// An Ingress
    Ingress(Arc<Ingress>),
}

impl IntentObject {
    /// Object kind
    pub fn kind(&self) -> ObjectKind {
        match self {
            IntentObject::Service(_) => ObjectKind::Service,
            IntentObject::Ingress(_) => ObjectKind::Ingress,
        }
    }

    fn meta(&self) -> &kube::api::ObjectMeta {
        match self {
            IntentObject::Service(svc) => svc.meta(),
            IntentObject::Ingress(ing) => ing.meta(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            IntentObject::Service(svc) => svc.name_any(),
            IntentObject::Ingress(ing) => ing.name_any(),
        }
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// Whether the owning system has marked the object for deletion
    pub fn deletion_requested(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Finalizer token for this kind
    pub fn finalizer(&self) -> &'static str {
        self.kind().finalizer()
    }

    /// Whether the finalizer is present
    pub fn has_finalizer(&self) -> bool {
        match self {
            IntentObject::Service(svc) => has_finalizer(svc.as_ref(), SERVICE_FINALIZER),
            IntentObject::Ingress(ing) => has_finalizer(ing.as_ref(), INGRESS_FINALIZER),
        }
    }

    /// Stack ID under `cluster`
    pub fn stack_id(&self, cluster: &str) -> StackId {
        StackId::new(cluster, self.namespace(), self.name())
    }

    /// Reference used when publishing events
    pub fn object_ref(&self) -> ObjectReference {
        match self {
            IntentObject::Service(svc) => svc.object_ref(&()),
            IntentObject::Ingress(ing) => ing.object_ref(&()),
        }
    }

    /// `(hostname, ip)` pairs currently in the object's status
    pub fn status_endpoints(&self) -> Vec<(Option<String>, Option<String>)> {
        match self {
            IntentObject::Service(svc) => svc
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .map(|ingress| {
                    ingress
                        .iter()
                        .map(|i| (i.hostname.clone(), i.ip.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            IntentObject::Ingress(ing) => ing
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .map(|ingress| {
                    ingress
                        .iter()
                        .map(|i| (i.hostname.clone(), i.ip.clone()))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Whether the status already reports exactly `hostname` and nothing else
    pub fn status_matches(&self, hostname: &str) -> bool {
        matches!(
            self.status_endpoints().as_slice(),
            [(Some(h), None)] if h == hostname
        )
    }

    /// Translate the object into its normalized desired state
    pub fn desired_state(&self) -> Result<DesiredState> {
        let frontend = match self {
            IntentObject::Service(svc) => service_frontend(svc, &self.key())?,
            IntentObject::Ingress(ing) => ingress_frontend(ing, &self.key())?,
        };
        Ok(DesiredState {
            kind: self.kind(),
            namespace: self.namespace(),
            name: self.name(),
            frontend,
        })
    }

    /// Backends a Service resolves from its own spec; empty for Ingresses
    pub fn local_backends(&self) -> BTreeMap<BackendRef, ResolvedBackend> {
        let IntentObject::Service(svc) = self else {
            return BTreeMap::new();
        };
        let ports = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .cloned()
            .unwrap_or_default();
        ports
            .iter()
            .filter_map(|p| {
                let port = u16::try_from(p.port).ok()?;
                let backend = BackendRef {
                    namespace: self.namespace(),
                    service: self.name(),
                    port: BackendPort::Number(port),
                };
                Some((backend, resolve_backend_port(svc, &BackendPort::Number(port))?))
            })
            .collect()
    }
}

/// Resolve one port of `service` to the ports the load balancer targets
pub fn resolve_backend_port(service: &Service, port: &BackendPort) -> Option<ResolvedBackend> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;
    let sp = ports.iter().find(|p| match port {
        BackendPort::Number(n) => p.port == i32::from(*n),
        BackendPort::Name(name) => p.name.as_deref() == Some(name.as_str()),
    })?;

    let target_port = match &sp.target_port {
        Some(IntOrString::Int(n)) => u16::try_from(*n).ok(),
        Some(IntOrString::String(_)) => None,
        // Unset targetPort defaults to the service port
        None => u16::try_from(sp.port).ok(),
    };
    Some(ResolvedBackend {
        port: u16::try_from(sp.port).ok()?,
        target_port,
        node_port: sp.node_port.and_then(|n| u16::try_from(n).ok()),
    })
}

fn service_frontend(svc: &Service, key: &str) -> Result<Frontend> {
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            Error::validation_for_field(key, "spec.ports", "service declares no ports")
        })?;

    ports
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let field = format!("spec.ports[{i}]");
            let port = u16::try_from(p.port).map_err(|_| {
                Error::validation_for_field(key, &field, format!("port {} out of range", p.port))
            })?;
            let protocol = Protocol::from_service_protocol(p.protocol.as_deref()).ok_or_else(|| {
                Error::validation_for_field(
                    key,
                    format!("{field}.protocol"),
                    format!(
                        "protocol {} is not supported by network load balancers",
                        p.protocol.as_deref().unwrap_or_default()
                    ),
                )
            })?;
            Ok(ServicePortIntent {
                name: p.name.clone(),
                port,
                protocol,
                backend: BackendRef {
                    namespace: namespace.clone(),
                    service: name.clone(),
                    port: BackendPort::Number(port),
                },
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(|ports| Frontend::Network { ports })
}

fn ingress_frontend(ing: &Ingress, key: &str) -> Result<Frontend> {
    let namespace = ing.namespace().unwrap_or_default();
    let spec = ing.spec.clone().unwrap_or_default();

    let default_backend = spec
        .default_backend
        .as_ref()
        .map(|b| backend_ref(b, &namespace, key, "spec.defaultBackend"))
        .transpose()?;

    let mut rules = Vec::new();
    for (i, rule) in spec.rules.iter().flatten().enumerate() {
        let Some(http) = &rule.http else {
            continue;
        };
        for (j, path) in http.paths.iter().enumerate() {
            let field = format!("spec.rules[{i}].http.paths[{j}]");
            let path_match = match path.path_type.as_str() {
                "Exact" => PathMatch::Exact,
                "Prefix" => PathMatch::Prefix,
                _ => PathMatch::Pattern,
            };
            rules.push(RouteRule {
                host: rule.host.clone(),
                path: path.path.clone(),
                path_match,
                backend: backend_ref(&path.backend, &namespace, key, &format!("{field}.backend"))?,
            });
        }
    }

    Ok(Frontend::Application {
        default_backend,
        rules,
    })
}

fn backend_ref(
    backend: &IngressBackend,
    namespace: &str,
    key: &str,
    field: &str,
) -> Result<BackendRef> {
    let service = backend.service.as_ref().ok_or_else(|| {
        Error::validation_for_field(key, field, "only service backends are supported")
    })?;
    let port = service.port.as_ref().ok_or_else(|| {
        Error::validation_for_field(
            key,
            format!("{field}.service.port"),
            "backend port is required",
        )
    })?;
    let port = match (&port.number, &port.name) {
        (Some(n), _) => BackendPort::Number(u16::try_from(*n).map_err(|_| {
            Error::validation_for_field(
                key,
                format!("{field}.service.port"),
                format!("port {n} out of range"),
            )
        })?),
        (None, Some(name)) => BackendPort::Name(name.clone()),
        (None, None) => {
            return Err(Error::validation_for_field(
                key,
                format!("{field}.service.port"),
                "backend port needs a number or a name",
            ))
        }
    };
    Ok(BackendRef {
        namespace: namespace.to_string(),
        service: service.name.clone(),
        port,
    })
}

/// Decides whether an object belongs to this controller
///
/// Pure function of the configured classes and the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMatcher {
    ingress_class: String,
    load_balancer_class: String,
}

impl ClassMatcher {
    /// Matcher for the given ingress class and Service `loadBalancerClass`
    pub fn new(ingress_class: impl Into<String>, load_balancer_class: impl Into<String>) -> Self {
        Self {
            ingress_class: ingress_class.into(),
            load_balancer_class: load_balancer_class.into(),
        }
    }

    /// Whether this controller should provision infrastructure for `object`
    pub fn matches(&self, object: &IntentObject) -> bool {
        match object {
            IntentObject::Service(svc) => {
                let Some(spec) = svc.spec.as_ref() else {
                    return false;
                };
                spec.type_.as_deref() == Some("LoadBalancer")
                    && spec
                        .load_balancer_class
                        .as_deref()
                        .map_or(true, |c| c == self.load_balancer_class)
            }
            IntentObject::Ingress(ing) => {
                let class = ing
                    .spec
                    .as_ref()
                    .and_then(|s| s.ingress_class_name.as_deref())
                    .or_else(|| {
                        ing.metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
                            .map(String::as_str)
                    });
                class == Some(self.ingress_class.as_str())
            }
        }
    }
}
