//! Stack builder: desired state + environment → stack
//!
//! Building is pure. It never touches the network, so two builds from the
//! same input produce identical stacks. Input that cannot be turned into a
//! consistent graph fails with a validation error naming the offending field.

use std::collections::BTreeMap;

use tracing::debug;

use lbstack_common::{Error, Result};

use crate::intent::{BackendRef, DesiredState, Frontend, PathMatch, RouteRule, ServicePortIntent};
use crate::naming;
use crate::resource::{
    HealthCheck, IngressPermission, ListenerAction, ListenerRuleSpec, ListenerSpec,
    LoadBalancerSpec, LoadBalancerType, Protocol, Resolvable, ResourceKind, ResourceRef,
    ResourceSpec, RuleCondition, SecurityGroupSpec, TargetGroupBindingSpec, TargetGroupSpec,
    TargetType,
};
use crate::settings::{BuildEnvironment, ListenPort};
use crate::stack::{SharedRuleSpec, Stack, StackId};

/// Logical ID of the load balancer in every stack
pub const LOAD_BALANCER_ID: &str = "LoadBalancer";

/// Logical ID of an ingress stack's managed security group
pub const MANAGED_SECURITY_GROUP_ID: &str = "ManagedLBSecurityGroup";

/// Default cap on rules per listener
pub const DEFAULT_MAX_RULES: usize = 100;

/// Builds stacks for one cluster
#[derive(Debug, Clone)]
pub struct StackBuilder {
    cluster: String,
    max_rules: usize,
}

impl StackBuilder {
    /// Builder for stacks under `cluster`
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            max_rules: DEFAULT_MAX_RULES,
        }
    }

    /// Override the per-listener rule cap
    pub fn with_max_rules(mut self, max_rules: usize) -> Self {
        self.max_rules = max_rules;
        self
    }

    /// Cluster name used as the stack ID prefix
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Stack ID for an object
    pub fn stack_id(&self, namespace: &str, name: &str) -> StackId {
        StackId::new(&self.cluster, namespace, name)
    }

    /// Build the stack for `desired`, returning it with the load balancer's reference.
    pub fn build(
        &self,
        desired: &DesiredState,
        env: &BuildEnvironment,
    ) -> Result<(Stack, ResourceRef)> {
        let key = desired.key();
        if env.subnets.is_empty() {
            return Err(Error::validation_for_field(
                &key,
                "subnets",
                "no subnets available for load balancer placement",
            ));
        }

        let mut build = Build {
            stack: Stack::new(
                self.stack_id(&desired.namespace, &desired.name),
                desired.kind.tag_prefix(),
            ),
            env,
            key,
        };

        let lb = match &desired.frontend {
            Frontend::Network { ports } => build.network(ports)?,
            Frontend::Application {
                default_backend,
                rules,
            } => build.application(default_backend.as_ref(), rules, self.max_rules)?,
        };

        debug!(
            stack = %build.stack.id(),
            resources = build.stack.len(),
            "Built stack"
        );
        Ok((build.stack, lb))
    }

    /// A stack with an empty desired set. Deploying it deletes everything tagged with `id`.
    pub fn build_teardown(&self, id: StackId, tag_prefix: &str) -> Stack {
        Stack::new(id, tag_prefix)
    }
}

struct Build<'a> {
    stack: Stack,
    env: &'a BuildEnvironment,
    key: String,
}

impl Build<'_> {
    fn network(&mut self, ports: &[ServicePortIntent]) -> Result<ResourceRef> {
        if ports.is_empty() {
            return Err(Error::validation_for_field(
                &self.key,
                "spec.ports",
                "service declares no ports",
            ));
        }
        check_port_conflicts(
            &self.key,
            "spec.ports",
            ports.iter().map(|p| (p.port, p.protocol)),
        )?;

        let groups = literal_groups(&self.env.settings.security_groups);
        let lb = self.load_balancer(LoadBalancerType::Network, groups)?;

        for p in ports {
            let tg = self.target_group(&p.backend, p.protocol)?;
            self.stack.add(
                p.port.to_string(),
                ResourceSpec::Listener(ListenerSpec {
                    load_balancer: lb.clone().into(),
                    port: p.port,
                    protocol: p.protocol,
                    certificate_arn: None,
                    default_action: ListenerAction::Forward {
                        target_group: tg.into(),
                    },
                }),
            )?;
        }
        Ok(lb)
    }

    fn application(
        &mut self,
        default_backend: Option<&BackendRef>,
        rules: &[RouteRule],
        max_rules: usize,
    ) -> Result<ResourceRef> {
        let env = self.env;
        let settings = &env.settings;
        let listen_ports: Vec<ListenPort> = settings.listen_ports.clone();
        if listen_ports.is_empty() {
            return Err(Error::validation_for_field(
                &self.key,
                "listenPorts",
                "no listen ports configured",
            ));
        }
        check_port_conflicts(
            &self.key,
            "listenPorts",
            listen_ports.iter().map(|p| (p.port, p.protocol)),
        )?;
        for lp in &listen_ports {
            if !matches!(lp.protocol, Protocol::Http | Protocol::Https) {
                return Err(Error::validation_for_field(
                    &self.key,
                    "listenPorts",
                    format!(
                        "listener on port {} must be HTTP or HTTPS, got {}",
                        lp.port, lp.protocol
                    ),
                ));
            }
            if lp.protocol.needs_certificate() && settings.certificate_arn.is_none() {
                return Err(Error::validation_for_field(
                    &self.key,
                    "certificateArn",
                    format!("{} listener on port {} requires a certificate", lp.protocol, lp.port),
                ));
            }
        }
        if rules.len() > max_rules {
            return Err(Error::validation_for_field(
                &self.key,
                "spec.rules",
                format!("{} rules exceed the limit of {} per listener", rules.len(), max_rules),
            ));
        }

        let managed_sg = if settings.security_groups.is_empty() {
            Some(self.managed_security_group(&listen_ports)?)
        } else {
            None
        };
        let groups = match &managed_sg {
            Some(sg) => vec![Resolvable::Ref(sg.clone())],
            None => literal_groups(&settings.security_groups),
        };
        let lb = self.load_balancer(LoadBalancerType::Application, groups)?;

        let default_tg = default_backend
            .map(|b| self.target_group(b, Protocol::Http))
            .transpose()?;

        for lp in &listen_ports {
            let default_action = match &default_tg {
                Some(tg) => ListenerAction::Forward {
                    target_group: tg.clone().into(),
                },
                None => ListenerAction::FixedResponse {
                    status_code: 404,
                    content_type: "text/plain".to_string(),
                },
            };
            let listener = self.stack.add(
                lp.port.to_string(),
                ResourceSpec::Listener(ListenerSpec {
                    load_balancer: lb.clone().into(),
                    port: lp.port,
                    protocol: lp.protocol,
                    certificate_arn: lp
                        .protocol
                        .needs_certificate()
                        .then(|| settings.certificate_arn.clone())
                        .flatten(),
                    default_action,
                }),
            )?;

            for (i, rule) in rules.iter().enumerate() {
                let priority = u32::try_from(i + 1).unwrap_or(u32::MAX);
                let tg = self.target_group(&rule.backend, Protocol::Http)?;
                self.stack.add(
                    format!("{}:{}", lp.port, priority),
                    ResourceSpec::ListenerRule(ListenerRuleSpec {
                        listener: listener.clone().into(),
                        priority,
                        conditions: rule_conditions(rule),
                        action: ListenerAction::Forward {
                            target_group: tg.into(),
                        },
                    }),
                )?;
            }
        }

        if let (Some(sg), Some(_)) = (&managed_sg, &env.shared_backend_security_group) {
            let ports: Vec<u16> = self
                .stack
                .resources_of(ResourceKind::TargetGroup)
                .filter_map(|(_, spec)| match spec {
                    ResourceSpec::TargetGroup(tg) => Some(tg.port),
                    _ => None,
                })
                .collect();
            for port in ports {
                self.stack.add_shared_rule(SharedRuleSpec {
                    protocol: "tcp".to_string(),
                    port,
                    source: Resolvable::Ref(sg.clone()),
                })?;
            }
        }

        Ok(lb)
    }

    fn load_balancer(
        &mut self,
        lb_type: LoadBalancerType,
        security_groups: Vec<Resolvable>,
    ) -> Result<ResourceRef> {
        let scheme = self.env.settings.scheme;
        self.stack.add(
            LOAD_BALANCER_ID,
            ResourceSpec::LoadBalancer(LoadBalancerSpec {
                name: naming::load_balancer_name(
                    self.stack.tag_prefix(),
                    self.stack.id(),
                    &scheme.to_string(),
                ),
                lb_type,
                scheme,
                subnets: self.env.subnets.clone(),
                security_groups,
            }),
        )
    }

    fn managed_security_group(&mut self, listen_ports: &[ListenPort]) -> Result<ResourceRef> {
        let ingress = listen_ports
            .iter()
            .flat_map(|lp| {
                self.env.settings.inbound_cidrs.iter().map(move |cidr| IngressPermission {
                    protocol: "tcp".to_string(),
                    from_port: lp.port,
                    to_port: lp.port,
                    cidr: cidr.clone(),
                })
            })
            .collect();
        self.stack.add(
            MANAGED_SECURITY_GROUP_ID,
            ResourceSpec::SecurityGroup(SecurityGroupSpec {
                name: naming::security_group_name(self.stack.tag_prefix(), self.stack.id()),
                description: format!(
                    "[lbstack] managed load balancer security group for {}",
                    self.key
                ),
                ingress,
            }),
        )
    }

    /// Target group for `backend`, shared by every listener and rule that routes to it.
    fn target_group(&mut self, backend: &BackendRef, protocol: Protocol) -> Result<ResourceRef> {
        let logical_id = backend.to_string();
        let existing = ResourceRef::new(ResourceKind::TargetGroup, &logical_id);
        if self.stack.get(&existing).is_some() {
            return Ok(existing);
        }

        let resolved = self.env.backends.get(backend).ok_or_else(|| {
            Error::validation_for(&self.key, format!("backend {} does not exist", backend))
        })?;
        let target_type = self.env.settings.target_type;
        let port = match target_type {
            TargetType::Instance => resolved.node_port.ok_or_else(|| {
                Error::validation_for(
                    &self.key,
                    format!(
                        "backend {} has no node port; \
                         instance targets need a NodePort or LoadBalancer service",
                        backend
                    ),
                )
            })?,
            TargetType::Ip => resolved.target_port.ok_or_else(|| {
                Error::validation_for(
                    &self.key,
                    format!(
                        "backend {} uses a named target port; ip targets need a numeric port",
                        backend
                    ),
                )
            })?,
        };

        let health_check = match protocol {
            Protocol::Http | Protocol::Https => HealthCheck {
                protocol,
                path: Some(self.env.settings.health_check_path.clone()),
                port: "traffic-port".to_string(),
            },
            _ => HealthCheck {
                protocol: Protocol::Tcp,
                path: None,
                port: "traffic-port".to_string(),
            },
        };

        let tg = self.stack.add(
            &logical_id,
            ResourceSpec::TargetGroup(TargetGroupSpec {
                name: naming::target_group_name(
                    self.stack.tag_prefix(),
                    self.stack.id(),
                    &backend.service,
                    &logical_id,
                    port,
                    protocol,
                    target_type,
                ),
                port,
                protocol,
                target_type,
                health_check,
            }),
        )?;

        // Instance targets are registered through the node port on the target group itself
        if target_type == TargetType::Ip {
            self.stack.add(
                &logical_id,
                ResourceSpec::TargetGroupBinding(TargetGroupBindingSpec {
                    target_group: tg.clone().into(),
                    service_namespace: backend.namespace.clone(),
                    service_name: backend.service.clone(),
                    service_port: resolved.port,
                    target_type,
                }),
            )?;
        }
        Ok(tg)
    }
}

fn literal_groups(groups: &[String]) -> Vec<Resolvable> {
    groups.iter().cloned().map(Resolvable::Literal).collect()
}

fn check_port_conflicts(
    key: &str,
    field: &str,
    ports: impl Iterator<Item = (u16, Protocol)>,
) -> Result<()> {
    let mut seen: BTreeMap<u16, Protocol> = BTreeMap::new();
    for (port, protocol) in ports {
        if let Some(previous) = seen.insert(port, protocol) {
            let message = if previous == protocol {
                format!("port {} declared more than once", port)
            } else {
                format!("conflicting protocols {} and {} on port {}", previous, protocol, port)
            };
            return Err(Error::validation_for_field(key, field, message));
        }
    }
    Ok(())
}

fn rule_conditions(rule: &RouteRule) -> Vec<RuleCondition> {
    let mut conditions = Vec::new();
    if let Some(host) = &rule.host {
        conditions.push(RuleCondition::HostHeader(vec![host.clone()]));
    }
    let patterns = match (rule.path.as_deref(), rule.path_match) {
        (None, _) | (Some(""), _) => {
            if conditions.is_empty() {
                vec!["/*".to_string()]
            } else {
                Vec::new()
            }
        }
        (Some("/"), PathMatch::Prefix) => vec!["/*".to_string()],
        (Some(path), PathMatch::Prefix) => {
            let path = path.trim_end_matches('/');
            vec![path.to_string(), format!("{}/*", path)]
        }
        (Some(path), PathMatch::Exact | PathMatch::Pattern) => vec![path.to_string()],
    };
    if !patterns.is_empty() {
        conditions.push(RuleCondition::PathPattern(patterns));
    }
    conditions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{BackendPort, ObjectKind};
    use crate::settings::{LoadBalancerSettings, ResolvedBackend};

    fn backend(service: &str, port: u16) -> BackendRef {
        BackendRef {
            namespace: "default".to_string(),
            service: service.to_string(),
            port: BackendPort::Number(port),
        }
    }

    fn service_state(ports: &[u16]) -> DesiredState {
        DesiredState {
            kind: ObjectKind::Service,
            namespace: "default".to_string(),
            name: "web".to_string(),
            frontend: Frontend::Network {
                ports: ports
                    .iter()
                    .map(|p| ServicePortIntent {
                        name: None,
                        port: *p,
                        protocol: Protocol::Tcp,
                        backend: backend("web", *p),
                    })
                    .collect(),
            },
        }
    }

    fn env_for(backends: &[(&str, u16)]) -> BuildEnvironment {
        BuildEnvironment {
            subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            backends: backends
                .iter()
                .map(|(svc, port)| {
                    (
                        backend(svc, *port),
                        ResolvedBackend {
                            port: *port,
                            target_port: Some(8080),
                            node_port: Some(30000 + *port),
                        },
                    )
                })
                .collect(),
            shared_backend_security_group: None,
            settings: LoadBalancerSettings::default(),
        }
    }

    fn ingress_state(default: Option<BackendRef>, rules: Vec<RouteRule>) -> DesiredState {
        DesiredState {
            kind: ObjectKind::Ingress,
            namespace: "default".to_string(),
            name: "shop".to_string(),
            frontend: Frontend::Application {
                default_backend: default,
                rules,
            },
        }
    }

    fn route(host: Option<&str>, path: &str, service: &str) -> RouteRule {
        RouteRule {
            host: host.map(String::from),
            path: Some(path.to_string()),
            path_match: PathMatch::Prefix,
            backend: backend(service, 80),
        }
    }

    fn count(stack: &Stack, kind: ResourceKind) -> usize {
        stack.resources_of(kind).count()
    }

    #[test]
    fn two_port_service_yields_five_resources() {
        let builder = StackBuilder::new("prod");
        let (stack, lb) = builder
            .build(&service_state(&[80, 443]), &env_for(&[("web", 80), ("web", 443)]))
            .unwrap();

        assert_eq!(stack.len(), 5);
        assert_eq!(count(&stack, ResourceKind::LoadBalancer), 1);
        assert_eq!(count(&stack, ResourceKind::TargetGroup), 2);
        assert_eq!(count(&stack, ResourceKind::Listener), 2);
        assert_eq!(count(&stack, ResourceKind::ListenerRule), 0);
        assert_eq!(count(&stack, ResourceKind::SecurityGroup), 0);
        assert_eq!(lb, ResourceRef::new(ResourceKind::LoadBalancer, LOAD_BALANCER_ID));
        assert_eq!(stack.id().to_string(), "prod/default/web");
    }

    #[test]
    fn build_is_deterministic() {
        let builder = StackBuilder::new("prod");
        let desired = service_state(&[80, 443]);
        let env = env_for(&[("web", 80), ("web", 443)]);
        let (a, _) = builder.build(&desired, &env).unwrap();
        let (b, _) = builder.build(&desired, &env).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn adding_a_port_adds_one_target_group_and_listener() {
        let builder = StackBuilder::new("prod");
        let env = env_for(&[("web", 80), ("web", 443), ("web", 8443)]);
        let (before, _) = builder.build(&service_state(&[80, 443]), &env).unwrap();
        let (after, _) = builder.build(&service_state(&[80, 443, 8443]), &env).unwrap();

        let added: Vec<_> = after
            .resources()
            .filter(|(r, _)| before.get(r).is_none())
            .map(|(r, _)| r.to_string())
            .collect();
        assert_eq!(added, vec!["TargetGroup/default/web:8443", "Listener/8443"]);
        for (r, spec) in before.resources() {
            assert_eq!(after.get(r), Some(spec));
        }
    }

    #[test]
    fn conflicting_protocols_are_rejected() {
        let mut desired = service_state(&[80, 80]);
        if let Frontend::Network { ports } = &mut desired.frontend {
            ports[1].protocol = Protocol::Udp;
        }
        let err = StackBuilder::new("prod")
            .build(&desired, &env_for(&[("web", 80)]))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("conflicting protocols TCP and UDP on port 80"));
    }

    #[test]
    fn empty_subnets_are_rejected() {
        let mut env = env_for(&[("web", 80)]);
        env.subnets.clear();
        let err = StackBuilder::new("prod").build(&service_state(&[80]), &env).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn instance_targets_need_node_ports() {
        let mut env = env_for(&[("web", 80)]);
        env.backends.values_mut().for_each(|b| b.node_port = None);
        let err = StackBuilder::new("prod").build(&service_state(&[80]), &env).unwrap_err();
        assert!(err.to_string().contains("no node port"));
    }

    #[test]
    fn ip_targets_add_bindings() {
        let mut env = env_for(&[("web", 80)]);
        env.settings.target_type = TargetType::Ip;
        let (stack, _) = StackBuilder::new("prod").build(&service_state(&[80]), &env).unwrap();

        assert_eq!(count(&stack, ResourceKind::TargetGroupBinding), 1);
        let tg = stack
            .get(&ResourceRef::new(ResourceKind::TargetGroup, "default/web:80"))
            .unwrap();
        match tg {
            ResourceSpec::TargetGroup(tg) => assert_eq!(tg.port, 8080),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ingress_builds_security_group_rules_and_shared_backends() {
        let desired = ingress_state(
            Some(backend("home", 80)),
            vec![
                route(Some("shop.example.com"), "/cart", "cart"),
                route(Some("shop.example.com"), "/checkout", "cart"),
            ],
        );
        let mut env = env_for(&[("home", 80), ("cart", 80)]);
        env.shared_backend_security_group = Some("sg-shared".to_string());
        let (stack, _) = StackBuilder::new("prod").build(&desired, &env).unwrap();

        assert_eq!(count(&stack, ResourceKind::SecurityGroup), 1);
        assert_eq!(count(&stack, ResourceKind::LoadBalancer), 1);
        // home and cart, cart shared by both rules
        assert_eq!(count(&stack, ResourceKind::TargetGroup), 2);
        assert_eq!(count(&stack, ResourceKind::Listener), 1);
        assert_eq!(count(&stack, ResourceKind::ListenerRule), 2);

        let rule = stack
            .get(&ResourceRef::new(ResourceKind::ListenerRule, "80:1"))
            .unwrap();
        match rule {
            ResourceSpec::ListenerRule(r) => {
                assert_eq!(r.priority, 1);
                assert_eq!(
                    r.conditions,
                    vec![
                        RuleCondition::HostHeader(vec!["shop.example.com".to_string()]),
                        RuleCondition::PathPattern(vec![
                            "/cart".to_string(),
                            "/cart/*".to_string(),
                        ]),
                    ]
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        let shared: Vec<u16> = stack.shared_rules().map(|r| r.port).collect();
        assert_eq!(shared, vec![30080]);
    }

    #[test]
    fn ingress_without_default_backend_answers_404() {
        let desired = ingress_state(None, vec![route(None, "/", "home")]);
        let (stack, _) = StackBuilder::new("prod")
            .build(&desired, &env_for(&[("home", 80)]))
            .unwrap();
        let listener = stack.get(&ResourceRef::new(ResourceKind::Listener, "80")).unwrap();
        match listener {
            ResourceSpec::Listener(l) => assert!(matches!(
                l.default_action,
                ListenerAction::FixedResponse { status_code: 404, .. }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn explicit_security_groups_skip_the_managed_group() {
        let mut env = env_for(&[("home", 80)]);
        env.settings.security_groups = vec!["sg-explicit".to_string()];
        env.shared_backend_security_group = Some("sg-shared".to_string());
        let (stack, _) = StackBuilder::new("prod")
            .build(&ingress_state(Some(backend("home", 80)), vec![]), &env)
            .unwrap();
        assert_eq!(count(&stack, ResourceKind::SecurityGroup), 0);
        assert_eq!(stack.shared_rules().count(), 0);
    }

    #[test]
    fn https_without_certificate_is_rejected() {
        let mut env = env_for(&[("home", 80)]);
        env.settings.listen_ports = vec![ListenPort {
            port: 443,
            protocol: Protocol::Https,
        }];
        let err = StackBuilder::new("prod")
            .build(&ingress_state(Some(backend("home", 80)), vec![]), &env)
            .unwrap_err();
        assert!(err.to_string().contains("requires a certificate"));
    }

    #[test]
    fn missing_backend_is_rejected() {
        let err = StackBuilder::new("prod")
            .build(&ingress_state(Some(backend("ghost", 80)), vec![]), &env_for(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("default/ghost:80 does not exist"));
    }

    #[test]
    fn too_many_rules_are_rejected() {
        let rules = vec![route(None, "/a", "home"), route(None, "/b", "home")];
        let err = StackBuilder::new("prod")
            .with_max_rules(1)
            .build(&ingress_state(None, rules), &env_for(&[("home", 80)]))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn teardown_stack_is_empty() {
        let builder = StackBuilder::new("prod");
        let stack =
            builder.build_teardown(builder.stack_id("default", "web"), "service.lbstack.io");
        assert!(stack.is_empty());
        assert_eq!(stack.id().to_string(), "prod/default/web");
    }
}
