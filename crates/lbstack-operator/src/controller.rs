//! Object reconciler for Services and Ingresses
//!
//! Each reconcile folds two independent facts about the object, whether it
//! should currently have infrastructure and whether it carries the finalizer,
//! into one [`Transition`]. The finalizer is added before anything is created
//! and removed only after a teardown deploy succeeds, so an object can never
//! disappear while infrastructure it owns still exists.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use lbstack_common::events::{actions, reasons, EventPublisher, NoopEventPublisher};
use lbstack_common::retry::RetryConfig;
use lbstack_common::{Error, Result};
use lbstack_deploy::{CloudApi, StackDeployer};
use lbstack_model::{
    ClassMatcher, DesiredState, IntentObject, LoadBalancerSettings, ResourceRef, Stack,
    StackBuilder,
};

use crate::client::ObjectClient;
use crate::config::DEFAULT_LOAD_BALANCER_CLASS;
use crate::environment::{ClusterEnvironment, DefaultSettings, EnvironmentResolver};

/// Requeue interval after a successful reconcile, to correct drift
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// First requeue delay after a failed reconcile
pub const INITIAL_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on the failed-reconcile requeue delay
pub const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(300);

/// What a reconcile does with an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Converge the object's stack, adding the finalizer first if missing
    Deploy {
        /// Whether the finalizer still has to be added
        add_finalizer: bool,
    },
    /// Delete everything the stack owns, then release the finalizer
    Teardown,
    /// Nothing was ever created and nothing should be
    Ignore,
}

/// Pick the transition for an object.
///
/// `wanted` is false when the object is being deleted or no longer matches
/// this controller's class.
pub fn plan(wanted: bool, has_finalizer: bool) -> Transition {
    match (wanted, has_finalizer) {
        (true, has_finalizer) => Transition::Deploy {
            add_finalizer: !has_finalizer,
        },
        (false, true) => Transition::Teardown,
        (false, false) => Transition::Ignore,
    }
}

/// Per-object exponential requeue delay for failed reconciles
#[derive(Debug, Default)]
pub struct RequeueBackoff {
    failures: DashMap<String, u32>,
}

impl RequeueBackoff {
    /// Record a failure of `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = (*failures).min(16);
        *failures = failures.saturating_add(1);
        INITIAL_REQUEUE_DELAY
            .saturating_mul(1u32 << exponent)
            .min(MAX_REQUEUE_DELAY)
    }

    /// Forget the failures of `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }
}

/// Which Services each Ingress referenced in its last build.
///
/// Lets the Ingress controller re-enqueue Ingresses when a backend changes.
#[derive(Debug, Clone, Default)]
pub struct BackendIndex {
    by_ingress: Arc<DashMap<(String, String), BTreeSet<(String, String)>>>,
}

impl BackendIndex {
    /// Replace the backends recorded for an Ingress
    pub fn record(&self, object: &IntentObject, desired: &DesiredState) {
        let services = desired
            .backends()
            .into_iter()
            .map(|b| (b.namespace.clone(), b.service.clone()))
            .collect();
        self.by_ingress
            .insert((object.namespace(), object.name()), services);
    }

    /// Drop everything recorded for an object
    pub fn forget(&self, object: &IntentObject) {
        self.by_ingress.remove(&(object.namespace(), object.name()));
    }

    /// `(namespace, name)` of every Ingress backed by the given Service
    pub fn dependents_of(&self, namespace: &str, name: &str) -> Vec<(String, String)> {
        let service = (namespace.to_string(), name.to_string());
        self.by_ingress
            .iter()
            .filter(|entry| entry.value().contains(&service))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Shared state for both reconcilers
pub struct Context {
    /// Writes to watched objects
    pub client: Arc<dyn ObjectClient>,
    /// Resolves subnets, settings and backends before a build
    pub environment: Arc<dyn EnvironmentResolver>,
    /// Converges stacks against the infrastructure
    pub deployer: Arc<StackDeployer>,
    /// Turns desired state into stacks
    pub builder: StackBuilder,
    /// Decides which objects this controller owns
    pub matcher: ClassMatcher,
    /// Event publisher for Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Failed-reconcile requeue delays
    pub backoff: RequeueBackoff,
    /// Ingress to backend Service index
    pub backends: BackendIndex,
    /// Deadline for one reconcile attempt
    pub reconcile_timeout: Duration,
    /// Cancelled on shutdown; every attempt runs under a child token
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a context with the default reconcile deadline
    pub fn new(
        client: Arc<dyn ObjectClient>,
        environment: Arc<dyn EnvironmentResolver>,
        deployer: Arc<StackDeployer>,
        builder: StackBuilder,
        matcher: ClassMatcher,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            environment,
            deployer,
            builder,
            matcher,
            events,
            backoff: RequeueBackoff::default(),
            backends: BackendIndex::default(),
            reconcile_timeout: Duration::from_secs(300),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the per-attempt deadline
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Tie every attempt to `cancel`
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Create a context for testing against `cloud`
    ///
    /// Uses a no-op event publisher, a single subnet and fast converge retries.
    pub fn for_testing(client: Arc<dyn ObjectClient>, cloud: Arc<dyn CloudApi>) -> Self {
        let environment = Arc::new(ClusterEnvironment::new(
            client.clone(),
            Arc::new(DefaultSettings::new(LoadBalancerSettings::default())),
            vec!["subnet-test".to_string()],
            None,
        ));
        let deployer = Arc::new(StackDeployer::new(cloud).with_retry(RetryConfig::immediate(2)));
        Self::new(
            client,
            environment,
            deployer,
            StackBuilder::new("test-cluster"),
            ClassMatcher::new(lbstack_common::DEFAULT_INGRESS_CLASS, DEFAULT_LOAD_BALANCER_CLASS),
            Arc::new(NoopEventPublisher),
        )
    }
}

fn backoff_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

/// Reconcile a Service
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile_service(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    reconcile(IntentObject::Service(service), &ctx).await
}

/// Reconcile an Ingress
#[instrument(skip(ingress, ctx), fields(ingress = %ingress.name_any()))]
pub async fn reconcile_ingress(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action> {
    reconcile(IntentObject::Ingress(ingress), &ctx).await
}

async fn reconcile(object: IntentObject, ctx: &Context) -> Result<Action> {
    let attempt = ctx.cancel.child_token();
    let attempt_result =
        tokio::time::timeout(ctx.reconcile_timeout, converge(&object, ctx, &attempt)).await;
    let result = match attempt_result {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            seconds: ctx.reconcile_timeout.as_secs(),
        }),
    };

    if result.is_ok() {
        ctx.backoff.reset(&backoff_key(
            object.kind().as_str(),
            &object.namespace(),
            &object.name(),
        ));
    }
    result
}

async fn converge(
    object: &IntentObject,
    ctx: &Context,
    cancel: &CancellationToken,
) -> Result<Action> {
    let wanted = !object.deletion_requested() && ctx.matcher.matches(object);
    let transition = plan(wanted, object.has_finalizer());
    debug!(object = %object.key(), kind = %object.kind(), ?transition, "Reconciling");

    match transition {
        Transition::Deploy { add_finalizer } => deploy(object, ctx, add_finalizer, cancel).await,
        Transition::Teardown => teardown(object, ctx, cancel).await,
        Transition::Ignore => {
            ctx.backends.forget(object);
            Ok(Action::await_change())
        }
    }
}

async fn build(object: &IntentObject, ctx: &Context) -> Result<(Stack, ResourceRef)> {
    let desired = object.desired_state()?;
    if let IntentObject::Ingress(_) = object {
        // Recorded before resolution so a missing backend re-triggers us once it appears
        ctx.backends.record(object, &desired);
    }
    let env = ctx.environment.resolve(object, &desired).await?;
    ctx.builder.build(&desired, &env)
}

async fn deploy(
    object: &IntentObject,
    ctx: &Context,
    add_finalizer: bool,
    cancel: &CancellationToken,
) -> Result<Action> {
    let kind = object.kind();
    let namespace = object.namespace();
    let name = object.name();
    let reference = object.object_ref();

    if add_finalizer {
        ctx.client.add_finalizer(kind, &namespace, &name).await?;
        info!(object = %object.key(), %kind, "Added finalizer");
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::FINALIZER_ADDED,
                actions::RECONCILE,
                None,
            )
            .await;
    }

    let (stack, load_balancer) = match build(object, ctx).await {
        Ok(built) => built,
        Err(e) => {
            ctx.events
                .publish(
                    &reference,
                    EventType::Warning,
                    reasons::BUILD_FAILED,
                    actions::BUILD,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    let report = match ctx.deployer.deploy(&stack, cancel).await {
        Ok(report) => report,
        Err(e) => {
            ctx.events
                .publish(
                    &reference,
                    EventType::Warning,
                    reasons::DEPLOY_FAILED,
                    actions::DEPLOY,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    let hostname = report
        .dns_name(&load_balancer)
        .ok_or_else(|| {
            Error::internal_with_context(
                "reconciler",
                format!("load balancer of {} has no DNS name", stack.id()),
            )
        })?
        .to_string();

    if object.status_matches(&hostname) {
        debug!(object = %object.key(), %hostname, "Status already up to date");
    } else {
        ctx.client
            .patch_load_balancer_status(kind, &namespace, &name, &hostname)
            .await?;
    }

    if report.mutations() > 0 {
        info!(
            object = %object.key(),
            %kind,
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            %hostname,
            "Stack converged"
        );
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::SUCCESSFULLY_RECONCILED,
                actions::RECONCILE,
                Some(format!("load balancer available at {hostname}")),
            )
            .await;
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn teardown(
    object: &IntentObject,
    ctx: &Context,
    cancel: &CancellationToken,
) -> Result<Action> {
    let kind = object.kind();
    let reference = object.object_ref();
    info!(object = %object.key(), %kind, "Tearing down load balancer stack");
    ctx.events
        .publish(
            &reference,
            EventType::Normal,
            reasons::CLEANUP_STARTED,
            actions::DELETE,
            None,
        )
        .await;

    let stack = ctx
        .builder
        .build_teardown(object.stack_id(ctx.builder.cluster()), kind.tag_prefix());
    let report = match ctx.deployer.deploy(&stack, cancel).await {
        Ok(report) => report,
        Err(e) => {
            // Finalizer stays until a later teardown succeeds
            ctx.events
                .publish(
                    &reference,
                    EventType::Warning,
                    reasons::DEPLOY_FAILED,
                    actions::DELETE,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    ctx.events
        .publish(
            &reference,
            EventType::Normal,
            reasons::CLEANUP_COMPLETE,
            actions::DELETE,
            Some(format!("deleted {} resource(s)", report.deleted.len())),
        )
        .await;
    ctx.client
        .remove_finalizer(kind, &object.namespace(), &object.name())
        .await?;
    ctx.backends.forget(object);
    info!(object = %object.key(), %kind, deleted = report.deleted.len(), "Released finalizer");

    Ok(Action::await_change())
}

/// Requeue policy for failed reconciles.
///
/// Invalid input waits for the object to change. Everything else is retried
/// with a per-object delay that doubles up to [`MAX_REQUEUE_DELAY`].
pub fn error_policy<K>(object: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let key = backoff_key(
        &K::kind(&()),
        &object.namespace().unwrap_or_default(),
        &object.name_any(),
    );

    if error.is_validation() {
        warn!(
            object = %key,
            offending = error.object().unwrap_or(key.as_str()),
            error = %error,
            "Invalid object, waiting for a change"
        );
        return Action::await_change();
    }

    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        object = %key,
        context = error.context().unwrap_or_default(),
        retryable = error.is_retryable(),
        requeue_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ObjectReference, ServicePort, ServiceSpec,
        ServiceStatus,
    };
    use k8s_openapi::api::networking::v1::{
        IngressBackend, IngressServiceBackend, IngressSpec, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use rstest::rstest;

    use lbstack_common::{INGRESS_FINALIZER, SERVICE_FINALIZER};
    use lbstack_deploy::memory::Operation;
    use lbstack_deploy::{CloudError, InMemoryCloud};
    use lbstack_model::{ObjectKind, ResourceKind};

    use crate::client::MockObjectClient;

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn service(name: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|&port| ServicePort {
                            port,
                            node_port: Some(30000 + port),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn finalized(mut svc: Service) -> Service {
        svc.metadata.finalizers = Some(vec![SERVICE_FINALIZER.to_string()]);
        svc
    }

    fn deleting(mut svc: Service) -> Service {
        svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        svc
    }

    fn with_hostname(mut svc: Service, hostname: &str) -> Service {
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    hostname: Some(hostname.to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        svc
    }

    fn ingress(name: &str, backend: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some("alb".to_string()),
                default_backend: Some(IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: backend.to_string(),
                        port: Some(ServiceBackendPort {
                            name: None,
                            number: Some(80),
                        }),
                    }),
                    resource: None,
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// A client that accepts every write
    fn permissive_client() -> MockObjectClient {
        let mut client = MockObjectClient::new();
        client.expect_add_finalizer().returning(|_, _, _| Ok(()));
        client.expect_remove_finalizer().returning(|_, _, _| Ok(()));
        client
            .expect_patch_load_balancer_status()
            .returning(|_, _, _, _| Ok(()));
        client
    }

    fn context(client: MockObjectClient, cloud: &Arc<InMemoryCloud>) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(client), cloud.clone()))
    }

    /// Deploy `web` with ports 80 and 443, returning the load balancer hostname
    async fn provisioned(cloud: &Arc<InMemoryCloud>) -> String {
        let ctx = context(permissive_client(), cloud);
        reconcile_service(Arc::new(service("web", &[80, 443])), ctx)
            .await
            .unwrap();
        cloud
            .resources_of(ResourceKind::LoadBalancer)
            .remove(0)
            .dns_name
            .unwrap()
    }

    #[derive(Default)]
    struct RecordingEvents {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    #[rstest]
    #[case(true, false, Transition::Deploy { add_finalizer: true })]
    #[case(true, true, Transition::Deploy { add_finalizer: false })]
    #[case(false, true, Transition::Teardown)]
    #[case(false, false, Transition::Ignore)]
    fn plan_covers_all_four_combinations(
        #[case] wanted: bool,
        #[case] has_finalizer: bool,
        #[case] expected: Transition,
    ) {
        assert_eq!(plan(wanted, has_finalizer), expected);
    }

    #[tokio::test]
    async fn new_service_gets_finalizer_then_infrastructure_then_status() {
        let cloud = Arc::new(InMemoryCloud::new());
        let hostnames = Arc::new(Mutex::new(Vec::new()));

        let mut client = MockObjectClient::new();
        let observed = cloud.clone();
        client
            .expect_add_finalizer()
            .withf(|kind, ns, name| {
                *kind == ObjectKind::Service && ns == "default" && name == "web"
            })
            .times(1)
            .returning(move |_, _, _| {
                assert!(observed.is_empty(), "finalizer must precede any creation");
                Ok(())
            });
        let seen = hostnames.clone();
        client
            .expect_patch_load_balancer_status()
            .times(1)
            .returning(move |_, _, _, hostname| {
                seen.lock().unwrap().push(hostname.to_string());
                Ok(())
            });

        let ctx = context(client, &cloud);
        let action = reconcile_service(Arc::new(service("web", &[80, 443])), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));
        assert_eq!(cloud.creates(), 5);
        let lb = cloud.resources_of(ResourceKind::LoadBalancer).remove(0);
        assert_eq!(*hostnames.lock().unwrap(), vec![lb.dns_name.unwrap()]);
    }

    #[tokio::test]
    async fn settled_service_makes_no_writes() {
        let cloud = Arc::new(InMemoryCloud::new());
        let hostname = provisioned(&cloud).await;
        cloud.reset_counters();

        let mut client = MockObjectClient::new();
        client.expect_add_finalizer().never();
        client.expect_patch_load_balancer_status().never();

        let settled = with_hostname(finalized(service("web", &[80, 443])), &hostname);
        reconcile_service(Arc::new(settled), context(client, &cloud))
            .await
            .unwrap();
        assert_eq!(cloud.mutations(), 0);
    }

    #[tokio::test]
    async fn deleted_service_is_torn_down_before_finalizer_release() {
        let cloud = Arc::new(InMemoryCloud::new());
        provisioned(&cloud).await;

        let mut client = MockObjectClient::new();
        let observed = cloud.clone();
        client
            .expect_remove_finalizer()
            .withf(|kind, ns, name| {
                *kind == ObjectKind::Service && ns == "default" && name == "web"
            })
            .times(1)
            .returning(move |_, _, _| {
                assert!(observed.is_empty(), "finalizer released with infrastructure left");
                Ok(())
            });

        let action = reconcile_service(
            Arc::new(deleting(finalized(service("web", &[80, 443])))),
            context(client, &cloud),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cloud.deletes(), 5);
    }

    #[tokio::test]
    async fn deleted_service_without_finalizer_is_ignored() {
        let cloud = Arc::new(InMemoryCloud::new());
        let client = MockObjectClient::new();

        let action = reconcile_service(
            Arc::new(deleting(service("web", &[80]))),
            context(client, &cloud),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cloud.lists(), 0);
    }

    #[tokio::test]
    async fn failed_teardown_keeps_the_finalizer() {
        let cloud = Arc::new(InMemoryCloud::new());
        provisioned(&cloud).await;
        cloud.inject_fault(
            Operation::Delete,
            Some(ResourceKind::LoadBalancer),
            None,
            CloudError::AccessDenied("denied".into()),
            1,
        );

        let mut client = MockObjectClient::new();
        client.expect_remove_finalizer().never();

        let result = reconcile_service(
            Arc::new(deleting(finalized(service("web", &[80, 443])))),
            context(client, &cloud),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(cloud.resources_of(ResourceKind::LoadBalancer).len(), 1);
    }

    #[tokio::test]
    async fn class_change_tears_down_like_a_deletion() {
        let cloud = Arc::new(InMemoryCloud::new());
        provisioned(&cloud).await;

        let mut client = MockObjectClient::new();
        client.expect_remove_finalizer().times(1).returning(|_, _, _| Ok(()));

        let mut moved = finalized(service("web", &[80, 443]));
        if let Some(spec) = moved.spec.as_mut() {
            spec.load_balancer_class = Some("someone-else".to_string());
        }
        reconcile_service(Arc::new(moved), context(client, &cloud))
            .await
            .unwrap();
        assert!(cloud.is_empty());
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[tokio::test]
    async fn invalid_service_waits_for_a_change() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut client = MockObjectClient::new();
        client.expect_add_finalizer().times(1).returning(|_, _, _| Ok(()));
        client.expect_patch_load_balancer_status().never();

        let events = Arc::new(RecordingEvents::default());
        let mut ctx = Context::for_testing(Arc::new(client), cloud.clone());
        ctx.events = events.clone();
        let ctx = Arc::new(ctx);

        let svc = Arc::new(service("web", &[]));
        let err = reconcile_service(svc.clone(), ctx.clone()).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(error_policy(svc, &err, ctx), Action::await_change());
        assert_eq!(
            *events.reasons.lock().unwrap(),
            vec![reasons::FINALIZER_ADDED, reasons::BUILD_FAILED]
        );
        assert_eq!(cloud.lists(), 0);
    }

    #[test]
    fn requeue_backoff_doubles_to_cap_and_resets() {
        let backoff = RequeueBackoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay("k").as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(backoff.failures("k"), 8);

        backoff.reset("k");
        assert_eq!(backoff.next_delay("k"), INITIAL_REQUEUE_DELAY);
        assert_eq!(backoff.next_delay("other"), INITIAL_REQUEUE_DELAY);
    }

    #[tokio::test]
    async fn transient_failures_back_off_until_a_success() {
        let cloud = Arc::new(InMemoryCloud::new());
        let ctx = context(permissive_client(), &cloud);
        let svc = Arc::new(service("web", &[80]));

        assert_eq!(
            error_policy(svc.clone(), &Error::Cancelled, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(svc.clone(), &Error::Cancelled, ctx.clone()),
            Action::requeue(Duration::from_secs(10))
        );

        reconcile_service(svc, ctx.clone()).await.unwrap();
        assert_eq!(ctx.backoff.failures("Service/default/web"), 0);
    }

    #[tokio::test]
    async fn attempt_exceeding_its_deadline_times_out() {
        let cloud = Arc::new(InMemoryCloud::new().with_latency(Duration::from_millis(200)));
        let ctx = Context::for_testing(Arc::new(permissive_client()), cloud.clone())
            .with_reconcile_timeout(Duration::from_millis(20));

        let err = reconcile_service(Arc::new(service("web", &[80])), Arc::new(ctx))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn shutdown_cancels_the_attempt() {
        let cloud = Arc::new(InMemoryCloud::new());
        let ctx = Context::for_testing(Arc::new(permissive_client()), cloud.clone());
        ctx.cancel.cancel();

        let err = reconcile_service(Arc::new(service("web", &[80])), Arc::new(ctx))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(cloud.is_empty());
    }

    // =========================================================================
    // Ingresses
    // =========================================================================

    fn backend_service(name: &str) -> Service {
        let mut svc = service(name, &[80]);
        if let Some(spec) = svc.spec.as_mut() {
            spec.type_ = Some("NodePort".to_string());
        }
        svc
    }

    #[tokio::test]
    async fn ingress_lifecycle_maintains_the_backend_index() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut client = permissive_client();
        client
            .expect_get_service()
            .withf(|ns, name| ns == "default" && name == "shop-backend")
            .returning(|_, name| Ok(Some(backend_service(name))));
        let ctx = context(client, &cloud);

        reconcile_ingress(Arc::new(ingress("shop", "shop-backend")), ctx.clone())
            .await
            .unwrap();
        assert_eq!(cloud.resources_of(ResourceKind::LoadBalancer).len(), 1);
        assert_eq!(
            ctx.backends.dependents_of("default", "shop-backend"),
            vec![("default".to_string(), "shop".to_string())]
        );

        let mut gone = ingress("shop", "shop-backend");
        gone.metadata.finalizers = Some(vec![INGRESS_FINALIZER.to_string()]);
        gone.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        reconcile_ingress(Arc::new(gone), ctx.clone()).await.unwrap();

        assert!(cloud.is_empty());
        assert!(ctx.backends.dependents_of("default", "shop-backend").is_empty());
    }

    #[tokio::test]
    async fn missing_backend_is_still_indexed() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut client = permissive_client();
        client.expect_get_service().returning(|_, _| Ok(None));
        let ctx = context(client, &cloud);

        let err = reconcile_ingress(Arc::new(ingress("shop", "later")), ctx.clone())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(ctx.backends.dependents_of("default", "later").len(), 1);
        assert!(cloud.is_empty());
    }

    #[tokio::test]
    async fn service_and_ingress_of_one_name_do_not_collide() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut client = permissive_client();
        client
            .expect_get_service()
            .returning(|_, name| Ok(Some(backend_service(name))));
        let ctx = context(client, &cloud);

        reconcile_service(Arc::new(service("web", &[80])), ctx.clone())
            .await
            .unwrap();
        reconcile_ingress(Arc::new(ingress("web", "web")), ctx.clone())
            .await
            .unwrap();
        let names: BTreeSet<String> = cloud
            .resources_of(ResourceKind::LoadBalancer)
            .iter()
            .filter_map(|lb| lb.attributes["name"].as_str().map(str::to_string))
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");

        let mut gone = ingress("web", "web");
        gone.metadata.finalizers = Some(vec![INGRESS_FINALIZER.to_string()]);
        gone.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        reconcile_ingress(Arc::new(gone), ctx).await.unwrap();

        let remaining: BTreeMap<ResourceKind, usize> =
            [ResourceKind::LoadBalancer, ResourceKind::TargetGroup]
                .into_iter()
                .map(|k| (k, cloud.resources_of(k).len()))
                .collect();
        assert_eq!(remaining[&ResourceKind::LoadBalancer], 1);
        assert_eq!(remaining[&ResourceKind::TargetGroup], 1);
    }
}
