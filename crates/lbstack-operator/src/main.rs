//! lbstack operator - load balancers for Services and Ingresses

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use lbstack_common::events::KubeEventPublisher;
use lbstack_common::kube_utils::create_client;
use lbstack_common::telemetry::{init_telemetry, TelemetryConfig};
use lbstack_common::FIELD_MANAGER;
use lbstack_deploy::{InMemoryCloud, SharedSecurityGroupReconciler, StackDeployer};
use lbstack_model::StackBuilder;
use lbstack_operator::runner::{
    build_ingress_controller, build_service_controller, prune_shared_rules,
};
use lbstack_operator::{
    ClusterEnvironment, Context, ControllerConfig, DefaultSettings, KubeObjectClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::parse();

    init_telemetry(&TelemetryConfig {
        service_name: "lbstack-operator".to_string(),
        json: config.log_json,
        ..Default::default()
    })?;
    config.validate()?;

    run_controller(config).await
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = create_client(config.kubeconfig.as_deref()).await?;
    tracing::info!(
        cluster = %config.cluster_name,
        ingress_class = %config.ingress_class,
        load_balancer_class = %config.load_balancer_class,
        "Starting lbstack controller"
    );

    let mut cloud = InMemoryCloud::new();
    if config.cloud_latency_ms > 0 {
        cloud = cloud.with_latency(Duration::from_millis(config.cloud_latency_ms));
    }
    let cloud = Arc::new(cloud);

    let mut deployer = StackDeployer::new(cloud.clone())
        .with_retry(config.converge_retry())
        .with_concurrency(config.deploy_concurrency);
    let shared = config.shared_backend_security_group.as_ref().map(|group| {
        Arc::new(SharedSecurityGroupReconciler::new(
            cloud.clone(),
            group.clone(),
            config.converge_retry(),
        ))
    });
    if let Some(shared) = &shared {
        deployer = deployer.with_shared_security_group(shared.clone());
    }

    let objects = Arc::new(KubeObjectClient::new(client.clone()));
    let environment = Arc::new(ClusterEnvironment::new(
        objects.clone(),
        Arc::new(DefaultSettings::new(config.settings())),
        config.subnets.clone(),
        config.shared_backend_security_group.clone(),
    ));

    if let Some(shared) = &shared {
        prune_shared_rules(objects.as_ref(), shared, &config.cluster_name).await?;
    }

    let cancel = CancellationToken::new();
    let ctx = Arc::new(
        Context::new(
            objects,
            environment,
            Arc::new(deployer),
            StackBuilder::new(&config.cluster_name),
            config.class_matcher(),
            Arc::new(KubeEventPublisher::new(client.clone(), FIELD_MANAGER)),
        )
        .with_reconcile_timeout(config.reconcile_timeout())
        .with_cancellation(cancel.clone()),
    );

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, cancelling in-flight deploys");
            shutdown.cancel();
        }
    });

    let concurrency = config.max_concurrent_reconciles;
    let mut controllers = build_service_controller(client.clone(), ctx.clone(), concurrency);
    controllers.extend(build_ingress_controller(client, ctx, concurrency));

    tracing::info!(controllers = controllers.len(), "Running controllers");
    futures::future::join_all(controllers).await;
    tracing::info!("Controllers stopped");
    Ok(())
}
