//! Controller runner - builds controller futures for each watched kind
//!
//! Each `build_*` function returns a Vec of boxed futures that the caller
//! composes. Services and Ingresses reconcile fully independently.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use lbstack_common::Result;
use lbstack_deploy::SharedSecurityGroupReconciler;
use lbstack_model::{ObjectKind, StackId};

use crate::client::ObjectClient;
use crate::controller::{error_policy, reconcile_ingress, reconcile_service, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Service controller
pub fn build_service_controller(
    client: Client,
    ctx: Arc<Context>,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    let services: Api<Service> = Api::all(client);
    let watcher_config = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    vec![Box::pin(
        Controller::new(services, watcher_config)
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(reconcile_service, error_policy::<Service>, ctx)
            .for_each(log_reconcile_result("Service")),
    )]
}

/// Build the Ingress controller.
///
/// Also watches Services and re-enqueues every Ingress whose last build
/// referenced the changed Service.
pub fn build_ingress_controller(
    client: Client,
    ctx: Arc<Context>,
    concurrency: u16,
) -> Vec<ControllerFuture> {
    let ingresses: Api<Ingress> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);
    let watcher_config = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let index = ctx.backends.clone();

    vec![Box::pin(
        Controller::new(ingresses, watcher_config())
            .with_config(ControllerConfig::default().concurrency(concurrency))
            .watches(services, watcher_config(), move |service: Service| {
                let namespace = service.namespace().unwrap_or_default();
                index
                    .dependents_of(&namespace, &service.name_any())
                    .into_iter()
                    .map(|(ns, name)| ObjectRef::<Ingress>::new(&name).within(&ns))
                    .collect::<Vec<_>>()
            })
            .shutdown_on_signal()
            .run(reconcile_ingress, error_policy::<Ingress>, ctx)
            .for_each(log_reconcile_result("Ingress")),
    )]
}

/// Revoke shared rules contributed by stacks that no longer exist.
///
/// An object that still carries its finalizer may still own rules; every
/// other owner is dead. Returns the number of rules revoked.
pub async fn prune_shared_rules(
    client: &dyn ObjectClient,
    shared: &SharedSecurityGroupReconciler,
    cluster: &str,
) -> Result<usize> {
    let mut live = BTreeSet::new();
    for kind in [ObjectKind::Service, ObjectKind::Ingress] {
        for (namespace, name) in client.list_finalized(kind).await? {
            live.insert(format!(
                "{}/{}",
                kind.tag_prefix(),
                StackId::new(cluster, namespace, name)
            ));
        }
    }

    let revoked = shared.prune(&live).await?;
    info!(
        live = live.len(),
        revoked,
        group = shared.group_id(),
        "Pruned shared security group"
    );
    Ok(revoked)
}

/// Create a logging callback for controller reconcile results.
fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
