//! Kubernetes client boundary for the object reconciler
//!
//! Every write the reconciler makes to a watched object goes through
//! [`ObjectClient`], so the state machine can be tested against a mock.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Service, ServiceStatus};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use lbstack_common::kube_utils::{
    add_finalizer, has_finalizer, patch_resource_status, remove_finalizer,
};
use lbstack_common::Result;
use lbstack_model::ObjectKind;

/// Reads and writes against watched objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Add this kind's finalizer to the object
    async fn add_finalizer(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()>;

    /// Remove this kind's finalizer from the object
    async fn remove_finalizer(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()>;

    /// Replace the object's load balancer status with a single hostname
    async fn patch_load_balancer_status(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        hostname: &str,
    ) -> Result<()>;

    /// Fetch a Service, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// `(namespace, name)` of every object of `kind` carrying its finalizer
    async fn list_finalized(&self, kind: ObjectKind) -> Result<BTreeSet<(String, String)>>;
}

/// [`ObjectClient`] backed by the Kubernetes API
pub struct KubeObjectClient {
    client: Client,
}

impl KubeObjectClient {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn finalized<K>(objects: Vec<K>, finalizer: &str) -> BTreeSet<(String, String)>
where
    K: kube::Resource,
{
    objects
        .into_iter()
        .filter(|o| has_finalizer(o, finalizer))
        .map(|o| (o.namespace().unwrap_or_default(), o.name_any()))
        .collect()
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn add_finalizer(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ObjectKind::Service => {
                add_finalizer::<Service>(&self.client, namespace, name, kind.finalizer()).await
            }
            ObjectKind::Ingress => {
                add_finalizer::<Ingress>(&self.client, namespace, name, kind.finalizer()).await
            }
        }
    }

    async fn remove_finalizer(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ObjectKind::Service => {
                remove_finalizer::<Service>(&self.client, namespace, name, kind.finalizer()).await
            }
            ObjectKind::Ingress => {
                remove_finalizer::<Ingress>(&self.client, namespace, name, kind.finalizer()).await
            }
        }
    }

    async fn patch_load_balancer_status(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        hostname: &str,
    ) -> Result<()> {
        match kind {
            ObjectKind::Service => {
                let status = ServiceStatus {
                    load_balancer: Some(LoadBalancerStatus {
                        ingress: Some(vec![LoadBalancerIngress {
                            hostname: Some(hostname.to_string()),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                };
                patch_resource_status::<Service>(&self.client, namespace, name, &status).await
            }
            ObjectKind::Ingress => {
                let status = IngressStatus {
                    load_balancer: Some(IngressLoadBalancerStatus {
                        ingress: Some(vec![IngressLoadBalancerIngress {
                            hostname: Some(hostname.to_string()),
                            ..Default::default()
                        }]),
                    }),
                };
                patch_resource_status::<Ingress>(&self.client, namespace, name, &status).await
            }
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_finalized(&self, kind: ObjectKind) -> Result<BTreeSet<(String, String)>> {
        let params = ListParams::default();
        let owners = match kind {
            ObjectKind::Service => {
                let api: Api<Service> = Api::all(self.client.clone());
                finalized(api.list(&params).await?.items, kind.finalizer())
            }
            ObjectKind::Ingress => {
                let api: Api<Ingress> = Api::all(self.client.clone());
                finalized(api.list(&params).await?.items, kind.finalizer())
            }
        };
        Ok(owners)
    }
}
