//! Resolution of the external inputs a build needs
//!
//! The builder never reads the cluster. Before each build the reconciler
//! resolves subnets, typed settings and backend ports into a
//! [`BuildEnvironment`] through the traits here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;

#[cfg(test)]
use mockall::automock;

use lbstack_common::{Error, Result};
use lbstack_model::intent::resolve_backend_port;
use lbstack_model::{BuildEnvironment, DesiredState, IntentObject, LoadBalancerSettings};

use crate::client::ObjectClient;

/// Typed per-object load balancer settings
pub trait SettingsResolver: Send + Sync {
    /// Settings for `object`
    fn settings_for(&self, object: &IntentObject) -> LoadBalancerSettings;
}

/// Every object gets the controller-wide defaults
pub struct DefaultSettings {
    settings: LoadBalancerSettings,
}

impl DefaultSettings {
    /// Resolver returning `settings` for every object
    pub fn new(settings: LoadBalancerSettings) -> Self {
        Self { settings }
    }
}

impl SettingsResolver for DefaultSettings {
    fn settings_for(&self, _object: &IntentObject) -> LoadBalancerSettings {
        self.settings.clone()
    }
}

/// Produces the build environment for an object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EnvironmentResolver: Send + Sync {
    /// Resolve everything `desired` needs that is not in the object itself
    async fn resolve(
        &self,
        object: &IntentObject,
        desired: &DesiredState,
    ) -> Result<BuildEnvironment>;
}

/// [`EnvironmentResolver`] reading backend Services through an [`ObjectClient`]
pub struct ClusterEnvironment {
    client: Arc<dyn ObjectClient>,
    settings: Arc<dyn SettingsResolver>,
    subnets: Vec<String>,
    shared_backend_security_group: Option<String>,
}

impl ClusterEnvironment {
    /// Resolver placing load balancers in `subnets`
    pub fn new(
        client: Arc<dyn ObjectClient>,
        settings: Arc<dyn SettingsResolver>,
        subnets: Vec<String>,
        shared_backend_security_group: Option<String>,
    ) -> Self {
        Self {
            client,
            settings,
            subnets,
            shared_backend_security_group,
        }
    }

    async fn fetch_services(
        &self,
        key: &str,
        desired: &DesiredState,
    ) -> Result<BTreeMap<String, Service>> {
        let wanted: BTreeSet<(String, String)> = desired
            .backends()
            .into_iter()
            .map(|b| (b.namespace.clone(), b.service.clone()))
            .collect();

        let mut services = BTreeMap::new();
        for (namespace, name) in wanted {
            let service = self.client.get_service(&namespace, &name).await?.ok_or_else(|| {
                Error::validation_for(key, format!("backend service {namespace}/{name} not found"))
            })?;
            services.insert(format!("{namespace}/{name}"), service);
        }
        Ok(services)
    }
}

#[async_trait]
impl EnvironmentResolver for ClusterEnvironment {
    async fn resolve(
        &self,
        object: &IntentObject,
        desired: &DesiredState,
    ) -> Result<BuildEnvironment> {
        let backends = match object {
            IntentObject::Service(_) => object.local_backends(),
            IntentObject::Ingress(_) => {
                let key = object.key();
                let services = self.fetch_services(&key, desired).await?;
                let mut backends = BTreeMap::new();
                for backend in desired.backends() {
                    let resolved = services
                        .get(&backend.service_key())
                        .and_then(|svc| resolve_backend_port(svc, &backend.port))
                        .ok_or_else(|| {
                            Error::validation_for(
                                &key,
                                format!(
                                    "backend service {} has no port {}",
                                    backend.service_key(),
                                    backend.port
                                ),
                            )
                        })?;
                    backends.insert(backend.clone(), resolved);
                }
                backends
            }
        };

        Ok(BuildEnvironment {
            subnets: self.subnets.clone(),
            backends,
            shared_backend_security_group: self.shared_backend_security_group.clone(),
            settings: self.settings.settings_for(object),
        })
    }
}
