//! Kubernetes helpers shared by the reconcilers: client construction,
//! finalizer bookkeeping, and status patches.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, Resource};
use serde::de::DeserializeOwned;

use crate::{Error, FIELD_MANAGER};

/// Default connect timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Check whether an object carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Finalizer list with `finalizer` appended, or `None` if already present
pub fn finalizers_with(current: Option<&[String]>, finalizer: &str) -> Option<Vec<String>> {
    let mut finalizers = current.map(<[String]>::to_vec).unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return None;
    }
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with `finalizer` removed, or `None` if it was absent
pub fn finalizers_without(current: Option<&[String]>, finalizer: &str) -> Option<Vec<String>> {
    let current = current?;
    if !current.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        current
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

/// Add a finalizer to a namespaced object via merge patch.
///
/// Reads the live object first so concurrent finalizers from other
/// controllers are preserved.
pub async fn add_finalizer<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let obj = api.get(name).await?;
    let Some(finalizers) = finalizers_with(obj.meta().finalizers.as_deref(), finalizer) else {
        return Ok(());
    };
    patch_finalizers(&api, name, finalizers).await
}

/// Remove a finalizer from a namespaced object via merge patch.
///
/// A missing object is treated as success: nothing is left to release.
pub async fn remove_finalizer<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let Some(obj) = api.get_opt(name).await? else {
        return Ok(());
    };
    let Some(finalizers) = finalizers_without(obj.meta().finalizers.as_deref(), finalizer) else {
        return Ok(());
    };
    patch_finalizers(&api, name, finalizers).await
}

async fn patch_finalizers<K>(api: &Api<K>, name: &str, finalizers: Vec<String>) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &impl serde::Serialize,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
