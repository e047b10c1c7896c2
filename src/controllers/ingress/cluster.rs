use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt};
use kube::client::Client;
use serde_json::json;
use tracing::*;

use super::registry::{registry_selector, set_entry};
use crate::{Error, Result};

/// Attempts at writing one pem registry before giving up on conflicts
const MAX_REGISTRY_ATTEMPTS: usize = 5;

/// The cluster objects the TLS delegate reads and writes
#[async_trait]
pub trait TlsCluster: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Add `finalizer` to the secret, failing on a conflict if it changed since it was read
    async fn add_secret_finalizer(&self, secret: &Secret, finalizer: &str) -> Result<()>;

    /// Remove `finalizer` from the secret, failing on a conflict if it changed since it was read
    async fn remove_secret_finalizer(&self, secret: &Secret, finalizer: &str) -> Result<()>;

    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>>;

    /// Every pem registry in the cluster, whatever its ingress class
    async fn list_registries(&self) -> Result<Vec<ConfigMap>>;

    /// Set or remove one entry of `registry`, re-reading it as often as concurrent writers require
    async fn write_registry_entry(
        &self,
        registry: &ConfigMap,
        key: &str,
        value: Option<&str>,
    ) -> Result<()>;
}

/// [`TlsCluster`] against the Kubernetes API
#[derive(Clone)]
pub struct KubeTlsCluster {
    client: Client,
}

impl KubeTlsCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_secret_finalizers(&self, secret: &Secret, finalizers: Vec<String>) -> Result<()> {
        let secrets: Api<Secret> =
            Api::namespaced(self.client.clone(), &secret.namespace().unwrap_or_default());
        let patch = Patch::Merge(json!({
            "metadata": {
                "resourceVersion": secret.resource_version(),
                "finalizers": finalizers,
            }
        }));
        secrets
            .patch(&secret.name_any(), &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TlsCluster for KubeTlsCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?)
    }

    async fn add_secret_finalizer(&self, secret: &Secret, finalizer: &str) -> Result<()> {
        debug!("Adding finalizer to secret {}", secret.name_any());
        let mut finalizers = secret.finalizers().to_vec();
        finalizers.push(finalizer.into());
        self.patch_secret_finalizers(secret, finalizers).await
    }

    async fn remove_secret_finalizer(&self, secret: &Secret, finalizer: &str) -> Result<()> {
        debug!("Removing finalizer from secret {}", secret.name_any());
        let finalizers = secret
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        self.patch_secret_finalizers(secret, finalizers).await
    }

    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>> {
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(ingresses.list(&ListParams::default()).await?.items)
    }

    async fn list_registries(&self) -> Result<Vec<ConfigMap>> {
        let configmaps: Api<ConfigMap> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&registry_selector());
        Ok(configmaps.list(&lp).await?.items)
    }

    async fn write_registry_entry(
        &self,
        registry: &ConfigMap,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let configmaps: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &registry.namespace().unwrap_or_default());
        write_entry(&configmaps, registry, key, value).await
    }
}

/// Where registry ConfigMaps are read from and conditionally replaced
#[async_trait]
trait RegistryStore: Send + Sync {
    async fn get(&self, name: &str) -> kube::Result<ConfigMap>;

    /// Replace the ConfigMap, failing with a 409 if its resourceVersion is stale
    async fn replace(&self, registry: &ConfigMap) -> kube::Result<ConfigMap>;
}

#[async_trait]
impl RegistryStore for Api<ConfigMap> {
    async fn get(&self, name: &str) -> kube::Result<ConfigMap> {
        Api::get(self, name).await
    }

    async fn replace(&self, registry: &ConfigMap) -> kube::Result<ConfigMap> {
        Api::replace(self, &registry.name_any(), &PostParams::default(), registry).await
    }
}

/// Read-modify-replace of one registry entry, re-reading the registry after each conflict
async fn write_entry(
    store: &dyn RegistryStore,
    registry: &ConfigMap,
    key: &str,
    value: Option<&str>,
) -> Result<()> {
    let name = registry.name_any();

    let mut current = registry.clone();
    for attempt in 1..=MAX_REGISTRY_ATTEMPTS {
        set_entry(&mut current, key, value, Utc::now());

        match store.replace(&current).await {
            Ok(_) => {
                debug!("Updated pem registry {} entry {}", name, key);
                return Ok(());
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!(
                    "Conflict writing pem registry {} (attempt {}), re-reading it",
                    name, attempt
                );
                current = store.get(&name).await?;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(Error::RegistryConflict(name))
}
