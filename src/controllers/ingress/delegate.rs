use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::*;

use super::cluster::TlsCluster;
use super::registry::{entry_secrets, entry_value, registry_key, serves_class, INGRESS_CLASS_KEY};
use super::tls::validate_keypair;
use crate::{Error, Result};

pub static KEYPAIR_FINALIZER: &str = "finalizers.apim.io/keypair";
pub static INGRESS_FINALIZER: &str = "finalizers.apim.io/ingress";

/// The class an ingress asks for, from its spec or the legacy annotation
pub fn ingress_class(ingress: &Ingress) -> Option<&str> {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
        .or_else(|| {
            ingress
                .annotations()
                .get(INGRESS_CLASS_KEY)
                .map(String::as_str)
        })
}

pub fn is_tracked(ingress: &Ingress, class: &str) -> bool {
    ingress_class(ingress) == Some(class)
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Names of the secrets in the TLS section of an ingress, in declaration order
pub fn tls_secret_names(ingress: &Ingress) -> Vec<String> {
    let mut names: Vec<String> = vec![];
    let tls = ingress.spec.as_ref().and_then(|spec| spec.tls.as_ref());
    for stanza in tls.into_iter().flatten() {
        if let Some(name) = stanza.secret_name.as_deref().filter(|n| !n.is_empty()) {
            if !names.iter().any(|known| known == name) {
                names.push(name.to_owned());
            }
        }
    }
    names
}

/// Tracked ingresses of the same namespace that reference `secret`
pub fn ingresses_for_secret(
    ingresses: &[Arc<Ingress>],
    secret: &Secret,
    class: &str,
) -> Vec<ObjectRef<Ingress>> {
    let namespace = secret.namespace();
    let name = secret.name_any();

    ingresses
        .iter()
        .filter(|ingress| ingress.namespace() == namespace && is_tracked(ingress, class))
        .filter(|ingress| tls_secret_names(ingress).contains(&name))
        .map(|ingress| ObjectRef::from_obj(ingress.as_ref()))
        .collect()
}

/// Publish the TLS secrets of a live ingress to the pem registries of its class
pub async fn update_tls_references(
    cluster: &dyn TlsCluster,
    ingress: &Ingress,
    class: &str,
) -> Result<()> {
    let current = tls_secret_names(ingress);
    if is_deleting(ingress) || current.is_empty() {
        info!("Ingress {} has no TLS to publish", ingress.name_any());
        return delete_tls_references(cluster, ingress, class).await;
    }

    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();

    let mut secrets = Vec::with_capacity(current.len());
    for secret_name in &current {
        let secret = cluster
            .get_secret(&namespace, secret_name)
            .await?
            .ok_or_else(|| Error::SecretNotFound(format!("{namespace}/{secret_name}")))?;

        // a finalizer can't be added to a secret that is already going away
        if is_deleting(&secret) {
            return Err(Error::SecretReferenced {
                secret: format!("{namespace}/{secret_name}"),
                ingress: name,
            });
        }

        if !secret.finalizers().iter().any(|f| f == KEYPAIR_FINALIZER) {
            cluster
                .add_secret_finalizer(&secret, KEYPAIR_FINALIZER)
                .await?;
        }

        validate_keypair(&secret)?;
        secrets.push(secret);
    }

    let registries = registries_for(cluster, class).await?;
    let key = registry_key(&namespace, &name);
    let previous = previous_secrets(&registries, &key, &namespace);

    let value = entry_value(&namespace, &current);
    for registry in &registries {
        cluster
            .write_registry_entry(registry, &key, Some(&value))
            .await?;
    }
    info!(
        "Published {} TLS secret(s) of ingress {}/{} to {} pem registry(ies)",
        secrets.len(),
        namespace,
        name,
        registries.len()
    );

    let released: Vec<String> = previous
        .into_iter()
        .filter(|secret| !current.contains(secret))
        .collect();
    release_secrets(cluster, ingress, class, &released).await
}

/// Withdraw an ingress from the pem registries, releasing the secrets nobody else uses
pub async fn delete_tls_references(
    cluster: &dyn TlsCluster,
    ingress: &Ingress,
    class: &str,
) -> Result<()> {
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let key = registry_key(&namespace, &name);

    let registries = match registries_for(cluster, class).await {
        Ok(registries) => registries,
        // no gateway, nothing was published: only the secrets need releasing
        Err(Error::PemRegistryNotFound) => vec![],
        Err(err) => return Err(err),
    };

    let mut candidates = previous_secrets(&registries, &key, &namespace);
    for secret in tls_secret_names(ingress) {
        if !candidates.contains(&secret) {
            candidates.push(secret);
        }
    }
    release_secrets(cluster, ingress, class, &candidates).await?;

    for registry in &registries {
        cluster.write_registry_entry(registry, &key, None).await?;
    }
    info!("Withdrew ingress {}/{} from the pem registries", namespace, name);
    Ok(())
}

/// The registries serving `class`. Fails if the cluster has no registry at all, which only
/// publishing treats as an error.
async fn registries_for(cluster: &dyn TlsCluster, class: &str) -> Result<Vec<ConfigMap>> {
    let registries = cluster.list_registries().await?;
    if registries.is_empty() {
        return Err(Error::PemRegistryNotFound);
    }

    Ok(registries
        .into_iter()
        .filter(|registry| serves_class(registry, class))
        .collect())
}

/// Secrets listed for `key` by any registry
fn previous_secrets(registries: &[ConfigMap], key: &str, namespace: &str) -> Vec<String> {
    let mut secrets: Vec<String> = vec![];
    for registry in registries {
        for secret in entry_secrets(registry, key, namespace) {
            if !secrets.contains(&secret) {
                secrets.push(secret);
            }
        }
    }
    secrets
}

/// Remove the keypair finalizer from each candidate secret that no other live, tracked ingress
/// of the namespace references. Current ingresses are re-listed rather than counted.
async fn release_secrets(
    cluster: &dyn TlsCluster,
    ingress: &Ingress,
    class: &str,
    candidates: &[String],
) -> Result<()> {
    if candidates.is_empty() {
        return Ok(());
    }

    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let others: Vec<Ingress> = cluster
        .list_ingresses(&namespace)
        .await?
        .into_iter()
        .filter(|other| {
            other.name_any() != name && !is_deleting(other) && is_tracked(other, class)
        })
        .collect();

    for secret_name in candidates {
        if let Some(user) = others
            .iter()
            .find(|other| tls_secret_names(other).contains(secret_name))
        {
            info!(
                "Secret {}/{} is still used by ingress {}, keeping it",
                namespace,
                secret_name,
                user.name_any()
            );
            continue;
        }

        let Some(secret) = cluster.get_secret(&namespace, secret_name).await? else {
            continue;
        };
        if secret.finalizers().iter().any(|f| f == KEYPAIR_FINALIZER) {
            info!("Releasing secret {}/{}", namespace, secret_name);
            cluster
                .remove_secret_finalizer(&secret, KEYPAIR_FINALIZER)
                .await?;
        }
    }
    Ok(())
}
