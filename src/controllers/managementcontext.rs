//! Resolution of the ManagementContext referenced by an ApiDefinition, and the reverse mapping
//! used to re-trigger dependent ApiDefinitions when a context or its credentials change.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio::sync::watch;
use tracing::*;

use crate::apim::{ApimHttpClient, Credentials};
use crate::resources::apidefinitions::ApiDefinition;
use crate::resources::managementcontexts::{
    ManagementContext, SECRET_BEARER_TOKEN_KEY, SECRET_PASSWORD_KEY, SECRET_USERNAME_KEY,
};
use crate::{Error, Result};

/// The ManagementContext referenced by `api`, if it references one
pub async fn resolve_context(
    client: &Client,
    api: &ApiDefinition,
) -> Result<Option<ManagementContext>> {
    let Some((namespace, name)) = context_key(api) else {
        return Ok(None);
    };

    let contexts: Api<ManagementContext> = Api::namespaced(client.clone(), &namespace);
    match contexts.get_opt(&name).await? {
        Some(context) => Ok(Some(context)),
        None => Err(Error::ManagementContextNotFound(format!(
            "{namespace}/{name}"
        ))),
    }
}

/// Credentials of a context, reading the referenced Secret when the context has no inline material
pub async fn resolve_credentials(
    client: &Client,
    context: &ManagementContext,
) -> Result<Credentials> {
    if let Some(credentials) = inline_credentials(context) {
        return Ok(credentials);
    }

    let Some((namespace, name)) = secret_key(context) else {
        return Err(Error::MissingCredentials(context_name(context)));
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = secrets
        .get_opt(&name)
        .await?
        .ok_or_else(|| Error::SecretNotFound(format!("{namespace}/{name}")))?;

    credentials_from_secret(&secret)
}

/// A management API client for `context`
pub fn api_client(
    context: &ManagementContext,
    credentials: Credentials,
    http: reqwest::Client,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<ApimHttpClient> {
    Ok(ApimHttpClient::new(
        http,
        &context.spec.base_url,
        &context.spec.organization_id,
        &context.spec.environment_id,
        credentials,
        timeout,
        shutdown,
    )?)
}

fn inline_credentials(context: &ManagementContext) -> Option<Credentials> {
    let auth = &context.spec.auth;
    if let Some(token) = auth.bearer_token.as_deref().map(str::trim) {
        if !token.is_empty() {
            return Some(Credentials::Bearer(token.to_owned()));
        }
    }

    auth.credentials.as_ref().map(|basic| Credentials::Basic {
        username: basic.username.clone(),
        password: basic.password.clone(),
    })
}

fn credentials_from_secret(secret: &Secret) -> Result<Credentials> {
    let name = format!(
        "{}/{}",
        secret.namespace().unwrap_or_default(),
        secret.name_any()
    );

    if let Some(token) = secret_value(secret, SECRET_BEARER_TOKEN_KEY)? {
        return Ok(Credentials::Bearer(token));
    }

    let username = secret_value(secret, SECRET_USERNAME_KEY)?;
    let password = secret_value(secret, SECRET_PASSWORD_KEY)?;
    match (username, password) {
        (Some(username), Some(password)) => Ok(Credentials::Basic { username, password }),
        (Some(_), None) => Err(Error::SecretKeyNotFound(SECRET_PASSWORD_KEY.into(), name)),
        (None, _) => Err(Error::SecretKeyNotFound(
            SECRET_BEARER_TOKEN_KEY.into(),
            name,
        )),
    }
}

/// A trimmed, non-empty value of the secret, from `data` or `stringData`
fn secret_value(secret: &Secret, key: &str) -> Result<Option<String>> {
    let value = match secret.data.as_ref().and_then(|data| data.get(key)) {
        Some(bytes) => String::from_utf8(bytes.0.clone()).map_err(|_| {
            Error::InvalidCredentials(format!(
                "{}/{}",
                secret.namespace().unwrap_or_default(),
                secret.name_any()
            ))
        })?,
        None => match secret.string_data.as_ref().and_then(|data| data.get(key)) {
            Some(value) => value.clone(),
            None => return Ok(None),
        },
    };

    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_owned()))
}

fn context_name(context: &ManagementContext) -> String {
    format!(
        "{}/{}",
        context.namespace().unwrap_or_default(),
        context.name_any()
    )
}

/// `(namespace, name)` of the context an ApiDefinition points at
pub fn context_key(api: &ApiDefinition) -> Option<(String, String)> {
    let reference = api.spec.context_ref.as_ref()?;
    let namespace = api.namespace().unwrap_or_default();
    Some((
        reference.namespace_or(&namespace).to_owned(),
        reference.name.clone(),
    ))
}

/// `(namespace, name)` of the Secret a context reads its credentials from
pub fn secret_key(context: &ManagementContext) -> Option<(String, String)> {
    let reference = context.spec.auth.secret_ref.as_ref()?;
    let namespace = match reference.namespace.as_deref() {
        Some("") | None => context.namespace().unwrap_or_default(),
        Some(ns) => ns.to_owned(),
    };
    Some((namespace, reference.name.clone()))
}

/// Every ApiDefinition whose context reference resolves to `context`
pub fn dependents(
    apis: &[Arc<ApiDefinition>],
    context: &ManagementContext,
) -> Vec<ObjectRef<ApiDefinition>> {
    let key = (
        context.namespace().unwrap_or_default(),
        context.name_any(),
    );

    apis.iter()
        .filter(|api| context_key(api).as_ref() == Some(&key))
        .map(|api| ObjectRef::from_obj(api.as_ref()))
        .collect()
}

/// Every ApiDefinition that depends, through its context, on the credentials in `secret`
pub fn dependents_of_secret(
    apis: &[Arc<ApiDefinition>],
    contexts: &[Arc<ManagementContext>],
    secret: &Secret,
) -> Vec<ObjectRef<ApiDefinition>> {
    let key = (secret.namespace().unwrap_or_default(), secret.name_any());

    let refs: Vec<_> = contexts
        .iter()
        .filter(|context| secret_key(context).as_ref() == Some(&key))
        .flat_map(|context| dependents(apis, context))
        .collect();

    if !refs.is_empty() {
        debug!(
            secret = %secret.name_any(),
            count = refs.len(),
            "Credentials changed, re-triggering dependent ApiDefinitions"
        );
    }

    refs
}
