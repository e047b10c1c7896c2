use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ManagementContext holds the location of, and credentials for, one API management backend.
/// It can be shared by any number of ApiDefinitions.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ManagementContext",
    group = "apim.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Base URL", "type":"string", "jsonPath":".spec.baseUrl"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(shortname = "mctx")]
#[serde(rename_all = "camelCase")]
pub struct ManagementContextSpec {
    /// The URL of the management API, eg `https://apim.example.com`
    pub base_url: String,
    /// The organization in which APIs are managed. Defaults to `DEFAULT`.
    #[serde(default = "default_scope_id")]
    pub organization_id: String,
    /// The environment in which APIs are managed. Defaults to `DEFAULT`.
    #[serde(default = "default_scope_id")]
    pub environment_id: String,
    /// How to authenticate against the management API
    #[serde(default)]
    pub auth: ManagementContextAuth,
}

fn default_scope_id() -> String {
    "DEFAULT".into()
}

/// Authentication material. A bearer token takes precedence over credentials, and inline
/// values take precedence over a secret reference.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagementContextAuth {
    /// A bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// Username and password for basic authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BasicAuth>,
    /// A reference to a Secret containing either a `bearerToken` key, or `username` and `password` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// A reference to a Secret. The namespace defaults to the namespace of the ManagementContext.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    /// The name of the referenced Secret
    pub name: String,
    /// The namespace of the referenced Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

pub const SECRET_BEARER_TOKEN_KEY: &str = "bearerToken";
pub const SECRET_USERNAME_KEY: &str = "username";
pub const SECRET_PASSWORD_KEY: &str = "password";
