use std::fmt;

use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub static API_DEFINITION_FINALIZER: &str = "finalizers.apim.io/apidefinition-deletion";

/// ApiDefinition declares an API that the operator publishes to an API management backend.
/// The definition is correlated with its backend counterpart through a cross ID, which is
/// derived from the namespace and name of the resource unless pinned explicitly.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "ApiDefinition",
    group = "apim.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Name", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.processingStatus"}"#,
    printcolumn = r#"{"name":"Cross ID", "type":"string", "jsonPath":".status.crossId", "priority": 1}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ApiDefinitionStatus", shortname = "apidef")]
#[serde(rename_all = "camelCase")]
pub struct ApiDefinitionSpec {
    /// API name
    pub name: String,
    /// API version
    pub version: String,
    /// API description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When promoting an API from one environment to another, this ID identifies the API across
    /// those environments. Setting it also allows taking control of an API that already exists on
    /// the backend. If empty, a UUID is derived from the namespace and name of the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_id: Option<String>,
    /// A reference to the ManagementContext used to publish this API. If unset, the API is only
    /// tracked locally and never sent to a management backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<ContextReference>,
    /// The state of the API. Setting it to STOPPED makes the API unreachable from the gateway.
    #[serde(default)]
    pub state: ApiState,
    /// The lifecycle state of the API.
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    /// Whether the API is publicly visible on the portal.
    #[serde(default)]
    pub visibility: Visibility,
    /// Tags of the API
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Labels of the API
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Proxy configuration (virtual hosts, endpoint groups). Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub proxy: Option<serde_json::Value>,
    /// Plans of the API. Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub plans: Option<serde_json::Value>,
    /// Flows and policies of the API. Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub flows: Option<serde_json::Value>,
    /// Resources used by the API policies. Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub resources: Option<serde_json::Value>,
    /// API properties. Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub properties: Option<serde_json::Value>,
    /// The member owning the API on the backend. Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub primary_owner: Option<serde_json::Value>,
    /// Metadata entries of the API. Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub metadata: Option<serde_json::Value>,
    /// Gateway responses per error key and media type. Passed through to the backend unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub response_templates: Option<serde_json::Value>,
}

fn preserve_unknown_fields(_g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .unwrap()
}

/// A reference to a ManagementContext. The namespace defaults to the namespace of the referencing resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ContextReference {
    /// The name of the referenced ManagementContext
    pub name: String,
    /// The namespace of the referenced ManagementContext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ContextReference {
    /// Namespace of the referenced context, falling back to the namespace of the referencing object
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some("") | None => default,
            Some(ns) => ns,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiState {
    #[default]
    Started,
    Stopped,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Created,
    Published,
    Unpublished,
    Deprecated,
    Archived,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

/// Where the operator is in bringing the backend in line with this definition.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ProcessingStatus {
    /// The definition is being synchronized, or a retryable failure occurred
    #[default]
    Reconciling,
    /// The backend holds the desired definition
    Completed,
    /// A failure occurred that will not be retried until the definition or its context changes
    Failed,
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingStatus::Reconciling => f.write_str("Reconciling"),
            ProcessingStatus::Completed => f.write_str("Completed"),
            ProcessingStatus::Failed => f.write_str("Failed"),
        }
    }
}

/// Status of the ApiDefinition.
/// This is set and managed automatically.
/// Read-only.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiDefinitionStatus {
    /// The ID assigned to the API by the management backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The cross ID used to correlate this resource with the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_id: Option<String>,
    pub processing_status: ProcessingStatus,
    /// Human-readable details about the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The generation of the spec that was last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
