use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::apidefinitions::{
    ApiDefinitionSpec, ApiState, LifecycleState, Visibility,
};

/// The body sent to the management API when creating or replacing an API
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub cross_id: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub state: ApiState,
    #[serde(rename = "lifecycle_state")]
    pub lifecycle_state: LifecycleState,
    pub visibility: Visibility,
    pub tags: Vec<String>,
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plans: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flows: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_owner: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(rename = "response_templates", skip_serializing_if = "Option::is_none")]
    pub response_templates: Option<serde_json::Value>,
    #[serde(rename = "definition_context")]
    pub definition_context: DefinitionContext,
}

/// Marks an API as owned by the operator, which keeps it read-only in the management console
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DefinitionContext {
    pub origin: &'static str,
    pub mode: &'static str,
}

impl DefinitionContext {
    pub const KUBERNETES: DefinitionContext = DefinitionContext {
        origin: "kubernetes",
        mode: "fully_managed",
    };
}

impl ApiPayload {
    pub fn from_spec(spec: &ApiDefinitionSpec, cross_id: &str, id: Option<&str>) -> Self {
        Self {
            id: id.map(str::to_owned),
            cross_id: cross_id.to_owned(),
            name: spec.name.clone(),
            version: spec.version.clone(),
            description: spec.description.clone(),
            state: spec.state,
            lifecycle_state: spec.lifecycle_state,
            visibility: spec.visibility,
            tags: spec.tags.clone(),
            labels: spec.labels.clone(),
            proxy: spec.proxy.clone(),
            plans: spec.plans.clone(),
            flows: spec.flows.clone(),
            resources: spec.resources.clone(),
            properties: spec.properties.clone(),
            primary_owner: spec.primary_owner.clone(),
            metadata: spec.metadata.clone(),
            response_templates: spec.response_templates.clone(),
            definition_context: DefinitionContext::KUBERNETES,
        }
    }

    /// The same payload, addressed to an existing record
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_owned());
        self
    }
}

/// The subset of a backend API record that the operator relies on
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecord {
    pub id: String,
    #[serde(default)]
    pub cross_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Credentials resolved from a ManagementContext
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

// never print secrets, even at debug level
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;
    use crate::resources::apidefinitions::ContextReference;

    fn spec() -> ApiDefinitionSpec {
        ApiDefinitionSpec {
            name: "orders".into(),
            version: "1.0".into(),
            description: Some("Order API".into()),
            context_ref: Some(ContextReference {
                name: "dev".into(),
                namespace: None,
            }),
            tags: vec!["shop".into()],
            proxy: Some(json!({"virtual_hosts": [{"path": "/orders"}]})),
            primary_owner: Some(json!({"id": "admin", "type": "USER"})),
            metadata: Some(json!([{"key": "team", "name": "team", "format": "STRING", "value": "shop"}])),
            response_templates: Some(json!({
                "API_KEY_MISSING": {"*/*": {"status": 400, "body": "{\"error\": \"no key\"}"}}
            })),
            ..Default::default()
        }
    }

    #[test]
    fn test_payload_mirrors_spec_without_context() {
        let payload = ApiPayload::from_spec(&spec(), "cross-1", None);
        assert_json_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "crossId": "cross-1",
                "name": "orders",
                "version": "1.0",
                "description": "Order API",
                "state": "STARTED",
                "lifecycle_state": "CREATED",
                "visibility": "PRIVATE",
                "tags": ["shop"],
                "labels": [],
                "proxy": {"virtual_hosts": [{"path": "/orders"}]},
                "primaryOwner": {"id": "admin", "type": "USER"},
                "metadata": [{"key": "team", "name": "team", "format": "STRING", "value": "shop"}],
                "response_templates": {
                    "API_KEY_MISSING": {"*/*": {"status": 400, "body": "{\"error\": \"no key\"}"}}
                },
                "definition_context": {"origin": "kubernetes", "mode": "fully_managed"},
            })
        );
    }

    #[test]
    fn test_updates_keep_the_definition_context() {
        let payload = ApiPayload::from_spec(&ApiDefinitionSpec::default(), "cross-1", None)
            .with_id("api-1");
        assert_json_eq!(
            serde_json::to_value(&payload).unwrap()["definition_context"],
            json!({"origin": "kubernetes", "mode": "fully_managed"})
        );
    }

    #[test]
    fn test_payload_carries_known_id() {
        let payload = ApiPayload::from_spec(&spec(), "cross-1", None).with_id("api-1");
        assert_eq!(payload.id.as_deref(), Some("api-1"));
        assert_eq!(
            serde_json::to_value(&payload).unwrap()["id"],
            json!("api-1")
        );
    }

    #[test]
    fn test_record_tolerates_extra_fields() {
        let record: ApiRecord = serde_json::from_value(json!({
            "id": "api-1",
            "crossId": "cross-1",
            "name": "orders",
            "visibility": "PUBLIC",
            "owner": {"id": "admin"},
        }))
        .unwrap();
        assert_eq!(record.id, "api-1");
        assert_eq!(record.cross_id.as_deref(), Some("cross-1"));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let bearer = format!("{:?}", Credentials::Bearer("s3cr3t".into()));
        assert!(!bearer.contains("s3cr3t"));

        let basic = format!(
            "{:?}",
            Credentials::Basic {
                username: "admin".into(),
                password: "s3cr3t".into()
            }
        );
        assert!(basic.contains("admin"));
        assert!(!basic.contains("s3cr3t"));
    }
}
