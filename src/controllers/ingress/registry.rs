//! The pem registry: ConfigMaps read by the gateway, listing per ingress the TLS secrets it
//! has to load. Entries are keyed `{namespace}-{ingress}` and hold a JSON array of
//! `{namespace}/{secret}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

pub const COMPONENT_LABEL: &str = "apim.io/component";
pub const PEM_REGISTRY_COMPONENT: &str = "pem-registry";
pub const INGRESS_CLASS_KEY: &str = "kubernetes.io/ingress.class";
pub const UPDATE_TIMESTAMP_ANNOTATION: &str = "updateTimestamp";

/// Label selector of every pem registry in the cluster
pub fn registry_selector() -> String {
    format!("{COMPONENT_LABEL}={PEM_REGISTRY_COMPONENT}")
}

pub fn registry_key(namespace: &str, ingress: &str) -> String {
    format!("{namespace}-{ingress}")
}

/// Whether the gateway reading `registry` serves ingresses of `class`
pub fn serves_class(registry: &ConfigMap, class: &str) -> bool {
    registry.labels().get(INGRESS_CLASS_KEY).map(String::as_str) == Some(class)
}

/// The entry value for `secrets`, in the order given
pub fn entry_value(namespace: &str, secrets: &[String]) -> String {
    let refs: Vec<String> = secrets
        .iter()
        .map(|secret| format!("{namespace}/{secret}"))
        .collect();
    serde_json::Value::from(refs).to_string()
}

/// Names of the secrets of `namespace` listed under `key`. Unreadable entries list nothing.
pub fn entry_secrets(registry: &ConfigMap, key: &str, namespace: &str) -> Vec<String> {
    let Some(value) = registry.data.as_ref().and_then(|data| data.get(key)) else {
        return vec![];
    };

    let prefix = format!("{namespace}/");
    serde_json::from_str::<Vec<String>>(value)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|reference| reference.strip_prefix(&prefix).map(str::to_owned))
        .collect()
}

/// Set (`Some`) or remove (`None`) the entry under `key`, bumping the update timestamp so that
/// the gateway reloads its trust store
pub fn set_entry(registry: &mut ConfigMap, key: &str, value: Option<&str>, now: DateTime<Utc>) {
    registry
        .annotations_mut()
        .insert(UPDATE_TIMESTAMP_ANNOTATION.into(), timestamp(now));

    match value {
        Some(value) => {
            registry
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(key.into(), value.into());
        }
        None => {
            if let Some(data) = registry.data.as_mut() {
                data.remove(key);
            }
        }
    }
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use kube::api::ObjectMeta;

    use super::*;

    fn registry(class: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("gateway-pem-registry".into()),
                namespace: Some("apim".into()),
                labels: Some(BTreeMap::from([
                    (COMPONENT_LABEL.to_string(), PEM_REGISTRY_COMPONENT.to_string()),
                    (INGRESS_CLASS_KEY.to_string(), class.to_string()),
                ])),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(timestamp(now()), "2024-03-09T07:05:01Z");
    }

    #[test]
    fn test_entry_value_keeps_stanza_order() {
        assert_eq!(
            entry_value("default", &["shop-tls".into(), "api-tls".into()]),
            r#"["default/shop-tls","default/api-tls"]"#
        );
        assert_eq!(entry_value("default", &[]), "[]");
    }

    #[test]
    fn test_set_entry_bumps_timestamp() {
        let mut cm = registry("apim-gateway", &[]);
        set_entry(
            &mut cm,
            "default-shop",
            Some(r#"["default/shop-tls"]"#),
            now(),
        );

        assert_eq!(
            cm.data.as_ref().unwrap().get("default-shop").unwrap(),
            r#"["default/shop-tls"]"#
        );
        assert_eq!(
            cm.annotations().get(UPDATE_TIMESTAMP_ANNOTATION).unwrap(),
            "2024-03-09T07:05:01Z"
        );
    }

    #[test]
    fn test_remove_entry_keeps_others() {
        let mut cm = registry(
            "apim-gateway",
            &[
                ("default-shop", r#"["default/shop-tls"]"#),
                ("default-blog", r#"["default/blog-tls"]"#),
            ],
        );
        set_entry(&mut cm, "default-shop", None, now());

        let data = cm.data.as_ref().unwrap();
        assert!(!data.contains_key("default-shop"));
        assert!(data.contains_key("default-blog"));
        assert!(cm.annotations().contains_key(UPDATE_TIMESTAMP_ANNOTATION));
    }

    #[test]
    fn test_remove_from_empty_registry() {
        let mut cm = registry("apim-gateway", &[]);
        cm.data = None;
        set_entry(&mut cm, "default-shop", None, now());
        assert!(cm.data.is_none());
    }

    #[test]
    fn test_entry_secrets() {
        let cm = registry(
            "apim-gateway",
            &[
                ("default-shop", r#"["default/shop-tls","other/foreign-tls","default/api-tls"]"#),
                ("default-broken", "not json"),
            ],
        );
        assert_eq!(
            entry_secrets(&cm, "default-shop", "default"),
            vec!["shop-tls".to_string(), "api-tls".to_string()]
        );
        assert!(entry_secrets(&cm, "default-broken", "default").is_empty());
        assert!(entry_secrets(&cm, "default-missing", "default").is_empty());
    }

    #[test]
    fn test_serves_class() {
        assert!(serves_class(&registry("apim-gateway", &[]), "apim-gateway"));
        assert!(!serves_class(&registry("nginx", &[]), "apim-gateway"));
    }

    #[test]
    fn test_registry_key_and_selector() {
        assert_eq!(registry_key("default", "shop"), "default-shop");
        assert_eq!(registry_selector(), "apim.io/component=pem-registry");
    }
}
