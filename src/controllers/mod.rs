use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::*;

use crate::Metrics;

pub mod apidefinition;
pub mod backoff;
pub mod ingress;
pub mod managementcontext;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Operator wide settings, parsed from flags and environment in main
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Ingresses of this class have their TLS secrets published to the pem registry
    pub ingress_class: String,
    /// Timeout of every request to a management API
    pub apim_timeout: Duration,
    /// First delay after a retryable failure
    pub retry_base: Duration,
    /// Upper bound for retry delays
    pub retry_max: Duration,
    /// How often a synchronized ApiDefinition is checked for drift
    pub resync: Duration,
    /// Maximum number of concurrent reconciles, per controller
    pub concurrency: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            ingress_class: "apim-gateway".into(),
            apim_timeout: Duration::from_secs(5),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(300),
            resync: Duration::from_secs(600),
            concurrency: 4,
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    config: OperatorConfig,
    /// Flips to true once the operator starts shutting down
    shutdown: watch::Receiver<bool>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: OperatorConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            config,
            shutdown,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Initialize the controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Could not register metrics: {e:?}");
            std::process::exit(1);
        }
    };

    tokio::join!(
        apidefinition::run(client.clone(), metrics.clone(), state.clone()),
        ingress::run(client, metrics, state)
    );
}

/// Hash of everything a reconcile reacts to: the spec (through the generation), labels,
/// annotations, finalizers and deletion. Status only writes hash the same.
pub(crate) fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.finalizers().hash(&mut hasher);
    obj.meta()
        .deletion_timestamp
        .as_ref()
        .map(|ts| ts.0.timestamp())
        .hash(&mut hasher);
    Some(hasher.finish())
}

/// `{namespace}/{name}` of an object, used as the backoff key
pub(crate) fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}
