use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::watcher::Config;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Resource;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use super::cluster::KubeTlsCluster;
use super::delegate::{
    delete_tls_references, ingresses_for_secret, is_tracked, update_tls_references,
    INGRESS_FINALIZER,
};
use crate::controllers::backoff::Backoff;
use crate::controllers::{changed_predicate, object_key, Diagnostics, State};
use crate::{telemetry, Error, Metrics, Result};

// Context for our reconciler
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Only ingresses of this class are published
    pub ingress_class: String,
    pub backoff: Backoff,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "apim-operator".into()),
            ingress_class: state.config.ingress_class.clone(),
            backoff: Backoff::new(state.config.retry_base, state.config.retry_max),
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, ingress), fields(trace_id))]
async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Ingress>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = ingress.namespace().expect("Ingress should be namespaced");
    let ingresses: Api<Ingress> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = KubeTlsCluster::new(ctx.client.clone());

    if !is_tracked(&ingress, &ctx.ingress_class) {
        if ingress.finalizers().iter().any(|f| f == INGRESS_FINALIZER) {
            // the ingress moved to another class, withdraw it like a deleted one
            info!("Ingress \"{}\" is no longer {}", ingress.name_any(), ctx.ingress_class);
            delete_tls_references(&cluster, &ingress, &ctx.ingress_class).await?;
            remove_finalizer(&ingresses, &ingress).await?;
        }
        ctx.backoff.reset(&object_key(ingress.as_ref()));
        return Ok(Action::await_change());
    }

    info!("Reconciling Ingress \"{}\" in {}", ingress.name_any(), namespace);
    match finalizer(&ingresses, INGRESS_FINALIZER, ingress.clone(), |event| async {
        match event {
            Finalizer::Apply(ingress) => publish(&ingress, &ctx, &cluster).await,
            Finalizer::Cleanup(ingress) => withdraw(&ingress, &ctx, &cluster).await,
        }
    })
    .await
    {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &ingress.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(ingress.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(ingress: Arc<Ingress>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.action_for(&object_key(ingress.as_ref()), error)
}

async fn publish(ingress: &Ingress, ctx: &Context, cluster: &KubeTlsCluster) -> Result<Action> {
    update_tls_references(cluster, ingress, &ctx.ingress_class).await?;
    ctx.backoff.reset(&object_key(ingress));
    // secret changes reach us through the secret watch
    Ok(Action::await_change())
}

// Finalizer cleanup (the ingress was deleted, release its secrets)
async fn withdraw(ingress: &Ingress, ctx: &Context, cluster: &KubeTlsCluster) -> Result<Action> {
    delete_tls_references(cluster, ingress, &ctx.ingress_class).await?;
    ctx.backoff.reset(&object_key(ingress));
    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!(
                    "Withdrew `{}` from the pem registries",
                    ingress.name_any()
                )),
                action: "Deleting".into(),
                secondary: None,
            },
            &ingress.object_ref(&()),
        )
        .await?;
    Ok(Action::await_change())
}

async fn remove_finalizer(ingresses: &Api<Ingress>, ingress: &Ingress) -> Result<()> {
    let finalizers: Vec<&String> = ingress
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != INGRESS_FINALIZER)
        .collect();
    let patch = Patch::Merge(json!({
        "metadata": {
            "resourceVersion": ingress.resource_version(),
            "finalizers": finalizers,
        }
    }));
    ingresses
        .patch(&ingress.name_any(), &PatchParams::default(), &patch)
        .await?;
    Ok(())
}

/// Hash of the key material and lifecycle of a secret. Finalizer changes, which we make
/// ourselves, hash the same.
fn secret_predicate(secret: &Secret) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    for (key, value) in secret.data.iter().flatten() {
        key.hash(&mut hasher);
        value.0.hash(&mut hasher);
    }
    secret
        .meta()
        .deletion_timestamp
        .as_ref()
        .map(|ts| ts.0.timestamp())
        .hash(&mut hasher);
    Some(hasher.finish())
}

/// Run the Ingress controller
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let ingresses: Api<Ingress> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());

    let cfg = Config::default();

    let (ingress_store, ingress_writer) = reflector::store();
    let ingress_reflector = reflector(ingress_writer, watcher(ingresses, cfg.clone()))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let secret_watcher = watcher(secrets, cfg.clone())
        .touched_objects()
        .default_backoff()
        .predicate_filter(secret_predicate);

    let secret_users = ingress_store.clone();
    let ingress_class = state.config.ingress_class.clone();

    let controller_config = controller::Config::default().concurrency(state.config.concurrency);

    Controller::for_stream(ingress_reflector, ingress_store)
        .with_config(controller_config)
        .shutdown_on_signal()
        .watches_stream(secret_watcher, move |secret| {
            ingresses_for_secret(&secret_users.state(), &secret, &ingress_class)
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
