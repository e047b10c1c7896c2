use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::watcher::Config;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Resource;
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tracing::*;

use crate::apim::{crossid, ApiPayload};
use crate::controllers::backoff::Backoff;
use crate::controllers::managementcontext::{self, dependents, dependents_of_secret};
use crate::controllers::{changed_predicate, object_key, Diagnostics, OperatorConfig, State};
use crate::resources::apidefinitions::{
    ApiDefinition, ApiDefinitionStatus, ProcessingStatus, API_DEFINITION_FINALIZER,
};
use crate::resources::managementcontexts::ManagementContext;
use crate::{telemetry, Error, Metrics, Result};

use super::sync::{
    delete_api, resolve_delete, resolve_sync, starts_reconciling, sync_api, DeleteOutcome, Notice,
    SyncOutcome,
};

// Context for our reconciler
pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Shared by the management API clients of every context
    pub http: reqwest::Client,
    pub config: OperatorConfig,
    pub backoff: Backoff,
    pub shutdown: watch::Receiver<bool>,
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
            http: reqwest::Client::new(),
            backoff: Backoff::new(state.config.retry_base, state.config.retry_max),
            config: state.config,
            shutdown: state.shutdown,
            diagnostics: state.diagnostics.clone(),
            metrics,
        })
    }
}

#[instrument(skip(ctx, api), fields(trace_id))]
async fn reconcile(api: Arc<ApiDefinition>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<ApiDefinition>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = api
        .namespace()
        .expect("ApiDefinition should be namespaced");
    let apis: Api<ApiDefinition> = Api::namespaced(ctx.client.clone(), &namespace);

    info!("Reconciling ApiDefinition \"{}\" in {}", api.name_any(), namespace);
    match finalizer(&apis, API_DEFINITION_FINALIZER, api.clone(), |event| async {
        match event {
            Finalizer::Apply(api) => api.reconcile(ctx.clone(), &apis).await,
            Finalizer::Cleanup(api) => api.cleanup(ctx.clone()).await,
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
                    &api.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(api.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(api: Arc<ApiDefinition>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.backoff.action_for(&object_key(api.as_ref()), error)
}

impl ApiDefinition {
    fn cross_id(&self) -> String {
        crossid::cross_id_for(
            &self.namespace().unwrap_or_default(),
            &self.name_any(),
            self.spec.cross_id.as_deref(),
        )
    }

    /// Resolve the context and converge the backend on this definition
    async fn sync(&self, ctx: &Context, cross_id: &str) -> Result<SyncOutcome> {
        let Some(context) = managementcontext::resolve_context(&ctx.client, self).await? else {
            return Ok(SyncOutcome::LocalOnly);
        };
        let credentials = managementcontext::resolve_credentials(&ctx.client, &context).await?;
        let client = managementcontext::api_client(
            &context,
            credentials,
            ctx.http.clone(),
            ctx.config.apim_timeout,
            ctx.shutdown.clone(),
        )?;

        let payload = ApiPayload::from_spec(&self.spec, cross_id, None);
        let outcome = sync_api(&client, payload).await;
        ctx.metrics.sync_request(
            "sync",
            outcome.as_ref().map(|_| ()).map_err(|err| err.metric_label()),
        );
        Ok(outcome?)
    }

    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>, apis: &Api<ApiDefinition>) -> Result<Action> {
        let name = self.name_any();
        let key = object_key(self);
        let cross_id = self.cross_id();
        let generation = self.meta().generation;
        let mut resource_version = self.resource_version();

        let previous = self.status.as_ref();
        if starts_reconciling(previous, generation) {
            let status = ApiDefinitionStatus {
                id: previous.and_then(|s| s.id.clone()),
                cross_id: Some(cross_id.clone()),
                processing_status: ProcessingStatus::Reconciling,
                message: None,
                observed_generation: previous.and_then(|s| s.observed_generation),
            };
            let patched = patch_status(apis, &name, resource_version.as_deref(), &status).await?;
            resource_version = patched.resource_version();
        }

        let result = self.sync(&ctx, &cross_id).await;
        let decision = resolve_sync(previous, &cross_id, generation, result);

        patch_status(apis, &name, resource_version.as_deref(), &decision.status).await?;
        if let Some(notice) = &decision.notice {
            self.publish(&ctx, notice).await?;
        }

        match decision.retry {
            Some(err) => {
                warn!("ApiDefinition {} failed to sync: {}", key, err);
                ctx.metrics.reconcile_failure(self, &err);
                Ok(ctx.backoff.action_for(&key, &err))
            }
            None => {
                ctx.backoff.reset(&key);
                // If no events were received, check back for drift on the backend
                Ok(Action::requeue(ctx.config.resync))
            }
        }
    }

    async fn delete(&self, ctx: &Context) -> Result<DeleteOutcome> {
        let context = match managementcontext::resolve_context(&ctx.client, self).await {
            Ok(Some(context)) => context,
            Ok(None) | Err(Error::ManagementContextNotFound(_)) => {
                return Ok(DeleteOutcome::NotPublished)
            }
            Err(err) => return Err(err),
        };
        let credentials = managementcontext::resolve_credentials(&ctx.client, &context).await?;
        let client = managementcontext::api_client(
            &context,
            credentials,
            ctx.http.clone(),
            ctx.config.apim_timeout,
            ctx.shutdown.clone(),
        )?;

        let outcome = delete_api(&client, &self.cross_id()).await;
        ctx.metrics.sync_request(
            "delete",
            outcome.as_ref().map(|_| ()).map_err(|err| err.metric_label()),
        );
        Ok(outcome?)
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let key = object_key(self);
        let decision = resolve_delete(self.delete(&ctx).await);

        if let Some(notice) = &decision.notice {
            self.publish(&ctx, notice).await?;
        }

        match decision.retry {
            // keeps the finalizer; error_policy schedules the next attempt
            Some(err) => Err(err),
            None => {
                ctx.backoff.reset(&key);
                Ok(Action::await_change())
            }
        }
    }

    async fn publish(&self, ctx: &Context, notice: &Notice) -> Result<()> {
        ctx.recorder
            .publish(
                &Event {
                    type_: notice.type_,
                    reason: notice.reason.into(),
                    note: Some(notice.note.clone()),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await?;
        Ok(())
    }
}

/// Write the status, failing with a conflict if the object changed since `resource_version`
async fn patch_status(
    apis: &Api<ApiDefinition>,
    name: &str,
    resource_version: Option<&str>,
    status: &ApiDefinitionStatus,
) -> Result<ApiDefinition> {
    // unset fields are written as null so that the merge clears them
    let patch = Patch::Merge(json!({
        "metadata": {
            "resourceVersion": resource_version,
        },
        "status": {
            "id": status.id,
            "crossId": status.cross_id,
            "processingStatus": status.processing_status,
            "message": status.message,
            "observedGeneration": status.observed_generation,
        },
    }));
    debug!("Updating status of ApiDefinition {} to {}", name, status.processing_status);
    Ok(apis
        .patch_status(name, &PatchParams::default(), &patch)
        .await?)
}

/// Run the ApiDefinition controller
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let apis: Api<ApiDefinition> = Api::all(client.clone());
    let contexts: Api<ManagementContext> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());

    if let Err(e) = apis.list(&ListParams::default().limit(1)).await {
        error!("ApiDefinition is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    if let Err(e) = contexts.list(&ListParams::default().limit(1)).await {
        error!("ManagementContext is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let cfg = Config::default();

    // status only writes must not trigger another pass
    let (api_store, api_writer) = reflector::store();
    let api_reflector = reflector(api_writer, watcher(apis, cfg.clone()))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let (context_store, context_writer) = reflector::store();
    let context_reflector = reflector(context_writer, watcher(contexts, cfg.clone()))
        .touched_objects()
        .default_backoff()
        .predicate_filter(changed_predicate);

    let secret_watcher = watcher(secrets, cfg.clone())
        .touched_objects()
        .default_backoff();

    let context_dependents = api_store.clone();
    let secret_dependents = api_store.clone();
    let secret_contexts = context_store.clone();

    let controller_config = controller::Config::default().concurrency(state.config.concurrency);

    Controller::for_stream(api_reflector, api_store)
        .with_config(controller_config)
        .shutdown_on_signal()
        .watches_stream(context_reflector, move |context| {
            dependents(&context_dependents.state(), &context)
        })
        .watches_stream(secret_watcher, move |secret| {
            dependents_of_secret(
                &secret_dependents.state(),
                &secret_contexts.state(),
                &secret,
            )
        })
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
