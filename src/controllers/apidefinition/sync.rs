use kube::runtime::events::EventType;
use tracing::*;

use crate::apim::{ApiPayload, ApiRecord, ApimClient, ApimError};
use crate::resources::apidefinitions::{ApiDefinitionStatus, ProcessingStatus};
use crate::{Error, Requeue};

/// What a successful sync did on the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The definition is not linked to a management context, so only its cross ID is recorded
    LocalOnly,
    Created(ApiRecord),
    Updated(ApiRecord),
}

/// What a successful deletion did on the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(String),
    /// Nothing on the backend carries the cross ID
    AlreadyGone,
    /// The definition was never published, or its context is gone
    NotPublished,
}

/// Converge the backend on `payload`.
///
/// The backend is always searched by cross ID first: an existing record is replaced, never
/// duplicated.
pub async fn sync_api(
    client: &dyn ApimClient,
    payload: ApiPayload,
) -> Result<SyncOutcome, ApimError> {
    match client.get_by_cross_id(&payload.cross_id).await? {
        Some(existing) => {
            debug!(id = %existing.id, cross_id = %payload.cross_id, "API exists, replacing it");
            let payload = payload.with_id(&existing.id);
            let record = client.update(&existing.id, &payload).await?;
            Ok(SyncOutcome::Updated(record))
        }
        None => {
            debug!(cross_id = %payload.cross_id, "API does not exist, creating it");
            let record = client.create(&payload).await?;
            Ok(SyncOutcome::Created(record))
        }
    }
}

/// Remove the backend record carrying `cross_id`, if there is one
pub async fn delete_api(
    client: &dyn ApimClient,
    cross_id: &str,
) -> Result<DeleteOutcome, ApimError> {
    match client.get_by_cross_id(cross_id).await? {
        Some(existing) => {
            client.delete(&existing.id).await?;
            Ok(DeleteOutcome::Deleted(existing.id))
        }
        None => Ok(DeleteOutcome::AlreadyGone),
    }
}

/// An event to attach to the reconciled object
#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    pub type_: EventType,
    pub reason: &'static str,
    pub note: String,
}

impl Notice {
    fn normal(reason: &'static str, note: String) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            note,
        }
    }

    fn warning(reason: &'static str, note: String) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            note,
        }
    }
}

/// Status, event and follow up of a sync pass
#[derive(Debug)]
pub struct SyncDecision {
    pub status: ApiDefinitionStatus,
    pub notice: Option<Notice>,
    /// The failure to retry, if the pass failed
    pub retry: Option<Error>,
}

/// Whether a pass has to announce `Reconciling` before it talks to the backend: the spec
/// changed, or a failed definition is being retried after a change elsewhere.
pub fn starts_reconciling(
    previous: Option<&ApiDefinitionStatus>,
    generation: Option<i64>,
) -> bool {
    match previous {
        Some(status) => {
            status.observed_generation != generation
                || status.processing_status == ProcessingStatus::Failed
        }
        None => true,
    }
}

/// Turn the result of a sync pass into the status to record.
///
/// The backend id of a previous pass is kept across failures, so that a definition that was
/// published once keeps pointing at its record.
pub fn resolve_sync(
    previous: Option<&ApiDefinitionStatus>,
    cross_id: &str,
    generation: Option<i64>,
    result: Result<SyncOutcome, Error>,
) -> SyncDecision {
    let previous_id = previous.and_then(|s| s.id.clone());

    match result {
        Ok(SyncOutcome::LocalOnly) => SyncDecision {
            status: ApiDefinitionStatus {
                id: None,
                cross_id: Some(cross_id.to_owned()),
                processing_status: ProcessingStatus::Completed,
                message: Some("API is not linked to a ManagementContext".into()),
                observed_generation: generation,
            },
            notice: None,
            retry: None,
        },
        Ok(SyncOutcome::Created(record)) => SyncDecision {
            notice: Some(Notice::normal(
                "Created",
                format!("Created API {} with cross ID {cross_id}", record.id),
            )),
            status: ApiDefinitionStatus {
                id: Some(record.id),
                cross_id: Some(cross_id.to_owned()),
                processing_status: ProcessingStatus::Completed,
                message: Some("API created".into()),
                observed_generation: generation,
            },
            retry: None,
        },
        Ok(SyncOutcome::Updated(record)) => SyncDecision {
            notice: Some(Notice::normal(
                "Updated",
                format!("Updated API {} with cross ID {cross_id}", record.id),
            )),
            status: ApiDefinitionStatus {
                id: Some(record.id),
                cross_id: Some(cross_id.to_owned()),
                processing_status: ProcessingStatus::Completed,
                message: Some("API updated".into()),
                observed_generation: generation,
            },
            retry: None,
        },
        Err(err) => {
            let message = err.to_string();
            let (processing_status, notice) = match err.requeue() {
                Requeue::AwaitChange => (
                    ProcessingStatus::Failed,
                    Notice::warning("Failed", message.clone()),
                ),
                Requeue::Immediately | Requeue::WithBackoff => (
                    ProcessingStatus::Reconciling,
                    Notice::warning("Reconciling", format!("Will retry: {message}")),
                ),
            };

            SyncDecision {
                status: ApiDefinitionStatus {
                    id: previous_id,
                    cross_id: Some(cross_id.to_owned()),
                    processing_status,
                    message: Some(message),
                    observed_generation: generation,
                },
                notice: Some(notice),
                retry: Some(err),
            }
        }
    }
}

/// Whether the deletion finalizer may go, and what to tell about it
#[derive(Debug)]
pub struct DeleteDecision {
    pub release_finalizer: bool,
    pub notice: Option<Notice>,
    /// The failure to retry while keeping the finalizer
    pub retry: Option<Error>,
}

/// Decide what happens to the deletion finalizer after a deletion pass.
///
/// A failure that would not go away by retrying releases the finalizer anyway: the object is
/// deleted from the cluster and the backend record, if any, is left behind.
pub fn resolve_delete(result: Result<DeleteOutcome, Error>) -> DeleteDecision {
    match result {
        Ok(DeleteOutcome::Deleted(id)) => DeleteDecision {
            release_finalizer: true,
            notice: Some(Notice::normal("Deleted", format!("Deleted API {id}"))),
            retry: None,
        },
        Ok(DeleteOutcome::AlreadyGone) => DeleteDecision {
            release_finalizer: true,
            notice: Some(Notice::normal(
                "Deleted",
                "API was already absent from the management API".into(),
            )),
            retry: None,
        },
        Ok(DeleteOutcome::NotPublished) => DeleteDecision {
            release_finalizer: true,
            notice: None,
            retry: None,
        },
        Err(err) => match err.requeue() {
            Requeue::AwaitChange => DeleteDecision {
                release_finalizer: true,
                notice: Some(Notice::warning(
                    "DeleteFailed",
                    format!("API may remain on the management API: {err}"),
                )),
                retry: None,
            },
            Requeue::Immediately | Requeue::WithBackoff => DeleteDecision {
                release_finalizer: false,
                notice: None,
                retry: Some(err),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use mockall::predicate::eq;
    use reqwest::StatusCode;

    use super::*;
    use crate::apim::{crossid, MockApimClient};
    use crate::resources::apidefinitions::{ApiDefinitionSpec, ContextReference};

    fn spec() -> ApiDefinitionSpec {
        ApiDefinitionSpec {
            name: "orders".into(),
            version: "1.0".into(),
            context_ref: Some(ContextReference {
                name: "dev".into(),
                namespace: None,
            }),
            ..Default::default()
        }
    }

    fn record(id: &str, cross_id: &str) -> ApiRecord {
        ApiRecord {
            id: id.into(),
            cross_id: Some(cross_id.into()),
            name: Some("orders".into()),
        }
    }

    fn status_error(code: u16) -> ApimError {
        ApimError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            message: "nope".into(),
        }
    }

    /// A management API keeping its records in memory, keyed by cross ID
    #[derive(Default)]
    struct FakeBackend {
        records: Mutex<HashMap<String, ApiRecord>>,
        next_id: Mutex<u32>,
        unauthorized: Mutex<bool>,
    }

    impl FakeBackend {
        fn check_auth(&self) -> Result<(), ApimError> {
            if *self.unauthorized.lock().unwrap() {
                Err(status_error(401))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ApimClient for FakeBackend {
        async fn get_by_cross_id(&self, cross_id: &str) -> Result<Option<ApiRecord>, ApimError> {
            self.check_auth()?;
            Ok(self.records.lock().unwrap().get(cross_id).cloned())
        }

        async fn create(&self, payload: &ApiPayload) -> Result<ApiRecord, ApimError> {
            self.check_auth()?;
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let record = record(&format!("api-{next_id}"), &payload.cross_id);
            self.records
                .lock()
                .unwrap()
                .insert(payload.cross_id.clone(), record.clone());
            Ok(record)
        }

        async fn update(&self, id: &str, payload: &ApiPayload) -> Result<ApiRecord, ApimError> {
            self.check_auth()?;
            assert_eq!(payload.id.as_deref(), Some(id));
            Ok(record(id, &payload.cross_id))
        }

        async fn delete(&self, id: &str) -> Result<(), ApimError> {
            self.check_auth()?;
            self.records.lock().unwrap().retain(|_, r| r.id != id);
            Ok(())
        }
    }

    async fn pass(
        client: &dyn ApimClient,
        previous: Option<&ApiDefinitionStatus>,
        cross_id: &str,
    ) -> SyncDecision {
        let payload = ApiPayload::from_spec(&spec(), cross_id, None);
        let result = sync_api(client, payload).await.map_err(Error::from);
        resolve_sync(previous, cross_id, Some(1), result)
    }

    #[tokio::test]
    async fn test_existing_cross_id_is_updated_never_created() {
        let mut client = MockApimClient::new();
        client
            .expect_get_by_cross_id()
            .with(eq("cross-1"))
            .times(1)
            .returning(|cross_id| Ok(Some(record("api-7", cross_id))));
        client
            .expect_update()
            .withf(|id, payload| id == "api-7" && payload.id.as_deref() == Some("api-7"))
            .times(1)
            .returning(|id, payload| Ok(record(id, &payload.cross_id)));
        client.expect_create().never();

        let decision = pass(&client, None, "cross-1").await;
        assert_eq!(decision.status.processing_status, ProcessingStatus::Completed);
        assert_eq!(decision.status.id.as_deref(), Some("api-7"));
        assert_eq!(decision.notice.unwrap().reason, "Updated");
        assert!(decision.retry.is_none());
    }

    #[tokio::test]
    async fn test_missing_cross_id_is_created() {
        let mut client = MockApimClient::new();
        client
            .expect_get_by_cross_id()
            .times(1)
            .returning(|_| Ok(None));
        client
            .expect_create()
            .withf(|payload| payload.id.is_none())
            .times(1)
            .returning(|payload| Ok(record("api-1", &payload.cross_id)));
        client.expect_update().never();

        let decision = pass(&client, None, "cross-1").await;
        assert_eq!(decision.status.processing_status, ProcessingStatus::Completed);
        assert_eq!(decision.status.id.as_deref(), Some("api-1"));
        assert_eq!(decision.notice.unwrap().reason, "Created");
    }

    #[tokio::test]
    async fn test_reconciling_twice_is_idempotent() {
        let backend = FakeBackend::default();
        let cross_id = crossid::cross_id_for("default", "orders", None);

        let first = pass(&backend, None, &cross_id).await;
        let second = pass(&backend, Some(&first.status), &cross_id).await;

        assert_eq!(first.status.processing_status, ProcessingStatus::Completed);
        assert_eq!(second.status.processing_status, ProcessingStatus::Completed);
        assert_eq!(first.status.id, second.status.id);
        assert_eq!(first.status.cross_id, second.status.cross_id);
        assert_eq!(backend.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_default_orders_is_published_under_derived_cross_id() {
        let backend = FakeBackend::default();
        let cross_id = crossid::cross_id_for("default", "orders", None);
        assert_eq!(cross_id, crossid::to_uuid("default/orders"));

        let decision = pass(&backend, None, &cross_id).await;

        assert_eq!(decision.status.processing_status, ProcessingStatus::Completed);
        assert_eq!(decision.status.cross_id.as_deref(), Some(cross_id.as_str()));
        let records = backend.records.lock().unwrap();
        assert_eq!(records.get(&cross_id).map(|r| r.id.as_str()), Some("api-1"));
    }

    #[tokio::test]
    async fn test_unauthorized_fails_until_context_is_fixed() {
        let backend = FakeBackend::default();
        *backend.unauthorized.lock().unwrap() = true;
        let cross_id = crossid::cross_id_for("default", "orders", None);

        let failed = pass(&backend, None, &cross_id).await;
        assert_eq!(failed.status.processing_status, ProcessingStatus::Failed);
        assert_eq!(failed.notice.as_ref().unwrap().reason, "Failed");
        assert_eq!(
            failed.retry.as_ref().map(Error::requeue),
            Some(Requeue::AwaitChange)
        );
        assert!(backend.records.lock().unwrap().is_empty());

        // the context got a valid token, which re-triggers the definition
        *backend.unauthorized.lock().unwrap() = false;
        let fixed = pass(&backend, Some(&failed.status), &cross_id).await;
        assert_eq!(fixed.status.processing_status, ProcessingStatus::Completed);
        assert_eq!(fixed.notice.unwrap().reason, "Created");
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_retried() {
        let mut client = MockApimClient::new();
        client
            .expect_get_by_cross_id()
            .returning(|_| Err(status_error(503)));

        let previous = ApiDefinitionStatus {
            id: Some("api-1".into()),
            processing_status: ProcessingStatus::Completed,
            ..Default::default()
        };
        let decision = pass(&client, Some(&previous), "cross-1").await;

        assert_eq!(
            decision.status.processing_status,
            ProcessingStatus::Reconciling
        );
        assert_eq!(decision.status.id.as_deref(), Some("api-1"));
        assert_eq!(decision.notice.unwrap().reason, "Reconciling");
        assert_eq!(
            decision.retry.as_ref().map(Error::requeue),
            Some(Requeue::WithBackoff)
        );
    }

    #[test]
    fn test_unresolved_context_is_retried() {
        let decision = resolve_sync(
            None,
            "cross-1",
            Some(1),
            Err(Error::ManagementContextNotFound("default/dev".into())),
        );
        assert_eq!(
            decision.status.processing_status,
            ProcessingStatus::Reconciling
        );
        assert!(decision
            .status
            .message
            .unwrap()
            .contains("default/dev"));
        assert_eq!(
            decision.retry.as_ref().map(Error::requeue),
            Some(Requeue::WithBackoff)
        );
    }

    #[test]
    fn test_missing_credentials_fail_until_changed() {
        for err in [
            Error::MissingCredentials("default/dev".into()),
            Error::SecretKeyNotFound("bearerToken".into(), "default/apim-auth".into()),
        ] {
            let decision = resolve_sync(None, "cross-1", Some(1), Err(err));
            assert_eq!(decision.status.processing_status, ProcessingStatus::Failed);
            assert_eq!(decision.notice.unwrap().reason, "Failed");
            assert_eq!(
                decision.retry.as_ref().map(Error::requeue),
                Some(Requeue::AwaitChange)
            );
        }
    }

    #[test]
    fn test_reconciling_is_announced_on_change_or_retry_of_failure() {
        assert!(starts_reconciling(None, Some(1)));

        let completed = ApiDefinitionStatus {
            processing_status: ProcessingStatus::Completed,
            observed_generation: Some(1),
            ..Default::default()
        };
        assert!(!starts_reconciling(Some(&completed), Some(1)));
        assert!(starts_reconciling(Some(&completed), Some(2)));

        // the context was fixed: same generation, but the failure is being retried
        let failed = ApiDefinitionStatus {
            processing_status: ProcessingStatus::Failed,
            ..completed
        };
        assert!(starts_reconciling(Some(&failed), Some(1)));
    }

    #[test]
    fn test_local_only_definitions_complete_without_backend() {
        let decision = resolve_sync(None, "cross-1", Some(3), Ok(SyncOutcome::LocalOnly));
        assert_eq!(decision.status.processing_status, ProcessingStatus::Completed);
        assert_eq!(decision.status.cross_id.as_deref(), Some("cross-1"));
        assert_eq!(decision.status.observed_generation, Some(3));
        assert!(decision.status.id.is_none());
        assert!(decision.notice.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_record_by_cross_id() {
        let backend = FakeBackend::default();
        let cross_id = crossid::cross_id_for("default", "orders", None);
        pass(&backend, None, &cross_id).await;

        let outcome = delete_api(&backend, &cross_id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted("api-1".into()));
        assert!(backend.records.lock().unwrap().is_empty());

        let again = delete_api(&backend, &cross_id).await.unwrap();
        assert_eq!(again, DeleteOutcome::AlreadyGone);
    }

    #[test]
    fn test_successful_delete_releases_finalizer() {
        let decision = resolve_delete(Ok(DeleteOutcome::Deleted("api-1".into())));
        assert!(decision.release_finalizer);
        assert_eq!(decision.notice.unwrap().reason, "Deleted");

        let decision = resolve_delete(Ok(DeleteOutcome::AlreadyGone));
        assert!(decision.release_finalizer);

        let decision = resolve_delete(Ok(DeleteOutcome::NotPublished));
        assert!(decision.release_finalizer);
        assert!(decision.notice.is_none());
    }

    #[test]
    fn test_recoverable_delete_failure_keeps_finalizer() {
        let decision = resolve_delete(Err(Error::ApimSync(status_error(503))));
        assert!(!decision.release_finalizer);
        assert!(decision.retry.is_some());

        let decision = resolve_delete(Err(Error::ApimSync(ApimError::Timeout)));
        assert!(!decision.release_finalizer);
    }

    #[tokio::test]
    async fn test_documented_policy_non_recoverable_delete_orphans_remote_api() {
        let backend = FakeBackend::default();
        let cross_id = crossid::cross_id_for("default", "orders", None);
        pass(&backend, None, &cross_id).await;

        *backend.unauthorized.lock().unwrap() = true;
        let result = delete_api(&backend, &cross_id).await.map_err(Error::from);
        let decision = resolve_delete(result);

        assert!(decision.release_finalizer);
        assert!(decision.retry.is_none());
        let notice = decision.notice.unwrap();
        assert_eq!(notice.reason, "DeleteFailed");
        assert_eq!(notice.type_, EventType::Warning);
        // the cluster object goes away, the backend record stays
        assert_eq!(backend.records.lock().unwrap().len(), 1);
    }
}
