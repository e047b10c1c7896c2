use thiserror::Error;

use crate::apim::{ApimError, ErrorClass};
use crate::controllers::ingress::InvalidTlsSecret;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("The ManagementContext {0} does not exist")]
    ManagementContextNotFound(String),

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),

    #[error("The Secret key {0} in {1} does not exist")]
    SecretKeyNotFound(String, String),

    #[error("The ManagementContext {0} has no credentials")]
    MissingCredentials(String),

    #[error("The credentials in Secret {0} are not valid UTF-8")]
    InvalidCredentials(String),

    #[error("Failed to synchronize with the management API: {0}")]
    ApimSync(#[from] ApimError),

    #[error(transparent)]
    InvalidTlsSecret(#[from] InvalidTlsSecret),

    #[error("secret {secret} can't be deleted because it has reference to an existing ingress [{ingress}]")]
    SecretReferenced { secret: String, ingress: String },

    #[error("unable to find any pem-registry configmap in the cluster")]
    PemRegistryNotFound,

    #[error("Gave up updating pem-registry configmap {0} after repeated conflicts")]
    RegistryConflict(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the controller should follow up on a failed reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Someone else wrote the object first; re-read it right away
    Immediately,
    /// Retry later with exponential backoff
    WithBackoff,
    /// Only a change to a watched object will help
    AwaitChange,
}

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::ManagementContextNotFound(_) => "ManagementContextNotFound",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::SecretKeyNotFound(_, _) => "SecretKeyNotFound",
            Error::MissingCredentials(_) => "MissingCredentials",
            Error::InvalidCredentials(_) => "InvalidCredentials",
            Error::ApimSync(_) => "ApimSync",
            Error::InvalidTlsSecret(_) => "InvalidTlsSecret",
            Error::SecretReferenced { .. } => "SecretReferenced",
            Error::PemRegistryNotFound => "PemRegistryNotFound",
            Error::RegistryConflict(_) => "RegistryConflict",
        }
    }

    /// Decide how to follow up on this error
    pub fn requeue(&self) -> Requeue {
        match self {
            Error::KubeError(kube::Error::Api(resp)) if resp.code == 409 => Requeue::Immediately,
            Error::RegistryConflict(_) => Requeue::Immediately,
            Error::FinalizerError(err) => match err.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(err)
                | kube::runtime::finalizer::Error::CleanupFailed(err) => err.requeue(),
                kube::runtime::finalizer::Error::AddFinalizer(kube::Error::Api(resp))
                | kube::runtime::finalizer::Error::RemoveFinalizer(kube::Error::Api(resp))
                    if resp.code == 409 =>
                {
                    Requeue::Immediately
                }
                _ => Requeue::WithBackoff,
            },
            Error::ApimSync(err) => match err.class() {
                ErrorClass::Recoverable => Requeue::WithBackoff,
                ErrorClass::NonRecoverable => Requeue::AwaitChange,
            },
            Error::InvalidCredentials(_)
            | Error::MissingCredentials(_)
            | Error::SecretKeyNotFound(_, _)
            | Error::InvalidTlsSecret(_)
            | Error::SecretReferenced { .. } => Requeue::AwaitChange,
            // the referenced objects may simply not have been created yet
            Error::ManagementContextNotFound(_)
            | Error::SecretNotFound(_)
            | Error::PemRegistryNotFound
            | Error::SerializationError(_)
            | Error::KubeError(_) => Requeue::WithBackoff,
        }
    }
}

/// The API management backend boundary
pub mod apim;

pub mod controllers;
pub use controllers::{run, Diagnostics, OperatorConfig, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Custom resources
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use reqwest::StatusCode;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code,
        }))
    }

    #[test]
    fn test_conflicts_requeue_immediately() {
        assert_eq!(api_error(409).requeue(), Requeue::Immediately);
        assert_eq!(
            Error::RegistryConflict("pem-registry".into()).requeue(),
            Requeue::Immediately
        );
    }

    #[test]
    fn test_other_kube_errors_back_off() {
        assert_eq!(api_error(500).requeue(), Requeue::WithBackoff);
    }

    #[test]
    fn test_sync_errors_follow_classification() {
        let unauthorized = Error::ApimSync(ApimError::Status {
            status: StatusCode::UNAUTHORIZED,
            message: String::new(),
        });
        assert_eq!(unauthorized.requeue(), Requeue::AwaitChange);

        let unavailable = Error::ApimSync(ApimError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: String::new(),
        });
        assert_eq!(unavailable.requeue(), Requeue::WithBackoff);
    }

    #[test]
    fn test_finalizer_errors_unwrap_to_inner_policy() {
        let err = Error::FinalizerError(Box::new(
            kube::runtime::finalizer::Error::ApplyFailed(Error::SecretReferenced {
                secret: "default/tls".into(),
                ingress: "shop".into(),
            }),
        ));
        assert_eq!(err.requeue(), Requeue::AwaitChange);

        let err = Error::FinalizerError(Box::new(
            kube::runtime::finalizer::Error::CleanupFailed(Error::PemRegistryNotFound),
        ));
        assert_eq!(err.requeue(), Requeue::WithBackoff);
    }

    #[test]
    fn test_referenced_secret_message() {
        let err = Error::SecretReferenced {
            secret: "default/tls".into(),
            ingress: "shop".into(),
        };
        assert_eq!(
            err.to_string(),
            "secret default/tls can't be deleted because it has reference to an existing ingress [shop]"
        );
    }
}
