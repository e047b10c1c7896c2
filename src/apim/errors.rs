use reqwest::StatusCode;
use thiserror::Error;

/// A failure talking to the management API
#[derive(Error, Debug)]
pub enum ApimError {
    #[error("Management API responded with {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("Unable to reach the management API: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Management API request timed out")]
    Timeout,

    #[error("Invalid management API response: {0}")]
    Decode(String),

    #[error("Unable to encode the API payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid management API URL: {0}")]
    InvalidUrl(String),

    #[error("Management API request was cancelled by operator shutdown")]
    Cancelled,
}

/// Whether a failure is worth retrying without an external change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity, timeouts, backend unavailability. Retry with backoff.
    Recoverable,
    /// Bad credentials, forbidden access, malformed requests. Stop until the definition or its
    /// context changes.
    NonRecoverable,
}

impl ApimError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApimError::Timeout
        } else if err.is_decode() {
            ApimError::Decode(err.to_string())
        } else if err.is_builder() {
            ApimError::InvalidUrl(err.to_string())
        } else {
            ApimError::Transport(err)
        }
    }

    pub fn class(&self) -> ErrorClass {
        classify(self)
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            ApimError::Status { status, .. } if status.is_server_error() => "ServerError",
            ApimError::Status { .. } => "ClientError",
            ApimError::Transport(_) => "Transport",
            ApimError::Timeout => "Timeout",
            ApimError::Decode(_) => "Decode",
            ApimError::Encode(_) => "Encode",
            ApimError::InvalidUrl(_) => "InvalidUrl",
            ApimError::Cancelled => "Cancelled",
        }
    }
}

/// Classify a sync failure. Evaluated afresh for every attempt.
pub fn classify(err: &ApimError) -> ErrorClass {
    match err {
        ApimError::Status { status, .. } => classify_status(*status),
        ApimError::Transport(_)
        | ApimError::Timeout
        | ApimError::Decode(_)
        | ApimError::Cancelled => ErrorClass::Recoverable,
        ApimError::Encode(_) | ApimError::InvalidUrl(_) => ErrorClass::NonRecoverable,
    }
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    match status.as_u16() {
        // the record went away between lookup and write; the next pass starts over
        404 => ErrorClass::Recoverable,
        408 | 409 | 425 | 429 => ErrorClass::Recoverable,
        400..=499 => ErrorClass::NonRecoverable,
        _ => ErrorClass::Recoverable,
    }
}
