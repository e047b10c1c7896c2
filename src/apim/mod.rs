//! The boundary to the API management backend.
//!
//! The reconciler only ever talks to the backend through [`ApimClient`], so that it can be
//! exercised against in-memory backends in tests.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub mod client;
pub mod crossid;
pub mod errors;
pub mod model;

pub use client::ApimHttpClient;
pub use errors::{classify, ApimError, ErrorClass};
pub use model::{ApiPayload, ApiRecord, Credentials};

/// Operations the reconciler needs from the management API. All of them are safe to retry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApimClient: Send + Sync {
    /// Find the API with the given cross ID. A missing API is `Ok(None)`, not an error.
    async fn get_by_cross_id(&self, cross_id: &str) -> Result<Option<ApiRecord>, ApimError>;

    /// Create a new API
    async fn create(&self, payload: &ApiPayload) -> Result<ApiRecord, ApimError>;

    /// Replace the definition of an existing API
    async fn update(&self, id: &str, payload: &ApiPayload) -> Result<ApiRecord, ApimError>;

    /// Delete an API. Deleting an API that does not exist succeeds.
    async fn delete(&self, id: &str) -> Result<(), ApimError>;
}
