use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use super::{ApiPayload, ApiRecord, ApimClient, ApimError, Credentials};

const DEFINITION_VERSION: &str = "2.0.0";
// error bodies can be whole html pages
const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// [`ApimClient`] over the management REST API of one organization/environment
#[derive(Clone, Debug)]
pub struct ApimHttpClient {
    http: reqwest::Client,
    apis_url: Url,
    credentials: Credentials,
    timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ApimHttpClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        organization_id: &str,
        environment_id: &str,
        credentials: Credentials,
        timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ApimError> {
        let apis_url = apis_url(base_url, organization_id, environment_id)?;

        Ok(Self {
            http,
            apis_url,
            credentials,
            timeout,
            shutdown,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApimError> {
        let mut url = self.apis_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApimError::InvalidUrl(self.apis_url.to_string()))?
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request_builder = self
            .http
            .request(method, url)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "application/json");

        match &self.credentials {
            Credentials::Bearer(token) => request_builder.bearer_auth(token),
            Credentials::Basic { username, password } => {
                request_builder.basic_auth(username, Some(password))
            }
        }
    }

    /// Send a request, giving up as soon as the operator starts shutting down
    async fn send(&self, request_builder: RequestBuilder) -> Result<Response, ApimError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Err(ApimError::Cancelled);
        }

        tokio::select! {
            response = request_builder.send() => response.map_err(ApimError::from_reqwest),
            _ = wait_for_shutdown(&mut shutdown) => Err(ApimError::Cancelled),
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // the sender is gone, so nobody can ask us to stop anymore
        futures::future::pending::<()>().await
    }
}

fn apis_url(base_url: &str, organization_id: &str, environment_id: &str) -> Result<Url, ApimError> {
    let mut url = Url::parse(base_url.trim_end_matches('/'))
        .map_err(|err| ApimError::InvalidUrl(format!("{base_url}: {err}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApimError::InvalidUrl(format!(
            "{base_url}: scheme must be http or https"
        )));
    }

    url.path_segments_mut()
        .map_err(|_| ApimError::InvalidUrl(base_url.to_owned()))?
        .pop_if_empty()
        .extend([
            "management",
            "organizations",
            organization_id,
            "environments",
            environment_id,
            "apis",
        ]);

    Ok(url)
}

async fn error_for_status(response: Response) -> Result<Response, ApimError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_MESSAGE_LEN {
        let mut end = MAX_ERROR_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }

    Err(ApimError::Status { status, message })
}

async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ApimError> {
    response.json().await.map_err(ApimError::from_reqwest)
}

#[async_trait]
impl ApimClient for ApimHttpClient {
    async fn get_by_cross_id(&self, cross_id: &str) -> Result<Option<ApiRecord>, ApimError> {
        let mut url = self.endpoint(&[])?;
        url.query_pairs_mut().append_pair("crossId", cross_id);

        debug!(cross_id, "Looking up API by cross ID");

        let response = self.send(self.request(Method::GET, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let records: Vec<ApiRecord> = json(error_for_status(response).await?).await?;
        Ok(records.into_iter().next())
    }

    async fn create(&self, payload: &ApiPayload) -> Result<ApiRecord, ApimError> {
        let mut url = self.endpoint(&["import"])?;
        url.query_pairs_mut()
            .append_pair("definitionVersion", DEFINITION_VERSION);

        debug!(cross_id = %payload.cross_id, "Creating API");

        let body = serde_json::to_vec(payload)?;
        let response = self
            .send(
                self.request(Method::POST, url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body),
            )
            .await?;

        json(error_for_status(response).await?).await
    }

    async fn update(&self, id: &str, payload: &ApiPayload) -> Result<ApiRecord, ApimError> {
        let mut url = self.endpoint(&[id, "import"])?;
        url.query_pairs_mut()
            .append_pair("definitionVersion", DEFINITION_VERSION);

        debug!(id, cross_id = %payload.cross_id, "Updating API");

        let body = serde_json::to_vec(payload)?;
        let response = self
            .send(
                self.request(Method::PUT, url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body),
            )
            .await?;

        json(error_for_status(response).await?).await
    }

    async fn delete(&self, id: &str) -> Result<(), ApimError> {
        let url = self.endpoint(&[id])?;

        debug!(id, "Deleting API");

        let response = self.send(self.request(Method::DELETE, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        error_for_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> ApimHttpClient {
        let (_tx, rx) = watch::channel(false);
        ApimHttpClient::new(
            reqwest::Client::new(),
            base_url,
            "DEFAULT",
            "DEFAULT",
            Credentials::Bearer("token".into()),
            Duration::from_secs(1),
            rx,
        )
        .unwrap()
    }

    #[test]
    fn test_apis_url() {
        assert_eq!(
            apis_url("https://apim.example.com", "DEFAULT", "DEFAULT")
                .unwrap()
                .as_str(),
            "https://apim.example.com/management/organizations/DEFAULT/environments/DEFAULT/apis"
        );
    }

    #[test]
    fn test_apis_url_keeps_base_path() {
        assert_eq!(
            apis_url("http://apim.example.com:8083/api/", "org", "env")
                .unwrap()
                .as_str(),
            "http://apim.example.com:8083/api/management/organizations/org/environments/env/apis"
        );
    }

    #[test]
    fn test_invalid_base_urls_are_rejected() {
        assert!(matches!(
            apis_url("not a url", "DEFAULT", "DEFAULT"),
            Err(ApimError::InvalidUrl(_))
        ));
        assert!(matches!(
            apis_url("ftp://apim.example.com", "DEFAULT", "DEFAULT"),
            Err(ApimError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_endpoint_escapes_ids() {
        let client = client("https://apim.example.com");
        let url = client.endpoint(&["a/b", "import"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://apim.example.com/management/organizations/DEFAULT/environments/DEFAULT/apis/a%2Fb/import"
        );
    }

    #[tokio::test]
    async fn test_requests_are_cancelled_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let client = ApimHttpClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "DEFAULT",
            "DEFAULT",
            Credentials::Bearer("token".into()),
            Duration::from_secs(1),
            rx,
        )
        .unwrap();
        tx.send(true).unwrap();

        assert!(matches!(
            client.get_by_cross_id("cross-1").await,
            Err(ApimError::Cancelled)
        ));
    }
}
