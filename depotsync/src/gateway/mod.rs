//! HTTP gateway session.
//!
//! [`GatewaySession`] implements [`ContentSession`] and [`ChangeFeed`] over a
//! JSON HTTP gateway that fronts the upstream service. Catalog calls go to
//! the gateway base URL:
//!
//! | Call                  | Request                                                        |
//! |-----------------------|----------------------------------------------------------------|
//! | endpoints             | `GET {base}/endpoints`                                         |
//! | depot key             | `GET {base}/apps/{app}/depots/{depot}/key`                     |
//! | manifest request code | `GET {base}/apps/{app}/depots/{depot}/manifests/{id}/code?branch=` |
//! | app descriptor        | `GET {base}/apps/{app}?change={n}`                             |
//! | changes since         | `GET {base}/changes?since={n}`                                 |
//!
//! Content calls go to the endpoint handed out by the pool:
//! `GET {endpoint}/depot/{depot}/manifest/{id}/{code}` and
//! `GET {endpoint}/depot/{depot}/chunk/{chunk}`. The depot key travels in the
//! `x-depot-key` header; the endpoint returns decoded manifests and plain
//! chunk bytes.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::model::{
    AppDescriptor, AppId, ChangeNotice, ChangeNumber, ChunkDescriptor, DepotId, DepotKey,
    Endpoint, Manifest, ManifestId,
};
use crate::session::{BoxFuture, ChangeFeed, ContentSession, SessionError, SessionResult};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const KEY_HEADER: &str = "x-depot-key";

/// Gateway connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyResponse {
    key: DepotKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestCodeResponse {
    code: u64,
}

/// Session backed by the HTTP gateway.
#[derive(Clone, Debug)]
pub struct GatewaySession {
    client: Client,
    base: String,
    timeout: Duration,
}

impl GatewaySession {
    pub fn new(config: GatewayConfig) -> SessionResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SessionError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
        })
    }

    fn endpoints_url(&self) -> String {
        format!("{}/endpoints", self.base)
    }

    fn key_url(&self, app: AppId, depot: DepotId) -> String {
        format!("{}/apps/{}/depots/{}/key", self.base, app, depot)
    }

    fn request_code_url(&self, app: AppId, depot: DepotId, manifest: ManifestId) -> String {
        format!(
            "{}/apps/{}/depots/{}/manifests/{}/code",
            self.base, app, depot, manifest
        )
    }

    fn descriptor_url(&self, app: AppId) -> String {
        format!("{}/apps/{}", self.base, app)
    }

    fn changes_url(&self) -> String {
        format!("{}/changes", self.base)
    }

    fn manifest_url(endpoint: &Endpoint, depot: DepotId, manifest: ManifestId, code: u64) -> String {
        format!(
            "{}/depot/{}/manifest/{}/{}",
            endpoint.base_url(),
            depot,
            manifest,
            code
        )
    }

    fn chunk_url(endpoint: &Endpoint, depot: DepotId, chunk: &ChunkDescriptor) -> String {
        format!("{}/depot/{}/chunk/{}", endpoint.base_url(), depot, chunk.id)
    }

    fn transport_error(&self, error: reqwest::Error) -> SessionError {
        if error.is_timeout() {
            SessionError::Timeout(self.timeout.as_secs())
        } else if error.is_decode() {
            SessionError::Decode(error.to_string())
        } else {
            SessionError::Transport(error.to_string())
        }
    }

    async fn send(&self, request: RequestBuilder) -> SessionResult<Response> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        trace!(url = %response.url(), status = %response.status(), "Gateway response");
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> SessionResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| SessionError::Decode(e.to_string()))
    }

    /// GET returning JSON; `Ok(None)` for not-found or forbidden.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> SessionResult<Option<T>> {
        let response = self.send(request).await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(None),
            status if status.is_success() => self.json(response).await.map(Some),
            status => Err(status_error(status, response.url().as_str())),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> SessionResult<T> {
        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response.url().as_str()));
        }
        self.json(response).await
    }
}

fn status_error(status: StatusCode, url: &str) -> SessionError {
    if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
        SessionError::Unavailable(format!("HTTP {} from {}", status, url))
    } else {
        SessionError::Transport(format!("HTTP {} from {}", status, url))
    }
}

impl ContentSession for GatewaySession {
    fn endpoints(&self) -> BoxFuture<'_, SessionResult<Vec<Endpoint>>> {
        Box::pin(async move {
            // Unfiltered; the pool keeps only endpoints serving its app.
            let endpoints: Vec<Endpoint> =
                self.get_json(self.client.get(self.endpoints_url())).await?;
            debug!(count = endpoints.len(), "Fetched endpoint list");
            Ok(endpoints)
        })
    }

    fn depot_key(&self, app: AppId, depot: DepotId) -> BoxFuture<'_, SessionResult<Option<DepotKey>>> {
        Box::pin(async move {
            let response: Option<KeyResponse> = self
                .get_optional(self.client.get(self.key_url(app, depot)))
                .await?;
            Ok(response.map(|r| r.key))
        })
    }

    fn manifest_request_code<'a>(
        &'a self,
        depot: DepotId,
        app: AppId,
        manifest: ManifestId,
        branch: &'a str,
    ) -> BoxFuture<'a, SessionResult<u64>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.request_code_url(app, depot, manifest))
                .query(&[("branch", branch)]);
            let response: RequestCodeResponse = self.get_json(request).await?;
            Ok(response.code)
        })
    }

    fn download_manifest<'a>(
        &'a self,
        depot: DepotId,
        manifest: ManifestId,
        request_code: u64,
        endpoint: &'a Endpoint,
        key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Manifest>> {
        Box::pin(async move {
            let request = self
                .client
                .get(Self::manifest_url(endpoint, depot, manifest, request_code))
                .header(KEY_HEADER, hex::encode(key.as_bytes()));
            self.get_json(request).await
        })
    }

    fn download_chunk<'a>(
        &'a self,
        depot: DepotId,
        chunk: &'a ChunkDescriptor,
        endpoint: &'a Endpoint,
        key: &'a DepotKey,
    ) -> BoxFuture<'a, SessionResult<Vec<u8>>> {
        Box::pin(async move {
            let request = self
                .client
                .get(Self::chunk_url(endpoint, depot, chunk))
                .header(KEY_HEADER, hex::encode(key.as_bytes()));
            let response = self.send(request).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status, response.url().as_str()));
            }
            let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
            Ok(bytes.to_vec())
        })
    }

    fn app_descriptor(
        &self,
        app: AppId,
        expected_change: Option<ChangeNumber>,
    ) -> BoxFuture<'_, SessionResult<Option<AppDescriptor>>> {
        Box::pin(async move {
            let mut request = self.client.get(self.descriptor_url(app));
            if let Some(change) = expected_change {
                request = request.query(&[("change", change.get())]);
            }
            self.get_optional(request).await
        })
    }
}

impl ChangeFeed for GatewaySession {
    fn changes_since(&self, since: ChangeNumber) -> BoxFuture<'_, SessionResult<ChangeNotice>> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.changes_url())
                .query(&[("since", since.get())]);
            self.get_json(request).await
        })
    }
}
