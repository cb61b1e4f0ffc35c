use std::time::Duration;

use futures::StreamExt as _;
use kverify_resources::{ResourceRef, Snapshot};
use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{ConfigError, Connection, FetchError, FetchFuture, Fetcher};

#[derive(Clone, Debug)]
pub struct KubeClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for KubeClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Read-only Kubernetes API client. Issues one `GET` per fetch and never
/// retries; timeouts surface as transport errors.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    token: Option<String>,
    base_url: String,
    max_body_bytes: usize,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KubeClient {
    pub fn new(connection: &Connection, options: KubeClientOptions) -> Result<Self, ConfigError> {
        let mut builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout);
        if let Some(ca_pem) = &connection.ca_pem {
            let cert = Certificate::from_pem(ca_pem).map_err(|err| {
                ConfigError::Client(format!("failed to parse cluster CA: {err}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity_pem) = &connection.identity_pem {
            let identity = Identity::from_pem(identity_pem).map_err(|err| {
                ConfigError::Client(format!("failed to parse client certificate: {err}"))
            })?;
            builder = builder.identity(identity);
        }
        if connection.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|err| ConfigError::Client(err.to_string()))?;
        Ok(Self {
            client,
            token: connection.token.clone(),
            base_url: connection.server.trim_end_matches('/').to_string(),
            max_body_bytes: options.max_body_bytes,
        })
    }

    async fn get(&self, resource: &ResourceRef) -> Result<Snapshot, FetchError> {
        let url = format!("{}{}", self.base_url, resource.api_path());
        debug!(%resource, %url, "fetching resource");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|err| FetchError::transport(resource, describe_reqwest_error(&err)))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(resource.clone()));
        }
        if !status.is_success() {
            let detail = resp
                .json::<ApiStatus>()
                .await
                .ok()
                .and_then(|s| s.message)
                .map(|m| format!(": {m}"))
                .unwrap_or_default();
            return Err(FetchError::transport(
                resource,
                format!("API server answered {status}{detail}"),
            ));
        }

        if let Some(len) = resp.content_length()
            && len > self.max_body_bytes as u64
        {
            return Err(FetchError::transport(
                resource,
                format!(
                    "response of {len} bytes exceeds the {} byte limit",
                    self.max_body_bytes
                ),
            ));
        }
        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| FetchError::transport(resource, describe_reqwest_error(&err)))?;
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(FetchError::transport(
                    resource,
                    format!("response exceeds the {} byte limit", self.max_body_bytes),
                ));
            }
            body.extend_from_slice(&chunk);
        }

        Snapshot::from_slice(resource.kind(), &body).map_err(|source| FetchError::Decode {
            resource: resource.clone(),
            source,
        })
    }
}

impl Fetcher for KubeClient {
    fn fetch<'a>(&'a self, resource: &'a ResourceRef) -> FetchFuture<'a> {
        Box::pin(self.get(resource))
    }
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return "request timed out".to_string();
    }
    if err.is_connect() {
        return format!("could not connect to the API server ({err})");
    }
    err.to_string()
}

/// The `Status` object the API server returns alongside error codes.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    message: Option<String>,
}
