//! REST resource API client.
//!
//! Resources live under `{endpoint}/{kind}`: `POST` creates, and
//! `GET`/`PUT`/`DELETE` on `{endpoint}/{kind}/{id}` read, update and
//! remove. Create and update bodies carry the resource's references with
//! the provider ids of their targets. Status codes map onto
//! [`ProviderError`] so retry decisions stay with the executor.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result};
use crate::resource::{ResourceDescriptor, ResourceKind};

use super::{Attributes, Provider, ProviderResult, ResolvedRef};

/// Retry delay assumed when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP-backed provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    token: Option<String>,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    attributes: &'a Attributes,
    references: &'a [ResolvedRef],
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    attributes: &'a Attributes,
    references: &'a [ResolvedRef],
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    attributes: Attributes,
}

impl HttpProvider {
    /// Creates a client for the API rooted at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            timeout_secs,
        })
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/{kind}", self.endpoint)
    }

    fn resource_url(&self, kind: ResourceKind, id: &str) -> String {
        format!("{}/{kind}/{}", self.endpoint, id.trim_start_matches('/'))
    }

    /// Sends a request, mapping transport and status failures.
    async fn send(&self, request: reqwest::RequestBuilder, id: &str) -> ProviderResult<Response> {
        let request = match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    secs: self.timeout_secs,
                }
            } else {
                ProviderError::network(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        trace!("Provider responded {status} for {id}");

        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }

        let message = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            return Err(ProviderError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Err(ProviderError::rejected(status.as_u16(), message))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, descriptor: &ResourceDescriptor, references: &[ResolvedRef]) -> ProviderResult<String> {
        debug!("POST {} ({})", self.collection_url(descriptor.kind), descriptor.name);

        let body = CreateRequest {
            name: &descriptor.name,
            attributes: &descriptor.attributes,
            references,
        };

        let response = self
            .send(
                self.client.post(self.collection_url(descriptor.kind)).json(&body),
                &descriptor.name,
            )
            .await?;

        let created: CreateResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse create response: {e}"),
        })?;

        Ok(created.id)
    }

    async fn read(&self, kind: ResourceKind, id: &str) -> ProviderResult<Attributes> {
        let response = self
            .send(self.client.get(self.resource_url(kind, id)), id)
            .await?;

        let resource: ReadResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse read response: {e}"),
        })?;

        Ok(resource.attributes)
    }

    async fn update(&self, id: &str, descriptor: &ResourceDescriptor, references: &[ResolvedRef]) -> ProviderResult<()> {
        let url = self.resource_url(descriptor.kind, id);
        debug!("PUT {url}");
        let body = UpdateRequest {
            attributes: &descriptor.attributes,
            references,
        };
        self.send(self.client.put(url).json(&body), id).await?;
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        debug!("DELETE {}", self.resource_url(kind, id));
        self.send(self.client.delete(self.resource_url(kind, id)), id)
            .await?;
        Ok(())
    }
}
