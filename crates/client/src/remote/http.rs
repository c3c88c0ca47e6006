//! HTTP implementation of [`RemoteStore`].
//!
//! Wire format:
//! - `POST {base}/collections/{collection}` with
//!   `{"idempotency_key": "<local id>", "payload": {...}}` and an
//!   `Idempotency-Key` header; the response body is `{"id": "<remote id>"}`.
//! - `POST {base}/collections/{collection}/query` with a [`Query`] body; the
//!   response body is `{"records": [...]}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tillsync_core::{MutationId, Query, RemoteError, RemoteId, RemoteRecord};

use super::RemoteStore;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Serialize)]
struct WriteRequest<'a> {
    idempotency_key: MutationId,
    payload: &'a Value,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    id: RemoteId,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    records: Vec<RemoteRecord>,
}

#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteStore {
    /// `timeout` bounds every request end to end.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status, body)
            .unwrap_or_else(|| RemoteError::transient(format!("unexpected HTTP {status}"))))
    }
}

fn network_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::transient(format!("request timed out: {err}"))
    } else {
        RemoteError::transient(format!("network error: {err}"))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn write(
        &self,
        collection: &str,
        idempotency_key: MutationId,
        payload: &Value,
    ) -> Result<RemoteId, RemoteError> {
        let url = format!("{}/collections/{}", self.base_url, collection);
        let resp = self
            .post(&url)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(&WriteRequest {
                idempotency_key,
                payload,
            })
            .send()
            .await
            .map_err(network_error)?;

        let resp = Self::check(resp).await?;
        // A 2xx with an unreadable body may still have been applied; the retry
        // carries the same key, so treat it as transient.
        let body: WriteResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::transient(format!("unreadable write response: {e}")))?;

        tracing::debug!(collection, local_id = %idempotency_key, remote_id = %body.id, "remote write accepted");
        Ok(body.id)
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<RemoteRecord>, RemoteError> {
        let url = format!("{}/collections/{}/query", self.base_url, collection);
        let resp = self
            .post(&url)
            .json(query)
            .send()
            .await
            .map_err(network_error)?;

        let resp = Self::check(resp).await?;
        let body: QueryResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::transient(format!("unreadable query response: {e}")))?;
        Ok(body.records)
    }
}
