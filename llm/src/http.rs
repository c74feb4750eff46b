use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

use crate::model::Endpoint;
use crate::traits::LLMError;

/// Build a request against `endpoint`, adding bearer auth when a key is set.
pub(crate) fn request(client: &Client, endpoint: &Endpoint, method: Method, path: &str) -> RequestBuilder {
    let req = client.request(method, endpoint.join(path));
    match &endpoint.api_key {
        Some(key) => req.bearer_auth(key),
        None => req,
    }
}

/// Turn non-2xx replies into [`LLMError::Status`], keeping the body for
/// diagnostics.
pub(crate) async fn check_status(resp: Response, endpoint: &Endpoint, path: &str) -> Result<Response, LLMError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    warn!(url = %endpoint.url, path, status = status.as_u16(), "backend returned error status");
    Err(LLMError::Status {
        status: status.as_u16(),
        body,
    })
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &Client,
    endpoint: &Endpoint,
    path: &str,
    timeout: Duration,
) -> Result<T, LLMError> {
    let resp = request(client, endpoint, Method::GET, path)
        .timeout(timeout)
        .send()
        .await
        .map_err(LLMError::network)?;
    let resp = check_status(resp, endpoint, path).await?;
    resp.json::<T>().await.map_err(LLMError::invalid)
}

pub(crate) async fn post_json<T: DeserializeOwned>(
    client: &Client,
    endpoint: &Endpoint,
    path: &str,
    body: &serde_json::Value,
) -> Result<T, LLMError> {
    let resp = request(client, endpoint, Method::POST, path)
        .json(body)
        .send()
        .await
        .map_err(LLMError::network)?;
    let resp = check_status(resp, endpoint, path).await?;
    resp.json::<T>().await.map_err(LLMError::invalid)
}

/// Open a streaming POST. Connection failures name the target so callers can
/// tell which instance refused.
pub(crate) async fn post_stream(
    client: &Client,
    endpoint: &Endpoint,
    path: &str,
    body: &serde_json::Value,
) -> Result<Response, LLMError> {
    let resp = request(client, endpoint, Method::POST, path)
        .json(body)
        .send()
        .await
        .map_err(|e| LLMError::Network(format!("connecting to {}: {e}", endpoint.url)))?;
    check_status(resp, endpoint, path).await
}
