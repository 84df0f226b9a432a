//! Collaborator seams: the injected transport and an optional interceptor.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::RequestError;
use crate::request::{ContentKind, Method, RequestDescriptor, ResponseEnvelope};
use crate::retry::parse_retry_after;

/// Wire-level request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl TransportRequest {
    /// Resolve `descriptor` against the client's base URL and default headers.
    ///
    /// Request headers override defaults. A JSON body gets
    /// `content-type: application/json` unless one is already set.
    pub fn from_descriptor(
        base_url: &str,
        default_headers: &BTreeMap<String, String>,
        descriptor: &RequestDescriptor,
    ) -> Result<Self, RequestError> {
        let path = descriptor.path_and_query();
        let url = if base_url.is_empty() || path.contains("://") {
            path
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        let mut headers: BTreeMap<String, String> = default_headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        headers.extend(descriptor.headers.clone());

        let body = match &descriptor.body {
            Some(value) => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| RequestError::Decode(format!("invalid request body: {}", e)))?;
                headers
                    .entry("content-type".to_string())
                    .or_insert_with(|| "application/json".to_string());
                Some(bytes)
            }
            None => None,
        };

        Ok(TransportRequest {
            method: descriptor.method,
            url,
            headers,
            body,
        })
    }
}

/// What the transport got back, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        RawResponse {
            status,
            status_text: reason_phrase(status).to_string(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// A JSON response with the matching content type.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).header("content-type", "application/json")
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode into an envelope, or into [`RequestError::Http`] for a non-2xx status.
    ///
    /// Header names are lowercased first, whatever case the transport used.
    pub fn into_envelope(mut self) -> Result<ResponseEnvelope, RequestError> {
        self.headers = std::mem::take(&mut self.headers)
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        if !self.is_success() {
            return Err(RequestError::Http {
                status: self.status,
                status_text: self.status_text,
                retry_after_ms: self
                    .headers
                    .get("retry-after")
                    .and_then(|v| parse_retry_after(v)),
                body: String::from_utf8(self.body).ok().filter(|b| !b.is_empty()),
            });
        }

        let data = ContentKind::decode(
            self.headers.get("content-type").map(String::as_str),
            self.body,
        )?;
        let mut envelope = ResponseEnvelope::new(self.status, self.status_text, data);
        envelope.headers = self.headers;
        Ok(envelope)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// The injected network capability.
///
/// Implementations must stop work promptly once `cancel` fires. Dropping
/// the returned future must also be safe, since deadlines are enforced by
/// dropping it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<RawResponse, RequestError>;
}

/// Adapts an async closure into a [`Transport`].
pub struct FnTransport<F>(pub F);

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(TransportRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RawResponse, RequestError>> + Send,
{
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<RawResponse, RequestError> {
        (self.0)(request, cancel).await
    }
}

/// Hooks around every transport call, e.g. auth token injection or
/// payload encryption. Errors should use [`RequestError::Collaborator`].
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn before_send(&self, _request: &mut TransportRequest) -> Result<(), RequestError> {
        Ok(())
    }

    async fn after_receive(
        &self,
        response: ResponseEnvelope,
    ) -> Result<ResponseEnvelope, RequestError> {
        Ok(response)
    }
}
