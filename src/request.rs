//! Request descriptors, response envelopes and body decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{CacheOptions, RetryOverrides};
use crate::error::RequestError;
use crate::utils::{content_hash, now_ms};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    format!("req-{}", NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Verbs whose body contributes to the dedupe signature.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Patch | Method::Delete
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Everything needed to execute one request.
///
/// Cancellation is keyed by [`RequestDescriptor::id`] through the client's
/// cancellation registry rather than carried on the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub id: String,
    pub method: Method,
    /// Path or absolute URL.
    pub target: String,
    /// Query parameters, kept sorted so signatures are stable.
    pub params: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    pub cache: Option<CacheOptions>,
    pub retry: Option<RetryOverrides>,
    pub timeout_ms: Option<u64>,
}

impl RequestDescriptor {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        RequestDescriptor {
            id: next_request_id(),
            method,
            target: target.into(),
            params: BTreeMap::new(),
            body: None,
            headers: BTreeMap::new(),
            priority: Priority::Normal,
            cache: None,
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::Get, target)
    }

    pub fn post(target: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Post, target).body(body)
    }

    pub fn put(target: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::Put, target).body(body)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::Delete, target)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cache(mut self, options: CacheOptions) -> Self {
        self.cache = Some(options);
        self
    }

    pub fn retry(mut self, overrides: RetryOverrides) -> Self {
        self.retry = Some(overrides);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// `target?k=v&...` with params url-encoded in key order.
    pub fn path_and_query(&self) -> String {
        if self.params.is_empty() {
            return self.target.clone();
        }
        let query = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let sep = if self.target.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.target, sep, query)
    }

    /// Signature used to collapse identical concurrent requests.
    ///
    /// Method, target and params always participate; the body participates
    /// through a content hash for mutating verbs only.
    pub fn dedupe_signature(&self) -> String {
        let params = serde_json::to_string(&self.params).unwrap_or_default();
        let mut signature = format!("{} {} {}", self.method, self.target, params);
        if self.method.is_mutating()
            && let Some(body) = &self.body
        {
            let bytes = serde_json::to_vec(body).unwrap_or_default();
            signature.push('#');
            signature.push_str(&content_hash(&bytes));
        }
        signature
    }

    /// Cache key: the explicit key from the cache options, else `METHOD path?query`.
    pub fn cache_key(&self) -> String {
        self.cache
            .as_ref()
            .and_then(|c| c.key.clone())
            .unwrap_or_else(|| format!("{} {}", self.method, self.path_and_query()))
    }

    /// Endpoint identity used for per-endpoint circuit breakers: the target without any query.
    pub fn endpoint(&self) -> &str {
        self.target
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.target)
    }
}

/// How a response body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Text,
    Binary,
}

impl ContentKind {
    /// Pick a decoder from a `Content-Type` value.
    ///
    /// Parameters (`; charset=...`) and case are ignored. `None` means the
    /// header was absent and the body decides between text and binary.
    pub fn from_content_type(content_type: Option<&str>) -> Option<Self> {
        let raw = content_type?;
        let essence = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let kind = match essence.as_str() {
            "application/json" | "text/json" => ContentKind::Json,
            s if s.ends_with("+json") => ContentKind::Json,
            s if s.starts_with("text/") => ContentKind::Text,
            "application/xml"
            | "application/javascript"
            | "application/x-www-form-urlencoded" => ContentKind::Text,
            s if s.ends_with("+xml") => ContentKind::Text,
            _ => ContentKind::Binary,
        };
        Some(kind)
    }

    pub fn decode(content_type: Option<&str>, bytes: Vec<u8>) -> Result<ResponseBody, RequestError> {
        if bytes.is_empty() {
            return Ok(ResponseBody::Empty);
        }
        match Self::from_content_type(content_type) {
            Some(ContentKind::Json) => serde_json::from_slice(&bytes)
                .map(ResponseBody::Json)
                .map_err(|e| RequestError::Decode(format!("invalid JSON body: {}", e))),
            Some(ContentKind::Text) => String::from_utf8(bytes)
                .map(ResponseBody::Text)
                .map_err(|e| RequestError::Decode(format!("invalid UTF-8 body: {}", e))),
            Some(ContentKind::Binary) => Ok(ResponseBody::Binary(bytes)),
            None => match String::from_utf8(bytes) {
                Ok(text) => Ok(ResponseBody::Text(text)),
                Err(e) => Ok(ResponseBody::Binary(e.into_bytes())),
            },
        }
    }
}

/// Decoded response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ResponseBody {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

impl ResponseBody {
    /// Body rendered as text where that makes sense.
    pub fn as_text(&self) -> Option<String> {
        match self {
            ResponseBody::Empty => None,
            ResponseBody::Json(v) => Some(v.to_string()),
            ResponseBody::Text(t) => Some(t.clone()),
            ResponseBody::Binary(b) => String::from_utf8(b.clone()).ok(),
        }
    }
}

/// A settled response handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub data: ResponseBody,
    pub status_code: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub served_from_cache: bool,
    pub timestamp_ms: i64,
}

impl ResponseEnvelope {
    pub fn new(status_code: u16, status_text: impl Into<String>, data: ResponseBody) -> Self {
        ResponseEnvelope {
            data,
            status_code,
            status_text: status_text.into(),
            headers: BTreeMap::new(),
            served_from_cache: false,
            timestamp_ms: now_ms(),
        }
    }

    /// Deserialize a JSON payload into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        match &self.data {
            ResponseBody::Json(value) => serde_json::from_value(value.clone())
                .map_err(|e| RequestError::Decode(e.to_string())),
            ResponseBody::Text(text) => {
                serde_json::from_str(text).map_err(|e| RequestError::Decode(e.to_string()))
            }
            ResponseBody::Binary(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| RequestError::Decode(e.to_string()))
            }
            ResponseBody::Empty => Err(RequestError::Decode("empty body".to_string())),
        }
    }

    pub(crate) fn from_cache(mut self) -> Self {
        self.served_from_cache = true;
        self
    }
}
