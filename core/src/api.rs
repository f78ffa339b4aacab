use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A single call against the Exemi backend, independent of how it is carried.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            bearer: None,
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = RequestBody::Form(
            fields
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        );
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn detail(&self) -> Option<String> {
        detail_from(&self.body)
    }
}

/// Pulls the human-readable `detail` string out of a JSON error body.
///
/// Validation errors carry a structured `detail` (a list of objects); those are not
/// shown to users, so anything but a string yields `None`.
pub fn detail_from(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        detail: Option<Value>,
    }

    match serde_json::from_slice::<ErrorBody>(body).ok()?.detail? {
        Value::String(detail) => Some(detail),
        _ => None,
    }
}

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

pub struct StreamResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

impl StreamResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Drains whatever is left of the body. Chunks that fail mid-read are dropped.
    pub async fn collect_body(mut self) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = self.body.next().await {
            match chunk {
                Ok(bytes) => body.extend_from_slice(&bytes),
                Err(_) => break,
            }
        }
        body
    }
}

#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;

    async fn stream(&self, request: ApiRequest) -> Result<StreamResponse, TransportError>;
}

/// `reqwest`-backed transport talking to a live backend.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &Url) -> Self {
        Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn build(&self, request: ApiRequest) -> reqwest::RequestBuilder {
        let url = self.url_for(&request.path);
        debug!(method = ?request.method, %url, "issuing request");
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), url)
            .header(ACCEPT, "application/json");
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(fields) => builder.form(&fields),
        }
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let response = self.build(request).send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse { status, body })
    }

    async fn stream(&self, request: ApiRequest) -> Result<StreamResponse, TransportError> {
        let response = self.build(request).send().await?;
        let status = response.status();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from))
            .boxed();
        Ok(StreamResponse { status, body })
    }
}
