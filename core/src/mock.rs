//! Scripted in-process transport.
//!
//! Replies are queued per method and path and handed out in order; the last queued reply
//! for a route keeps answering once the others are used up. Every request is recorded so
//! callers can assert on what was sent and how often.

use crate::api::{ApiRequest, ApiResponse, ApiTransport, Method, StreamResponse};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone)]
pub struct MockReply {
    status: StatusCode,
    chunks: Vec<Vec<u8>>,
    delay: Option<Duration>,
    transport_error: Option<String>,
    stream_error: Option<String>,
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            chunks: Vec::new(),
            delay: None,
            transport_error: None,
            stream_error: None,
        }
    }

    pub fn json(status: u16, body: Value) -> Self {
        let mut reply = Self::status(status);
        reply.chunks = vec![body.to_string().into_bytes()];
        reply
    }

    pub fn ok(body: Value) -> Self {
        Self::json(200, body)
    }

    pub fn detail(status: u16, detail: &str) -> Self {
        Self::json(status, json!({ "detail": detail }))
    }

    /// A 200 response whose body arrives as the given chunks.
    pub fn chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        let mut reply = Self::status(200);
        reply.chunks = chunks.into_iter().map(Into::into).collect();
        reply
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        let mut reply = Self::status(500);
        reply.transport_error = Some(message.into());
        reply
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes a streamed body fail after its chunks have been delivered.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.stream_error = Some(message.into());
        self
    }
}

#[derive(Default)]
struct MockInner {
    routes: HashMap<(Method, String), VecDeque<MockReply>>,
    calls: Vec<ApiRequest>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, method: Method, path: impl Into<String>, reply: MockReply) -> &Self {
        self.inner
            .lock()
            .routes
            .entry((method, path.into()))
            .or_default()
            .push_back(reply);
        self
    }

    /// Drops whatever is queued for the route and answers with `reply` from now on.
    pub fn replace(&self, method: Method, path: impl Into<String>, reply: MockReply) -> &Self {
        self.inner
            .lock()
            .routes
            .insert((method, path.into()), VecDeque::from([reply]));
        self
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, method: Method, path: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    pub fn last_call(&self, method: Method, path: &str) -> Option<ApiRequest> {
        self.inner
            .lock()
            .calls
            .iter()
            .rev()
            .find(|call| call.method == method && call.path == path)
            .cloned()
    }

    fn next_reply(&self, request: &ApiRequest) -> MockReply {
        let mut inner = self.inner.lock();
        inner.calls.push(request.clone());
        let key = (request.method, request.path.clone());
        match inner.routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(unrouted),
            Some(queue) => queue.front().cloned().unwrap_or_else(unrouted),
            None => unrouted(),
        }
    }

    async fn reply_for(&self, request: &ApiRequest) -> Result<MockReply, TransportError> {
        let reply = self.next_reply(request);
        if let Some(delay) = reply.delay {
            sleep(delay).await;
        }
        match &reply.transport_error {
            Some(message) => Err(TransportError(message.clone())),
            None => Ok(reply),
        }
    }
}

fn unrouted() -> MockReply {
    MockReply::detail(404, "Not Found")
}

#[async_trait]
impl ApiTransport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let reply = self.reply_for(&request).await?;
        if let Some(message) = reply.stream_error {
            return Err(TransportError(message));
        }
        Ok(ApiResponse {
            status: reply.status,
            body: reply.chunks.concat(),
        })
    }

    async fn stream(&self, request: ApiRequest) -> Result<StreamResponse, TransportError> {
        let reply = self.reply_for(&request).await?;
        let tail = reply
            .stream_error
            .map(|message| Err(TransportError(message)));
        let body = stream::iter(reply.chunks.into_iter().map(Ok).chain(tail)).boxed();
        Ok(StreamResponse {
            status: reply.status,
            body,
        })
    }
}
