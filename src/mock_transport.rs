// Scripted transport and auth for exercising the client without a network.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    auth::{AuthProvider, TokenInfo},
    error::{ApiError, TransportError},
    settings::Settings,
    transport::{Connector, Transport, TransportRequest, TransportResponse},
};

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    Fail(TransportError),
    Delayed(Duration, Box<MockBehavior>),
}

impl MockBehavior {
    pub fn json(status: u16, body: Value) -> Self {
        MockBehavior::Respond {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn text(status: u16, content_type: &str, body: &str) -> Self {
        MockBehavior::Respond {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn timeout() -> Self {
        MockBehavior::Fail(TransportError::Timeout("read timed out".to_string()))
    }

    pub fn with_header(self, name: &str, value: &str) -> Self {
        match self {
            MockBehavior::Respond {
                status,
                mut headers,
                body,
            } => {
                headers.push((name.to_ascii_lowercase(), value.to_string()));
                MockBehavior::Respond {
                    status,
                    headers,
                    body,
                }
            }
            other => other,
        }
    }

    pub fn after(self, delay: Duration) -> Self {
        MockBehavior::Delayed(delay, Box::new(self))
    }
}

#[derive(Debug)]
struct MockState {
    script: Mutex<VecDeque<MockBehavior>>,
    fallback: Mutex<MockBehavior>,
    attempts: AtomicUsize,
    connects: AtomicUsize,
    closed: AtomicBool,
    requests: Mutex<Vec<TransportRequest>>,
}

/// Plays queued behaviors in order, then repeats the fallback. Clones share state, so a
/// test can keep one handle while the client owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MockBehavior::json(200, Value::Object(Default::default())))
    }
}

impl MockTransport {
    pub fn new(fallback: MockBehavior) -> Self {
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(fallback),
                attempts: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn push(&self, behavior: MockBehavior) -> &Self {
        self.state.script.lock().push_back(behavior);
        self
    }

    pub fn set_fallback(&self, behavior: MockBehavior) {
        *self.state.fallback.lock() = behavior;
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state.requests.lock().clone()
    }

    fn next_behavior(&self) -> MockBehavior {
        let queued = self.state.script.lock().pop_front();
        queued.unwrap_or_else(|| self.state.fallback.lock().clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().push(request);

        let mut behavior = self.next_behavior();
        loop {
            match behavior {
                MockBehavior::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    behavior = *inner;
                }
                MockBehavior::Fail(err) => return Err(err),
                MockBehavior::Respond {
                    status,
                    headers,
                    body,
                } => {
                    return Ok(TransportResponse {
                        status,
                        headers: headers.into_iter().collect(),
                        body,
                    })
                }
            }
        }
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockTransport {
    async fn connect(&self, _settings: &Settings) -> Result<Arc<dyn Transport>, ApiError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        // Give concurrent first requests a chance to race the session init.
        tokio::task::yield_now().await;
        Ok(Arc::new(self.clone()))
    }
}

/// Hands out `token-<generation>`; every invalidation bumps the generation.
#[derive(Debug, Default)]
pub struct MockAuth {
    generation: AtomicUsize,
    invalidations: AtomicUsize,
    failing: AtomicBool,
}

impl MockAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    async fn get_token(&self) -> Result<String, ApiError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Authentication {
                message: "token endpoint unavailable".to_string(),
                context: Box::default(),
            });
        }
        Ok(format!("token-{}", self.generation.load(Ordering::SeqCst)))
    }

    async fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn token_info(&self) -> TokenInfo {
        let failing = self.failing.load(Ordering::SeqCst);
        TokenInfo {
            has_token: !failing,
            status: if failing { "error" } else { "valid" }.to_string(),
            expires_in: Some(3600),
            refresh_count: self.generation.load(Ordering::SeqCst) as u32,
        }
    }
}
