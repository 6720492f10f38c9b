// Optional request hooks. Hook errors are logged and dropped; they never fail a request.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{error::ApiError, health::RequestMetrics};

#[derive(Debug, Clone)]
pub struct RequestStarted<'a> {
    pub request_id: &'a str,
    pub method: &'a str,
    pub url: &'a str,
    pub attempt: u32,
    // Already masked.
    pub body: Option<&'a Value>,
}

pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
pub trait RequestObserver: Send + Sync {
    async fn on_request(&self, _event: RequestStarted<'_>) -> HookResult {
        Ok(())
    }

    async fn on_complete(&self, _metrics: &RequestMetrics, _error: Option<&ApiError>) -> HookResult {
        Ok(())
    }
}

pub(crate) fn discard(hook: &str, result: HookResult) {
    if let Err(err) = result {
        debug!(hook, error = %err, "request hook failed, ignoring");
    }
}
