// HTTP seam between the request pipeline and the wire.
//
// The pipeline only sees `Transport`; `Connector` builds one lazily on first use. The
// production pair wraps a pooled `reqwest::Client`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::{
    error::{ApiError, TransportError},
    settings::Settings,
};

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    // Lowercased names.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    async fn close(&self) {}
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, settings: &Settings) -> Result<Arc<dyn Transport>, ApiError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestConnector;

#[async_trait]
impl Connector for ReqwestConnector {
    async fn connect(&self, settings: &Settings) -> Result<Arc<dyn Transport>, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_millis(settings.timeouts.connect_ms))
            .pool_max_idle_per_host(settings.pool.max_keepalive_connections)
            .pool_idle_timeout(Duration::from_millis(settings.pool.keepalive_expiry_ms))
            .build()
            .map_err(|e| ApiError::Configuration(format!("failed to build HTTP client: {e}")))?;

        info!(
            base_url = %settings.base_url,
            max_connections = settings.pool.max_connections,
            "HTTP session created"
        );

        Ok(Arc::new(ReqwestTransport {
            client,
            permits: Arc::new(Semaphore::new(settings.pool.max_connections.max(1))),
            pool_timeout: Duration::from_millis(settings.timeouts.pool_ms),
        }))
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    // Caps concurrent connections; waiting for a permit is bounded by the pool timeout.
    permits: Arc<Semaphore>,
    pool_timeout: Duration,
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let _permit = tokio::time::timeout(self.pool_timeout, self.permits.acquire())
            .await
            .map_err(|_| TransportError::Timeout("waiting for a pooled connection".to_string()))?
            .map_err(|_| TransportError::Other("connection pool closed".to_string()))?;

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::Request(format!("invalid method {}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }

    async fn close(&self) {
        self.permits.close();
        debug!("HTTP session closed");
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
