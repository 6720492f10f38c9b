// Resilient request pipeline for the hotel-management API.
//
// Per logical request: session -> cache lookup (GET) -> rate limit -> sanitize body ->
// bounded retry loop (fresh auth header, circuit breaker, transport, classification) ->
// transforms -> cache store -> exactly one metrics record.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    auth::{AuthProvider, TokenInfo},
    cache::{CacheHealth, CacheManager, CachePolicy, InvalidationStrategy},
    circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState},
    error::{ApiError, ErrorContext, ErrorKind, TransportError},
    health::{HealthMonitor, HealthReport, HealthStatus, RequestMetrics},
    observer::{self, RequestObserver, RequestStarted},
    rate_limiter::{RateLimiter, RateLimiterStats},
    settings::{RetryConfig, Settings},
    transform::{DataTransformer, FieldTransform, Transforms},
    transport::{Connector, ReqwestConnector, Transport, TransportRequest, TransportResponse},
};

pub const DEFAULT_CACHE_CATEGORY: &str = "api_response";

const MAX_ERROR_TEXT: usize = 500;
const CACHE_HIT_DURATION_MS: f64 = 0.1;

/// Per-call options. Build with the chained setters:
/// `RequestOptions::new().param("arrivalDate", "2025-06-01").cached()`.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub params: Option<Map<String, Value>>,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub cache: bool,
    pub cache_category: Option<String>,
    pub transforms: Transforms,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("params", &self.params)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("cache", &self.cache)
            .field("cache_category", &self.cache_category)
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn cache_category(mut self, category: &str) -> Self {
        self.cache = true;
        self.cache_category = Some(category.to_string());
        self
    }

    pub fn transform<F>(mut self, path: &str, func: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let func: FieldTransform = Arc::new(func);
        self.transforms.insert(path.to_string(), func);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub status_code: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub metrics: Option<RequestMetrics>,
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ApiError>;

    async fn get(&self, endpoint: &str, opts: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request("GET", endpoint, opts).await
    }

    async fn post(&self, endpoint: &str, opts: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request("POST", endpoint, opts).await
    }

    async fn put(&self, endpoint: &str, opts: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request("PUT", endpoint, opts).await
    }

    async fn delete(&self, endpoint: &str, opts: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request("DELETE", endpoint, opts).await
    }

    async fn patch(&self, endpoint: &str, opts: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request("PATCH", endpoint, opts).await
    }

    async fn head(&self, endpoint: &str, opts: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request("HEAD", endpoint, opts).await
    }

    async fn options(&self, endpoint: &str, opts: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request("OPTIONS", endpoint, opts).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientHealth {
    pub status: HealthStatus,
    pub scope_id: String,
    pub base_url: String,
    pub session_active: bool,
    pub rate_limiter: Option<RateLimiterStats>,
    pub monitor: Option<HealthReport>,
    pub cache: Option<CacheHealth>,
    pub circuit_breaker: Option<CircuitSnapshot>,
    pub auth: TokenInfo,
    // Filled in by `health_check`.
    pub authentication_test: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct ResilientClient {
    settings: Settings,
    scope_id: String,
    auth: Arc<dyn AuthProvider>,
    connector: Arc<dyn Connector>,
    session: RwLock<Option<Arc<dyn Transport>>>,
    closed: AtomicBool,
    rate_limiter: Option<RateLimiter>,
    circuit_breaker: Option<CircuitBreaker>,
    cache: Option<Arc<CacheManager>>,
    monitor: Option<HealthMonitor>,
    transformer: DataTransformer,
    observer: Option<Arc<dyn RequestObserver>>,
}

// Everything one attempt needs; cloned per attempt so headers can carry a fresh token.
struct PreparedRequest {
    method: String,
    endpoint: String,
    url: String,
    query: Vec<(String, String)>,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    masked_body: Option<Value>,
    timeout: Duration,
    request_size: usize,
}

struct CacheSlot {
    category: String,
    identifier: String,
    params: Option<Value>,
}

impl ResilientClient {
    pub fn new(
        settings: Settings,
        scope_id: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, ApiError> {
        settings.validate()?;
        let scope_id = scope_id.into();
        if scope_id.trim().is_empty() {
            return Err(ApiError::Configuration("scope id must not be empty".to_string()));
        }

        let rate_limiter = settings
            .rate_limit
            .enabled
            .then(|| RateLimiter::from_config(&settings.rate_limit));

        let circuit_breaker = settings.circuit_breaker.enabled.then(|| {
            CircuitBreaker::from_config(scope_id.clone(), &settings.circuit_breaker).trips_on(|err| {
                matches!(
                    err.kind(),
                    ErrorKind::Timeout | ErrorKind::Api | ErrorKind::Unexpected
                )
            })
        });

        let cache = settings.cache.enabled.then(|| {
            Arc::new(
                CacheManager::new(scope_id.clone(), settings.cache.max_entries).with_policy(
                    DEFAULT_CACHE_CATEGORY,
                    CachePolicy::new(
                        settings.cache.ttl_seconds,
                        settings.cache.max_entries,
                        InvalidationStrategy::TimeBased,
                    ),
                ),
            )
        });

        let monitor = settings
            .enable_monitoring
            .then(|| HealthMonitor::new(settings.monitor_history));

        info!(
            scope_id = %scope_id,
            base_url = %settings.api_base_url(),
            rate_limiting = rate_limiter.is_some(),
            circuit_breaker = circuit_breaker.is_some(),
            caching = cache.is_some(),
            monitoring = monitor.is_some(),
            "API client initialized"
        );

        Ok(Self {
            settings,
            scope_id,
            auth,
            connector: Arc::new(ReqwestConnector),
            session: RwLock::new(None),
            closed: AtomicBool::new(false),
            rate_limiter,
            circuit_breaker,
            cache,
            monitor,
            transformer: DataTransformer::default(),
            observer: None,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn cache(&self) -> Option<&Arc<CacheManager>> {
        self.cache.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn monitor(&self) -> Option<&HealthMonitor> {
        self.monitor.as_ref()
    }

    // Double-checked so concurrent first requests build a single session.
    async fn session(&self) -> Result<Arc<dyn Transport>, ApiError> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }

        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = self.connector.connect(&self.settings).await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn execute(
        &self,
        method: String,
        endpoint: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ApiError::Configuration("client is closed".to_string()));
        }

        let started = Instant::now();
        let transport = self.session().await?;

        let cache_slot = self.cache_slot(&method, endpoint, &opts);
        if let (Some(cache), Some(slot)) = (&self.cache, &cache_slot) {
            if let Some(data) = cache.get(&slot.category, &slot.identifier, slot.params.as_ref()) {
                return Ok(self.cached_response(&method, endpoint, data));
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            let waited = limiter.wait_if_needed(1).await;
            if !waited.is_zero() {
                debug!(waited_ms = waited.as_millis() as u64, "rate limited before request");
            }
        }

        let prepared = self.prepare(&method, endpoint, &opts);
        debug!(
            method = %prepared.method,
            url = %prepared.url,
            body = %prepared.masked_body.as_ref().map(|b| b.to_string()).unwrap_or_default(),
            "API request prepared"
        );

        let max_retries = self.settings.retry.max_retries;
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(&transport, &prepared, attempt).await {
                Ok(response) => {
                    return self
                        .finish_success(&prepared, response, &opts, cache_slot, attempt, started)
                        .await;
                }
                Err(err) => {
                    let backoff = match err.kind() {
                        ErrorKind::Authentication => {
                            self.auth.invalidate_token().await;
                            Some(linear_backoff(attempt, &self.settings.retry))
                        }
                        ErrorKind::Timeout | ErrorKind::Api => {
                            Some(calculate_backoff(attempt, &self.settings.retry))
                        }
                        ErrorKind::Unexpected if attempt == 0 => Some(Duration::from_millis(
                            self.settings.retry.initial_backoff_ms,
                        )),
                        ErrorKind::Unexpected => None,
                        _ => {
                            error!(
                                error_type = %err.kind(),
                                error = %err,
                                retry_count = attempt,
                                "API request failed"
                            );
                            self.finish_failure(&prepared, &err, attempt, started).await;
                            return Err(err);
                        }
                    };

                    match backoff {
                        Some(delay) if attempt < max_retries => {
                            warn!(
                                error_type = %err.kind(),
                                error = %err,
                                attempt = attempt + 1,
                                backoff_ms = delay.as_millis() as u64,
                                "API request failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        _ => {
                            let err = ApiError::RetriesExhausted {
                                attempts: attempt + 1,
                                retry_count: attempt,
                                source: Box::new(err),
                            };
                            error!(
                                error_type = %err.kind(),
                                error = %err,
                                retry_count = attempt,
                                total_duration_ms = started.elapsed().as_secs_f64() * 1000.0,
                                "API request failed after retries"
                            );
                            self.finish_failure(&prepared, &err, attempt, started).await;
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn cache_slot(&self, method: &str, endpoint: &str, opts: &RequestOptions) -> Option<CacheSlot> {
        (self.cache.is_some() && opts.cache && method == "GET").then(|| CacheSlot {
            category: opts
                .cache_category
                .clone()
                .unwrap_or_else(|| DEFAULT_CACHE_CATEGORY.to_string()),
            identifier: format!("{method}:{endpoint}"),
            params: opts.params.clone().map(Value::Object),
        })
    }

    fn cached_response(&self, method: &str, endpoint: &str, data: Value) -> ApiResponse {
        debug!(method, endpoint, "serving response from cache");
        let metrics = RequestMetrics {
            status_code: Some(200),
            duration_ms: CACHE_HIT_DURATION_MS,
            response_size: serde_json::to_vec(&data).map(|v| v.len()).unwrap_or(0),
            ..RequestMetrics::new(method, endpoint, &self.scope_id)
        };
        self.record(&metrics);

        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            status_code: Some(200),
            headers: BTreeMap::new(),
            metrics: Some(metrics),
        }
    }

    fn prepare(&self, method: &str, endpoint: &str, opts: &RequestOptions) -> PreparedRequest {
        let url = format!(
            "{}/{}",
            self.settings.api_base_url(),
            endpoint.trim_start_matches('/')
        );
        let body = opts.body.as_ref().map(DataTransformer::sanitize);
        let request_size = body
            .as_ref()
            .and_then(|b| serde_json::to_vec(b).ok())
            .map_or(0, |b| b.len());

        let mut headers = BTreeMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
            ("x-hotelid".to_string(), self.scope_id.clone()),
            (
                "x-request-id".to_string(),
                format!("{}-{}", self.scope_id, Utc::now().timestamp_millis()),
            ),
        ]);
        headers.extend(opts.headers.clone());

        let mut timeout = self.settings.timeouts.effective_read(opts.timeout);
        if body.is_some() {
            timeout += Duration::from_millis(self.settings.timeouts.write_ms);
        }

        PreparedRequest {
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            url,
            query: opts.params.as_ref().map(query_pairs).unwrap_or_default(),
            headers,
            masked_body: body.as_ref().map(|b| self.transformer.mask(b)),
            body,
            timeout,
            request_size,
        }
    }

    async fn attempt(
        &self,
        transport: &Arc<dyn Transport>,
        prepared: &PreparedRequest,
        attempt: u32,
    ) -> Result<TransportResponse, ApiError> {
        match &self.circuit_breaker {
            Some(breaker) => {
                breaker
                    .call(|| self.send_once(transport, prepared, attempt))
                    .await
            }
            None => self.send_once(transport, prepared, attempt).await,
        }
    }

    async fn send_once(
        &self,
        transport: &Arc<dyn Transport>,
        prepared: &PreparedRequest,
        attempt: u32,
    ) -> Result<TransportResponse, ApiError> {
        let token = self.auth.get_token().await?;
        let (auth_name, auth_value) = self.auth.get_auth_header(&token);
        let mut headers = prepared.headers.clone();
        headers.insert(auth_name, auth_value);

        if let Some(observer) = &self.observer {
            let request_id = headers.get("x-request-id").cloned().unwrap_or_default();
            let result = observer
                .on_request(RequestStarted {
                    request_id: &request_id,
                    method: &prepared.method,
                    url: &prepared.url,
                    attempt: attempt + 1,
                    body: prepared.masked_body.as_ref(),
                })
                .await;
            observer::discard("on_request", result);
        }

        let request = TransportRequest {
            method: prepared.method.clone(),
            url: prepared.url.clone(),
            query: prepared.query.clone(),
            headers,
            body: prepared.body.clone(),
            timeout: prepared.timeout,
        };

        let sent_at = Instant::now();
        let result = transport.send(request).await;
        let duration_ms = sent_at.elapsed().as_secs_f64() * 1000.0;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    method = %prepared.method,
                    url = %prepared.url,
                    duration_ms,
                    attempt = attempt + 1,
                    error = %err,
                    "API transport error"
                );
                return Err(self.transport_error(err, prepared));
            }
        };

        info!(
            method = %prepared.method,
            url = %prepared.url,
            status_code = response.status,
            duration_ms,
            response_size = response.body.len(),
            retry_count = attempt,
            "API response"
        );

        if response.is_success() {
            Ok(response)
        } else {
            Err(classify_response(
                &response,
                &prepared.method,
                &prepared.url,
                &self.scope_id,
            ))
        }
    }

    fn transport_error(&self, err: TransportError, prepared: &PreparedRequest) -> ApiError {
        let context = Box::new(ErrorContext {
            url: prepared.url.clone(),
            method: prepared.method.clone(),
            scope_id: self.scope_id.clone(),
            ..Default::default()
        });
        match err {
            TransportError::Timeout(message) => ApiError::Timeout { message, context },
            TransportError::Connect(message) | TransportError::Request(message) => ApiError::Api {
                message,
                status_code: None,
                context,
            },
            TransportError::Other(message) => ApiError::Unexpected(message),
        }
    }

    async fn finish_success(
        &self,
        prepared: &PreparedRequest,
        response: TransportResponse,
        opts: &RequestOptions,
        cache_slot: Option<CacheSlot>,
        attempt: u32,
        started: Instant,
    ) -> Result<ApiResponse, ApiError> {
        let data = match decode_success_body(&response) {
            Ok(data) => data,
            Err(err) => {
                error!(error = %err, url = %prepared.url, "failed to process response body");
                self.finish_failure(prepared, &err, attempt, started).await;
                return Err(err);
            }
        };
        let data = if opts.transforms.is_empty() {
            data
        } else {
            DataTransformer::transform(data, &opts.transforms)
        };

        let metrics = RequestMetrics {
            status_code: Some(response.status),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            request_size: prepared.request_size,
            response_size: response.body.len(),
            retry_count: attempt,
            ..RequestMetrics::new(&prepared.method, &prepared.endpoint, &self.scope_id)
        };
        self.record(&metrics);

        if let (Some(cache), Some(slot)) = (&self.cache, cache_slot) {
            if response.status == 200 {
                cache.set(
                    &slot.category,
                    &slot.identifier,
                    data.clone(),
                    slot.params.as_ref(),
                    None,
                );
            }
        }

        if let Some(observer) = &self.observer {
            observer::discard("on_complete", observer.on_complete(&metrics, None).await);
        }

        Ok(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            status_code: Some(response.status),
            headers: response.headers,
            metrics: Some(metrics),
        })
    }

    async fn finish_failure(
        &self,
        prepared: &PreparedRequest,
        err: &ApiError,
        attempt: u32,
        started: Instant,
    ) {
        let metrics = RequestMetrics {
            status_code: err.status_code(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            request_size: prepared.request_size,
            retry_count: attempt,
            error_type: Some(err.kind()),
            ..RequestMetrics::new(&prepared.method, &prepared.endpoint, &self.scope_id)
        };
        self.record(&metrics);

        if let Some(observer) = &self.observer {
            observer::discard("on_complete", observer.on_complete(&metrics, Some(err)).await);
        }
    }

    fn record(&self, metrics: &RequestMetrics) {
        if let Some(monitor) = &self.monitor {
            monitor.record(metrics.clone());
        }
    }

    pub async fn health_status(&self) -> ClientHealth {
        let monitor = self.monitor.as_ref().map(HealthMonitor::status);
        let circuit_breaker = self.circuit_breaker.as_ref().map(CircuitBreaker::snapshot);

        let mut status = monitor
            .as_ref()
            .map_or(HealthStatus::Healthy, |report| report.status);
        if circuit_breaker
            .as_ref()
            .is_some_and(|cb| cb.state == CircuitState::Open)
        {
            status = status.max(HealthStatus::Degraded);
        }

        ClientHealth {
            status,
            scope_id: self.scope_id.clone(),
            base_url: self.settings.api_base_url(),
            session_active: self.session.read().await.is_some(),
            rate_limiter: self.rate_limiter.as_ref().map(RateLimiter::stats),
            monitor,
            cache: self.cache.as_ref().map(|c| c.health()),
            circuit_breaker,
            auth: self.auth.token_info(),
            authentication_test: None,
            timestamp: Utc::now(),
        }
    }

    /// `health_status` plus a live token fetch.
    pub async fn health_check(&self) -> ClientHealth {
        let mut health = self.health_status().await;
        match self.auth.get_token().await {
            Ok(_) => health.authentication_test = Some("ok".to_string()),
            Err(err) => {
                warn!(error = %err, "authentication self-test failed");
                health.authentication_test = Some(format!("error: {}", err.message()));
                health.status = HealthStatus::Unhealthy;
            }
        }
        health
    }

    pub async fn readiness(&self) -> bool {
        let health = self.health_check().await;
        !self.closed.load(Ordering::SeqCst)
            && health.status != HealthStatus::Unhealthy
            && health
                .circuit_breaker
                .map_or(true, |cb| cb.state != CircuitState::Open)
    }

    pub fn liveness(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Starts the cache sweep. Must be called from within a tokio runtime.
    pub fn start_background_tasks(&self) {
        if let Some(cache) = &self.cache {
            cache.start_background_sweep(Duration::from_secs(
                self.settings.cache.sweep_interval_seconds,
            ));
        }
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(cache) = &self.cache {
            cache.close().await;
        }
        info!(scope_id = %self.scope_id, "API client closed");
    }
}

#[async_trait]
impl ApiClient for ResilientClient {
    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let method = method.to_ascii_uppercase();
        let span = info_span!(
            "api_request",
            method = %method,
            endpoint = %endpoint,
            scope_id = %self.scope_id
        );
        self.execute(method, endpoint, opts).instrument(span).await
    }
}

/// Exponential backoff for timeouts and transport or server errors, capped at
/// `max_backoff_ms`, with optional jitter.
pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let base_backoff_ms = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powf(retry_attempt as f64))
    .min(config.max_backoff_ms as f64);

    let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
    let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

    Duration::from_millis(backoff_ms as u64)
}

// Authentication retries wait longer on each attempt, linearly.
fn linear_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(u64::from(retry_attempt) + 1)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    fn scalar(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    let mut pairs = Vec::new();
    for (key, value) in params {
        match value {
            Value::Null => {}
            Value::Array(items) => pairs.extend(
                items
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| (key.clone(), scalar(v))),
            ),
            other => pairs.push((key.clone(), scalar(other))),
        }
    }
    pairs
}

// Empty bodies decode to `{}`; text that is not JSON comes back as `raw_content`.
fn decode_success_body(response: &TransportResponse) -> Result<Value, ApiError> {
    if response.body.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    if let Ok(value) = serde_json::from_slice::<Value>(&response.body) {
        return Ok(value);
    }

    let text = std::str::from_utf8(&response.body).map_err(|e| {
        ApiError::Data(format!("response body is neither JSON nor UTF-8 text: {e}"))
    })?;
    warn!(status_code = response.status, "successful response was not JSON, returning raw content");
    Ok(json!({
        "raw_content": text,
        "content_type": response.header("content-type"),
    }))
}

/// Maps a non-2xx response onto the error taxonomy.
pub fn classify_response(
    response: &TransportResponse,
    method: &str,
    url: &str,
    scope_id: &str,
) -> ApiError {
    let status = response.status;
    let fallback = format!("HTTP {status}");

    let parsed = if response.body.is_empty() {
        None
    } else {
        serde_json::from_slice::<Value>(&response.body).ok()
    };

    let message = match &parsed {
        Some(Value::Object(map)) => ["error_description", "message", "detail", "error"]
            .iter()
            .find_map(|field| match map.get(*field) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Null) | Some(Value::String(_)) | None => None,
                Some(other) => Some(other.to_string()),
            })
            .unwrap_or(fallback),
        Some(_) => fallback,
        None => {
            let text: String = String::from_utf8_lossy(&response.body)
                .chars()
                .take(MAX_ERROR_TEXT)
                .collect();
            if text.is_empty() {
                fallback
            } else {
                text
            }
        }
    };

    let context = Box::new(ErrorContext {
        status_code: Some(status),
        url: url.to_string(),
        method: method.to_string(),
        headers: response.headers.clone(),
        scope_id: scope_id.to_string(),
        response_data: parsed,
    });

    match status {
        401 | 403 => ApiError::Authentication { message, context },
        404 => ApiError::ResourceNotFound { message, context },
        400 | 409 | 422 => ApiError::Validation { message, context },
        429 => ApiError::RateLimited {
            retry_after: response
                .header("retry-after")
                .and_then(|v| v.trim().parse().ok()),
            message,
            context,
        },
        504 => ApiError::Timeout { message, context },
        _ => ApiError::Api {
            message,
            status_code: Some(status),
            context,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::{MockAuth, MockBehavior, MockTransport};
    use bytes::Bytes;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.base_url = "https://pms.test".to_string();
        settings.retry.initial_backoff_ms = 100;
        settings
    }

    fn client_with(
        settings: Settings,
        transport: &MockTransport,
        auth: Arc<MockAuth>,
    ) -> ResilientClient {
        ResilientClient::new(settings, "HOTEL1", auth)
            .unwrap()
            .with_connector(Arc::new(transport.clone()))
    }

    fn client(transport: &MockTransport) -> ResilientClient {
        client_with(settings(), transport, Arc::new(MockAuth::new()))
    }

    fn response(status: u16, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            headers: BTreeMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_timing_out_exhausts_retries() {
        let transport = MockTransport::new(MockBehavior::timeout());
        let client = client(&transport);

        let err = client
            .get("reservations/R1", RequestOptions::new())
            .await
            .unwrap_err();

        assert_eq!(transport.attempts(), 4);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.retry_count(), 3);

        let report = client.monitor().unwrap().status();
        assert_eq!(report.total_requests, 1);
        assert_eq!(report.error_counts.get("timeout"), Some(&1));
    }

    #[tokio::test]
    async fn test_not_found_is_classified_and_not_retried() {
        let transport = MockTransport::new(MockBehavior::json(
            404,
            json!({"message": "Reservation not found"}),
        ));
        let client = client(&transport);

        let err = client
            .get("reservations/R404", RequestOptions::new())
            .await
            .unwrap_err();

        assert_eq!(transport.attempts(), 1);
        assert!(matches!(err, ApiError::ResourceNotFound { .. }));
        assert_eq!(err.message(), "Reservation not found");
        assert_eq!(err.retry_count(), 0);
        let context = err.context().unwrap();
        assert_eq!(context.url, "https://pms.test/v1/reservations/R404");
        assert_eq!(context.scope_id, "HOTEL1");
        assert_eq!(context.status_code, Some(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_invalidates_token_and_retries() {
        let transport = MockTransport::default();
        transport.push(MockBehavior::json(401, json!({"error": "invalid_token"})));
        let auth = Arc::new(MockAuth::new());
        let client = client_with(settings(), &transport, auth.clone());

        let response = client.get("guests/G1", RequestOptions::new()).await.unwrap();

        assert!(response.success);
        assert_eq!(auth.invalidations(), 1);
        let requests = transport.requests();
        assert_eq!(requests[0].headers["Authorization"], "Bearer token-0");
        assert_eq!(requests[1].headers["Authorization"], "Bearer token-1");
        assert_eq!(response.metrics.unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_then_success() {
        let transport = MockTransport::new(MockBehavior::json(200, json!({"rooms": 12})));
        transport.push(MockBehavior::json(503, json!({"detail": "maintenance"})));
        let client = client(&transport);

        let start = Instant::now();
        let response = client.get("inventory", RequestOptions::new()).await.unwrap();

        assert_eq!(response.data, Some(json!({"rooms": 12})));
        assert_eq!(transport.attempts(), 2);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_domain_errors_propagate_immediately() {
        let transport = MockTransport::new(
            MockBehavior::json(429, json!({"message": "slow down"})).with_header("Retry-After", "30"),
        );
        transport.push(MockBehavior::json(422, json!({"error_description": "bad dates"})));
        let client = client(&transport);

        let err = client.post("reservations", RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.message(), "bad dates");

        let err = client.get("availability", RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(30));
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_error_is_retried_once() {
        let transport = MockTransport::new(MockBehavior::Fail(TransportError::Other(
            "socket closed by peer".to_string(),
        )));
        let client = client(&transport);

        let err = client.get("folios", RequestOptions::new()).await.unwrap_err();

        assert_eq!(transport.attempts(), 2);
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert_eq!(err.retry_count(), 1);
    }

    #[tokio::test]
    async fn test_cached_get_skips_transport() {
        let transport = MockTransport::new(MockBehavior::json(200, json!({"status": "clean"})));
        let client = client(&transport);
        let opts = || RequestOptions::new().param("floor", 2).cached();

        let first = client.get("rooms/101", opts()).await.unwrap();
        let second = client.get("rooms/101", opts()).await.unwrap();

        assert_eq!(transport.attempts(), 1);
        assert_eq!(first.data, second.data);
        assert_eq!(second.status_code, Some(200));
        let metrics = second.metrics.unwrap();
        assert_eq!(metrics.retry_count, 0);
        assert_eq!(metrics.duration_ms, CACHE_HIT_DURATION_MS);

        client
            .post("rooms/101", RequestOptions::new().cached())
            .await
            .unwrap();
        client
            .post("rooms/101", RequestOptions::new().cached())
            .await
            .unwrap();
        assert_eq!(transport.attempts(), 3);
        assert_eq!(client.monitor().unwrap().history_len(), 4);
    }

    #[tokio::test]
    async fn test_cache_category_uses_its_policy() {
        let transport = MockTransport::new(MockBehavior::json(200, json!({"name": "Ada"})));
        let client = client(&transport);

        client
            .get("guests/G1", RequestOptions::new().cache_category("guest_profile"))
            .await
            .unwrap();

        let cache = client.cache().unwrap();
        assert_eq!(cache.invalidate(None, None, Some("profile_merges"), &[]), 1);
    }

    #[tokio::test]
    async fn test_request_headers_body_and_timeout() {
        let transport = MockTransport::default();
        let client = client(&transport);

        client
            .put(
                "/guests/G1",
                RequestOptions::new()
                    .body(json!({"firstName": "Ada", "middleName": "", "title": null}))
                    .header("x-app-key", "k")
                    .param("overwrite", true)
                    .timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();

        let request = &transport.requests()[0];
        assert_eq!(request.method, "PUT");
        assert_eq!(request.url, "https://pms.test/v1/guests/G1");
        assert_eq!(request.body, Some(json!({"firstName": "Ada"})));
        assert_eq!(request.query, vec![("overwrite".to_string(), "true".to_string())]);
        assert_eq!(request.timeout, Duration::from_secs(12));
        assert_eq!(request.headers["x-hotelid"], "HOTEL1");
        assert_eq!(request.headers["x-app-key"], "k");
        assert!(request.headers["x-request-id"].starts_with("HOTEL1-"));
        assert_eq!(request.headers["Content-Type"], "application/json");
    }

    #[tokio::test]
    async fn test_non_json_success_and_transforms() {
        let transport = MockTransport::new(MockBehavior::text(200, "text/plain", "PONG"));
        transport.push(MockBehavior::json(200, json!({"guest": {"name": "ada"}})));
        let client = client(&transport);

        let response = client
            .get(
                "guests/G1",
                RequestOptions::new().transform("guest.name", |v| {
                    Ok(Value::String(v.as_str().unwrap_or_default().to_uppercase()))
                }),
            )
            .await
            .unwrap();
        assert_eq!(response.data, Some(json!({"guest": {"name": "ADA"}})));

        let response = client.get("ping", RequestOptions::new()).await.unwrap();
        assert_eq!(
            response.data,
            Some(json!({"raw_content": "PONG", "content_type": "text/plain"}))
        );
    }

    #[tokio::test]
    async fn test_undecodable_success_body_is_recorded() {
        let transport = MockTransport::new(MockBehavior::Respond {
            status: 200,
            headers: vec![],
            body: Bytes::from_static(&[0xff, 0xfe, 0xfd]),
        });
        let client = client(&transport);

        let err = client.get("folios/F1", RequestOptions::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Data);
        assert_eq!(transport.attempts(), 1);
        let report = client.monitor().unwrap().status();
        assert_eq!(report.total_requests, 1);
        assert_eq!(report.error_counts.get("data"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_leaves_client_usable() {
        let transport = MockTransport::new(MockBehavior::json(200, json!({"rate": "BAR"})));
        transport.push(MockBehavior::json(500, json!({"message": "down"})));
        transport.push(
            MockBehavior::json(200, json!({"rate": "late"})).after(Duration::from_secs(100)),
        );
        let mut settings = settings();
        settings.retry.max_retries = 0;
        settings.circuit_breaker.failure_threshold = 1;
        let client = client_with(settings, &transport, Arc::new(MockAuth::new()));
        let opts = || RequestOptions::new().cached();

        let err = client.get("rates", opts()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
        tokio::time::advance(Duration::from_secs(61)).await;

        // Dropped while the half-open trial is still waiting on the transport.
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), client.get("rates", opts())).await;
        assert!(cancelled.is_err());
        assert_eq!(transport.attempts(), 2);

        let response = client.get("rates", opts()).await.unwrap();
        assert_eq!(response.data, Some(json!({"rate": "BAR"})));
        assert_eq!(client.circuit_breaker().unwrap().state(), CircuitState::Closed);

        let cached = client.get("rates", opts()).await.unwrap();
        assert_eq!(cached.data, response.data);
        assert_eq!(transport.attempts(), 3);

        let stats = client.cache().unwrap().stats();
        assert_eq!(stats.entries_count, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);

        let limiter = client.rate_limiter().unwrap().stats();
        assert!(limiter.current_tokens >= 0.0);
        assert!(limiter.current_tokens <= limiter.max_tokens);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_one_session() {
        let transport = MockTransport::default();
        let client = client(&transport);

        let endpoints: Vec<String> = (0..8).map(|i| format!("rooms/{i}")).collect();
        let results = futures::future::join_all(
            endpoints
                .iter()
                .map(|endpoint| client.get(endpoint, RequestOptions::new())),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.attempts(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_short_circuits() {
        let transport = MockTransport::new(MockBehavior::json(500, json!({"message": "down"})));
        let mut settings = settings();
        settings.retry.max_retries = 0;
        settings.circuit_breaker.failure_threshold = 2;
        let client = client_with(settings, &transport, Arc::new(MockAuth::new()));

        for _ in 0..2 {
            let err = client.get("rates", RequestOptions::new()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Api);
            assert_eq!(err.status_code(), Some(500));
        }

        let err = client.get("rates", RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(transport.attempts(), 2);

        let health = client.health_status().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!client.readiness().await);
    }

    #[tokio::test]
    async fn test_health_check_reports_auth_failure() {
        let transport = MockTransport::default();
        let auth = Arc::new(MockAuth::new());
        let client = client_with(settings(), &transport, auth.clone());

        let health = client.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.authentication_test.as_deref(), Some("ok"));
        assert!(!health.session_active);
        assert!(client.readiness().await);

        auth.set_failing(true);
        let health = client.health_check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(!client.readiness().await);
        assert!(client.liveness());
    }

    #[tokio::test]
    async fn test_close_tears_down_session_and_sweep() {
        let transport = MockTransport::default();
        let client = client(&transport);
        client.start_background_tasks();
        client.get("ping", RequestOptions::new()).await.unwrap();

        client.close().await;

        assert!(transport.is_closed());
        assert!(!client.cache().unwrap().sweep_running());
        assert!(!client.liveness());
        let err = client.get("ping", RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut settings = settings();
        settings.retry.max_retries = 11;
        let result = ResilientClient::new(settings, "HOTEL1", Arc::new(MockAuth::new()));
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Configuration));
    }

    #[test]
    fn test_backoff_schedules() {
        let config = RetryConfig {
            initial_backoff_ms: 1000,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(8));
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(60));
        assert_eq!(linear_backoff(2, &config), Duration::from_secs(3));

        let jittered = RetryConfig {
            jitter_factor: 0.5,
            ..config
        };
        for _ in 0..50 {
            let ms = calculate_backoff(1, &jittered).as_millis();
            assert!((1500..=2500).contains(&ms));
        }
    }

    #[test]
    fn test_classification_table() {
        let cases = [
            (401, ErrorKind::Authentication),
            (403, ErrorKind::Authentication),
            (400, ErrorKind::Validation),
            (409, ErrorKind::Validation),
            (418, ErrorKind::Api),
            (502, ErrorKind::Api),
            (504, ErrorKind::Timeout),
        ];
        for (status, kind) in cases {
            let err = classify_response(&response(status, ""), "GET", "u", "H");
            assert_eq!(err.kind(), kind, "status {status}");
            assert_eq!(err.message(), format!("HTTP {status}"));
        }

        let long = "x".repeat(900);
        let err = classify_response(&response(500, &long), "GET", "u", "H");
        assert_eq!(err.message().len(), MAX_ERROR_TEXT);

        let err = classify_response(&response(500, r#"{"error": "boom"}"#), "GET", "u", "H");
        assert_eq!(err.message(), "boom");
        assert_eq!(err.context().unwrap().response_data, Some(json!({"error": "boom"})));
    }
}
