// Rolling request metrics and health classification.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ErrorKind;

const STATUS_WINDOW_MINUTES: i64 = 5;
const TOP_ENDPOINTS: usize = 10;

/// One completed or failed logical request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub method: String,
    pub endpoint: String,
    pub status_code: Option<u16>,
    pub duration_ms: f64,
    pub request_size: usize,
    pub response_size: usize,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub error_type: Option<ErrorKind>,
    pub scope_id: String,
}

impl RequestMetrics {
    pub fn new(method: &str, endpoint: &str, scope_id: &str) -> Self {
        Self {
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            status_code: None,
            duration_ms: 0.0,
            request_size: 0,
            response_size: 0,
            retry_count: 0,
            timestamp: Utc::now(),
            error_type: None,
            scope_id: scope_id.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_type.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub count: u64,
    pub total_duration_ms: f64,
    pub error_count: u64,
    pub avg_duration_ms: f64,
}

// Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_error_rate(error_rate: f64) -> Self {
        if error_rate <= 0.05 {
            HealthStatus::Healthy
        } else if error_rate <= 0.10 {
            HealthStatus::Warning
        } else {
            HealthStatus::Degraded
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub endpoint: String,
    #[serde(flatten)]
    pub stats: EndpointStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_requests: usize,
    pub recent_requests: usize,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub error_counts: BTreeMap<String, u64>,
    pub status_codes: BTreeMap<u16, u64>,
    pub top_endpoints: Vec<EndpointReport>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HealthMonitor {
    max_history: usize,
    history: Mutex<VecDeque<RequestMetrics>>,
    error_counts: DashMap<ErrorKind, u64>,
    status_codes: DashMap<u16, u64>,
    endpoints: DashMap<String, EndpointStats>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl HealthMonitor {
    pub fn new(max_history: usize) -> Self {
        let max_history = max_history.max(1);
        Self {
            max_history,
            history: Mutex::new(VecDeque::with_capacity(max_history)),
            error_counts: DashMap::new(),
            status_codes: DashMap::new(),
            endpoints: DashMap::new(),
        }
    }

    pub fn record(&self, metrics: RequestMetrics) {
        if let Some(kind) = metrics.error_type {
            *self.error_counts.entry(kind).or_insert(0) += 1;
        }
        if let Some(code) = metrics.status_code {
            *self.status_codes.entry(code).or_insert(0) += 1;
        }

        {
            let mut stats = self
                .endpoints
                .entry(format!("{} {}", metrics.method, metrics.endpoint))
                .or_default();
            stats.count += 1;
            stats.total_duration_ms += metrics.duration_ms;
            if metrics.is_error() {
                stats.error_count += 1;
            }
            stats.avg_duration_ms = stats.total_duration_ms / stats.count as f64;
        }

        let mut history = self.history.lock();
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(metrics);
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn status(&self) -> HealthReport {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::minutes(STATUS_WINDOW_MINUTES);

        let (total_requests, recent, errors, total_duration) = {
            let history = self.history.lock();
            let mut recent = 0usize;
            let mut errors = 0usize;
            let mut total_duration = 0.0;
            for m in history.iter().filter(|m| m.timestamp >= cutoff) {
                recent += 1;
                total_duration += m.duration_ms;
                if m.is_error() {
                    errors += 1;
                }
            }
            (history.len(), recent, errors, total_duration)
        };

        let (error_rate, avg_response_time_ms) = if recent > 0 {
            (errors as f64 / recent as f64, total_duration / recent as f64)
        } else {
            (0.0, 0.0)
        };

        let mut top_endpoints: Vec<EndpointReport> = self
            .endpoints
            .iter()
            .map(|e| EndpointReport {
                endpoint: e.key().clone(),
                stats: e.value().clone(),
            })
            .collect();
        top_endpoints.sort_by(|a, b| {
            b.stats
                .count
                .cmp(&a.stats.count)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        top_endpoints.truncate(TOP_ENDPOINTS);

        HealthReport {
            status: HealthStatus::from_error_rate(error_rate),
            total_requests,
            recent_requests: recent,
            error_rate,
            avg_response_time_ms,
            error_counts: self
                .error_counts
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            status_codes: self
                .status_codes
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            top_endpoints,
            timestamp: now,
        }
    }
}
