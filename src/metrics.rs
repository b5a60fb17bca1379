/// Request metrics for source adapters
///
/// Tracks success rates, empty results and latency for each source, as
/// observed by the sync pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::Source;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMetrics {
    pub source: Source,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Successful calls that produced no items (search, chapters, pages).
    pub empty_results: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub average_response_time_ms: f64,
    pub total_response_time_ms: u64,
    pub rate_limit_hits: u64,
    pub timeout_count: u64,
}

impl SourceMetrics {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            empty_results: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            average_response_time_ms: 0.0,
            total_response_time_ms: 0,
            rate_limit_hits: 0,
            timeout_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.successful_requests as f64 / self.total_requests as f64) * 100.0
        }
    }

    pub fn record_success(&mut self, response_time: Duration, items: Option<usize>) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.last_success = Some(Utc::now());
        if items == Some(0) {
            self.empty_results += 1;
        }

        self.total_response_time_ms += response_time.as_millis() as u64;
        self.average_response_time_ms =
            self.total_response_time_ms as f64 / self.successful_requests as f64;
    }

    pub fn record_failure(&mut self, error: String) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.last_failure = Some(Utc::now());

        let lower = error.to_lowercase();
        if error.contains("429") || lower.contains("rate limit") {
            self.rate_limit_hits += 1;
        } else if lower.contains("timeout") || lower.contains("timed out") {
            self.timeout_count += 1;
        }
        self.last_error = Some(error);
    }
}

/// Shared per-source tracker
#[derive(Default)]
pub struct MetricsTracker {
    metrics: Mutex<BTreeMap<Source, SourceMetrics>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a panic mid-update of plain counters.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<Source, SourceMetrics>> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_success(&self, source: Source, response_time: Duration, items: Option<usize>) {
        let mut metrics = self.lock();
        let entry = metrics.entry(source).or_insert_with(|| SourceMetrics::new(source));
        entry.record_success(response_time, items);

        log::debug!(
            "[{}] Success - Response time: {}ms - Success rate: {:.2}%",
            source,
            response_time.as_millis(),
            entry.success_rate()
        );
    }

    pub fn record_failure(&self, source: Source, error: String) {
        let mut metrics = self.lock();
        let entry = metrics.entry(source).or_insert_with(|| SourceMetrics::new(source));
        entry.record_failure(error.clone());

        log::warn!(
            "[{}] Failure - Error: {} - Success rate: {:.2}%",
            source,
            error,
            entry.success_rate()
        );
    }

    pub fn get_metrics(&self, source: Source) -> Option<SourceMetrics> {
        self.lock().get(&source).cloned()
    }

    /// Snapshot ordered by source.
    pub fn get_all_metrics(&self) -> Vec<SourceMetrics> {
        self.lock().values().cloned().collect()
    }
}

/// Time a fallible adapter call and record the outcome.
pub async fn track_request<F, T, E>(tracker: &MetricsTracker, source: Source, operation: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let result = operation.await;
    match &result {
        Ok(_) => tracker.record_success(source, start.elapsed(), None),
        Err(e) => tracker.record_failure(source, e.to_string()),
    }
    result
}

/// Time a best-effort list call. A failure is recorded and degrades to an
/// empty list; an empty success counts as an empty result.
pub async fn track_list<F, T, E>(tracker: &MetricsTracker, source: Source, operation: F) -> Vec<T>
where
    F: Future<Output = Result<Vec<T>, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    match operation.await {
        Ok(items) => {
            tracker.record_success(source, start.elapsed(), Some(items.len()));
            items
        }
        Err(e) => {
            tracker.record_failure(source, e.to_string());
            Vec::new()
        }
    }
}
