use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Counters for the dispatch pipeline, shared by the scheduler and workers
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    stats: Arc<Mutex<DispatchStats>>,
}

/// How an execution ended from the task store's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEnd {
    Completed,
    Rescheduled,
    Failed,
    /// The job left RUNNING while in flight, the result was dropped
    Discarded,
    /// The status write kept failing
    Unpersisted,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchStats {
    pub start_time: DateTime<Utc>,

    pub dispatched: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub discarded: usize,
    pub unpersisted: usize,

    /// Fetches that ran without a proxy or without session cookies
    pub degraded_fetches: usize,

    /// HTTP status code counts
    pub status_codes: HashMap<u16, usize>,

    pub fetches: usize,
    pub total_fetch_ms: u64,
    pub max_fetch_ms: u64,
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            dispatched: 0,
            completed: 0,
            rescheduled: 0,
            failed: 0,
            discarded: 0,
            unpersisted: 0,
            degraded_fetches: 0,
            status_codes: HashMap::new(),
            fetches: 0,
            total_fetch_ms: 0,
            max_fetch_ms: 0,
        }
    }
}

impl DispatchStats {
    pub fn average_fetch_ms(&self) -> u64 {
        if self.fetches == 0 {
            0
        } else {
            self.total_fetch_ms / self.fetches as u64
        }
    }
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatched={} completed={} rescheduled={} failed={} discarded={} unpersisted={} degraded={} avg_fetch_ms={}",
            self.dispatched,
            self.completed,
            self.rescheduled,
            self.failed,
            self.discarded,
            self.unpersisted,
            self.degraded_fetches,
            self.average_fetch_ms(),
        )
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(Mutex::new(DispatchStats::default())),
        }
    }

    pub async fn record_dispatch(&self) {
        self.stats.lock().await.dispatched += 1;
    }

    /// Record one finished fetch
    pub async fn record_fetch(&self, latency: Duration, status_code: Option<u16>, degraded: bool) {
        let mut stats = self.stats.lock().await;
        let ms = latency.as_millis() as u64;

        stats.fetches += 1;
        stats.total_fetch_ms += ms;
        stats.max_fetch_ms = stats.max_fetch_ms.max(ms);

        if let Some(code) = status_code {
            *stats.status_codes.entry(code).or_default() += 1;
        }
        if degraded {
            stats.degraded_fetches += 1;
        }
    }

    pub async fn record_end(&self, end: ExecutionEnd) {
        let mut stats = self.stats.lock().await;
        match end {
            ExecutionEnd::Completed => stats.completed += 1,
            ExecutionEnd::Rescheduled => stats.rescheduled += 1,
            ExecutionEnd::Failed => stats.failed += 1,
            ExecutionEnd::Discarded => stats.discarded += 1,
            ExecutionEnd::Unpersisted => stats.unpersisted += 1,
        }
    }

    pub async fn snapshot(&self) -> DispatchStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_and_latency() {
        let metrics = DispatchMetrics::new();

        metrics.record_dispatch().await;
        metrics.record_dispatch().await;
        metrics.record_fetch(Duration::from_millis(100), Some(200), false).await;
        metrics.record_fetch(Duration::from_millis(300), Some(503), true).await;
        metrics.record_end(ExecutionEnd::Completed).await;
        metrics.record_end(ExecutionEnd::Rescheduled).await;

        let stats = metrics.snapshot().await;
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.rescheduled, 1);
        assert_eq!(stats.degraded_fetches, 1);
        assert_eq!(stats.status_codes[&503], 1);
        assert_eq!(stats.average_fetch_ms(), 200);
        assert_eq!(stats.max_fetch_ms, 300);
    }

    #[test]
    fn test_empty_average_is_zero() {
        assert_eq!(DispatchStats::default().average_fetch_ms(), 0);
    }
}
