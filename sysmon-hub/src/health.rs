use crate::state::StateStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Serialize, Deserialize)]
pub struct HubHealth {
    pub started_at: String,
    pub uptime_seconds: u64,
    pub engine_status: String,
    pub engine_reconnects: u32,
    pub samples_ingested: u64,
    pub records_discarded: u64,
    pub subscribers: usize,
    pub store_version: u64,
    pub memory_usage_mb: f32,
}

/// Counters shared by the ingestion loop, the broadcast handlers and the
/// `/system/health` route.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    started_at: OffsetDateTime,
    engine_status: Arc<Mutex<String>>,
    engine_reconnects: Arc<AtomicU32>,
    samples_ingested: Arc<AtomicU64>,
    records_discarded: Arc<AtomicU64>,
    subscribers: Arc<AtomicUsize>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            started_at: OffsetDateTime::now_utc(),
            engine_status: Arc::new(Mutex::new("connecting".to_string())),
            engine_reconnects: Arc::new(AtomicU32::new(0)),
            samples_ingested: Arc::new(AtomicU64::new(0)),
            records_discarded: Arc::new(AtomicU64::new(0)),
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn mark_engine_connected(&self) {
        *self.engine_status.lock() = "connected".to_string();
    }

    pub fn mark_engine_disconnected(&self) {
        *self.engine_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.engine_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample(&self) {
        self.samples_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.records_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_joined(&self) -> usize {
        self.subscribers.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn subscriber_left(&self) -> usize {
        self.subscribers.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn get_health(&self, store: &StateStore) -> HubHealth {
        HubHealth {
            started_at: self.started_at.format(&Rfc3339).unwrap_or_default(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            engine_status: self.engine_status.lock().clone(),
            engine_reconnects: self.engine_reconnects.load(Ordering::Relaxed),
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            records_discarded: self.records_discarded.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            store_version: store.version(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let tracker = HealthTracker::new();
        let store = StateStore::new();

        tracker.mark_engine_connected();
        tracker.record_sample();
        tracker.record_sample();
        tracker.record_discarded();
        tracker.increment_reconnects();
        assert_eq!(tracker.subscriber_joined(), 1);
        assert_eq!(tracker.subscriber_joined(), 2);
        assert_eq!(tracker.subscriber_left(), 1);

        let health = tracker.get_health(&store);
        assert_eq!(health.engine_status, "connected");
        assert_eq!(health.samples_ingested, 2);
        assert_eq!(health.records_discarded, 1);
        assert_eq!(health.engine_reconnects, 1);
        assert_eq!(health.subscribers, 1);
        assert_eq!(health.store_version, 0);
    }

    #[test]
    fn test_status_transitions() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.get_health(&StateStore::new()).engine_status, "connecting");
        tracker.mark_engine_disconnected();
        assert_eq!(tracker.get_health(&StateStore::new()).engine_status, "disconnected");
    }
}
