// libs/video-consultation-cell/src/services/analytics.rs
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    AnalyticsEvent, AnalyticsEventType, CategoryCounts, EventCategory, QualitySample,
    SessionSummary,
};
use crate::services::backend::VideoBackend;
use crate::services::lock;

/// Typed, bounded telemetry buffers with best-effort delivery.
/// Nothing in here ever returns an error to the caller.
pub struct AnalyticsRecorder {
    backend: Arc<dyn VideoBackend>,
    session_id: Uuid,
    appointment_id: Uuid,
    started_at: DateTime<Utc>,
    bucket_capacity: usize,
    send_timeout: Duration,
    buckets: Mutex<HashMap<EventCategory, VecDeque<AnalyticsEvent>>>,
    counts: Mutex<CategoryCounts>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl AnalyticsRecorder {
    pub fn new(
        backend: Arc<dyn VideoBackend>,
        session_id: Uuid,
        appointment_id: Uuid,
        bucket_capacity: usize,
        send_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            session_id,
            appointment_id,
            started_at: Utc::now(),
            bucket_capacity: bucket_capacity.max(1),
            send_timeout,
            buckets: Mutex::new(HashMap::new()),
            counts: Mutex::new(CategoryCounts::default()),
            pending: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Appends the event to its bucket and fires a background send.
    pub fn log(&self, event_type: AnalyticsEventType, payload: Value) {
        let event = AnalyticsEvent {
            event_type,
            timestamp: Utc::now(),
            session_id: self.session_id,
            appointment_id: self.appointment_id,
            payload,
        };
        let category = event_type.category();

        {
            let mut buckets = lock(&self.buckets);
            let bucket = buckets.entry(category).or_default();
            if bucket.len() >= self.bucket_capacity {
                bucket.pop_front();
            }
            bucket.push_back(event.clone());
        }
        increment(&mut lock(&self.counts), category);

        debug!("Analytics {:?} recorded for session {}", event_type, self.session_id);
        self.send_in_background(event);
    }

    fn send_in_background(&self, event: AnalyticsEvent) {
        // Outside a runtime there is nothing to send with; the buffer keeps it.
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let backend = Arc::clone(&self.backend);
        let send_timeout = self.send_timeout;
        let handle = runtime.spawn(async move {
            match tokio::time::timeout(send_timeout, backend.send_analytics(&[event])).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Analytics send failed: {}", e),
                Err(_) => debug!("Analytics send timed out"),
            }
        });

        let mut pending = lock(&self.pending);
        pending.retain(|task| !task.is_finished());
        pending.push(handle);
    }

    /// Waits for every in-flight send to settle.
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> = lock(&self.pending).drain(..).collect();
        futures::future::join_all(pending).await;
    }

    pub fn events(&self, category: EventCategory) -> Vec<AnalyticsEvent> {
        lock(&self.buckets)
            .get(&category)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count_of(&self, event_type: AnalyticsEventType) -> usize {
        lock(&self.buckets)
            .get(&event_type.category())
            .map(|bucket| bucket.iter().filter(|e| e.event_type == event_type).count())
            .unwrap_or(0)
    }

    pub fn counts(&self) -> CategoryCounts {
        lock(&self.counts).clone()
    }

    pub fn summarize(
        &self,
        final_quality: Option<QualitySample>,
        reconnections: u32,
    ) -> SessionSummary {
        let ended_at = Utc::now();
        SessionSummary {
            session_id: self.session_id,
            appointment_id: self.appointment_id,
            started_at: self.started_at,
            ended_at,
            duration_seconds: (ended_at - self.started_at).num_seconds().max(0),
            event_counts: self.counts(),
            reconnections,
            final_quality,
        }
    }

    /// Summarizes and sends the summary once. Later calls return `None`.
    pub async fn finish(
        &self,
        final_quality: Option<QualitySample>,
        reconnections: u32,
    ) -> Option<SessionSummary> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return None;
        }

        let summary = self.summarize(final_quality, reconnections);
        info!(
            "Session {} summary: {}s, {} events, {} reconnections",
            summary.session_id,
            summary.duration_seconds,
            summary.event_counts.total(),
            summary.reconnections
        );

        match tokio::time::timeout(self.send_timeout, self.backend.send_summary(&summary)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to send session summary: {}", e),
            Err(_) => warn!("Session summary send timed out"),
        }

        Some(summary)
    }
}

fn increment(counts: &mut CategoryCounts, category: EventCategory) {
    match category {
        EventCategory::Connection => counts.connection += 1,
        EventCategory::Participant => counts.participant += 1,
        EventCategory::Error => counts.error += 1,
        EventCategory::Device => counts.device += 1,
        EventCategory::Network => counts.network += 1,
    }
}
