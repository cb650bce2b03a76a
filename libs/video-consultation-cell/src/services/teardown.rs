// libs/video-consultation-cell/src/services/teardown.rs
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::QualitySample;
use crate::services::analytics::AnalyticsRecorder;
use crate::services::conference::ConferenceAdapter;
use crate::services::devices::MediaRegistry;
use crate::services::scheduler::ScheduledTasks;

/// What one teardown pass actually released.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub summary_sent: bool,
    pub conference_disposed: bool,
    pub streams_stopped: usize,
    pub tasks_cancelled: usize,
    pub ended: bool,
}

/// Releases every session resource exactly once.
pub struct TeardownManager {
    analytics: Arc<AnalyticsRecorder>,
    adapter: Arc<ConferenceAdapter>,
    registry: Arc<MediaRegistry>,
    tasks: Arc<ScheduledTasks>,
    cleanup_done: AtomicBool,
    runs: AtomicUsize,
}

impl TeardownManager {
    pub fn new(
        analytics: Arc<AnalyticsRecorder>,
        adapter: Arc<ConferenceAdapter>,
        registry: Arc<MediaRegistry>,
        tasks: Arc<ScheduledTasks>,
    ) -> Self {
        Self {
            analytics,
            adapter,
            registry,
            tasks,
            cleanup_done: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn is_done(&self) -> bool {
        self.cleanup_done.load(Ordering::SeqCst)
    }

    /// Completed teardown passes. Never more than one.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Runs the cleanup steps in order. Every step runs even if an earlier
    /// one failed. Returns `None` when cleanup already happened.
    pub async fn teardown<F>(
        &self,
        final_quality: Option<QualitySample>,
        reconnections: u32,
        mark_ended: F,
    ) -> Option<TeardownReport>
    where
        F: FnOnce() -> bool + Send,
    {
        if self.cleanup_done.swap(true, Ordering::SeqCst) {
            debug!("Teardown already done, skipping");
            return None;
        }

        let mut report = TeardownReport::default();

        // 1. final analytics
        report.summary_sent = self
            .analytics
            .finish(final_quality, reconnections)
            .await
            .is_some();
        self.analytics.flush().await;

        // 2. conference
        report.conference_disposed = self.adapter.dispose();

        // 3. local media
        report.streams_stopped = self.registry.stop_all();

        // 4. timers
        report.tasks_cancelled = self.tasks.cancel_all();

        // 5. state
        report.ended = mark_ended();
        if !report.ended {
            warn!("Session could not be marked ended during teardown");
        }

        self.runs.fetch_add(1, Ordering::SeqCst);
        info!(
            "Teardown complete: conference disposed={}, {} streams stopped, {} tasks cancelled",
            report.conference_disposed, report.streams_stopped, report.tasks_cancelled
        );
        Some(report)
    }
}
