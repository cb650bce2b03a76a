// libs/video-consultation-cell/src/services/quality.rs
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::models::QualitySample;
use crate::services::conference::ConferenceAdapter;
use crate::services::lock;
use crate::services::preflight::ClientEnvironment;

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Samples conference and network state into a bounded buffer.
/// Telemetry only; nothing here drives the state machine.
pub struct QualityMonitor {
    adapter: Arc<ConferenceAdapter>,
    environment: Arc<dyn ClientEnvironment>,
    period: Duration,
    capacity: usize,
    samples: Mutex<VecDeque<QualitySample>>,
}

impl QualityMonitor {
    pub fn new(
        adapter: Arc<ConferenceAdapter>,
        environment: Arc<dyn ClientEnvironment>,
        period: Duration,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let period = if period.is_zero() {
            warn!("Quality sample period must be non-zero, using {:?}", MIN_PERIOD);
            MIN_PERIOD
        } else {
            period
        };
        Self {
            adapter,
            environment,
            period,
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Takes one sample. Returns `None` when no conference is live.
    pub fn sample(&self) -> Option<QualitySample> {
        let status = self.adapter.status()?;
        let sample = QualitySample {
            timestamp: Utc::now(),
            connection_state: status.connection_state,
            participant_count: status.participant_count,
            audio_muted: status.audio_muted,
            video_muted: status.video_muted,
            screen_sharing: status.screen_sharing,
            network_info: self.environment.network_info(),
        };

        let mut samples = lock(&self.samples);
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample.clone());
        Some(sample)
    }

    pub fn latest(&self) -> Option<QualitySample> {
        lock(&self.samples).back().cloned()
    }

    pub fn samples(&self) -> Vec<QualitySample> {
        lock(&self.samples).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples once per period, starting one period from now.
    pub async fn run(&self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.sample().is_none() {
                debug!("Quality sample skipped, no live conference");
            }
        }
    }
}
