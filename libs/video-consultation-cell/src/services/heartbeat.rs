// libs/video-consultation-cell/src/services/heartbeat.rs
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::models::SessionState;
use crate::services::backend::VideoBackend;

const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Alive,
    /// The backend says the session was ended by the other party or expired.
    RemoteEnded,
    /// The ping itself failed; never a reason to end the session.
    Transient,
}

/// Periodic liveness ping while the session is active.
pub struct HeartbeatMonitor {
    backend: Arc<dyn VideoBackend>,
    session_id: Uuid,
    period: Duration,
    missed: AtomicU32,
}

impl HeartbeatMonitor {
    pub fn new(backend: Arc<dyn VideoBackend>, session_id: Uuid, period: Duration) -> Self {
        let period = if period.is_zero() {
            warn!("Heartbeat period must be non-zero, using {:?}", MIN_PERIOD);
            MIN_PERIOD
        } else {
            period
        };
        Self {
            backend,
            session_id,
            period,
            missed: AtomicU32::new(0),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Consecutive pings that failed at the network level.
    pub fn missed_beats(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn beat(&self) -> HeartbeatOutcome {
        match self.backend.heartbeat(self.session_id, SessionState::Active).await {
            Ok(response) if response.active => {
                self.missed.store(0, Ordering::SeqCst);
                debug!("Heartbeat acknowledged");
                HeartbeatOutcome::Alive
            }
            Ok(_) => {
                info!("Backend reports session {} is no longer active", self.session_id);
                HeartbeatOutcome::RemoteEnded
            }
            Err(e) => {
                let missed = self.missed.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Heartbeat failed ({} missed): {}", missed, e);
                HeartbeatOutcome::Transient
            }
        }
    }

    /// Pings once per period, starting one period from now, until
    /// `on_outcome` breaks or the task is aborted.
    pub async fn run<F>(&self, mut on_outcome: F)
    where
        F: FnMut(HeartbeatOutcome) -> ControlFlow<()> + Send,
    {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let outcome = self.beat().await;
            if on_outcome(outcome).is_break() {
                break;
            }
        }
    }
}
