// libs/video-consultation-cell/src/services/reconnection.rs
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::{ConsultationConfig, FailureKind};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectionPolicy {
    pub fn from_config(config: &ConsultationConfig) -> Self {
        Self {
            max_attempts: config.max_reconnection_attempts,
            base_delay: config.reconnection_base_delay,
            max_delay: config.reconnection_max_delay,
        }
    }

    /// `min(base * 2^(attempt - 1), max)` for a 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// How to recover from one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Rejoin with the backoff schedule, re-validating the session first.
    Backoff,
    /// One immediate rejoin with lobby and bot detection relaxed.
    FallbackRetry,
    /// Ask for device access again, then back off.
    PermissionRequest,
}

/// Attempt counter and the single in-flight recovery slot.
pub struct ReconnectionManager {
    policy: ReconnectionPolicy,
    attempts: AtomicU32,
    in_flight: AtomicBool,
    fallback_used: AtomicBool,
    recoveries: AtomicU32,
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            fallback_used: AtomicBool::new(false),
            recoveries: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful recoveries over the whole session.
    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claims the recovery slot. `None` if a recovery is already running;
    /// the running one keeps its counter.
    pub fn try_begin(self: &Arc<Self>) -> Option<RecoveryGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RecoveryGuard {
                manager: Arc::clone(self),
            })
    }

    pub fn plan(&self, kind: FailureKind) -> RecoveryPlan {
        let plan = match kind {
            FailureKind::ConferenceAuth if self.claim_fallback() => RecoveryPlan::FallbackRetry,
            FailureKind::ConferenceAuth => RecoveryPlan::Backoff,
            FailureKind::PermissionDenied => RecoveryPlan::PermissionRequest,
            // Device failures are normally degraded in place without a plan;
            // handed to a plan they rebuild the conference like any other drop.
            FailureKind::CameraFailure
            | FailureKind::MicrophoneFailure
            | FailureKind::ConnectionLost
            | FailureKind::NetworkFailure => RecoveryPlan::Backoff,
        };
        debug!("Recovery plan for {:?}: {:?}", kind, plan);
        plan
    }

    /// The relaxed-config retry is one-shot until the next successful join.
    pub fn claim_fallback(&self) -> bool {
        !self.fallback_used.swap(true, Ordering::SeqCst)
    }

    /// Counts the next backoff attempt and returns its number and delay,
    /// or `None` once the cap is reached.
    pub fn next_attempt(&self) -> Option<(u32, Duration)> {
        let max = self.policy.max_attempts;
        self.attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|previous| {
                let attempt = previous + 1;
                (attempt, self.policy.delay_for(attempt))
            })
    }

    pub fn record_success(&self) {
        let attempts = self.attempts.swap(0, Ordering::SeqCst);
        self.fallback_used.store(false, Ordering::SeqCst);
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        info!("Recovered after {} backoff attempts", attempts);
    }

    /// Fresh start: counter and fallback claim cleared.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.fallback_used.store(false, Ordering::SeqCst);
    }
}

/// Holds the in-flight slot; releasing happens on drop, including abort.
pub struct RecoveryGuard {
    manager: Arc<ReconnectionManager>,
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.manager.in_flight.store(false, Ordering::SeqCst);
    }
}
