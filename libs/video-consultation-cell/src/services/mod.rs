// libs/video-consultation-cell/src/services/mod.rs
use std::sync::{Mutex, MutexGuard};

pub mod analytics;
pub mod backend;
pub mod conference;
pub mod controller;
pub mod devices;
pub mod heartbeat;
pub mod preflight;
pub mod quality;
pub mod reconnection;
pub mod scheduler;
pub mod teardown;

pub use analytics::AnalyticsRecorder;
pub use backend::{VideoBackend, VideoBackendClient};
pub use conference::{ConferenceAdapter, ConferenceEngine, ConferenceHandle};
pub use controller::{SessionController, SessionDependencies};
pub use devices::{DeviceProbe, MediaDevices, MediaRegistry, MediaStream};
pub use heartbeat::{HeartbeatMonitor, HeartbeatOutcome};
pub use preflight::{ClientEnvironment, HttpLatencyProbe, NetworkProbe, PreflightChecker};
pub use quality::QualityMonitor;
pub use reconnection::{ReconnectionManager, RecoveryPlan};
pub use scheduler::{ScheduledTasks, TaskKind};
pub use teardown::{TeardownManager, TeardownReport};

/// Locks a std mutex, recovering the data if a panicking task poisoned it.
/// None of the guarded values can be left half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
