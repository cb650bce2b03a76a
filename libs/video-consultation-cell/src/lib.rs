// libs/video-consultation-cell/src/lib.rs
//! # Video Consultation Cell
//!
//! Client-side lifecycle controller for one appointment's video consultation:
//! preflight checks, starting or joining the conference, keeping it alive on
//! an unreliable network, telemetry, and guaranteed cleanup on every exit path.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                  Video Consultation Cell                      |
//! +---------------------------------------------------------------+
//! |  models.rs          |  State machine, DTOs, errors            |
//! |  services/                                                    |
//! |    controller.rs    |  SessionController (orchestrator)       |
//! |    backend.rs       |  Appointment-scoped video REST client   |
//! |    conference.rs    |  Conferencing engine adapter            |
//! |    preflight.rs     |  Browser / network / permission checks  |
//! |    devices.rs       |  Device probe and local media registry  |
//! |    heartbeat.rs     |  Backend liveness ping                  |
//! |    quality.rs       |  Connection quality sampling            |
//! |    reconnection.rs  |  Backoff and recovery strategy          |
//! |    analytics.rs     |  Typed telemetry buffers                |
//! |    scheduler.rs     |  Cancellable background tasks           |
//! |    teardown.rs      |  One-shot resource release              |
//! +---------------------------------------------------------------+
//! ```
//!
//! ## Session lifecycle
//!
//! `Idle -> Preflight -> DeviceSetup -> Starting/Joining -> Active`, with
//! `Active <-> Reconnecting` on connection drops, `Failed` when recovery is
//! impossible, and a forced `Ending -> Ended` from anywhere.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shared_config::AppConfig;
//! use uuid::Uuid;
//! use video_consultation_cell::models::{ConsultationConfig, EndReason, ParticipantRole};
//! use video_consultation_cell::services::{
//!     ConferenceEngine, ClientEnvironment, HttpLatencyProbe, MediaDevices,
//!     SessionController, SessionDependencies, VideoBackendClient,
//! };
//!
//! # async fn example(
//! #     engine: Arc<dyn ConferenceEngine>,
//! #     media: Arc<dyn MediaDevices>,
//! #     environment: Arc<dyn ClientEnvironment>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_env();
//! let appointment_id = Uuid::new_v4();
//!
//! let controller = SessionController::new(
//!     appointment_id,
//!     ParticipantRole::from_user_role(Some("doctor")),
//!     ConsultationConfig::from_app_config(&config),
//!     SessionDependencies {
//!         backend: Arc::new(VideoBackendClient::new(&config, appointment_id)?),
//!         engine,
//!         media,
//!         environment,
//!         network: Arc::new(HttpLatencyProbe::new(&config.latency_probe_url)?),
//!     },
//! );
//! controller.spawn_event_dispatcher();
//!
//! let checks = controller.run_preflight().await?;
//! if checks.can_join() {
//!     controller.start_or_join_session().await?;
//! }
//!
//! controller.end_session(EndReason::UserEnded).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! - `CLINIC_API_BASE_URL` - backend base URL
//! - `CLINIC_API_TOKEN` - bearer token for the backend
//! - `VIDEO_LATENCY_PROBE_URL` - asset used for the latency probe
//! - `VIDEO_HEARTBEAT_INTERVAL_SECS`, `VIDEO_QUALITY_SAMPLE_INTERVAL_SECS`,
//!   `VIDEO_MAX_RECONNECTION_ATTEMPTS` and friends - session tunables

pub mod models;
pub mod services;

// Re-export commonly used types
pub use models::{
    ConsultationConfig, EndReason, FailureScreen, LifecycleTrigger, ParticipantRole, RetryMode,
    SessionData, SessionState, SystemCheckResult, VideoConsultationError,
};

pub use services::{
    AnalyticsRecorder, ConferenceAdapter, DeviceProbe, PreflightChecker, SessionController,
    SessionDependencies, VideoBackendClient,
};
