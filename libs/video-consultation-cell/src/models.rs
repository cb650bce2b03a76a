// libs/video-consultation-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use shared_config::AppConfig;

// ==============================================================================
// SESSION STATE MACHINE
// ==============================================================================

/// Lifecycle state of one appointment's video session.
/// The controller's transition function is the only writer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "preflight")]
    Preflight,
    #[serde(rename = "device_setup")]
    DeviceSetup,
    #[serde(rename = "starting")]
    Starting,        // Host is starting the conference
    #[serde(rename = "joining")]
    Joining,         // Other party is joining
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "reconnecting")]
    Reconnecting,
    #[serde(rename = "ending")]
    Ending,
    #[serde(rename = "ended")]
    Ended,
    #[serde(rename = "failed")]
    Failed,
}

impl SessionState {
    /// Whether `self -> next` is one of the enumerated transitions.
    /// The forced `* -> Ending` edge is allowed from every state that has not
    /// already started ending.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Ending {
            return !matches!(self, Ending | Ended);
        }

        matches!(
            (self, next),
            (Idle, Preflight)
                | (Preflight, DeviceSetup)
                | (Preflight, Failed)
                | (DeviceSetup, Starting)
                | (DeviceSetup, Joining)
                | (Starting, Active)
                | (Joining, Active)
                | (Starting, Failed)
                | (Joining, Failed)
                | (Active, Reconnecting)
                | (Reconnecting, Active)
                | (Reconnecting, Failed)
                | (Failed, Starting)
                | (Failed, Joining)
                | (Ending, Ended)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended)
    }

    /// States in which a conference handle may legitimately be live.
    pub fn holds_conference(self) -> bool {
        matches!(
            self,
            SessionState::Starting
                | SessionState::Joining
                | SessionState::Active
                | SessionState::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Preflight => "preflight",
            SessionState::DeviceSetup => "device_setup",
            SessionState::Starting => "starting",
            SessionState::Joining => "joining",
            SessionState::Active => "active",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which side of the consultation this client is.
/// The host starts the conference, the guest joins it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParticipantRole {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "guest")]
    Guest,
}

impl ParticipantRole {
    /// Doctors, specialists and nurses host; patients and everyone else join.
    pub fn from_user_role(role: Option<&str>) -> Self {
        match role {
            Some("doctor") | Some("specialist") | Some("nurse") => ParticipantRole::Host,
            _ => ParticipantRole::Guest,
        }
    }

    pub fn entry_state(self) -> SessionState {
        match self {
            ParticipantRole::Host => SessionState::Starting,
            ParticipantRole::Guest => SessionState::Joining,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EndReason {
    #[serde(rename = "user_ended")]
    UserEnded,
    #[serde(rename = "remote_ended")]
    RemoteEnded,
    #[serde(rename = "conference_left")]
    ConferenceLeft,
    #[serde(rename = "tab_closed")]
    TabClosed,
    #[serde(rename = "navigation")]
    Navigation,
    #[serde(rename = "page_hidden")]
    PageHidden,
    #[serde(rename = "abandoned")]
    Abandoned,
}

/// Browser lifecycle signals that force the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTrigger {
    TabClosed,
    Navigation,
    PageHidden,
}

impl From<LifecycleTrigger> for EndReason {
    fn from(trigger: LifecycleTrigger) -> Self {
        match trigger {
            LifecycleTrigger::TabClosed => EndReason::TabClosed,
            LifecycleTrigger::Navigation => EndReason::Navigation,
            LifecycleTrigger::PageHidden => EndReason::PageHidden,
        }
    }
}

// ==============================================================================
// SESSION DATA
// ==============================================================================

/// Conferencing-engine overrides supplied by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceConfig {
    #[serde(default)]
    pub start_audio_only: bool,
    #[serde(default)]
    pub start_with_audio_muted: bool,
    #[serde(default)]
    pub start_with_video_muted: bool,
    #[serde(default)]
    pub lobby_enabled: bool,
    #[serde(default)]
    pub bot_detection_enabled: bool,
    #[serde(default)]
    pub prejoin_page_enabled: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConferenceConfig {
    /// Variant used for the one-shot retry after an auth/membership failure:
    /// lobby, bot detection and the prejoin page are switched off.
    pub fn relaxed(&self) -> Self {
        Self {
            lobby_enabled: false,
            bot_detection_enabled: false,
            prejoin_page_enabled: false,
            ..self.clone()
        }
    }

    pub fn audio_only(&self) -> Self {
        Self {
            start_audio_only: true,
            start_with_video_muted: true,
            ..self.clone()
        }
    }
}

/// Backend grant for `POST /video/start` and `POST /video/join`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSessionGrant {
    pub room_name: String,
    pub join_token: String,
    pub domain: String,
    #[serde(default)]
    pub config: ConferenceConfig,
}

impl fmt::Debug for VideoSessionGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoSessionGrant")
            .field("room_name", &self.room_name)
            .field("join_token", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("config", &self.config)
            .finish()
    }
}

/// Everything needed to enter the room, owned by the controller until the
/// session ends or fails.
#[derive(Clone, PartialEq)]
pub struct SessionData {
    pub room_name: String,
    pub join_token: String,
    pub domain: String,
    pub config: ConferenceConfig,
    pub granted_at: DateTime<Utc>,
}

impl SessionData {
    pub fn from_grant(grant: VideoSessionGrant) -> Self {
        Self {
            room_name: grant.room_name,
            join_token: grant.join_token,
            domain: grant.domain,
            config: grant.config,
            granted_at: Utc::now(),
        }
    }

    pub fn join_request(&self, config: ConferenceConfig) -> JoinRequest {
        JoinRequest {
            room_name: self.room_name.clone(),
            token: self.join_token.clone(),
            domain: self.domain.clone(),
            config,
        }
    }
}

impl fmt::Debug for SessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionData")
            .field("room_name", &self.room_name)
            .field("join_token", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("config", &self.config)
            .field("granted_at", &self.granted_at)
            .finish()
    }
}

/// Arguments handed to the conferencing engine's `join`.
#[derive(Clone, PartialEq)]
pub struct JoinRequest {
    pub room_name: String,
    pub token: String,
    pub domain: String,
    pub config: ConferenceConfig,
}

impl fmt::Debug for JoinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinRequest")
            .field("room_name", &self.room_name)
            .field("token", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("config", &self.config)
            .finish()
    }
}

// ==============================================================================
// BACKEND API MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatusResponse {
    pub can_join: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResponse {
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub session_id: Uuid,
    pub state: SessionState,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub session_id: Uuid,
    pub reason: EndReason,
}

// ==============================================================================
// PREFLIGHT MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PreflightCheck {
    #[serde(rename = "browser")]
    Browser,
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "permissions")]
    Permissions,
}

impl fmt::Display for PreflightCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreflightCheck::Browser => f.write_str("browser"),
            PreflightCheck::Network => f.write_str("network"),
            PreflightCheck::Permissions => f.write_str("permissions"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self { passed: true, detail: detail.into() }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self { passed: false, detail: detail.into() }
    }
}

/// Latency bands reported by the network probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionQuality {
    #[serde(rename = "excellent")]
    Excellent,
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "fair")]
    Fair,
    #[serde(rename = "poor")]
    Poor,
}

impl ConnectionQuality {
    /// <100 ms excellent, <300 ms good, <600 ms fair, anything slower poor.
    pub fn from_round_trip(rtt: Duration) -> Self {
        match rtt.as_millis() {
            0..=99 => ConnectionQuality::Excellent,
            100..=299 => ConnectionQuality::Good,
            300..=599 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkCheckOutcome {
    pub quality: Option<ConnectionQuality>,
    pub round_trip_ms: Option<u64>,
    pub detail: String,
}

/// Verdict of one preflight run. Only browser and permissions gate the join;
/// the network result is advisory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemCheckResult {
    pub browser: CheckOutcome,
    pub network: NetworkCheckOutcome,
    pub permissions: CheckOutcome,
    pub checked_at: DateTime<Utc>,
}

impl SystemCheckResult {
    pub fn browser_ok(&self) -> bool {
        self.browser.passed
    }

    pub fn network_ok(&self) -> bool {
        !matches!(self.network.quality, None | Some(ConnectionQuality::Poor))
    }

    pub fn permissions_ok(&self) -> bool {
        self.permissions.passed
    }

    /// Whether the join action should be enabled.
    pub fn can_join(&self) -> bool {
        self.browser_ok() && self.permissions_ok()
    }

    pub fn first_blocking_failure(&self) -> Option<(PreflightCheck, &str)> {
        if !self.browser.passed {
            return Some((PreflightCheck::Browser, self.browser.detail.as_str()));
        }
        if !self.permissions.passed {
            return Some((PreflightCheck::Permissions, self.permissions.detail.as_str()));
        }
        None
    }
}

// ==============================================================================
// DEVICE MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    #[serde(rename = "camera")]
    Camera,
    #[serde(rename = "microphone")]
    Microphone,
    #[serde(rename = "speaker")]
    Speaker,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Camera => f.write_str("camera"),
            DeviceKind::Microphone => f.write_str("microphone"),
            DeviceKind::Speaker => f.write_str("speaker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInventory {
    pub cameras: Vec<MediaDeviceInfo>,
    pub microphones: Vec<MediaDeviceInfo>,
    pub speakers: Vec<MediaDeviceInfo>,
}

impl DeviceInventory {
    pub fn from_devices(devices: Vec<MediaDeviceInfo>) -> Self {
        let mut inventory = Self::default();
        for device in devices {
            match device.kind {
                DeviceKind::Camera => inventory.cameras.push(device),
                DeviceKind::Microphone => inventory.microphones.push(device),
                DeviceKind::Speaker => inventory.speakers.push(device),
            }
        }
        inventory
    }

    pub fn contains(&self, kind: DeviceKind, device_id: &str) -> bool {
        let list = match kind {
            DeviceKind::Camera => &self.cameras,
            DeviceKind::Microphone => &self.microphones,
            DeviceKind::Speaker => &self.speakers,
        };
        list.iter().any(|d| d.device_id == device_id)
    }
}

/// Constraints for opening a local stream. `None` means "any device".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub camera_id: Option<String>,
    pub microphone_id: Option<String>,
}

impl MediaConstraints {
    pub fn audio_and_video() -> Self {
        Self { video: true, audio: true, ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceSelection {
    pub camera_id: Option<String>,
    pub microphone_id: Option<String>,
    pub speaker_id: Option<String>,
}

// ==============================================================================
// CONFERENCE EVENTS & STATUS
// ==============================================================================

/// Error classes the conferencing engine can report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConferenceErrorKind {
    #[serde(rename = "connection_dropped")]
    ConnectionDropped,
    #[serde(rename = "conference_auth")]
    ConferenceAuth,
    #[serde(rename = "permission_denied")]
    PermissionDenied,
    #[serde(rename = "camera")]
    Camera,
    #[serde(rename = "microphone")]
    Microphone,
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "session_invalid")]
    SessionInvalid,
    #[serde(rename = "other")]
    Other,
}

/// Normalized event stream of the conference adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ConferenceEvent {
    Joined { room_name: String },
    Left,
    ParticipantJoined { participant_id: String },
    ParticipantLeft { participant_id: String },
    QualityChanged { quality: ConnectionQuality },
    Error { kind: ConferenceErrorKind, message: String },
}

impl ConferenceEvent {
    pub fn error(kind: ConferenceErrorKind, message: impl Into<String>) -> Self {
        ConferenceEvent::Error { kind, message: message.into() }
    }

    pub fn connection_dropped() -> Self {
        Self::error(ConferenceErrorKind::ConnectionDropped, "connection dropped")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    #[serde(rename = "connecting")]
    Connecting,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "interrupted")]
    Interrupted,
    #[serde(rename = "disconnected")]
    Disconnected,
}

/// Read-only snapshot of the live conference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConferenceStatus {
    pub connection_state: ConnectionState,
    pub participant_count: u32,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub screen_sharing: bool,
}

/// Network-interface hints where the platform exposes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkInfo {
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualitySample {
    pub timestamp: DateTime<Utc>,
    pub connection_state: ConnectionState,
    pub participant_count: u32,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub screen_sharing: bool,
    pub network_info: Option<NetworkInfo>,
}

// ==============================================================================
// ANALYTICS MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventCategory {
    #[serde(rename = "connection")]
    Connection,
    #[serde(rename = "participant")]
    Participant,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "device")]
    Device,
    #[serde(rename = "network")]
    Network,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    SessionInitialized,
    PreflightCompleted,
    JoinRequested,
    ConferenceJoined,
    ConferenceLeft,
    SessionEnded,
    ReconnectionStarted,
    ReconnectionSucceeded,
    ReconnectionFailed,
    ParticipantJoined,
    ParticipantLeft,
    ConferenceError,
    SessionFailed,
    HeartbeatLost,
    DeviceSwitched,
    DeviceError,
    AudioOnlyEnabled,
    PermissionRequested,
    QualityChanged,
    NetworkProbe,
}

impl AnalyticsEventType {
    pub fn category(self) -> EventCategory {
        use AnalyticsEventType::*;
        match self {
            SessionInitialized | JoinRequested | ConferenceJoined | ConferenceLeft
            | SessionEnded | ReconnectionStarted | ReconnectionSucceeded => EventCategory::Connection,
            ParticipantJoined | ParticipantLeft => EventCategory::Participant,
            ConferenceError | SessionFailed | HeartbeatLost | ReconnectionFailed => {
                EventCategory::Error
            }
            DeviceSwitched | DeviceError | AudioOnlyEnabled | PermissionRequested => {
                EventCategory::Device
            }
            QualityChanged | NetworkProbe | PreflightCompleted => EventCategory::Network,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    #[serde(rename = "type")]
    pub event_type: AnalyticsEventType,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub appointment_id: Uuid,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryCounts {
    pub connection: usize,
    pub participant: usize,
    pub error: usize,
    pub device: usize,
    pub network: usize,
}

impl CategoryCounts {
    pub fn total(&self) -> usize {
        self.connection + self.participant + self.error + self.device + self.network
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub appointment_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub event_counts: CategoryCounts,
    pub reconnections: u32,
    pub final_quality: Option<QualitySample>,
}

// ==============================================================================
// FAILURE HANDLING MODELS
// ==============================================================================

/// Recovery input: what went wrong, reduced to what the strategy needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    #[serde(rename = "connection_lost")]
    ConnectionLost,
    #[serde(rename = "conference_auth")]
    ConferenceAuth,
    #[serde(rename = "permission_denied")]
    PermissionDenied,
    #[serde(rename = "camera")]
    CameraFailure,
    #[serde(rename = "microphone")]
    MicrophoneFailure,
    #[serde(rename = "network")]
    NetworkFailure,
}

impl FailureKind {
    pub fn from_conference_error(kind: &ConferenceErrorKind) -> Option<Self> {
        match kind {
            ConferenceErrorKind::ConnectionDropped => Some(FailureKind::ConnectionLost),
            ConferenceErrorKind::ConferenceAuth => Some(FailureKind::ConferenceAuth),
            ConferenceErrorKind::PermissionDenied => Some(FailureKind::PermissionDenied),
            ConferenceErrorKind::Camera => Some(FailureKind::CameraFailure),
            ConferenceErrorKind::Microphone => Some(FailureKind::MicrophoneFailure),
            ConferenceErrorKind::Network => Some(FailureKind::NetworkFailure),
            ConferenceErrorKind::SessionInvalid | ConferenceErrorKind::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureOption {
    #[serde(rename = "retry")]
    Retry,
    #[serde(rename = "audio_only")]
    AudioOnly,
    #[serde(rename = "abandon")]
    Abandon,
}

/// What the user sees once the session lands in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureScreen {
    pub message: String,
    pub permission_related: bool,
    pub options: Vec<FailureOption>,
    pub failed_at: DateTime<Utc>,
}

impl FailureScreen {
    pub fn new(error: &VideoConsultationError) -> Self {
        Self {
            message: error.to_string(),
            permission_related: matches!(error, VideoConsultationError::PermissionDenied { .. }),
            options: vec![FailureOption::Retry, FailureOption::AudioOnly, FailureOption::Abandon],
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    Full,
    AudioOnly,
}

// ==============================================================================
// CONFIGURATION
// ==============================================================================

/// Session tunables.
#[derive(Debug, Clone)]
pub struct ConsultationConfig {
    pub heartbeat_interval: Duration,
    pub quality_sample_interval: Duration,
    pub quality_buffer_capacity: usize,
    pub max_reconnection_attempts: u32,
    pub reconnection_base_delay: Duration,
    pub reconnection_max_delay: Duration,
    pub analytics_send_timeout: Duration,
    pub analytics_bucket_capacity: usize,
    pub latency_probe_url: String,
    pub supported_browsers: Vec<String>,
}

impl Default for ConsultationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            quality_sample_interval: Duration::from_secs(5),
            quality_buffer_capacity: 60,
            max_reconnection_attempts: 3,
            reconnection_base_delay: Duration::from_millis(1_000),
            reconnection_max_delay: Duration::from_millis(10_000),
            analytics_send_timeout: Duration::from_secs(5),
            analytics_bucket_capacity: 500,
            latency_probe_url: String::new(),
            supported_browsers: ["chrome", "chromium", "edge", "firefox", "safari", "opera"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ConsultationConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            quality_sample_interval: Duration::from_secs(config.quality_sample_interval_secs.max(1)),
            quality_buffer_capacity: config.quality_buffer_capacity.max(1),
            max_reconnection_attempts: config.max_reconnection_attempts,
            reconnection_base_delay: Duration::from_millis(config.reconnection_base_delay_ms),
            reconnection_max_delay: Duration::from_millis(config.reconnection_max_delay_ms),
            analytics_send_timeout: Duration::from_secs(config.analytics_send_timeout_secs),
            latency_probe_url: config.latency_probe_url.clone(),
            ..Self::default()
        }
    }
}

// ==============================================================================
// ERROR HANDLING
// ==============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum VideoConsultationError {
    #[error("Preflight check failed ({check}): {detail}")]
    PreflightFailure { check: PreflightCheck, detail: String },

    #[error("Camera or microphone access denied: {detail}")]
    PermissionDenied { detail: String },

    #[error("Failed to acquire video session token: {message}")]
    TokenAcquisitionFailure { message: String },

    #[error("Conference join failed: {message}")]
    ConferenceJoinFailure { message: String, auth_related: bool },

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("{device} failure: {message}")]
    DeviceFailure { device: DeviceKind, message: String },

    #[error("Network failure: {message}")]
    NetworkFailure { message: String },

    #[error("Video session was ended by the other party or expired")]
    HeartbeatLost,

    #[error("Video session is no longer valid: {reason}")]
    SessionNoLongerValid { reason: String },

    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    #[error("Invalid session state transition from {from} to {to}")]
    InvalidStateTransition { from: SessionState, to: SessionState },

    #[error("User not authorized for this operation")]
    Unauthorized,

    #[error("Video session has already ended")]
    SessionEnded,

    #[error("Backend API error: {message}")]
    BackendError { status: Option<u16>, message: String },

    #[error("Video consultation not configured")]
    NotConfigured,

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

impl VideoConsultationError {
    /// Maps an error onto the recovery strategy input, if it has one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            VideoConsultationError::ConnectionLost { .. } => Some(FailureKind::ConnectionLost),
            VideoConsultationError::ConferenceJoinFailure { auth_related: true, .. } => {
                Some(FailureKind::ConferenceAuth)
            }
            VideoConsultationError::ConferenceJoinFailure { .. } => Some(FailureKind::ConnectionLost),
            VideoConsultationError::PermissionDenied { .. } => Some(FailureKind::PermissionDenied),
            VideoConsultationError::DeviceFailure { device: DeviceKind::Camera, .. } => {
                Some(FailureKind::CameraFailure)
            }
            VideoConsultationError::DeviceFailure { .. } => Some(FailureKind::MicrophoneFailure),
            VideoConsultationError::NetworkFailure { .. } => Some(FailureKind::NetworkFailure),
            VideoConsultationError::TokenAcquisitionFailure { .. }
            | VideoConsultationError::BackendError { .. } => Some(FailureKind::NetworkFailure),
            _ => None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.failure_kind().is_some()
    }

    pub fn is_auth_related(&self) -> bool {
        matches!(
            self,
            VideoConsultationError::ConferenceJoinFailure { auth_related: true, .. }
        )
    }
}

impl From<reqwest::Error> for VideoConsultationError {
    fn from(err: reqwest::Error) -> Self {
        VideoConsultationError::NetworkFailure {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for VideoConsultationError {
    fn from(err: serde_json::Error) -> Self {
        VideoConsultationError::BackendError {
            status: None,
            message: format!("Failed to parse response: {}", err),
        }
    }
}
