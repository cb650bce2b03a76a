// libs/video-consultation-cell/src/services/controller.rs
use serde_json::json;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    AnalyticsEventType, ConferenceConfig, ConferenceErrorKind, ConferenceEvent, ConferenceStatus,
    ConsultationConfig, DeviceKind, DeviceSelection, EndReason, FailureKind, FailureScreen,
    LifecycleTrigger, ParticipantRole, QualitySample, RetryMode, SessionData, SessionState,
    SystemCheckResult, VideoConsultationError, VideoSessionGrant,
};
use crate::services::analytics::AnalyticsRecorder;
use crate::services::backend::VideoBackend;
use crate::services::conference::{AdapterEvent, ConferenceAdapter, ConferenceEngine};
use crate::services::devices::{DeviceProbe, MediaDevices, MediaRegistry, MediaStream};
use crate::services::heartbeat::{HeartbeatMonitor, HeartbeatOutcome};
use crate::services::lock;
use crate::services::preflight::{ClientEnvironment, NetworkProbe, PreflightChecker};
use crate::services::quality::QualityMonitor;
use crate::services::reconnection::{
    ReconnectionManager, ReconnectionPolicy, RecoveryGuard, RecoveryPlan,
};
use crate::services::scheduler::{ScheduledTasks, TaskKind};
use crate::services::teardown::{TeardownManager, TeardownReport};

/// External collaborators of one session.
pub struct SessionDependencies {
    pub backend: Arc<dyn VideoBackend>,
    pub engine: Arc<dyn ConferenceEngine>,
    pub media: Arc<dyn MediaDevices>,
    pub environment: Arc<dyn ClientEnvironment>,
    pub network: Arc<dyn NetworkProbe>,
}

/// Everything guarded by the state lock. Only the transition function
/// writes `state`.
struct Machine {
    state: SessionState,
    session: Option<SessionData>,
    token_granted: bool,
    failure: Option<FailureScreen>,
    preflight: Option<SystemCheckResult>,
    selection: DeviceSelection,
    audio_only: bool,
    audio_muted: bool,
    video_muted: bool,
}

struct ControllerInner {
    appointment_id: Uuid,
    session_id: Uuid,
    role: ParticipantRole,
    backend: Arc<dyn VideoBackend>,
    adapter: Arc<ConferenceAdapter>,
    events: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    devices: Arc<DeviceProbe>,
    preflight: PreflightChecker,
    analytics: Arc<AnalyticsRecorder>,
    quality: Arc<QualityMonitor>,
    heartbeat: Arc<HeartbeatMonitor>,
    reconnection: Arc<ReconnectionManager>,
    tasks: Arc<ScheduledTasks>,
    teardown: TeardownManager,
    machine: Mutex<Machine>,
    ending: AtomicBool,
    dispatch: tokio::sync::Mutex<()>,
}

/// Owns one appointment's video session from preflight to teardown.
///
/// Cloning is cheap and every clone drives the same session. Background
/// tasks only hold weak references, so dropping the last clone stops them.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        appointment_id: Uuid,
        role: ParticipantRole,
        config: ConsultationConfig,
        deps: SessionDependencies,
    ) -> Self {
        let session_id = Uuid::new_v4();

        let (adapter, events) = ConferenceAdapter::new(deps.engine);
        let adapter = Arc::new(adapter);
        let registry = Arc::new(MediaRegistry::new());
        let devices = Arc::new(DeviceProbe::new(deps.media, Arc::clone(&registry)));
        let preflight = PreflightChecker::new(
            Arc::clone(&deps.environment),
            deps.network,
            Arc::clone(&devices),
            config.supported_browsers.clone(),
        );
        let analytics = Arc::new(AnalyticsRecorder::new(
            Arc::clone(&deps.backend),
            session_id,
            appointment_id,
            config.analytics_bucket_capacity,
            config.analytics_send_timeout,
        ));
        let quality = Arc::new(QualityMonitor::new(
            Arc::clone(&adapter),
            deps.environment,
            config.quality_sample_interval,
            config.quality_buffer_capacity,
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&deps.backend),
            session_id,
            config.heartbeat_interval,
        ));
        let reconnection = Arc::new(ReconnectionManager::new(ReconnectionPolicy::from_config(
            &config,
        )));
        let tasks = Arc::new(ScheduledTasks::new());
        let teardown = TeardownManager::new(
            Arc::clone(&analytics),
            Arc::clone(&adapter),
            registry,
            Arc::clone(&tasks),
        );

        info!(
            "Created video session {} for appointment {} as {:?}",
            session_id, appointment_id, role
        );

        Self {
            inner: Arc::new(ControllerInner {
                appointment_id,
                session_id,
                role,
                backend: deps.backend,
                adapter,
                events: Mutex::new(Some(events)),
                devices,
                preflight,
                analytics,
                quality,
                heartbeat,
                reconnection,
                tasks,
                teardown,
                machine: Mutex::new(Machine {
                    state: SessionState::Idle,
                    session: None,
                    token_granted: false,
                    failure: None,
                    preflight: None,
                    selection: DeviceSelection::default(),
                    audio_only: false,
                    audio_muted: false,
                    video_muted: false,
                }),
                ending: AtomicBool::new(false),
                dispatch: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn upgrade(weak: &Weak<ControllerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ==============================================================================
    // ACCESSORS
    // ==============================================================================

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn appointment_id(&self) -> Uuid {
        self.inner.appointment_id
    }

    pub fn role(&self) -> ParticipantRole {
        self.inner.role
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.machine).state
    }

    pub fn session_data(&self) -> Option<SessionData> {
        lock(&self.inner.machine).session.clone()
    }

    pub fn failure_screen(&self) -> Option<FailureScreen> {
        lock(&self.inner.machine).failure.clone()
    }

    pub fn last_preflight(&self) -> Option<SystemCheckResult> {
        lock(&self.inner.machine).preflight.clone()
    }

    pub fn device_selection(&self) -> DeviceSelection {
        lock(&self.inner.machine).selection.clone()
    }

    pub fn is_audio_only(&self) -> bool {
        lock(&self.inner.machine).audio_only
    }

    pub fn reconnection_attempts(&self) -> u32 {
        self.inner.reconnection.attempts()
    }

    pub fn is_recovery_in_flight(&self) -> bool {
        self.inner.reconnection.is_in_flight()
    }

    pub fn analytics(&self) -> &Arc<AnalyticsRecorder> {
        &self.inner.analytics
    }

    pub fn devices(&self) -> &Arc<DeviceProbe> {
        &self.inner.devices
    }

    pub fn quality_samples(&self) -> Vec<QualitySample> {
        self.inner.quality.samples()
    }

    pub fn conference_status(&self) -> Option<ConferenceStatus> {
        self.inner.adapter.status()
    }

    /// Generation tag of the most recent conference join.
    pub fn conference_generation(&self) -> u64 {
        self.inner.adapter.current_generation()
    }

    pub fn active_tasks(&self) -> Vec<TaskKind> {
        self.inner.tasks.active_kinds()
    }

    pub fn teardown_runs(&self) -> usize {
        self.inner.teardown.runs()
    }

    // ==============================================================================
    // STATE MACHINE
    // ==============================================================================

    fn transition(&self, next: SessionState) -> Result<SessionState, VideoConsultationError> {
        let mut machine = lock(&self.inner.machine);
        self.apply_transition(&mut machine, next)
    }

    /// The single writer of `Machine::state`. Monitors are started on entry
    /// to `Active` and stopped on exit, under the same lock, so they exist
    /// exactly while the session is active.
    fn apply_transition(
        &self,
        machine: &mut Machine,
        next: SessionState,
    ) -> Result<SessionState, VideoConsultationError> {
        let previous = machine.state;
        if !previous.can_transition_to(next) {
            warn!(
                "Session {} rejected transition {} -> {}",
                self.inner.session_id, previous, next
            );
            return Err(VideoConsultationError::InvalidStateTransition {
                from: previous,
                to: next,
            });
        }

        machine.state = next;
        info!("Session {} state {} -> {}", self.inner.session_id, previous, next);

        if next == SessionState::Active {
            self.start_monitors();
        } else if previous == SessionState::Active {
            self.stop_monitors();
        }

        if matches!(next, SessionState::Failed | SessionState::Ended) {
            machine.session = None;
        }

        Ok(previous)
    }

    fn start_monitors(&self) {
        let heartbeat = Arc::clone(&self.inner.heartbeat);
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.schedule(TaskKind::Heartbeat, async move {
            heartbeat
                .run(move |outcome| match outcome {
                    HeartbeatOutcome::RemoteEnded => match Self::upgrade(&weak) {
                        Some(controller) => controller.on_remote_ended(),
                        None => ControlFlow::Break(()),
                    },
                    HeartbeatOutcome::Alive | HeartbeatOutcome::Transient => {
                        ControlFlow::Continue(())
                    }
                })
                .await;
        });

        let quality = Arc::clone(&self.inner.quality);
        self.inner
            .tasks
            .schedule(TaskKind::QualitySampling, async move { quality.run().await });
    }

    fn stop_monitors(&self) {
        self.inner.tasks.cancel(TaskKind::Heartbeat);
        self.inner.tasks.cancel(TaskKind::QualitySampling);
    }

    /// Heartbeat says the backend closed the session. Adapter-level signals
    /// win: if a drop already moved us out of `Active`, this is ignored.
    fn on_remote_ended(self) -> ControlFlow<()> {
        let state = self.state();
        if state != SessionState::Active {
            debug!("Ignoring remote end signal in state {}", state);
            return ControlFlow::Continue(());
        }

        warn!("Session {} was ended remotely", self.inner.session_id);
        self.inner.analytics.log(
            AnalyticsEventType::HeartbeatLost,
            json!({ "error": VideoConsultationError::HeartbeatLost.to_string() }),
        );

        // Teardown aborts the heartbeat task, so it must not run inside it.
        tokio::spawn(async move {
            self.end_session(EndReason::RemoteEnded).await;
        });
        ControlFlow::Break(())
    }

    /// Moves to `Failed` and records the failure screen. Returns the error
    /// for propagation. A session that is already ending stays as it is.
    fn fail(&self, error: VideoConsultationError) -> VideoConsultationError {
        let entered = {
            let mut machine = lock(&self.inner.machine);
            match self.apply_transition(&mut machine, SessionState::Failed) {
                Ok(_) => {
                    machine.failure = Some(FailureScreen::new(&error));
                    true
                }
                Err(_) => false,
            }
        };

        if entered {
            self.inner.adapter.dispose();
            error!("Session {} failed: {}", self.inner.session_id, error);
            self.inner.analytics.log(
                AnalyticsEventType::SessionFailed,
                json!({ "error": error.to_string(), "kind": error.failure_kind() }),
            );
        }
        error
    }

    fn ensure_not_ending(&self) -> Result<(), VideoConsultationError> {
        let ending = self.inner.ending.load(Ordering::SeqCst)
            || matches!(self.state(), SessionState::Ending | SessionState::Ended);
        if ending {
            return Err(VideoConsultationError::SessionEnded);
        }
        Ok(())
    }

    fn is_recovering(&self) -> bool {
        self.state() == SessionState::Reconnecting && !self.inner.ending.load(Ordering::SeqCst)
    }

    // ==============================================================================
    // PREFLIGHT & DEVICE SETUP
    // ==============================================================================

    pub fn initialize(&self) -> Result<(), VideoConsultationError> {
        self.transition(SessionState::Preflight)?;
        self.inner.analytics.log(
            AnalyticsEventType::SessionInitialized,
            json!({ "role": self.inner.role }),
        );
        Ok(())
    }

    /// Runs the local checks. A blocked check leaves the session in
    /// `Preflight` so the checks can be re-run; once they pass, the backend
    /// decides whether the appointment can be joined at all.
    #[instrument(skip(self), fields(appointment_id = %self.inner.appointment_id))]
    pub async fn run_preflight(&self) -> Result<SystemCheckResult, VideoConsultationError> {
        match self.state() {
            SessionState::Idle => self.initialize()?,
            SessionState::Preflight => {}
            other => {
                return Err(VideoConsultationError::InvalidStateTransition {
                    from: other,
                    to: SessionState::Preflight,
                })
            }
        }

        let result = self.inner.preflight.run().await;
        self.inner.analytics.log(
            AnalyticsEventType::PreflightCompleted,
            json!({
                "browser": result.browser_ok(),
                "network": result.network.quality,
                "roundTripMs": result.network.round_trip_ms,
                "permissions": result.permissions_ok(),
            }),
        );
        lock(&self.inner.machine).preflight = Some(result.clone());

        if let Some((check, detail)) = result.first_blocking_failure() {
            warn!("Join disabled by {} check: {}", check, detail);
            return Ok(result);
        }

        let status = self.inner.backend.video_status().await?;
        if !status.can_join {
            let reason = status
                .reason
                .unwrap_or_else(|| "video session is not available".to_string());
            return Err(self.fail(VideoConsultationError::SessionNoLongerValid { reason }));
        }

        self.transition(SessionState::DeviceSetup)?;
        self.select_default_devices().await;
        Ok(result)
    }

    async fn select_default_devices(&self) {
        let inventory = match self.inner.devices.inventory().await {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!("Could not enumerate devices: {}", e);
                return;
            }
        };

        let mut machine = lock(&self.inner.machine);
        let selection = &mut machine.selection;
        if selection.camera_id.is_none() {
            selection.camera_id = inventory.cameras.first().map(|d| d.device_id.clone());
        }
        if selection.microphone_id.is_none() {
            selection.microphone_id = inventory.microphones.first().map(|d| d.device_id.clone());
        }
        if selection.speaker_id.is_none() {
            selection.speaker_id = inventory.speakers.first().map(|d| d.device_id.clone());
        }
    }

    /// Local preview with the selected camera and microphone.
    pub async fn start_preview(&self) -> Result<Arc<dyn MediaStream>, VideoConsultationError> {
        self.ensure_not_ending()?;
        let selection = self.device_selection();
        self.inner
            .devices
            .start_preview(selection.camera_id.as_deref(), selection.microphone_id.as_deref())
            .await
    }

    pub async fn switch_camera(&self, device_id: &str) -> Result<(), VideoConsultationError> {
        self.switch_device(DeviceKind::Camera, device_id).await
    }

    pub async fn switch_microphone(&self, device_id: &str) -> Result<(), VideoConsultationError> {
        self.switch_device(DeviceKind::Microphone, device_id).await
    }

    pub async fn select_speaker(&self, device_id: &str) -> Result<(), VideoConsultationError> {
        self.switch_device(DeviceKind::Speaker, device_id).await
    }

    async fn switch_device(
        &self,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<(), VideoConsultationError> {
        self.ensure_not_ending()?;
        let inventory = self.inner.devices.inventory().await?;
        if !inventory.contains(kind, device_id) {
            return Err(VideoConsultationError::DeviceFailure {
                device: kind,
                message: format!("{} {} is not available", kind, device_id),
            });
        }

        {
            let mut machine = lock(&self.inner.machine);
            let id = Some(device_id.to_string());
            match kind {
                DeviceKind::Camera => machine.selection.camera_id = id,
                DeviceKind::Microphone => machine.selection.microphone_id = id,
                DeviceKind::Speaker => machine.selection.speaker_id = id,
            }
        }

        if self.inner.adapter.is_live() {
            match kind {
                DeviceKind::Camera => self.inner.adapter.set_video_input(device_id)?,
                DeviceKind::Microphone => self.inner.adapter.set_audio_input(device_id)?,
                DeviceKind::Speaker => {}
            }
        }

        self.inner.analytics.log(
            AnalyticsEventType::DeviceSwitched,
            json!({ "kind": kind, "deviceId": device_id }),
        );
        Ok(())
    }

    // ==============================================================================
    // START / JOIN
    // ==============================================================================

    /// Host starts, guest joins. On success the session is `Active`.
    #[instrument(skip(self), fields(appointment_id = %self.inner.appointment_id, role = ?self.inner.role))]
    pub async fn start_or_join_session(&self) -> Result<SessionData, VideoConsultationError> {
        let role = self.inner.role;
        self.transition(role.entry_state())?;
        self.inner.reconnection.reset();
        self.inner
            .analytics
            .log(AnalyticsEventType::JoinRequested, json!({ "role": role }));

        let grant = match self.inner.backend.request_session(role).await {
            Ok(grant) => grant,
            Err(e) => {
                error!("Backend refused video session for appointment {}: {}", self.inner.appointment_id, e);
                return Err(self.fail(e));
            }
        };
        let session = self.store_grant(grant);
        let config = self.effective_config(&session.config);

        let joined = match self.inner.adapter.join(session.join_request(config.clone())).await {
            Err(e) if e.is_auth_related() && self.inner.reconnection.claim_fallback() => {
                warn!("Conference rejected join ({}), retrying with relaxed configuration", e);
                self.inner
                    .adapter
                    .join(session.join_request(config.relaxed()))
                    .await
            }
            other => other,
        };

        match joined {
            Ok(generation) => {
                if let Err(e) = self.transition(SessionState::Active) {
                    // Ended while the join was in flight.
                    self.inner.adapter.dispose();
                    return Err(e);
                }
                // A relaxed retry spent on this join is available again mid-session.
                self.inner.reconnection.reset();
                self.apply_local_controls();
                info!(
                    "Session {} active in room {} (generation {})",
                    self.inner.session_id, session.room_name, generation
                );
                Ok(session)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Re-enters Starting/Joining from the failure screen.
    pub async fn retry_session(
        &self,
        mode: RetryMode,
    ) -> Result<SessionData, VideoConsultationError> {
        {
            let mut machine = lock(&self.inner.machine);
            if machine.state != SessionState::Failed {
                return Err(VideoConsultationError::InvalidStateTransition {
                    from: machine.state,
                    to: self.inner.role.entry_state(),
                });
            }
            machine.failure = None;
            if mode == RetryMode::AudioOnly {
                machine.audio_only = true;
            }
        }

        if mode == RetryMode::AudioOnly {
            self.inner.analytics.log(
                AnalyticsEventType::AudioOnlyEnabled,
                json!({ "source": "failure_screen" }),
            );
        }
        self.start_or_join_session().await
    }

    /// Gives up from the failure screen (or anywhere else).
    pub async fn abandon(&self) -> Option<TeardownReport> {
        self.end_session(EndReason::Abandoned).await
    }

    fn store_grant(&self, grant: VideoSessionGrant) -> SessionData {
        let session = SessionData::from_grant(grant);
        let mut machine = lock(&self.inner.machine);
        machine.token_granted = true;
        machine.session = Some(session.clone());
        session
    }

    fn effective_config(&self, base: &ConferenceConfig) -> ConferenceConfig {
        if self.is_audio_only() {
            base.audio_only()
        } else {
            base.clone()
        }
    }

    /// Re-applies device choice and mute state to a fresh conference.
    fn apply_local_controls(&self) {
        let (selection, audio_only, audio_muted, video_muted) = {
            let machine = lock(&self.inner.machine);
            (
                machine.selection.clone(),
                machine.audio_only,
                machine.audio_muted,
                machine.video_muted,
            )
        };

        let adapter = &self.inner.adapter;
        let results = [
            selection
                .camera_id
                .as_deref()
                .map(|id| adapter.set_video_input(id)),
            selection
                .microphone_id
                .as_deref()
                .map(|id| adapter.set_audio_input(id)),
            (audio_only || video_muted).then(|| adapter.set_video_muted(true)),
            audio_muted.then(|| adapter.set_audio_muted(true)),
        ];
        for result in results.into_iter().flatten() {
            if let Err(e) = result {
                warn!("Could not apply local media settings: {}", e);
            }
        }
    }

    // ==============================================================================
    // LOCAL CONTROLS
    // ==============================================================================

    pub fn set_audio_muted(&self, muted: bool) -> Result<(), VideoConsultationError> {
        if self.inner.adapter.is_live() {
            self.inner.adapter.set_audio_muted(muted)?;
        }
        lock(&self.inner.machine).audio_muted = muted;
        Ok(())
    }

    pub fn set_video_muted(&self, muted: bool) -> Result<(), VideoConsultationError> {
        if self.inner.adapter.is_live() {
            self.inner.adapter.set_video_muted(muted)?;
        }
        lock(&self.inner.machine).video_muted = muted;
        Ok(())
    }

    /// Turns video off for the rest of the session, including rejoins.
    pub fn enable_audio_only(&self) -> Result<(), VideoConsultationError> {
        let already = std::mem::replace(&mut lock(&self.inner.machine).audio_only, true);
        if self.inner.adapter.is_live() {
            self.inner.adapter.set_video_muted(true)?;
        }
        if !already {
            self.inner.analytics.log(
                AnalyticsEventType::AudioOnlyEnabled,
                json!({ "source": "user" }),
            );
        }
        Ok(())
    }

    // ==============================================================================
    // ADAPTER EVENTS
    // ==============================================================================

    /// Forwards adapter events to [`Self::on_adapter_event`] in arrival order.
    /// Returns `None` if the dispatcher was already started.
    pub fn spawn_event_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut events = lock(&self.inner.events).take()?;
        let weak = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(controller) = Self::upgrade(&weak) else {
                    break;
                };
                controller.on_adapter_event(event).await;
            }
            debug!("Conference event dispatcher stopped");
        }))
    }

    /// Single entry point for conference events. Events are handled one at
    /// a time; events from a superseded join are dropped.
    pub async fn on_adapter_event(&self, event: AdapterEvent) {
        let _dispatch = self.inner.dispatch.lock().await;

        if !self.inner.adapter.is_current(event.generation) {
            debug!("Dropping event from stale conference generation {}", event.generation);
            return;
        }

        let state = self.state();
        if matches!(state, SessionState::Ending | SessionState::Ended) {
            debug!("Ignoring {:?} while {}", event.event, state);
            return;
        }

        let analytics = &self.inner.analytics;
        match event.event {
            ConferenceEvent::Joined { room_name } => {
                analytics.log(
                    AnalyticsEventType::ConferenceJoined,
                    json!({ "room": room_name, "generation": event.generation }),
                );
            }
            ConferenceEvent::Left => {
                analytics.log(AnalyticsEventType::ConferenceLeft, json!({ "state": state }));
                if state == SessionState::Active {
                    self.end_session(EndReason::ConferenceLeft).await;
                }
            }
            ConferenceEvent::ParticipantJoined { participant_id } => {
                analytics.log(
                    AnalyticsEventType::ParticipantJoined,
                    json!({ "participantId": participant_id }),
                );
            }
            ConferenceEvent::ParticipantLeft { participant_id } => {
                analytics.log(
                    AnalyticsEventType::ParticipantLeft,
                    json!({ "participantId": participant_id }),
                );
            }
            ConferenceEvent::QualityChanged { quality } => {
                analytics.log(AnalyticsEventType::QualityChanged, json!({ "quality": quality }));
            }
            ConferenceEvent::Error { kind, message } => {
                analytics.log(
                    AnalyticsEventType::ConferenceError,
                    json!({ "kind": kind, "message": message }),
                );
                self.handle_conference_error(state, kind, message).await;
            }
        }
    }

    async fn handle_conference_error(
        &self,
        state: SessionState,
        kind: ConferenceErrorKind,
        message: String,
    ) {
        if let Some(failure) = FailureKind::from_conference_error(&kind) {
            self.attempt_recovery(failure);
            return;
        }

        match (kind, state) {
            (ConferenceErrorKind::SessionInvalid, SessionState::Active) => {
                self.end_session(EndReason::RemoteEnded).await;
            }
            (ConferenceErrorKind::SessionInvalid, SessionState::Reconnecting) => {
                self.fail(VideoConsultationError::SessionNoLongerValid { reason: message });
            }
            (kind, state) => debug!("No recovery for {:?} in state {}", kind, state),
        }
    }

    // ==============================================================================
    // RECOVERY
    // ==============================================================================

    /// Starts recovery for `kind`. Returns `false` when nothing was started,
    /// including when another recovery is already running.
    pub fn attempt_recovery(&self, kind: FailureKind) -> bool {
        if matches!(kind, FailureKind::CameraFailure | FailureKind::MicrophoneFailure) {
            return self.degrade_to_audio_only(kind);
        }

        let Some(guard) = self.inner.reconnection.try_begin() else {
            debug!(
                "Recovery already in flight at attempt {}, ignoring {:?}",
                self.inner.reconnection.attempts(),
                kind
            );
            return false;
        };

        {
            let mut machine = lock(&self.inner.machine);
            match machine.state {
                SessionState::Active => {
                    if self.apply_transition(&mut machine, SessionState::Reconnecting).is_err() {
                        return false;
                    }
                }
                SessionState::Reconnecting => {}
                other => {
                    debug!("Not recovering from {:?} in state {}", kind, other);
                    return false;
                }
            }
        }

        let plan = self.inner.reconnection.plan(kind);
        self.inner.analytics.log(
            AnalyticsEventType::ReconnectionStarted,
            json!({
                "kind": kind,
                "plan": format!("{:?}", plan),
                "attempts": self.inner.reconnection.attempts(),
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .schedule(TaskKind::ReconnectionBackoff, Self::recover(weak, plan, guard));
        true
    }

    fn degrade_to_audio_only(&self, kind: FailureKind) -> bool {
        let state = self.state();
        if !state.holds_conference() {
            return false;
        }

        lock(&self.inner.machine).audio_only = true;
        if let Err(e) = self.inner.adapter.set_video_muted(true) {
            warn!("Could not disable video: {}", e);
        }

        info!("Session {} continuing audio-only after {:?}", self.inner.session_id, kind);
        self.inner
            .analytics
            .log(AnalyticsEventType::AudioOnlyEnabled, json!({ "cause": kind }));
        true
    }

    /// Body of the reconnection task. Holds the in-flight slot until it
    /// returns and never keeps the controller alive across a sleep.
    async fn recover(weak: Weak<ControllerInner>, mut plan: RecoveryPlan, _guard: RecoveryGuard) {
        loop {
            let Some(controller) = Self::upgrade(&weak) else {
                return;
            };
            if !controller.is_recovering() {
                break;
            }

            match plan {
                RecoveryPlan::FallbackRetry => match controller.rejoin(true).await {
                    Ok(()) => {
                        controller.recovered();
                        break;
                    }
                    Err(e) => {
                        warn!("Relaxed rejoin failed: {}", e);
                        plan = controller
                            .inner
                            .reconnection
                            .plan(FailureKind::ConnectionLost);
                    }
                },
                RecoveryPlan::PermissionRequest => {
                    controller
                        .inner
                        .analytics
                        .log(AnalyticsEventType::PermissionRequested, json!({}));
                    match controller.inner.devices.request_permissions().await {
                        Ok(()) => plan = RecoveryPlan::Backoff,
                        Err(e) => {
                            let denied = match e {
                                e @ VideoConsultationError::PermissionDenied { .. } => e,
                                other => VideoConsultationError::PermissionDenied {
                                    detail: other.to_string(),
                                },
                            };
                            controller.fail(denied);
                            break;
                        }
                    }
                }
                RecoveryPlan::Backoff => {
                    let Some((attempt, delay)) = controller.inner.reconnection.next_attempt() else {
                        let attempts = controller.inner.reconnection.attempts();
                        controller.inner.analytics.log(
                            AnalyticsEventType::ReconnectionFailed,
                            json!({ "attempts": attempts, "exhausted": true }),
                        );
                        controller.fail(VideoConsultationError::ReconnectionExhausted { attempts });
                        break;
                    };

                    info!("Reconnection attempt {} in {:?}", attempt, delay);
                    drop(controller);
                    tokio::time::sleep(delay).await;

                    let Some(controller) = Self::upgrade(&weak) else {
                        return;
                    };
                    if !controller.is_recovering() {
                        debug!("Reconnection attempt {} no longer relevant", attempt);
                        break;
                    }

                    match controller.rejoin(false).await {
                        Ok(()) => {
                            controller.recovered();
                            break;
                        }
                        Err(e) if !e.is_recoverable() => {
                            controller.fail(e);
                            break;
                        }
                        Err(e) => {
                            warn!("Reconnection attempt {} failed: {}", attempt, e);
                            controller.inner.analytics.log(
                                AnalyticsEventType::ReconnectionFailed,
                                json!({ "attempt": attempt, "error": e.to_string() }),
                            );
                        }
                    }
                }
            }
        }

        if let Some(controller) = Self::upgrade(&weak) {
            controller.inner.tasks.release(TaskKind::ReconnectionBackoff);
        }
    }

    /// One rejoin. The relaxed variant reuses the current grant; the normal
    /// one re-validates with the backend and fetches a fresh grant first.
    #[instrument(skip(self), fields(session_id = %self.inner.session_id))]
    async fn rejoin(&self, relaxed: bool) -> Result<(), VideoConsultationError> {
        let session = if relaxed {
            self.session_data()
                .ok_or_else(|| VideoConsultationError::ConnectionLost {
                    message: "no session to rejoin".to_string(),
                })?
        } else {
            let status = self.inner.backend.video_status().await?;
            if !status.can_join {
                return Err(VideoConsultationError::SessionNoLongerValid {
                    reason: status
                        .reason
                        .unwrap_or_else(|| "session closed by backend".to_string()),
                });
            }
            let grant = self.inner.backend.request_session(self.inner.role).await?;
            self.store_grant(grant)
        };

        let mut config = self.effective_config(&session.config);
        if relaxed {
            config = config.relaxed();
        }
        self.inner.adapter.join(session.join_request(config)).await?;

        if !self.is_recovering() {
            self.inner.adapter.dispose();
            return Err(VideoConsultationError::ConnectionLost {
                message: "session moved on while rejoining".to_string(),
            });
        }
        Ok(())
    }

    fn recovered(&self) {
        self.inner.reconnection.record_success();
        if let Err(e) = self.transition(SessionState::Active) {
            warn!("Rejoined but could not resume: {}", e);
            return;
        }
        self.apply_local_controls();
        self.inner.analytics.log(
            AnalyticsEventType::ReconnectionSucceeded,
            json!({ "recoveries": self.inner.reconnection.recoveries() }),
        );
    }

    // ==============================================================================
    // ENDING
    // ==============================================================================

    /// Ends the session. Only the first call does anything: it forces
    /// `Ending`, runs teardown, then releases the video slot on the backend
    /// if a join token was ever granted. The appointment is not completed.
    #[instrument(skip(self), fields(session_id = %self.inner.session_id))]
    pub async fn end_session(&self, reason: EndReason) -> Option<TeardownReport> {
        if self.inner.ending.swap(true, Ordering::SeqCst) {
            debug!("Session {} already ending", self.inner.session_id);
            return None;
        }

        info!("Ending session {} ({:?})", self.inner.session_id, reason);
        if let Err(e) = self.transition(SessionState::Ending) {
            warn!("Forced end from unexpected state: {}", e);
        }
        self.inner
            .analytics
            .log(AnalyticsEventType::SessionEnded, json!({ "reason": reason }));

        let report = self
            .inner
            .teardown
            .teardown(
                self.inner.quality.latest(),
                self.inner.reconnection.recoveries(),
                || self.transition(SessionState::Ended).is_ok(),
            )
            .await;

        let token_granted = lock(&self.inner.machine).token_granted;
        if token_granted {
            if let Err(e) = self
                .inner
                .backend
                .disconnect(self.inner.session_id, reason)
                .await
            {
                warn!("Failed to release video session on backend: {}", e);
            }
        } else {
            debug!("No join token was granted, skipping disconnect");
        }

        report
    }

    /// Tab close, navigation and page-hide all force the session down.
    pub async fn handle_lifecycle(&self, trigger: LifecycleTrigger) -> Option<TeardownReport> {
        info!("Lifecycle trigger {:?} for session {}", trigger, self.inner.session_id);
        self.end_session(trigger.into()).await
    }

    /// Marks the appointment finished. Host only and never implied by
    /// ending the video session.
    #[instrument(skip(self), fields(appointment_id = %self.inner.appointment_id))]
    pub async fn complete_appointment(&self) -> Result<(), VideoConsultationError> {
        if self.inner.role != ParticipantRole::Host {
            warn!("Guest tried to complete appointment {}", self.inner.appointment_id);
            return Err(VideoConsultationError::Unauthorized);
        }

        self.inner.backend.complete_appointment().await?;
        info!("Appointment {} marked complete", self.inner.appointment_id);
        Ok(())
    }
}
