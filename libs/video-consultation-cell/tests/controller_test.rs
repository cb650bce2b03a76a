use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use video_consultation_cell::models::{
    AnalyticsEventType, ConferenceErrorKind, ConferenceEvent, ConsultationConfig, DeviceKind,
    EndReason, FailureKind, FailureOption, LifecycleTrigger, ParticipantRole, RetryMode,
    SessionState, VideoConsultationError,
};
use video_consultation_cell::services::backend::mock::MockVideoBackend;
use video_consultation_cell::services::conference::mock::MockConferenceEngine;
use video_consultation_cell::services::conference::AdapterEvent;
use video_consultation_cell::services::devices::mock::MockMediaDevices;
use video_consultation_cell::services::preflight::mock::{FixedLatencyProbe, StaticEnvironment};
use video_consultation_cell::services::{
    MediaStream, SessionController, SessionDependencies, TaskKind,
};

struct Harness {
    backend: Arc<MockVideoBackend>,
    engine: Arc<MockConferenceEngine>,
    media: Arc<MockMediaDevices>,
    controller: SessionController,
}

fn harness_with(role: ParticipantRole, environment: StaticEnvironment) -> Harness {
    harness_configured(role, environment, ConsultationConfig::default())
}

fn harness_configured(
    role: ParticipantRole,
    environment: StaticEnvironment,
    config: ConsultationConfig,
) -> Harness {
    let backend = Arc::new(MockVideoBackend::new());
    let engine = Arc::new(MockConferenceEngine::new());
    let media = Arc::new(MockMediaDevices::new());

    let controller = SessionController::new(
        Uuid::new_v4(),
        role,
        config,
        SessionDependencies {
            backend: backend.clone(),
            engine: engine.clone(),
            media: media.clone(),
            environment: Arc::new(environment),
            network: Arc::new(FixedLatencyProbe::new(Duration::from_millis(80))),
        },
    );
    controller.spawn_event_dispatcher();

    Harness {
        backend,
        engine,
        media,
        controller,
    }
}

fn harness(role: ParticipantRole) -> Harness {
    harness_with(role, StaticEnvironment::default())
}

async fn active(role: ParticipantRole) -> Harness {
    let h = harness(role);
    h.controller.run_preflight().await.unwrap();
    h.controller.start_or_join_session().await.unwrap();
    settle().await;
    assert_eq!(h.controller.state(), SessionState::Active);
    h
}

/// Lets the dispatcher and any woken tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn auth_failure() -> VideoConsultationError {
    VideoConsultationError::ConferenceJoinFailure {
        message: "conference.authenticationRequired".to_string(),
        auth_related: true,
    }
}

fn connection_lost() -> VideoConsultationError {
    VideoConsultationError::ConnectionLost {
        message: "ICE failed".to_string(),
    }
}

// ==============================================================================
// PREFLIGHT
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_unsupported_browser_keeps_session_in_preflight() {
    let h = harness_with(ParticipantRole::Guest, StaticEnvironment::without_rtc());

    let result = h.controller.run_preflight().await.unwrap();

    assert!(!result.browser_ok());
    assert!(!result.can_join());
    assert_eq!(h.controller.state(), SessionState::Preflight);
    assert_eq!(h.backend.status_calls(), 0);

    // still re-runnable, and the join stays out of reach
    assert!(h.controller.run_preflight().await.is_ok());
    assert_matches!(
        h.controller.start_or_join_session().await,
        Err(VideoConsultationError::InvalidStateTransition { from: SessionState::Preflight, .. })
    );
    assert_eq!(h.backend.session_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_denied_permissions_keep_session_in_preflight() {
    let h = harness(ParticipantRole::Guest);
    h.media.set_deny_permissions(true);

    let result = h.controller.run_preflight().await.unwrap();

    assert!(!result.permissions_ok());
    assert_eq!(h.controller.state(), SessionState::Preflight);
}

#[tokio::test(start_paused = true)]
async fn test_backend_refusing_join_fails_preflight() {
    let h = harness(ParticipantRole::Guest);
    h.backend.set_can_join(false);

    let result = h.controller.run_preflight().await;

    assert_matches!(result, Err(VideoConsultationError::SessionNoLongerValid { .. }));
    assert_eq!(h.controller.state(), SessionState::Failed);
    assert!(h.controller.failure_screen().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_preflight_selects_default_devices() {
    let h = harness(ParticipantRole::Guest);
    h.controller.run_preflight().await.unwrap();

    assert_eq!(h.controller.state(), SessionState::DeviceSetup);
    let selection = h.controller.device_selection();
    assert_eq!(selection.camera_id.as_deref(), Some("cam-1"));
    assert_eq!(selection.microphone_id.as_deref(), Some("mic-1"));
    assert_eq!(selection.speaker_id.as_deref(), Some("spk-1"));
}

// ==============================================================================
// START / JOIN
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_host_starts_and_becomes_active() {
    let h = active(ParticipantRole::Host).await;

    assert_eq!(h.backend.requested_roles(), vec![ParticipantRole::Host]);
    let session = h.controller.session_data().unwrap();
    assert_eq!(session.room_name, "consult-room");
    assert_eq!(h.engine.join_calls(), 1);

    let handle = h.engine.last_handle().unwrap();
    assert_eq!(handle.video_input().as_deref(), Some("cam-1"));
    assert_eq!(h.controller.analytics().count_of(AnalyticsEventType::ConferenceJoined), 1);
}

#[tokio::test(start_paused = true)]
async fn test_guest_joins() {
    let h = active(ParticipantRole::Guest).await;
    assert_eq!(h.backend.requested_roles(), vec![ParticipantRole::Guest]);
}

#[tokio::test(start_paused = true)]
async fn test_token_rejection_fails_without_going_active() {
    let h = harness(ParticipantRole::Guest);
    h.backend.set_reject_session(true);
    h.controller.run_preflight().await.unwrap();

    let result = h.controller.start_or_join_session().await;

    assert_matches!(result, Err(VideoConsultationError::TokenAcquisitionFailure { .. }));
    assert_eq!(h.controller.state(), SessionState::Failed);
    assert_eq!(h.engine.join_calls(), 0);
    assert!(h.controller.session_data().is_none());

    // no token was ever granted, so there is nothing to release
    h.controller.abandon().await;
    assert_eq!(h.controller.state(), SessionState::Ended);
    assert_eq!(h.backend.disconnect_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_initial_auth_failure_retries_once_with_relaxed_config() {
    let h = harness(ParticipantRole::Host);
    h.controller.run_preflight().await.unwrap();
    h.engine.fail_next_join(auth_failure());

    h.controller.start_or_join_session().await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Active);
    let requests = h.engine.join_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].config.lobby_enabled);
    assert!(!requests[1].config.lobby_enabled);
    assert!(!requests[1].config.bot_detection_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_relaxed_retry_is_available_again_after_initial_join() {
    let h = harness(ParticipantRole::Host);
    h.controller.run_preflight().await.unwrap();
    h.engine.fail_next_join(auth_failure());
    h.controller.start_or_join_session().await.unwrap();
    settle().await;
    let before = h.engine.join_requests().len();

    h.engine
        .emit(ConferenceEvent::error(ConferenceErrorKind::ConferenceAuth, "membersOnly"));
    settle().await;

    let requests = h.engine.join_requests();
    assert_eq!(requests.len(), before + 1);
    assert!(!requests[before].config.lobby_enabled);
    assert_eq!(h.controller.state(), SessionState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_initial_auth_failure_fails_session() {
    let h = harness(ParticipantRole::Host);
    h.controller.run_preflight().await.unwrap();
    h.engine.fail_next_joins(2, auth_failure());

    let result = h.controller.start_or_join_session().await;

    assert_matches!(result, Err(VideoConsultationError::ConferenceJoinFailure { auth_related: true, .. }));
    assert_eq!(h.controller.state(), SessionState::Failed);
    assert_eq!(h.engine.join_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_from_failure_screen_audio_only() {
    let h = harness(ParticipantRole::Guest);
    h.backend.set_reject_session(true);
    h.controller.run_preflight().await.unwrap();
    assert!(h.controller.start_or_join_session().await.is_err());

    let screen = h.controller.failure_screen().unwrap();
    assert_eq!(
        screen.options,
        vec![FailureOption::Retry, FailureOption::AudioOnly, FailureOption::Abandon]
    );

    h.backend.set_reject_session(false);
    h.controller.retry_session(RetryMode::AudioOnly).await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Active);
    assert!(h.controller.failure_screen().is_none());
    assert!(h.controller.is_audio_only());
    assert!(h.engine.join_requests()[0].config.start_audio_only);
    assert!(h.engine.last_handle().unwrap().is_video_muted());
}

#[tokio::test(start_paused = true)]
async fn test_retry_requires_failed_state() {
    let h = active(ParticipantRole::Guest).await;
    assert_matches!(
        h.controller.retry_session(RetryMode::Full).await,
        Err(VideoConsultationError::InvalidStateTransition { from: SessionState::Active, .. })
    );
}

// ==============================================================================
// MONITORS
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_monitors_run_only_while_active() {
    let h = harness(ParticipantRole::Guest);
    h.controller.run_preflight().await.unwrap();
    assert!(h.controller.active_tasks().is_empty());

    h.controller.start_or_join_session().await.unwrap();
    let mut tasks = h.controller.active_tasks();
    tasks.sort_by_key(|kind| format!("{:?}", kind));
    assert_eq!(tasks, vec![TaskKind::Heartbeat, TaskKind::QualitySampling]);

    h.engine.emit(ConferenceEvent::connection_dropped());
    settle().await;
    assert_eq!(h.controller.state(), SessionState::Reconnecting);
    assert_eq!(h.controller.active_tasks(), vec![TaskKind::ReconnectionBackoff]);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(h.controller.state(), SessionState::Active);
    assert!(h.controller.active_tasks().contains(&TaskKind::Heartbeat));
    assert!(!h.controller.active_tasks().contains(&TaskKind::ReconnectionBackoff));

    h.controller.end_session(EndReason::UserEnded).await;
    assert!(h.controller.active_tasks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_quality_samples_every_five_seconds() {
    let h = active(ParticipantRole::Guest).await;

    tokio::time::sleep(Duration::from_secs(26)).await;

    let samples = h.controller.quality_samples();
    assert_eq!(samples.len(), 5);
    assert_eq!(samples[0].participant_count, 1);
    assert!(samples[0].network_info.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_inactive_ends_session() {
    let h = active(ParticipantRole::Guest).await;
    h.backend.set_heartbeat_active(false);

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(h.controller.state(), SessionState::Ended);
    assert_eq!(h.backend.heartbeat_calls(), 1);
    assert_eq!(h.backend.disconnect_reasons(), vec![EndReason::RemoteEnded]);
    assert_eq!(h.controller.teardown_runs(), 1);
    assert_eq!(h.engine.live_handles(), 0);
    assert!(h.controller.active_tasks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_intervals_still_run_monitors() {
    let config = ConsultationConfig {
        heartbeat_interval: Duration::ZERO,
        quality_sample_interval: Duration::ZERO,
        ..ConsultationConfig::default()
    };
    let h = harness_configured(ParticipantRole::Guest, StaticEnvironment::default(), config);
    h.controller.run_preflight().await.unwrap();
    h.controller.start_or_join_session().await.unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;

    assert_eq!(h.controller.state(), SessionState::Active);
    assert_eq!(h.backend.heartbeat_calls(), 3);
    assert_eq!(h.controller.quality_samples().len(), 3);
    let tasks = h.controller.active_tasks();
    assert!(tasks.contains(&TaskKind::Heartbeat));
    assert!(tasks.contains(&TaskKind::QualitySampling));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_network_errors_are_transient() {
    let h = active(ParticipantRole::Guest).await;
    h.backend.set_heartbeat_fails(true);

    tokio::time::sleep(Duration::from_secs(95)).await;

    assert_eq!(h.controller.state(), SessionState::Active);
    assert_eq!(h.backend.heartbeat_calls(), 3);
    assert_eq!(h.backend.disconnect_calls(), 0);
}

// ==============================================================================
// RECONNECTION
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_three_drops_each_recovered_end_active_with_counter_reset() {
    let h = active(ParticipantRole::Guest).await;

    for round in 1..=3 {
        h.engine.emit(ConferenceEvent::connection_dropped());
        settle().await;
        assert_eq!(h.controller.state(), SessionState::Reconnecting, "round {}", round);
        assert_eq!(h.controller.reconnection_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(h.controller.state(), SessionState::Active, "round {}", round);
        assert_eq!(h.controller.reconnection_attempts(), 0);
    }

    assert_eq!(h.engine.join_calls(), 4);
    assert_eq!(h.engine.live_handles(), 1);
    // every attempt re-validated the session first
    assert_eq!(h.backend.status_calls(), 4);
    assert_eq!(h.controller.analytics().count_of(AnalyticsEventType::ReconnectionSucceeded), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unrecovered_drop_fails_after_three_attempts() {
    let h = active(ParticipantRole::Guest).await;
    h.engine.fail_next_joins(3, connection_lost());

    h.engine.emit(ConferenceEvent::connection_dropped());
    settle().await;

    // 1s + 2s + 4s of backoff
    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert_eq!(h.controller.state(), SessionState::Reconnecting);
    assert_eq!(h.controller.reconnection_attempts(), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.controller.state(), SessionState::Failed);
    assert_eq!(h.controller.reconnection_attempts(), 3);
    assert_eq!(h.engine.join_calls(), 4);
    assert_eq!(h.engine.live_handles(), 0);
    assert!(h.controller.session_data().is_none());
    assert!(h.controller.active_tasks().is_empty());

    let screen = h.controller.failure_screen().unwrap();
    assert!(screen.options.contains(&FailureOption::AudioOnly));
    assert!(screen.options.contains(&FailureOption::Retry));
    assert!(screen.options.contains(&FailureOption::Abandon));
    assert!(screen.message.contains("3 attempts"));
}

#[tokio::test(start_paused = true)]
async fn test_recovery_in_flight_ignores_further_drops() {
    let h = active(ParticipantRole::Guest).await;

    h.engine.emit(ConferenceEvent::connection_dropped());
    settle().await;
    assert!(h.controller.is_recovery_in_flight());
    assert_eq!(h.controller.reconnection_attempts(), 1);

    h.engine.emit(ConferenceEvent::connection_dropped());
    h.engine.emit(ConferenceEvent::error(ConferenceErrorKind::Network, "offline"));
    settle().await;
    assert_eq!(h.controller.reconnection_attempts(), 1);
    assert!(!h.controller.attempt_recovery(FailureKind::ConnectionLost));

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(h.controller.state(), SessionState::Active);
    assert_eq!(h.engine.join_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_mid_session_gets_exactly_one_fallback_retry() {
    let h = active(ParticipantRole::Host).await;
    h.engine.fail_next_joins(2, auth_failure());

    h.engine
        .emit(ConferenceEvent::error(ConferenceErrorKind::ConferenceAuth, "membersOnly"));
    settle().await;

    // relaxed retry failed at once, backoff attempt 1 fails after 1s,
    // attempt 2 succeeds after another 2s
    tokio::time::sleep(Duration::from_millis(3_200)).await;
    assert_eq!(h.controller.state(), SessionState::Active);

    let requests = h.engine.join_requests();
    assert_eq!(requests.len(), 4);
    let relaxed = requests
        .iter()
        .filter(|request| !request.config.lobby_enabled)
        .count();
    assert_eq!(relaxed, 1);
    assert!(!requests[1].config.lobby_enabled);
    assert!(requests[2].config.lobby_enabled);
    assert!(requests[3].config.lobby_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_camera_error_degrades_to_audio_only() {
    let h = active(ParticipantRole::Guest).await;

    h.engine
        .emit(ConferenceEvent::error(ConferenceErrorKind::Camera, "NotReadableError"));
    settle().await;

    assert_eq!(h.controller.state(), SessionState::Active);
    assert!(h.controller.is_audio_only());
    assert!(h.engine.last_handle().unwrap().is_video_muted());
    assert_eq!(h.engine.join_calls(), 1);
    assert_eq!(h.controller.analytics().count_of(AnalyticsEventType::AudioOnlyEnabled), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_again_shows_permission_failure() {
    let h = active(ParticipantRole::Guest).await;
    h.media.set_deny_permissions(true);

    h.engine
        .emit(ConferenceEvent::error(ConferenceErrorKind::PermissionDenied, "NotAllowedError"));
    settle().await;

    assert_eq!(h.controller.state(), SessionState::Failed);
    let screen = h.controller.failure_screen().unwrap();
    assert!(screen.permission_related);
}

#[tokio::test(start_paused = true)]
async fn test_permission_regranted_reconnects() {
    let h = active(ParticipantRole::Guest).await;

    h.engine
        .emit(ConferenceEvent::error(ConferenceErrorKind::PermissionDenied, "NotAllowedError"));
    settle().await;
    assert_eq!(h.controller.state(), SessionState::Reconnecting);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(h.controller.state(), SessionState::Active);
    assert_eq!(h.controller.analytics().count_of(AnalyticsEventType::PermissionRequested), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backend_closed_session_during_reconnect_fails() {
    let h = active(ParticipantRole::Guest).await;
    h.backend.set_can_join(false);

    h.engine.emit(ConferenceEvent::connection_dropped());
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(h.controller.state(), SessionState::Failed);
    assert_eq!(h.engine.join_calls(), 1);
    assert!(h.controller.failure_screen().unwrap().message.contains("no longer valid"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_generation_events_are_dropped() {
    let h = active(ParticipantRole::Guest).await;
    let first_generation = h.controller.conference_generation();

    h.engine.emit(ConferenceEvent::connection_dropped());
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(h.controller.state(), SessionState::Active);
    assert!(h.controller.conference_generation() > first_generation);

    h.controller
        .on_adapter_event(AdapterEvent {
            generation: first_generation,
            event: ConferenceEvent::Left,
        })
        .await;

    assert_eq!(h.controller.state(), SessionState::Active);
    assert_eq!(h.backend.disconnect_calls(), 0);
}

// ==============================================================================
// ENDING & TEARDOWN
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_session_twice_calls_disconnect_once() {
    let h = active(ParticipantRole::Guest).await;

    let first = h.controller.end_session(EndReason::UserEnded).await;
    let second = h.controller.end_session(EndReason::UserEnded).await;

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(h.backend.disconnect_calls(), 1);
    assert_eq!(h.backend.complete_calls(), 0);
    assert_eq!(h.controller.state(), SessionState::Ended);
    assert!(h.controller.session_data().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_end_triggers_tear_down_once() {
    let h = active(ParticipantRole::Guest).await;
    let preview = h.controller.start_preview().await.unwrap();

    let (a, b, c) = tokio::join!(
        h.controller.end_session(EndReason::UserEnded),
        h.controller.handle_lifecycle(LifecycleTrigger::TabClosed),
        h.controller.handle_lifecycle(LifecycleTrigger::PageHidden),
    );

    assert_eq!([a.is_some(), b.is_some(), c.is_some()].iter().filter(|x| **x).count(), 1);
    assert_eq!(h.controller.teardown_runs(), 1);
    assert_eq!(h.engine.total_dispose_calls(), 1);
    assert_eq!(h.backend.disconnect_calls(), 1);
    assert_eq!(h.backend.summaries().len(), 1);

    let stream = h
        .media
        .streams()
        .into_iter()
        .find(|s| s.id() == preview.id())
        .unwrap();
    assert_eq!(stream.stop_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_during_backoff_cancels_pending_rejoin() {
    let h = active(ParticipantRole::Guest).await;

    h.engine.emit(ConferenceEvent::connection_dropped());
    settle().await;
    assert_eq!(h.controller.state(), SessionState::Reconnecting);

    h.controller.handle_lifecycle(LifecycleTrigger::Navigation).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(h.controller.state(), SessionState::Ended);
    assert_eq!(h.engine.join_calls(), 1);
    assert!(!h.controller.is_recovery_in_flight());
    assert_eq!(h.backend.disconnect_reasons(), vec![EndReason::Navigation]);
}

#[tokio::test(start_paused = true)]
async fn test_no_media_is_captured_after_end() {
    let h = active(ParticipantRole::Guest).await;
    h.controller.end_session(EndReason::UserEnded).await;
    let opened = h.media.open_calls();

    assert_matches!(
        h.controller.start_preview().await,
        Err(VideoConsultationError::SessionEnded)
    );
    assert_matches!(
        h.controller.switch_camera("cam-2").await,
        Err(VideoConsultationError::SessionEnded)
    );

    assert_eq!(h.media.open_calls(), opened);
    assert!(h.media.streams().iter().all(|stream| stream.stop_calls() > 0));
}

#[tokio::test(start_paused = true)]
async fn test_preview_opened_during_teardown_is_stopped() {
    let h = active(ParticipantRole::Guest).await;

    let (preview, _) = tokio::join!(
        h.controller.start_preview(),
        h.controller.end_session(EndReason::UserEnded),
    );

    if let Ok(stream) = preview {
        let opened = h.media.streams().into_iter().find(|s| s.id() == stream.id()).unwrap();
        assert_eq!(opened.stop_calls(), 1);
    }
    assert!(h.media.streams().iter().all(|stream| stream.stop_calls() > 0));
}

#[tokio::test(start_paused = true)]
async fn test_remote_left_ends_session() {
    let h = active(ParticipantRole::Guest).await;

    h.engine.emit(ConferenceEvent::Left);
    settle().await;

    assert_eq!(h.controller.state(), SessionState::Ended);
    assert_eq!(h.backend.disconnect_reasons(), vec![EndReason::ConferenceLeft]);
}

#[tokio::test(start_paused = true)]
async fn test_summary_is_sent_on_end() {
    let h = active(ParticipantRole::Host).await;
    h.engine.emit(ConferenceEvent::ParticipantJoined {
        participant_id: "patient-1".to_string(),
    });
    tokio::time::sleep(Duration::from_secs(6)).await;

    h.controller.end_session(EndReason::UserEnded).await;

    let summaries = h.backend.summaries();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.session_id, h.controller.session_id());
    assert_eq!(summary.event_counts.participant, 1);
    assert!(summary.event_counts.connection >= 3);
    assert!(summary.final_quality.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_analytics_failures_never_affect_the_session() {
    let h = harness(ParticipantRole::Guest);
    h.backend.set_analytics_fails(true);
    h.controller.run_preflight().await.unwrap();
    h.controller.start_or_join_session().await.unwrap();

    let report = h.controller.end_session(EndReason::UserEnded).await.unwrap();

    assert!(report.conference_disposed);
    assert_eq!(h.controller.state(), SessionState::Ended);
    assert_eq!(h.backend.disconnect_calls(), 1);
}

// ==============================================================================
// CONTROLS
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_only_host_completes_appointment() {
    let guest = active(ParticipantRole::Guest).await;
    assert_matches!(
        guest.controller.complete_appointment().await,
        Err(VideoConsultationError::Unauthorized)
    );
    assert_eq!(guest.backend.complete_calls(), 0);

    let host = active(ParticipantRole::Host).await;
    host.controller.complete_appointment().await.unwrap();
    assert_eq!(host.backend.complete_calls(), 1);
    assert_eq!(host.backend.disconnect_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_switch_devices_on_live_conference() {
    let h = active(ParticipantRole::Guest).await;

    h.controller.switch_camera("cam-2").await.unwrap();
    h.controller.switch_microphone("mic-1").await.unwrap();

    let handle = h.engine.last_handle().unwrap();
    assert_eq!(handle.video_input().as_deref(), Some("cam-2"));
    assert_eq!(handle.audio_input().as_deref(), Some("mic-1"));
    assert_eq!(h.controller.device_selection().camera_id.as_deref(), Some("cam-2"));

    assert_matches!(
        h.controller.switch_camera("cam-9").await,
        Err(VideoConsultationError::DeviceFailure { device: DeviceKind::Camera, .. })
    );
}

#[tokio::test(start_paused = true)]
async fn test_mute_state_survives_reconnection() {
    let h = active(ParticipantRole::Guest).await;
    h.controller.set_audio_muted(true).unwrap();
    assert!(h.engine.last_handle().unwrap().is_audio_muted());

    h.engine.emit(ConferenceEvent::connection_dropped());
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(h.controller.state(), SessionState::Active);
    assert!(h.engine.last_handle().unwrap().is_audio_muted());
}

// ==============================================================================
// EVENT SEQUENCES
// ==============================================================================

const ALL_STATES: [SessionState; 10] = [
    SessionState::Idle,
    SessionState::Preflight,
    SessionState::DeviceSetup,
    SessionState::Starting,
    SessionState::Joining,
    SessionState::Active,
    SessionState::Reconnecting,
    SessionState::Ending,
    SessionState::Ended,
    SessionState::Failed,
];

/// Whether `to` is reachable from `from` in at most two enumerated steps.
/// One settle can cover two steps, e.g. `Active -> Ending -> Ended`.
fn reachable(from: SessionState, to: SessionState) -> bool {
    from == to
        || from.can_transition_to(to)
        || ALL_STATES
            .iter()
            .any(|mid| from.can_transition_to(*mid) && mid.can_transition_to(to))
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) % bound
    }
}

#[tokio::test(start_paused = true)]
async fn test_mixed_event_sequences_only_follow_enumerated_transitions() {
    let error_kinds = [
        ConferenceErrorKind::ConnectionDropped,
        ConferenceErrorKind::Network,
        ConferenceErrorKind::ConferenceAuth,
        ConferenceErrorKind::Camera,
        ConferenceErrorKind::Microphone,
        ConferenceErrorKind::PermissionDenied,
        ConferenceErrorKind::SessionInvalid,
        ConferenceErrorKind::Other,
    ];

    for seed in 1..=12u64 {
        let h = active(ParticipantRole::Host).await;
        let mut rng = Lcg(seed);
        let mut previous = h.controller.state();

        for step in 0..40 {
            match rng.next(7) {
                0 => {
                    h.engine.emit(ConferenceEvent::Joined {
                        room_name: "consult-room".to_string(),
                    });
                }
                1 => {
                    h.engine.emit(ConferenceEvent::Left);
                }
                2 => {
                    h.engine.emit(ConferenceEvent::ParticipantJoined {
                        participant_id: format!("p-{}", step),
                    });
                }
                3 | 4 => {
                    let kind = error_kinds[rng.next(error_kinds.len() as u64) as usize].clone();
                    h.engine.emit(ConferenceEvent::error(kind, "injected"));
                }
                5 => h.engine.fail_next_join(connection_lost()),
                _ => tokio::time::sleep(Duration::from_millis(1_100)).await,
            }
            settle().await;

            let state = h.controller.state();
            assert!(
                reachable(previous, state),
                "seed {} step {}: {} -> {}",
                seed,
                step,
                previous,
                state
            );
            assert_eq!(
                h.controller.active_tasks().contains(&TaskKind::Heartbeat),
                state == SessionState::Active,
                "seed {} step {}: heartbeat task in state {}",
                seed,
                step,
                state
            );
            previous = state;
        }

        h.controller.end_session(EndReason::UserEnded).await;
        assert_eq!(h.controller.state(), SessionState::Ended);
        assert!(h.controller.active_tasks().is_empty());
    }
}
