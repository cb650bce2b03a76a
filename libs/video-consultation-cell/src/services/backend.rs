// libs/video-consultation-cell/src/services/backend.rs
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::models::{
    AnalyticsEvent, DisconnectRequest, EndReason, HeartbeatRequest, HeartbeatResponse,
    ParticipantRole, SessionState, SessionSummary, VideoConsultationError, VideoSessionGrant,
    VideoStatusResponse,
};

/// Appointment-scoped video endpoints consumed by the session controller.
#[async_trait::async_trait]
pub trait VideoBackend: Send + Sync {
    /// `GET /video/status`
    async fn video_status(&self) -> Result<VideoStatusResponse, VideoConsultationError>;

    /// `POST /video/start` for the host, `POST /video/join` for the guest.
    async fn request_session(
        &self,
        role: ParticipantRole,
    ) -> Result<VideoSessionGrant, VideoConsultationError>;

    /// `POST /video/heartbeat`
    async fn heartbeat(
        &self,
        session_id: Uuid,
        state: SessionState,
    ) -> Result<HeartbeatResponse, VideoConsultationError>;

    /// `POST /video/disconnect`: releases the video slot, appointment stays open.
    async fn disconnect(
        &self,
        session_id: Uuid,
        reason: EndReason,
    ) -> Result<(), VideoConsultationError>;

    /// `POST /appointments/{id}/complete`
    async fn complete_appointment(&self) -> Result<(), VideoConsultationError>;

    /// `POST /video/analytics`
    async fn send_analytics(&self, events: &[AnalyticsEvent]) -> Result<(), VideoConsultationError>;

    /// `POST /video/analytics/summary`
    async fn send_summary(&self, summary: &SessionSummary) -> Result<(), VideoConsultationError>;
}

/// reqwest implementation of [`VideoBackend`] for one appointment.
pub struct VideoBackendClient {
    client: Client,
    base_url: String,
    auth_token: String,
    appointment_id: Uuid,
}

impl VideoBackendClient {
    pub fn new(config: &AppConfig, appointment_id: Uuid) -> Result<Self, VideoConsultationError> {
        if !config.is_configured() {
            return Err(VideoConsultationError::NotConfigured);
        }

        Ok(Self {
            client: Client::new(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_token: config.api_auth_token.clone(),
            appointment_id,
        })
    }

    /// Use the caller's own bearer token instead of the configured one.
    pub fn with_auth_token(mut self, auth_token: &str) -> Self {
        self.auth_token = auth_token.to_string();
        self
    }

    pub fn appointment_id(&self) -> Uuid {
        self.appointment_id
    }

    fn video_path(&self, action: &str) -> String {
        format!("/appointments/{}/video/{}", self.appointment_id, action)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(StatusCode, String), VideoConsultationError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.auth_token))
            .header("Content-Type", "application/json");

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let response_text = response.text().await?;

        Ok((status, response_text))
    }

    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, VideoConsultationError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let (status, response_text) = self.send(method, path, body).await?;

        if !status.is_success() {
            error!("API error ({}) on {}: {}", status, path, response_text);
            return Err(VideoConsultationError::BackendError {
                status: Some(status.as_u16()),
                message: format!("HTTP {}: {}", status, response_text),
            });
        }

        Ok(serde_json::from_str(&response_text)?)
    }

    /// Like [`Self::request`] but ignores the response body.
    async fn execute<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), VideoConsultationError> {
        let (status, response_text) = self.send(Method::POST, path, body).await?;

        if !status.is_success() {
            error!("API error ({}) on {}: {}", status, path, response_text);
            return Err(VideoConsultationError::BackendError {
                status: Some(status.as_u16()),
                message: format!("HTTP {}: {}", status, response_text),
            });
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl VideoBackend for VideoBackendClient {
    #[instrument(skip(self), fields(appointment_id = %self.appointment_id))]
    async fn video_status(&self) -> Result<VideoStatusResponse, VideoConsultationError> {
        self.request::<_, Value>(Method::GET, &self.video_path("status"), None)
            .await
    }

    #[instrument(skip(self), fields(appointment_id = %self.appointment_id))]
    async fn request_session(
        &self,
        role: ParticipantRole,
    ) -> Result<VideoSessionGrant, VideoConsultationError> {
        let action = match role {
            ParticipantRole::Host => "start",
            ParticipantRole::Guest => "join",
        };

        info!("Requesting video session token ({}) for appointment {}", action, self.appointment_id);

        let (status, response_text) = self
            .send::<Value>(Method::POST, &self.video_path(action), None)
            .await
            .map_err(|e| VideoConsultationError::TokenAcquisitionFailure {
                message: e.to_string(),
            })?;

        if !status.is_success() {
            error!("Video {} rejected: {} - {}", action, status, response_text);
            return Err(VideoConsultationError::TokenAcquisitionFailure {
                message: format!("HTTP {}: {}", status, response_text),
            });
        }

        let grant: VideoSessionGrant = serde_json::from_str(&response_text).map_err(|e| {
            VideoConsultationError::TokenAcquisitionFailure {
                message: format!("Failed to parse session grant: {}", e),
            }
        })?;

        info!("Received video session grant for room {}", grant.room_name);
        Ok(grant)
    }

    async fn heartbeat(
        &self,
        session_id: Uuid,
        state: SessionState,
    ) -> Result<HeartbeatResponse, VideoConsultationError> {
        let body = HeartbeatRequest {
            session_id,
            state,
            sent_at: chrono::Utc::now(),
        };
        self.request(Method::POST, &self.video_path("heartbeat"), Some(&body))
            .await
    }

    #[instrument(skip(self), fields(appointment_id = %self.appointment_id))]
    async fn disconnect(
        &self,
        session_id: Uuid,
        reason: EndReason,
    ) -> Result<(), VideoConsultationError> {
        let body = DisconnectRequest { session_id, reason };
        self.execute(&self.video_path("disconnect"), Some(&body)).await?;
        info!("Released video slot for appointment {} ({:?})", self.appointment_id, reason);
        Ok(())
    }

    #[instrument(skip(self), fields(appointment_id = %self.appointment_id))]
    async fn complete_appointment(&self) -> Result<(), VideoConsultationError> {
        let path = format!("/appointments/{}/complete", self.appointment_id);
        self.execute::<Value>(&path, None).await?;
        info!("Marked appointment {} as complete", self.appointment_id);
        Ok(())
    }

    async fn send_analytics(&self, events: &[AnalyticsEvent]) -> Result<(), VideoConsultationError> {
        self.execute(&self.video_path("analytics"), Some(events)).await
    }

    async fn send_summary(&self, summary: &SessionSummary) -> Result<(), VideoConsultationError> {
        self.execute(&self.video_path("analytics/summary"), Some(summary))
            .await
    }
}

/// Mock backend for unit and controller tests.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::models::ConferenceConfig;
    use crate::services::lock;

    /// Call-counting backend with scriptable responses.
    pub struct MockVideoBackend {
        can_join: AtomicBool,
        heartbeat_active: AtomicBool,
        heartbeat_fails: AtomicBool,
        reject_session: AtomicBool,
        analytics_fails: AtomicBool,
        status_responses: Mutex<VecDeque<Result<VideoStatusResponse, VideoConsultationError>>>,
        config: Mutex<ConferenceConfig>,
        roles: Mutex<Vec<ParticipantRole>>,
        analytics_events: Mutex<Vec<AnalyticsEvent>>,
        summaries: Mutex<Vec<SessionSummary>>,
        disconnect_reasons: Mutex<Vec<EndReason>>,
        status_calls: AtomicUsize,
        session_calls: AtomicUsize,
        heartbeat_calls: AtomicUsize,
        disconnect_calls: AtomicUsize,
        complete_calls: AtomicUsize,
    }

    impl Default for MockVideoBackend {
        fn default() -> Self {
            Self {
                can_join: AtomicBool::new(true),
                heartbeat_active: AtomicBool::new(true),
                heartbeat_fails: AtomicBool::new(false),
                reject_session: AtomicBool::new(false),
                analytics_fails: AtomicBool::new(false),
                status_responses: Mutex::new(VecDeque::new()),
                config: Mutex::new(ConferenceConfig {
                    lobby_enabled: true,
                    bot_detection_enabled: true,
                    ..ConferenceConfig::default()
                }),
                roles: Mutex::new(Vec::new()),
                analytics_events: Mutex::new(Vec::new()),
                summaries: Mutex::new(Vec::new()),
                disconnect_reasons: Mutex::new(Vec::new()),
                status_calls: AtomicUsize::new(0),
                session_calls: AtomicUsize::new(0),
                heartbeat_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                complete_calls: AtomicUsize::new(0),
            }
        }
    }

    impl MockVideoBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_can_join(&self, can_join: bool) {
            self.can_join.store(can_join, Ordering::SeqCst);
        }

        /// Queue one-off `video_status` results ahead of the `can_join` default.
        pub fn push_status(&self, response: Result<VideoStatusResponse, VideoConsultationError>) {
            lock(&self.status_responses).push_back(response);
        }

        pub fn set_heartbeat_active(&self, active: bool) {
            self.heartbeat_active.store(active, Ordering::SeqCst);
        }

        pub fn set_heartbeat_fails(&self, fails: bool) {
            self.heartbeat_fails.store(fails, Ordering::SeqCst);
        }

        pub fn set_reject_session(&self, reject: bool) {
            self.reject_session.store(reject, Ordering::SeqCst);
        }

        pub fn set_analytics_fails(&self, fails: bool) {
            self.analytics_fails.store(fails, Ordering::SeqCst);
        }

        pub fn status_calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }

        pub fn session_calls(&self) -> usize {
            self.session_calls.load(Ordering::SeqCst)
        }

        pub fn requested_roles(&self) -> Vec<ParticipantRole> {
            lock(&self.roles).clone()
        }

        pub fn heartbeat_calls(&self) -> usize {
            self.heartbeat_calls.load(Ordering::SeqCst)
        }

        pub fn disconnect_calls(&self) -> usize {
            self.disconnect_calls.load(Ordering::SeqCst)
        }

        pub fn disconnect_reasons(&self) -> Vec<EndReason> {
            lock(&self.disconnect_reasons).clone()
        }

        pub fn complete_calls(&self) -> usize {
            self.complete_calls.load(Ordering::SeqCst)
        }

        pub fn analytics_events(&self) -> Vec<AnalyticsEvent> {
            lock(&self.analytics_events).clone()
        }

        pub fn summaries(&self) -> Vec<SessionSummary> {
            lock(&self.summaries).clone()
        }

        fn unreachable(&self, what: &str) -> VideoConsultationError {
            VideoConsultationError::NetworkFailure {
                message: format!("mock {} unreachable", what),
            }
        }
    }

    #[async_trait::async_trait]
    impl VideoBackend for MockVideoBackend {
        async fn video_status(&self) -> Result<VideoStatusResponse, VideoConsultationError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(scripted) = lock(&self.status_responses).pop_front() {
                return scripted;
            }
            let can_join = self.can_join.load(Ordering::SeqCst);
            Ok(VideoStatusResponse {
                can_join,
                reason: (!can_join).then(|| "appointment is not joinable".to_string()),
            })
        }

        async fn request_session(
            &self,
            role: ParticipantRole,
        ) -> Result<VideoSessionGrant, VideoConsultationError> {
            let call = self.session_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.roles).push(role);
            if self.reject_session.load(Ordering::SeqCst) {
                return Err(VideoConsultationError::TokenAcquisitionFailure {
                    message: "HTTP 403 Forbidden: appointment not confirmed".to_string(),
                });
            }
            Ok(VideoSessionGrant {
                room_name: "consult-room".to_string(),
                join_token: format!("join-token-{}", call),
                domain: "meet.amae.test".to_string(),
                config: lock(&self.config).clone(),
            })
        }

        async fn heartbeat(
            &self,
            _session_id: Uuid,
            _state: SessionState,
        ) -> Result<HeartbeatResponse, VideoConsultationError> {
            self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
            if self.heartbeat_fails.load(Ordering::SeqCst) {
                return Err(self.unreachable("heartbeat"));
            }
            Ok(HeartbeatResponse {
                active: self.heartbeat_active.load(Ordering::SeqCst),
            })
        }

        async fn disconnect(
            &self,
            _session_id: Uuid,
            reason: EndReason,
        ) -> Result<(), VideoConsultationError> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.disconnect_reasons).push(reason);
            Ok(())
        }

        async fn complete_appointment(&self) -> Result<(), VideoConsultationError> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_analytics(&self, events: &[AnalyticsEvent]) -> Result<(), VideoConsultationError> {
            if self.analytics_fails.load(Ordering::SeqCst) {
                return Err(self.unreachable("analytics"));
            }
            lock(&self.analytics_events).extend_from_slice(events);
            Ok(())
        }

        async fn send_summary(&self, summary: &SessionSummary) -> Result<(), VideoConsultationError> {
            if self.analytics_fails.load(Ordering::SeqCst) {
                return Err(self.unreachable("analytics summary"));
            }
            lock(&self.summaries).push(summary.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> AppConfig {
        AppConfig {
            api_base_url: "https://api.test.amae.clinic/".to_string(),
            api_auth_token: "test-token".to_string(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_client_creation() {
        let config = create_test_config();
        let client = VideoBackendClient::new(&config, Uuid::new_v4());
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_creation_fails_without_config() {
        let mut config = create_test_config();
        config.api_auth_token = "".to_string();

        let client = VideoBackendClient::new(&config, Uuid::new_v4());
        assert!(matches!(client, Err(VideoConsultationError::NotConfigured)));
    }

    #[test]
    fn test_paths_are_appointment_scoped() {
        let appointment_id = Uuid::new_v4();
        let client = VideoBackendClient::new(&create_test_config(), appointment_id).unwrap();
        assert_eq!(client.base_url, "https://api.test.amae.clinic");
        assert_eq!(
            client.video_path("heartbeat"),
            format!("/appointments/{}/video/heartbeat", appointment_id)
        );
    }
}
