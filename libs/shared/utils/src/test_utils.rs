use std::sync::Arc;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use base64::{Engine as _, engine::general_purpose};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;

pub struct TestConfig {
    pub jwt_secret: String,
    pub api_base_url: String,
    pub api_auth_token: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            api_base_url: "http://localhost:54321".to_string(),
            api_auth_token: "test-api-token".to_string(),
        }
    }
}

impl TestConfig {
    /// Point the config at a mock server, e.g. `wiremock::MockServer::uri()`.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            api_base_url: base_url.to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            api_base_url: self.api_base_url.clone(),
            api_auth_token: self.api_auth_token.clone(),
            latency_probe_url: format!("{}/health", self.api_base_url),
            ..AppConfig::default()
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub email: String,
    pub role: String,
}

impl Default for TestUser {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: "test@example.com".to_string(),
            role: "patient".to_string(),
        }
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            role: role.to_string(),
        }
    }

    pub fn doctor(email: &str) -> Self {
        Self::new(email, "doctor")
    }

    pub fn patient(email: &str) -> Self {
        Self::new(email, "patient")
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let payload = json!({
            "sub": user.id,
            "email": user.email,
            "role": user.role,
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }
}

/// Canned bodies for the appointment-scoped video endpoints.
pub struct MockBackendResponses;

impl MockBackendResponses {
    pub fn video_status(can_join: bool, reason: Option<&str>) -> Value {
        json!({
            "canJoin": can_join,
            "reason": reason,
        })
    }

    pub fn session_grant(appointment_id: Uuid) -> Value {
        json!({
            "roomName": format!("consult-{}", appointment_id.simple()),
            "joinToken": "signed-join-token",
            "domain": "meet.amae.test",
            "config": {
                "startWithAudioMuted": false,
                "startWithVideoMuted": false,
                "lobbyEnabled": true,
                "botDetectionEnabled": true,
                "prejoinPageEnabled": false
            }
        })
    }

    pub fn heartbeat(active: bool) -> Value {
        json!({ "active": active })
    }

    pub fn acknowledged() -> Value {
        json!({ "success": true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_has_three_segments() {
        let user = TestUser::doctor("doctor@example.com");
        let token = JwtTestUtils::create_test_token(&user, "secret", None);
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn test_config_points_at_base_url() {
        let config = TestConfig::with_base_url("http://127.0.0.1:9999").to_app_config();
        assert_eq!(config.api_base_url, "http://127.0.0.1:9999");
        assert_eq!(config.latency_probe_url, "http://127.0.0.1:9999/health");
        assert!(config.is_configured());
    }

    #[test]
    fn test_session_grant_shape() {
        let grant = MockBackendResponses::session_grant(Uuid::new_v4());
        assert!(grant["roomName"].as_str().is_some());
        assert_eq!(grant["config"]["lobbyEnabled"], true);
    }
}
