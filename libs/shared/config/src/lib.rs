use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_auth_token: String,
    pub latency_probe_url: String,
    pub heartbeat_interval_secs: u64,
    pub quality_sample_interval_secs: u64,
    pub quality_buffer_capacity: usize,
    pub max_reconnection_attempts: u32,
    pub reconnection_base_delay_ms: u64,
    pub reconnection_max_delay_ms: u64,
    pub analytics_send_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            api_auth_token: String::new(),
            latency_probe_url: String::new(),
            heartbeat_interval_secs: 30,
            quality_sample_interval_secs: 5,
            quality_buffer_capacity: 60,
            max_reconnection_attempts: 3,
            reconnection_base_delay_ms: 1_000,
            reconnection_max_delay_ms: 10_000,
            analytics_send_timeout_secs: 5,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_base_url = env::var("CLINIC_API_BASE_URL").unwrap_or_else(|_| {
            warn!("CLINIC_API_BASE_URL not set, using empty value");
            String::new()
        });

        let latency_probe_url = env::var("VIDEO_LATENCY_PROBE_URL").unwrap_or_else(|_| {
            warn!("VIDEO_LATENCY_PROBE_URL not set, probing the API base URL");
            format!("{}/health", api_base_url.trim_end_matches('/'))
        });

        let config = Self {
            api_auth_token: env::var("CLINIC_API_TOKEN").unwrap_or_else(|_| {
                warn!("CLINIC_API_TOKEN not set, using empty value");
                String::new()
            }),
            api_base_url,
            latency_probe_url,
            heartbeat_interval_secs: parse_or_default(
                "VIDEO_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            ),
            quality_sample_interval_secs: parse_or_default(
                "VIDEO_QUALITY_SAMPLE_INTERVAL_SECS",
                defaults.quality_sample_interval_secs,
            ),
            quality_buffer_capacity: parse_or_default(
                "VIDEO_QUALITY_BUFFER_CAPACITY",
                defaults.quality_buffer_capacity,
            ),
            max_reconnection_attempts: parse_or_default(
                "VIDEO_MAX_RECONNECTION_ATTEMPTS",
                defaults.max_reconnection_attempts,
            ),
            reconnection_base_delay_ms: parse_or_default(
                "VIDEO_RECONNECTION_BASE_DELAY_MS",
                defaults.reconnection_base_delay_ms,
            ),
            reconnection_max_delay_ms: parse_or_default(
                "VIDEO_RECONNECTION_MAX_DELAY_MS",
                defaults.reconnection_max_delay_ms,
            ),
            analytics_send_timeout_secs: parse_or_default(
                "VIDEO_ANALYTICS_SEND_TIMEOUT_SECS",
                defaults.analytics_send_timeout_secs,
            ),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.api_base_url.is_empty() && !self.api_auth_token.is_empty()
    }
}

fn parse_or_default<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
