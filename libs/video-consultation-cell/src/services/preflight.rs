// libs/video-consultation-cell/src/services/preflight.rs
use chrono::Utc;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::models::{
    CheckOutcome, ConnectionQuality, NetworkCheckOutcome, NetworkInfo, SystemCheckResult,
    VideoConsultationError,
};
use crate::services::devices::DeviceProbe;

/// What the client platform can tell us about itself.
pub trait ClientEnvironment: Send + Sync {
    fn user_agent(&self) -> String;
    /// Camera/microphone capture API is available.
    fn has_media_api(&self) -> bool;
    /// Real-time peer connection API is available.
    fn has_rtc_api(&self) -> bool;
    /// Network-interface hints, where the platform exposes them.
    fn network_info(&self) -> Option<NetworkInfo>;
}

/// Measures one round trip to a known asset.
#[async_trait::async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn round_trip(&self) -> Result<Duration, VideoConsultationError>;
}

/// Times an uncached `HEAD` against the configured probe URL.
pub struct HttpLatencyProbe {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpLatencyProbe {
    pub fn new(url: &str) -> Result<Self, VideoConsultationError> {
        if url.is_empty() {
            return Err(VideoConsultationError::NotConfigured);
        }

        Ok(Self {
            client: Client::new(),
            url: url.to_string(),
            timeout: Duration::from_secs(5),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl NetworkProbe for HttpLatencyProbe {
    async fn round_trip(&self) -> Result<Duration, VideoConsultationError> {
        let started = Instant::now();
        let response = self
            .client
            .head(&self.url)
            .query(&[("_", Utc::now().timestamp_millis())])
            .header("Cache-Control", "no-cache")
            .timeout(self.timeout)
            .send()
            .await?;

        let elapsed = started.elapsed();
        if !response.status().is_success() {
            return Err(VideoConsultationError::NetworkFailure {
                message: format!("latency probe returned HTTP {}", response.status()),
            });
        }

        Ok(elapsed)
    }
}

/// Runs the browser, network and permission checks concurrently.
pub struct PreflightChecker {
    environment: Arc<dyn ClientEnvironment>,
    network: Arc<dyn NetworkProbe>,
    devices: Arc<DeviceProbe>,
    supported_browsers: Vec<String>,
}

impl PreflightChecker {
    pub fn new(
        environment: Arc<dyn ClientEnvironment>,
        network: Arc<dyn NetworkProbe>,
        devices: Arc<DeviceProbe>,
        supported_browsers: Vec<String>,
    ) -> Self {
        Self {
            environment,
            network,
            devices,
            supported_browsers,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> SystemCheckResult {
        let (browser, network, permissions) = futures::future::join3(
            self.check_browser(),
            self.check_network(),
            self.check_permissions(),
        )
        .await;

        let result = SystemCheckResult {
            browser,
            network,
            permissions,
            checked_at: Utc::now(),
        };

        info!(
            "Preflight finished: browser={}, network={}, permissions={}",
            result.browser_ok(),
            result.network_ok(),
            result.permissions_ok()
        );
        result
    }

    async fn check_browser(&self) -> CheckOutcome {
        if !self.environment.has_media_api() {
            return CheckOutcome::fail("media capture API is not available");
        }
        if !self.environment.has_rtc_api() {
            return CheckOutcome::fail("real-time connection API is not available");
        }

        let user_agent = self.environment.user_agent();
        match browser_family(&user_agent) {
            Some(family) if self.supported_browsers.iter().any(|b| b == family) => {
                CheckOutcome::pass(format!("{} is supported", family))
            }
            Some(family) => CheckOutcome::fail(format!("{} is not a supported browser", family)),
            None => CheckOutcome::fail(format!("unrecognized browser: {}", user_agent)),
        }
    }

    async fn check_network(&self) -> NetworkCheckOutcome {
        match self.network.round_trip().await {
            Ok(rtt) => {
                let quality = ConnectionQuality::from_round_trip(rtt);
                debug!("Latency probe: {} ms ({:?})", rtt.as_millis(), quality);
                NetworkCheckOutcome {
                    quality: Some(quality),
                    round_trip_ms: Some(rtt.as_millis() as u64),
                    detail: format!("{} ms round trip", rtt.as_millis()),
                }
            }
            Err(e) => {
                warn!("Latency probe failed: {}", e);
                NetworkCheckOutcome {
                    quality: None,
                    round_trip_ms: None,
                    detail: e.to_string(),
                }
            }
        }
    }

    async fn check_permissions(&self) -> CheckOutcome {
        match self.devices.request_permissions().await {
            Ok(()) => CheckOutcome::pass("camera and microphone access granted"),
            Err(e) => CheckOutcome::fail(e.to_string()),
        }
    }
}

/// Browser family from a user-agent string. Order matters: Edge and Opera
/// also advertise Chrome, and Chrome also advertises Safari.
fn browser_family(user_agent: &str) -> Option<&'static str> {
    let ua = user_agent.to_lowercase();
    if ua.contains("edg/") || ua.contains("edge/") {
        Some("edge")
    } else if ua.contains("opr/") || ua.contains("opera") {
        Some("opera")
    } else if ua.contains("chromium") {
        Some("chromium")
    } else if ua.contains("chrome/") || ua.contains("crios/") {
        Some("chrome")
    } else if ua.contains("firefox/") || ua.contains("fxios/") {
        Some("firefox")
    } else if ua.contains("safari/") {
        Some("safari")
    } else if ua.contains("msie") || ua.contains("trident/") {
        Some("internet-explorer")
    } else {
        None
    }
}

pub mod mock {
    use super::*;
    use std::sync::Mutex;

    use crate::services::lock;

    pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    /// Fixed platform capabilities.
    pub struct StaticEnvironment {
        pub user_agent: String,
        pub media_api: bool,
        pub rtc_api: bool,
        pub network_info: Option<NetworkInfo>,
    }

    impl Default for StaticEnvironment {
        fn default() -> Self {
            Self {
                user_agent: CHROME_USER_AGENT.to_string(),
                media_api: true,
                rtc_api: true,
                network_info: Some(NetworkInfo {
                    effective_type: Some("4g".to_string()),
                    downlink_mbps: Some(10.0),
                    rtt_ms: Some(50),
                }),
            }
        }
    }

    impl StaticEnvironment {
        pub fn without_rtc() -> Self {
            Self {
                rtc_api: false,
                ..Self::default()
            }
        }
    }

    impl ClientEnvironment for StaticEnvironment {
        fn user_agent(&self) -> String {
            self.user_agent.clone()
        }

        fn has_media_api(&self) -> bool {
            self.media_api
        }

        fn has_rtc_api(&self) -> bool {
            self.rtc_api
        }

        fn network_info(&self) -> Option<NetworkInfo> {
            self.network_info.clone()
        }
    }

    /// Reports a fixed round trip, or an error when `rtt` is `None`.
    pub struct FixedLatencyProbe {
        rtt: Mutex<Option<Duration>>,
    }

    impl FixedLatencyProbe {
        pub fn new(rtt: Duration) -> Self {
            Self {
                rtt: Mutex::new(Some(rtt)),
            }
        }

        pub fn unreachable() -> Self {
            Self {
                rtt: Mutex::new(None),
            }
        }

        pub fn set_round_trip(&self, rtt: Option<Duration>) {
            *lock(&self.rtt) = rtt;
        }
    }

    #[async_trait::async_trait]
    impl NetworkProbe for FixedLatencyProbe {
        async fn round_trip(&self) -> Result<Duration, VideoConsultationError> {
            let rtt = *lock(&self.rtt);
            rtt.ok_or_else(|| VideoConsultationError::NetworkFailure {
                message: "probe asset unreachable".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{FixedLatencyProbe, StaticEnvironment};
    use super::*;
    use crate::models::ConsultationConfig;
    use crate::services::devices::mock::MockMediaDevices;
    use crate::services::devices::MediaRegistry;

    fn checker(
        environment: StaticEnvironment,
        probe: FixedLatencyProbe,
        media: Arc<MockMediaDevices>,
    ) -> PreflightChecker {
        let devices = Arc::new(DeviceProbe::new(media, Arc::new(MediaRegistry::new())));
        PreflightChecker::new(
            Arc::new(environment),
            Arc::new(probe),
            devices,
            ConsultationConfig::default().supported_browsers,
        )
    }

    #[test]
    fn test_browser_family_detection() {
        assert_eq!(browser_family(mock::CHROME_USER_AGENT), Some("chrome"));
        assert_eq!(
            browser_family("Mozilla/5.0 (Windows NT 10.0) Chrome/120.0 Safari/537.36 Edg/120.0"),
            Some("edge")
        );
        assert_eq!(
            browser_family("Mozilla/5.0 (Macintosh) AppleWebKit/605.1.15 Version/17.0 Safari/605.1.15"),
            Some("safari")
        );
        assert_eq!(browser_family("Mozilla/5.0 (Windows NT 6.1; Trident/7.0; rv:11.0)"), Some("internet-explorer"));
        assert_eq!(browser_family("curl/8.0"), None);
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let media = Arc::new(MockMediaDevices::new());
        let checker = checker(
            StaticEnvironment::default(),
            FixedLatencyProbe::new(Duration::from_millis(80)),
            media.clone(),
        );

        let result = checker.run().await;
        assert!(result.can_join());
        assert_eq!(result.network.quality, Some(ConnectionQuality::Excellent));
        // permission probe stream was released straight away
        assert_eq!(media.streams()[0].stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_is_advisory() {
        let checker = checker(
            StaticEnvironment::default(),
            FixedLatencyProbe::unreachable(),
            Arc::new(MockMediaDevices::new()),
        );

        let result = checker.run().await;
        assert!(!result.network_ok());
        assert!(result.can_join());
    }

    #[tokio::test]
    async fn test_missing_rtc_blocks_join() {
        let checker = checker(
            StaticEnvironment::without_rtc(),
            FixedLatencyProbe::new(Duration::from_millis(80)),
            Arc::new(MockMediaDevices::new()),
        );

        let result = checker.run().await;
        assert!(!result.can_join());
        assert_eq!(
            result.first_blocking_failure().map(|(check, _)| check),
            Some(crate::models::PreflightCheck::Browser)
        );
    }

    #[tokio::test]
    async fn test_unsupported_browser_blocks_join() {
        let environment = StaticEnvironment {
            user_agent: "Mozilla/5.0 (Windows NT 6.1; Trident/7.0; rv:11.0)".to_string(),
            ..StaticEnvironment::default()
        };
        let checker = checker(
            environment,
            FixedLatencyProbe::new(Duration::from_millis(80)),
            Arc::new(MockMediaDevices::new()),
        );

        let result = checker.run().await;
        assert!(!result.browser_ok());
        assert!(result.browser.detail.contains("internet-explorer"));
    }

    #[tokio::test]
    async fn test_denied_permissions_block_join() {
        let media = Arc::new(MockMediaDevices::new());
        media.set_deny_permissions(true);
        let checker = checker(
            StaticEnvironment::default(),
            FixedLatencyProbe::new(Duration::from_millis(450)),
            media,
        );

        let result = checker.run().await;
        assert!(result.browser_ok());
        assert!(!result.permissions_ok());
        assert!(!result.can_join());
        assert_eq!(result.network.quality, Some(ConnectionQuality::Fair));
    }
}
