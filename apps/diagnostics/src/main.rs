use anyhow::Context;
use dotenv::dotenv;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use shared_config::AppConfig;
use video_consultation_cell::models::ConnectionQuality;
use video_consultation_cell::services::{HttpLatencyProbe, NetworkProbe, VideoBackend, VideoBackendClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,video_consultation_cell=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting video consultation diagnostics");

    let config = AppConfig::from_env();
    let appointment_id: Uuid = std::env::var("APPOINTMENT_ID")
        .context("APPOINTMENT_ID must be set")?
        .parse()
        .context("APPOINTMENT_ID must be a UUID")?;

    let probe_url = if config.latency_probe_url.is_empty() {
        config.api_base_url.clone()
    } else {
        config.latency_probe_url.clone()
    };

    let network = match HttpLatencyProbe::new(&probe_url) {
        Ok(probe) => match probe.round_trip().await {
            Ok(rtt) => json!({
                "roundTripMs": rtt.as_millis() as u64,
                "quality": ConnectionQuality::from_round_trip(rtt),
            }),
            Err(e) => {
                warn!("Latency probe failed: {}", e);
                json!({ "error": e.to_string() })
            }
        },
        Err(e) => json!({ "error": e.to_string() }),
    };

    let status = match VideoBackendClient::new(&config, appointment_id) {
        Ok(client) => match client.video_status().await {
            Ok(status) => json!({ "canJoin": status.can_join, "reason": status.reason }),
            Err(e) => {
                warn!("Video status check failed: {}", e);
                json!({ "error": e.to_string() })
            }
        },
        Err(e) => json!({ "error": e.to_string() }),
    };

    let report = json!({
        "appointmentId": appointment_id,
        "network": network,
        "videoStatus": status,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
