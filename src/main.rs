//! Alert Relay Server
//!
//! Run with: cargo run
//!
//! Configuration is read from the environment. Required:
//! - ZABBIX_URL: Source base URL
//! - ZABBIX_API_TOKEN, or ZABBIX_USERNAME and ZABBIX_PASSWORD
//! - TELEGRAM_BOT_TOKEN: Bot credentials
//! - TELEGRAM_CHAT_ID: Target chat
//!
//! Optional:
//! - POLL_INTERVAL: Seconds between checks (default: 60)
//! - MIN_SEVERITY: Minimum severity 0-5 (default: 2)
//! - DATABASE_PATH: SQLite file (default: data/alerts.db)
//! - RELAY_HOST / RELAY_PORT: Status API bind address (default: 0.0.0.0:8080)
//! - RUST_LOG: Log filter (default: alert_relay=info,tower_http=info)

use std::sync::Arc;

use alert_relay::api::{run_server, AppState};
use alert_relay::config::RelayConfig;
use alert_relay::delivery::format::escape_html;
use alert_relay::delivery::{DeliveryChannel, TelegramTransport};
use alert_relay::monitor::Monitor;
use alert_relay::source::{ProblemSource, ZabbixSource};
use alert_relay::store::AlertStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alert_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;

    tracing::info!("Alert relay configuration:");
    tracing::info!("  Source: {}", config.zabbix.url);
    tracing::info!("  Chat: {}", config.telegram.chat_id);
    tracing::info!("  Poll interval: {:?}", config.monitor.poll_interval);
    tracing::info!("  Database: {}", config.database_path.display());
    for line in config.filter.summary().lines() {
        tracing::info!("  {}", line);
    }

    let store = AlertStore::open(&config.database_path)?;
    let source = Arc::new(ZabbixSource::new(&config.zabbix, config.monitor.request_timeout)?);
    let transport = Arc::new(TelegramTransport::new(&config.telegram, config.delivery.timeout)?);
    let channel = DeliveryChannel::new(transport, config.delivery.clone());

    if !source.check_connection().await {
        tracing::warn!("Source unreachable at startup, the monitor will keep retrying");
    }
    if !channel.check_connection().await {
        tracing::warn!("Chat transport unreachable at startup");
    }

    let monitor = Monitor::new(
        config.monitor.clone(),
        config.filter.clone(),
        source,
        channel.clone(),
        Some(store.clone()),
    );
    let handle = monitor.handle();
    let monitor_task = tokio::spawn(monitor.run());

    notify(&channel, &startup_message(&config)).await;

    let state = Arc::new(AppState {
        monitor: handle.clone(),
        store,
    });
    let served = run_server(config.server.clone(), state, shutdown_signal()).await;

    handle.stop();
    if let Err(e) = monitor_task.await {
        tracing::error!(error = %e, "Monitor task failed");
    }
    notify(&channel, "🔴 <b>Alert relay stopped</b>").await;

    served
}

fn startup_message(config: &RelayConfig) -> String {
    format!(
        "🟢 <b>Alert relay started</b>\n\nSource: {}\n{}",
        escape_html(&config.zabbix.url),
        escape_html(&config.filter.summary())
    )
}

/// Best-effort service message; failures are logged only
async fn notify(channel: &DeliveryChannel, text: &str) {
    if let Err(e) = channel.send(text, None).await {
        tracing::warn!(error = %e, "Failed to send service message");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }

    tracing::info!("Shutdown signal received, stopping monitor...");
}
