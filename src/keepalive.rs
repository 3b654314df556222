//! Periodic self-ping.
//!
//! Some hosting platforms suspend services that see no traffic for a while.
//! The pinger calls the service's own `/health` endpoint on a fixed interval
//! to keep it awake. The first tick is skipped so the server is not pinged
//! while it is still starting.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::KeepAliveConfig;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the pinger. Returns `None` when disabled.
pub fn spawn(config: KeepAliveConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        tracing::debug!("Keep-alive disabled");
        return None;
    }

    let client = reqwest::Client::builder()
        .timeout(PING_TIMEOUT)
        .user_agent("pairlink-keepalive/1.0")
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());
    let target = format!("{}/health", config.url);
    tracing::info!(
        url = %target,
        interval_secs = config.interval.as_secs(),
        "Keep-alive started"
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            ping(&client, &target).await;
        }
    }))
}

/// Ping once. Returns whether the endpoint answered with a success status.
pub async fn ping(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(url, status = resp.status().as_u16(), "Keep-alive ping ok");
            true
        }
        Ok(resp) => {
            tracing::warn!(url, status = resp.status().as_u16(), "Keep-alive ping failed");
            false
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "Keep-alive ping failed");
            false
        }
    }
}
