//! Log-driven tunnel-domain discovery
//!
//! The ephemeral tunnel's public hostname is assigned remotely and only shows
//! up in the tunnel client's log file. Discovery scans the log for the
//! hostname pattern; on a miss it deletes the log, restarts the client and
//! rescans, up to a configured attempt bound. On exhaustion it surfaces a
//! typed error and leaves the rest of the node running.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};

use crate::error::{NodeError, Result};
use crate::settings::DiscoverySettings;
use crate::shutdown::ShutdownSignal;

/// Hostname pattern the tunnel client logs once the edge assigns a domain
const HOST_PATTERN: &str = r"https?://([^\s]*trycloudflare\.com)";

/// A discovered public tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub hostname: String,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredEndpoint {
    /// Endpoint known up front from configuration; no discovery needed
    pub fn fixed(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            discovered_at: Utc::now(),
        }
    }
}

/// Restart seam for the tunnel client, so the discovery loop can be driven
/// in tests without real processes
#[async_trait]
pub trait Relauncher: Send {
    async fn relaunch(&mut self) -> Result<()>;
}

/// Run the bounded discovery loop against the tunnel client's log file
pub async fn discover(
    boot_log: &Path,
    settings: &DiscoverySettings,
    relauncher: &mut dyn Relauncher,
    shutdown: &ShutdownSignal,
) -> Result<DiscoveredEndpoint> {
    let mut shutdown = shutdown.clone();

    for attempt in 1..=settings.max_attempts {
        if shutdown.is_shutdown() {
            return Err(NodeError::DiscoveryCancelled);
        }

        let content = tokio::fs::read_to_string(boot_log)
            .await
            .unwrap_or_default();

        if let Some(hostname) = scan_log(&content) {
            info!("Tunnel domain discovered: {} (attempt {})", hostname, attempt);
            return Ok(DiscoveredEndpoint {
                hostname,
                discovered_at: Utc::now(),
            });
        }

        if attempt == settings.max_attempts {
            break;
        }

        warn!(
            "Tunnel domain not found (attempt {}/{}), restarting tunnel client",
            attempt, settings.max_attempts
        );

        // A fresh log file per attempt, so a stale match can never win
        let _ = tokio::fs::remove_file(boot_log).await;

        sleep_or_cancel(Duration::from_secs(settings.cooldown_secs), &mut shutdown).await?;

        if let Err(e) = relauncher.relaunch().await {
            warn!("Tunnel client relaunch failed: {}", e);
        }

        sleep_or_cancel(Duration::from_secs(settings.settle_secs), &mut shutdown).await?;
    }

    Err(NodeError::DiscoveryExhausted {
        attempts: settings.max_attempts,
    })
}

/// Scan log lines for the hostname pattern; the first match by line order
/// wins.
fn scan_log(content: &str) -> Option<String> {
    let pattern = Regex::new(HOST_PATTERN).ok()?;

    for line in content.lines() {
        if let Some(captures) = pattern.captures(line) {
            return Some(captures[1].to_string());
        }
    }

    None
}

async fn sleep_or_cancel(duration: Duration, shutdown: &mut ShutdownSignal) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = shutdown.wait() => Err(NodeError::DiscoveryCancelled),
    }
}
