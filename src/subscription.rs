//! Subscription link encoding and publishing
//!
//! Once the tunnel endpoint is known, three node descriptors (vless, vmess,
//! trojan) are rendered into their standard URI schemes, bundled into a
//! base64 subscription document, persisted, exposed through the HTTP service
//! and optionally pushed to an external collector. Everything beyond the
//! local document is best-effort: collector and metadata failures are logged
//! and swallowed, never propagated.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::discovery::DiscoveredEndpoint;
use crate::error::Result;
use crate::settings::{RuntimePaths, Settings};
use crate::web::SubscriptionState;

const META_PRIMARY_URL: &str = "https://ipapi.co/json/";
const META_FALLBACK_URL: &str = "http://ip-api.com/json/";
const VISIT_REGISTRY_URL: &str = "https://oooo.serv00.net/add-url";

const META_TIMEOUT: Duration = Duration::from_secs(3);

/// vmess node envelope; field order matters because clients compare the
/// encoded form
#[derive(Debug, Serialize)]
struct VmessEnvelope {
    v: String,
    ps: String,
    add: String,
    port: u16,
    id: String,
    aid: String,
    scy: String,
    net: String,
    #[serde(rename = "type")]
    kind: String,
    host: String,
    path: String,
    tls: String,
    sni: String,
    alpn: String,
    fp: String,
}

/// Shared connection parameters for the three node descriptors
#[derive(Debug, Clone)]
pub struct NodeParams<'a> {
    pub domain: &'a str,
    pub uuid: &'a str,
    pub cfip: &'a str,
    pub cfport: u16,
    pub display_name: &'a str,
}

/// Display name: optional configured prefix joined to the ISP label
pub fn display_name(prefix: Option<&str>, isp_label: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}_{}", prefix, isp_label),
        None => isp_label.to_string(),
    }
}

fn vless_uri(p: &NodeParams) -> String {
    format!(
        "vless://{}@{}:{}?encryption=none&security=tls&sni={}&fp=firefox&type=ws&host={}&path=%2Fvless-argo%3Fed%3D2560#{}",
        p.uuid, p.cfip, p.cfport, p.domain, p.domain, p.display_name
    )
}

fn vmess_uri(p: &NodeParams) -> String {
    let envelope = VmessEnvelope {
        v: "2".to_string(),
        ps: p.display_name.to_string(),
        add: p.cfip.to_string(),
        port: p.cfport,
        id: p.uuid.to_string(),
        aid: "0".to_string(),
        scy: "none".to_string(),
        net: "ws".to_string(),
        kind: "none".to_string(),
        host: p.domain.to_string(),
        path: "/vmess-argo?ed=2560".to_string(),
        tls: "tls".to_string(),
        sni: p.domain.to_string(),
        alpn: String::new(),
        fp: "firefox".to_string(),
    };

    // Struct serialization keeps the field order fixed
    let rendered = serde_json::to_string(&envelope).unwrap_or_default();
    format!("vmess://{}", BASE64.encode(rendered))
}

fn trojan_uri(p: &NodeParams) -> String {
    format!(
        "trojan://{}@{}:{}?security=tls&sni={}&fp=firefox&type=ws&host={}&path=%2Ftrojan-argo%3Fed%3D2560#{}",
        p.uuid, p.cfip, p.cfport, p.domain, p.domain, p.display_name
    )
}

/// The three node URIs, in publication order
pub fn node_uris(p: &NodeParams) -> Vec<String> {
    vec![vless_uri(p), vmess_uri(p), trojan_uri(p)]
}

/// Blank-line-separated node block, then base64 for the whole document
pub fn encode_document(uris: &[String]) -> String {
    BASE64.encode(uris.join("\n\n"))
}

/// Keep only lines that are node URIs
fn filter_node_lines(content: &str) -> Vec<String> {
    const SCHEMES: [&str; 5] = ["vless://", "vmess://", "trojan://", "hysteria2://", "tuic://"];
    content
        .lines()
        .filter(|line| SCHEMES.iter().any(|s| line.contains(s)))
        .map(|line| line.to_string())
        .collect()
}

/// Builds, persists and uploads the subscription document
pub struct Publisher {
    client: reqwest::Client,
    settings: Settings,
    paths: RuntimePaths,
    state: SubscriptionState,
}

impl Publisher {
    pub fn new(settings: Settings, paths: RuntimePaths, state: SubscriptionState) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            paths,
            state,
        }
    }

    /// Push previously persisted nodes to the collector's delete endpoint so
    /// a redeploy doesn't leave stale entries behind. Best-effort.
    pub async fn delete_stale_nodes(&self) {
        let Some(upload_url) = &self.settings.upload_url else {
            return;
        };

        let Ok(encoded) = tokio::fs::read_to_string(&self.paths.sub_file).await else {
            return;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return;
        };
        let nodes = filter_node_lines(&String::from_utf8_lossy(&decoded));
        if nodes.is_empty() {
            return;
        }

        let result = self
            .client
            .post(format!("{}/api/delete-nodes", upload_url))
            .json(&json!({ "nodes": nodes }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("Stale nodes removed from collector")
            }
            Ok(response) => warn!("Collector rejected delete-nodes: {}", response.status()),
            Err(e) => warn!("delete-nodes failed: {}", e),
        }
    }

    /// Publish the subscription for a discovered endpoint: build the three
    /// node descriptors, persist and expose the encoded document, then run
    /// the upload mode selected by the configuration.
    pub async fn publish(&self, endpoint: &DiscoveredEndpoint) -> Result<String> {
        let isp_label = self.fetch_isp_label().await;
        let name = display_name(self.settings.name_prefix(), &isp_label);

        let params = NodeParams {
            domain: &endpoint.hostname,
            uuid: &self.settings.uuid,
            cfip: &self.settings.cfip,
            cfport: self.settings.cfport,
            display_name: &name,
        };

        let uris = node_uris(&params);
        let document = encode_document(&uris);

        tokio::fs::write(&self.paths.sub_file, &document).await?;
        tokio::fs::write(&self.paths.list_file, uris.join("\n")).await?;
        *self.state.write() = Some(document.clone());

        info!(
            "Subscription published for {} ({} nodes)",
            endpoint.hostname,
            uris.len()
        );

        self.upload().await;

        Ok(document)
    }

    /// ISP/geo label with primary and fallback metadata sources
    async fn fetch_isp_label(&self) -> String {
        let primary = self
            .client
            .get(META_PRIMARY_URL)
            .timeout(META_TIMEOUT)
            .send()
            .await;
        if let Ok(response) = primary {
            if let Ok(body) = response.text().await {
                if let Some(label) = parse_primary_meta(&body) {
                    return label;
                }
            }
        }

        let fallback = self
            .client
            .get(META_FALLBACK_URL)
            .timeout(META_TIMEOUT)
            .send()
            .await;
        if let Ok(response) = fallback {
            if let Ok(body) = response.text().await {
                if let Some(label) = parse_fallback_meta(&body) {
                    return label;
                }
            }
        }

        "Unknown".to_string()
    }

    /// Run exactly one of the two collector upload modes, or neither
    async fn upload(&self) {
        let Some(upload_url) = &self.settings.upload_url else {
            return;
        };

        if let Some(project_url) = &self.settings.project_url {
            // Subscription-URL mode
            let subscription_url = format!("{}/{}", project_url, self.settings.sub_path);
            let result = self
                .client
                .post(format!("{}/api/add-subscriptions", upload_url))
                .json(&json!({ "subscription": [subscription_url] }))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!("Subscription uploaded to collector")
                }
                Ok(response) => {
                    warn!("Collector rejected add-subscriptions: {}", response.status())
                }
                Err(e) => warn!("add-subscriptions failed: {}", e),
            }
        } else {
            // Raw-node mode
            let Ok(content) = tokio::fs::read_to_string(&self.paths.list_file).await else {
                return;
            };
            let nodes = filter_node_lines(&content);
            if nodes.is_empty() {
                return;
            }

            let result = self
                .client
                .post(format!("{}/api/add-nodes", upload_url))
                .json(&json!({ "nodes": nodes }))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!("Nodes uploaded to collector")
                }
                Ok(response) => warn!("Collector rejected add-nodes: {}", response.status()),
                Err(e) => warn!("add-nodes failed: {}", e),
            }
        }
    }

    /// Register the project URL with the keep-alive visitor. Best-effort.
    pub async fn auto_visit(&self) {
        if !self.settings.auto_access {
            return;
        }
        let Some(project_url) = &self.settings.project_url else {
            info!("No project URL, skipping auto-visit registration");
            return;
        };

        let result = self
            .client
            .post(VISIT_REGISTRY_URL)
            .json(&json!({ "url": project_url }))
            .send()
            .await;

        match result {
            Ok(_) => info!("Auto-visit task registered"),
            Err(e) => warn!("Auto-visit registration failed: {}", e),
        }
    }
}

/// `{country_code}_{org}` from the primary metadata source
fn parse_primary_meta(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let country = value.get("country_code")?.as_str().filter(|s| !s.is_empty())?;
    let org = value.get("org")?.as_str().filter(|s| !s.is_empty())?;
    Some(format!("{}_{}", country, org))
}

/// `{countryCode}_{org}` from the fallback source, which flags success
/// explicitly
fn parse_fallback_meta(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    if value.get("status")?.as_str() != Some("success") {
        return None;
    }
    let country = value.get("countryCode")?.as_str().filter(|s| !s.is_empty())?;
    let org = value.get("org")?.as_str().filter(|s| !s.is_empty())?;
    Some(format!("{}_{}", country, org))
}
