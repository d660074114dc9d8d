//! Node settings
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (optional, any format the config crate understands)
//! 3. Environment variables (ARGONODE_*)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Main node settings: the full externally recognized configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Collector base URL for node/subscription uploads
    pub upload_url: Option<String>,

    /// Public URL under which this deployment is reachable
    pub project_url: Option<String>,

    /// Register the project URL with the keep-alive service
    #[serde(default)]
    pub auto_access: bool,

    /// Scratch directory for generated files and logs
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Path segment under which the subscription document is served
    #[serde(default = "default_sub_path")]
    pub sub_path: String,

    /// Internal HTTP service port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Public proxy port (the single externally exposed listener)
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Client identity UUID shared by all protocol inbounds
    #[serde(default = "default_uuid")]
    pub uuid: String,

    /// Monitoring server address (host or host:port)
    pub nezha_server: Option<String>,

    /// Monitoring server port; presence selects the v0 agent
    pub nezha_port: Option<String>,

    /// Monitoring client secret
    pub nezha_key: Option<String>,

    /// Pre-configured tunnel domain (skips discovery when paired with auth)
    pub argo_domain: Option<String>,

    /// Tunnel credential: opaque token, credential JSON, or absent
    pub argo_auth: Option<String>,

    /// CDN relay address placed in the published node descriptors
    #[serde(default = "default_cfip")]
    pub cfip: String,

    /// CDN relay port
    #[serde(default = "default_cfport")]
    pub cfport: u16,

    /// Display-name prefix for published nodes
    pub name: Option<String>,

    /// External binaries (downloaded/installed out of band)
    #[serde(default)]
    pub binaries: Binaries,

    /// Tunnel-domain discovery tuning
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_sub_path() -> String {
    "sub".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_public_port() -> u16 {
    7860
}

fn default_uuid() -> String {
    "4b3e2bfe-bde1-5def-d035-0cb572bbd046".to_string()
}

fn default_cfip() -> String {
    "cdns.doon.eu.org".to_string()
}

fn default_cfport() -> u16 {
    443
}

/// Paths to the external black-box binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binaries {
    /// Protocol engine (reads the generated routing document)
    #[serde(default = "default_engine_bin")]
    pub engine: PathBuf,

    /// Tunnel client (exposes the public port under a tunnel hostname)
    #[serde(default = "default_tunnel_bin")]
    pub tunnel: PathBuf,

    /// Monitoring agent
    #[serde(default = "default_agent_bin")]
    pub agent: PathBuf,
}

fn default_engine_bin() -> PathBuf {
    PathBuf::from("web")
}

fn default_tunnel_bin() -> PathBuf {
    PathBuf::from("bot")
}

fn default_agent_bin() -> PathBuf {
    PathBuf::from("agent")
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            engine: default_engine_bin(),
            tunnel: default_tunnel_bin(),
            agent: default_agent_bin(),
        }
    }
}

/// Discovery loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Maximum tunnel-client restarts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between killing the tunnel client and relaunching it (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Delay after a (re)launch before scanning the log (seconds)
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    3
}

fn default_settle_secs() -> u64 {
    3
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown_secs(),
            settle_secs: default_settle_secs(),
        }
    }
}

impl Settings {
    /// Load settings from file (if present) and environment
    pub fn load(config_path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let mut builder = config::Config::builder()
            .set_default("auto_access", false)?
            .set_default("work_dir", default_work_dir().to_string_lossy().to_string())?
            .set_default("sub_path", default_sub_path())?
            .set_default("http_port", default_http_port() as i64)?
            .set_default("public_port", default_public_port() as i64)?
            .set_default("uuid", default_uuid())?
            .set_default("cfip", default_cfip())?
            .set_default("cfport", default_cfport() as i64)?;

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ARGONODE")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    /// Validate the loaded settings
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        uuid::Uuid::parse_str(&self.uuid)
            .map_err(|e| anyhow::anyhow!("Invalid identity UUID '{}': {}", self.uuid, e))?;

        if self.sub_path.is_empty() || self.sub_path.contains('/') {
            anyhow::bail!(
                "Subscription path must be a single non-empty segment, got '{}'",
                self.sub_path
            );
        }

        if self.http_port == self.public_port {
            anyhow::bail!(
                "HTTP port and public port must differ (both {})",
                self.http_port
            );
        }

        if self.discovery.max_attempts == 0 {
            anyhow::bail!("discovery.max_attempts must be at least 1");
        }

        Ok(())
    }

    /// Node display-name prefix, if one was configured and non-empty
    pub fn name_prefix(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }

    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::new(&self.work_dir)
    }
}

/// Derived locations of every scratch file, carried explicitly instead of
/// ambient globals.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Scratch directory root
    pub base: PathBuf,
    /// Routing document consumed by the protocol engine
    pub engine_config: PathBuf,
    /// Tunnel client log file scanned by discovery
    pub boot_log: PathBuf,
    /// Persisted base64 subscription document
    pub sub_file: PathBuf,
    /// Plain-text node list used by the add-nodes upload mode
    pub list_file: PathBuf,
    /// Tunnel credential JSON (credential-file mode only)
    pub tunnel_json: PathBuf,
    /// Tunnel ingress descriptor YAML (credential-file mode only)
    pub tunnel_yml: PathBuf,
    /// Monitoring agent YAML config (v1 agent only)
    pub agent_config: PathBuf,
}

impl RuntimePaths {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            engine_config: base.join("config.json"),
            boot_log: base.join("boot.log"),
            sub_file: base.join("sub.txt"),
            list_file: base.join("list.txt"),
            tunnel_json: base.join("tunnel.json"),
            tunnel_yml: base.join("tunnel.yml"),
            agent_config: base.join("config.yaml"),
        }
    }

    /// Ensure the scratch directory exists
    pub fn ensure_base(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)
    }
}
