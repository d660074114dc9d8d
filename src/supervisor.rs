//! External process supervision
//!
//! Launches the protocol engine, tunnel client and monitoring agent as
//! detached black boxes with structured argument vectors (never shell
//! strings). The tunnel client's launch mode is decided once at startup from
//! the credential's shape and carried as a tagged enum; the quick-tunnel
//! variant keeps its child handle so discovery can restart it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::discovery::Relauncher;
use crate::error::{NodeError, Result};
use crate::settings::{RuntimePaths, Settings};

/// Ports on which the monitoring server speaks TLS
const TLS_PORTS: [&str; 6] = ["443", "8443", "2096", "2087", "2083", "2053"];

/// Tunnel launch mode, decided once from the credential value's shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    /// Managed tunnel authenticated by an opaque token
    Token(String),
    /// Managed tunnel authenticated by a credential file; carries the raw
    /// credential JSON and the tunnel identifier extracted from it
    CredentialFile { auth_json: String, tunnel_id: String },
    /// Ephemeral tunnel whose hostname must be discovered from the log
    Quick,
}

/// The relevant slice of the tunnel credential JSON
#[derive(Debug, Deserialize)]
struct TunnelCredential {
    #[serde(rename = "TunnelID")]
    tunnel_id: String,
}

impl TunnelMode {
    /// Classify the configured credential. A long base64-ish token selects
    /// token mode; a structured secret selects credential-file mode; anything
    /// else (including a malformed credential JSON) falls back to a quick
    /// tunnel.
    pub fn detect(argo_auth: Option<&str>) -> Self {
        let Some(auth) = argo_auth.filter(|a| !a.is_empty()) else {
            return TunnelMode::Quick;
        };

        // Token shape: 120-250 chars of [A-Za-z0-9=]
        let token_shape = (120..=250).contains(&auth.len())
            && auth.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'=');
        if token_shape {
            return TunnelMode::Token(auth.to_string());
        }

        if auth.contains("TunnelSecret") {
            match serde_json::from_str::<TunnelCredential>(auth) {
                Ok(cred) => {
                    return TunnelMode::CredentialFile {
                        auth_json: auth.to_string(),
                        tunnel_id: cred.tunnel_id,
                    };
                }
                Err(e) => {
                    warn!("Credential JSON unparseable ({}), using quick tunnel", e);
                    return TunnelMode::Quick;
                }
            }
        }

        TunnelMode::Quick
    }

    /// Whether this mode needs log-driven domain discovery
    pub fn needs_discovery(&self) -> bool {
        matches!(self, TunnelMode::Quick)
    }
}

/// Tunnel ingress descriptor written for credential-file mode
#[derive(Debug, Serialize)]
struct TunnelIngressDoc {
    tunnel: String,
    #[serde(rename = "credentials-file")]
    credentials_file: PathBuf,
    protocol: String,
    ingress: Vec<IngressRule>,
}

#[derive(Debug, Serialize)]
struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    service: String,
    #[serde(rename = "originRequest", skip_serializing_if = "Option::is_none")]
    origin_request: Option<OriginRequest>,
}

#[derive(Debug, Serialize)]
struct OriginRequest {
    #[serde(rename = "noTLSVerify")]
    no_tls_verify: bool,
}

/// Monitoring agent YAML config (v1 agent)
#[derive(Debug, Serialize)]
struct AgentConfigDoc {
    client_secret: String,
    debug: bool,
    disable_auto_update: bool,
    disable_command_execute: bool,
    disable_force_update: bool,
    disable_nat: bool,
    disable_send_query: bool,
    gpu: bool,
    insecure_tls: bool,
    ip_report_period: u32,
    report_delay: u32,
    server: String,
    skip_connection_count: bool,
    skip_procs_count: bool,
    temperature: bool,
    tls: bool,
    use_gitee_to_upgrade: bool,
    use_ipv6_country_code: bool,
    uuid: String,
}

/// Launches and tracks the external binaries
pub struct Supervisor {
    settings: Settings,
    paths: RuntimePaths,
}

impl Supervisor {
    pub fn new(settings: Settings, paths: RuntimePaths) -> Self {
        Self { settings, paths }
    }

    /// Launch the protocol engine against the generated routing document
    pub fn launch_engine(&self) -> Result<Child> {
        let config = self.paths.engine_config.to_string_lossy().to_string();
        let child = spawn_detached(&self.settings.binaries.engine, &["-c", &config])?;
        info!("Protocol engine running");
        Ok(child)
    }

    /// Launch the monitoring agent if the server and key are configured.
    /// Returns `None` when monitoring is disabled; spawn failures are logged
    /// and swallowed (monitoring is best-effort).
    pub async fn launch_agent(&self) -> Option<Child> {
        let (server, key) = match (&self.settings.nezha_server, &self.settings.nezha_key) {
            (Some(server), Some(key)) if !server.is_empty() && !key.is_empty() => (server, key),
            _ => {
                info!("Monitoring not configured, skipping agent");
                return None;
            }
        };

        let result = match &self.settings.nezha_port {
            Some(port) if !port.is_empty() => {
                let mut args = vec![
                    "-s".to_string(),
                    format!("{}:{}", server, port),
                    "-p".to_string(),
                    key.clone(),
                ];
                if TLS_PORTS.contains(&port.as_str()) {
                    args.push("--tls".to_string());
                }
                args.extend(
                    [
                        "--disable-auto-update",
                        "--report-delay",
                        "4",
                        "--skip-conn",
                        "--skip-procs",
                    ]
                    .map(String::from),
                );
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                spawn_detached(&self.settings.binaries.agent, &args)
            }
            _ => {
                // v1 agent: config file instead of flags
                let doc = agent_config_doc(server, key, &self.settings.uuid);
                match serde_yaml::to_string(&doc) {
                    Ok(yaml) => {
                        if let Err(e) = tokio::fs::write(&self.paths.agent_config, yaml).await {
                            warn!("Failed to write agent config: {}", e);
                            return None;
                        }
                        let config = self.paths.agent_config.to_string_lossy().to_string();
                        spawn_detached(&self.settings.binaries.agent, &["-c", &config])
                    }
                    Err(e) => {
                        warn!("Failed to render agent config: {}", e);
                        return None;
                    }
                }
            }
        };

        match result {
            Ok(child) => {
                info!("Monitoring agent running");
                Some(child)
            }
            Err(e) => {
                warn!("Monitoring agent failed to start: {}", e);
                None
            }
        }
    }

    /// Write the credential JSON and ingress YAML for credential-file mode
    pub async fn write_tunnel_files(&self, auth_json: &str, tunnel_id: &str) -> Result<()> {
        tokio::fs::write(&self.paths.tunnel_json, auth_json).await?;

        let doc = TunnelIngressDoc {
            tunnel: tunnel_id.to_string(),
            credentials_file: self.paths.tunnel_json.clone(),
            protocol: "http2".to_string(),
            ingress: vec![
                IngressRule {
                    hostname: self.settings.argo_domain.clone(),
                    service: format!("http://localhost:{}", self.settings.public_port),
                    origin_request: Some(OriginRequest {
                        no_tls_verify: true,
                    }),
                },
                IngressRule {
                    hostname: None,
                    service: "http_status:404".to_string(),
                    origin_request: None,
                },
            ],
        };

        let yaml = serde_yaml::to_string(&doc)
            .map_err(|e| NodeError::Configuration(format!("Tunnel YAML render failed: {}", e)))?;
        tokio::fs::write(&self.paths.tunnel_yml, yaml).await?;

        info!("Tunnel ingress configuration written");
        Ok(())
    }

    /// Launch the tunnel client in the given mode. Always returns a handle
    /// that discovery can restart; a failed spawn is logged and retried on
    /// the next relaunch.
    pub fn launch_tunnel(&self, mode: &TunnelMode) -> QuickTunnel {
        let args = self.tunnel_args(mode);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let child = match spawn_detached(&self.settings.binaries.tunnel, &arg_refs) {
            Ok(child) => {
                info!("Tunnel client running");
                Some(child)
            }
            Err(e) => {
                warn!("Tunnel client failed to start: {}", e);
                None
            }
        };

        QuickTunnel {
            binary: self.settings.binaries.tunnel.clone(),
            args,
            child,
        }
    }

    /// Argument vector for each tunnel mode
    fn tunnel_args(&self, mode: &TunnelMode) -> Vec<String> {
        match mode {
            TunnelMode::Token(token) => vec![
                "tunnel".into(),
                "--edge-ip-version".into(),
                "auto".into(),
                "--no-autoupdate".into(),
                "--protocol".into(),
                "http2".into(),
                "run".into(),
                "--token".into(),
                token.clone(),
            ],
            TunnelMode::CredentialFile { .. } => vec![
                "tunnel".into(),
                "--edge-ip-version".into(),
                "auto".into(),
                "--config".into(),
                self.paths.tunnel_yml.to_string_lossy().into_owned(),
                "run".into(),
            ],
            TunnelMode::Quick => quick_tunnel_args(&self.paths.boot_log, self.settings.public_port),
        }
    }
}

/// Discovery-producing argument vector for the ephemeral tunnel
fn quick_tunnel_args(boot_log: &Path, public_port: u16) -> Vec<String> {
    vec![
        "tunnel".into(),
        "--edge-ip-version".into(),
        "auto".into(),
        "--no-autoupdate".into(),
        "--protocol".into(),
        "http2".into(),
        "--logfile".into(),
        boot_log.to_string_lossy().into_owned(),
        "--loglevel".into(),
        "info".into(),
        "--url".into(),
        format!("http://localhost:{}", public_port),
    ]
}

fn agent_config_doc(server: &str, key: &str, uuid: &str) -> AgentConfigDoc {
    // TLS is inferred from the server's port
    let port = server.rsplit(':').next().filter(|_| server.contains(':'));
    let tls = port.is_some_and(|p| TLS_PORTS.contains(&p));

    AgentConfigDoc {
        client_secret: key.to_string(),
        debug: false,
        disable_auto_update: true,
        disable_command_execute: false,
        disable_force_update: true,
        disable_nat: false,
        disable_send_query: false,
        gpu: false,
        insecure_tls: true,
        ip_report_period: 1800,
        report_delay: 4,
        server: server.to_string(),
        skip_connection_count: true,
        skip_procs_count: true,
        temperature: false,
        tls,
        use_gitee_to_upgrade: false,
        use_ipv6_country_code: false,
        uuid: uuid.to_string(),
    }
}

/// Spawn a black-box binary detached, output discarded
fn spawn_detached(binary: &Path, args: &[&str]) -> Result<Child> {
    Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| NodeError::Launch {
            binary: binary.to_path_buf(),
            source,
        })
}

/// A running (or restartable) ephemeral tunnel client
pub struct QuickTunnel {
    binary: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
}

#[async_trait]
impl Relauncher for QuickTunnel {
    async fn relaunch(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            // Already-exited children make kill a no-op
            let _ = child.kill().await;
        }

        let arg_refs: Vec<&str> = self.args.iter().map(String::as_str).collect();
        self.child = Some(spawn_detached(&self.binary, &arg_refs)?);
        info!("Tunnel client relaunched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Binaries, DiscoverySettings};

    fn test_settings() -> Settings {
        Settings {
            upload_url: None,
            project_url: None,
            auto_access: false,
            work_dir: std::env::temp_dir().join("argonode-supervisor-test"),
            sub_path: "sub".to_string(),
            http_port: 3000,
            public_port: 7860,
            uuid: "4b3e2bfe-bde1-5def-d035-0cb572bbd046".to_string(),
            nezha_server: None,
            nezha_port: None,
            nezha_key: None,
            argo_domain: None,
            argo_auth: None,
            cfip: "cdns.doon.eu.org".to_string(),
            cfport: 443,
            name: None,
            binaries: Binaries {
                engine: PathBuf::from("/nonexistent/argonode-test-engine"),
                tunnel: PathBuf::from("/nonexistent/argonode-test-tunnel"),
                agent: PathBuf::from("/nonexistent/argonode-test-agent"),
            },
            discovery: DiscoverySettings::default(),
        }
    }

    #[tokio::test]
    async fn test_missing_engine_binary_yields_launch_error() {
        let settings = test_settings();
        let supervisor = Supervisor::new(settings.clone(), settings.paths());
        assert!(matches!(
            supervisor.launch_engine(),
            Err(NodeError::Launch { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_tunnel_binary_still_yields_restartable_handle() {
        let settings = test_settings();
        let supervisor = Supervisor::new(settings.clone(), settings.paths());

        // The failed spawn is logged, not returned; the handle still carries
        // the arguments so discovery keeps retrying.
        let mut handle = supervisor.launch_tunnel(&TunnelMode::Quick);
        assert!(matches!(
            handle.relaunch().await,
            Err(NodeError::Launch { .. })
        ));
    }

    #[test]
    fn test_mode_detect_quick_when_unset() {
        assert_eq!(TunnelMode::detect(None), TunnelMode::Quick);
        assert_eq!(TunnelMode::detect(Some("")), TunnelMode::Quick);
        assert_eq!(TunnelMode::detect(Some("short-value")), TunnelMode::Quick);
    }

    #[test]
    fn test_mode_detect_token() {
        let token = "e".repeat(150);
        assert_eq!(
            TunnelMode::detect(Some(&token)),
            TunnelMode::Token(token.clone())
        );

        // Below the minimum token length
        let short = "e".repeat(119);
        assert_eq!(TunnelMode::detect(Some(&short)), TunnelMode::Quick);

        // Characters outside the token alphabet
        let invalid = format!("{}!", "e".repeat(150));
        assert_eq!(TunnelMode::detect(Some(&invalid)), TunnelMode::Quick);
    }

    #[test]
    fn test_mode_detect_credential_file() {
        let auth = r#"{"AccountTag":"t","TunnelSecret":"s","TunnelID":"abc-123"}"#;
        match TunnelMode::detect(Some(auth)) {
            TunnelMode::CredentialFile {
                auth_json,
                tunnel_id,
            } => {
                assert_eq!(auth_json, auth);
                assert_eq!(tunnel_id, "abc-123");
            }
            other => panic!("expected credential-file mode, got {:?}", other),
        }
    }

    #[test]
    fn test_mode_detect_malformed_credential_falls_back() {
        let auth = "TunnelSecret but not json";
        assert_eq!(TunnelMode::detect(Some(auth)), TunnelMode::Quick);
    }

    #[test]
    fn test_only_quick_mode_needs_discovery() {
        assert!(TunnelMode::Quick.needs_discovery());
        assert!(!TunnelMode::Token("t".into()).needs_discovery());
        assert!(!TunnelMode::CredentialFile {
            auth_json: "{}".into(),
            tunnel_id: "id".into()
        }
        .needs_discovery());
    }

    #[test]
    fn test_quick_tunnel_args() {
        let args = quick_tunnel_args(Path::new("/tmp/node/boot.log"), 7860);
        assert_eq!(
            args,
            vec![
                "tunnel",
                "--edge-ip-version",
                "auto",
                "--no-autoupdate",
                "--protocol",
                "http2",
                "--logfile",
                "/tmp/node/boot.log",
                "--loglevel",
                "info",
                "--url",
                "http://localhost:7860",
            ]
        );
    }

    #[test]
    fn test_ingress_doc_yaml_shape() {
        let doc = TunnelIngressDoc {
            tunnel: "abc-123".to_string(),
            credentials_file: PathBuf::from("/tmp/node/tunnel.json"),
            protocol: "http2".to_string(),
            ingress: vec![
                IngressRule {
                    hostname: Some("node.example.com".to_string()),
                    service: "http://localhost:7860".to_string(),
                    origin_request: Some(OriginRequest {
                        no_tls_verify: true,
                    }),
                },
                IngressRule {
                    hostname: None,
                    service: "http_status:404".to_string(),
                    origin_request: None,
                },
            ],
        };

        let yaml = serde_yaml::to_string(&doc).unwrap();
        assert!(yaml.contains("tunnel: abc-123"));
        assert!(yaml.contains("credentials-file: /tmp/node/tunnel.json"));
        assert!(yaml.contains("hostname: node.example.com"));
        assert!(yaml.contains("noTLSVerify: true"));
        assert!(yaml.contains("http_status:404"));
        // The fallback rule carries no hostname
        assert_eq!(yaml.matches("hostname:").count(), 1);
    }

    #[test]
    fn test_agent_tls_inference() {
        assert!(agent_config_doc("nezha.example.com:443", "k", "u").tls);
        assert!(agent_config_doc("nezha.example.com:8443", "k", "u").tls);
        assert!(!agent_config_doc("nezha.example.com:5555", "k", "u").tls);
        assert!(!agent_config_doc("nezha.example.com", "k", "u").tls);
    }

    #[test]
    fn test_agent_config_yaml_fields() {
        let yaml =
            serde_yaml::to_string(&agent_config_doc("n.example.com:443", "secret", "uuid-1"))
                .unwrap();
        assert!(yaml.contains("client_secret: secret"));
        assert!(yaml.contains("server: n.example.com:443"));
        assert!(yaml.contains("uuid: uuid-1"));
        assert!(yaml.contains("tls: true"));
        assert!(yaml.contains("insecure_tls: true"));
        assert!(yaml.contains("ip_report_period: 1800"));
    }
}
