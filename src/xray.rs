//! Routing document generation for the protocol engine
//!
//! Renders the resolved network parameters into the engine's JSON config:
//! five inbounds (one public multiplexer plus four loopback listeners), the
//! direct/wireguard/blackhole outbounds, and the full-tunnel routing rules.
//! The document is written whole (temp file + rename) so the engine never
//! observes a half-written config.

use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use crate::error::{NodeError, Result};
use crate::warp::NetworkParameters;

/// Engine inbound ports. Fixed: they are part of the generated document's
/// contract with the engine binary and the reverse-proxy route table.
pub const ENGINE_PORT: u16 = 3001;
const PLAIN_PORT: u16 = 3002;
const VLESS_WS_PORT: u16 = 3003;
const VMESS_WS_PORT: u16 = 3004;
const TROJAN_WS_PORT: u16 = 3005;

/// WireGuard peer port used by all WARP endpoints
const WARP_PEER_PORT: u16 = 2408;

/// WARP peer public key (fixed for all WARP accounts)
const WARP_PEER_KEY: &str = "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=";

/// Build the routing document. Deterministic: identical inputs produce a
/// byte-identical document.
pub fn generate(params: &NetworkParameters, uuid: &str) -> Result<Value> {
    let reserved = parse_reserved(&params.reserved)?;

    let config = json!({
        "log": {
            "access": "/dev/null",
            "error": "/dev/null",
            "loglevel": "none"
        },
        "dns": {
            "servers": [
                "https+local://8.8.8.8/dns-query",
                "https+local://1.1.1.1/dns-query",
                "8.8.8.8",
                "1.1.1.1"
            ],
            "queryStrategy": "UseIP",
            "disableCache": false
        },
        "inbounds": [
            {
                "port": ENGINE_PORT,
                "protocol": "vless",
                "settings": {
                    "clients": [{ "id": uuid, "flow": "xtls-rprx-vision" }],
                    "decryption": "none",
                    "fallbacks": [
                        { "dest": PLAIN_PORT },
                        { "path": "/vless-argo", "dest": VLESS_WS_PORT },
                        { "path": "/vmess-argo", "dest": VMESS_WS_PORT },
                        { "path": "/trojan-argo", "dest": TROJAN_WS_PORT }
                    ]
                },
                "streamSettings": { "network": "tcp" }
            },
            {
                "port": PLAIN_PORT,
                "listen": "127.0.0.1",
                "protocol": "vless",
                "settings": {
                    "clients": [{ "id": uuid }],
                    "decryption": "none"
                },
                "streamSettings": { "network": "tcp", "security": "none" }
            },
            {
                "port": VLESS_WS_PORT,
                "listen": "127.0.0.1",
                "protocol": "vless",
                "settings": {
                    "clients": [{ "id": uuid, "level": 0 }],
                    "decryption": "none"
                },
                "streamSettings": {
                    "network": "ws",
                    "security": "none",
                    "wsSettings": { "path": "/vless-argo" }
                },
                "sniffing": {
                    "enabled": true,
                    "destOverride": ["http", "tls", "quic"],
                    "metadataOnly": false
                }
            },
            {
                "port": VMESS_WS_PORT,
                "listen": "127.0.0.1",
                "protocol": "vmess",
                "settings": {
                    "clients": [{ "id": uuid, "alterId": 0 }]
                },
                "streamSettings": {
                    "network": "ws",
                    "wsSettings": { "path": "/vmess-argo" }
                },
                "sniffing": {
                    "enabled": true,
                    "destOverride": ["http", "tls", "quic"],
                    "metadataOnly": false
                }
            },
            {
                "port": TROJAN_WS_PORT,
                "listen": "127.0.0.1",
                "protocol": "trojan",
                "settings": {
                    "clients": [{ "password": uuid }]
                },
                "streamSettings": {
                    "network": "ws",
                    "security": "none",
                    "wsSettings": { "path": "/trojan-argo" }
                },
                "sniffing": {
                    "enabled": true,
                    "destOverride": ["http", "tls", "quic"],
                    "metadataOnly": false
                }
            }
        ],
        "outbounds": [
            {
                "protocol": "freedom",
                "tag": "direct",
                "settings": { "domainStrategy": "ForceIPv6v4" }
            },
            {
                "tag": "x-warp-out",
                "protocol": "wireguard",
                "settings": {
                    "secretKey": params.private_key,
                    "address": [
                        "172.16.0.2/32",
                        format!("{}/128", params.ipv6_address)
                    ],
                    "peers": [
                        {
                            "publicKey": WARP_PEER_KEY,
                            "allowedIPs": ["0.0.0.0/0", "::/0"],
                            "endpoint": format!("{}:{}", params.endpoint, WARP_PEER_PORT)
                        }
                    ],
                    "reserved": reserved
                }
            },
            {
                "tag": "warp-out",
                "protocol": "freedom",
                "settings": { "domainStrategy": "ForceIPv6v4" },
                "proxySettings": { "tag": "x-warp-out" }
            },
            {
                "protocol": "blackhole",
                "tag": "block"
            }
        ],
        "routing": {
            "domainStrategy": "IPIfNonMatch",
            // Two ordered rules, both pointing at the tunnel-backed outbound.
            // The explicit allow-list rule is redundant on purpose: the policy
            // is all-traffic-via-tunnel, and the catch-all backstops it.
            "rules": [
                {
                    "type": "field",
                    "ip": ["::/0", "0.0.0.0/0"],
                    "network": "tcp,udp",
                    "outboundTag": "warp-out"
                },
                {
                    "type": "field",
                    "network": "tcp,udp",
                    "outboundTag": "warp-out"
                }
            ]
        }
    });

    Ok(config)
}

/// Write the document in one whole-file swap
pub async fn write(path: &Path, config: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config)
        .map_err(|e| NodeError::Configuration(format!("Failed to render config: {}", e)))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, rendered.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;

    info!("Routing document written to {}", path.display());
    Ok(())
}

/// Parse the raw reserved-bytes text into the 3-element sequence the
/// wireguard outbound requires
fn parse_reserved(raw: &str) -> Result<Vec<u8>> {
    let parsed: Vec<u8> = serde_json::from_str(raw)
        .map_err(|_| NodeError::InvalidReserved(raw.to_string()))?;

    if parsed.len() != 3 {
        return Err(NodeError::InvalidReserved(raw.to_string()));
    }

    Ok(parsed)
}
