//! Network parameter resolution
//!
//! Derives a complete WARP parameter set (private key, interface address,
//! reserved bytes, peer endpoint) from remote parameter sources with
//! field-level fallback to built-in defaults. Resolution never fails: with no
//! network access the defaults keep the node minimally functional.

use tracing::{info, warn};

use crate::fetch::{FetchOptions, Fetcher};

/// Ordered parameter sources, tried until one returns marker-matched text
const WARP_SOURCES: [&str; 2] = [
    "https://ygkkk-warp.renky.eu.org",
    "http://ygkkk-warp.renky.eu.org",
];

/// Marker token a genuine parameter response must contain
const SOURCE_MARKER: &str = "ygkkk";

const LABEL_PRIVATE_KEY: &str = "Private_key私钥：";
const LABEL_IPV6: &str = "IPV6地址：";
const LABEL_RESERVED: &str = "reserved值：";

const DEFAULT_PRIVATE_KEY: &str = "52cuYFgCJXp0LAq7+nWJIbCXXgU9eGggOc+Hlfz5u6A=";
const DEFAULT_IPV6: &str = "2606:4700:110:8d8d:1845:c39f:2dd5:a03a";
const DEFAULT_RESERVED: &str = "[215, 69, 233]";

/// Peer endpoint literals, selected by IPv6 availability
const ENDPOINT_IPV4: &str = "162.159.192.1";
const ENDPOINT_IPV6: &str = "[2606:4700:d0::a29f:c001]";

const IPV4_ECHO_URL: &str = "https://icanhazip.com";
const IPV6_ECHO_URL: &str = "https://api64.ipify.org";

/// Complete, internally consistent parameter set. Produced once per startup
/// and immutable afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParameters {
    /// WireGuard private key
    pub private_key: String,
    /// Interface IPv6 address (without prefix length)
    pub ipv6_address: String,
    /// Raw reserved-bytes text, validated at config generation time
    pub reserved: String,
    /// Selected peer endpoint literal
    pub endpoint: String,
    /// Public IPv4 address, if detected
    pub ipv4_detected: Option<String>,
    /// Public IPv6 address, if detected
    pub ipv6_detected: Option<String>,
}

/// Fields extracted from one parameter source; any of them may be missing
#[derive(Debug, Default, PartialEq, Eq)]
struct SourceFields {
    private_key: Option<String>,
    ipv6_address: Option<String>,
    reserved: Option<String>,
}

/// Resolves network parameters from remote sources with built-in defaults
pub struct WarpResolver {
    fetcher: Fetcher,
}

impl WarpResolver {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    /// Resolve the full parameter set. Degrades to defaults per field; never
    /// fails outright.
    pub async fn resolve(&self) -> NetworkParameters {
        let fields = self.fetch_source_fields().await;

        let (ipv4, ipv6) = self.detect_addresses().await;
        let endpoint = if ipv6.is_some() {
            ENDPOINT_IPV6
        } else {
            ENDPOINT_IPV4
        };

        let params = NetworkParameters {
            private_key: fields
                .private_key
                .unwrap_or_else(|| DEFAULT_PRIVATE_KEY.to_string()),
            ipv6_address: fields
                .ipv6_address
                .unwrap_or_else(|| DEFAULT_IPV6.to_string()),
            reserved: fields
                .reserved
                .unwrap_or_else(|| DEFAULT_RESERVED.to_string()),
            endpoint: endpoint.to_string(),
            ipv4_detected: ipv4,
            ipv6_detected: ipv6,
        };

        info!(
            "Resolved network parameters (endpoint {}, ipv4 {}, ipv6 {})",
            params.endpoint,
            params.ipv4_detected.as_deref().unwrap_or("none"),
            params.ipv6_detected.as_deref().unwrap_or("none"),
        );

        params
    }

    /// Try each source in order; the first marker-matched response wins.
    async fn fetch_source_fields(&self) -> SourceFields {
        for source in WARP_SOURCES {
            let body = self.fetcher.fetch(source, &FetchOptions::default()).await;
            if body.contains(SOURCE_MARKER) {
                info!("Using parameter source {}", source);
                return parse_source(&body);
            }
        }

        warn!("All parameter sources failed, falling back to defaults");
        SourceFields::default()
    }

    /// Probe the public IPv4/IPv6 addresses via the echo services
    async fn detect_addresses(&self) -> (Option<String>, Option<String>) {
        let options = FetchOptions::probe();

        let v4 = self.fetcher.fetch(IPV4_ECHO_URL, &options).await;
        let v4 = Some(v4).filter(|s| is_ipv4(s));

        let v6 = self.fetcher.fetch(IPV6_ECHO_URL, &options).await;
        let v6 = Some(v6).filter(|s| is_ipv6(s));

        (v4, v6)
    }
}

/// Extract the labeled fields from a marker-matched source body. Fields that
/// fail to parse stay `None` so the caller can fall back per field.
fn parse_source(body: &str) -> SourceFields {
    SourceFields {
        private_key: extract_labeled(body, LABEL_PRIVATE_KEY),
        ipv6_address: extract_labeled(body, LABEL_IPV6),
        reserved: extract_labeled(body, LABEL_RESERVED),
    }
}

/// Find a `Label：value` line and return the trimmed value
fn extract_labeled(body: &str, label: &str) -> Option<String> {
    for line in body.lines() {
        if let Some(rest) = line.split_once(label).map(|(_, rest)| rest) {
            let value = rest.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn is_ipv4(s: &str) -> bool {
    s.parse::<std::net::Ipv4Addr>().is_ok()
}

/// The echo service answers over whichever family it reached us on, so a
/// dotted-quad response means no IPv6 connectivity.
fn is_ipv6(s: &str) -> bool {
    s.contains(':') && !is_ipv4(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_BODY: &str = "ygkkk warp generator\n\
        Private_key私钥：abc123key=\n\
        IPV6地址：2606:4700:1234::1\n\
        reserved值：[1, 2, 3]\n";

    #[test]
    fn test_parse_full_source() {
        let fields = parse_source(FULL_BODY);
        assert_eq!(fields.private_key.as_deref(), Some("abc123key="));
        assert_eq!(fields.ipv6_address.as_deref(), Some("2606:4700:1234::1"));
        assert_eq!(fields.reserved.as_deref(), Some("[1, 2, 3]"));
    }

    #[test]
    fn test_partial_fallback_is_field_level() {
        // Source carries two of three fields; the third stays None and the
        // resolver substitutes only that default.
        let body = "ygkkk\nPrivate_key私钥：fromsource=\nIPV6地址：2606::1\n";
        let fields = parse_source(body);
        assert_eq!(fields.private_key.as_deref(), Some("fromsource="));
        assert_eq!(fields.ipv6_address.as_deref(), Some("2606::1"));
        assert_eq!(fields.reserved, None);

        let reserved = fields
            .reserved
            .unwrap_or_else(|| DEFAULT_RESERVED.to_string());
        assert_eq!(reserved, DEFAULT_RESERVED);
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let body = "ygkkk\nPrivate_key私钥：   \n";
        let fields = parse_source(body);
        assert_eq!(fields.private_key, None);
    }

    #[test]
    fn test_ipv4_validation() {
        assert!(is_ipv4("203.0.113.9"));
        assert!(!is_ipv4("not an ip"));
        assert!(!is_ipv4("2606:4700::1"));
    }

    #[test]
    fn test_ipv6_validation() {
        assert!(is_ipv6("2606:4700::1"));
        // A dotted quad is not IPv6 even though the echo answered
        assert!(!is_ipv6("203.0.113.9"));
        assert!(!is_ipv6("plain text"));
    }

    #[test]
    fn test_defaults_mirror_source_shape() {
        // The reserved default must itself pass the generator's 3-element check
        let parsed: Vec<u8> = serde_json::from_str(DEFAULT_RESERVED).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(DEFAULT_IPV6.contains(':'));
    }
}
