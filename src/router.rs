//! Path-based reverse proxy
//!
//! The single public port fans out to the protocol engine's inbound port or
//! the internal HTTP service based on the request path. The router is a pure
//! byte relay: it peeks at the first request head to pick a backend, then
//! forwards the connection transparently in both directions, so WebSocket
//! upgrades and streaming bodies pass through untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::shutdown::ShutdownSignal;

/// Path prefixes that select the engine backend
const UPGRADE_PREFIXES: [&str; 3] = ["/vless-argo", "/vmess-argo", "/trojan-argo"];

/// Bare protocol paths that also select the engine backend (exact match)
const BARE_PATHS: [&str; 3] = ["/vless", "/vmess", "/trojan"];

/// Stateless route table: protocol-upgrade paths go to the engine, everything
/// else to the internal HTTP service.
#[derive(Debug, Clone, Copy)]
pub struct ProxyRoutes {
    /// The engine's public inbound port
    pub engine_port: u16,
    /// The internal HTTP service port
    pub default_port: u16,
}

impl ProxyRoutes {
    /// Classify a request path to its backend port
    pub fn classify(&self, path: &str) -> u16 {
        let is_engine = UPGRADE_PREFIXES.iter().any(|p| path.starts_with(p))
            || BARE_PATHS.iter().any(|p| path == *p);

        if is_engine {
            self.engine_port
        } else {
            self.default_port
        }
    }
}

/// Public traffic listener
pub struct PathRouter {
    listener: TcpListener,
    routes: ProxyRoutes,
    shutdown: ShutdownSignal,
}

impl PathRouter {
    /// Bind the public port
    pub fn bind(
        bind_addr: SocketAddr,
        routes: ProxyRoutes,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<Self> {
        let listener = std::net::TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;

        Ok(Self {
            listener,
            routes,
            shutdown,
        })
    }

    /// Actual bound address (for ephemeral-port binds)
    #[allow(dead_code)]
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            "Reverse proxy listening on {} (engine :{}, http :{})",
            self.listener.local_addr()?,
            self.routes.engine_port,
            self.routes.default_port
        );

        let routes = Arc::new(self.routes);
        let mut shutdown = self.shutdown;

        loop {
            let (stream, addr) = tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok(r) => r,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("Reverse proxy shutting down");
                    break;
                }
            };

            let routes = routes.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, &routes).await {
                    debug!("Connection from {} ended: {}", addr, e);
                }
            });
        }

        Ok(())
    }
}

/// Handle a single public connection: classify by the first request head,
/// then relay bytes both ways until either side closes.
async fn handle_connection(
    mut stream: TcpStream,
    source_addr: SocketAddr,
    routes: &ProxyRoutes,
) -> anyhow::Result<()> {
    let mut peek_buf = [0u8; 4096];
    let n = stream.peek(&mut peek_buf).await?;
    if n == 0 {
        return Err(anyhow::anyhow!("Empty connection"));
    }

    let path = extract_http_path(&peek_buf[..n]).unwrap_or_default();
    let target_port = routes.classify(&path);

    if is_websocket_upgrade(&peek_buf[..n]) {
        debug!("WebSocket upgrade on {} from {}", path, source_addr);
    }

    let mut backend = match TcpStream::connect(("127.0.0.1", target_port)).await {
        Ok(backend) => backend,
        Err(e) => {
            // Transparent relay: no retry, no buffering. Backend liveness is
            // the supervisor's concern.
            let response = "HTTP/1.1 502 Bad Gateway\r\n\r\nBackend unavailable\n";
            let _ = stream.write_all(response.as_bytes()).await;
            return Err(anyhow::anyhow!(
                "Backend 127.0.0.1:{} unreachable: {}",
                target_port,
                e
            ));
        }
    };

    debug!("{} {} -> 127.0.0.1:{}", source_addr, path, target_port);

    // The peeked bytes are still in the socket, so the full request is
    // forwarded as-is.
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut backend).await;

    Ok(())
}

/// Extract the request path from an HTTP request head
fn extract_http_path(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let first_line = text.lines().next()?;
    let mut parts = first_line.split_whitespace();
    parts.next(); // Skip method
    parts.next().map(|s| s.to_string())
}

/// Check if the request is a WebSocket upgrade request
fn is_websocket_upgrade(data: &[u8]) -> bool {
    let text = match std::str::from_utf8(data) {
        Ok(t) => t.to_lowercase(),
        Err(_) => return false,
    };

    let has_upgrade = text
        .lines()
        .any(|line| line.starts_with("upgrade:") && line.contains("websocket"));
    let has_connection_upgrade = text
        .lines()
        .any(|line| line.starts_with("connection:") && line.contains("upgrade"));

    has_upgrade && has_connection_upgrade
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn routes() -> ProxyRoutes {
        ProxyRoutes {
            engine_port: 3001,
            default_port: 3000,
        }
    }

    #[test]
    fn test_classify_upgrade_prefixes() {
        let r = routes();
        assert_eq!(r.classify("/vless-argo"), 3001);
        assert_eq!(r.classify("/vless-argo/x"), 3001);
        assert_eq!(r.classify("/vmess-argo?ed=2560"), 3001);
        assert_eq!(r.classify("/trojan-argo"), 3001);
    }

    #[test]
    fn test_classify_bare_paths_exact_only() {
        let r = routes();
        assert_eq!(r.classify("/vless"), 3001);
        assert_eq!(r.classify("/vmess"), 3001);
        assert_eq!(r.classify("/trojan"), 3001);
        // Prefix matching applies only to the -argo variants
        assert_eq!(r.classify("/vlessx"), 3000);
        assert_eq!(r.classify("/vless/extra"), 3000);
    }

    #[test]
    fn test_classify_default_route() {
        let r = routes();
        assert_eq!(r.classify("/"), 3000);
        assert_eq!(r.classify("/anything-else"), 3000);
        assert_eq!(r.classify("/sub"), 3000);
        assert_eq!(r.classify(""), 3000);
    }

    #[test]
    fn test_extract_http_path() {
        assert_eq!(
            extract_http_path(b"GET /vless-argo/x HTTP/1.1\r\nHost: a\r\n\r\n"),
            Some("/vless-argo/x".to_string())
        );
        assert_eq!(extract_http_path(b"garbage"), None);
    }

    #[test]
    fn test_websocket_detection() {
        let ws = b"GET /vmess-argo HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(is_websocket_upgrade(ws));

        let plain = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(!is_websocket_upgrade(plain));
    }

    /// Backend that answers every connection with a fixed body
    async fn spawn_backend(reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        reply.len(),
                        reply
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    async fn request_via(router_addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(router_addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn test_forwarding_by_path() {
        let engine_port = spawn_backend("engine").await;
        let default_port = spawn_backend("default").await;

        let (_tx, shutdown) = ShutdownSignal::new();
        let router = PathRouter::bind(
            "127.0.0.1:0".parse().unwrap(),
            ProxyRoutes {
                engine_port,
                default_port,
            },
            shutdown,
        )
        .unwrap();
        let addr = router.local_addr().unwrap();
        tokio::spawn(router.run());

        let response = request_via(addr, "/vless-argo/x").await;
        assert!(response.ends_with("engine"), "got: {}", response);

        let response = request_via(addr, "/anything-else").await;
        assert!(response.ends_with("default"), "got: {}", response);
    }

    /// Backend that completes a WebSocket-style upgrade handshake and then
    /// echoes whatever the peer streams after it
    async fn spawn_upgrade_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]).to_lowercase();
                    if head.contains("upgrade: websocket") && head.contains("connection: upgrade")
                    {
                        let _ = stream
                            .write_all(
                                b"HTTP/1.1 101 Switching Protocols\r\n\
                                  Upgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                            )
                            .await;
                        let n = stream.read(&mut buf).await.unwrap_or(0);
                        let mut reply = b"echo:".to_vec();
                        reply.extend_from_slice(&buf[..n]);
                        let _ = stream.write_all(&reply).await;
                    } else {
                        let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_websocket_upgrade_forwarded_as_upgrade() {
        let engine_port = spawn_upgrade_backend().await;
        let default_port = spawn_backend("default").await;

        let (_tx, shutdown) = ShutdownSignal::new();
        let router = PathRouter::bind(
            "127.0.0.1:0".parse().unwrap(),
            ProxyRoutes {
                engine_port,
                default_port,
            },
            shutdown,
        )
        .unwrap();
        let addr = router.local_addr().unwrap();
        tokio::spawn(router.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /vmess-argo?ed=2560 HTTP/1.1\r\nHost: test\r\n\
                  Upgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGVzdA==\r\n\r\n",
            )
            .await
            .unwrap();

        // The backend only answers 101 when the upgrade headers arrive intact
        let mut head = [0u8; 256];
        let n = stream.read(&mut head).await.unwrap();
        let head = String::from_utf8_lossy(&head[..n]);
        assert!(head.starts_with("HTTP/1.1 101"), "got: {}", head);

        // The relay stays open past the handshake, both directions
        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 9];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"echo:ping");
    }

    #[tokio::test]
    async fn test_unreachable_backend_yields_502() {
        // Bind then drop a listener so the port is very likely closed
        let dead_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let (_tx, shutdown) = ShutdownSignal::new();
        let router = PathRouter::bind(
            "127.0.0.1:0".parse().unwrap(),
            ProxyRoutes {
                engine_port: dead_port,
                default_port: dead_port,
            },
            shutdown,
        )
        .unwrap();
        let addr = router.local_addr().unwrap();
        tokio::spawn(router.run());

        let response = request_via(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
    }
}
