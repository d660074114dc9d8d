//! Internal HTTP service
//!
//! Serves the landing page and the subscription document. It binds a
//! loopback-reachable port behind the reverse proxy; everything that is not a
//! protocol-upgrade path lands here.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use parking_lot::RwLock;
use tracing::info;

use crate::shutdown::ShutdownSignal;

/// Latest published subscription document, shared with the publisher
pub type SubscriptionState = Arc<RwLock<Option<String>>>;

pub fn new_subscription_state() -> SubscriptionState {
    Arc::new(RwLock::new(None))
}

struct WebState {
    subscription: SubscriptionState,
}

/// Create the service router; the subscription route is mounted at the
/// configured path
pub fn create_router(sub_path: &str, subscription: SubscriptionState) -> Router {
    let state = Arc::new(WebState { subscription });

    Router::new()
        .route("/", get(home))
        .route(&format!("/{}", sub_path), get(serve_subscription))
        .with_state(state)
}

/// Run the HTTP service until shutdown
pub async fn run_server(
    bind: &str,
    port: u16,
    router: Router,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("HTTP service running at http://{}", addr);

    let mut shutdown = shutdown;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    Ok(())
}

/// Landing page: an operator-provided index.html when present, a plain
/// greeting otherwise
async fn home() -> impl IntoResponse {
    match tokio::fs::read_to_string("./index.html").await {
        Ok(page) => Html(page).into_response(),
        Err(_) => "Hello world!".into_response(),
    }
}

/// The current subscription document; 404 until the first publication
async fn serve_subscription(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let document = state.subscription.read().clone();
    match document {
        Some(document) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            document,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
