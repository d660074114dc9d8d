//! argonode - multi-protocol proxy node bootstrapper
//!
//! Startup order:
//! - resolve network parameters and generate the engine routing document
//! - launch the external binaries (engine, monitoring agent, tunnel client)
//! - serve the public port through the path-based reverse proxy
//! - resolve the tunnel domain (configured or discovered from the log)
//! - publish the subscription document and upload it to the collector

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

mod cli;
mod discovery;
mod error;
mod fetch;
mod router;
mod settings;
mod shutdown;
mod subscription;
mod supervisor;
mod warp;
mod web;
mod xray;

use cli::{Cli, Commands};
use discovery::DiscoveredEndpoint;
use error::NodeError;
use fetch::Fetcher;
use router::{PathRouter, ProxyRoutes};
use settings::Settings;
use shutdown::ShutdownSignal;
use subscription::Publisher;
use supervisor::{Supervisor, TunnelMode};
use warp::WarpResolver;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };
        EnvFilter::new(format!("argonode={}", level))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Run => run_node(settings).await,
    }
}

async fn run_node(settings: Settings) -> anyhow::Result<()> {
    let paths = settings.paths();
    paths.ensure_base()?;

    let (shutdown_tx, shutdown) = ShutdownSignal::new();

    let sub_state = web::new_subscription_state();
    let publisher = Publisher::new(settings.clone(), paths.clone(), sub_state.clone());

    // A redeploy must not leave the collector holding last run's nodes
    publisher.delete_stale_nodes().await;

    let fetcher = Fetcher::new()?;
    let params = WarpResolver::new(fetcher).resolve().await;
    let engine_doc = xray::generate(&params, &settings.uuid)?;
    xray::write(&paths.engine_config, &engine_doc).await?;

    let supervisor = Supervisor::new(settings.clone(), paths.clone());

    // Launch failures degrade the node, never abort it: the proxy and HTTP
    // service below must come up regardless.
    let _agent = supervisor.launch_agent().await;
    let _engine = match supervisor.launch_engine() {
        Ok(child) => Some(child),
        Err(e) => {
            warn!("Protocol engine failed to start: {}", e);
            None
        }
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mode = TunnelMode::detect(settings.argo_auth.as_deref());
    if let TunnelMode::CredentialFile {
        auth_json,
        tunnel_id,
    } = &mode
    {
        supervisor.write_tunnel_files(auth_json, tunnel_id).await?;
    }
    let mut tunnel = supervisor.launch_tunnel(&mode);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", settings.public_port).parse()?;
    let proxy = PathRouter::bind(
        bind_addr,
        ProxyRoutes {
            engine_port: xray::ENGINE_PORT,
            default_port: settings.http_port,
        },
        shutdown.clone(),
    )?;
    tokio::spawn(proxy.run());

    let web_router = web::create_router(&settings.sub_path, sub_state);
    let http_port = settings.http_port;
    let web_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = web::run_server("0.0.0.0", http_port, web_router, web_shutdown).await {
            error!("HTTP service failed: {}", e);
        }
    });

    let endpoint = match (&settings.argo_domain, &settings.argo_auth) {
        (Some(domain), Some(auth)) if !domain.is_empty() && !auth.is_empty() => {
            info!("Using configured tunnel domain {}", domain);
            Some(DiscoveredEndpoint::fixed(domain))
        }
        _ if mode.needs_discovery() => {
            match discovery::discover(&paths.boot_log, &settings.discovery, &mut tunnel, &shutdown)
                .await
            {
                Ok(endpoint) => Some(endpoint),
                Err(NodeError::DiscoveryExhausted { attempts }) => {
                    warn!(
                        "No tunnel domain after {} attempts; running without a published subscription",
                        attempts
                    );
                    None
                }
                Err(NodeError::DiscoveryCancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        _ => {
            warn!("Managed tunnel without a configured domain; subscription not published");
            None
        }
    };

    if let Some(endpoint) = &endpoint {
        publisher.publish(endpoint).await?;
    }
    publisher.auto_visit().await;

    info!("Node is up");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}
