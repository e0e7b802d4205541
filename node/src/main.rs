// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Pocket Node
//!
//! Entry point for the `pocket-node` binary. Parses CLI arguments,
//! initializes logging and metrics, starts the P2P module on a libp2p
//! host, and serves the HTTP API and Prometheus endpoint.
//!
//! The binary supports three subcommands:
//!
//! - `run`     start the node
//! - `keygen`  generate an Ed25519 key
//! - `version` print build version information

mod actors;
mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

use pocket_p2p::config::{BACKGROUND_TOPIC, RAINTREE_PROTOCOL_ID};
use pocket_p2p::host::{Host, SwarmHost, SwarmHostConfig};
use pocket_p2p::peer::{url_to_multiaddr, SystemResolver};
use pocket_p2p::providers::{parse_bootstrap_peers, AtomicHeight, CurrentHeightProvider};
use pocket_p2p::{
    EnvelopeRegistry, InboundMessage, P2PModule, P2PModuleDeps, P2pConfig, P2pEvent, PrivateKey,
};

use actors::ActorsFileProvider;
use cli::{Commands, PocketNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PocketNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Keygen(args) => keygen(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node: P2P module, block ticker, API and metrics servers.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        logging::DEFAULT_DIRECTIVES,
        LogFormat::from_str_lossy(&args.log_format),
    )?;

    let config = load_config(&args).await?;
    let key_hex = config
        .private_key
        .as_deref()
        .context("no private key: pass --private-key or set it in the config file")?;
    let key = PrivateKey::from_hex(key_hex).context("invalid private key")?;

    tracing::info!(
        address = %key.address(),
        peer_id = %key.peer_id(),
        listen = ?config.listen_addrs,
        bootstrap_peers = config.bootstrap_peers.len(),
        client_debug_mode = config.client_debug_mode,
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        "starting pocket-node"
    );

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Host ---
    let host: Arc<dyn Host> = SwarmHost::new(&key, SwarmHostConfig::from_p2p_config(&config))
        .await
        .context("failed to start libp2p host")?;

    // --- P2P module ---
    let heights = Arc::new(AtomicHeight::new(0));
    let (module, inbox) = P2PModule::new(
        config,
        P2PModuleDeps {
            host,
            provider: Arc::new(ActorsFileProvider::new(&args.peers_file)),
            heights: heights.clone(),
            registry: EnvelopeRegistry::new(),
            metrics: Arc::clone(&node_metrics.p2p),
        },
    )?;
    let module = Arc::new(module);
    module.start().await.with_context(|| {
        format!(
            "failed to start p2p module (actors file {})",
            args.peers_file.display()
        )
    })?;

    let inbound_loop = tokio::spawn(drain_inbound(inbox, Arc::clone(&node_metrics)));
    let block_loop = tokio::spawn(commit_blocks(
        Arc::clone(&module),
        heights.clone(),
        Arc::clone(&node_metrics),
        Duration::from_secs(args.block_interval_secs.max(1)),
    ));

    // --- API server ---
    let api_router = api::create_router(api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        p2p: Arc::clone(&module),
        heights,
    });
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    block_loop.abort();
    module.stop().await?;
    inbound_loop.abort();
    tracing::info!("pocket-node stopped");
    Ok(())
}

/// Reads the optional config file and applies CLI overrides.
async fn load_config(args: &cli::RunArgs) -> Result<P2pConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => P2pConfig::default(),
    };

    if let Some(key) = &args.private_key {
        config.private_key = Some(key.clone());
    }
    if config.listen_addrs.is_empty() {
        let host = if args.listen_host.contains(':') {
            format!("[{}]", args.listen_host)
        } else {
            args.listen_host.clone()
        };
        let addr = url_to_multiaddr(&format!("{host}:{}", args.p2p_port), &SystemResolver)
            .await
            .with_context(|| format!("invalid listen host {:?}", args.listen_host))?;
        config.listen_addrs.push(addr);
    }
    if let Some(csv) = &args.bootstrap_peers {
        config.bootstrap_peers = parse_bootstrap_peers(csv)?;
    }
    config.client_debug_mode |= args.client_debug_mode;
    Ok(config)
}

/// Logs and counts every envelope the module hands up.
async fn drain_inbound(mut inbox: mpsc::Receiver<InboundMessage>, metrics: Arc<NodeMetrics>) {
    while let Some(message) = inbox.recv().await {
        metrics.record_inbound(message.source);
        tracing::debug!(
            router = %message.source,
            type_url = %message.envelope.type_url,
            nonce = message.envelope.nonce,
            bytes = message.envelope.value.len(),
            "inbound message"
        );
    }
}

/// Stands in for consensus: advances the height on a fixed interval and
/// tells the module about each commit.
async fn commit_blocks(
    module: Arc<P2PModule>,
    heights: Arc<AtomicHeight>,
    metrics: Arc<NodeMetrics>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let height = heights.current_height() + 1;
        heights.advance_to(height);
        metrics.block_height.set(height as i64);

        if let Err(e) = module.handle_event(P2pEvent::BlockCommitted { height }).await {
            tracing::warn!(height, error = %e, "staked set refresh failed");
        }
    }
}

/// Generates a key and prints its identity.
fn keygen(args: cli::KeygenArgs) -> Result<()> {
    let key = PrivateKey::generate();

    let mut identity = serde_json::json!({
        "address": key.address().to_hex(),
        "public_key": key.public_key().to_hex(),
        "peer_id": key.peer_id().to_string(),
    });

    match &args.output {
        Some(path) => {
            std::fs::write(path, key.to_hex())
                .with_context(|| format!("failed to write key to {}", path.display()))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            identity["key_file"] = path.display().to_string().into();
        }
        None => {
            identity["private_key"] = key.to_hex().into();
        }
    }

    println!("{}", serde_json::to_string_pretty(&identity)?);
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("pocket-node {}", env!("CARGO_PKG_VERSION"));
    println!("raintree    {}", RAINTREE_PROTOCOL_ID);
    println!("topic       {}", BACKGROUND_TOPIC);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// A handler that fails to install is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
