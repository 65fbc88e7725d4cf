/// JM Bot - Main Entry Point
///
/// OneBot group-chat bridge: listens for commands over the gateway WebSocket,
/// runs the external fetcher and uploads the packaged result to the group.
mod commands;
mod config;
mod gateway;
mod janitor;
mod packaging;
mod pipeline;
mod server;
mod workers;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use jm_shared::group_state::{CooldownTable, GroupRegistry};
use jm_shared::job::JobTracker;

use commands::{CommandDispatcher, CommandGrammar};
use config::BotConfig;
use gateway::connection::GatewayClient;
use gateway::GatewayApi;
use pipeline::{JobPipeline, PipelineSettings};
use server::ServerState;
use workers::fetcher::CommandFetcher;

/// Bind attempts before giving up on the local server.
const BIND_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jm_bot=info,jm_shared=info".into()),
        )
        .init();

    info!("=== JM Bot Starting ===");

    let config = match BotConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("Admins: {:?}", config.admins);
    info!("Max file size: {}MB", config.max_file_bytes / 1024 / 1024);
    info!("Cleanup interval: {}s", config.cleanup_interval.as_secs());
    info!("Output mode: {}", config.output_mode);

    // Scratch directories start empty: nothing from a previous run is in flight.
    for dir in config.scratch_dirs() {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("Failed to create {:?}: {}", dir, e);
            std::process::exit(1);
        }
    }
    janitor::purge(&config.scratch_dirs());

    let groups = GroupRegistry::load(config.groups_file()).await;
    info!("Enabled groups file: {:?}", groups.path());
    let cooldowns = CooldownTable::new(config.cooldown);
    info!("Cooldown: {}s", cooldowns.window_secs());
    let jobs = JobTracker::new();

    let gateway = GatewayClient::new(config.gateway.clone());
    let gateway_api: Arc<dyn GatewayApi> = Arc::new(gateway.clone());

    let pipeline = Arc::new(JobPipeline::new(
        gateway_api.clone(),
        Arc::new(CommandFetcher::new(config.fetcher.clone())),
        cooldowns.clone(),
        jobs.clone(),
        PipelineSettings::from_config(&config),
    ));

    let grammar = match CommandGrammar::new(config.grammar.clone()) {
        Ok(grammar) => grammar,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let dispatcher = CommandDispatcher::new(
        gateway_api,
        groups,
        cooldowns,
        pipeline,
        grammar,
        config.admins.clone(),
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Spawn background tasks
    tokio::spawn(janitor::run(config.scratch_dirs(), config.cleanup_interval));
    tokio::spawn(dispatcher.run(event_rx));
    let connection = gateway.clone();
    let ws_events = event_tx.clone();
    tokio::spawn(async move { connection.run(ws_events).await });

    let listener = match server::bind_listener(&config.server_host, config.server_port, BIND_ATTEMPTS).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to start local server: {}", e);
            std::process::exit(1);
        }
    };
    match listener.local_addr() {
        Ok(addr) => info!("Local server listening on {}", addr),
        Err(e) => error!("Local server address unavailable: {}", e),
    }

    let state = Arc::new(ServerState {
        events: event_tx,
        gateway_connected: gateway.connected_flag(),
        jobs,
    });
    let app = server::router(state);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Local server error: {}", e);
        std::process::exit(1);
    }

    info!("JM Bot stopped.");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
