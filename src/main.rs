//! devicemesh node - main entry point
//!
//! Runs one device of the mesh: connects to the broker, serves the command queue and event
//! broadcasting services, and exposes health endpoints.

use clap::{Parser, Subcommand};
use devicemesh::commands::{CommandQueueService, RelayExecutor, TargetRouter};
use devicemesh::config::MeshConfig;
use devicemesh::dispatch::InboundDispatcher;
use devicemesh::events::{EventBroadcastService, RelayEventSink};
use devicemesh::observability::{init_default_logging, metrics, HealthServer};
use devicemesh::transport::mqtt::MqttLink;
use devicemesh::transport::{ClientEvent, ConnectionState, MessageSender, ProtocolClient};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

/// Multi-device command and event sync node
#[derive(Parser)]
#[command(name = "devicemesh")]
#[command(about = "Multi-device command and event sync node")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DEVICEMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the mesh and serve until interrupted
    Run {
        /// Override the health server port
        #[arg(long, env = "HEALTH_PORT")]
        health_port: Option<u16>,
    },
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting devicemesh v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { health_port } => run_node(config, health_port).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<MeshConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(MeshConfig::load_from_file(path)?);
    }

    for path_str in ["devicemesh.toml", "config/devicemesh.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(MeshConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create devicemesh.toml".into())
}

async fn run_node(
    config: MeshConfig,
    health_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let device = config.device_info();
    info!(device_id = %device.device_id, user_id = %device.user_id, "node starting");

    let link = MqttLink::new(device.clone(), config.transport.clone());
    let client = Arc::new(ProtocolClient::new(link, device.clone(), config.client_config()));
    let sender: Arc<dyn MessageSender> = client.clone();

    let commands = Arc::new(CommandQueueService::new(
        config.commands.clone(),
        Arc::new(TargetRouter::new()),
        Arc::new(RelayExecutor::new(Arc::clone(&sender))),
    ));
    let events = Arc::new(EventBroadcastService::new(
        config.events.clone(),
        Arc::new(RelayEventSink::new(Arc::clone(&sender))),
    ));

    client.set_handler(Arc::new(InboundDispatcher::new(
        Arc::clone(&commands),
        Arc::clone(&events),
    )));

    let health_server = if config.health.enabled {
        let port = health_port.unwrap_or(config.health.port);
        let server = Arc::new(
            HealthServer::new(device.device_id.clone(), port)
                .with_commands(Arc::clone(&commands))
                .with_events(Arc::clone(&events)),
        );
        tokio::spawn(Arc::clone(&server).start());

        let observed = Arc::clone(&server);
        client.observers().subscribe(move |event: &ClientEvent| {
            if let ClientEvent::StateChanged { to, .. } = event {
                observed.set_link_connected(*to == ConnectionState::Connected);
            }
        });
        Some(server)
    } else {
        None
    };

    commands.start();
    events.start()?;

    if let Err(e) = client.connect_with_retry().await {
        warn!(error = %e, "initial connection failed, retrying with backoff");
    }

    info!("Node is running");

    tokio::select! {
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
        }
        _ = monitor_connection(&client) => {
            error!("Link permanently lost, shutting down");
        }
    }

    info!("Shutdown initiated");
    commands.shutdown();
    if let Err(e) = events.stop() {
        warn!(error = %e, "event service stop failed");
    }
    client.destroy().await;
    if let Some(server) = health_server {
        server.set_link_connected(false);
    }
    metrics().update_health_status(false);

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

/// Resolves once the client gives up reconnecting
async fn monitor_connection(client: &ProtocolClient<MqttLink>) {
    loop {
        if client.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn handle_config_command(
    config: &MeshConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", config.to_toml_string()?);
    }
    info!("Configuration validation complete");
    Ok(())
}
