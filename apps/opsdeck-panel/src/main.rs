mod api;
mod handlers;
mod vps_manager;
mod ws;

use std::io;
use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::{get, post};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vps_manager::{ManagerSettings, VpsManager};

#[derive(Clone)]
pub struct AppState {
    pub vps_manager: VpsManager,
}

#[derive(Parser)]
#[command(name = "opsdeck")]
#[command(about = "Opsdeck VPS Monitoring Panel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the panel web server
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("Opsdeck binary started. Version: {}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = dotenvy::dotenv() {
        println!("Warning: Failed to load .env file: {}", e);
    }

    let cli = Cli::parse();

    // Log to stdout and to a rolling file next to the binary.
    let file_appender = tracing_appender::rolling::never(".", "panel.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsdeck=debug,axum=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    match cli.command {
        Commands::Serve => run_server().await?,
    }

    Ok(())
}

async fn run_server() -> Result<()> {
    let vps_manager = VpsManager::new(ManagerSettings::default());

    let state = AppState {
        vps_manager: vps_manager.clone(),
    };

    let app = axum::Router::new()
        .route("/api/health", get(handlers::vps::health))
        .route("/api/vps", get(handlers::vps::list_connected_vps))
        .route("/api/vps/add", post(handlers::vps::add_vps))
        .route("/api/vps/list", get(handlers::vps::list_user_vps))
        .route(
            "/api/vps/{id}",
            get(handlers::vps::get_vps).delete(handlers::vps::remove_vps),
        )
        .route("/api/vps/{id}/stats", get(handlers::vps::get_vps_stats))
        .route("/api/vps/{id}/execute", post(handlers::vps::execute_command))
        .route("/api/vps/{id}/retry", post(handlers::vps::retry_vps))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let port: u16 = std::env::var("PANEL_PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("PANEL_PORT must be a number");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(vps_manager.clone()))
        .await?;

    Ok(())
}

/// Wait for Ctrl-C, then tear the supervisor down so every connected VPS
/// gets its disconnect event before the process exits.
async fn shutdown_signal(vps_manager: VpsManager) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("Shutdown signal received");
    vps_manager.shutdown();
}
