mod stats;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use clap::Parser;
use sysinfo::System;
use tracing::{error, info};

use opsdeck_shared::api::{AgentStatus, ExecuteRequest, ExecuteResult};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port the agent API listens on
    #[arg(short, long, env = "AGENT_PORT", default_value_t = 8888)]
    port: u16,

    /// API key the panel authenticates with
    #[arg(short = 'k', long, env = "AGENT_API_KEY")]
    api_key: Option<String>,

    /// Key file used when --api-key is not given
    #[arg(long, env = "AGENT_KEY_FILE", default_value = "/etc/opsdeck/agent.key")]
    key_file: String,

    /// Bind address
    #[arg(long, env = "AGENT_BIND", default_value = "0.0.0.0")]
    bind: String,
}

#[derive(Clone)]
struct AgentState {
    api_key: String,
    server_id: String,
    port: u16,
    started: Instant,
    sys: Arc<tokio::sync::Mutex<System>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let api_key = match args.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => match std::fs::read_to_string(&args.key_file) {
            Ok(contents) => contents.trim().to_string(),
            Err(e) => {
                error!(
                    "No API key: --api-key not set and {} is unreadable ({})",
                    args.key_file, e
                );
                anyhow::bail!("api key is required");
            }
        },
    };

    let mut sys = System::new_with_specifics(
        sysinfo::RefreshKind::nothing()
            .with_cpu(sysinfo::CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    sys.refresh_all();

    let state = AgentState {
        api_key,
        server_id: server_id(),
        port: args.port,
        started: Instant::now(),
        sys: Arc::new(tokio::sync::Mutex::new(sys)),
    };

    info!(
        "Opsdeck Agent v{} starting (ID: {})",
        env!("CARGO_PKG_VERSION"),
        state.server_id
    );

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Agent API available on http://{}/api/", addr);
    axum::serve(listener, router(state)).await?;

    Ok(())
}

fn router(state: AgentState) -> axum::Router {
    axum::Router::new()
        .route("/api/status", get(get_status))
        .route("/api/stats", get(get_stats))
        .route("/api/info", get(get_info))
        .route("/api/execute", post(execute_command))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Stable id for this machine, derived from hostname + machine id.
fn server_id() -> String {
    let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
    let machine = machine_uid::get().unwrap_or_else(|_| "unknown".to_string());
    let digest = md5::compute(format!("{}-{}", hostname, machine));
    format!("{:x}", digest)[..16].to_string()
}

/// Every route requires `Authorization: Bearer <api key>`.
async fn auth_middleware(
    State(state): State<AgentState>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    let token = match auth_header {
        Some(auth_header) if auth_header.starts_with("Bearer ") => &auth_header[7..],
        _ => return Err(StatusCode::UNAUTHORIZED),
    };

    if token != state.api_key {
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(next.run(req).await)
}

/// GET /api/status - liveness and identity
async fn get_status(State(state): State<AgentState>) -> impl IntoResponse {
    Json(AgentStatus {
        status: "online".to_string(),
        server_id: state.server_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: Some(state.started.elapsed().as_secs_f64()),
        last_update: Some(chrono::Utc::now().to_rfc3339()),
    })
}

/// GET /api/stats - current system metrics
async fn get_stats(State(state): State<AgentState>) -> impl IntoResponse {
    Json(stats::collect(&state.sys, &state.server_id).await)
}

/// GET /api/info - static server description
async fn get_info(State(state): State<AgentState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "hostname": System::host_name(),
        "platform": std::env::consts::OS,
        "agent_version": env!("CARGO_PKG_VERSION"),
        "server_id": state.server_id,
        "api_port": state.port,
    }))
}

/// POST /api/execute - run a shell command.
/// Shell failures and timeouts are reported in the result body, not as
/// HTTP errors.
async fn execute_command(
    State(_state): State<AgentState>,
    Json(payload): Json<ExecuteRequest>,
) -> axum::response::Response {
    if payload.command.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Command is required").into_response();
    }

    info!("Executing command: {}", payload.command);
    Json(run_command(&payload.command).await).into_response()
}

async fn run_command(command: &str) -> ExecuteResult {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output();

    match tokio::time::timeout(COMMAND_TIMEOUT, output).await {
        Ok(Ok(output)) => ExecuteResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            returncode: output.status.code().unwrap_or(-1),
        },
        Ok(Err(e)) => ExecuteResult {
            success: false,
            stdout: String::new(),
            stderr: e.to_string(),
            returncode: -1,
        },
        Err(_) => ExecuteResult {
            success: false,
            stdout: String::new(),
            stderr: "Command timeout".to_string(),
            returncode: -1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_agent(api_key: &str) -> SocketAddr {
        let mut sys = System::new_all();
        sys.refresh_all();
        let state = AgentState {
            api_key: api_key.to_string(),
            server_id: server_id(),
            port: 0,
            started: Instant::now(),
            sys: Arc::new(tokio::sync::Mutex::new(sys)),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn rejects_bad_credentials() {
        let addr = spawn_agent("secret-key").await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("http://{}/api/status", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let resp = client
            .get(format!("http://{}/api/status", addr))
            .header("Authorization", "Bearer wrong-key")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reports_online_status() {
        let addr = spawn_agent("secret-key").await;
        let client = reqwest::Client::new();

        let status: AgentStatus = client
            .get(format!("http://{}/api/status", addr))
            .header("Authorization", "Bearer secret-key")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(status.status, "online");
        assert_eq!(status.server_id.len(), 16);
        assert!(status.uptime.unwrap_or(-1.0) >= 0.0);
    }

    #[tokio::test]
    async fn serves_stats() {
        let addr = spawn_agent("secret-key").await;
        let client = reqwest::Client::new();

        let stats: opsdeck_shared::api::AgentStats = client
            .get(format!("http://{}/api/stats", addr))
            .header("Authorization", "Bearer secret-key")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert!(stats.memory.total > 0);
        assert!((0.0..=100.0).contains(&stats.memory.percent));
    }

    #[tokio::test]
    async fn executes_commands_in_band() {
        let addr = spawn_agent("secret-key").await;
        let client = reqwest::Client::new();

        let result: ExecuteResult = client
            .post(format!("http://{}/api/execute", addr))
            .header("Authorization", "Bearer secret-key")
            .json(&ExecuteRequest {
                command: "echo hello".to_string(),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.returncode, 0);

        let result: ExecuteResult = client
            .post(format!("http://{}/api/execute", addr))
            .header("Authorization", "Bearer secret-key")
            .json(&ExecuteRequest {
                command: "exit 3".to_string(),
            })
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.returncode, 3);
    }
}
