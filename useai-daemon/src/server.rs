//! Daemon (component F): the long-running local HTTP server that
//! multiplexes tool calls from many concurrent AI-assistant processes.
//!
//! Grounded on `main.rs`'s axum `Router` + `/health` + graceful-shutdown-on-
//! signal shape, generalized from a single-instance-by-construction dev
//! server into one with the explicit PID-file/port-race/version-check
//! protocol spec §4.F describes. The `/mcp` transport and the per-transport
//! engine registry have no teacher analogue; grounded on
//! `metjm-planning-agent`'s `session_tracking.rs` (heartbeat loop with
//! reconnect-with-backoff against a daemon) and `hwisu-opensession`'s
//! `crates/daemon` + `crates/server` split.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, Signal, System};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use useai_types::{PidFileInfo, ToolCall, ToolResponse};

use crate::engine::SessionEngine;
use crate::error::EngineError;
use crate::handlers::{self, HandlerContext};
use crate::keystore::Keystore;
use crate::paths::Paths;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_PORT: u16 = 9999;
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const TERM_GRACE_PERIOD: Duration = Duration::from_secs(5);
const SPAWN_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TRANSPORT_ID: &str = "default";

struct AppState {
    paths: Paths,
    keystore: Arc<Keystore>,
    engines: Mutex<HashMap<String, Arc<Mutex<SessionEngine>>>>,
    started_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: i64,
    active_sessions: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engines = state.engines.lock().await;
    let mut active_sessions = 0usize;
    for engine in engines.values() {
        if engine.lock().await.is_in_progress() {
            active_sessions += 1;
        }
    }
    Json(HealthResponse {
        status: "ok",
        version: VERSION,
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        active_sessions,
    })
}

fn transport_id(headers: &HeaderMap) -> String {
    headers
        .get("x-useai-transport")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_TRANSPORT_ID)
        .to_string()
}

async fn engine_for_transport(state: &AppState, transport_id: &str) -> Arc<Mutex<SessionEngine>> {
    let mut engines = state.engines.lock().await;
    engines
        .entry(transport_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(SessionEngine::new(state.paths.clone(), state.keystore.clone()))))
        .clone()
}

/// `POST /mcp`. The request body is parsed manually (not via axum's `Json`
/// extractor) so a malformed body becomes `{content, isError:true}` at 200,
/// never a non-2xx rejection — spec §6 requires errors be encoded in the
/// body at this layer.
async fn mcp(State(state): State<Arc<AppState>>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    let call: ToolCall = match serde_json::from_slice(&body) {
        Ok(call) => call,
        Err(e) => {
            return Json(ToolResponse::error(format!("INVALID_ARGUMENT: {e}")));
        }
    };

    let transport_id = transport_id(&headers);
    let engine_handle = engine_for_transport(&state, &transport_id).await;
    let mut engine = engine_handle.lock().await;
    let ctx = HandlerContext { paths: &state.paths };
    let response = handlers::dispatch(call, &mut engine, &ctx).await;
    Json(response)
}

#[derive(Serialize)]
struct SealActiveResponse {
    sealed: u32,
}

/// `POST /api/seal-active`. `204` if nothing needed sealing, `200
/// {sealed: N}` if N live sessions were synthesized-ended.
async fn seal_active_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sealed = seal_all(&state).await;
    if sealed == 0 {
        StatusCode::NO_CONTENT.into_response()
    } else {
        Json(SealActiveResponse { sealed }).into_response()
    }
}

async fn seal_all(state: &AppState) -> u32 {
    let engines = state.engines.lock().await;
    let mut sealed = 0u32;
    for engine in engines.values() {
        match engine.lock().await.seal_active().await {
            Ok(Some(_)) => sealed += 1,
            Ok(None) => {}
            Err(e) => warn!("seal_active failed during shutdown sweep: {e}"),
        }
    }
    sealed
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(mcp))
        .route("/api/seal-active", post(seal_active_endpoint))
        .with_state(state)
}

// ── Single-instance guarantee (spec §4.F) ───────────────────────────────────────

enum StartupOutcome {
    /// This instance should exit 0; a live, version-matched daemon already
    /// owns the port.
    Redundant,
    /// This instance should proceed to bind and serve.
    Proceed,
}

fn pid_alive(pid: u32) -> bool {
    let system = System::new_all();
    system.process(Pid::from_u32(pid)).is_some()
}

async fn probe_health(port: u16) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(HEALTH_PROBE_TIMEOUT)
        .build()
        .ok()?;
    let response = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .ok()?;
    let body: serde_json::Value = response.json().await.ok()?;
    body.get("version").and_then(|v| v.as_str()).map(str::to_string)
}

async fn terminate_prior_instance(pid: u32) {
    {
        let system = System::new_all();
        let Some(process) = system.process(Pid::from_u32(pid)) else {
            return;
        };
        process.kill_with(Signal::Term);
    }

    let deadline = tokio::time::Instant::now() + TERM_GRACE_PERIOD;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if !pid_alive(pid) {
            return;
        }
    }

    let system = System::new_all();
    if let Some(process) = system.process(Pid::from_u32(pid)) {
        process.kill_with(Signal::Kill);
    }
}

/// Step 1-3 of the single-instance protocol: resolves whether this process
/// should proceed to bind the port, terminating a stale or version-mismatched
/// prior instance as needed.
async fn resolve_startup(paths: &Paths, port: u16) -> StartupOutcome {
    let pid_path = paths.daemon_pid();
    let pid_info: Option<PidFileInfo> = crate::stores::read_json_or_default(&pid_path, None).await;

    let Some(info) = pid_info else {
        return StartupOutcome::Proceed;
    };

    if !pid_alive(info.pid) {
        let _ = tokio::fs::remove_file(&pid_path).await;
        return StartupOutcome::Proceed;
    }

    match probe_health(info.port).await {
        Some(version) if version == VERSION => StartupOutcome::Redundant,
        Some(_) => {
            info!(pid = info.pid, "replacing version-mismatched daemon instance");
            terminate_prior_instance(info.pid).await;
            let _ = tokio::fs::remove_file(&pid_path).await;
            StartupOutcome::Proceed
        }
        None => {
            // Process is alive but not answering /health: treat as stale.
            terminate_prior_instance(info.pid).await;
            let _ = tokio::fs::remove_file(&pid_path).await;
            StartupOutcome::Proceed
        }
    }
}

/// Binds `port`, retrying once after terminating whatever the PID file
/// claims holds it if the first attempt returns `EADDRINUSE`.
async fn bind_with_retry(paths: &Paths, port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!("port {port} in use, attempting to resolve prior holder");
            let pid_info: Option<PidFileInfo> =
                crate::stores::read_json_or_default(&paths.daemon_pid(), None).await;
            if let Some(info) = pid_info {
                terminate_prior_instance(info.pid).await;
            }
            TcpListener::bind(addr)
                .await
                .map_err(|_| anyhow::anyhow!(EngineError::PortInUse))
        }
        Err(e) => Err(e.into()),
    }
}

/// Entry point for the daemon binary: runs the single-instance protocol,
/// binds, serves until a shutdown signal, then seals every live session and
/// removes the PID file.
pub async fn run(paths: Paths, port: u16) -> anyhow::Result<()> {
    paths.ensure_dirs().await?;

    match resolve_startup(&paths, port).await {
        StartupOutcome::Redundant => {
            info!("a version-matched daemon is already running; exiting");
            return Ok(());
        }
        StartupOutcome::Proceed => {}
    }

    let listener = bind_with_retry(&paths, port).await?;

    let keystore_file = crate::stores::read_json_or_default(&paths.keystore_json(), None).await;
    let keystore = match keystore_file {
        Some(file) => match crate::keystore::open(&file) {
            Some(key) => Keystore { signing_key: Some(key) },
            None => Keystore::unsigned(),
        },
        None => {
            let (key, file) = crate::keystore::generate();
            crate::stores::write_atomic(
                &paths.keystore_json(),
                &serde_json::to_vec_pretty(&file).expect("keystore file always serializes"),
            )
            .await?;
            Keystore { signing_key: Some(key) }
        }
    };

    let pid_info = PidFileInfo {
        pid: std::process::id(),
        port,
        started_at: Utc::now(),
    };
    crate::stores::write_atomic(
        &paths.daemon_pid(),
        &serde_json::to_vec_pretty(&pid_info).expect("pid file always serializes"),
    )
    .await?;

    let keystore = Arc::new(keystore);

    let mut engine = SessionEngine::new(paths.clone(), keystore.clone());
    let recovered = engine.recover_abandoned_sessions().await?;
    if recovered > 0 {
        info!(recovered, "sealed abandoned sessions found in data/active on startup");
    }

    let mut engines = HashMap::new();
    engines.insert(DEFAULT_TRANSPORT_ID.to_string(), Arc::new(Mutex::new(engine)));

    let state = Arc::new(AppState {
        paths: paths.clone(),
        keystore,
        engines: Mutex::new(engines),
        started_at: Utc::now(),
    });

    let app = router(state.clone());
    info!(port, version = VERSION, "useai daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let sealed = seal_all(&state).await;
    if sealed > 0 {
        info!(sealed, "sealed live sessions on shutdown");
    }
    let _ = tokio::fs::remove_file(paths.daemon_pid()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, sealing live sessions");
}

// ── Client-side `ensureDaemon` helper (spec §4.F) ───────────────────────────────

/// Used by AI-tool launchers: checks `/health` for the expected version, and
/// if absent or stale, spawns a detached daemon process and polls until it
/// answers or `SPAWN_WAIT_TIMEOUT` elapses.
pub async fn ensure_daemon(port: u16, expected_version: &str, spawn: impl FnOnce() -> std::io::Result<std::process::Child>) -> bool {
    if probe_health(port).await.as_deref() == Some(expected_version) {
        return true;
    }

    if spawn().is_err() {
        return false;
    }

    let deadline = tokio::time::Instant::now() + SPAWN_WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if probe_health(port).await.as_deref() == Some(expected_version) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}
