// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Trigger front-ends and the clip job queue.
//!
//! Both front-ends reduce to the same thing: enqueue a
//! `(timestamp, selector, duration)` request on a bounded FIFO channel. A
//! single worker drains the queue and drives the clip composer, so clip
//! jobs are serialised — two near-simultaneous triggers yield two clips,
//! never a merged one.
//!
//! Endpoints (HTTP mode):
//!   POST /save-clip   body {camera_id?: "all"|"camera_<n>", duration?: secs}
//!   GET  /status      system summary (captures, buffers, health, clips)
//!   GET  /health      liveness probe
//!
//! Keyboard mode reads stdin lines: `s` saves a clip for all cameras,
//! `q`/`quit`/`exit` requests shutdown. HTTP mode keeps the keyboard reader
//! too, for local control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::buffer::BufferManager;
use crate::capture::CaptureState;
use crate::clip::ClipComposer;
use crate::config::Config;
use crate::error::{ReplayError, Result};
use crate::monitor::HealthRegistry;

/// Bounded queue depth; beyond this, triggers are rejected rather than
/// silently coalesced.
const TRIGGER_QUEUE_DEPTH: usize = 32;
/// Worker poll bound so shutdown stays responsive.
const WORKER_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Which cameras a trigger applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipSelector {
    All,
    Camera(String),
}

impl ClipSelector {
    /// Parse the wire form: `all` or a configured `camera_<n>` id.
    pub fn parse(raw: &str, config: &Config) -> Result<Self> {
        if raw == "all" {
            return Ok(ClipSelector::All);
        }
        if config.camera(raw).is_some() {
            return Ok(ClipSelector::Camera(raw.to_string()));
        }
        Err(ReplayError::Trigger(format!("unknown camera_id '{raw}'")))
    }
}

/// One clip request, as enqueued by a front-end.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub request_time: DateTime<Utc>,
    pub selector: ClipSelector,
    pub requested_duration: f64,
}

enum KeyboardAction {
    Save,
    Quit,
    Ignore,
}

fn keyboard_action(line: &str) -> KeyboardAction {
    match line.trim().to_ascii_lowercase().as_str() {
        "s" => KeyboardAction::Save,
        "q" | "quit" | "exit" => KeyboardAction::Quit,
        _ => KeyboardAction::Ignore,
    }
}

/// Owns the trigger queue and the front-end tasks.
pub struct TriggerSystem {
    config: Arc<Config>,
    composer: Arc<ClipComposer>,
    tx: mpsc::Sender<TriggerRequest>,
    rx: Mutex<Option<mpsc::Receiver<TriggerRequest>>>,
}

impl TriggerSystem {
    pub fn new(config: Arc<Config>, composer: Arc<ClipComposer>) -> Self {
        let (tx, rx) = mpsc::channel(TRIGGER_QUEUE_DEPTH);
        TriggerSystem { config, composer, tx, rx: Mutex::new(Some(rx)) }
    }

    pub fn sender(&self) -> mpsc::Sender<TriggerRequest> {
        self.tx.clone()
    }

    /// Validate and enqueue a request stamped with the current instant.
    pub fn enqueue(&self, selector: ClipSelector, duration: Option<f64>) -> Result<DateTime<Utc>> {
        let duration = duration.unwrap_or(self.config.clip_seconds as f64);
        if duration <= 0.0 || duration > self.config.buffer_seconds as f64 {
            return Err(ReplayError::Trigger(format!(
                "duration must be in (0, {}] seconds",
                self.config.buffer_seconds
            )));
        }

        let request_time = Utc::now();
        self.tx
            .try_send(TriggerRequest { request_time, selector, requested_duration: duration })
            .map_err(|_| ReplayError::Trigger("trigger queue full or closed".into()))?;
        Ok(request_time)
    }

    /// The materialiser worker: drains the FIFO and runs the composer.
    pub fn spawn_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .expect("trigger worker spawned twice");
        let composer = self.composer.clone();
        let shutdown = shutdown;

        tokio::spawn(async move {
            info!("Clip trigger worker started");
            loop {
                let request =
                    match tokio::time::timeout(WORKER_RECV_TIMEOUT, rx.recv()).await {
                        Ok(Some(req)) => req,
                        Ok(None) => break,
                        Err(_) => {
                            if *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    };

                info!(
                    selector = ?request.selector,
                    duration = request.requested_duration,
                    request_time = %request.request_time,
                    "Processing trigger"
                );
                let results = composer
                    .generate_for(
                        &request.selector,
                        request.request_time,
                        request.requested_duration,
                    )
                    .await;

                let ok = results.values().filter(|o| o.success).count();
                info!(
                    succeeded = ok,
                    total = results.len(),
                    "Trigger processed"
                );
            }
            info!("Clip trigger worker stopped");
        })
    }

    /// Line-oriented stdin front-end.
    pub fn spawn_keyboard(
        self: &Arc<Self>,
        quit_tx: mpsc::Sender<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            println!("──────────────────────────────────────────────");
            println!("Replay buffer running");
            println!("  's' + ENTER  save a clip from all cameras");
            println!("  'q' + ENTER  shut down");
            println!("──────────────────────────────────────────────");

            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                        continue;
                    }
                };

                match line {
                    Ok(Some(line)) => match keyboard_action(&line) {
                        KeyboardAction::Save => {
                            match this.enqueue(ClipSelector::All, None) {
                                Ok(t) => {
                                    println!("[{}] Saving clip…", t.format("%H:%M:%S"));
                                }
                                Err(e) => {
                                    warn!(error = %e, "Keyboard trigger rejected");
                                    println!("Could not queue clip: {e}");
                                }
                            }
                        }
                        KeyboardAction::Quit => {
                            println!("Shutting down…");
                            let _ = quit_tx.send(()).await;
                            break;
                        }
                        KeyboardAction::Ignore => {}
                    },
                    Ok(None) => break, // stdin closed
                    Err(e) => {
                        warn!(error = %e, "Keyboard reader error");
                        break;
                    }
                }
            }
        })
    }

    /// HTTP front-end. Binds `0.0.0.0:<HTTP_PORT>` and serves until the
    /// shutdown flag flips.
    pub fn spawn_http(
        self: &Arc<Self>,
        state: Arc<ApiState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let port = self.config.http_port;
        tokio::spawn(async move {
            let app = build_router(state);
            let addr = format!("0.0.0.0:{port}");
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr, "Failed to bind trigger HTTP server");
                    return;
                }
            };
            info!(port, "Trigger HTTP server listening");

            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Trigger HTTP server error");
            }
        })
    }
}

// ──────────────────────────── HTTP surface ───────────────────────────────

/// Shared state for the HTTP handlers.
pub struct ApiState {
    pub config: Arc<Config>,
    pub triggers: Arc<TriggerSystem>,
    pub registry: Arc<HealthRegistry>,
    pub buffers: Arc<BufferManager>,
    pub captures: HashMap<String, Arc<Mutex<CaptureState>>>,
    pub composer: Arc<ClipComposer>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SaveClipBody {
    pub camera_id: Option<String>,
    pub duration: Option<f64>,
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/save-clip", post(handle_save_clip))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_save_clip(
    State(state): State<Arc<ApiState>>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // An absent body means "all cameras, default duration".
    let body: SaveClipBody = if body.is_empty() {
        SaveClipBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "success": false, "message": format!("invalid body: {e}") })),
                );
            }
        }
    };
    let raw_selector = body.camera_id.as_deref().unwrap_or("all");

    let selector = match ClipSelector::parse(raw_selector, &state.config) {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": e.to_string() })),
            );
        }
    };

    match state.triggers.enqueue(selector, body.duration) {
        Ok(trigger_time) => {
            info!(camera_id = raw_selector, "Trigger accepted via HTTP");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": "Clip save queued",
                    "trigger_time": trigger_time.to_rfc3339(),
                    "camera_id": raw_selector,
                })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": e.to_string() })),
        ),
    }
}

async fn handle_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let captures: HashMap<&String, CaptureState> = state
        .captures
        .iter()
        .map(|(id, st)| (id, st.lock().clone()))
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "status": "running",
            "timestamp": Utc::now().to_rfc3339(),
            "cameras_count": state.config.cameras.len(),
            "buffer_duration": state.config.buffer_seconds,
            "clip_duration": state.config.clip_seconds,
            "captures": captures,
            "buffers": state.buffers.all_info(),
            "clip_generator": state.composer.stats(),
            "health": state.registry.summary(),
        })),
    )
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "available_endpoints": [
                "POST /save-clip - save a clip",
                "GET /status - system status",
                "GET /health - health check",
            ],
        })),
    )
}
