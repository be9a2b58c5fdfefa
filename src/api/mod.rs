//! Peer-facing HTTP surface
//!
//! Receives the paired peer's context map and exposes the device list plus the
//! presentation-layer triggers. Handlers never touch the store directly: they
//! forward events to the single event loop and read from a loop-maintained
//! snapshot.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::device::{AppType, Device};

/// Requests the presentation layer forwards to the event loop
#[derive(Debug)]
pub enum ApiEvent {
    /// Context value received from the peer
    Context(String),
    AddDevice(DeviceDraft),
    RemoveDevice(usize),
    MoveDevice { from: usize, to: usize },
    ToggleInstall(usize),
    Command(usize, DeviceCommand),
    /// Push the full snapshot to the peer (the "update watch" action)
    SendSnapshot,
}

/// A control request aimed at one device's agent
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetLight { on: bool },
    SetMode { mode_24h: bool },
    SetBrightness { level: u8 },
    Reset,
    SwitchWorld,
    AdvanceForecast,
}

/// Incoming device description
#[derive(Debug, Deserialize)]
pub struct DeviceDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub app_type: String,
    #[serde(default)]
    pub watch_supported: bool,
}

impl DeviceDraft {
    pub fn into_device(self) -> Device {
        Device {
            name: self.name,
            code: self.code,
            app_type: AppType::from_str(&self.app_type),
            watch_supported: self.watch_supported,
            ..Device::new()
        }
    }
}

/// Read-side projection of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub code: String,
    pub app_type: String,
    pub watch_supported: bool,
    pub installed: bool,
}

pub fn summarize(devices: &[Device]) -> Vec<DeviceSummary> {
    devices
        .iter()
        .map(|d| DeviceSummary {
            name: d.name.clone(),
            code: d.code.clone(),
            app_type: d.app_type.as_str().to_string(),
            watch_supported: d.watch_supported,
            installed: d.is_installed,
        })
        .collect()
}

#[derive(Clone)]
pub struct ApiState {
    pub events: mpsc::UnboundedSender<ApiEvent>,
    pub devices: Arc<RwLock<Vec<DeviceSummary>>>,
}

#[derive(Debug, Deserialize)]
pub struct ContextUpdate {
    pub info: String,
}

pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/context", post(receive_context))
        .route("/devices", get(list_devices))
        .route("/devices", post(add_device))
        .route("/devices/:index", delete(remove_device))
        .route("/devices/:index/move", post(move_device))
        .route("/devices/:index/toggle", post(toggle_install))
        .route("/devices/:index/command", post(send_command))
        .route("/sync", post(send_snapshot))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn accepted() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "accepted" }))
}

async fn receive_context(
    State(state): State<ApiState>,
    Json(update): Json<ContextUpdate>,
) -> Json<serde_json::Value> {
    let _ = state.events.send(ApiEvent::Context(update.info));
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_devices(State(state): State<ApiState>) -> Json<Vec<DeviceSummary>> {
    Json(state.devices.read().await.clone())
}

async fn add_device(
    State(state): State<ApiState>,
    Json(draft): Json<DeviceDraft>,
) -> Json<serde_json::Value> {
    let _ = state.events.send(ApiEvent::AddDevice(draft));
    accepted()
}

async fn remove_device(
    State(state): State<ApiState>,
    Path(index): Path<usize>,
) -> Json<serde_json::Value> {
    let _ = state.events.send(ApiEvent::RemoveDevice(index));
    accepted()
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub to: usize,
}

async fn move_device(
    State(state): State<ApiState>,
    Path(index): Path<usize>,
    Json(request): Json<MoveRequest>,
) -> Json<serde_json::Value> {
    let _ = state.events.send(ApiEvent::MoveDevice {
        from: index,
        to: request.to,
    });
    accepted()
}

async fn send_command(
    State(state): State<ApiState>,
    Path(index): Path<usize>,
    Json(command): Json<DeviceCommand>,
) -> Json<serde_json::Value> {
    let _ = state.events.send(ApiEvent::Command(index, command));
    accepted()
}

async fn toggle_install(
    State(state): State<ApiState>,
    Path(index): Path<usize>,
) -> Json<serde_json::Value> {
    let _ = state.events.send(ApiEvent::ToggleInstall(index));
    accepted()
}

async fn send_snapshot(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let _ = state.events.send(ApiEvent::SendSnapshot);
    accepted()
}
