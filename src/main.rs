//! imp-companion - headless companion controller for Electric Imp devices
//!
//! Drives per-device cloud agents over HTTP and keeps a paired peer's device
//! list synchronized through an asynchronous context channel.

mod agent;
mod api;
mod config;
mod device;
mod error;
mod store;
mod sync;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::agent::codec::{self, DeviceState};
use crate::agent::{ActionCode, ConnectionEvent, ConnectionId, ConnectionManager};
use crate::api::{ApiEvent, ApiState, DeviceCommand, DeviceSummary};
use crate::store::DeviceStore;
use crate::sync::channel::{ContextChannel, HttpContextChannel, UnpairedChannel};
use crate::sync::{SyncBridge, SyncOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imp_companion=info,tower_http=info".into()),
        )
        .init();

    tracing::info!("Starting imp-companion...");

    let config = config::Config::load()?;
    tracing::info!("Configuration loaded");

    // A load failure is non-fatal: the stored file is left untouched for
    // forensic retry and we start with an empty list
    let mut store = match DeviceStore::load(&config.storage.data_dir) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!("Could not load device list, starting empty: {}", e);
            DeviceStore::new(&config.storage.data_dir)
        }
    };

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
    let connections = Arc::new(ConnectionManager::new(
        &config.agent.base_url,
        Duration::from_secs(config.agent.request_timeout_secs),
        conn_tx,
    ));

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<SyncOutcome>();
    let channel: Arc<dyn ContextChannel> = match &config.peer.context_url {
        Some(url) => {
            tracing::info!("Paired with peer at {}", url);
            Arc::new(HttpContextChannel::new(url))
        }
        None => {
            tracing::warn!("No peer configured; install toggles will roll back");
            Arc::new(UnpairedChannel)
        }
    };
    let mut bridge = SyncBridge::new(channel, outcome_tx);

    let (api_tx, mut api_rx) = mpsc::unbounded_channel::<ApiEvent>();
    let device_view: Arc<RwLock<Vec<DeviceSummary>>> =
        Arc::new(RwLock::new(api::summarize(store.devices())));
    let api_state = ApiState {
        events: api_tx,
        devices: device_view.clone(),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Peer surface listening on {}", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::routes(api_state)).await {
            tracing::error!("Peer surface failed: {}", e);
        }
    });

    let mut refresh = tokio::time::interval(Duration::from_secs(config.agent.refresh_secs));
    let mut last_poll: Option<ConnectionId> = None;
    let mut current_state = DeviceState::default();

    // Single consumer for all shared-state mutation: every completion funnels
    // back here before it touches the list or install state
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down ({} connections outstanding)", connections.outstanding().await);
                connections.cancel_all().await;
                if let Err(e) = store.save() {
                    tracing::warn!("Device list save failed: {}", e);
                }
                break;
            }
            _ = refresh.tick() => {
                last_poll = poll_current_device(&connections, &store, last_poll.take()).await;
            }
            Some(event) = conn_rx.recv() => {
                handle_connection_event(event, &mut current_state);
            }
            Some(outcome) = outcome_rx.recv() => {
                match bridge.resolve_send(&mut store, outcome) {
                    Ok(resolved) => {
                        if resolved > 0 {
                            if let Err(e) = store.save() {
                                tracing::warn!("Device list save failed: {}", e);
                            }
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Sync failed, pending installs rolled back, retry available: {}", e);
                    }
                    Err(e) => {
                        tracing::warn!("Sync failed, pending installs rolled back: {}", e);
                    }
                }
                *device_view.write().await = api::summarize(store.devices());
            }
            Some(event) = api_rx.recv() => {
                handle_api_event(&mut store, &mut bridge, &connections, event).await;
                *device_view.write().await = api::summarize(store.devices());
            }
        }
    }

    Ok(())
}

/// Ask the current device's agent for its settings. A poll still outstanding
/// from the previous window is superseded, not doubled up. Failures surface as
/// a logged offline indicator; the next refresh tick is the retry.
async fn poll_current_device(
    connections: &ConnectionManager,
    store: &DeviceStore,
    previous: Option<ConnectionId>,
) -> Option<ConnectionId> {
    if let Some(id) = previous {
        connections.cancel(id).await;
    }

    let index = store.current_device();
    if index < 0 {
        return None;
    }
    let device = store.devices().get(index as usize)?;
    if device.code.is_empty() {
        return None;
    }

    match connections
        .open(&device.code, None, None, ActionCode::GetSettings)
        .await
    {
        Ok(id) => {
            tracing::debug!(
                "[Poller] GetSettings opened for {} (connection {})",
                device.name,
                id
            );
            Some(id)
        }
        Err(e) => {
            tracing::warn!("[Poller] Could not query {}: {}", device.name, e);
            None
        }
    }
}

fn handle_connection_event(event: ConnectionEvent, current_state: &mut DeviceState) {
    match event {
        ConnectionEvent::Completed {
            id,
            action,
            body,
            http_status,
        } => {
            if http_status >= 400 {
                tracing::warn!("[Poller] Agent replied {} on connection {}", http_status, id);
                return;
            }
            if action != ActionCode::GetSettings {
                return;
            }

            // Agents answer with either wire format depending on firmware age
            match codec::decode_settings(&body) {
                Ok(settings) => {
                    settings.apply_to(current_state);
                    tracing::info!("[Poller] Device state: {:?}", current_state);
                }
                Err(_) => {
                    let text = String::from_utf8_lossy(&body);
                    match codec::decode_legacy(&text) {
                        Ok(Some(legacy)) => {
                            current_state.connected = legacy.connected;
                            current_state.display_on = legacy.display_on;
                            current_state.mode_24h = legacy.mode_24h;
                            current_state.brightness = f64::from(legacy.brightness);
                            current_state.world_utc = legacy.world_enabled;
                            tracing::info!(
                                "[Poller] Device state: {} (UTC offset {})",
                                codec::encode_legacy(&legacy),
                                legacy.utc_offset_hours()
                            );
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(
                            "[Poller] Bad agent response on connection {}: {}",
                            id,
                            e
                        ),
                    }
                }
            }
        }
        ConnectionEvent::Failed { id, error, .. } => {
            // Device offline indicator; no built-in retry
            tracing::warn!("[Poller] Connection {} failed: {}", id, error);
        }
    }
}

async fn handle_api_event(
    store: &mut DeviceStore,
    bridge: &mut SyncBridge,
    connections: &ConnectionManager,
    event: ApiEvent,
) {
    match event {
        ApiEvent::Context(value) => match bridge.receive(store, &value) {
            Ok(true) => tracing::info!("Peer context applied ({} devices)", store.len()),
            Ok(false) => {}
            // The replacement is already in memory; only the persist failed
            Err(e) => tracing::warn!("Peer context applied but not persisted: {}", e),
        },
        ApiEvent::AddDevice(draft) => {
            store.add(draft.into_device());
            if store.current_device() < 0 {
                store.set_current_device(store.len() as i64 - 1);
            }
            if let Err(e) = store.save() {
                tracing::warn!("Device list save failed: {}", e);
            }
        }
        ApiEvent::RemoveDevice(index) => {
            if store.remove_at(index).is_some() {
                if store.current_device() >= store.len() as i64 {
                    store.set_current_device(store.len() as i64 - 1);
                }
                if let Err(e) = store.save() {
                    tracing::warn!("Device list save failed: {}", e);
                }
            }
        }
        ApiEvent::MoveDevice { from, to } => {
            store.move_device(from, to);
            if let Err(e) = store.save() {
                tracing::warn!("Device list save failed: {}", e);
            }
        }
        ApiEvent::Command(index, command) => {
            let Some(device) = store.devices().get(index) else {
                tracing::warn!("Command aimed at unknown device {}", index);
                return;
            };
            let (payload, action) = match command {
                DeviceCommand::SetLight { on } => (codec::set_light(on), ActionCode::Other),
                DeviceCommand::SetMode { mode_24h } => {
                    (codec::set_mode_24h(mode_24h), ActionCode::Other)
                }
                DeviceCommand::SetBrightness { level } => {
                    (codec::set_brightness(level), ActionCode::Other)
                }
                DeviceCommand::Reset => (codec::reset(), ActionCode::Reset),
                DeviceCommand::SwitchWorld => (codec::switch_world(), ActionCode::SwitchWorld),
                DeviceCommand::AdvanceForecast => (codec::advance_forecast(), ActionCode::Other),
            };
            if let Err(e) = connections
                .open(&device.code, None, Some(&payload), action)
                .await
            {
                tracing::warn!("Command to {} failed to issue: {}", device.name, e);
            }
        }
        ApiEvent::ToggleInstall(index) => {
            if !bridge.toggle_install(store, index) {
                tracing::debug!("Install toggle ignored for device {}", index);
            }
        }
        ApiEvent::SendSnapshot => {
            bridge.send(store);
        }
    }
}
