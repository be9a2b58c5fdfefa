//! Correlated concurrent request handling against per-device agent endpoints

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use url::Url;

use crate::error::CompanionError;

/// Correlation handle distinguishing one outstanding request from another
pub type ConnectionId = u64;

/// Default endpoint when the caller does not name one: the device-state path
const DEFAULT_STATE_PATH: &str = "/settings";

/// Which logical operation a request serves; completions are dispatched by it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCode {
    GetSettings,
    Reset,
    SwitchWorld,
    Other,
}

/// One outstanding transfer. At most one record exists per id, and every
/// record is removed exactly once: error path, success path, or bulk teardown.
struct ConnectionRecord {
    id: ConnectionId,
    action: ActionCode,
    buffer: Vec<u8>,
    http_error_code: i32,
    cancelled: bool,
    task: Option<JoinHandle<()>>,
}

/// Completion delivered to the single event loop
#[derive(Debug)]
pub enum ConnectionEvent {
    Completed {
        id: ConnectionId,
        action: ActionCode,
        body: Vec<u8>,
        http_status: i32,
    },
    Failed {
        id: ConnectionId,
        action: ActionCode,
        error: CompanionError,
    },
}

type Records = Arc<RwLock<HashMap<ConnectionId, ConnectionRecord>>>;

pub struct ConnectionManager {
    base_url: String,
    timeout: Duration,
    client: OnceLock<reqwest::Client>,
    records: Records,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            base_url,
            timeout,
            client: OnceLock::new(),
            records: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// The transport session is created once, on first use, and reused for
    /// every subsequent request from this owner.
    fn client(&self) -> Result<reqwest::Client, CompanionError> {
        if let Some(client) = self.client.get() {
            return Ok(client.clone());
        }
        let built = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| {
                CompanionError::Transport(format!("could not create transport session: {}", e))
            })?;
        Ok(self.client.get_or_init(|| built).clone())
    }

    /// Open a correlated request against `base + device_code + path`. A JSON
    /// payload makes it a POST, otherwise a GET. URL and encoding failures
    /// abort before any request is issued.
    pub async fn open(
        &self,
        device_code: &str,
        path: Option<&str>,
        payload: Option<&serde_json::Value>,
        action: ActionCode,
    ) -> Result<ConnectionId, CompanionError> {
        let endpoint = format!(
            "{}{}{}",
            self.base_url,
            device_code,
            path.unwrap_or(DEFAULT_STATE_PATH)
        );
        let url = Url::parse(&endpoint)
            .map_err(|e| CompanionError::UrlConstruction(format!("{}: {}", endpoint, e)))?;

        let body = match payload {
            Some(value) => Some(
                serde_json::to_vec(value).map_err(|e| CompanionError::Encoding(e.to_string()))?,
            ),
            None => None,
        };

        let client = self.client()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut records = self.records.write().await;
            records.insert(
                id,
                ConnectionRecord {
                    id,
                    action,
                    buffer: Vec::new(),
                    http_error_code: -1,
                    cancelled: false,
                    task: None,
                },
            );
        }

        let records = Arc::clone(&self.records);
        let events = self.events.clone();
        let handle = tokio::spawn(Self::run_transfer(client, url, body, id, action, records, events));

        // The transfer may already have finished and removed its record
        if let Some(record) = self.records.write().await.get_mut(&id) {
            record.task = Some(handle);
        }

        tracing::debug!(
            "[ConnectionManager] Opened connection {} ({:?} {})",
            id,
            action,
            endpoint
        );
        Ok(id)
    }

    async fn run_transfer(
        client: reqwest::Client,
        url: Url,
        body: Option<Vec<u8>>,
        id: ConnectionId,
        action: ActionCode,
        records: Records,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let result = Self::stream_response(client, url, body, id, &records).await;

        // Take the record out; a cancel may already have removed it, in which
        // case no completion fires.
        let record = { records.write().await.remove(&id) };
        let Some(record) = record else { return };

        match result {
            Ok(()) => {
                let _ = events.send(ConnectionEvent::Completed {
                    id,
                    action,
                    body: record.buffer,
                    http_status: record.http_error_code,
                });
            }
            Err(error) => {
                let _ = events.send(ConnectionEvent::Failed { id, action, error });
            }
        }
    }

    async fn stream_response(
        client: reqwest::Client,
        url: Url,
        body: Option<Vec<u8>>,
        id: ConnectionId,
        records: &Records,
    ) -> Result<(), CompanionError> {
        let request = match body {
            Some(bytes) => client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(bytes),
            None => client.get(url),
        };

        let mut response = request
            .send()
            .await
            .map_err(|e| CompanionError::Transport(e.to_string()))?;

        let status = i32::from(response.status().as_u16());
        if status >= 400 {
            if let Some(record) = records.write().await.get_mut(&id) {
                record.http_error_code = status;
                if status == 404 {
                    // Agent is relocating for a production shift: drop the
                    // transfer before any body bytes are delivered
                    record.cancelled = true;
                }
            }
            if status == 404 {
                return Err(CompanionError::Transport(
                    "agent relocating (HTTP 404)".to_string(),
                ));
            }
        }

        // Append each chunk to this record's buffer, matched by handle so
        // concurrent transfers for the same device never cross-contaminate
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CompanionError::Transport(e.to_string()))?
        {
            let mut map = records.write().await;
            match map.get_mut(&id) {
                Some(record) if !record.cancelled => record.buffer.extend_from_slice(&chunk),
                _ => {
                    return Err(CompanionError::Transport(
                        "connection cancelled".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Cancel one outstanding request; its completion never fires.
    pub async fn cancel(&self, id: ConnectionId) {
        let record = self.records.write().await.remove(&id);
        if let Some(record) = record {
            if let Some(task) = record.task {
                task.abort();
            }
            tracing::debug!("[ConnectionManager] Cancelled connection {}", record.id);
        }
    }

    /// Bulk teardown when the owning session goes inactive: cancels every
    /// outstanding record and clears the set.
    pub async fn cancel_all(&self) {
        let drained: Vec<ConnectionRecord> = {
            let mut records = self.records.write().await;
            records.drain().map(|(_, record)| record).collect()
        };
        let count = drained.len();
        for record in drained {
            if let Some(task) = record.task {
                task.abort();
            }
            tracing::debug!("[ConnectionManager] Cancelled connection {}", record.id);
        }
        if count > 0 {
            tracing::info!("[ConnectionManager] Cancelled {} outstanding connections", count);
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::Router;

    async fn spawn_agent_stub() -> String {
        let app = Router::new()
            .route(
                "/:code/settings",
                get(|| async { "1.1.1.1.05.1.12.1.d.0" }),
            )
            .route(
                "/:code/other",
                get(|Path(code): Path<String>| async move { format!("other-body-{}", code) }),
            )
            .route(
                "/:code/missing",
                get(|| async { (StatusCode::NOT_FOUND, "agent relocating") }),
            )
            .route(
                "/:code/broken",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "agent exploded") }),
            )
            .route(
                "/:code/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "slow-body"
                }),
            )
            .route("/:code/action", post(|body: String| async move { body }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn manager(
        base: &str,
    ) -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionManager::new(base, Duration::from_secs(5), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_concurrent_connections_complete_independently() {
        let base = spawn_agent_stub().await;
        let (manager, mut events) = manager(&base);

        let first = manager
            .open("abc123", None, None, ActionCode::GetSettings)
            .await
            .unwrap();
        let second = manager
            .open("abc123", Some("/other"), None, ActionCode::Other)
            .await
            .unwrap();
        assert_ne!(first, second);

        let mut bodies: HashMap<ConnectionId, String> = HashMap::new();
        for _ in 0..2 {
            match events.recv().await.unwrap() {
                ConnectionEvent::Completed { id, body, http_status, .. } => {
                    assert_eq!(http_status, -1);
                    bodies.insert(id, String::from_utf8(body).unwrap());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert_eq!(bodies[&first], "1.1.1.1.05.1.12.1.d.0");
        assert_eq!(bodies[&second], "other-body-abc123");
        assert_eq!(manager.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_404_is_cancelled_before_body_delivery() {
        let base = spawn_agent_stub().await;
        let (manager, mut events) = manager(&base);

        manager
            .open("abc123", Some("/missing"), None, ActionCode::GetSettings)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ConnectionEvent::Failed { error, .. } => {
                assert!(matches!(error, CompanionError::Transport(_)));
            }
            other => panic!("404 must not deliver a body: {:?}", other),
        }
        assert_eq!(manager.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_server_error_records_status_and_delivers_body() {
        let base = spawn_agent_stub().await;
        let (manager, mut events) = manager(&base);

        manager
            .open("abc123", Some("/broken"), None, ActionCode::GetSettings)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ConnectionEvent::Completed { body, http_status, .. } => {
                assert_eq!(http_status, 500);
                assert_eq!(String::from_utf8(body).unwrap(), "agent exploded");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_one_leaves_the_other_in_flight() {
        let base = spawn_agent_stub().await;
        let (manager, mut events) = manager(&base);

        let cancelled = manager
            .open("abc123", Some("/slow"), None, ActionCode::Other)
            .await
            .unwrap();
        let surviving = manager
            .open("def456", Some("/other"), None, ActionCode::Other)
            .await
            .unwrap();

        manager.cancel(cancelled).await;

        match events.recv().await.unwrap() {
            ConnectionEvent::Completed { id, body, .. } => {
                assert_eq!(id, surviving);
                assert_eq!(String::from_utf8(body).unwrap(), "other-body-def456");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(manager.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_post_payload_round_trip() {
        let base = spawn_agent_stub().await;
        let (manager, mut events) = manager(&base);

        let payload = serde_json::json!({ "action": "reset" });
        manager
            .open("abc123", Some("/action"), Some(&payload), ActionCode::Reset)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ConnectionEvent::Completed { action, body, .. } => {
                assert_eq!(action, ActionCode::Reset);
                let echoed: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(echoed, payload);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_base_url_fails_before_issue() {
        let (manager, mut events) = manager("agent.local/");

        let result = manager
            .open("abc123", None, None, ActionCode::GetSettings)
            .await;
        assert!(matches!(result, Err(CompanionError::UrlConstruction(_))));
        assert_eq!(manager.outstanding().await, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_all_suppresses_completions() {
        let base = spawn_agent_stub().await;
        let (manager, mut events) = manager(&base);

        manager
            .open("abc123", Some("/slow"), None, ActionCode::Other)
            .await
            .unwrap();
        manager
            .open("def456", Some("/slow"), None, ActionCode::Other)
            .await
            .unwrap();
        assert_eq!(manager.outstanding().await, 2);

        manager.cancel_all().await;
        assert_eq!(manager.outstanding().await, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
    }
}
