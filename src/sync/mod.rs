//! Device-list synchronization with the paired companion peer

pub mod channel;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::device::{AppType, Device, InstallState};
use crate::error::CompanionError;
use crate::store::DeviceStore;

use channel::ContextChannel;

/// The single key carried in the peer context map
pub const CONTEXT_KEY: &str = "info";

/// Blob value meaning "empty the remote list"
pub const CLEAR_SENTINEL: &str = "clear";

/// Serialize the watch-eligible subset of the list into the wire blob:
/// fields separated by single line-breaks, records by double line-breaks,
/// trailing double line-break after the last record. An empty subset becomes
/// the clear sentinel.
pub fn serialize_blob(devices: &[Device]) -> String {
    let mut blob = String::new();
    for device in devices {
        if !device.watch_supported {
            continue;
        }
        let eligible = (device.is_installed && device.install_state != InstallState::Removing)
            || device.install_state == InstallState::Installing;
        if !eligible {
            continue;
        }
        blob.push_str(&device.name);
        blob.push('\n');
        blob.push_str(&device.code);
        blob.push('\n');
        blob.push_str(device.app_type.as_str());
        blob.push_str("\n\n");
    }

    if blob.is_empty() {
        CLEAR_SENTINEL.to_string()
    } else {
        blob
    }
}

/// Parse a received blob back into device records, in blob order. Records on
/// the peer are by definition installed, watch-capable devices.
pub fn parse_blob(blob: &str) -> Vec<Device> {
    let mut devices = Vec::new();
    for record in blob.split("\n\n") {
        if record.is_empty() {
            continue;
        }
        let mut fields = record.split('\n');
        let name = fields.next().unwrap_or_default().to_string();
        let code = fields.next().unwrap_or_default().to_string();
        let app = fields.next().unwrap_or_default();
        devices.push(Device {
            name,
            code,
            app_type: AppType::from_str(app),
            watch_supported: true,
            is_installed: true,
            ..Device::new()
        });
    }
    devices
}

/// Outcome of one asynchronous context send, delivered back to the event loop
#[derive(Debug)]
pub struct SyncOutcome {
    /// Store generation at the time the snapshot was taken
    pub generation: u64,
    pub result: Result<(), CompanionError>,
}

/// Keeps the peer's device list consistent with this store's watch-relevant
/// subset and drives the per-device install state machine.
pub struct SyncBridge {
    channel: Arc<dyn ContextChannel>,
    outcomes: mpsc::UnboundedSender<SyncOutcome>,
    /// Last value handed to the channel; "" means never sent
    last_sent: String,
}

impl SyncBridge {
    pub fn new(
        channel: Arc<dyn ContextChannel>,
        outcomes: mpsc::UnboundedSender<SyncOutcome>,
    ) -> Self {
        Self {
            channel,
            outcomes,
            last_sent: String::new(),
        }
    }

    /// Toggle the install control for one device. Devices without watch
    /// support are ignored: no transition, no send. Returns whether a
    /// transition happened.
    pub fn toggle_install(&mut self, store: &mut DeviceStore, index: usize) -> bool {
        let Some(device) = store.devices().get(index) else {
            return false;
        };
        if !device.watch_supported {
            return false;
        }

        let next = if device.is_installed {
            InstallState::Removing
        } else {
            InstallState::Installing
        };
        if let Some(device) = store.device_mut(index) {
            device.install_state = next;
            device.changed = true;
            tracing::info!(
                "[SyncBridge] {} -> {:?}",
                if device.name.is_empty() { &device.code } else { &device.name },
                next
            );
        }

        self.send(store);
        true
    }

    /// Snapshot the store and hand the blob to the peer channel, fire and
    /// forget. The outcome arrives later on the event loop. Sends are snapshot
    /// replacements, so resending identical content is idempotent.
    pub fn send(&mut self, store: &DeviceStore) {
        let blob = serialize_blob(store.devices());
        if blob == self.last_sent {
            tracing::debug!("[SyncBridge] Context unchanged, resending snapshot");
        }
        self.last_sent = blob.clone();

        let generation = store.generation();
        let channel = Arc::clone(&self.channel);
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let result = channel.update_context(CONTEXT_KEY, &blob).await;
            let _ = outcomes.send(SyncOutcome { generation, result });
        });
    }

    /// Resolve a send outcome against the store. Success settles every pending
    /// device in one batch; failure reverts each pending device to its
    /// pre-transition installed flag and surfaces a retryable error. An
    /// outcome taken against a list that a peer receive has since replaced is
    /// dropped outright.
    pub fn resolve_send(
        &mut self,
        store: &mut DeviceStore,
        outcome: SyncOutcome,
    ) -> Result<usize, CompanionError> {
        if outcome.generation != store.generation() {
            tracing::warn!(
                "[SyncBridge] Dropping stale send resolution (generation {}, store at {})",
                outcome.generation,
                store.generation()
            );
            return Ok(0);
        }

        match outcome.result {
            Ok(()) => {
                let mut resolved = 0;
                for device in store.devices_mut() {
                    match device.install_state {
                        InstallState::Installing => {
                            device.install_state = InstallState::None;
                            device.is_installed = true;
                            resolved += 1;
                        }
                        InstallState::Removing => {
                            device.install_state = InstallState::None;
                            device.is_installed = false;
                            resolved += 1;
                        }
                        InstallState::None => {}
                    }
                }
                if resolved > 0 {
                    tracing::info!("[SyncBridge] Resolved {} pending devices", resolved);
                }
                Ok(resolved)
            }
            Err(error) => {
                let mut reverted = 0;
                for device in store.devices_mut() {
                    match device.install_state {
                        InstallState::Installing => {
                            device.install_state = InstallState::None;
                            device.is_installed = false;
                            reverted += 1;
                        }
                        InstallState::Removing => {
                            device.install_state = InstallState::None;
                            device.is_installed = true;
                            reverted += 1;
                        }
                        InstallState::None => {}
                    }
                }
                tracing::warn!(
                    "[SyncBridge] Send failed, rolled back {} pending devices: {}",
                    reverted,
                    error
                );
                Err(error)
            }
        }
    }

    /// Apply a context value received from the peer. An empty value is the
    /// never-sent state and changes nothing; the clear sentinel empties the
    /// list; anything else fully replaces it. Replacements are persisted.
    /// Returns whether the list changed. A persist failure is surfaced after
    /// the replacement has already been applied in memory.
    pub fn receive(
        &self,
        store: &mut DeviceStore,
        value: &str,
    ) -> Result<bool, CompanionError> {
        if value.is_empty() {
            return Ok(false);
        }

        if value == CLEAR_SENTINEL {
            store.replace_all(Vec::new());
        } else {
            store.replace_all(parse_blob(value));
        }
        store.save()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Records sends; can be switched to fail
    struct RecordingChannel {
        sends: AtomicUsize,
        fail: AtomicBool,
        last: std::sync::Mutex<Option<String>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                last: std::sync::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ContextChannel for RecordingChannel {
        async fn update_context(&self, key: &str, value: &str) -> Result<(), CompanionError> {
            assert_eq!(key, CONTEXT_KEY);
            self.sends.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(value.to_string());
            if self.fail.load(Ordering::SeqCst) {
                Err(CompanionError::Sync("peer unreachable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn watch_device(name: &str, code: &str, app: AppType, installed: bool) -> Device {
        Device {
            name: name.to_string(),
            code: code.to_string(),
            app_type: app,
            watch_supported: true,
            is_installed: installed,
            ..Device::new()
        }
    }

    fn store_with(devices: Vec<Device>) -> (DeviceStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DeviceStore::new(dir.path());
        for device in devices {
            store.add(device);
        }
        (store, dir)
    }

    #[test]
    fn test_single_installed_device_blob() {
        let devices = vec![watch_device("Kitchen", "abc123", AppType::Weather, true)];
        assert_eq!(serialize_blob(&devices), "Kitchen\nabc123\nweather\n\n");
    }

    #[test]
    fn test_blob_filter_rules() {
        let mut removing = watch_device("Hall", "b", AppType::BigClock, true);
        removing.install_state = InstallState::Removing;
        let mut installing = watch_device("Den", "c", AppType::MatrixClock, false);
        installing.install_state = InstallState::Installing;
        let no_watch = Device {
            name: "Attic".to_string(),
            code: "d".to_string(),
            app_type: AppType::Weather,
            watch_supported: false,
            is_installed: true,
            ..Device::new()
        };
        let not_installed = watch_device("Shed", "e", AppType::Weather, false);

        let devices = vec![
            watch_device("Kitchen", "a", AppType::Weather, true),
            removing,
            installing,
            no_watch,
            not_installed,
        ];

        let blob = serialize_blob(&devices);
        assert_eq!(blob, "Kitchen\na\nweather\n\nDen\nc\nmatrixclock\n\n");
    }

    #[test]
    fn test_empty_subset_serializes_to_clear() {
        assert_eq!(serialize_blob(&[]), CLEAR_SENTINEL);
        let devices = vec![watch_device("Shed", "e", AppType::Weather, false)];
        assert_eq!(serialize_blob(&devices), CLEAR_SENTINEL);
    }

    #[test]
    fn test_parse_reproduces_eligible_subset_in_order() {
        let devices = vec![
            watch_device("Kitchen", "a", AppType::Weather, true),
            watch_device("Hall", "b", AppType::BigClock, true),
            Device {
                watch_supported: false,
                is_installed: true,
                name: "Attic".to_string(),
                code: "x".to_string(),
                app_type: AppType::Weather,
                ..Device::new()
            },
        ];

        let parsed = parse_blob(&serialize_blob(&devices));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "Kitchen");
        assert_eq!(parsed[0].code, "a");
        assert_eq!(parsed[0].app_type, AppType::Weather);
        assert_eq!(parsed[1].name, "Hall");
        assert_eq!(parsed[1].app_type, AppType::BigClock);
        assert!(parsed.iter().all(|d| d.watch_supported && d.is_installed));
    }

    #[tokio::test]
    async fn test_receive_clear_empties_list_idempotently() {
        let channel = RecordingChannel::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = SyncBridge::new(channel, tx);

        let (mut store, _dir) = store_with(vec![
            watch_device("Kitchen", "a", AppType::Weather, true),
            watch_device("Hall", "b", AppType::BigClock, true),
        ]);

        assert!(bridge.receive(&mut store, CLEAR_SENTINEL).unwrap());
        assert!(store.is_empty());
        assert!(bridge.receive(&mut store, CLEAR_SENTINEL).unwrap());
        assert!(store.is_empty());
        assert!(!bridge.receive(&mut store, "").unwrap());
    }

    #[tokio::test]
    async fn test_receive_replaces_whole_list() {
        let channel = RecordingChannel::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = SyncBridge::new(channel, tx);

        let (mut store, _dir) = store_with(vec![watch_device("Old", "zzz", AppType::BigClock, true)]);
        bridge
            .receive(&mut store, "Kitchen\nabc123\nweather\n\n")
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.devices()[0].name, "Kitchen");
        assert_eq!(store.devices()[0].code, "abc123");
    }

    #[tokio::test]
    async fn test_receive_applies_in_memory_even_when_persist_fails() {
        let channel = RecordingChannel::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = SyncBridge::new(channel, tx);

        // A plain file where the data directory should be makes save fail
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "").unwrap();
        let mut store = DeviceStore::new(&blocked);
        store.add(watch_device("Old", "zzz", AppType::BigClock, true));

        let error = bridge
            .receive(&mut store, "Kitchen\nabc123\nweather\n\n")
            .unwrap_err();
        assert!(matches!(error, CompanionError::Persistence(_)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.devices()[0].name, "Kitchen");
    }

    #[tokio::test]
    async fn test_toggle_without_watch_support_is_a_no_op() {
        let channel = RecordingChannel::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut bridge = SyncBridge::new(channel.clone(), tx);

        let (mut store, _dir) = store_with(vec![Device {
            name: "Attic".to_string(),
            code: "x".to_string(),
            app_type: AppType::Weather,
            watch_supported: false,
            ..Device::new()
        }]);

        assert!(!bridge.toggle_install(&mut store, 0));
        assert_eq!(store.devices()[0].install_state, InstallState::None);

        tokio::task::yield_now().await;
        assert_eq!(channel.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_toggle_sends_snapshot_and_success_resolves() {
        let channel = RecordingChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bridge = SyncBridge::new(channel.clone(), tx);

        let (mut store, _dir) = store_with(vec![watch_device("Kitchen", "abc123", AppType::Weather, false)]);

        assert!(bridge.toggle_install(&mut store, 0));
        assert_eq!(store.devices()[0].install_state, InstallState::Installing);

        let outcome = rx.recv().await.unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(
            channel.last.lock().unwrap().as_deref(),
            Some("Kitchen\nabc123\nweather\n\n")
        );

        let resolved = bridge.resolve_send(&mut store, outcome).unwrap();
        assert_eq!(resolved, 1);
        assert_eq!(store.devices()[0].install_state, InstallState::None);
        assert!(store.devices()[0].is_installed);
    }

    #[tokio::test]
    async fn test_failed_install_send_rolls_back() {
        let channel = RecordingChannel::new();
        channel.fail.store(true, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bridge = SyncBridge::new(channel, tx);

        let (mut store, _dir) = store_with(vec![watch_device("Kitchen", "abc123", AppType::Weather, false)]);

        assert!(bridge.toggle_install(&mut store, 0));
        let outcome = rx.recv().await.unwrap();

        let error = bridge.resolve_send(&mut store, outcome).unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(store.devices()[0].install_state, InstallState::None);
        assert!(!store.devices()[0].is_installed);
    }

    #[tokio::test]
    async fn test_failed_remove_send_restores_installed() {
        let channel = RecordingChannel::new();
        channel.fail.store(true, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bridge = SyncBridge::new(channel, tx);

        let (mut store, _dir) = store_with(vec![watch_device("Kitchen", "abc123", AppType::Weather, true)]);

        assert!(bridge.toggle_install(&mut store, 0));
        assert_eq!(store.devices()[0].install_state, InstallState::Removing);

        let outcome = rx.recv().await.unwrap();
        bridge.resolve_send(&mut store, outcome).unwrap_err();
        assert_eq!(store.devices()[0].install_state, InstallState::None);
        assert!(store.devices()[0].is_installed);
    }

    #[tokio::test]
    async fn test_stale_resolution_is_dropped_after_receive() {
        let channel = RecordingChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bridge = SyncBridge::new(channel, tx);

        let (mut store, _dir) = store_with(vec![watch_device("Kitchen", "abc123", AppType::Weather, false)]);
        assert!(bridge.toggle_install(&mut store, 0));
        let outcome = rx.recv().await.unwrap();

        // A peer receive replaces the list before the resolution lands
        bridge
            .receive(&mut store, "Hall\ndef456\nbigclock\n\n")
            .unwrap();

        let resolved = bridge.resolve_send(&mut store, outcome).unwrap();
        assert_eq!(resolved, 0);
        assert_eq!(store.devices()[0].name, "Hall");
        assert_eq!(store.devices()[0].install_state, InstallState::None);
    }
}
