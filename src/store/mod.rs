//! Durable, ordered device collection with forward-only format migration

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::{AppType, Device, DeviceList};
use crate::error::CompanionError;

const CURRENT_FILE: &str = "devices.json";
const CURRENT_VERSION: u32 = 3;

/// On-disk document for the current format
#[derive(Debug, Serialize, Deserialize)]
struct StoredList {
    version: u32,
    current_device: i64,
    devices: Vec<Device>,
}

/// One entry in the legacy migration table: the file that identifies the
/// format, and the loader that reads it.
struct Migration {
    tag: &'static str,
    file: &'static str,
    load: fn(&str) -> Result<DeviceList, CompanionError>,
}

/// Probed in order, newest encoding first
const MIGRATIONS: &[Migration] = &[
    Migration {
        tag: "v2",
        file: "devices.dat",
        load: load_legacy_v2,
    },
    Migration {
        tag: "v1",
        file: "devices.list",
        load: load_legacy_v1,
    },
];

/// Legacy v2: untagged JSON with abbreviated field names, no install state
#[derive(Debug, Deserialize)]
struct V2List {
    current: i64,
    devices: Vec<V2Device>,
}

#[derive(Debug, Deserialize)]
struct V2Device {
    n: String,
    c: String,
    a: String,
    w: bool,
    #[serde(default)]
    i: bool,
}

fn load_legacy_v2(text: &str) -> Result<DeviceList, CompanionError> {
    let parsed: V2List = serde_json::from_str(text)
        .map_err(|e| CompanionError::Persistence(format!("legacy v2 decode failed: {}", e)))?;

    let devices = parsed
        .devices
        .into_iter()
        .map(|d| Device {
            name: d.n,
            code: d.c,
            app_type: AppType::from_str(&d.a),
            watch_supported: d.w,
            is_installed: d.i,
            ..Device::new()
        })
        .collect();

    Ok(DeviceList {
        devices,
        current_device: parsed.current,
    })
}

/// Legacy v1: line format. First line is the current index, then one device
/// per line as tab-separated `name, code, app, watch-flag`.
fn load_legacy_v1(text: &str) -> Result<DeviceList, CompanionError> {
    let mut lines = text.lines();
    let current_device = lines
        .next()
        .unwrap_or("-1")
        .trim()
        .parse::<i64>()
        .map_err(|e| CompanionError::Persistence(format!("legacy v1 index: {}", e)))?;

    let mut devices = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 4 {
            return Err(CompanionError::Persistence(format!(
                "legacy v1 record has {} fields, expected 4",
                fields.len()
            )));
        }
        devices.push(Device {
            name: fields[0].to_string(),
            code: fields[1].to_string(),
            app_type: AppType::from_str(fields[2]),
            watch_supported: fields[3] == "1",
            ..Device::new()
        });
    }

    Ok(DeviceList {
        devices,
        current_device,
    })
}

/// The durable device collection. Single logical owner: all mutation happens on
/// the event loop through an explicit `&mut` handle.
pub struct DeviceStore {
    data_dir: PathBuf,
    list: DeviceList,
    generation: u64,
}

impl DeviceStore {
    /// Empty store rooted at `data_dir`; nothing is read from disk.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            list: DeviceList::default(),
            generation: 0,
        }
    }

    /// Read the stored list, migrating a legacy encoding forward if that is all
    /// that exists on disk. No file in any known format means an empty store.
    pub fn load(data_dir: impl Into<PathBuf>) -> Result<Self, CompanionError> {
        let data_dir = data_dir.into();

        let current = data_dir.join(CURRENT_FILE);
        if current.exists() {
            let text = fs::read_to_string(&current)
                .map_err(|e| CompanionError::Persistence(format!("read {}: {}", CURRENT_FILE, e)))?;
            let stored: StoredList = serde_json::from_str(&text)
                .map_err(|e| CompanionError::Persistence(format!("decode {}: {}", CURRENT_FILE, e)))?;
            if stored.version > CURRENT_VERSION {
                return Err(CompanionError::Persistence(format!(
                    "device file version {} is newer than supported {}",
                    stored.version, CURRENT_VERSION
                )));
            }
            let store = Self {
                data_dir,
                list: DeviceList {
                    devices: stored.devices,
                    current_device: stored.current_device,
                },
                generation: 0,
            };
            tracing::info!(
                "[DeviceStore] Device list loaded ({} devices, {} installed)",
                store.len(),
                store.installed_count()
            );
            return Ok(store);
        }

        for migration in MIGRATIONS {
            let path = data_dir.join(migration.file);
            if !path.exists() {
                continue;
            }
            let text = fs::read_to_string(&path)
                .map_err(|e| CompanionError::Persistence(format!("read {}: {}", migration.file, e)))?;
            let list = (migration.load)(&text)?;

            let mut store = Self {
                data_dir,
                list,
                generation: 0,
            };

            // Re-save in the current encoding, then drop the legacy file.
            // Deletion failure is logged, not fatal.
            store.save()?;
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(
                    "[DeviceStore] Could not delete legacy {} file {}: {}",
                    migration.tag,
                    path.display(),
                    e
                );
            }
            tracing::info!(
                "[DeviceStore] Migrated {} legacy format ({} devices)",
                migration.tag,
                store.len()
            );
            return Ok(store);
        }

        Ok(Self::new(data_dir))
    }

    /// Prune placeholders, then write the full ordered list plus the current
    /// index. A write failure leaves the in-memory list intact.
    pub fn save(&mut self) -> Result<(), CompanionError> {
        self.prune_empty();

        let stored = StoredList {
            version: CURRENT_VERSION,
            current_device: self.list.current_device,
            devices: self.list.devices.clone(),
        };
        let text = serde_json::to_string_pretty(&stored)
            .map_err(|e| CompanionError::Persistence(format!("encode {}: {}", CURRENT_FILE, e)))?;

        fs::create_dir_all(&self.data_dir)
            .map_err(|e| CompanionError::Persistence(format!("create data dir: {}", e)))?;
        fs::write(self.data_dir.join(CURRENT_FILE), text)
            .map_err(|e| CompanionError::Persistence(format!("write {}: {}", CURRENT_FILE, e)))?;

        tracing::info!(
            "[DeviceStore] Device list saved ({} devices, {} installed)",
            self.len(),
            self.installed_count()
        );
        Ok(())
    }

    pub fn devices(&self) -> &[Device] {
        &self.list.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.list.devices
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut Device> {
        self.list.devices.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.list.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.devices.is_empty()
    }

    pub fn installed_count(&self) -> usize {
        self.list.devices.iter().filter(|d| d.is_installed).count()
    }

    pub fn current_device(&self) -> i64 {
        self.list.current_device
    }

    pub fn set_current_device(&mut self, index: i64) {
        self.list.current_device = index;
    }

    pub fn add(&mut self, device: Device) {
        self.list.devices.push(device);
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Device> {
        if index >= self.list.devices.len() {
            return None;
        }
        Some(self.list.devices.remove(index))
    }

    /// Reorder while preserving every other record's relative position
    pub fn move_device(&mut self, from: usize, to: usize) {
        if from >= self.list.devices.len() || to >= self.list.devices.len() {
            return;
        }
        let device = self.list.devices.remove(from);
        self.list.devices.insert(to, device);
    }

    /// Replace the whole list (peer sync receive). Bumps the generation so any
    /// in-flight send resolution taken against the old list is dropped.
    pub fn replace_all(&mut self, devices: Vec<Device>) {
        self.list.devices = devices;
        self.generation += 1;
    }

    /// Remove transient all-blank records
    pub fn prune_empty(&mut self) {
        self.list.devices.retain(|d| !d.is_placeholder());
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
