//! Agent wire formats: legacy positional string and current JSON object

use serde_json::{json, Value};

use crate::error::CompanionError;

/// Acknowledgement bodies some agent endpoints return instead of a state payload
const NON_STATE_REPLIES: [&str; 3] = ["OK", "No handler", "Not Found\n"];

const LEGACY_FIELD_COUNT: usize = 10;

/// The ten semantic fields of the legacy positional state string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacySettings {
    pub mode_24h: bool,
    pub bst: bool,
    pub colon_flash: bool,
    pub colon_on: bool,
    pub brightness: u8,
    pub world_enabled: bool,
    /// Raw wire value 0-24; the UTC offset is this minus 12
    pub world_offset: u8,
    pub display_on: bool,
    pub connected: bool,
    pub debug: bool,
}

impl LegacySettings {
    pub fn utc_offset_hours(&self) -> i8 {
        self.world_offset as i8 - 12
    }
}

/// Decode the legacy positional string. Returns `Ok(None)` for the known
/// non-state acknowledgements; any malformed state string fails closed with no
/// partial result.
pub fn decode_legacy(input: &str) -> Result<Option<LegacySettings>, CompanionError> {
    if NON_STATE_REPLIES.contains(&input) {
        return Ok(None);
    }

    let fields: Vec<&str> = input.trim_end_matches('\n').split('.').collect();
    if fields.len() != LEGACY_FIELD_COUNT {
        return Err(CompanionError::Protocol(format!(
            "state string has {} fields, expected {}",
            fields.len(),
            LEGACY_FIELD_COUNT
        )));
    }

    let number = |index: usize| -> Result<u8, CompanionError> {
        fields[index].parse::<u8>().map_err(|_| {
            CompanionError::Protocol(format!(
                "state field {} is not numeric: {:?}",
                index, fields[index]
            ))
        })
    };
    let flag = |index: usize| -> Result<bool, CompanionError> { Ok(number(index)? != 0) };

    Ok(Some(LegacySettings {
        mode_24h: flag(0)?,
        bst: flag(1)?,
        colon_flash: flag(2)?,
        colon_on: flag(3)?,
        brightness: number(4)?,
        world_enabled: flag(5)?,
        world_offset: number(6)?,
        display_on: flag(7)?,
        // 'd' means disconnected; any other value means connected
        connected: fields[8] != "d",
        debug: flag(9)?,
    }))
}

/// Re-serialize the ten semantic fields in wire order
pub fn encode_legacy(settings: &LegacySettings) -> String {
    let bit = |b: bool| if b { "1" } else { "0" };
    format!(
        "{}.{}.{}.{}.{}.{}.{}.{}.{}.{}",
        bit(settings.mode_24h),
        bit(settings.bst),
        bit(settings.colon_flash),
        bit(settings.colon_on),
        settings.brightness,
        bit(settings.world_enabled),
        settings.world_offset,
        bit(settings.display_on),
        if settings.connected { "c" } else { "d" },
        bit(settings.debug),
    )
}

/// Current JSON settings object. Every field is optional: agents only send the
/// keys their device class carries, and a missing key leaves the corresponding
/// domain state unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AgentSettings {
    pub is_connected: Option<bool>,
    pub display_on: Option<bool>,
    pub mode_24h: Option<bool>,
    pub brightness: Option<f64>,
    pub world_utc: Option<bool>,
    pub is_powered: Option<bool>,
}

/// Domain-side device state the settings merge into
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceState {
    pub connected: bool,
    pub display_on: bool,
    pub mode_24h: bool,
    pub brightness: f64,
    pub world_utc: bool,
    pub powered: bool,
}

impl AgentSettings {
    pub fn apply_to(&self, state: &mut DeviceState) {
        if let Some(v) = self.is_connected {
            state.connected = v;
        }
        if let Some(v) = self.display_on {
            state.display_on = v;
        }
        if let Some(v) = self.mode_24h {
            state.mode_24h = v;
        }
        if let Some(v) = self.brightness {
            state.brightness = v;
        }
        if let Some(v) = self.world_utc {
            state.world_utc = v;
        }
        if let Some(v) = self.is_powered {
            state.powered = v;
        }
    }
}

/// Decode a JSON settings response. An `"error"` member is surfaced verbatim;
/// anything that is not a JSON object fails closed.
pub fn decode_settings(body: &[u8]) -> Result<AgentSettings, CompanionError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| CompanionError::Protocol("Settings JSON is invalid".to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| CompanionError::Protocol("Settings JSON is invalid".to_string()))?;

    if let Some(error) = object.get("error") {
        let message = error
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        return Err(CompanionError::Protocol(message));
    }

    Ok(AgentSettings {
        is_connected: object.get("isconnected").and_then(Value::as_bool),
        display_on: object.get("on").and_then(Value::as_bool),
        mode_24h: object.get("mode").and_then(Value::as_bool),
        brightness: object.get("bright").and_then(Value::as_f64),
        world_utc: object
            .get("world")
            .and_then(|w| w.get("utc"))
            .and_then(Value::as_bool),
        is_powered: object.get("ispowered").and_then(Value::as_bool),
    })
}

// Command payloads. The legacy set* endpoints expect string-valued keys.

pub fn set_light(on: bool) -> Value {
    json!({ "setlight": if on { "1" } else { "0" } })
}

pub fn set_mode_24h(is_24h: bool) -> Value {
    json!({ "setmode": if is_24h { "1" } else { "0" } })
}

pub fn set_brightness(level: u8) -> Value {
    json!({ "setbright": level.to_string() })
}

pub fn reset() -> Value {
    json!({ "action": "reset" })
}

pub fn switch_world() -> Value {
    json!({ "action": "world" })
}

pub fn advance_forecast() -> Value {
    json!({ "advance": "advance" })
}
