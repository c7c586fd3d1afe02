/*!
 * Wire payload types.
 *
 * Inbound bodies are decoded leniently: a field with an unexpected type is
 * left unset instead of failing the whole object.
 */
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use greennet_core::types::Value;

use crate::device::{Device, DeviceError, EepEntry, Result};

/// One `{key, value}` pair of a function list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Function key, e.g. `switch`
    pub key: String,
    /// Function value
    pub value: Value,
}

impl Function {
    /// Create a function
    pub fn new<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a function whose value is sent as text
    pub fn text<K: Into<String>, V: ToString>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: Value::String(value.to_string()),
        }
    }

    fn from_json(json: &serde_json::Value) -> Option<Self> {
        let key = match json.get("key")? {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let value = json.get("value").and_then(Value::from_json)?;
        Some(Self { key, value })
    }
}

/// Collect functions from any of the shapes the gateway uses: a list of
/// `{key, value}` objects, a single such object, or a `key -> value` map.
pub fn functions_from_json(json: &serde_json::Value) -> Vec<Function> {
    match json {
        serde_json::Value::Array(items) => items.iter().filter_map(Function::from_json).collect(),
        serde_json::Value::Object(map) if map.contains_key("key") => {
            Function::from_json(json).into_iter().collect()
        }
        serde_json::Value::Object(map) => map
            .iter()
            .filter_map(|(key, value)| {
                Value::from_json(value).map(|value| Function {
                    key: key.clone(),
                    value,
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Strip a `telegram` or `device` envelope. Sibling keys next to the
/// envelope are metadata and are dropped with it.
pub fn unwrap_envelope(json: serde_json::Value) -> serde_json::Value {
    match json {
        serde_json::Value::Object(mut map) => {
            for name in ["telegram", "device"] {
                if map.get(name).map_or(false, serde_json::Value::is_object) {
                    if let Some(inner) = map.remove(name) {
                        return inner;
                    }
                }
            }
            serde_json::Value::Object(map)
        }
        other => other,
    }
}

/// Decode a JSON body
pub fn parse_json(topic: &str, payload: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(payload).map_err(|e| DeviceError::malformed(topic, e))
}

/// Signal information attached to a telegram
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TelegramInfo {
    /// Received signal strength
    #[serde(default, deserialize_with = "lenient_i32")]
    pub dbm: Option<i32>,
}

/// A device, telegram or delta object as sent by the gateway
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceObject {
    /// Vendor identifier
    #[serde(default, deserialize_with = "lenient_string")]
    pub device_id: Option<String>,

    /// User-facing identifier
    #[serde(default, deserialize_with = "lenient_string")]
    pub friendly_id: Option<String>,

    /// Equipment profiles
    #[serde(default, deserialize_with = "lenient_eeps")]
    pub eeps: Vec<EepEntry>,

    /// Manufacturer
    #[serde(default, deserialize_with = "lenient_string")]
    pub manufacturer: Option<String>,

    /// Physical device descriptor
    #[serde(default, deserialize_with = "lenient_string")]
    pub physical_device: Option<String>,

    /// First seen
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub first_seen: Option<DateTime<Utc>>,

    /// Last seen
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_seen: Option<DateTime<Utc>>,

    /// Telegram reception time
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Signal strength
    #[serde(default, deserialize_with = "lenient_i32")]
    pub dbm: Option<i32>,

    /// Telegram signal information
    #[serde(default, deserialize_with = "lenient_telegram_info")]
    pub telegram_info: Option<TelegramInfo>,

    /// Function list
    #[serde(default, deserialize_with = "lenient_functions")]
    pub functions: Vec<Function>,

    /// State map or list
    #[serde(default, deserialize_with = "lenient_functions")]
    pub states: Vec<Function>,
}

impl DeviceObject {
    /// Decode an object, unwrapping a `telegram`/`device` envelope.
    ///
    /// `topic_id` is the id segment of the topic the object arrived on. It
    /// is used when the body has no textual `deviceId`, or when a numeric
    /// id lost its formatting on the way through the value parser.
    pub fn from_json(json: serde_json::Value, topic_id: Option<&str>) -> Result<Self> {
        let json = unwrap_envelope(json);
        let textual_id = matches!(json.get("deviceId"), Some(serde_json::Value::String(_)));
        let mut object: DeviceObject = serde_json::from_value(json)?;

        if !textual_id {
            if let Some(id) = topic_id.filter(|id| !id.is_empty()) {
                object.device_id = Some(id.to_string());
            }
        }

        match object.device_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(object),
            _ => Err(DeviceError::MissingIdentifier(
                topic_id.unwrap_or("payload without deviceId").to_string(),
            )),
        }
    }

    /// The validated device id
    pub fn id(&self) -> &str {
        self.device_id.as_deref().unwrap_or_default()
    }

    /// All state-bearing functions, list first
    pub fn all_functions(&self) -> Vec<Function> {
        self.functions.iter().chain(&self.states).cloned().collect()
    }

    /// Time the device was heard, telegram time preferred
    pub fn seen_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.or(self.last_seen)
    }

    /// Signal strength, telegram info preferred
    pub fn signal(&self) -> Option<i32> {
        self.telegram_info
            .as_ref()
            .and_then(|info| info.dbm)
            .or(self.dbm)
    }

    /// Identity part of the object as a device without state
    pub fn to_device(&self) -> Device {
        let mut device = Device::new(self.id(), self.friendly_id.clone());
        device.eeps = self.eeps.clone();
        device.manufacturer = self.manufacturer.clone();
        device.physical_device = self.physical_device.clone();
        device.first_seen = self.first_seen;
        device.last_seen = self.seen_at();
        device.dbm = self.signal();
        device
    }
}

/// Body of a device list answer
#[derive(Debug, Clone, PartialEq)]
pub enum DevicesPayload {
    /// A bare array of device objects
    List(Vec<serde_json::Value>),
    /// `{"devices": [...]}` or `{"devices": {...}}`
    Wrapped(Vec<serde_json::Value>),
    /// A single device object
    Single(serde_json::Value),
}

impl DevicesPayload {
    /// Classify a decoded body
    pub fn from_json(topic: &str, json: serde_json::Value) -> Result<Self> {
        match json {
            serde_json::Value::Array(items) => Ok(DevicesPayload::List(items)),
            serde_json::Value::Object(mut map) => match map.remove("devices") {
                Some(serde_json::Value::Array(items)) => Ok(DevicesPayload::Wrapped(items)),
                Some(single @ serde_json::Value::Object(_)) => {
                    Ok(DevicesPayload::Wrapped(vec![single]))
                }
                Some(other) => Err(DeviceError::malformed(
                    topic,
                    format!("unexpected devices field: {}", other),
                )),
                None => Ok(DevicesPayload::Single(serde_json::Value::Object(map))),
            },
            other => Err(DeviceError::malformed(
                topic,
                format!("expected a device object or list, got {}", other),
            )),
        }
    }

    /// The device objects, envelopes removed
    pub fn into_objects(self) -> Vec<serde_json::Value> {
        let objects = match self {
            DevicesPayload::List(items) | DevicesPayload::Wrapped(items) => items,
            DevicesPayload::Single(object) => vec![object],
        };
        objects
            .into_iter()
            .map(unwrap_envelope)
            .filter(|o| o.is_object())
            .collect()
    }
}

/// Outbound state change body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandPayload {
    /// State wrapper
    pub state: CommandState,
}

/// Function list of an outbound state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandState {
    /// Functions to apply, values as text
    pub functions: Vec<Function>,
}

impl CommandPayload {
    /// Wrap a function list
    pub fn new(functions: Vec<Function>) -> Self {
        Self {
            state: CommandState { functions },
        }
    }

    /// Serialize to the wire body
    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
    }
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let json = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match json {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_i32<'de, D>(deserializer: D) -> std::result::Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let json = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(json
        .as_ref()
        .and_then(Value::from_json)
        .and_then(|v| v.to_integer_lossy())
        .and_then(|v| i32::try_from(v).ok()))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let json = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match json {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    })
}

fn lenient_eeps<'de, D>(deserializer: D) -> std::result::Result<Vec<EepEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let json = Option::<serde_json::Value>::deserialize(deserializer)?;
    let items = match json {
        Some(serde_json::Value::Array(items)) => items,
        Some(single) => vec![single],
        None => Vec::new(),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::String(eep) => Some(EepEntry::new(eep)),
            serde_json::Value::Object(_) => serde_json::from_value::<EepEntry>(item).ok(),
            _ => None,
        })
        .collect())
}

fn lenient_telegram_info<'de, D>(deserializer: D) -> std::result::Result<Option<TelegramInfo>, D::Error>
where
    D: Deserializer<'de>,
{
    let json = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(json.and_then(|info| serde_json::from_value(info).ok()))
}

fn lenient_functions<'de, D>(deserializer: D) -> std::result::Result<Vec<Function>, D::Error>
where
    D: Deserializer<'de>,
{
    let json = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(json.as_ref().map(functions_from_json).unwrap_or_default())
}
