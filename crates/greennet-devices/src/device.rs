/*!
 * Device and channel model.
 *
 * A [`Device`] is rebuilt from the gateway's flattened stream. Capabilities
 * are derived from its primary equipment profile on demand and never stored.
 * Per-channel runtime state lives in [`Channel`] and survives re-resolution.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use greennet_core::{error::Error as CoreError, types::Value};

use crate::payload::Function;
use crate::profile::{self, EntityCategory};

/// Integration domain used in entity identifiers
pub const DOMAIN: &str = "greennet";

/// Channel used when a payload does not name one
pub const DEFAULT_CHANNEL: u8 = 0;

/// Function keys understood by the model
pub mod keys {
    /// Channel selector
    pub const CHANNEL: &str = "channel";
    /// Relay state, `on` or `off`
    pub const SWITCH: &str = "switch";
    /// Dimmer level, 0-100
    pub const DIM_VALUE: &str = "dimValue";
    /// Cover position, 0-100 or `stop`
    pub const POSITION: &str = "position";
    /// Slat angle
    pub const ANGLE: &str = "angle";
    /// Local control flag
    pub const LOCAL_CONTROL: &str = "localControl";
    /// Energy counter
    pub const ENERGY: &str = "energy";
    /// Instantaneous power
    pub const POWER: &str = "power";
    /// Measured temperature
    pub const TEMPERATURE: &str = "temperature";
    /// Temperature setpoint
    pub const SETPOINT: &str = "setpoint";
    /// HVAC operating mode
    pub const MODE: &str = "mode";
}

/// Wire text for an active switch
pub const STATE_ON: &str = "on";
/// Wire text for an inactive switch
pub const STATE_OFF: &str = "off";

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A payload that should be JSON could not be decoded
    #[error("Malformed payload on {topic}: {reason}")]
    MalformedPayload {
        /// Topic the payload arrived on
        topic: String,
        /// Decoder message
        reason: String,
    },

    /// A payload carried no device identifier
    #[error("Missing device identifier: {0}")]
    MissingIdentifier(String),

    /// A property path could not be merged into the tree
    #[error("Invalid property path {path}: {reason}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// No device is known under the given key or id
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A correlated query got no answer in time
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// The transport refused a subscribe, unsubscribe or publish
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The coordinator task is no longer running
    #[error("Coordinator stopped")]
    CoordinatorStopped,

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a malformed payload error
    pub fn malformed<T: Into<String>, R: fmt::Display>(topic: T, reason: R) -> Self {
        DeviceError::MalformedPayload {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid path error
    pub fn invalid_path<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        DeviceError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: fmt::Display>(err: S) -> Self {
        DeviceError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

/// HVAC operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    /// Heating and cooling disabled
    Off,
    /// Heating only
    Heat,
    /// Cooling only
    Cool,
    /// Device decides
    Auto,
}

impl HvacMode {
    /// Wire text for the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacMode::Off => "off",
            HvacMode::Heat => "heat",
            HvacMode::Cool => "cool",
            HvacMode::Auto => "auto",
        }
    }
}

impl FromStr for HvacMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(HvacMode::Off),
            "heat" => Ok(HvacMode::Heat),
            "cool" => Ok(HvacMode::Cool),
            "auto" => Ok(HvacMode::Auto),
            _ => Err(DeviceError::Other(format!("Invalid HVAC mode: {}", s))),
        }
    }
}

impl fmt::Display for HvacMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One equipment profile entry of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EepEntry {
    /// Profile code, e.g. `D2-01-12`
    pub eep: String,

    /// Any further fields the gateway reports for the entry
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EepEntry {
    /// Entry without metadata
    pub fn new<S: Into<String>>(eep: S) -> Self {
        Self {
            eep: eep.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Runtime state of one output or input of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel index
    pub index: u8,
    /// Whether the output is on
    pub is_on: bool,
    /// Dimmer level, 0-100
    pub brightness: Option<u8>,
    /// Cover position, 0 closed to 100 open
    pub position: Option<u8>,
    /// Slat angle
    pub tilt: Option<u8>,
    /// Local control enabled on the actuator
    pub local_control: bool,
    /// Energy counter
    pub energy: Option<f64>,
    /// Instantaneous power
    pub power: Option<f64>,
    /// Measured temperature
    pub temperature: Option<f64>,
    /// Temperature setpoint
    pub setpoint: Option<f64>,
    /// HVAC operating mode
    pub hvac_mode: Option<HvacMode>,
    /// Values for function keys the model does not interpret
    pub attributes: BTreeMap<String, Value>,
}

impl Channel {
    /// Create an empty channel
    pub fn new(index: u8) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// Apply one function value.
    ///
    /// A value that does not convert to the field's type leaves that field
    /// untouched.
    pub fn apply(&mut self, key: &str, value: &Value) {
        match key {
            keys::SWITCH => {
                if let Some(on) = switch_state(value) {
                    self.is_on = on;
                }
            }
            keys::DIM_VALUE => {
                if let Some(level) = percent(value) {
                    self.brightness = Some(level);
                    self.is_on = level > 0;
                }
            }
            keys::POSITION => {
                if let Some(position) = percent(value) {
                    self.position = Some(position);
                }
            }
            keys::ANGLE => {
                if let Some(angle) = percent(value) {
                    self.tilt = Some(angle);
                }
            }
            keys::LOCAL_CONTROL => {
                if let Some(enabled) = switch_state(value) {
                    self.local_control = enabled;
                }
            }
            keys::ENERGY => {
                if let Some(energy) = value.to_float_lossy() {
                    self.energy = Some(energy);
                }
            }
            keys::POWER => {
                if let Some(power) = value.to_float_lossy() {
                    self.power = Some(power);
                }
            }
            keys::TEMPERATURE => {
                if let Some(temperature) = value.to_float_lossy() {
                    self.temperature = Some(temperature);
                }
            }
            keys::SETPOINT => {
                if let Some(setpoint) = value.to_float_lossy() {
                    self.setpoint = Some(setpoint);
                }
            }
            keys::MODE => {
                if let Ok(mode) = value.to_string().parse::<HvacMode>() {
                    self.hvac_mode = Some(mode);
                }
            }
            keys::CHANNEL => {}
            other => {
                self.attributes.insert(other.to_string(), value.clone());
            }
        }
    }
}

fn switch_state(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Integer(i) => Some(*i != 0),
        Value::String(s) if s.eq_ignore_ascii_case(STATE_ON) => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case(STATE_OFF) => Some(false),
        _ => None,
    }
}

fn percent(value: &Value) -> Option<u8> {
    value
        .to_integer_lossy()
        .filter(|v| (0..=100).contains(v))
        .map(|v| v as u8)
}

/// Entity description for a host registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `(domain, "<gateway>_<deviceId>")`
    pub identifiers: Vec<(String, String)>,
    /// Display name
    pub name: String,
    /// Manufacturer, `EnOcean` when unknown
    pub manufacturer: String,
    /// Primary profile code, `Unknown` when absent
    pub model: String,
    /// `(domain, gateway)` of the bridging gateway
    pub via_device: (String, String),
}

/// A device reconstructed from the gateway stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Vendor identifier, never changes
    pub device_id: String,
    /// User-facing identifier and lookup key
    pub friendly_id: String,
    /// Equipment profiles, primary first
    pub eeps: Vec<EepEntry>,
    /// Manufacturer name
    pub manufacturer: Option<String>,
    /// Physical device descriptor
    pub physical_device: Option<String>,
    /// First time the gateway saw the device
    pub first_seen: Option<DateTime<Utc>>,
    /// Last time the gateway saw the device
    pub last_seen: Option<DateTime<Utc>>,
    /// Last observed signal strength
    pub dbm: Option<i32>,
    /// Channels by index
    pub channels: BTreeMap<u8, Channel>,
    /// Cached device profile answer
    pub profile: Option<serde_json::Value>,
}

impl Device {
    /// Create a device without profiles or state
    pub fn new<S: Into<String>>(device_id: S, friendly_id: Option<String>) -> Self {
        let device_id = device_id.into();
        let friendly_id = friendly_id
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| device_id.clone());

        Self {
            device_id,
            friendly_id,
            eeps: Vec::new(),
            manufacturer: None,
            physical_device: None,
            first_seen: None,
            last_seen: None,
            dbm: None,
            channels: BTreeMap::new(),
            profile: None,
        }
    }

    /// Lookup key, the friendly id
    pub fn key(&self) -> &str {
        &self.friendly_id
    }

    /// Whether a full profile has been resolved for the device
    pub fn is_resolved(&self) -> bool {
        !self.eeps.is_empty()
    }

    /// Primary profile code
    pub fn primary_eep(&self) -> Option<&str> {
        self.eeps.first().map(|e| e.eep.as_str())
    }

    /// Entity category of the primary profile
    pub fn category(&self) -> Option<EntityCategory> {
        self.primary_eep().and_then(profile::category)
    }

    /// Whether the device accepts a brightness
    pub fn is_dimmable(&self) -> bool {
        self.primary_eep().map_or(false, profile::is_dimmable)
    }

    /// Whether the device is a cover
    pub fn is_cover(&self) -> bool {
        self.primary_eep().map_or(false, profile::is_cover)
    }

    /// Whether the cover accepts a slat angle
    pub fn supports_tilt(&self) -> bool {
        self.primary_eep().map_or(false, profile::supports_tilt)
    }

    /// Whether the device is a climate device
    pub fn is_climate(&self) -> bool {
        self.primary_eep().map_or(false, profile::is_climate)
    }

    /// Number of addressable channels
    pub fn channel_count(&self) -> u8 {
        self.primary_eep().map_or(1, profile::channel_count)
    }

    /// Get a channel if it has been referenced
    pub fn channel(&self, index: u8) -> Option<&Channel> {
        self.channels.get(&index)
    }

    /// Get a channel, creating it on first reference
    pub fn channel_mut(&mut self, index: u8) -> &mut Channel {
        self.channels
            .entry(index)
            .or_insert_with(|| Channel::new(index))
    }

    /// Apply a function list to the channel it names.
    ///
    /// The first `channel` function selects the target; without one the
    /// default channel is used. Returns false for an empty list.
    pub fn apply_functions(&mut self, functions: &[Function]) -> bool {
        if functions.is_empty() {
            return false;
        }

        let index = functions
            .iter()
            .find(|f| f.key == keys::CHANNEL)
            .and_then(|f| f.value.to_integer_lossy())
            .and_then(|i| u8::try_from(i).ok())
            .unwrap_or(DEFAULT_CHANNEL);

        let channel = self.channel_mut(index);
        for function in functions {
            channel.apply(&function.key, &function.value);
        }
        true
    }

    /// Record when and how strongly the device was last heard
    pub fn note_seen(&mut self, at: Option<DateTime<Utc>>, dbm: Option<i32>) {
        if at.is_some() {
            self.last_seen = at;
        }
        if dbm.is_some() {
            self.dbm = dbm;
        }
    }

    /// Take identity and capability fields from a newer snapshot.
    ///
    /// Channels are kept. The cached profile is only replaced when the
    /// snapshot carries one.
    pub fn refresh_identity(&mut self, snapshot: Device) {
        let Device {
            friendly_id,
            eeps,
            manufacturer,
            physical_device,
            first_seen,
            last_seen,
            dbm,
            profile,
            ..
        } = snapshot;

        self.friendly_id = friendly_id;
        if !eeps.is_empty() {
            self.eeps = eeps;
        }
        if manufacturer.is_some() {
            self.manufacturer = manufacturer;
        }
        if physical_device.is_some() {
            self.physical_device = physical_device;
        }
        if first_seen.is_some() {
            self.first_seen = first_seen;
        }
        self.note_seen(last_seen, dbm);
        if profile.is_some() {
            self.profile = profile;
        }
    }

    /// Entity description for a host registry
    pub fn info(&self, gateway_id: &str) -> DeviceInfo {
        DeviceInfo {
            identifiers: vec![(
                DOMAIN.to_string(),
                format!("{}_{}", gateway_id, self.device_id),
            )],
            name: self.friendly_id.clone(),
            manufacturer: self
                .manufacturer
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "EnOcean".to_string()),
            model: self.primary_eep().unwrap_or("Unknown").to_string(),
            via_device: (DOMAIN.to_string(), gateway_id.to_string()),
        }
    }

    /// Unique id of the entity for one channel.
    ///
    /// The channel suffix is only added for multi-channel devices.
    pub fn entity_unique_id(&self, gateway_id: &str, channel: u8) -> String {
        if self.channel_count() > 1 {
            format!("{}_{}_ch{}", gateway_id, self.device_id, channel)
        } else {
            format!("{}_{}", gateway_id, self.device_id)
        }
    }
}
