/*!
 * Outbound command encoding.
 *
 * An [`Intent`] is turned into the ordered function list the gateway
 * expects. Values are always sent as text and the channel is only named
 * when it is not the default one.
 */
use serde::{Deserialize, Serialize};

use crate::device::{keys, Device, HvacMode, DEFAULT_CHANNEL, STATE_OFF, STATE_ON};
use crate::payload::Function;

/// Sentinel position that stops a moving cover
pub const POSITION_STOP: &str = "stop";

/// A high-level request against one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    /// Switch on, optionally at a brightness
    TurnOn {
        /// Brightness for dimmers, full when absent
        brightness: Option<u8>,
    },
    /// Switch off
    TurnOff,
    /// Set a brightness, 0 switches off
    SetBrightness {
        /// Level, 0-100
        brightness: u8,
    },
    /// Move a cover
    SetPosition {
        /// 0 closed to 100 open
        position: u8,
    },
    /// Fully open a cover
    Open,
    /// Fully close a cover
    Close,
    /// Stop a moving cover
    Stop,
    /// Set the slat angle
    SetTilt {
        /// Angle
        tilt: u8,
    },
    /// Set a temperature setpoint
    SetSetpoint {
        /// Temperature
        temperature: f64,
    },
    /// Change the HVAC mode
    SetHvacMode {
        /// Mode
        mode: HvacMode,
    },
}

/// An intent addressed to a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Target channel
    pub channel: u8,
    /// What to do
    pub intent: Intent,
}

fn clamp_percent(value: u8) -> u8 {
    value.min(100)
}

impl Command {
    /// Command for the default channel
    pub fn new(intent: Intent) -> Self {
        Self {
            channel: DEFAULT_CHANNEL,
            intent,
        }
    }

    /// Address another channel
    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// Encode for `device`.
    ///
    /// Dimmers get `dimValue` instead of `switch`, so the function list
    /// depends on the target's capabilities.
    pub fn encode(&self, device: &Device) -> Vec<Function> {
        let dimmable = device.is_dimmable();

        let mut functions = match &self.intent {
            Intent::TurnOn { brightness } if dimmable => {
                vec![Function::text(keys::DIM_VALUE, clamp_percent(brightness.unwrap_or(100)))]
            }
            Intent::TurnOn { .. } => vec![Function::text(keys::SWITCH, STATE_ON)],
            Intent::TurnOff if dimmable => vec![Function::text(keys::DIM_VALUE, 0)],
            Intent::TurnOff => vec![Function::text(keys::SWITCH, STATE_OFF)],
            Intent::SetBrightness { brightness } if dimmable => {
                vec![Function::text(keys::DIM_VALUE, clamp_percent(*brightness))]
            }
            Intent::SetBrightness { brightness } => {
                let state = if *brightness > 0 { STATE_ON } else { STATE_OFF };
                vec![Function::text(keys::SWITCH, state)]
            }
            Intent::SetPosition { position } => {
                vec![Function::text(keys::POSITION, clamp_percent(*position))]
            }
            Intent::Open => vec![Function::text(keys::POSITION, 100)],
            Intent::Close => vec![Function::text(keys::POSITION, 0)],
            Intent::Stop => vec![Function::text(keys::POSITION, POSITION_STOP)],
            Intent::SetTilt { tilt } => vec![Function::text(keys::ANGLE, clamp_percent(*tilt))],
            Intent::SetSetpoint { temperature } => {
                vec![Function::text(keys::SETPOINT, temperature)]
            }
            Intent::SetHvacMode { mode } => vec![Function::text(keys::MODE, mode.as_str())],
        };

        if self.channel != DEFAULT_CHANNEL {
            functions.push(Function::text(keys::CHANNEL, self.channel));
        }
        functions
    }

    /// Apply the state this command is expected to produce once the
    /// gateway has accepted it
    pub fn apply_optimistic(&self, device: &mut Device) {
        let dimmable = device.is_dimmable();
        let channel = device.channel_mut(self.channel);

        match &self.intent {
            Intent::TurnOn { brightness } => {
                channel.is_on = true;
                if dimmable {
                    channel.brightness = Some(clamp_percent(brightness.unwrap_or(100)));
                }
            }
            Intent::TurnOff => {
                channel.is_on = false;
                if dimmable {
                    channel.brightness = Some(0);
                }
            }
            Intent::SetBrightness { brightness } => {
                let level = clamp_percent(*brightness);
                channel.is_on = level > 0;
                if dimmable {
                    channel.brightness = Some(level);
                }
            }
            Intent::SetPosition { position } => channel.position = Some(clamp_percent(*position)),
            Intent::Open => channel.position = Some(100),
            Intent::Close => channel.position = Some(0),
            Intent::Stop => {}
            Intent::SetTilt { tilt } => channel.tilt = Some(clamp_percent(*tilt)),
            Intent::SetSetpoint { temperature } => channel.setpoint = Some(*temperature),
            Intent::SetHvacMode { mode } => channel.hvac_mode = Some(*mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EepEntry;
    use serde_json::json;

    fn device(eep: &str) -> Device {
        let mut device = Device::new("0123ABCD", None);
        device.eeps.push(EepEntry::new(eep));
        device
    }

    fn wire(functions: &[Function]) -> serde_json::Value {
        serde_json::to_value(functions).unwrap()
    }

    #[test]
    fn test_dimmable_turn_on() {
        let functions = Command::new(Intent::TurnOn { brightness: None }).encode(&device("D2-01-12"));
        assert_eq!(wire(&functions), json!([{"key": "dimValue", "value": "100"}]));

        let functions =
            Command::new(Intent::TurnOn { brightness: Some(35) }).encode(&device("A5-38-08"));
        assert_eq!(wire(&functions), json!([{"key": "dimValue", "value": "35"}]));
    }

    #[test]
    fn test_dimmable_turn_off() {
        let functions = Command::new(Intent::TurnOff).on_channel(1).encode(&device("D2-01-06"));
        assert_eq!(
            wire(&functions),
            json!([{"key": "dimValue", "value": "0"}, {"key": "channel", "value": "1"}])
        );
    }

    #[test]
    fn test_switch_encoding() {
        let relay = device("D2-01-00");
        assert_eq!(
            wire(&Command::new(Intent::TurnOn { brightness: Some(20) }).encode(&relay)),
            json!([{"key": "switch", "value": "on"}])
        );
        assert_eq!(
            wire(&Command::new(Intent::SetBrightness { brightness: 0 }).encode(&relay)),
            json!([{"key": "switch", "value": "off"}])
        );
    }

    #[test]
    fn test_cover_stop_on_channel() {
        let functions = Command::new(Intent::Stop).on_channel(2).encode(&device("D2-05-00"));
        assert_eq!(
            wire(&functions),
            json!([{"key": "position", "value": "stop"}, {"key": "channel", "value": "2"}])
        );
    }

    #[test]
    fn test_cover_positions() {
        let blind = device("D2-05-00");
        assert_eq!(
            wire(&Command::new(Intent::Open).encode(&blind)),
            json!([{"key": "position", "value": "100"}])
        );
        assert_eq!(
            wire(&Command::new(Intent::SetPosition { position: 250 }).encode(&blind)),
            json!([{"key": "position", "value": "100"}])
        );
        assert_eq!(
            wire(&Command::new(Intent::SetTilt { tilt: 45 }).encode(&blind)),
            json!([{"key": "angle", "value": "45"}])
        );
    }

    #[test]
    fn test_climate_encoding() {
        let valve = device("A5-20-04");
        assert_eq!(
            wire(&Command::new(Intent::SetSetpoint { temperature: 21.5 }).encode(&valve)),
            json!([{"key": "setpoint", "value": "21.5"}])
        );
        assert_eq!(
            wire(&Command::new(Intent::SetHvacMode { mode: HvacMode::Heat }).encode(&valve)),
            json!([{"key": "mode", "value": "heat"}])
        );
    }

    #[test]
    fn test_optimistic_state() {
        let mut dimmer = device("D2-01-12");
        Command::new(Intent::TurnOn { brightness: None }).apply_optimistic(&mut dimmer);
        assert_eq!(dimmer.channel(0).unwrap().brightness, Some(100));
        assert!(dimmer.channel(0).unwrap().is_on);

        Command::new(Intent::SetBrightness { brightness: 0 }).apply_optimistic(&mut dimmer);
        assert!(!dimmer.channel(0).unwrap().is_on);

        let mut blind = device("D2-05-00");
        Command::new(Intent::Close).on_channel(3).apply_optimistic(&mut blind);
        assert_eq!(blind.channel(3).unwrap().position, Some(0));

        let mut relay = device("D2-01-00");
        Command::new(Intent::TurnOn { brightness: None }).apply_optimistic(&mut relay);
        assert_eq!(relay.channel(0).unwrap().brightness, None);
        assert!(relay.channel(0).unwrap().is_on);
    }
}
