/*!
 * EnOcean Equipment Profile (EEP) capability table.
 *
 * The first EEP a device reports decides what kind of entity it becomes and
 * which features it exposes. Everything here is a pure function of the code.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity category a device is represented as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCategory {
    /// On/off actuator
    Switch,
    /// Switchable or dimmable light
    Light,
    /// Blinds and shutters
    Cover,
    /// Trigger-only device such as a rocker switch
    Event,
    /// Heating valve or room panel
    Climate,
}

impl EntityCategory {
    /// Lowercase name used in entity ids and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCategory::Switch => "switch",
            EntityCategory::Light => "light",
            EntityCategory::Cover => "cover",
            EntityCategory::Event => "event",
            EntityCategory::Climate => "climate",
        }
    }

    /// Parse from a category name
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "switch" => Some(EntityCategory::Switch),
            "light" => Some(EntityCategory::Light),
            "cover" => Some(EntityCategory::Cover),
            "event" => Some(EntityCategory::Event),
            "climate" => Some(EntityCategory::Climate),
            _ => None,
        }
    }
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the capability table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileEntry {
    /// EEP code, e.g. `D2-01-12`
    pub code: &'static str,
    /// Entity category
    pub category: EntityCategory,
    /// Human readable description
    pub description: &'static str,
}

const fn entry(code: &'static str, category: EntityCategory, description: &'static str) -> ProfileEntry {
    ProfileEntry {
        code,
        category,
        description,
    }
}

use EntityCategory::{Climate, Cover, Event, Light, Switch};

/// Known equipment profiles
pub static PROFILES: &[ProfileEntry] = &[
    // Electronic switch actuators and dimmers
    entry("D2-01-00", Switch, "Electronic Switch Actuator, 1 Channel"),
    entry("D2-01-01", Switch, "Electronic Switch Actuator, 1 Channel with Energy"),
    entry("D2-01-02", Light, "Dimmer, 1 Channel"),
    entry("D2-01-03", Light, "Dimmer, 1 Channel with Energy"),
    entry("D2-01-04", Switch, "Electronic Switch Actuator, 2 Channels"),
    entry("D2-01-05", Switch, "Electronic Switch Actuator, 2 Channels with Energy"),
    entry("D2-01-06", Light, "Dimmer, 2 Channels"),
    entry("D2-01-07", Light, "Dimmer, 2 Channels with Energy"),
    entry("D2-01-08", Switch, "Electronic Switch Actuator, 4 Channels"),
    entry("D2-01-09", Switch, "Electronic Switch Actuator, 4 Channels with Energy"),
    entry("D2-01-0A", Light, "Dimmer, 4 Channels"),
    entry("D2-01-0B", Light, "Dimmer, 4 Channels with Energy"),
    entry("D2-01-0C", Switch, "Pilot Wire Controller"),
    entry("D2-01-0D", Switch, "Electronic Switch Actuator, 8 Channels"),
    entry("D2-01-0E", Switch, "Electronic Switch Actuator, 8 Channels with Energy"),
    entry("D2-01-0F", Light, "Dimmer, 8 Channels"),
    entry("D2-01-10", Light, "Dimmer, 8 Channels with Energy"),
    entry("D2-01-11", Switch, "Electronic Switch Actuator with Local Control"),
    entry("D2-01-12", Light, "Dimmer with Local Control"),
    // Blinds control
    entry("D2-05-00", Cover, "Blinds Control for Position and Angle"),
    entry("D2-05-01", Cover, "Blinds Control for Position"),
    entry("D2-05-02", Cover, "Blinds Control for Position and Angle, Lock"),
    // Central command lighting
    entry("A5-38-08", Light, "Gateway Dimming"),
    entry("A5-38-09", Light, "Gateway Switching"),
    // HVAC
    entry("A5-20-01", Climate, "HVAC Battery Powered Actuator"),
    entry("A5-20-04", Climate, "Heating Radiator Valve Actuating Drive"),
    entry("A5-10-06", Climate, "Room Operating Panel, Temperature and Set Point"),
    // Rocker switches
    entry("F6-02-01", Event, "Rocker Switch, 2 Rocker"),
    entry("F6-02-02", Event, "Rocker Switch, 2 Rocker"),
    entry("F6-02-03", Event, "Rocker Switch, 2 Rocker"),
    entry("F6-03-01", Event, "Rocker Switch, 4 Rocker"),
    entry("F6-03-02", Event, "Rocker Switch, 4 Rocker"),
];

const DIMMERS: &[&str] = &[
    "D2-01-02", "D2-01-03", "D2-01-06", "D2-01-07", "D2-01-0A", "D2-01-0B", "D2-01-0F",
    "D2-01-10", "D2-01-12", "A5-38-08",
];

const TILTING_COVERS: &[&str] = &["D2-05-00", "D2-05-02"];

/// Look up a profile code. Matching ignores ASCII case.
pub fn lookup(code: &str) -> Option<&'static ProfileEntry> {
    PROFILES.iter().find(|p| p.code.eq_ignore_ascii_case(code))
}

/// Entity category for a profile code
pub fn category(code: &str) -> Option<EntityCategory> {
    lookup(code).map(|p| p.category)
}

/// Description for a profile code
pub fn description(code: &str) -> Option<&'static str> {
    lookup(code).map(|p| p.description)
}

/// Whether the profile accepts a brightness value
pub fn is_dimmable(code: &str) -> bool {
    DIMMERS.iter().any(|d| d.eq_ignore_ascii_case(code))
}

/// Whether the profile is a blinds actuator
pub fn is_cover(code: &str) -> bool {
    code.to_ascii_uppercase().starts_with("D2-05-")
}

/// Whether the cover also accepts a slat angle
pub fn supports_tilt(code: &str) -> bool {
    TILTING_COVERS.iter().any(|d| d.eq_ignore_ascii_case(code))
}

/// Whether the profile is a heating/cooling device
pub fn is_climate(code: &str) -> bool {
    category(code) == Some(EntityCategory::Climate)
}

/// Number of independently addressable outputs
pub fn channel_count(code: &str) -> u8 {
    match code.to_ascii_uppercase().as_str() {
        "D2-01-04" | "D2-01-05" | "D2-01-06" | "D2-01-07" => 2,
        "D2-01-08" | "D2-01-09" | "D2-01-0A" | "D2-01-0B" => 4,
        "D2-01-0D" | "D2-01-0E" | "D2-01-0F" | "D2-01-10" => 8,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let dimmer = lookup("D2-01-12").unwrap();
        assert_eq!(dimmer.category, EntityCategory::Light);
        assert_eq!(dimmer.description, "Dimmer with Local Control");

        assert_eq!(category("d2-05-01"), Some(EntityCategory::Cover));
        assert_eq!(category("F6-03-02"), Some(EntityCategory::Event));
        assert_eq!(category("FF-FF-FF"), None);
    }

    #[test]
    fn test_codes_are_unique() {
        for (i, a) in PROFILES.iter().enumerate() {
            assert!(PROFILES[i + 1..].iter().all(|b| b.code != a.code), "{}", a.code);
        }
    }

    #[test]
    fn test_dimmers_are_lights() {
        for code in DIMMERS {
            assert_eq!(category(code), Some(EntityCategory::Light), "{}", code);
        }
        assert!(!is_dimmable("A5-38-09"));
        assert!(!is_dimmable("D2-01-00"));
    }

    #[test]
    fn test_cover_rules() {
        assert!(is_cover("D2-05-01"));
        assert!(!is_cover("D2-01-01"));
        assert!(supports_tilt("D2-05-00"));
        assert!(supports_tilt("D2-05-02"));
        assert!(!supports_tilt("D2-05-01"));
    }

    #[test]
    fn test_channel_count() {
        assert_eq!(channel_count("D2-01-00"), 1);
        assert_eq!(channel_count("D2-01-07"), 2);
        assert_eq!(channel_count("D2-01-0a"), 4);
        assert_eq!(channel_count("D2-01-0E"), 8);
        assert_eq!(channel_count("D2-05-00"), 1);
    }

    #[test]
    fn test_category_names() {
        assert_eq!(EntityCategory::from_name("Cover"), Some(EntityCategory::Cover));
        assert_eq!(EntityCategory::Climate.to_string(), "climate");
        assert!(is_climate("A5-20-04"));
    }
}
