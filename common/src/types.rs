use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Phase of the room presence lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OccupancyState {
    Init,
    /// Heater off, not watching for activity.
    Off,
    /// Heater off, watching for activity.
    Idle,
    /// Motion seen, heater on, waiting for sustained activity.
    Tracking,
    /// Heater on for a fixed warm-up period, motion ignored.
    Prewarm,
    /// Heater on until the room has been idle too long.
    Active,
    /// Reserved. No rule enters or leaves it.
    Locked,
}

impl OccupancyState {
    pub const ALL: [Self; 7] = [
        Self::Init,
        Self::Off,
        Self::Idle,
        Self::Tracking,
        Self::Prewarm,
        Self::Active,
        Self::Locked,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Off => "OFF",
            Self::Idle => "IDLE",
            Self::Tracking => "TRACKING",
            Self::Prewarm => "PREWARM",
            Self::Active => "ACTIVE",
            Self::Locked => "LOCKED",
        }
    }
}

impl fmt::Display for OccupancyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OccupancyState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| ConfigError::UnknownState(s.to_string()))
    }
}

impl Serialize for OccupancyState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OccupancyState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Who owns the outlet: the thermostat loop, or the occupancy machine directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Thermostat,
    Switch,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thermostat => "thermostat",
            Self::Switch => "switch",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OccupancyStatus {
    pub state: &'static str,
    #[serde(rename = "inStateMs")]
    pub in_state_ms: u64,
    #[serde(rename = "sinceActivityMs")]
    pub since_activity_ms: u64,
    #[serde(rename = "recentActivity")]
    pub recent_activity: bool,
}
