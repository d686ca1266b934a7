use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    types::{ControlMode, OccupancyState},
};

/// Highest rc-switch protocol number the transmitter understands.
pub const MAX_PROTOCOL: u8 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub initial_state: OccupancyState,
    pub mode: ControlMode,
    #[serde(with = "duration_str")]
    pub prewarm: Duration,
    #[serde(with = "duration_str")]
    pub min_activity: Duration,
    #[serde(with = "duration_str")]
    pub max_idle: Duration,
    #[serde(with = "duration_str")]
    pub recent: Duration,
    #[serde(with = "duration_str")]
    pub tick: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            initial_state: OccupancyState::Off,
            mode: ControlMode::Thermostat,
            prewarm: Duration::from_secs(60 * 60),
            min_activity: Duration::from_secs(10 * 60),
            max_idle: Duration::from_secs(90 * 60),
            recent: Duration::from_secs(2 * 60),
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Sysfs GPIO number. The pin must be exported and configured as an
    /// input (`/sys/class/gpio/export`, `direction` = `in`) before start.
    pub pin: u32,
    /// Overrides the sysfs value file derived from `pin`.
    pub value_path: Option<PathBuf>,
    #[serde(with = "duration_str")]
    pub poll: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pin: 22,
            value_path: None,
            poll: Duration::from_millis(50),
        }
    }
}

impl MotionConfig {
    pub fn line_value_path(&self) -> PathBuf {
        self.value_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/sys/class/gpio/gpio{}/value", self.pin)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutletConfig {
    pub name: String,
    pub tx_pin: u32,
    pub on_code: u64,
    pub off_code: u64,
    /// 1-based rc-switch protocol number.
    pub protocol: u8,
    /// Pulse length in microseconds.
    pub pulse_length: u32,
    /// Sender program; `None` runs the outlet in dry-run mode.
    pub command: Option<String>,
}

impl Default for OutletConfig {
    fn default() -> Self {
        Self {
            name: "heater".to_string(),
            tx_pin: 17,
            on_code: 0,
            off_code: 0,
            protocol: 1,
            pulse_length: 200,
            command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatConfig {
    /// Target temperature in milli-degrees Celsius.
    pub setpoint: i32,
    /// Hysteresis half-width in milli-degrees Celsius.
    pub max_delta: i32,
    #[serde(with = "duration_str")]
    pub period: Duration,
    #[serde(with = "duration_str")]
    pub stale_after: Duration,
}

impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            setpoint: 20_000,
            max_delta: 1_000,
            period: Duration::from_secs(60),
            stale_after: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    pub device_id: Option<String>,
    pub base_path: PathBuf,
    #[serde(with = "duration_str")]
    pub refresh: Duration,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            base_path: PathBuf::from("/sys/bus/w1/devices"),
            refresh: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub control: ControlConfig,
    pub motion: MotionConfig,
    pub outlet: OutletConfig,
    pub thermostat: ThermostatConfig,
    pub temperature: TemperatureConfig,
}

impl RuntimeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn sanitize(&mut self) {
        self.thermostat.max_delta = self.thermostat.max_delta.abs();
        self.outlet.pulse_length = self.outlet.pulse_length.clamp(50, 5_000);
        if self.motion.poll < Duration::from_millis(10) {
            self.motion.poll = Duration::from_millis(10);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("control.prewarm", self.control.prewarm),
            ("control.min_activity", self.control.min_activity),
            ("control.max_idle", self.control.max_idle),
            ("control.recent", self.control.recent),
            ("control.tick", self.control.tick),
            ("thermostat.period", self.thermostat.period),
            ("thermostat.stale_after", self.thermostat.stale_after),
            ("temperature.refresh", self.temperature.refresh),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.control.initial_state == OccupancyState::Init {
            return Err(ConfigError::InvalidValue {
                field: "control.initial_state",
                reason: "INIT cannot be its own successor".to_string(),
            });
        }

        if !(1..=MAX_PROTOCOL).contains(&self.outlet.protocol) {
            return Err(ConfigError::InvalidValue {
                field: "outlet.protocol",
                reason: format!("must be between 1 and {MAX_PROTOCOL}"),
            });
        }

        if self.outlet.on_code == 0 || self.outlet.off_code == 0 {
            return Err(ConfigError::Missing("outlet.on_code and outlet.off_code"));
        }
        if self.outlet.on_code == self.outlet.off_code {
            return Err(ConfigError::InvalidValue {
                field: "outlet.off_code",
                reason: "must differ from outlet.on_code".to_string(),
            });
        }

        if self.control.mode == ControlMode::Thermostat && self.temperature.device_id.is_none() {
            return Err(ConfigError::Missing("temperature.device_id"));
        }

        Ok(())
    }
}

/// Parses Go-style duration strings such as `90m`, `1h30m`, `1.5s` or `200ms`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let text = input.trim();
    if text.is_empty() {
        return Err(invalid());
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);

        let unit_nanos: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };
        let value: f64 = number.parse().map_err(|_| invalid())?;
        total_nanos += value * unit_nanos as f64;
        rest = next;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 3_600_000 == 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1_000 == 0 {
        format!("{}s", millis / 1_000)
    } else {
        format!("{millis}ms")
    }
}

pub fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
