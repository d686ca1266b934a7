pub mod config;
pub mod error;
pub mod motion;
pub mod occupancy;
pub mod outlet;
pub mod temperature;
pub mod thermostat;
pub mod types;

pub use config::{
    ControlConfig, MotionConfig, OutletConfig, RuntimeConfig, TemperatureConfig, ThermostatConfig,
};
pub use error::{ConfigError, SensorError, TransmitError};
pub use motion::MotionTracker;
pub use occupancy::{DirectOutlet, HeatControl, OccupancyMachine, Transition};
pub use outlet::{OutletHealth, OutletSwitch, TransmitRequest, Transmitter};
pub use temperature::{TemperatureCache, TemperatureDevice, TemperatureReading, TemperatureSource};
pub use thermostat::{HeatFlag, Thermostat, ThermostatAction, ThermostatController};
pub use types::{ControlMode, OccupancyState, OccupancyStatus};
