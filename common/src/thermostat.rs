use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, info, warn, Span};

use crate::{
    config::{duration_ms, ThermostatConfig},
    error::TransmitError,
    outlet::{OutletSwitch, Transmitter},
    temperature::{TemperatureCache, TemperatureReading},
};

/// Heat request shared between the occupancy machine (writer) and the
/// thermostat loop (reader). The reader may act on a stale value for one
/// thermostat period.
#[derive(Debug, Clone, Default)]
pub struct HeatFlag(Arc<AtomicBool>);

impl HeatFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::AcqRel)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatAction {
    /// Room colder than the band allows.
    HeaterOn,
    /// Room within the band or warmer than the setpoint.
    HeaterOff,
    /// Heat request withdrawn.
    Disabled,
    /// No usable temperature while heat is requested.
    SensorUnavailable,
}

impl ThermostatAction {
    pub fn outlet_on(self) -> bool {
        matches!(self, Self::HeaterOn)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeaterOn => "heater on",
            Self::HeaterOff => "heater off",
            Self::Disabled => "thermostat disabled",
            Self::SensorUnavailable => "temperature unavailable",
        }
    }
}

/// Single-band hysteresis rule. All temperatures in milli-degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thermostat {
    pub setpoint: i32,
    pub max_delta: i32,
    pub stale_after_ms: u64,
}

impl Thermostat {
    pub fn new(config: &ThermostatConfig) -> Self {
        Self {
            setpoint: config.setpoint,
            max_delta: config.max_delta,
            stale_after_ms: duration_ms(config.stale_after),
        }
    }

    pub fn delta(&self, milli_celsius: i32) -> i32 {
        self.setpoint.saturating_sub(milli_celsius)
    }

    pub fn decide(
        &self,
        heat_enabled: bool,
        switch_on: bool,
        reading: Option<TemperatureReading>,
        now_ms: u64,
    ) -> Option<ThermostatAction> {
        if !heat_enabled {
            return switch_on.then_some(ThermostatAction::Disabled);
        }

        let Some(reading) = reading.filter(|r| r.age_ms(now_ms) <= self.stale_after_ms) else {
            return switch_on.then_some(ThermostatAction::SensorUnavailable);
        };

        if self.delta(reading.milli_celsius) > self.max_delta {
            (!switch_on).then_some(ThermostatAction::HeaterOn)
        } else {
            switch_on.then_some(ThermostatAction::HeaterOff)
        }
    }
}

/// Translates the heat flag and the cached temperature into outlet
/// transitions. Owns the outlet while it runs.
pub struct ThermostatController<T> {
    thermostat: Thermostat,
    heat: HeatFlag,
    cache: Arc<TemperatureCache>,
    outlet: OutletSwitch<T>,
    span: Span,
}

impl<T: Transmitter> ThermostatController<T> {
    pub fn new(
        config: &ThermostatConfig,
        cache: Arc<TemperatureCache>,
        outlet: OutletSwitch<T>,
    ) -> Self {
        Self {
            thermostat: Thermostat::new(config),
            heat: HeatFlag::new(),
            cache,
            outlet,
            span: tracing::info_span!("thermostat"),
        }
    }

    /// Handle for the occupancy machine to toggle heat from its own task.
    pub fn heat_flag(&self) -> HeatFlag {
        self.heat.clone()
    }

    pub fn set_heat_enabled(&self, enabled: bool) {
        self.heat.set(enabled);
    }

    pub fn outlet(&self) -> &OutletSwitch<T> {
        &self.outlet
    }

    pub fn into_outlet(self) -> OutletSwitch<T> {
        self.outlet
    }

    /// One thermostat period. A failed transmit leaves the outlet state
    /// untouched so the next cycle retries.
    pub fn cycle(&mut self, now_ms: u64) -> Option<ThermostatAction> {
        let heat_enabled = self.heat.is_enabled();
        let reading = self.cache.read();
        let _entered = self.span.enter();

        if let Some(reading) = reading {
            debug!(
                have = reading.milli_celsius,
                want = self.thermostat.setpoint,
                delta = self.thermostat.delta(reading.milli_celsius),
                maxdelta = self.thermostat.max_delta,
                active = heat_enabled,
                switch = self.outlet.is_on(),
                "thermostat running"
            );
        } else {
            debug!(active = heat_enabled, switch = self.outlet.is_on(), "no temperature yet");
        }

        let action = self
            .thermostat
            .decide(heat_enabled, self.outlet.is_on(), reading, now_ms)?;
        info!("{}", action.as_str());

        if let Err(err) = self.outlet.set(action.outlet_on()) {
            warn!("{} not applied, retrying next cycle: {err}", action.as_str());
        }
        Some(action)
    }

    /// Leaves the outlet off regardless of its logical state.
    pub fn shutdown(&mut self) -> Result<(), TransmitError> {
        let _entered = self.span.enter();
        debug!("stopping thermostat");
        self.heat.set(false);
        self.outlet.force_off()
    }
}
