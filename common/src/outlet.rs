use serde::Serialize;
use tracing::{error, info, warn, Span};

use crate::{config::OutletConfig, error::TransmitError};

/// Consecutive failures after which the outlet is reported degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Attempts made by [`OutletSwitch::force_off`] before giving up.
pub const SHUTDOWN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitRequest {
    pub code: u64,
    pub protocol: u8,
    pub pulse_length_us: u32,
}

/// Blocking RF transmission of a single code.
pub trait Transmitter {
    fn transmit(&mut self, request: &TransmitRequest) -> Result<(), TransmitError>;
}

impl<T: Transmitter + ?Sized> Transmitter for Box<T> {
    fn transmit(&mut self, request: &TransmitRequest) -> Result<(), TransmitError> {
        (**self).transmit(request)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutletHealth {
    pub transmissions: u64,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "totalFailures")]
    pub total_failures: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

impl OutletHealth {
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= DEGRADED_AFTER_FAILURES
    }
}

/// Remote-controlled outlet. `is_on` mirrors the last successful
/// transmission; there is no feedback from the outlet itself.
pub struct OutletSwitch<T> {
    name: String,
    transmitter: T,
    on_code: u64,
    off_code: u64,
    protocol: u8,
    pulse_length_us: u32,
    is_on: bool,
    health: OutletHealth,
    span: Span,
}

impl<T: Transmitter> OutletSwitch<T> {
    pub fn new(config: &OutletConfig, transmitter: T) -> Self {
        Self {
            name: config.name.clone(),
            transmitter,
            on_code: config.on_code,
            off_code: config.off_code,
            protocol: config.protocol,
            pulse_length_us: config.pulse_length,
            is_on: false,
            health: OutletHealth::default(),
            span: tracing::info_span!("outlet", name = %config.name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn health(&self) -> &OutletHealth {
        &self.health
    }

    pub fn transmitter(&self) -> &T {
        &self.transmitter
    }

    pub fn turn_on(&mut self) -> Result<(), TransmitError> {
        self.set(true)
    }

    pub fn turn_off(&mut self) -> Result<(), TransmitError> {
        self.set(false)
    }

    /// Transmits unconditionally. Callers check `is_on` first when they
    /// want to avoid redundant radio traffic.
    pub fn set(&mut self, on: bool) -> Result<(), TransmitError> {
        let code = if on { self.on_code } else { self.off_code };
        let request = TransmitRequest {
            code,
            protocol: self.protocol,
            pulse_length_us: self.pulse_length_us,
        };

        let _entered = self.span.enter();
        info!(code, "turning {}", if on { "on" } else { "off" });

        match self.transmitter.transmit(&request) {
            Ok(()) => {
                self.is_on = on;
                self.health.transmissions += 1;
                self.health.consecutive_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.health.consecutive_failures += 1;
                self.health.total_failures += 1;
                self.health.last_error = Some(err.to_string());
                warn!(
                    code,
                    failures = self.health.consecutive_failures,
                    "transmit failed: {err}"
                );
                if self.health.consecutive_failures == DEGRADED_AFTER_FAILURES {
                    error!("outlet degraded, commands are not reaching it");
                }
                Err(err)
            }
        }
    }

    /// Final off command on shutdown, retried a bounded number of times.
    /// Sent even when the outlet is believed off.
    pub fn force_off(&mut self) -> Result<(), TransmitError> {
        let mut attempt = 1;
        loop {
            match self.turn_off() {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= SHUTDOWN_ATTEMPTS => {
                    let _entered = self.span.enter();
                    error!(attempts = attempt, "outlet may still be energized after shutdown");
                    return Err(err);
                }
                Err(_) => {
                    let _entered = self.span.enter();
                    warn!(attempt, "final outlet-off failed, retrying");
                    attempt += 1;
                }
            }
        }
    }
}
