use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use warmoffice_common::{
    MotionTracker, SensorError, TemperatureDevice, TransmitError, TransmitRequest, Transmitter,
};

use crate::host::{monotonic_ms, sleep_or_stop};

/// Runs an external sender (e.g. `codesend`) as `<program> <code> <protocol> <pulse>`.
pub struct CommandTransmitter {
    program: String,
}

impl CommandTransmitter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Transmitter for CommandTransmitter {
    fn transmit(&mut self, request: &TransmitRequest) -> Result<(), TransmitError> {
        let output = Command::new(&self.program)
            .arg(request.code.to_string())
            .arg(request.protocol.to_string())
            .arg(request.pulse_length_us.to_string())
            .output()?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(TransmitError::Rejected {
            code: request.code,
            reason: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
        })
    }
}

/// Logs transmissions instead of sending them.
#[derive(Debug, Default)]
pub struct DryRunTransmitter;

impl Transmitter for DryRunTransmitter {
    fn transmit(&mut self, request: &TransmitRequest) -> Result<(), TransmitError> {
        info!(
            code = request.code,
            protocol = request.protocol,
            pulse_length = request.pulse_length_us,
            "dry-run transmit"
        );
        Ok(())
    }
}

/// DS18x20 exposed by the w1-therm kernel driver.
#[derive(Debug)]
pub struct W1Thermometer {
    id: String,
    temperature_path: PathBuf,
}

impl W1Thermometer {
    pub fn open(base_path: &Path, id: &str) -> Result<Self, SensorError> {
        let device_path = base_path.join(id);
        if !device_path.is_dir() {
            return Err(SensorError::NotFound(id.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            temperature_path: device_path.join("temperature"),
        })
    }
}

impl TemperatureDevice for W1Thermometer {
    fn id(&self) -> &str {
        &self.id
    }

    fn read_raw(&mut self) -> Result<String, SensorError> {
        Ok(std::fs::read_to_string(&self.temperature_path)?)
    }
}

/// Watches a sysfs GPIO line value file and reports every change as a
/// motion edge. The line must already be exported as an input. Two edges
/// inside one poll period collapse into one, which still refreshes the
/// last-activity time.
pub struct LineValueWatcher {
    path: PathBuf,
    poll: Duration,
    last: String,
}

impl LineValueWatcher {
    pub async fn open(path: PathBuf, poll: Duration) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| {
                format!(
                    "failed to read motion line {} (is the pin exported as an input?)",
                    path.display()
                )
            })?;
        Ok(Self {
            path,
            poll,
            last: raw.trim().to_string(),
        })
    }

    pub fn spawn(
        mut self,
        motion: Arc<MotionTracker>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut read_failing = false;
            loop {
                match tokio::fs::read_to_string(&self.path).await {
                    Ok(raw) => {
                        read_failing = false;
                        let value = raw.trim();
                        if value != self.last {
                            motion.on_edge(monotonic_ms());
                            self.last = value.to_string();
                        }
                    }
                    Err(err) if !read_failing => {
                        warn!("motion line {} unreadable: {err}", self.path.display());
                        read_failing = true;
                    }
                    Err(_) => {}
                }

                if sleep_or_stop(self.poll, &mut stop).await {
                    break;
                }
            }
            debug!("motion line released");
        })
    }
}
