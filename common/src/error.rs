use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("unknown state: {0}")]
    UnknownState(String),
    #[error("{field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("device {0} does not exist")]
    NotFound(String),
    #[error("device read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed reading {0:?}")]
    Malformed(String),
    #[error("implausible reading {0} m°C")]
    Implausible(i32),
}

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("transmitter unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("transmitter rejected code {code}: {reason}")]
    Rejected { code: u64, reason: String },
}
