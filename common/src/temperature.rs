use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::{debug, error, Span};

use crate::{config::duration_ms, error::SensorError};

/// DS18x20 measurement range, in milli-degrees Celsius.
pub const MIN_PLAUSIBLE_MILLI_C: i32 = -55_000;
pub const MAX_PLAUSIBLE_MILLI_C: i32 = 125_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureReading {
    pub milli_celsius: i32,
    pub read_at_ms: u64,
}

impl TemperatureReading {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.read_at_ms)
    }
}

/// Source of raw temperature text, e.g. a 1-Wire sysfs attribute.
pub trait TemperatureDevice {
    fn id(&self) -> &str;
    fn read_raw(&mut self) -> Result<String, SensorError>;
}

impl<D: TemperatureDevice + ?Sized> TemperatureDevice for Box<D> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn read_raw(&mut self) -> Result<String, SensorError> {
        (**self).read_raw()
    }
}

/// Last good reading, written by the poller and read by the thermostat.
#[derive(Debug, Default)]
pub struct TemperatureCache {
    latest: Mutex<Option<TemperatureReading>>,
}

impl TemperatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> Option<TemperatureReading> {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, reading: TemperatureReading) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(reading);
    }
}

pub fn parse_milli_celsius(raw: &str) -> Result<i32, SensorError> {
    let trimmed = raw.trim();
    let value = trimmed
        .parse::<i32>()
        .map_err(|_| SensorError::Malformed(trimmed.to_string()))?;
    if !(MIN_PLAUSIBLE_MILLI_C..=MAX_PLAUSIBLE_MILLI_C).contains(&value) {
        return Err(SensorError::Implausible(value));
    }
    Ok(value)
}

pub struct TemperatureSource<D> {
    device: D,
    cache: Arc<TemperatureCache>,
    refresh_ms: u64,
    last_attempt_ms: Option<u64>,
    failures: u64,
    span: Span,
}

impl<D: TemperatureDevice> TemperatureSource<D> {
    pub fn new(device: D, refresh: Duration) -> Self {
        let span = tracing::info_span!("temperature", id = %device.id());
        Self {
            device,
            cache: Arc::new(TemperatureCache::new()),
            refresh_ms: duration_ms(refresh),
            last_attempt_ms: None,
            failures: 0,
            span,
        }
    }

    pub fn cache(&self) -> Arc<TemperatureCache> {
        Arc::clone(&self.cache)
    }

    pub fn read(&self) -> Option<TemperatureReading> {
        self.cache.read()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.last_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.refresh_ms)
            .unwrap_or(true)
    }

    /// Reads the device if the refresh interval has elapsed. A failed read
    /// keeps the previous value and waits for the next interval.
    pub fn poll(&mut self, now_ms: u64) -> Option<TemperatureReading> {
        if !self.is_due(now_ms) {
            return None;
        }
        self.last_attempt_ms = Some(now_ms);

        let _entered = self.span.enter();
        match self.device.read_raw().and_then(|raw| parse_milli_celsius(&raw)) {
            Ok(milli_celsius) => {
                let reading = TemperatureReading {
                    milli_celsius,
                    read_at_ms: now_ms,
                };
                self.cache.record(reading);
                debug!(temp = milli_celsius, "read temperature");
                Some(reading)
            }
            Err(err) => {
                self.failures += 1;
                error!(failures = self.failures, "failed to read temperature: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, thread};

    use pretty_assertions::assert_eq;

    use super::*;

    struct ScriptedDevice {
        replies: VecDeque<Result<String, SensorError>>,
        reads: usize,
    }

    impl ScriptedDevice {
        fn new(replies: Vec<Result<&str, SensorError>>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|reply| reply.map(str::to_string))
                    .collect(),
                reads: 0,
            }
        }
    }

    impl TemperatureDevice for ScriptedDevice {
        fn id(&self) -> &str {
            "28-test"
        }

        fn read_raw(&mut self) -> Result<String, SensorError> {
            self.reads += 1;
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(SensorError::Malformed(String::new())))
        }
    }

    #[test]
    fn parses_sysfs_text() {
        assert_eq!(parse_milli_celsius("21437\n").unwrap(), 21_437);
        assert_eq!(parse_milli_celsius("-1250").unwrap(), -1_250);
        assert!(matches!(
            parse_milli_celsius("YES"),
            Err(SensorError::Malformed(_))
        ));
        assert!(matches!(
            parse_milli_celsius("130000"),
            Err(SensorError::Implausible(130_000))
        ));
    }

    #[test]
    fn refreshes_at_most_once_per_interval() {
        let device = ScriptedDevice::new(vec![Ok("20000"), Ok("20500")]);
        let mut source = TemperatureSource::new(device, Duration::from_secs(60));

        assert!(source.poll(0).is_some());
        assert!(source.poll(1_000).is_none());
        assert!(source.poll(59_999).is_none());
        assert_eq!(source.device.reads, 1);

        let reading = source.poll(60_000).unwrap();
        assert_eq!(reading.milli_celsius, 20_500);
        assert_eq!(source.device.reads, 2);
    }

    #[test]
    fn malformed_reading_keeps_last_good_value() {
        let device = ScriptedDevice::new(vec![Ok("21000"), Ok("garbage"), Ok("22000")]);
        let mut source = TemperatureSource::new(device, Duration::from_secs(60));

        source.poll(0);
        assert!(source.poll(60_000).is_none());
        assert_eq!(
            source.read(),
            Some(TemperatureReading {
                milli_celsius: 21_000,
                read_at_ms: 0,
            })
        );
        assert_eq!(source.failures(), 1);

        source.poll(120_000);
        assert_eq!(source.read().map(|r| r.milli_celsius), Some(22_000));
    }

    #[test]
    fn io_failure_before_first_reading_leaves_cache_empty() {
        let device = ScriptedDevice::new(vec![Err(SensorError::Io(std::io::Error::other(
            "bus timeout",
        )))]);
        let mut source = TemperatureSource::new(device, Duration::from_secs(60));

        assert!(source.poll(0).is_none());
        assert_eq!(source.read(), None);
        assert!(!source.is_due(30_000));
    }

    #[test]
    fn cache_is_readable_from_another_thread() {
        let device = ScriptedDevice::new(vec![Ok("19875")]);
        let mut source = TemperatureSource::new(device, Duration::from_secs(60));
        let cache = source.cache();

        source.poll(5_000);
        let seen = thread::spawn(move || cache.read()).join().unwrap();

        assert_eq!(seen.map(|r| r.milli_celsius), Some(19_875));
        assert_eq!(seen.map(|r| r.age_ms(65_000)), Some(60_000));
    }
}
