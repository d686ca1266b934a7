use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use serde::Serialize;
use warmoffice_common::{
    ConfigError, ControlMode, DirectOutlet, HeatControl, MotionTracker, OccupancyMachine,
    OccupancyState, OutletConfig, OutletSwitch, RuntimeConfig, TemperatureDevice,
    TemperatureSource, ThermostatController, Transmitter,
};

use crate::hardware::{CommandTransmitter, DryRunTransmitter, LineValueWatcher, W1Thermometer};

type BoxedTransmitter = Box<dyn Transmitter + Send>;
type BoxedHeat = Box<dyn HeatControl + Send>;
type BoxedDevice = Box<dyn TemperatureDevice + Send>;

const CONFIG_PATH_ENV: &str = "WARMOFFICE_CONFIG";
const STATE_ENV: &str = "WARMOFFICE_STATE";
const DRY_RUN_ENV: &str = "WARMOFFICE_DRY_RUN";
const DEFAULT_CONFIG_PATH: &str = "./warmoffice.json";

/// Upper bound on how long the temperature poller sleeps between checks.
const TEMPERATURE_CHECK_PERIOD: Duration = Duration::from_secs(1);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    info!(
        mode = config.control.mode.as_str(),
        initial = %config.control.initial_state,
        "starting warmoffice controller"
    );

    let device = match config.control.mode {
        ControlMode::Thermostat => Some(open_temperature_device(&config)?),
        ControlMode::Switch => None,
    };

    let line_path = config.motion.line_value_path();
    let watcher = LineValueWatcher::open(line_path.clone(), config.motion.poll).await?;
    info!("motion sensor using {}", line_path.display());
    info!(
        "tx using pin {}, protocol {}, pulse length {}",
        config.outlet.tx_pin, config.outlet.protocol, config.outlet.pulse_length
    );

    let transmitter = build_transmitter(&config.outlet);
    let components = Components::build(&config, transmitter, device, monotonic_ms())?;
    let motion = Arc::clone(&components.motion);

    let mut tasks = spawn_control_tasks(components, &config);
    let edges = watcher.spawn(motion, tasks.stop_receiver());
    tasks.attach(edges);

    supervise(tasks, wait_for_shutdown_signal()).await
}

/// Runs until `signal` resolves, then always stops the loops so the final
/// outlet-off is sent, even when waiting for the signal failed.
async fn supervise(
    tasks: ControlTasks,
    signal: impl Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let signal = signal.await;
    if let Err(err) = &signal {
        error!("stopping on signal handler failure: {err:#}");
    }
    info!("cleaning up");

    let outlet_on = tasks.shutdown().await?;
    if outlet_on {
        error!("outlet still believed on after shutdown");
    } else {
        info!("outlet off, controller stopped");
    }
    signal
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_config_file(&path)?;
    apply_overrides(
        &mut config,
        std::env::var(STATE_ENV).ok().as_deref(),
        std::env::var(DRY_RUN_ENV).ok().as_deref(),
    )?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn load_config_file(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => RuntimeConfig::from_json_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("config {} not found, using defaults", path.display());
            Ok(RuntimeConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("failed to read config {}", path.display())),
    }
}

fn apply_overrides(
    config: &mut RuntimeConfig,
    initial_state: Option<&str>,
    dry_run: Option<&str>,
) -> Result<(), ConfigError> {
    if let Some(name) = initial_state {
        config.control.initial_state = name.parse::<OccupancyState>()?;
    }
    if let Some(flag) = dry_run {
        if matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
            config.outlet.command = None;
        }
    }
    Ok(())
}

fn open_temperature_device(config: &RuntimeConfig) -> anyhow::Result<BoxedDevice> {
    let id = config
        .temperature
        .device_id
        .as_deref()
        .context("temperature.device_id is required in thermostat mode")?;
    let device = W1Thermometer::open(&config.temperature.base_path, id)
        .with_context(|| format!("failed to open temperature device {id}"))?;
    Ok(Box::new(device))
}

fn build_transmitter(outlet: &OutletConfig) -> BoxedTransmitter {
    match &outlet.command {
        Some(program) => Box::new(CommandTransmitter::new(program.clone())),
        None => {
            warn!("no outlet command configured, transmissions are dry-run only");
            Box::new(DryRunTransmitter)
        }
    }
}

struct Components {
    motion: Arc<MotionTracker>,
    occupancy: OccupancyMachine<BoxedHeat>,
    thermostat: Option<ThermostatController<BoxedTransmitter>>,
    temperature: Option<TemperatureSource<BoxedDevice>>,
}

impl Components {
    fn build(
        config: &RuntimeConfig,
        transmitter: BoxedTransmitter,
        device: Option<BoxedDevice>,
        now_ms: u64,
    ) -> anyhow::Result<Self> {
        let motion = Arc::new(MotionTracker::new(config.control.recent));
        motion.initialize(now_ms);
        let outlet = OutletSwitch::new(&config.outlet, transmitter);

        let (heat, thermostat, temperature) = match config.control.mode {
            ControlMode::Thermostat => {
                let device = device.context("thermostat mode requires a temperature device")?;
                let source = TemperatureSource::new(device, config.temperature.refresh);
                let thermostat =
                    ThermostatController::new(&config.thermostat, source.cache(), outlet);
                let heat: BoxedHeat = Box::new(thermostat.heat_flag());
                (heat, Some(thermostat), Some(source))
            }
            ControlMode::Switch => {
                let heat: BoxedHeat = Box::new(DirectOutlet::new(outlet));
                (heat, None, None)
            }
        };

        let occupancy =
            OccupancyMachine::new(&config.control, Arc::clone(&motion), heat, now_ms);

        Ok(Self {
            motion,
            occupancy,
            thermostat,
            temperature,
        })
    }
}

struct ControlTasks {
    stop: watch::Sender<bool>,
    occupancy: JoinHandle<OccupancyMachine<BoxedHeat>>,
    thermostat: Option<JoinHandle<ThermostatController<BoxedTransmitter>>>,
    background: Vec<JoinHandle<()>>,
}

impl ControlTasks {
    fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    fn attach(&mut self, handle: JoinHandle<()>) {
        self.background.push(handle);
    }

    /// Stops every loop and returns whether the outlet is still believed on.
    async fn shutdown(self) -> anyhow::Result<bool> {
        self.stop.send_replace(true);

        let occupancy = self.occupancy.await.context("occupancy loop panicked")?;
        let mut outlet_on = occupancy.heat().outlet_on();

        if let Some(handle) = self.thermostat {
            let thermostat = handle.await.context("thermostat loop panicked")?;
            let outlet = thermostat.outlet();
            info!(health = %to_json(outlet.health()), "{} released", outlet.name());
            outlet_on = Some(outlet.is_on());
        }

        for handle in self.background {
            handle.await.context("background task panicked")?;
        }

        Ok(outlet_on.unwrap_or(false))
    }
}

fn spawn_control_tasks(components: Components, config: &RuntimeConfig) -> ControlTasks {
    let (stop, stop_rx) = watch::channel(false);
    let mut background = Vec::new();

    if let Some(mut source) = components.temperature {
        // Prime the cache so the first thermostat cycle has a reading.
        tokio::task::block_in_place(|| source.poll(monotonic_ms()));
        background.push(spawn_temperature_poller(
            source,
            config.temperature.refresh.min(TEMPERATURE_CHECK_PERIOD),
            stop_rx.clone(),
        ));
    }

    let thermostat = components.thermostat.map(|controller| {
        spawn_thermostat_loop(controller, config.thermostat.period, stop_rx.clone())
    });

    let occupancy = spawn_occupancy_loop(components.occupancy, config.control.tick, stop_rx);

    ControlTasks {
        stop,
        occupancy,
        thermostat,
        background,
    }
}

fn spawn_occupancy_loop(
    mut machine: OccupancyMachine<BoxedHeat>,
    tick: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<OccupancyMachine<BoxedHeat>> {
    tokio::spawn(async move {
        loop {
            let now_ms = monotonic_ms();
            tokio::task::block_in_place(|| machine.tick(now_ms));
            debug!(status = %to_json(&machine.status(now_ms)), "occupancy");

            if sleep_or_stop(tick, &mut stop).await {
                break;
            }
        }

        tokio::task::block_in_place(|| machine.shutdown(monotonic_ms()));
        machine
    })
}

fn spawn_thermostat_loop(
    mut controller: ThermostatController<BoxedTransmitter>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<ThermostatController<BoxedTransmitter>> {
    debug!("starting thermostat");
    tokio::spawn(async move {
        loop {
            let now_ms = monotonic_ms();
            tokio::task::block_in_place(|| controller.cycle(now_ms));

            if sleep_or_stop(period, &mut stop).await {
                break;
            }
        }

        if let Err(err) = tokio::task::block_in_place(|| controller.shutdown()) {
            error!("failed to turn outlet off on shutdown: {err}");
        }
        controller
    })
}

fn spawn_temperature_poller(
    mut source: TemperatureSource<BoxedDevice>,
    check_period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !sleep_or_stop(check_period, &mut stop).await {
            tokio::task::block_in_place(|| source.poll(monotonic_ms()));
        }
        debug!("exit read loop");
    })
}

/// Sleeps for `period` unless a stop is requested first. Returns `true`
/// when the caller should exit its loop.
pub(crate) async fn sleep_or_stop(period: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| format!("<unserializable: {err}>"))
}

pub(crate) fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use warmoffice_common::{SensorError, TransmitError, TransmitRequest};

    use super::*;

    const ON: u64 = 1_361;
    const OFF: u64 = 1_364;

    #[derive(Clone, Default)]
    struct SharedLog(Arc<Mutex<Vec<u64>>>);

    impl SharedLog {
        fn codes(&self) -> Vec<u64> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Transmitter for SharedLog {
        fn transmit(&mut self, request: &TransmitRequest) -> Result<(), TransmitError> {
            self.0.lock().unwrap().push(request.code);
            Ok(())
        }
    }

    struct FixedDevice(&'static str);

    impl TemperatureDevice for FixedDevice {
        fn id(&self) -> &str {
            "28-fixed"
        }

        fn read_raw(&mut self) -> Result<String, SensorError> {
            Ok(self.0.to_string())
        }
    }

    fn fast_config(mode: ControlMode) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.control.mode = mode;
        config.control.initial_state = OccupancyState::Prewarm;
        config.control.tick = Duration::from_millis(10);
        config.thermostat.period = Duration::from_millis(10);
        config.thermostat.setpoint = 21_000;
        config.temperature.device_id = Some("28-fixed".to_string());
        config.outlet.on_code = ON;
        config.outlet.off_code = OFF;
        config
    }

    async fn run_for(config: &RuntimeConfig, device: Option<BoxedDevice>, log: &SharedLog) -> bool {
        let components =
            Components::build(config, Box::new(log.clone()), device, monotonic_ms()).unwrap();
        let tasks = spawn_control_tasks(components, config);
        tokio::time::sleep(Duration::from_millis(300)).await;
        tasks.shutdown().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn switch_mode_leaves_outlet_off_after_shutdown() {
        let config = fast_config(ControlMode::Switch);
        let log = SharedLog::default();

        let outlet_on = run_for(&config, None, &log).await;

        assert!(!outlet_on);
        assert_eq!(log.codes(), vec![ON, OFF]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thermostat_mode_heats_cold_room_then_shuts_off() {
        let config = fast_config(ControlMode::Thermostat);
        let log = SharedLog::default();
        let device: BoxedDevice = Box::new(FixedDevice("18500\n"));

        let outlet_on = run_for(&config, Some(device), &log).await;

        let codes = log.codes();
        assert!(!outlet_on);
        assert_eq!(codes.first(), Some(&ON));
        assert_eq!(codes.last(), Some(&OFF));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thermostat_mode_warm_room_never_heats() {
        let config = fast_config(ControlMode::Thermostat);
        let log = SharedLog::default();
        let device: BoxedDevice = Box::new(FixedDevice("23000\n"));

        let outlet_on = run_for(&config, Some(device), &log).await;

        assert!(!outlet_on);
        assert_eq!(log.codes(), vec![OFF]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_signal_wait_still_turns_outlet_off() {
        let config = fast_config(ControlMode::Switch);
        let log = SharedLog::default();
        let components =
            Components::build(&config, Box::new(log.clone()), None, monotonic_ms()).unwrap();
        let tasks = spawn_control_tasks(components, &config);

        let result = supervise(tasks, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<(), _>(anyhow::anyhow!("signal handler unavailable"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(log.codes().last(), Some(&OFF));
    }

    #[test]
    fn thermostat_mode_requires_device() {
        let config = fast_config(ControlMode::Thermostat);
        let result = Components::build(&config, Box::new(SharedLog::default()), None, 0);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sleep_or_stop_wakes_on_stop() {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let started = Instant::now();
        let waiter = tokio::spawn(async move {
            sleep_or_stop(Duration::from_secs(30), &mut stop_rx).await
        });

        stop_tx.send_replace(true);

        assert!(waiter.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sleep_or_stop_treats_dropped_sender_as_stop() {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        drop(stop_tx);
        assert!(sleep_or_stop(Duration::from_secs(30), &mut stop_rx).await);
    }

    #[test]
    fn overrides_replace_state_and_disable_sender() {
        let mut config = RuntimeConfig::default();
        config.outlet.command = Some("codesend".to_string());

        apply_overrides(&mut config, Some("active"), Some("true")).unwrap();

        assert_eq!(config.control.initial_state, OccupancyState::Active);
        assert_eq!(config.outlet.command, None);
    }

    #[test]
    fn override_with_unknown_state_fails() {
        let mut config = RuntimeConfig::default();
        assert!(apply_overrides(&mut config, Some("asleep"), None).is_err());
        assert_eq!(config.control.initial_state, OccupancyState::Off);
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_file(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.control.initial_state, OccupancyState::Off);
    }

    #[test]
    fn malformed_config_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warmoffice.json");
        std::fs::write(&path, r#"{ "control": { "max_idle": "forever" } }"#).unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid duration"));
    }
}
