use async_trait::async_trait;
use log::{info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::interlock::SafetyInterlock;
use super::poller;
use super::state::{DeviceState, RunState, StatusSnapshot};
use crate::config::settings::{AxisConfig, Config};
use crate::devices::axis::{Axis, AxisDriver};
use crate::devices::relay_board::RelayBoard;
use crate::devices::rotary_valve::RotaryValve;
use crate::devices::syringe_pump::SyringePump;
use crate::devices::traits::{PortSelect, RelaySwitch, SyringeMotion};
use crate::modbus::transport::PortRegistry;
use crate::sequence::engine::{LogFn, SequenceOutcome, SequenceRunner, StepObserverFn};
use crate::sequence::programs::{self, AxisPresets, InitStrategy, SequenceIo};
use crate::utils::cancel::CancelToken;
use crate::utils::error::DeviceError;

/// Worker name used when `home_all` occupies the single-operation gate.
const HOMING: &str = "homing";

const BROADCAST_CAPACITY: usize = 32;
const PROBE_TIMEOUT: Duration = Duration::from_secs(6);
/// RPM enforced for automated sequence moves.
const SEQUENCE_AXIS_RPM: f64 = 5.0;

const SYRINGE_MOVE_TIMEOUT: Duration = Duration::from_secs(120);
const SYRINGE_POLL: Duration = Duration::from_millis(200);
const SYRINGE_AT_TARGET_TOLERANCE_STEPS: i32 = 10;
const SYRINGE_IDLE_CONFIRM_POLLS: u32 = 2;

struct Worker {
    name: String,
    handle: JoinHandle<()>,
}

/// Top-level orchestrator. Owns every driver instance, the shared device
/// state snapshot, the single-operation worker gate, the telemetry
/// poller, the safety interlock and the status broadcast fan-out.
pub struct DeviceController {
    /// Self-handle for spawning workers that outlive the calling scope.
    me: Weak<DeviceController>,
    device_id: String,
    config: Config,
    state: Mutex<DeviceState>,
    events: broadcast::Sender<StatusSnapshot>,
    stop: CancelToken,
    worker: Mutex<Option<Worker>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    relays: Arc<RelayBoard>,
    valve: Arc<RotaryValve>,
    syringe: Arc<SyringePump>,
    vertical: Arc<AxisDriver>,
    horizontal: Arc<AxisDriver>,
    interlock: SafetyInterlock,
}

impl DeviceController {
    /// Build the controller and its drivers over the given port registry.
    /// Drivers sharing a port path share one bus handle, which is the
    /// per-port frame lock.
    pub fn new(config: Config, ports: &PortRegistry) -> Arc<Self> {
        info!("🚀 Initializing device controller '{}'", config.device_id);

        let relay_bus = ports.open(&config.relay.port, config.relay.baud_rate, config.relay.timeout());
        let valve_bus = ports.open(
            &config.rotary_valve.port,
            config.rotary_valve.baud_rate,
            config.rotary_valve.timeout(),
        );
        let syringe_bus = ports.open(
            &config.syringe.port,
            config.syringe.baud_rate,
            config.syringe.timeout(),
        );
        let vertical_bus = ports.open(
            &config.vertical_axis.port,
            config.vertical_axis.baud_rate,
            config.vertical_axis.timeout(),
        );
        let horizontal_bus = ports.open(
            &config.horizontal_axis.port,
            config.horizontal_axis.baud_rate,
            config.horizontal_axis.timeout(),
        );

        let relays = Arc::new(RelayBoard::new(config.relay.address, relay_bus));
        let valve = Arc::new(RotaryValve::new(config.rotary_valve.address, valve_bus));
        let syringe = Arc::new(SyringePump::new(
            "Syringe",
            config.syringe.address,
            syringe_bus,
            config.syringe.calibration(),
        ));
        let vertical = Arc::new(AxisDriver::new(
            &config.vertical_axis.name,
            config.vertical_axis.address,
            vertical_bus,
            config.vertical_axis.calibration(),
        ));
        let horizontal = Arc::new(AxisDriver::new(
            &config.horizontal_axis.name,
            config.horizontal_axis.address,
            horizontal_bus,
            config.horizontal_axis.calibration(),
        ));

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let interlock = SafetyInterlock::new(config.safety.vertical_guard_mm);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            device_id: config.device_id.clone(),
            config,
            state: Mutex::new(DeviceState::new()),
            events,
            stop: CancelToken::new(),
            worker: Mutex::new(None),
            poller: Mutex::new(None),
            relays,
            valve,
            syringe,
            vertical,
            horizontal,
            interlock,
        })
    }

    fn handle(&self) -> Result<Arc<Self>, DeviceError> {
        self.me
            .upgrade()
            .ok_or_else(|| DeviceError::ConnectionError("controller no longer available".to_string()))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // State access
    // ------------------------------------------------------------------

    fn with_state<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> Result<T, DeviceError> {
        let mut state = self.state.lock().map_err(|_| DeviceError::LockError)?;
        Ok(f(&mut state))
    }

    fn publish(&self) {
        let snapshot = self.with_state(|st| st.snapshot(&self.device_id)).ok();
        if let Some(snapshot) = snapshot {
            // Lossy fan-out: lagging subscribers miss snapshots rather
            // than ever blocking the controller.
            let _ = self.events.send(snapshot);
        }
    }

    fn log_line(&self, message: &str) {
        info!("{}", message);
        let _ = self.with_state(|st| st.push_log(message));
    }

    /// Complete, consistently-read state snapshot.
    pub fn get_status(&self) -> Result<StatusSnapshot, DeviceError> {
        self.with_state(|st| st.snapshot(&self.device_id))
    }

    /// Subscribe to snapshot events. Slow subscribers lag and drop, they
    /// never block the state mutex holder.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Worker gate
    // ------------------------------------------------------------------

    fn display_of(key: &str) -> &str {
        if key == HOMING {
            "Homing"
        } else {
            programs::display_name(key)
        }
    }

    /// Claim the single-operation gate and spawn the worker. Liveness is
    /// checked on the worker handle, not the state field, so a thread
    /// still finishing cannot race a fresh start.
    fn spawn_worker(&self, key: &'static str) -> Result<(), DeviceError> {
        let mut worker = self.worker.lock().map_err(|_| DeviceError::LockError)?;
        if let Some(active) = worker.as_ref() {
            if !active.handle.is_finished() {
                return Err(DeviceError::Busy(format!(
                    "operation '{}' already active",
                    active.name
                )));
            }
        }

        self.stop.reset();
        {
            let mut state = self.state.lock().map_err(|_| DeviceError::LockError)?;
            state.run_state = RunState::Running;
            state.current_sequence = Some(key.to_string());
            state.sequence_step = None;
            state.last_error = None;
            state.stop_requested = false;
            state.push_log(format!("▶️ {} started", Self::display_of(key)));
        }

        let ctrl = self.handle()?;
        let handle = tokio::spawn(async move { ctrl.run_worker(key).await });
        *worker = Some(Worker {
            name: key.to_string(),
            handle,
        });
        drop(worker);
        self.publish();
        Ok(())
    }

    /// Start a named sequence. Fails fast if any worker is active.
    pub fn start_sequence(&self, name: &str) -> Result<(), DeviceError> {
        let key = programs::resolve(name).ok_or_else(|| {
            DeviceError::InvalidData(format!("unknown sequence '{}'", name))
        })?;
        self.spawn_worker(key)
    }

    /// Home both axes and the syringe under the same gate as sequences.
    pub fn home_all(&self) -> Result<(), DeviceError> {
        self.spawn_worker(HOMING)
    }

    /// Raise the stop flag and flip to ERROR. Stopping is a
    /// terminal-until-acknowledged fault, not a return to idle; recovery
    /// requires a fresh sequence or homing command.
    pub fn stop_sequence(&self) -> Result<(), DeviceError> {
        self.log_line("🛑 Stop requested");
        self.stop.cancel();
        self.with_state(|st| {
            st.stop_requested = true;
            st.run_state = RunState::Error;
            st.last_error = Some("Stop requested by operator".to_string());
        })?;
        self.publish();
        Ok(())
    }

    /// Stop plus hardware-level halt: quick-stop every drive and drop the
    /// whole relay bank.
    pub async fn emergency_stop(&self) -> Result<(), DeviceError> {
        self.log_line("🛑 EMERGENCY STOP triggered");
        self.stop.cancel();
        self.with_state(|st| {
            st.stop_requested = true;
            st.run_state = RunState::Error;
            st.last_error = Some("Emergency stop activated".to_string());
        })?;
        self.publish();

        if !self.syringe.quick_stop().await {
            self.log_line("⚠️ [Syringe] quick stop not acknowledged");
        }
        for axis in [Axis::Z, Axis::X] {
            let driver = self.axis_driver(axis);
            if driver.ready() && !driver.quick_stop().await {
                self.log_line(&format!("⚠️ [{}] quick stop not acknowledged", driver.name()));
            }
        }
        match self.relays.set_all_off().await {
            Ok(()) => {
                self.with_state(|st| {
                    for channel in 1..=8 {
                        st.relay_states.insert(channel, false);
                    }
                })?;
            }
            Err(e) => self.log_line(&format!("⚠️ relay all-off failed: {}", e)),
        }
        self.publish();
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, key: &'static str) {
        let display = Self::display_of(key).to_string();
        let result = self.execute(key).await;
        let stopped = self.stop.is_cancelled();

        let (final_state, failure) = match result {
            Ok(SequenceOutcome::Completed) if !stopped => (RunState::Idle, None),
            Ok(SequenceOutcome::Completed) | Ok(SequenceOutcome::Aborted) if stopped => {
                (RunState::Error, Some(format!("{} stopped", display)))
            }
            Ok(_) => (RunState::Error, Some(format!("{} aborted", display))),
            Err(e) => (RunState::Error, Some(e.to_string())),
        };

        let _ = self.with_state(|st| {
            st.run_state = final_state;
            match &failure {
                Some(message) => {
                    st.last_error = Some(message.clone());
                    st.push_log(format!("❌ {}", message));
                }
                None => st.push_log(format!("✅ {} complete", display)),
            }
            // Leaving Running clears sequence, step and stop flag together.
            st.clear_run();
        });
        self.publish();
    }

    async fn execute(&self, key: &'static str) -> Result<SequenceOutcome, DeviceError> {
        if key == HOMING {
            return self
                .full_init(Some(&self.stop))
                .await
                .map(|_| SequenceOutcome::Completed);
        }

        let ctrl = self.handle()?;
        let log_ctrl = Arc::clone(&ctrl);
        let log: LogFn = Arc::new(move |message: &str| {
            info!("{}", message);
            let _ = log_ctrl.with_state(|st| st.push_log(message));
        });

        let observer_ctrl = Arc::clone(&ctrl);
        let observer: StepObserverFn = Arc::new(move |label: &str| {
            let _ = observer_ctrl.with_state(|st| st.sequence_step = Some(label.to_string()));
            observer_ctrl.publish();
            true
        });

        let runner =
            SequenceRunner::new(Self::display_of(key), self.stop.clone(), log).with_observer(observer);
        let io = SequenceIo {
            relays: Arc::new(SequenceRelays(Arc::clone(&ctrl))),
            syringe: Arc::new(SequenceSyringe(Arc::clone(&ctrl))),
            valve: Arc::new(SequenceValve(Arc::clone(&ctrl))),
            axes: Arc::new(SequenceAxes(Arc::clone(&ctrl))),
            init: Arc::new(SequenceInit(Arc::clone(&ctrl))),
        };

        match key {
            programs::MAF_SAMPLING => Ok(programs::run_maf_sampling(&runner, &io).await),
            programs::SEQUENCE_TWO => Ok(programs::run_sequence_two(&runner, &io).await),
            other => Err(DeviceError::InvalidData(format!(
                "unknown sequence '{}'",
                other
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Manual command surface (rejected while a worker is active)
    // ------------------------------------------------------------------

    fn ensure_manual_allowed(&self) -> Result<(), DeviceError> {
        let worker = self.worker.lock().map_err(|_| DeviceError::LockError)?;
        if let Some(active) = worker.as_ref() {
            if !active.handle.is_finished() {
                return Err(DeviceError::Busy(format!(
                    "manual control locked while '{}' is running",
                    active.name
                )));
            }
        }
        Ok(())
    }

    pub async fn set_relay(&self, channel: u8, on: bool) -> Result<(), DeviceError> {
        self.ensure_manual_allowed()?;
        self.apply_relay(channel, on).await
    }

    pub async fn set_rotary_port(&self, port: u8) -> Result<(), DeviceError> {
        self.ensure_manual_allowed()?;
        self.apply_rotary(port).await
    }

    pub async fn move_syringe(&self, volume_ml: f64, flow_ml_min: f64) -> Result<(), DeviceError> {
        self.ensure_manual_allowed()?;
        self.apply_syringe(volume_ml, flow_ml_min, None).await
    }

    pub async fn move_axis(&self, axis: Axis, position_mm: f64, rpm: f64) -> Result<(), DeviceError> {
        self.ensure_manual_allowed()?;
        self.apply_axis_move(axis, position_mm, rpm, None).await
    }

    pub async fn home_axis(&self, axis: Axis) -> Result<(), DeviceError> {
        self.ensure_manual_allowed()?;
        self.apply_axis_home(axis, None).await
    }

    /// Bind an axis drive ahead of a manual command, outside of a full
    /// initialization.
    pub async fn axis_connect_if_needed(&self, axis: Axis) -> Result<(), DeviceError> {
        let driver = self.axis_driver(axis);
        if driver.ready() {
            return Ok(());
        }
        driver
            .connect(self.config.verify_on_connect, PROBE_TIMEOUT)
            .await
    }

    // ------------------------------------------------------------------
    // Hardware operations shared by manual commands and sequences
    // ------------------------------------------------------------------

    fn axis_driver(&self, axis: Axis) -> &Arc<AxisDriver> {
        match axis {
            Axis::X => &self.horizontal,
            Axis::Z => &self.vertical,
        }
    }

    fn axis_config(&self, axis: Axis) -> &AxisConfig {
        match axis {
            Axis::X => &self.config.horizontal_axis,
            Axis::Z => &self.config.vertical_axis,
        }
    }

    /// Re-evaluate the interlock from the last-known vertical position.
    /// Never cached: the vertical axis can move between checks.
    fn check_horizontal_allowed(&self) -> Result<(), DeviceError> {
        let vertical_mm = self.with_state(|st| st.axis_targets_mm.get(&Axis::Z).copied())?;
        self.interlock.evaluate(vertical_mm)
    }

    async fn apply_relay(&self, channel: u8, on: bool) -> Result<(), DeviceError> {
        if on {
            self.relays.set_on(channel).await?;
        } else {
            self.relays.set_off(channel).await?;
        }
        self.with_state(|st| {
            st.relay_states.insert(channel, on);
            st.push_log(format!(
                "[Relay {}] -> {}",
                channel,
                if on { "ON" } else { "OFF" }
            ));
        })?;
        self.publish();
        Ok(())
    }

    async fn apply_all_relays_off(&self) -> Result<(), DeviceError> {
        self.relays.set_all_off().await?;
        self.with_state(|st| {
            for channel in 1..=8 {
                st.relay_states.insert(channel, false);
            }
            st.push_log("[Relays] ALL OFF");
        })?;
        self.publish();
        Ok(())
    }

    async fn apply_rotary(&self, port: u8) -> Result<(), DeviceError> {
        self.valve.set_port(port).await?;
        self.with_state(|st| {
            st.rotary_port = Some(port);
            st.push_log(format!("[Rotary] -> Port {}", port));
        })?;
        self.publish();
        Ok(())
    }

    /// Command the syringe and block until the drive settles at the
    /// target, refreshing the live volume for observers along the way.
    async fn apply_syringe(
        &self,
        volume_ml: f64,
        flow_ml_min: f64,
        stop: Option<&CancelToken>,
    ) -> Result<(), DeviceError> {
        self.log_line(&format!(
            "[Syringe] move to {:.3} mL @ {:.2} mL/min",
            volume_ml, flow_ml_min
        ));
        let target_steps = self.syringe.steps_from_volume(volume_ml);

        self.with_state(|st| {
            st.syringe_busy = true;
            st.syringe_target_ml = Some(volume_ml);
        })?;
        self.publish();

        let result = self
            .drive_syringe_to(volume_ml, flow_ml_min, target_steps, stop)
            .await;

        self.with_state(|st| st.syringe_busy = false)?;
        self.publish();
        result
    }

    async fn drive_syringe_to(
        &self,
        volume_ml: f64,
        flow_ml_min: f64,
        target_steps: i32,
        stop: Option<&CancelToken>,
    ) -> Result<(), DeviceError> {
        self.syringe.goto_absolute(volume_ml, flow_ml_min).await?;

        let deadline = Instant::now() + SYRINGE_MOVE_TIMEOUT;
        let mut consecutive_idle = 0u32;
        loop {
            if stop.map(CancelToken::is_cancelled).unwrap_or(false) {
                return Err(DeviceError::Hardware(
                    "Syringe move interrupted by stop".to_string(),
                ));
            }
            if let Ok(status) = self.syringe.read_status().await {
                self.with_state(|st| st.syringe_volume_ml = Some(status.volume_ml))?;
                let at_target =
                    (status.actual_position - target_steps).abs() <= SYRINGE_AT_TARGET_TOLERANCE_STEPS;
                if !status.busy && at_target {
                    consecutive_idle += 1;
                    if consecutive_idle >= SYRINGE_IDLE_CONFIRM_POLLS {
                        return Ok(());
                    }
                } else {
                    consecutive_idle = 0;
                }
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Hardware("Syringe move timed out".to_string()));
            }
            match stop {
                Some(token) => {
                    token.sleep(SYRINGE_POLL).await;
                }
                None => tokio::time::sleep(SYRINGE_POLL).await,
            }
        }
    }

    async fn apply_axis_move(
        &self,
        axis: Axis,
        target_mm: f64,
        rpm: f64,
        stop: Option<&CancelToken>,
    ) -> Result<(), DeviceError> {
        if axis == Axis::X {
            self.check_horizontal_allowed()?;
        }
        let driver = self.axis_driver(axis);
        let clamped = driver.clamp_mm(target_mm);
        driver.move_to_mm(target_mm, rpm, stop).await?;
        self.with_state(|st| {
            st.axis_targets_mm.insert(axis, clamped);
            st.push_log(format!("[{}] -> {:.3} mm", driver.name(), clamped));
        })?;
        self.publish();
        Ok(())
    }

    async fn apply_axis_home(&self, axis: Axis, stop: Option<&CancelToken>) -> Result<(), DeviceError> {
        if axis == Axis::X {
            self.check_horizontal_allowed()?;
        }
        let driver = self.axis_driver(axis);
        driver.home(stop).await?;
        self.with_state(|st| {
            st.axis_homed.insert(axis, true);
            st.axis_targets_mm.insert(axis, 0.0);
            st.push_log(format!("[{}] homed", driver.name()));
        })?;
        self.publish();
        Ok(())
    }

    async fn move_axis_preset(&self, axis: Axis, key: &str) -> Result<(), DeviceError> {
        let config = self.axis_config(axis);
        let target_mm = config.preset(key).ok_or_else(|| {
            DeviceError::ConfigError(format!("{} preset '{}' undefined", config.name, key))
        })?;
        self.apply_axis_move(axis, target_mm, SEQUENCE_AXIS_RPM, Some(&self.stop))
            .await
    }

    /// Full initialization: relays off, axes connected and homed
    /// (vertical before horizontal, so the interlock clears), then the
    /// syringe homed.
    async fn full_init(&self, stop: Option<&CancelToken>) -> Result<(), DeviceError> {
        self.log_line("🔧 Full initialization start");

        // Filter-loader relays must be off before anything moves.
        for channel in [1u8, 5, 6] {
            if let Err(e) = self.relays.set_off(channel).await {
                warn!("⚠️ [Relay {}] pre-check off failed: {}", channel, e);
            }
        }
        if let Err(e) = self.apply_all_relays_off().await {
            self.log_line(&format!("⚠️ relay all-off failed: {}", e));
        }

        for axis in [Axis::Z, Axis::X] {
            check_init_stop(stop)?;
            let driver = self.axis_driver(axis);
            if !driver.ready() {
                driver
                    .connect(self.config.verify_on_connect, PROBE_TIMEOUT)
                    .await?;
            }
            if driver.is_busy().await == Some(true) {
                self.log_line(&format!("[{}] busy before home -> quick stop", driver.name()));
                driver.quick_stop().await;
            }
            self.apply_axis_home(axis, stop).await?;
        }

        check_init_stop(stop)?;
        self.log_line("[Syringe] homing");
        self.syringe.home(stop).await?;
        self.with_state(|st| {
            st.syringe_volume_ml = Some(0.0);
            st.syringe_target_ml = Some(0.0);
        })?;
        self.publish();

        self.log_line("✅ Full initialization complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Telemetry poller
    // ------------------------------------------------------------------

    pub(crate) fn syringe(&self) -> Arc<SyringePump> {
        Arc::clone(&self.syringe)
    }

    pub(crate) fn poll_update(&self, active: bool, volume_ml: f64) {
        let _ = self.with_state(|st| {
            st.syringe_busy = active;
            st.syringe_volume_ml = Some(volume_ml);
        });
        self.publish();
    }

    /// Spawn the background telemetry poller.
    pub fn start_poller(&self) {
        let ctrl = match self.handle() {
            Ok(ctrl) => ctrl,
            Err(_) => return,
        };
        let mut slot = match self.poller.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        *slot = Some(tokio::spawn(poller::run(ctrl)));
        info!("📡 Telemetry poller started");
    }

    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.poller.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

// ----------------------------------------------------------------------
// Sequence-facing adapters. Sequences drive hardware through these, so
// the manual-command guard is bypassed structurally, never via a flag.
// ----------------------------------------------------------------------

struct SequenceRelays(Arc<DeviceController>);

#[async_trait]
impl RelaySwitch for SequenceRelays {
    async fn on(&self, channel: u8) -> Result<(), DeviceError> {
        self.0.apply_relay(channel, true).await
    }

    async fn off(&self, channel: u8) -> Result<(), DeviceError> {
        self.0.apply_relay(channel, false).await
    }

    async fn all_off(&self) -> Result<(), DeviceError> {
        self.0.apply_all_relays_off().await
    }
}

struct SequenceSyringe(Arc<DeviceController>);

#[async_trait]
impl SyringeMotion for SequenceSyringe {
    async fn goto_absolute(&self, volume_ml: f64, flow_ml_min: f64) -> Result<(), DeviceError> {
        let stop = self.0.stop.clone();
        self.0.apply_syringe(volume_ml, flow_ml_min, Some(&stop)).await
    }
}

struct SequenceValve(Arc<DeviceController>);

#[async_trait]
impl PortSelect for SequenceValve {
    async fn select_port(&self, port: u8) -> Result<(), DeviceError> {
        self.0.apply_rotary(port).await
    }
}

struct SequenceAxes(Arc<DeviceController>);

#[async_trait]
impl AxisPresets for SequenceAxes {
    async fn horizontal_to_filtering(&self) -> Result<(), DeviceError> {
        self.0.move_axis_preset(Axis::X, "filtering").await
    }

    async fn horizontal_home(&self) -> Result<(), DeviceError> {
        self.0.move_axis_preset(Axis::X, "filter in").await
    }

    async fn vertical_close(&self) -> Result<(), DeviceError> {
        self.0.move_axis_preset(Axis::Z, "close").await
    }

    async fn vertical_open(&self) -> Result<(), DeviceError> {
        self.0.move_axis_preset(Axis::Z, "open").await
    }
}

struct SequenceInit(Arc<DeviceController>);

#[async_trait]
impl InitStrategy for SequenceInit {
    async fn initialize(&self) -> Result<(), DeviceError> {
        let stop = self.0.stop.clone();
        self.0.full_init(Some(&stop)).await
    }
}

fn check_init_stop(stop: Option<&CancelToken>) -> Result<(), DeviceError> {
    if stop.map(CancelToken::is_cancelled).unwrap_or(false) {
        Err(DeviceError::Hardware(
            "Initialization aborted by stop".to_string(),
        ))
    } else {
        Ok(())
    }
}
