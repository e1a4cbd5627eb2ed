use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::syringe_pump::{SyringeCalibration, SyringePump};
use crate::modbus::transport::BusTransport;
use crate::utils::cancel::CancelToken;
use crate::utils::error::DeviceError;

/// Steps-per-second gained per commanded RPM on the axis drives.
const AXIS_SPEED_STEPS_PER_RPM: f64 = 5.0;
/// Axis flow commands stay inside the drive's usable band.
const MIN_AXIS_FLOW_ML_MIN: f64 = 0.5;
const MAX_AXIS_FLOW_ML_MIN: f64 = 15.0;

const STANDSTILL_TIMEOUT: Duration = Duration::from_secs(30);
const MOVE_TIMEOUT: Duration = Duration::from_secs(600);
const HOMING_SETTLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Targets closer than this to the current position are treated as done.
const POSITION_EPSILON_MM: f64 = 0.01;

/// Motion axis identifier: X is horizontal, Z is vertical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

impl FromStr for Axis {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Z" => Ok(Axis::Z),
            other => Err(DeviceError::InvalidData(format!(
                "unknown axis '{}', expected X or Z",
                other
            ))),
        }
    }
}

/// Calibration and travel limits for one linear axis.
#[derive(Debug, Clone, Copy)]
pub struct AxisCalibration {
    pub steps_per_ml: f64,
    pub velocity_calib: f64,
    pub steps_per_mm: f64,
    pub min_mm: Option<f64>,
    pub max_mm: Option<f64>,
}

/// Unit-conversion layer over a [`SyringePump`] drive: millimetre targets
/// and RPM speeds become volume/flow register writes.
pub struct AxisDriver {
    name: String,
    address: u8,
    bus: Arc<dyn BusTransport>,
    calib: AxisCalibration,
    pump: Mutex<Option<Arc<SyringePump>>>,
}

impl AxisDriver {
    pub fn new(name: &str, address: u8, bus: Arc<dyn BusTransport>, calib: AxisCalibration) -> Self {
        Self {
            name: name.to_string(),
            address,
            bus,
            calib,
            pump: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ready(&self) -> bool {
        self.pump.lock().map(|pump| pump.is_some()).unwrap_or(false)
    }

    /// Bind the drive, optionally probing it for a status response first.
    pub async fn connect(&self, verify: bool, timeout: Duration) -> Result<(), DeviceError> {
        let pump = Arc::new(SyringePump::new(
            &self.name,
            self.address,
            Arc::clone(&self.bus),
            SyringeCalibration {
                steps_per_ml: self.calib.steps_per_ml,
                velocity_calib: self.calib.velocity_calib,
            },
        ));
        if verify && !pump.probe(timeout).await {
            return Err(DeviceError::ConnectionError(format!(
                "{} no response on {} @ {:#04x}",
                self.name,
                self.bus.port_name(),
                self.address
            )));
        }
        if let Ok(mut slot) = self.pump.lock() {
            *slot = Some(pump);
        }
        info!(
            "🔗 [{}] connected on {} @ {:#04x}",
            self.name,
            self.bus.port_name(),
            self.address
        );
        Ok(())
    }

    pub fn disconnect(&self) {
        if let Ok(mut slot) = self.pump.lock() {
            *slot = None;
        }
        info!("🔗 [{}] disconnected", self.name);
    }

    fn require_pump(&self) -> Result<Arc<SyringePump>, DeviceError> {
        self.pump
            .lock()
            .map_err(|_| DeviceError::LockError)?
            .as_ref()
            .cloned()
            .ok_or_else(|| DeviceError::NotConnected(format!("{} axis unavailable", self.name)))
    }

    pub fn clamp_mm(&self, target_mm: f64) -> f64 {
        let mut clamped = target_mm;
        if let Some(min) = self.calib.min_mm {
            clamped = clamped.max(min);
        }
        if let Some(max) = self.calib.max_mm {
            clamped = clamped.min(max);
        }
        clamped
    }

    fn mm_to_ml(&self, mm: f64) -> f64 {
        (mm * self.calib.steps_per_mm) / self.calib.steps_per_ml
    }

    fn flow_from_rpm(&self, rpm: f64) -> f64 {
        let steps_per_second = rpm.max(0.1) * AXIS_SPEED_STEPS_PER_RPM;
        let flow = (steps_per_second * 60.0) / self.calib.steps_per_ml.max(1.0);
        flow.clamp(MIN_AXIS_FLOW_ML_MIN, MAX_AXIS_FLOW_ML_MIN)
    }

    /// Current position in millimetres, if the drive answers.
    pub async fn position_mm(&self) -> Option<f64> {
        let pump = self.require_pump().ok()?;
        let status = pump.read_status().await.ok()?;
        Some(status.actual_position as f64 / self.calib.steps_per_mm)
    }

    pub async fn is_busy(&self) -> Option<bool> {
        let pump = self.require_pump().ok()?;
        pump.read_status().await.ok().map(|status| status.busy)
    }

    /// Move to an absolute millimetre target and block until the drive
    /// has settled there.
    pub async fn move_to_mm(
        &self,
        target_mm: f64,
        rpm: f64,
        stop: Option<&CancelToken>,
    ) -> Result<(), DeviceError> {
        let pump = self.require_pump()?;
        let target_mm = self.clamp_mm(target_mm);
        let target_ml = self.mm_to_ml(target_mm);

        if !pump.wait_standstill(STANDSTILL_TIMEOUT, stop).await {
            return Err(DeviceError::Hardware(format!(
                "{} axis busy (no standstill)",
                self.name
            )));
        }

        let current_mm = self.position_mm().await;
        if let Some(current) = current_mm {
            if (target_mm - current).abs() < POSITION_EPSILON_MM {
                info!(
                    "📐 [{}] already at target ({:.3} mm)",
                    self.name, target_mm
                );
                return Ok(());
            }
        }

        let mut flow = self.flow_from_rpm(rpm);
        match current_mm {
            Some(current) if target_mm < current => flow = -flow,
            None if target_mm < 0.0 => flow = -flow,
            _ => {}
        }

        info!(
            "📐 [{}] target {:.3} mm @ {:.1} RPM",
            self.name, target_mm, rpm
        );
        pump.goto_absolute(target_ml, flow).await?;

        if !pump.wait_settled(MOVE_TIMEOUT, stop).await {
            return Err(DeviceError::Hardware(format!(
                "{} move incomplete (no standstill/pos_ok)",
                self.name
            )));
        }
        info!("📐 [{}] move complete", self.name);
        Ok(())
    }

    /// Run the homing handshake and wait for the drive to settle at zero.
    pub async fn home(&self, stop: Option<&CancelToken>) -> Result<(), DeviceError> {
        let pump = self.require_pump()?;
        pump.home(stop).await?;
        if !pump.wait_standstill(HOMING_SETTLE_TIMEOUT, stop).await {
            return Err(DeviceError::Hardware(format!(
                "{} homing did not reach standstill",
                self.name
            )));
        }
        info!("🏠 [{}] homed", self.name);
        Ok(())
    }

    pub async fn quick_stop(&self) -> bool {
        match self.require_pump() {
            Ok(pump) => pump.quick_stop().await,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::mock::MockBus;

    fn axis_with_bus() -> (AxisDriver, Arc<MockBus>) {
        let bus = Arc::new(MockBus::new("mock-axis"));
        let calib = AxisCalibration {
            steps_per_ml: 2000.0,
            velocity_calib: 1000.0,
            steps_per_mm: 2000.0,
            min_mm: Some(0.0),
            max_mm: Some(33.0),
        };
        (
            AxisDriver::new("Vertical Axis", 0x4E, bus.clone() as Arc<dyn BusTransport>, calib),
            bus,
        )
    }

    #[tokio::test]
    async fn operations_require_prior_connect() {
        let (axis, _bus) = axis_with_bus();
        assert!(!axis.ready());
        assert!(matches!(
            axis.move_to_mm(10.0, 5.0, None).await,
            Err(DeviceError::NotConnected(_))
        ));
        assert!(matches!(
            axis.home(None).await,
            Err(DeviceError::NotConnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn move_converts_millimetres_and_clamps_travel() {
        let (axis, bus) = axis_with_bus();
        axis.connect(false, Duration::from_secs(1)).await.unwrap();
        // 50 mm clamps to the 33 mm travel limit; 33 mm * 2000 steps/mm
        // over 2000 steps/mL commands 33 mL = 66000 steps.
        axis.move_to_mm(50.0, 5.0, None).await.unwrap();
        assert_eq!(bus.position(0x4E), 66_000);
        let position = axis.position_mm().await.unwrap();
        assert!((position - 33.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn move_skips_when_already_at_target() {
        let (axis, bus) = axis_with_bus();
        axis.connect(false, Duration::from_secs(1)).await.unwrap();
        bus.set_position(0x4E, 20_000); // 10 mm
        let frames_before = bus.frame_count();
        axis.move_to_mm(10.0, 5.0, None).await.unwrap();
        // only status polls, no 0x10 motion frame
        let motion_frames = bus
            .frames()
            .into_iter()
            .skip(frames_before)
            .filter(|frame| frame[1] == 0x10)
            .count();
        assert_eq!(motion_frames, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn home_zeroes_the_axis() {
        let (axis, bus) = axis_with_bus();
        axis.connect(false, Duration::from_secs(1)).await.unwrap();
        bus.set_position(0x4E, 44_000);
        axis.home(None).await.unwrap();
        assert_eq!(bus.position(0x4E), 0);
    }

    #[test]
    fn axis_parses_case_insensitively() {
        assert_eq!("x".parse::<Axis>().unwrap(), Axis::X);
        assert_eq!(" Z ".parse::<Axis>().unwrap(), Axis::Z);
        assert!("y".parse::<Axis>().is_err());
    }

    #[test]
    fn flow_from_rpm_stays_in_drive_band() {
        let (axis, _bus) = axis_with_bus();
        // 5 RPM * 5 steps/s/RPM * 60 / 2000 = 0.75 mL/min
        assert!((axis.flow_from_rpm(5.0) - 0.75).abs() < 1e-9);
        assert!((axis.flow_from_rpm(0.0) - MIN_AXIS_FLOW_ML_MIN).abs() < 1e-9);
        assert!((axis.flow_from_rpm(100_000.0) - MAX_AXIS_FLOW_ML_MIN).abs() < 1e-9);
    }
}
