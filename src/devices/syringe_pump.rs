use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::modbus::crc::{append_crc, verify_crc};
use crate::modbus::transport::BusTransport;
use crate::utils::cancel::CancelToken;
use crate::utils::error::DeviceError;

/// Plunger travel guard; targets beyond this are rejected before any I/O.
const MAX_VOLUME_ML: f64 = 180.0;
/// Flow commands are clamped to +/-15 mL/min before conversion.
const MAX_FLOW_ML_MIN: f64 = 15.0;

const STATUS_READ_TRIES: u32 = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(200);
const STATUS_RESPONSE_LEN: usize = 19;
const WRITE_ACK_LEN: usize = 8;

const IDLE_POLL: Duration = Duration::from_millis(250);
const SETTLE_POLL: Duration = Duration::from_millis(200);
const SETTLE_TOLERANCE_STEPS: i32 = 200;
const SETTLE_STABLE_CYCLES: u32 = 3;

pub const HOMING_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_POLL: Duration = Duration::from_millis(200);

/// Calibration constants converting between drive steps and millilitres.
#[derive(Debug, Clone, Copy)]
pub struct SyringeCalibration {
    pub steps_per_ml: f64,
    pub velocity_calib: f64,
}

/// Telemetry decoded from one status read. Produced fresh on every
/// successful poll; never cached here.
#[derive(Debug, Clone, Copy)]
pub struct MotionStatus {
    pub busy: bool,
    pub standstill: bool,
    pub velocity_ok: bool,
    pub position_ok: bool,
    pub mode: u8,
    pub actual_velocity: i32,
    pub actual_position: i32,
    pub volume_ml: f64,
    pub flow_ml_min: f64,
}

/// Modbus/RS485 syringe or linear-axis drive.
///
/// Motion and homing use Function 0x10 (Write Multiple Registers) with a
/// fixed payload template; telemetry uses Function 0x03. The shared bus
/// handle serializes frames against every other driver on the same port.
pub struct SyringePump {
    name: String,
    address: u8,
    bus: Arc<dyn BusTransport>,
    calib: SyringeCalibration,
}

impl SyringePump {
    pub fn new(name: &str, address: u8, bus: Arc<dyn BusTransport>, calib: SyringeCalibration) -> Self {
        Self {
            name: name.to_string(),
            address,
            bus,
            calib,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn calibration(&self) -> SyringeCalibration {
        self.calib
    }

    pub fn steps_from_volume(&self, volume_ml: f64) -> i32 {
        (volume_ml * self.calib.steps_per_ml).round() as i32
    }

    fn motion_frame(&self, volume_ml: f64, flow_ml_min: f64) -> Result<Vec<u8>, DeviceError> {
        if volume_ml.abs() > MAX_VOLUME_ML {
            return Err(DeviceError::InvalidData(format!(
                "volume must not exceed {} mL, got {}",
                MAX_VOLUME_ML, volume_ml
            )));
        }
        let flow = flow_ml_min.clamp(-MAX_FLOW_ML_MIN, MAX_FLOW_ML_MIN);
        let velocity = (self.calib.velocity_calib * flow).round() as i32;
        let steps = self.steps_from_volume(volume_ml);

        let mut frame = vec![
            self.address,
            0x10,
            0xA7,
            0x9E,
            0x00,
            0x07,
            0x0E,
            0x01,
            0x00,
            0x00,
            0x03,
            0x03,
            0xE8,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
            0x00,
        ];
        frame[13..17].copy_from_slice(&velocity.to_be_bytes());
        frame[17..21].copy_from_slice(&steps.to_be_bytes());
        append_crc(&mut frame);
        Ok(frame)
    }

    fn homing_frame(&self, flag_byte: u8) -> Vec<u8> {
        let mut frame = vec![
            self.address,
            0x10,
            0xA7,
            0x9E,
            0x00,
            0x07,
            0x0E,
            0x07,
            0x00,
            flag_byte,
            0x03,
            0x01,
            0xF4,
            0x00,
            0x00,
            0x03,
            0xE8,
            0x00,
            0x00,
            0x27,
            0x10,
        ];
        append_crc(&mut frame);
        frame
    }

    fn check_write_ack(&self, response: &[u8], what: &str) -> Result<(), DeviceError> {
        if response.len() != WRITE_ACK_LEN
            || response[0] != self.address
            || response[1] != 0x10
            || !verify_crc(response)
        {
            return Err(DeviceError::InvalidResponse(format!(
                "[{}] {} not acknowledged",
                self.name, what
            )));
        }
        Ok(())
    }

    /// Move the plunger to an absolute volume target. The command is sent
    /// once and never blindly resent: a lost ACK may still mean the drive
    /// accepted the motion.
    pub async fn goto_absolute(&self, volume_ml: f64, flow_ml_min: f64) -> Result<(), DeviceError> {
        let frame = self.motion_frame(volume_ml, flow_ml_min)?;
        debug!(
            "💉 [{}] goto {:.3} mL @ {:.2} mL/min",
            self.name, volume_ml, flow_ml_min
        );
        let response = self.bus.transact(&frame, WRITE_ACK_LEN).await?;
        self.check_write_ack(&response, "motion command")
    }

    /// Query drive status and live telemetry, retrying up to
    /// [`STATUS_READ_TRIES`] times on transport or protocol errors.
    pub async fn read_status(&self) -> Result<MotionStatus, DeviceError> {
        let mut poll = vec![self.address, 0x03, 0xA7, 0x3A, 0x00, 0x07];
        append_crc(&mut poll);

        let mut last_failure = String::new();
        for attempt in 1..=STATUS_READ_TRIES {
            let response = match self.bus.transact(&poll, STATUS_RESPONSE_LEN).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    last_failure = e.to_string();
                    tokio::time::sleep(STATUS_RETRY_DELAY).await;
                    continue;
                }
            };

            if response.len() != STATUS_RESPONSE_LEN {
                last_failure = format!("bad status length={}", response.len());
            } else if response[0] != self.address || response[1] != 0x03 || response[2] != 0x0E {
                last_failure = format!("bad status header={}", hex::encode(&response[..3]));
            } else if !verify_crc(&response) {
                last_failure = "bad CRC on status response".to_string();
            } else {
                return Ok(self.decode_status(&response));
            }

            debug!(
                "📡 [{}] status attempt {}/{} failed: {}",
                self.name, attempt, STATUS_READ_TRIES, last_failure
            );
            tokio::time::sleep(STATUS_RETRY_DELAY).await;
        }

        Err(DeviceError::CommunicationError(format!(
            "[{}] status unavailable after {} attempts: {}",
            self.name, STATUS_READ_TRIES, last_failure
        )))
    }

    fn decode_status(&self, response: &[u8]) -> MotionStatus {
        let sdw = u32::from_be_bytes([response[3], response[4], response[5], response[6]]);
        let actual_velocity =
            i32::from_be_bytes([response[9], response[10], response[11], response[12]]);
        let actual_position =
            i32::from_be_bytes([response[13], response[14], response[15], response[16]]);

        MotionStatus {
            busy: (sdw >> 8) & 1 == 1,
            standstill: (sdw >> 12) & 1 == 1,
            velocity_ok: (sdw >> 14) & 1 == 1,
            position_ok: (sdw >> 15) & 1 == 1,
            mode: ((sdw >> 24) & 0b111) as u8,
            actual_velocity,
            actual_position,
            volume_ml: actual_position as f64 / self.calib.steps_per_ml,
            flow_ml_min: actual_velocity as f64 / self.calib.velocity_calib,
        }
    }

    /// Poll until the drive answers a status read. Used as a connect probe.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.read_status().await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PROBE_POLL).await;
        }
    }

    /// Wait until the drive reports idle (busy == 0). Returns `false` on
    /// timeout or when the stop token fires.
    pub async fn wait_until_idle(&self, timeout: Duration, stop: Option<&CancelToken>) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if stop.map(CancelToken::is_cancelled).unwrap_or(false) {
                return false;
            }
            if let Ok(status) = self.read_status().await {
                if !status.busy {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            if !poll_sleep(stop, IDLE_POLL).await {
                return false;
            }
        }
    }

    /// Wait for the standstill telemetry bit.
    pub async fn wait_standstill(&self, timeout: Duration, stop: Option<&CancelToken>) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if stop.map(CancelToken::is_cancelled).unwrap_or(false) {
                return false;
            }
            if let Ok(status) = self.read_status().await {
                if status.standstill {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            if !poll_sleep(stop, SETTLE_POLL).await {
                return false;
            }
        }
    }

    /// Wait until standstill & position_ok hold with a stable position
    /// across several polls. Drives clear the busy bit slightly before the
    /// mechanics stop, so a single bit read is not enough.
    pub async fn wait_settled(&self, timeout: Duration, stop: Option<&CancelToken>) -> bool {
        let deadline = Instant::now() + timeout;
        let mut last_position: Option<i32> = None;
        let mut stable = 0u32;

        loop {
            if stop.map(CancelToken::is_cancelled).unwrap_or(false) {
                return false;
            }
            if let Ok(status) = self.read_status().await {
                if status.standstill && status.position_ok {
                    match last_position {
                        None => {
                            last_position = Some(status.actual_position);
                            stable = 1;
                        }
                        Some(previous) => {
                            if (status.actual_position - previous).abs() <= SETTLE_TOLERANCE_STEPS {
                                stable += 1;
                                if stable >= SETTLE_STABLE_CYCLES {
                                    return true;
                                }
                            } else {
                                stable = 0;
                            }
                            last_position = Some(status.actual_position);
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            if !poll_sleep(stop, SETTLE_POLL).await {
                return false;
            }
        }
    }

    /// Send the two-frame homing handshake and wait until the drive
    /// reports idle. Raises immediately if either frame is not
    /// acknowledged instead of silently continuing.
    pub async fn home(&self, stop: Option<&CancelToken>) -> Result<(), DeviceError> {
        info!("🏠 [{}] homing", self.name);
        for flag in [0x00u8, 0x02] {
            let frame = self.homing_frame(flag);
            let response = self.bus.transact(&frame, WRITE_ACK_LEN).await?;
            self.check_write_ack(&response, "homing command")?;
        }

        if self.wait_until_idle(HOMING_TIMEOUT, stop).await {
            info!("🏠 [{}] homing complete", self.name);
            return Ok(());
        }
        if stop.map(CancelToken::is_cancelled).unwrap_or(false) {
            Err(DeviceError::Hardware(format!(
                "{} homing interrupted by stop",
                self.name
            )))
        } else {
            Err(DeviceError::Hardware(format!(
                "{} homing timed out",
                self.name
            )))
        }
    }

    /// Halt motion with an out-of-band quick-stop frame. Reads the actual
    /// position first: re-sending a stale or zero target would command an
    /// unwanted jump.
    pub async fn quick_stop(&self) -> bool {
        let position = match self.read_status().await {
            Ok(status) => status.actual_position,
            Err(e) => {
                warn!("⚠️ [{}] quick stop skipped, no position: {}", self.name, e);
                return false;
            }
        };

        let mut frame = vec![
            self.address,
            0x10,
            0xA7,
            0x9E,
            0x00,
            0x07,
            0x0E,
            0x07,
            0x00,
            0x01,
            0x03,
            0x01,
            0xF4,
            0x00,
            0x00,
            0x00,
            0x00,
        ];
        frame.extend_from_slice(&position.to_be_bytes());
        append_crc(&mut frame);

        match self.bus.transact(&frame, WRITE_ACK_LEN).await {
            Ok(response) => self.check_write_ack(&response, "quick stop").is_ok(),
            Err(e) => {
                warn!("⚠️ [{}] quick stop failed: {}", self.name, e);
                false
            }
        }
    }

    /// Soft stop: re-command the current position at near-zero flow so
    /// motion ceases without a full homing cycle.
    pub async fn stop_motion(&self) -> bool {
        let current_ml = match self.read_status().await {
            Ok(status) => status.volume_ml,
            Err(_) => return false,
        };
        self.goto_absolute(current_ml, 0.1).await.is_ok()
    }
}

async fn poll_sleep(stop: Option<&CancelToken>, interval: Duration) -> bool {
    match stop {
        Some(token) => token.sleep(interval).await,
        None => {
            tokio::time::sleep(interval).await;
            true
        }
    }
}
