//! Fluidics Instrument Control Library
//!
//! This library provides the device control core for a laboratory
//! fluidics instrument: a motorized syringe pump, two linear motion axes,
//! a multi-port rotary selector valve and a relay-controlled solenoid
//! bank, all addressed over a shared RS485 bus with a Modbus-style binary
//! protocol.

pub mod config;
pub mod controller;
pub mod devices;
pub mod modbus;
pub mod sequence;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use controller::{DeviceController, RunState, SafetyInterlock, StatusSnapshot};
pub use devices::{
    Axis, AxisCalibration, AxisDriver, MotionStatus, RelayBoard, RotaryValve, SyringeCalibration,
    SyringePump,
};
pub use modbus::{crc16_modbus, BusTransport, MockBus, PortRegistry, SerialBus};
pub use sequence::{SequenceOutcome, SequenceRunner};
pub use utils::cancel::CancelToken;
pub use utils::error::DeviceError;

pub const VERSION: &str = "1.0.0";
