use async_trait::async_trait;

use crate::utils::error::DeviceError;

/// Relay channel switching capability.
///
/// Sequences only see this surface; concrete relay hardware and test
/// fakes both implement it.
#[async_trait]
pub trait RelaySwitch: Send + Sync {
    async fn on(&self, channel: u8) -> Result<(), DeviceError>;
    async fn off(&self, channel: u8) -> Result<(), DeviceError>;
    async fn all_off(&self) -> Result<(), DeviceError>;
}

/// Absolute syringe plunger motion capability.
#[async_trait]
pub trait SyringeMotion: Send + Sync {
    /// Move the plunger to `volume_ml` at `flow_ml_min`, blocking until
    /// the drive has settled.
    async fn goto_absolute(&self, volume_ml: f64, flow_ml_min: f64) -> Result<(), DeviceError>;
}

/// Rotary selector valve port switching capability.
#[async_trait]
pub trait PortSelect: Send + Sync {
    async fn select_port(&self, port: u8) -> Result<(), DeviceError>;
}
