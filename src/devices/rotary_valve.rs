use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use super::traits::PortSelect;
use crate::modbus::crc::append_crc;
use crate::modbus::transport::BusTransport;
use crate::utils::error::DeviceError;

pub const PORT_COUNT: u8 = 12;
/// Port selection writes register 0 with value 0x08NN (NN = port number).
const REG_POSITION: u16 = 0x0000;
const VALUE_SELECT_BASE: u16 = 0x0800;

/// Multi-port rotary selector valve on Modbus RTU.
///
/// Set position via Function 0x06 (Write Single Register); the valve
/// acknowledges by echoing the 8-byte frame.
pub struct RotaryValve {
    address: u8,
    bus: Arc<dyn BusTransport>,
}

impl RotaryValve {
    pub fn new(address: u8, bus: Arc<dyn BusTransport>) -> Self {
        Self { address, bus }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    async fn write_register(&self, reg: u16, value: u16) -> Result<(), DeviceError> {
        let mut frame = vec![
            self.address,
            0x06,
            (reg >> 8) as u8,
            (reg & 0xFF) as u8,
            (value >> 8) as u8,
            (value & 0xFF) as u8,
        ];
        append_crc(&mut frame);

        let response = self.bus.transact(&frame, 8).await?;
        if response != frame {
            return Err(DeviceError::InvalidResponse(format!(
                "rotary valve register 0x{:04X} write not acknowledged",
                reg
            )));
        }
        Ok(())
    }

    /// Move the valve to `port` (1..=12). Out-of-range ports fail before
    /// any frame is put on the wire.
    pub async fn set_port(&self, port: u8) -> Result<(), DeviceError> {
        if !(1..=PORT_COUNT).contains(&port) {
            return Err(DeviceError::InvalidData(format!(
                "rotary port must be 1..{}, got {}",
                PORT_COUNT, port
            )));
        }
        self.write_register(REG_POSITION, VALUE_SELECT_BASE | port as u16)
            .await
            .map_err(|err| match err {
                DeviceError::InvalidResponse(_) => DeviceError::InvalidResponse(format!(
                    "rotary valve port {} not acknowledged",
                    port
                )),
                other => other,
            })?;
        info!("🔀 [Rotary] -> Port {}", port);
        Ok(())
    }
}

#[async_trait]
impl PortSelect for RotaryValve {
    async fn select_port(&self, port: u8) -> Result<(), DeviceError> {
        self.set_port(port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::crc::verify_crc;
    use crate::modbus::mock::MockBus;

    fn valve() -> (RotaryValve, Arc<MockBus>) {
        let bus = Arc::new(MockBus::new("mock-valve"));
        (RotaryValve::new(0x01, bus.clone() as Arc<dyn BusTransport>), bus)
    }

    #[tokio::test]
    async fn select_port_builds_expected_frame() {
        let (valve, bus) = valve();
        valve.set_port(7).await.unwrap();
        let frames = bus.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..6], &[0x01, 0x06, 0x00, 0x00, 0x08, 0x07]);
        assert!(verify_crc(&frames[0]));
    }

    #[tokio::test]
    async fn out_of_range_port_fails_before_any_io() {
        let (valve, bus) = valve();
        for port in [0u8, 13, 200] {
            assert!(matches!(
                valve.set_port(port).await,
                Err(DeviceError::InvalidData(_))
            ));
        }
        assert_eq!(bus.frame_count(), 0);
    }

    #[tokio::test]
    async fn missing_ack_is_reported_as_not_acknowledged() {
        let (valve, bus) = valve();
        bus.script(Ok(Vec::new()));
        let err = valve.set_port(4).await.unwrap_err();
        assert!(err.to_string().contains("port 4 not acknowledged"));
    }
}
