use async_trait::async_trait;
use log::info;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::traits::RelaySwitch;
use crate::modbus::crc::append_crc;
use crate::modbus::transport::BusTransport;
use crate::utils::error::DeviceError;

const RELAY_CHANNELS: u8 = 8;
const VALUE_ON: u16 = 0x0100;
const VALUE_OFF: u16 = 0x0200;
const VALUE_ALL_ON: u16 = 0x0700;
const VALUE_ALL_OFF: u16 = 0x0800;
/// Register 0 carries the broadcast (all on / all off) commands.
const REG_BROADCAST: u16 = 0x0000;

/// Modbus RTU relay board controlled with Function 0x06 (Write Single
/// Register). Registers 1..8 map to channels 1..8; the device
/// acknowledges by echoing the full 8-byte frame.
pub struct RelayBoard {
    address: u8,
    bus: Arc<dyn BusTransport>,
    states: Mutex<BTreeMap<u8, bool>>,
}

impl RelayBoard {
    pub fn new(address: u8, bus: Arc<dyn BusTransport>) -> Self {
        let states = (1..=RELAY_CHANNELS).map(|ch| (ch, false)).collect();
        Self {
            address,
            bus,
            states: Mutex::new(states),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Cached channel states, updated on every acknowledged write.
    pub fn states(&self) -> BTreeMap<u8, bool> {
        self.states
            .lock()
            .map(|states| states.clone())
            .unwrap_or_default()
    }

    fn check_channel(channel: u8) -> Result<(), DeviceError> {
        if (1..=RELAY_CHANNELS).contains(&channel) {
            Ok(())
        } else {
            Err(DeviceError::InvalidData(format!(
                "relay channel must be 1..{}, got {}",
                RELAY_CHANNELS, channel
            )))
        }
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
                "relay register 0x{:04X} write not acknowledged",
                reg
            )));
        }
        Ok(())
    }

    fn cache_channel(&self, channel: u8, state: bool) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(channel, state);
        }
    }

    fn cache_all(&self, state: bool) {
        if let Ok(mut states) = self.states.lock() {
            for ch in 1..=RELAY_CHANNELS {
                states.insert(ch, state);
            }
        }
    }

    pub async fn set_on(&self, channel: u8) -> Result<(), DeviceError> {
        Self::check_channel(channel)?;
        self.write_register(channel as u16, VALUE_ON).await?;
        self.cache_channel(channel, true);
        info!("⚡ [Relay {}] -> ON", channel);
        Ok(())
    }

    pub async fn set_off(&self, channel: u8) -> Result<(), DeviceError> {
        Self::check_channel(channel)?;
        self.write_register(channel as u16, VALUE_OFF).await?;
        self.cache_channel(channel, false);
        info!("⚡ [Relay {}] -> OFF", channel);
        Ok(())
    }

    pub async fn set_all_on(&self) -> Result<(), DeviceError> {
        self.write_register(REG_BROADCAST, VALUE_ALL_ON).await?;
        self.cache_all(true);
        info!("⚡ [Relays] ALL ON");
        Ok(())
    }

    /// Broadcast all-off. One frame instead of a per-channel loop, so an
    /// emergency stop cannot be interrupted halfway through the bank.
    pub async fn set_all_off(&self) -> Result<(), DeviceError> {
        self.write_register(REG_BROADCAST, VALUE_ALL_OFF).await?;
        self.cache_all(false);
        info!("⚡ [Relays] ALL OFF");
        Ok(())
    }
}

#[async_trait]
impl RelaySwitch for RelayBoard {
    async fn on(&self, channel: u8) -> Result<(), DeviceError> {
        self.set_on(channel).await
    }

    async fn off(&self, channel: u8) -> Result<(), DeviceError> {
        self.set_off(channel).await
    }

    async fn all_off(&self) -> Result<(), DeviceError> {
        self.set_all_off().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::crc::verify_crc;
    use crate::modbus::mock::MockBus;

    fn board() -> (RelayBoard, Arc<MockBus>) {
        let bus = Arc::new(MockBus::new("mock-relay"));
        (RelayBoard::new(0x02, bus.clone() as Arc<dyn BusTransport>), bus)
    }

    #[tokio::test]
    async fn on_builds_expected_frame() {
        let (board, bus) = board();
        board.set_on(5).await.unwrap();
        let frames = bus.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..6], &[0x02, 0x06, 0x00, 0x05, 0x01, 0x00]);
        assert!(verify_crc(&frames[0]));
    }

    #[tokio::test]
    async fn on_then_off_restores_cached_state() {
        let (board, _bus) = board();
        let before = board.states();
        board.set_on(3).await.unwrap();
        assert_eq!(board.states().get(&3), Some(&true));
        board.set_off(3).await.unwrap();
        assert_eq!(board.states(), before);
    }

    #[tokio::test]
    async fn all_off_clears_every_cached_channel() {
        let (board, bus) = board();
        board.set_on(1).await.unwrap();
        board.set_on(7).await.unwrap();
        board.set_all_off().await.unwrap();
        assert!(board.states().values().all(|on| !on));
        let frames = bus.frames();
        assert_eq!(&frames[2][..6], &[0x02, 0x06, 0x00, 0x00, 0x08, 0x00]);
    }

    #[tokio::test]
    async fn all_on_uses_the_broadcast_register() {
        let (board, bus) = board();
        board.set_all_on().await.unwrap();
        let frames = bus.frames();
        assert_eq!(&frames[0][..6], &[0x02, 0x06, 0x00, 0x00, 0x07, 0x00]);
        assert!(board.states().values().all(|on| *on));
    }

    #[tokio::test]
    async fn invalid_channel_rejected_before_io() {
        let (board, bus) = board();
        assert!(matches!(
            board.set_on(0).await,
            Err(DeviceError::InvalidData(_))
        ));
        assert!(matches!(
            board.set_off(9).await,
            Err(DeviceError::InvalidData(_))
        ));
        assert_eq!(bus.frame_count(), 0);
    }

    #[tokio::test]
    async fn bad_echo_leaves_cache_untouched() {
        let (board, bus) = board();
        bus.script(Ok(vec![0x02, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]));
        assert!(matches!(
            board.set_on(4).await,
            Err(DeviceError::InvalidResponse(_))
        ));
        assert_eq!(board.states().get(&4), Some(&false));
    }
}
