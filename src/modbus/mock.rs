use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::crc::{append_crc, verify_crc};
use super::transport::BusTransport;
use crate::utils::error::DeviceError;

/// In-memory stand-in for a serial bus populated with well-behaved devices.
///
/// Every relay/valve register write is acknowledged with the usual echo,
/// drive motion and homing frames update a per-address position register,
/// and status polls answer with an idle telemetry block at that position.
/// Used by the test suite and by bench setups without hardware attached.
pub struct MockBus {
    port_name: String,
    inner: Mutex<MockBusState>,
}

#[derive(Default)]
struct MockBusState {
    /// Last commanded absolute position per drive address, in steps.
    positions: HashMap<u8, i32>,
    /// Every frame seen on the wire, in order.
    frames: Vec<Vec<u8>>,
    /// Scripted responses consumed before any synthesized reply.
    scripted: VecDeque<Result<Vec<u8>, DeviceError>>,
    /// Answer the next N status polls with a busy telemetry block.
    busy_polls: u32,
}

impl MockBus {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            inner: Mutex::new(MockBusState::default()),
        }
    }

    /// Queue a raw response (or error) to be returned ahead of the
    /// synthesized device behavior.
    pub fn script(&self, response: Result<Vec<u8>, DeviceError>) {
        if let Ok(mut state) = self.inner.lock() {
            state.scripted.push_back(response);
        }
    }

    /// Make the simulated drive report busy for the next `polls` status reads.
    pub fn set_busy_polls(&self, polls: u32) {
        if let Ok(mut state) = self.inner.lock() {
            state.busy_polls = polls;
        }
    }

    pub fn set_position(&self, address: u8, steps: i32) {
        if let Ok(mut state) = self.inner.lock() {
            state.positions.insert(address, steps);
        }
    }

    pub fn position(&self, address: u8) -> i32 {
        self.inner
            .lock()
            .map(|state| state.positions.get(&address).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// All frames observed so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .map(|state| state.frames.clone())
            .unwrap_or_default()
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().map(|state| state.frames.len()).unwrap_or(0)
    }

    fn synthesize(state: &mut MockBusState, frame: &[u8]) -> Result<Vec<u8>, DeviceError> {
        if frame.len() < 4 || !verify_crc(frame) {
            return Err(DeviceError::InvalidData(
                "mock bus received a malformed frame".to_string(),
            ));
        }
        let address = frame[0];
        match frame[1] {
            // Write Single Register: device echoes the frame verbatim.
            0x06 => Ok(frame.to_vec()),
            // Write Multiple Registers: motion, homing or quick-stop.
            0x10 => {
                if frame.len() >= 23 {
                    let target = i32::from_be_bytes([frame[17], frame[18], frame[19], frame[20]]);
                    match frame[7] {
                        // Absolute motion payload: jump straight to target.
                        0x01 => {
                            state.positions.insert(address, target);
                        }
                        // Homing / quick-stop payload, discriminated by flag.
                        0x07 => {
                            if frame[9] == 0x01 {
                                state.positions.insert(address, target);
                            } else {
                                state.positions.insert(address, 0);
                            }
                        }
                        _ => {}
                    }
                }
                let mut ack = frame[..6].to_vec();
                append_crc(&mut ack);
                Ok(ack)
            }
            // Read Registers: 14-byte telemetry block.
            0x03 => {
                let position = state.positions.get(&address).copied().unwrap_or(0);
                let (sdw, velocity): (u32, i32) = if state.busy_polls > 0 {
                    state.busy_polls -= 1;
                    // busy bit set, standstill clear, some motion on the wire
                    (1 << 8, 1200)
                } else {
                    // standstill + position_ok
                    ((1 << 12) | (1 << 15), 0)
                };
                let mut resp = vec![address, 0x03, 0x0E];
                resp.extend_from_slice(&sdw.to_be_bytes());
                resp.extend_from_slice(&[0x00, 0x00]);
                resp.extend_from_slice(&velocity.to_be_bytes());
                resp.extend_from_slice(&position.to_be_bytes());
                append_crc(&mut resp);
                Ok(resp)
            }
            other => Err(DeviceError::InvalidData(format!(
                "mock bus: unsupported function 0x{:02X}",
                other
            ))),
        }
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn transact(&self, frame: &[u8], expected_len: usize) -> Result<Vec<u8>, DeviceError> {
        let mut state = self.inner.lock().map_err(|_| DeviceError::LockError)?;
        state.frames.push(frame.to_vec());
        let response = match state.scripted.pop_front() {
            Some(scripted) => scripted,
            None => Self::synthesize(&mut state, frame),
        };
        response.map(|mut bytes| {
            bytes.truncate(expected_len);
            bytes
        })
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_write_single_register() {
        let bus = MockBus::new("mock0");
        let mut frame = vec![0x02, 0x06, 0x00, 0x01, 0x01, 0x00];
        append_crc(&mut frame);
        let resp = bus.transact(&frame, 8).await.unwrap();
        assert_eq!(resp, frame);
        assert_eq!(bus.frame_count(), 1);
    }

    #[tokio::test]
    async fn motion_frame_moves_simulated_drive() {
        let bus = MockBus::new("mock0");
        let mut frame = vec![
            0x4C, 0x10, 0xA7, 0x9E, 0x00, 0x07, 0x0E, 0x01, 0x00, 0x00, 0x03, 0x03, 0xE8,
        ];
        frame.extend_from_slice(&500i32.to_be_bytes());
        frame.extend_from_slice(&123_456i32.to_be_bytes());
        append_crc(&mut frame);
        let ack = bus.transact(&frame, 8).await.unwrap();
        assert_eq!(ack.len(), 8);
        assert_eq!(ack[0], 0x4C);
        assert_eq!(ack[1], 0x10);
        assert!(verify_crc(&ack));
        assert_eq!(bus.position(0x4C), 123_456);
    }

    #[tokio::test]
    async fn scripted_response_takes_priority() {
        let bus = MockBus::new("mock0");
        bus.script(Err(DeviceError::Timeout));
        let mut frame = vec![0x02, 0x06, 0x00, 0x01, 0x01, 0x00];
        append_crc(&mut frame);
        assert!(matches!(
            bus.transact(&frame, 8).await,
            Err(DeviceError::Timeout)
        ));
        // Next transaction falls back to synthesized behavior.
        assert!(bus.transact(&frame, 8).await.is_ok());
    }
}
