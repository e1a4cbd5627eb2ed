pub mod crc;
pub mod mock;
pub mod transport;

pub use crc::{append_crc, crc16_modbus, verify_crc};
pub use mock::MockBus;
pub use transport::{BusTransport, PortRegistry, SerialBus};
