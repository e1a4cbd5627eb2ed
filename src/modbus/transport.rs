use async_trait::async_trait;
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::utils::error::DeviceError;

/// Settle time between writing a request and reading the reply. The RS485
/// adapters on the instrument need the bus to turn around before the
/// response bytes appear.
const BUS_SETTLE: Duration = Duration::from_millis(200);

/// Half-duplex request/response transport shared by every register driver.
///
/// Implementations carry no device semantics: they move raw frames and
/// return whatever bytes arrived before the timeout. Frame validation is
/// the caller's job.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Write `frame` on the wire and read up to `expected_len` bytes back.
    async fn transact(&self, frame: &[u8], expected_len: usize) -> Result<Vec<u8>, DeviceError>;

    fn port_name(&self) -> &str;
}

/// Serial RS485 bus bound to one physical port path.
///
/// All drivers sharing the path share one `SerialBus`, so the internal
/// mutex is the "one lock per physical wire" guarantee: the telemetry
/// poller and command paths can never interleave frames.
pub struct SerialBus {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    io_lock: Mutex<()>,
}

impl SerialBus {
    pub fn new(port_name: &str, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            timeout,
            io_lock: Mutex::new(()),
        }
    }

    fn open(&self) -> Result<Box<dyn serialport::SerialPort>, DeviceError> {
        serialport::new(&self.port_name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(self.timeout)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", self.port_name, e);
                DeviceError::ConnectionError(format!(
                    "Failed to open port {}: {}",
                    self.port_name, e
                ))
            })
    }
}

#[async_trait]
impl BusTransport for SerialBus {
    async fn transact(&self, frame: &[u8], expected_len: usize) -> Result<Vec<u8>, DeviceError> {
        let _guard = self.io_lock.lock().map_err(|_| DeviceError::LockError)?;

        let mut port = self.open()?;
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| DeviceError::CommunicationError(format!("Buffer clear failed: {}", e)))?;

        debug!("📤 [{}] frame: {}", self.port_name, hex::encode(frame));
        port.write_all(frame)
            .map_err(|e| DeviceError::CommunicationError(format!("Write failed: {}", e)))?;
        port.flush()
            .map_err(|e| DeviceError::CommunicationError(format!("Flush failed: {}", e)))?;

        // Bus turnaround before the device starts answering.
        thread::sleep(BUS_SETTLE);

        let mut response = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 64];
        while response.len() < expected_len {
            match port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    return Err(DeviceError::CommunicationError(format!(
                        "Read failed: {}",
                        e
                    )))
                }
            }
        }
        response.truncate(expected_len);
        debug!("📥 [{}] response: {}", self.port_name, hex::encode(&response));
        Ok(response)
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// Registry mapping port paths to shared bus handles.
///
/// Owned by the composition root and injected into every driver, so the
/// per-port lock is explicit instead of hiding in process-wide state.
/// Tests register a [`MockBus`](crate::modbus::MockBus) under the
/// configured path before building the controller.
#[derive(Default)]
pub struct PortRegistry {
    buses: Mutex<HashMap<String, Arc<dyn BusTransport>>>,
}

impl PortRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the shared bus for `port`, opening a [`SerialBus`] on first use.
    pub fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> Arc<dyn BusTransport> {
        let mut buses = match self.buses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(bus) = buses.get(port) {
            return Arc::clone(bus);
        }
        info!("🔌 Opening serial bus {} @ {} baud", port, baud_rate);
        let bus: Arc<dyn BusTransport> = Arc::new(SerialBus::new(port, baud_rate, timeout));
        buses.insert(port.to_string(), Arc::clone(&bus));
        bus
    }

    /// Pre-register a transport for `port` (mock buses in tests, or an
    /// already-open handle).
    pub fn register(&self, port: &str, bus: Arc<dyn BusTransport>) {
        let mut buses = match self.buses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buses.insert(port.to_string(), bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::mock::MockBus;

    #[test]
    fn registry_shares_one_bus_per_port() {
        let registry = PortRegistry::new();
        let a = registry.open("/dev/ttySC9", 9600, Duration::from_millis(300));
        let b = registry.open("/dev/ttySC9", 19200, Duration::from_millis(300));
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.open("/dev/ttySC8", 9600, Duration::from_millis(300));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn registered_transport_wins_over_serial_open() {
        let registry = PortRegistry::new();
        let mock: Arc<dyn BusTransport> = Arc::new(MockBus::new("/dev/ttySC9"));
        registry.register("/dev/ttySC9", Arc::clone(&mock));
        let bus = registry.open("/dev/ttySC9", 9600, Duration::from_millis(300));
        assert!(Arc::ptr_eq(&bus, &mock));
    }
}
