use thiserror::Error;

/// Error taxonomy for the device control core.
///
/// Transport failures (connection, communication, timeout) are retried a
/// bounded number of times for reads and never for writes. Protocol
/// failures (CRC, malformed response) are treated like transport errors
/// for retry purposes. Precondition failures (not connected, busy,
/// interlocked, bad input) surface immediately without retry. Hardware
/// faults (homing or motion timeouts) become the terminal ERROR state.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("CRC checksum mismatch")]
    CrcError,

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Operation already active: {0}")]
    Busy(String),

    #[error("Safety interlock: {0}")]
    Interlocked(String),

    #[error("Hardware fault: {0}")]
    Hardware(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Lock acquisition failed")]
    LockError,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for DeviceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DeviceError::Timeout
    }
}

impl From<toml::de::Error> for DeviceError {
    fn from(err: toml::de::Error) -> Self {
        DeviceError::ConfigError(format!("TOML error: {}", err))
    }
}
