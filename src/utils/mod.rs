pub mod cancel;
pub mod error;

pub use cancel::CancelToken;
pub use error::DeviceError;
