pub mod controller;
pub mod interlock;
pub mod poller;
pub mod state;

pub use controller::DeviceController;
pub use interlock::SafetyInterlock;
pub use state::{DeviceState, LogEntry, RunState, StatusSnapshot};
