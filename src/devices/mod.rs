pub mod axis;
pub mod relay_board;
pub mod rotary_valve;
pub mod syringe_pump;
pub mod traits;

pub use axis::{Axis, AxisCalibration, AxisDriver};
pub use relay_board::RelayBoard;
pub use rotary_valve::RotaryValve;
pub use syringe_pump::{MotionStatus, SyringeCalibration, SyringePump};
pub use traits::{PortSelect, RelaySwitch, SyringeMotion};
