pub mod settings;

pub use settings::{
    AxisConfig, Config, RelayConfig, RotaryValveConfig, SafetyConfig, SyringeConfig,
};
