//! 报警输出: 继电器协议与报警状态机
pub mod controller;
pub mod relay;

pub use controller::{AlarmController, AlarmState, Transition, DEFAULT_BLINK_INTERVAL};
pub use relay::{RecordingRelay, RelayChannels, RelayOutput, RelayProfile, RelaySink, UdpRelay};
