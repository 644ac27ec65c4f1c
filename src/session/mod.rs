//! 摄像头会话: 融合规则、入侵监视状态机与线程编排
pub mod camera;
pub mod fusion;
pub mod monitor;

pub use camera::{CameraSession, SessionEvent, SessionOptions};
pub use fusion::{combined_confidence, combined_trigger, has_intruder, mean_score, Highlight};
pub use monitor::{IntruderSettings, IntrusionMonitor, ModalityTick, PendingFlush, TickOutcome};
