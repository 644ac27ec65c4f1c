//! 数字卫兵: 双光谱 (可见光 + 热成像) 入侵报警核心
//!
//! 视频源 → 检测线程 → 摄像头会话 (周期融合) → 报警控制器 + 录像缓冲 → 文件
pub mod alarm; // 继电器与报警状态机
pub mod config; // JSON配置
pub mod detection; // 检测结果、检测器接口、检测线程
pub mod error; // 错误分类
pub mod input; // 视频输入
pub mod recording; // 报警录像
pub mod session; // 融合与编排

pub use crate::alarm::{AlarmController, AlarmState, RelayProfile, RelaySink, UdpRelay};
pub use crate::config::SentinelConfig;
pub use crate::detection::{
    Detection, DetectionWorker, LabelTable, Modality, NullDetector, ObjectDetector,
    ScriptedDetector,
};
pub use crate::error::{BufferWriteError, ConfigError, DetectionError, StreamError};
pub use crate::input::{FileSource, Frame, StreamInfo, StreamSource};
pub use crate::recording::{ClipContainer, ClipEncoder, FrameRingBuffer};
pub use crate::session::{
    CameraSession, IntruderSettings, IntrusionMonitor, SessionEvent, SessionOptions,
};
