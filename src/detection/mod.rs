/// 检测系统 (Detection System)
///
/// 每路视频一个独立工作线程, 负责智能分析
/// - Worker:   持续取帧 + 限速检测 + 原子发布
/// - Detector: 检测器接口 (模型为外部黑盒)
/// - Types:    检测结果与标签表
pub mod detector;
pub mod types;
pub mod worker;

pub use detector::{NullDetector, ObjectDetector, ScriptedDetector};
pub use types::{BBox, Detection, LabelTable, Modality};
pub use worker::{DetectionWorker, Snapshot, StrideCounter, WorkerOptions};
