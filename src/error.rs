//! 错误分类 (Error taxonomy)
//!
//! 每个组件的故障都在本组件内隔离处理, 不会终止兄弟线程或整个会话。
//! 继电器命令是单向UDP报文, 发送失败不可观测, 因此不在此分类中。

use std::path::PathBuf;

use thiserror::Error;

/// 视频流错误
#[derive(Debug, Error)]
pub enum StreamError {
    /// 打开/读取失败, 工作线程下一轮重试
    #[error("stream {source_name:?} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },
    /// 暂时没有新帧
    #[error("no frame available yet")]
    NoFrame,
    /// 流已关闭 (文件播放结束或连接断开)
    #[error("stream closed")]
    Closed,
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

impl StreamError {
    pub fn unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// 检测失败: 只影响当前这一轮, 上一次的结果保持不变
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detector failed: {0}")]
    Failed(String),
    #[error("frame {width}x{height} cannot be processed by the detector")]
    InvalidFrame { width: u32, height: u32 },
}

/// 录像写盘失败: 内存中的片段会被保留以便重试
#[derive(Debug, Error)]
pub enum BufferWriteError {
    #[error("failed to write clip {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode clip {path:?}: {reason}")]
    Encode { path: PathBuf, reason: String },
    #[error("clip {0:?} has no frames")]
    EmptyClip(PathBuf),
    #[error("encoder for {path:?} exited with status {status}")]
    EncoderExited { path: PathBuf, status: String },
}

impl BufferWriteError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Io { path, .. }
            | Self::Encode { path, .. }
            | Self::EmptyClip(path)
            | Self::EncoderExited { path, .. } => path,
        }
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} = {value} is out of range ({expected})")]
    OutOfRange {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("label {0:?} is not in the label table")]
    UnknownLabel(String),
    #[error("failed to access config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
