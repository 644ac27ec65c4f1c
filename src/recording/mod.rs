//! 报警录像: 环形缓冲 + 片段编码
pub mod encoder;
pub mod frame_buffer;

pub use encoder::{clip_path, ClipContainer, ClipEncoder, FfmpegClipEncoder, GifClipEncoder};
pub use frame_buffer::{
    ring_capacity, ClipSnapshot, FailedClip, FlushHandle, FrameRing, FrameRingBuffer, SavedClip,
    MAX_RECORD_SECONDS, MAX_RETAINED_CLIPS,
};
