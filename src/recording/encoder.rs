//! 录像编码器 - 把一段报警片段写成视频文件
//!
//! - GifClipEncoder:    纯Rust动图编码, 不依赖外部程序
//! - FfmpegClipEncoder: 调用 ffmpeg 进程编码 H.264 MP4

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use chrono::{DateTime, Local};
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::frame_buffer::ClipSnapshot;
use crate::detection::Modality;
use crate::error::BufferWriteError;
use crate::input::Frame;

/// 片段编码器
pub trait ClipEncoder: Send + Sync {
    /// 文件扩展名 (不含点)
    fn extension(&self) -> &'static str;

    /// 按片段帧率与分辨率写出全部帧, 返回写入的帧数
    fn encode(&self, path: &Path, clip: &ClipSnapshot) -> Result<usize, BufferWriteError>;
}

/// 录像容器格式, 默认MP4; 没有ffmpeg的机器可用GIF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClipContainer {
    Gif,
    #[default]
    Mp4,
}

impl ClipContainer {
    pub fn encoder(&self) -> Arc<dyn ClipEncoder> {
        match self {
            ClipContainer::Gif => Arc::new(GifClipEncoder::default()),
            ClipContainer::Mp4 => Arc::new(FfmpegClipEncoder::default()),
        }
    }

    /// 选择编码器: MP4找不到ffmpeg时退回GIF
    pub fn encoder_with_fallback(&self) -> Arc<dyn ClipEncoder> {
        self.encoder_for(&FfmpegClipEncoder::default())
    }

    fn encoder_for(&self, ffmpeg: &FfmpegClipEncoder) -> Arc<dyn ClipEncoder> {
        match self {
            ClipContainer::Mp4 if !ffmpeg.is_available() => {
                warn!("⚠️ 未找到 {}, 报警录像改用GIF", ffmpeg.program);
                Arc::new(GifClipEncoder::default())
            }
            ClipContainer::Mp4 => Arc::new(ffmpeg.clone()),
            ClipContainer::Gif => Arc::new(GifClipEncoder::default()),
        }
    }
}

/// 录像文件路径: base_dir/<camera>/<时间>_<通道>.<ext>
pub fn clip_path(
    base_dir: &Path,
    camera: &str,
    modality: Modality,
    at: DateTime<Local>,
    extension: &str,
) -> PathBuf {
    let camera: String = camera
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    base_dir.join(camera).join(format!(
        "{}_{}.{}",
        at.format("%Y-%m-%d_%H-%M-%S"),
        modality,
        extension
    ))
}

fn create_parent(path: &Path) -> Result<(), BufferWriteError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| BufferWriteError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// 取出帧图像, 分辨率与片段不一致时缩放到片段分辨率
fn frame_image(
    frame: &Frame,
    resolution: (u32, u32),
    path: &Path,
) -> Result<RgbaImage, BufferWriteError> {
    let image = frame.to_image().ok_or_else(|| BufferWriteError::Encode {
        path: path.to_path_buf(),
        reason: format!("frame {} has inconsistent pixel data", frame.frame_id),
    })?;
    if image.dimensions() == resolution {
        Ok(image)
    } else {
        Ok(imageops::resize(&image, resolution.0, resolution.1, FilterType::Triangle))
    }
}

/// GIF动图编码器
#[derive(Debug, Clone)]
pub struct GifClipEncoder {
    /// 1 (最慢, 质量最好) - 30
    pub speed: i32,
}

impl Default for GifClipEncoder {
    fn default() -> Self {
        Self { speed: 10 }
    }
}

impl ClipEncoder for GifClipEncoder {
    fn extension(&self) -> &'static str {
        "gif"
    }

    fn encode(&self, path: &Path, clip: &ClipSnapshot) -> Result<usize, BufferWriteError> {
        if clip.frames.is_empty() {
            return Err(BufferWriteError::EmptyClip(path.to_path_buf()));
        }
        create_parent(path)?;

        let io_err = |source| BufferWriteError::Io {
            path: path.to_path_buf(),
            source,
        };
        let encode_err = |e: image::ImageError| BufferWriteError::Encode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let file = File::create(path).map_err(io_err)?;
        let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), self.speed);
        encoder.set_repeat(Repeat::Infinite).map_err(encode_err)?;

        let fps = clip.fps.round().max(1.0) as u32;
        let delay = Delay::from_numer_denom_ms(1000, fps);
        let mut written = 0;
        for frame in &clip.frames {
            let image = frame_image(frame, clip.resolution, path)?;
            encoder
                .encode_frame(image::Frame::from_parts(image, 0, 0, delay))
                .map_err(encode_err)?;
            written += 1;
        }

        debug!("🎞️ GIF写入完成: {} ({}帧)", path.display(), written);
        Ok(written)
    }
}

/// ffmpeg进程编码器: RGBA原始帧经stdin送入ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegClipEncoder {
    pub program: String,
    pub codec: String,
}

impl Default for FfmpegClipEncoder {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            codec: "libx264".to_string(),
        }
    }
}

impl FfmpegClipEncoder {
    /// ffmpeg程序能否运行 (`-version` 正常退出)
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl ClipEncoder for FfmpegClipEncoder {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn encode(&self, path: &Path, clip: &ClipSnapshot) -> Result<usize, BufferWriteError> {
        if clip.frames.is_empty() {
            return Err(BufferWriteError::EmptyClip(path.to_path_buf()));
        }
        create_parent(path)?;

        let io_err = |source| BufferWriteError::Io {
            path: path.to_path_buf(),
            source,
        };

        let (w, h) = clip.resolution;
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-s")
            .arg(format!("{}x{}", w, h))
            .arg("-r")
            .arg(format!("{:.3}", clip.fps.max(1.0)))
            .arg("-i")
            .arg("-")
            .arg("-c:v")
            .arg(&self.codec)
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(io_err)?;
        let mut stdin = child.stdin.take().ok_or_else(|| BufferWriteError::Encode {
            path: path.to_path_buf(),
            reason: "failed to open ffmpeg stdin".to_string(),
        })?;

        let mut written = 0;
        for frame in &clip.frames {
            let result = frame_image(frame, clip.resolution, path)
                .and_then(|image| stdin.write_all(image.as_raw()).map_err(io_err));
            if let Err(e) = result {
                drop(stdin);
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
            written += 1;
        }
        // 关闭stdin, ffmpeg收到EOF后结束编码
        drop(stdin);

        let status = child.wait().map_err(io_err)?;
        if !status.success() {
            return Err(BufferWriteError::EncoderExited {
                path: path.to_path_buf(),
                status: status.to_string(),
            });
        }

        debug!("🎞️ MP4写入完成: {} ({}帧)", path.display(), written);
        Ok(written)
    }
}
