//! 文件回放源 - 按文件名顺序回放图像序列目录
//!
//! 结果完全确定, 用于测试、复盘和离线调参

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{Frame, StreamSource, MAX_STREAM_FPS, MIN_STREAM_FPS};
use crate::error::StreamError;

const FRAME_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

pub struct FileSource {
    path: PathBuf,
    fps: f64,
    paced: bool,   // 是否按帧率节奏出帧 (模拟实时流)
    looping: bool, // 播放结束后从头开始
    files: Vec<PathBuf>,
    cursor: usize,
    frame_id: u64,
    resolution: (u32, u32),
    opened: bool,
    finished: bool,
    last_emit: Option<Instant>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            path: path.into(),
            fps: if fps.is_finite() && fps > 0.0 {
                fps.clamp(MIN_STREAM_FPS, MAX_STREAM_FPS)
            } else {
                25.0
            },
            paced: false,
            looping: false,
            files: Vec::new(),
            cursor: 0,
            frame_id: 0,
            resolution: (0, 0),
            opened: false,
            finished: false,
            last_emit: None,
        }
    }

    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 剩余未播放的帧数
    pub fn remaining(&self) -> usize {
        self.files.len().saturating_sub(self.cursor)
    }

    fn list_frames(&self) -> Result<Vec<PathBuf>, StreamError> {
        let entries = std::fs::read_dir(&self.path)
            .map_err(|e| StreamError::unavailable(self.describe(), e))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

impl StreamSource for FileSource {
    fn open(&mut self) -> Result<(), StreamError> {
        if self.finished && !self.looping {
            return Err(StreamError::unavailable(self.describe(), "playback finished"));
        }

        let files = self.list_frames()?;
        let first = files
            .first()
            .ok_or_else(|| StreamError::unavailable(self.describe(), "no image frames found"))?;
        let resolution = image::image_dimensions(first)
            .map_err(|e| StreamError::unavailable(self.describe(), e))?;

        info!(
            "📂 文件源已打开: {} ({}帧, {}x{}, {:.1}fps)",
            self.path.display(),
            files.len(),
            resolution.0,
            resolution.1,
            self.fps
        );

        self.files = files;
        self.cursor = 0;
        self.resolution = resolution;
        self.opened = true;
        self.finished = false;
        self.last_emit = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        if !self.opened {
            return Err(StreamError::Closed);
        }

        if self.paced {
            if let Some(last) = self.last_emit {
                if last.elapsed() < self.frame_interval() {
                    return Err(StreamError::NoFrame);
                }
            }
        }

        if self.cursor >= self.files.len() {
            if self.looping && !self.files.is_empty() {
                self.cursor = 0;
            } else {
                info!("⏹️ 文件源播放结束: {}", self.path.display());
                self.opened = false;
                self.finished = true;
                return Err(StreamError::Closed);
            }
        }

        let file = &self.files[self.cursor];
        self.cursor += 1;

        let image = match image::open(file) {
            Ok(img) => img.to_rgba8(),
            Err(e) => {
                warn!("⚠️ 跳过无法解码的帧 {}: {}", file.display(), e);
                return Err(StreamError::Decode(e.to_string()));
            }
        };

        self.frame_id += 1;
        self.last_emit = Some(Instant::now());
        Ok(Frame::from_image(image, self.frame_id))
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn release(&mut self) {
        if self.opened {
            info!("📂 文件源已释放: {}", self.path.display());
        }
        self.opened = false;
        self.files.clear();
        self.cursor = 0;
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba, RgbaImage};

    fn frame_dir(name: &str, count: usize) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sentinel-file-source-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let img: RgbaImage = ImageBuffer::from_pixel(8, 6, Rgba([i as u8, 0, 0, 255]));
            img.save(dir.join(format!("frame_{:04}.png", i))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();
        dir
    }

    #[test]
    fn test_plays_frames_in_name_order() {
        let dir = frame_dir("order", 3);
        let mut source = FileSource::new(&dir, 10.0);
        source.open().unwrap();
        assert_eq!(source.resolution(), (8, 6));
        assert_eq!(source.remaining(), 3);

        for i in 0..3u8 {
            let frame = source.next_frame().unwrap();
            assert_eq!(frame.rgba_data[0], i);
            assert_eq!(frame.frame_id, i as u64 + 1);
        }
        assert!(matches!(source.next_frame(), Err(StreamError::Closed)));
        assert!(!source.is_open());

        // 非循环模式播放结束后不再重新打开
        assert!(source.open().is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_looping_restarts() {
        let dir = frame_dir("loop", 2);
        let mut source = FileSource::new(&dir, 10.0).looping(true);
        source.open().unwrap();
        let ids: Vec<u8> = (0..5)
            .map(|_| source.next_frame().unwrap().rgba_data[0])
            .collect();
        assert_eq!(ids, vec![0, 1, 0, 1, 0]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_paced_reports_no_frame_between_intervals() {
        let dir = frame_dir("paced", 2);
        let mut source = FileSource::new(&dir, 1.0).paced(true);
        source.open().unwrap();
        assert!(source.next_frame().is_ok());
        assert!(matches!(source.next_frame(), Err(StreamError::NoFrame)));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_out_of_range_rate_is_clamped() {
        assert_eq!(FileSource::new("unused", 1e-300).fps(), MIN_STREAM_FPS);
        assert_eq!(FileSource::new("unused", 1e9).fps(), MAX_STREAM_FPS);
        assert_eq!(FileSource::new("unused", f64::NAN).fps(), 25.0);
        assert_eq!(FileSource::new("unused", 0.0).fps(), 25.0);
    }

    #[test]
    fn test_missing_directory_is_unavailable() {
        let mut source = FileSource::new("/definitely/not/here", 25.0);
        assert!(matches!(
            source.open(),
            Err(StreamError::Unavailable { .. })
        ));
        assert!(!source.is_open());
        assert!(source.info().is_none());
    }
}
