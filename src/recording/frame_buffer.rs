//! 报警前/报警后帧环形缓冲
//!
//! 报警前环形缓冲在正常运行时一直是满的 (滑动窗口), 报警期间的帧写入
//! 独立的报警后环形缓冲。两者容量都由 秒数 × 帧率 决定, 内存占用与
//! 报警持续时间无关。写盘时先取快照再清空, 编码在独立线程进行,
//! 写盘期间追加的帧进入新的空缓冲。

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use super::encoder::ClipEncoder;
use crate::detection::Modality;
use crate::error::BufferWriteError;
use crate::input::{Frame, MAX_STREAM_FPS, MIN_STREAM_FPS};

/// 录像时长上限 (秒)
pub const MAX_RECORD_SECONDS: u32 = 300;

/// 每路最多保留的写盘失败片段, 超出后丢弃最旧的
pub const MAX_RETAINED_CLIPS: usize = 16;

/// 由时长和帧率计算缓冲容量 (帧率取整并截断到 1..=MAX_STREAM_FPS)
pub fn ring_capacity(seconds: u32, fps: f64) -> usize {
    let fps = if fps.is_finite() {
        fps.round().clamp(MIN_STREAM_FPS, MAX_STREAM_FPS)
    } else {
        MIN_STREAM_FPS
    };
    seconds as usize * fps as usize
}

/// 定长FIFO, 满了以后挤掉最旧的帧
#[derive(Debug, Clone)]
pub struct FrameRing {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加一帧, 返回被挤出的最旧帧
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        if self.capacity == 0 {
            return Some(frame);
        }
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// 取走全部帧 (按采集顺序), 缓冲变为空
    pub fn take(&mut self) -> Vec<Frame> {
        std::mem::replace(&mut self.frames, VecDeque::with_capacity(self.capacity)).into()
    }
}

/// 一次写盘的片段快照: 报警前帧 + 报警后帧
#[derive(Debug, Clone)]
pub struct ClipSnapshot {
    pub modality: Modality,
    pub frames: Vec<Frame>,
    pub pre_frames: usize,
    pub post_frames: usize,
    pub fps: f64,
    pub resolution: (u32, u32),
}

impl ClipSnapshot {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// 写盘成功的片段
#[derive(Debug, Clone, PartialEq)]
pub struct SavedClip {
    pub modality: Modality,
    pub path: PathBuf,
    pub frames: usize,
}

pub type FlushHandle = JoinHandle<Result<SavedClip, BufferWriteError>>;

/// 写盘失败的片段及其原始文件路径 (路径中的时间戳保持不变)
#[derive(Debug, Clone)]
pub struct FailedClip {
    pub clip: ClipSnapshot,
    pub path: PathBuf,
}

type RetainedQueue = Arc<Mutex<VecDeque<FailedClip>>>;

/// 单路视频的报警录像缓冲
pub struct FrameRingBuffer {
    modality: Modality,
    fps: f64,
    resolution: (u32, u32),
    before_seconds: u32,
    after_seconds: u32,
    pre_ring: FrameRing,
    post_ring: FrameRing,
    /// 写盘失败的片段, 按失败顺序等待重试
    retained: RetainedQueue,
}

impl FrameRingBuffer {
    pub fn new(
        modality: Modality,
        before_seconds: u32,
        after_seconds: u32,
        fps: f64,
        resolution: (u32, u32),
    ) -> Self {
        Self {
            modality,
            fps,
            resolution,
            before_seconds,
            after_seconds,
            pre_ring: FrameRing::new(ring_capacity(before_seconds, fps)),
            post_ring: FrameRing::new(ring_capacity(after_seconds, fps)),
            retained: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    pub fn pre_ring(&self) -> &FrameRing {
        &self.pre_ring
    }

    pub fn post_ring(&self) -> &FrameRing {
        &self.post_ring
    }

    pub fn before_seconds(&self) -> u32 {
        self.before_seconds
    }

    pub fn after_seconds(&self) -> u32 {
        self.after_seconds
    }

    /// 正常帧 → 报警前缓冲
    pub fn append_normal(&mut self, frame: Frame) {
        self.pre_ring.push(frame);
    }

    /// 报警帧 → 报警后缓冲 (长时间报警时同样挤掉最旧的帧)
    pub fn append_alarm(&mut self, frame: Frame) {
        self.post_ring.push(frame);
    }

    /// 重新分配报警前缓冲, 丢弃已有内容
    pub fn resize_before(&mut self, seconds: u32) {
        self.before_seconds = seconds;
        self.pre_ring = FrameRing::new(ring_capacity(seconds, self.fps));
    }

    /// 重新分配报警后缓冲, 丢弃已有内容
    pub fn resize_after(&mut self, seconds: u32) {
        self.after_seconds = seconds;
        self.post_ring = FrameRing::new(ring_capacity(seconds, self.fps));
    }

    /// 复制当前内容为快照, 缓冲保持不变
    pub fn snapshot(&self) -> ClipSnapshot {
        let frames: Vec<Frame> = self
            .pre_ring
            .iter()
            .chain(self.post_ring.iter())
            .cloned()
            .collect();
        ClipSnapshot {
            modality: self.modality,
            frames,
            pre_frames: self.pre_ring.len(),
            post_frames: self.post_ring.len(),
            fps: self.fps,
            resolution: self.resolution,
        }
    }

    /// 取走全部内容为快照, 两个缓冲清空
    pub fn take_snapshot(&mut self) -> ClipSnapshot {
        let pre = self.pre_ring.take();
        let post = self.post_ring.take();
        let (pre_frames, post_frames) = (pre.len(), post.len());
        let mut frames = pre;
        frames.extend(post);
        ClipSnapshot {
            modality: self.modality,
            frames,
            pre_frames,
            post_frames,
            fps: self.fps,
            resolution: self.resolution,
        }
    }

    /// 同步写盘: 成功后清空缓冲, 失败时缓冲保持原样以便重试
    pub fn flush_blocking(
        &mut self,
        path: &Path,
        encoder: &dyn ClipEncoder,
    ) -> Result<SavedClip, BufferWriteError> {
        let clip = self.snapshot();
        let frames = encoder.encode(path, &clip)?;
        self.pre_ring.take();
        self.post_ring.take();
        info!("💾 录像已保存: {} ({}帧)", path.display(), frames);
        Ok(SavedClip {
            modality: self.modality,
            path: path.to_path_buf(),
            frames,
        })
    }

    /// 异步写盘: 立即取快照并清空缓冲, 编码在独立线程中进行
    ///
    /// 写盘失败的片段连同原路径进入重试队列, 可用 `retry_failed` 重试
    pub fn flush(
        &mut self,
        path: PathBuf,
        encoder: Arc<dyn ClipEncoder>,
    ) -> std::io::Result<FlushHandle> {
        let clip = self.take_snapshot();
        spawn_writer(clip, path, encoder, Arc::clone(&self.retained))
    }

    /// 等待重试的失败片段数
    pub fn retained_failures(&self) -> usize {
        self.retained.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// 重新派发所有失败的片段, 沿用各自的原路径
    ///
    /// 返回 (路径, 写盘任务), 顺序与失败顺序一致
    pub fn retry_failed(
        &mut self,
        encoder: Arc<dyn ClipEncoder>,
    ) -> Vec<(PathBuf, std::io::Result<FlushHandle>)> {
        let failed: Vec<FailedClip> = self
            .retained
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        failed
            .into_iter()
            .map(|FailedClip { clip, path }| {
                let handle = spawn_writer(
                    clip,
                    path.clone(),
                    Arc::clone(&encoder),
                    Arc::clone(&self.retained),
                );
                (path, handle)
            })
            .collect()
    }
}

fn retain(retained: &RetainedQueue, failed: FailedClip) {
    let mut queue = retained.lock().unwrap_or_else(|e| e.into_inner());
    if queue.len() >= MAX_RETAINED_CLIPS {
        if let Some(dropped) = queue.pop_front() {
            warn!(
                "⚠️ 待重试片段超过{}个, 丢弃最旧的: {}",
                MAX_RETAINED_CLIPS,
                dropped.path.display()
            );
        }
    }
    queue.push_back(failed);
}

fn spawn_writer(
    clip: ClipSnapshot,
    path: PathBuf,
    encoder: Arc<dyn ClipEncoder>,
    retained: RetainedQueue,
) -> std::io::Result<FlushHandle> {
    std::thread::Builder::new()
        .name(format!("clip-{}", clip.modality))
        .spawn(move || {
            if clip.is_empty() {
                warn!("⚠️ 片段为空, 跳过写盘: {}", path.display());
                return Err(BufferWriteError::EmptyClip(path));
            }
            match encoder.encode(&path, &clip) {
                Ok(frames) => {
                    info!(
                        "💾 录像已保存: {} ({}帧, 报警前{} + 报警后{})",
                        path.display(),
                        frames,
                        clip.pre_frames,
                        clip.post_frames
                    );
                    Ok(SavedClip {
                        modality: clip.modality,
                        path,
                        frames,
                    })
                }
                Err(e) => {
                    error!("❌ 录像写盘失败, 片段保留待重试: {}", e);
                    retain(&retained, FailedClip { clip, path });
                    Err(e)
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame(id: u64) -> Frame {
        Frame::solid(2, 2, [0, 0, 0, 255], id)
    }

    /// 只记录帧序号的编码器, 可设置为失败
    #[derive(Default)]
    struct RecordingEncoder {
        fail: bool,
        calls: AtomicUsize,
        ids: Mutex<Vec<u64>>,
    }

    impl ClipEncoder for RecordingEncoder {
        fn extension(&self) -> &'static str {
            "raw"
        }

        fn encode(&self, path: &Path, clip: &ClipSnapshot) -> Result<usize, BufferWriteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BufferWriteError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            *self.ids.lock().unwrap() = clip.frames.iter().map(|f| f.frame_id).collect();
            Ok(clip.frames.len())
        }
    }

    #[test]
    fn test_ring_capacity() {
        assert_eq!(ring_capacity(5, 25.0), 125);
        assert_eq!(ring_capacity(2, 29.97), 60);
        assert_eq!(ring_capacity(3, 0.2), 3);
        assert_eq!(ring_capacity(3, f64::NAN), 3);
        assert_eq!(ring_capacity(MAX_RECORD_SECONDS, 1e12), 300 * 240);
        assert_eq!(ring_capacity(2, f64::INFINITY), 2);
    }

    #[test]
    fn test_ring_below_capacity_keeps_everything() {
        let mut ring = FrameRing::new(5);
        for id in 0..3 {
            assert!(ring.push(frame(id)).is_none());
        }
        assert_eq!(ring.len(), 3);
        assert!(!ring.is_full());
    }

    #[test]
    fn test_ring_evicts_oldest_first() {
        let mut ring = FrameRing::new(3);
        let evicted: Vec<Option<u64>> = (0..6).map(|id| ring.push(frame(id)).map(|f| f.frame_id)).collect();
        assert_eq!(evicted, vec![None, None, None, Some(0), Some(1), Some(2)]);
        assert_eq!(ring.len(), 3);
        let ids: Vec<u64> = ring.iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_resize_discards_contents() {
        let mut buffer = FrameRingBuffer::new(Modality::Optical, 1, 1, 4.0, (2, 2));
        for id in 0..4 {
            buffer.append_normal(frame(id));
            buffer.append_alarm(frame(id));
        }
        buffer.resize_before(2);
        assert!(buffer.pre_ring().is_empty());
        assert_eq!(buffer.pre_ring().capacity(), 8);
        assert_eq!(buffer.post_ring().len(), 4);

        buffer.resize_after(3);
        assert!(buffer.post_ring().is_empty());
        assert_eq!(buffer.post_ring().capacity(), 12);
    }

    #[test]
    fn test_flush_writes_pre_then_post_and_resets() {
        let mut buffer = FrameRingBuffer::new(Modality::Thermal, 1, 1, 3.0, (2, 2));
        for id in 0..5 {
            buffer.append_normal(frame(id)); // 保留 2, 3, 4
        }
        for id in 10..12 {
            buffer.append_alarm(frame(id));
        }

        let encoder = Arc::new(RecordingEncoder::default());
        let handle = buffer
            .flush(PathBuf::from("unused.raw"), encoder.clone())
            .unwrap();
        // 写盘线程运行期间可以继续追加
        buffer.append_normal(frame(99));
        assert!(buffer.post_ring().is_empty());
        assert_eq!(buffer.pre_ring().len(), 1);

        let saved = handle.join().unwrap().unwrap();
        assert_eq!(saved.frames, 5);
        assert_eq!(*encoder.ids.lock().unwrap(), vec![2, 3, 4, 10, 11]);
        assert_eq!(buffer.retained_failures(), 0);
    }

    #[test]
    fn test_flush_of_empty_buffer() {
        let mut buffer = FrameRingBuffer::new(Modality::Optical, 1, 1, 3.0, (2, 2));
        let encoder = Arc::new(RecordingEncoder::default());
        let result = buffer.flush(PathBuf::from("empty.raw"), encoder.clone()).unwrap().join().unwrap();
        assert!(matches!(result, Err(BufferWriteError::EmptyClip(_))));
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blocking_flush_failure_keeps_rings() {
        let mut buffer = FrameRingBuffer::new(Modality::Optical, 1, 1, 3.0, (2, 2));
        buffer.append_normal(frame(1));
        buffer.append_alarm(frame(2));

        let failing = RecordingEncoder {
            fail: true,
            ..Default::default()
        };
        assert!(buffer.flush_blocking(Path::new("x.raw"), &failing).is_err());
        assert_eq!(buffer.pre_ring().len(), 1);
        assert_eq!(buffer.post_ring().len(), 1);

        let ok = RecordingEncoder::default();
        let saved = buffer.flush_blocking(Path::new("x.raw"), &ok).unwrap();
        assert_eq!(saved.frames, 2);
        assert!(buffer.pre_ring().is_empty());
        assert!(buffer.post_ring().is_empty());
    }

    #[test]
    fn test_async_flush_failure_is_retained_for_retry() {
        let mut buffer = FrameRingBuffer::new(Modality::Optical, 1, 1, 3.0, (2, 2));
        buffer.append_normal(frame(1));
        buffer.append_alarm(frame(2));

        let failing = Arc::new(RecordingEncoder {
            fail: true,
            ..Default::default()
        });
        let result = buffer.flush(PathBuf::from("a.raw"), failing).unwrap().join().unwrap();
        assert!(result.is_err());
        assert_eq!(buffer.retained_failures(), 1);

        let ok = Arc::new(RecordingEncoder::default());
        let mut retried = buffer.retry_failed(ok.clone());
        assert_eq!(retried.len(), 1);
        let (path, handle) = retried.remove(0);
        assert_eq!(path, PathBuf::from("a.raw"));
        let saved = handle.unwrap().join().unwrap().unwrap();
        assert_eq!(saved.frames, 2);
        assert_eq!(saved.path, PathBuf::from("a.raw"));
        assert_eq!(*ok.ids.lock().unwrap(), vec![1, 2]);
        assert_eq!(buffer.retained_failures(), 0);
        assert!(buffer.retry_failed(ok).is_empty());
    }

    #[test]
    fn test_consecutive_failed_flushes_are_all_retried() {
        let mut buffer = FrameRingBuffer::new(Modality::Optical, 2, 2, 3.0, (2, 2));
        let failing = Arc::new(RecordingEncoder {
            fail: true,
            ..Default::default()
        });

        buffer.append_normal(frame(1));
        buffer.append_alarm(frame(2));
        let first = buffer.flush(PathBuf::from("first.raw"), failing.clone()).unwrap();
        assert!(first.join().unwrap().is_err());

        buffer.append_normal(frame(11));
        buffer.append_alarm(frame(12));
        buffer.append_alarm(frame(13));
        let second = buffer.flush(PathBuf::from("second.raw"), failing.clone()).unwrap();
        assert!(second.join().unwrap().is_err());
        assert_eq!(buffer.retained_failures(), 2);

        let ok = Arc::new(RecordingEncoder::default());
        let saved: Vec<SavedClip> = buffer
            .retry_failed(ok.clone())
            .into_iter()
            .map(|(_, handle)| handle.unwrap().join().unwrap().unwrap())
            .collect();
        let paths: Vec<&Path> = saved.iter().map(|s| s.path.as_path()).collect();
        assert_eq!(paths, vec![Path::new("first.raw"), Path::new("second.raw")]);
        assert_eq!(saved[0].frames, 2);
        assert_eq!(saved[1].frames, 3);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.retained_failures(), 0);
    }

    #[test]
    fn test_retry_queue_drops_oldest_beyond_bound() {
        let mut buffer = FrameRingBuffer::new(Modality::Thermal, 1, 1, 1.0, (2, 2));
        let failing = Arc::new(RecordingEncoder {
            fail: true,
            ..Default::default()
        });
        for id in 0..(MAX_RETAINED_CLIPS as u64 + 2) {
            buffer.append_alarm(frame(id));
            let path = PathBuf::from(format!("{}.raw", id));
            assert!(buffer.flush(path, failing.clone()).unwrap().join().unwrap().is_err());
        }
        assert_eq!(buffer.retained_failures(), MAX_RETAINED_CLIPS);

        let ok = Arc::new(RecordingEncoder::default());
        let retried = buffer.retry_failed(ok);
        assert_eq!(retried[0].0, PathBuf::from("2.raw"));
        for (_, handle) in retried {
            handle.unwrap().join().unwrap().unwrap();
        }
    }
}
