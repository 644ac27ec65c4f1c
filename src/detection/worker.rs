//! 检测线程 (Detection Worker)
//! 职责: 持续拉取视频帧 → 按步长限速调用检测器 → 原子发布 (最新帧, 检测结果)
//!
//! 检测器比取帧慢几个数量级, 因此每 `frame_stride` 帧才检测一次,
//! 其余帧只刷新画面。发布的 (帧, 结果) 对在同一把锁内整体替换,
//! 检测计算期间不持有锁。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::detector::ObjectDetector;
use super::types::{Detection, Modality};
use crate::error::StreamError;
use crate::input::{Frame, StreamInfo, StreamSource};

/// 步长计数器: 每 `stride` 次取帧触发一次检测
#[derive(Debug, Default, Clone)]
pub struct StrideCounter {
    count: usize,
}

impl StrideCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次取帧, 到达步长时归零并返回 true
    pub fn tick(&mut self, stride: usize) -> bool {
        self.count += 1;
        if self.count >= stride.max(1) {
            self.count = 0;
            true
        } else {
            false
        }
    }

    /// 让下一次取帧立即触发检测
    pub fn prime(&mut self, stride: usize) {
        self.count = stride.max(1) - 1;
    }
}

/// 检测线程对外发布的快照
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub frame: Option<Frame>,
    pub detections: Arc<Vec<Detection>>,
    /// 产生当前检测结果的帧序号
    pub detected_frame_id: Option<u64>,
}

impl Snapshot {
    pub fn frame_id(&self) -> Option<u64> {
        self.frame.as_ref().map(|f| f.frame_id)
    }
}

/// 检测线程参数
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub frame_stride: usize,
    pub detection_enabled: bool,
    /// 视频源不可用时的重连间隔
    pub reopen_interval: Duration,
    /// 没有新帧时的休眠时间
    pub idle_sleep: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            frame_stride: 10,
            detection_enabled: false,
            reopen_interval: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(5),
        }
    }
}

struct WorkerShared {
    published: Mutex<Snapshot>,
    info: Mutex<Option<StreamInfo>>,
    running: AtomicBool,
    stream_open: AtomicBool,
    detection_enabled: AtomicBool,
    frame_stride: AtomicUsize,
    prime_requested: AtomicBool,
    detector_calls: AtomicU64,
}

impl WorkerShared {
    fn published(&self) -> MutexGuard<'_, Snapshot> {
        // 另一线程panic不应拖垮读取端
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_info(&self, info: Option<StreamInfo>) {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = info;
    }
}

/// 线程退出时保证释放视频源 (包括panic路径)
struct SourceGuard<S: StreamSource> {
    source: S,
}

impl<S: StreamSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        self.source.release();
    }
}

/// 检测线程句柄
pub struct DetectionWorker {
    modality: Modality,
    name: String,
    shared: Arc<WorkerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DetectionWorker {
    /// 启动检测线程, 视频源与检测器的所有权转移给线程
    pub fn spawn<S, D>(
        name: impl Into<String>,
        modality: Modality,
        source: S,
        detector: D,
        options: WorkerOptions,
    ) -> std::io::Result<Self>
    where
        S: StreamSource + 'static,
        D: ObjectDetector + 'static,
    {
        let name = name.into();
        let shared = Arc::new(WorkerShared {
            published: Mutex::new(Snapshot::default()),
            info: Mutex::new(None),
            running: AtomicBool::new(true),
            stream_open: AtomicBool::new(false),
            detection_enabled: AtomicBool::new(options.detection_enabled),
            frame_stride: AtomicUsize::new(options.frame_stride.max(1)),
            prime_requested: AtomicBool::new(options.detection_enabled),
            detector_calls: AtomicU64::new(0),
        });

        let mut acquisition = Acquisition {
            name: name.clone(),
            shared: Arc::clone(&shared),
            source: SourceGuard { source },
            detector,
            counter: StrideCounter::new(),
            options,
            count: 0,
            last: Instant::now(),
            last_open_attempt: None,
            open_failures: 0,
        };

        let thread = std::thread::Builder::new()
            .name(format!("detect-{}", name))
            .spawn(move || acquisition.run())?;

        Ok(Self {
            modality,
            name,
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 读取最新发布的 (帧, 检测结果)
    pub fn snapshot(&self) -> Snapshot {
        self.shared.published().clone()
    }

    /// 最近一次成功打开时的流信息
    pub fn stream_info(&self) -> Option<StreamInfo> {
        *self.shared.info.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_stream_open(&self) -> bool {
        self.shared.stream_open.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 关闭检测: 立即清空已发布的结果, 不再调用检测器
    pub fn disable_detection(&self) {
        self.shared.detection_enabled.store(false, Ordering::Release);
        let mut published = self.shared.published();
        published.detections = Arc::new(Vec::new());
        published.detected_frame_id = None;
    }

    /// 开启检测: 重置步长计数, 下一帧即触发检测
    pub fn enable_detection(&self) {
        self.shared.prime_requested.store(true, Ordering::Release);
        self.shared.detection_enabled.store(true, Ordering::Release);
    }

    pub fn is_detection_enabled(&self) -> bool {
        self.shared.detection_enabled.load(Ordering::Acquire)
    }

    pub fn set_frame_stride(&self, stride: usize) {
        self.shared.frame_stride.store(stride.max(1), Ordering::Release);
    }

    pub fn frame_stride(&self) -> usize {
        self.shared.frame_stride.load(Ordering::Acquire)
    }

    /// 检测器累计调用次数
    pub fn detector_calls(&self) -> u64 {
        self.shared.detector_calls.load(Ordering::Acquire)
    }

    /// 停止线程并释放视频源, 重复调用无副作用
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("❌ 检测线程异常退出: {}", self.name);
            }
        }
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 线程内部状态 (只在检测线程中访问)
struct Acquisition<S: StreamSource, D: ObjectDetector> {
    name: String,
    shared: Arc<WorkerShared>,
    source: SourceGuard<S>,
    detector: D,
    counter: StrideCounter,
    options: WorkerOptions,

    // 统计
    count: u64,
    last: Instant,

    last_open_attempt: Option<Instant>,
    open_failures: u32,
}

impl<S: StreamSource, D: ObjectDetector> Acquisition<S, D> {
    fn run(&mut self) {
        info!(
            "🔍 检测线程启动: {} ({}, 检测器: {})",
            self.name,
            self.source.source.describe(),
            self.detector.name()
        );

        while self.shared.running.load(Ordering::Acquire) {
            if !self.source.source.is_open() {
                self.shared.stream_open.store(false, Ordering::Release);
                self.try_open();
                std::thread::sleep(self.options.idle_sleep);
                continue;
            }

            match self.source.source.next_frame() {
                Ok(frame) => self.acquire(frame),
                Err(StreamError::NoFrame) => std::thread::sleep(self.options.idle_sleep),
                Err(StreamError::Decode(e)) => {
                    debug!("⚠️ {} 丢弃损坏帧: {}", self.name, e);
                }
                Err(e) => {
                    warn!("📴 {} 视频流中断: {}", self.name, e);
                    self.source.source.release();
                    self.shared.stream_open.store(false, Ordering::Release);
                }
            }
        }

        self.source.source.release();
        self.shared.stream_open.store(false, Ordering::Release);
        info!("✅ 检测线程退出: {}", self.name);
    }

    fn try_open(&mut self) {
        if let Some(last) = self.last_open_attempt {
            if last.elapsed() < self.options.reopen_interval {
                return;
            }
        }
        self.last_open_attempt = Some(Instant::now());

        match self.source.source.open() {
            Ok(()) => {
                let info = self.source.source.info();
                if let Some(info) = info {
                    info!(
                        "📹 {} 视频流就绪: {}x{} @ {:.1}fps",
                        self.name, info.width, info.height, info.fps
                    );
                }
                self.shared.set_info(info);
                self.shared.stream_open.store(true, Ordering::Release);
                self.open_failures = 0;
            }
            Err(e) => {
                // 只在首次失败时告警, 之后静默重试
                if self.open_failures == 0 {
                    warn!("⚠️ {} 视频流不可用, 将持续重试: {}", self.name, e);
                } else {
                    debug!("{} 重连失败 #{}: {}", self.name, self.open_failures, e);
                }
                self.open_failures = self.open_failures.saturating_add(1);
            }
        }
    }

    fn acquire(&mut self, frame: Frame) {
        let stride = self.shared.frame_stride.load(Ordering::Acquire);
        if self.shared.prime_requested.swap(false, Ordering::AcqRel) {
            self.counter.prime(stride);
        }

        self.count += 1;
        if self.last.elapsed().as_secs_f64() >= 5.0 {
            let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
            debug!(
                "📊 {} 采集统计: {:.1}fps | 步长{} | 检测{}次",
                self.name,
                fps,
                stride,
                self.shared.detector_calls.load(Ordering::Relaxed)
            );
            self.count = 0;
            self.last = Instant::now();
        }

        if !self.counter.tick(stride) {
            self.publish(frame, None);
            return;
        }

        if !self.shared.detection_enabled.load(Ordering::Acquire) {
            self.publish(frame, Some(Vec::new()));
            return;
        }

        self.shared.detector_calls.fetch_add(1, Ordering::AcqRel);
        match self.detector.detect(&frame) {
            Ok(detections) => self.publish(frame, Some(detections)),
            Err(e) => {
                // 保留上一次的结果, 避免画面闪烁
                warn!("⚠️ {} 检测失败: {}", self.name, e);
                self.publish(frame, None);
            }
        }
    }

    fn publish(&self, frame: Frame, detections: Option<Vec<Detection>>) {
        let frame_id = frame.frame_id;
        let mut published = self.shared.published();
        published.frame = Some(frame);
        if let Some(detections) = detections {
            // 检测期间被关闭: 不发布过期结果
            if self.shared.detection_enabled.load(Ordering::Acquire) {
                published.detections = Arc::new(detections);
                published.detected_frame_id = Some(frame_id);
            } else {
                published.detections = Arc::new(Vec::new());
                published.detected_frame_id = None;
            }
        }
    }
}
