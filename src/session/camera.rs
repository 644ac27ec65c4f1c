//! 摄像头会话: 两个检测线程 + 一个刷新线程
//!
//! 刷新线程按光学流的帧率运行, 每个周期读取两路最新快照交给
//! `IntrusionMonitor`, 再驱动报警控制器, 并通过事件通道通知操作端。
//! 会话拥有两个检测线程, 停止会话时两路视频源都会被释放。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::monitor::{IntruderSettings, IntrusionMonitor, ModalityTick, PendingFlush, TickOutcome};
use crate::alarm::{AlarmController, AlarmState};
use crate::detection::{DetectionWorker, LabelTable, Modality, ObjectDetector, WorkerOptions};
use crate::error::ConfigError;
use crate::input::{StreamInfo, StreamSource};
use crate::recording::{ClipEncoder, SavedClip};

/// 未知帧率时的刷新周期
const DEFAULT_TICK: Duration = Duration::from_millis(40);

/// 会话事件 (发给操作端)
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StreamOpened {
        camera: String,
        modality: Modality,
        info: StreamInfo,
    },
    EpisodeStarted {
        camera: String,
        confidence: f32,
    },
    EpisodeEnded {
        camera: String,
    },
    ClipSaved(SavedClip),
    ClipFailed {
        modality: Modality,
        path: PathBuf,
        reason: String,
    },
}

/// 会话参数
pub struct SessionOptions {
    pub camera: String,
    pub settings: IntruderSettings,
    pub labels: LabelTable,
    pub record_dir: PathBuf,
    pub encoder: Arc<dyn ClipEncoder>,
    pub frame_stride: usize,
    /// 固定刷新周期, `None` 时跟随光学流帧率
    pub tick_interval: Option<Duration>,
    pub worker: WorkerOptions,
}

impl SessionOptions {
    pub fn new(camera: impl Into<String>, record_dir: impl Into<PathBuf>, encoder: Arc<dyn ClipEncoder>) -> Self {
        Self {
            camera: camera.into(),
            settings: IntruderSettings::default(),
            labels: LabelTable::coco(),
            record_dir: record_dir.into(),
            encoder,
            frame_stride: 10,
            tick_interval: None,
            worker: WorkerOptions::default(),
        }
    }
}

/// 刷新线程与会话句柄共享的部分
struct SessionCore {
    camera: String,
    optical: DetectionWorker,
    thermal: DetectionWorker,
    alarm: Arc<AlarmController>,
    monitor: Mutex<IntrusionMonitor>,
    pending: Mutex<Vec<PendingFlush>>,
    events: Sender<SessionEvent>,
    /// f32 按位存储
    confidence: AtomicU32,
    optical_open: AtomicBool,
    thermal_open: AtomicBool,
}

impl SessionCore {
    fn monitor(&self) -> MutexGuard<'_, IntrusionMonitor> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn worker(&self, modality: Modality) -> &DetectionWorker {
        match modality {
            Modality::Optical => &self.optical,
            Modality::Thermal => &self.thermal,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // 没有订阅者时丢弃
        let _ = self.events.send(event);
    }

    fn read(&self, modality: Modality) -> ModalityTick {
        let worker = self.worker(modality);
        let info = worker.stream_info();
        let open = worker.is_stream_open();
        let flag = match modality {
            Modality::Optical => &self.optical_open,
            Modality::Thermal => &self.thermal_open,
        };
        if open && !flag.swap(true, Ordering::AcqRel) {
            if let Some(info) = info {
                self.emit(SessionEvent::StreamOpened {
                    camera: self.camera.clone(),
                    modality,
                    info,
                });
            }
        } else if !open {
            flag.store(false, Ordering::Release);
        }
        ModalityTick {
            snapshot: worker.snapshot(),
            info,
        }
    }

    /// 一个刷新周期
    fn tick(&self) -> TickOutcome {
        let optical = self.read(Modality::Optical);
        let thermal = self.read(Modality::Thermal);

        let mut outcome = self.monitor().process(&optical, &thermal);
        self.confidence
            .store(outcome.confidence.to_bits(), Ordering::Release);

        if outcome.alarm_requested {
            self.alarm.trigger_alarm();
        }
        if outcome.episode_started {
            self.emit(SessionEvent::EpisodeStarted {
                camera: self.camera.clone(),
                confidence: outcome.confidence,
            });
        }
        if outcome.episode_ended {
            self.emit(SessionEvent::EpisodeEnded {
                camera: self.camera.clone(),
            });
        }

        let flushes = std::mem::take(&mut outcome.flushes);
        self.track(flushes);
        self.collect_finished();
        outcome
    }

    fn track(&self, flushes: Vec<PendingFlush>) {
        if flushes.is_empty() {
            return;
        }
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(flushes);
    }

    /// 收集已结束的写盘任务, `wait` 为 true 时等待全部结束
    fn collect(&self, wait: bool) {
        let finished: Vec<PendingFlush> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let (done, running): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|f| wait || f.handle.is_finished());
            *pending = running;
            done
        };

        for flush in finished {
            let event = match flush.handle.join() {
                Ok(Ok(saved)) => SessionEvent::ClipSaved(saved),
                Ok(Err(e)) => SessionEvent::ClipFailed {
                    modality: flush.modality,
                    path: flush.path,
                    reason: e.to_string(),
                },
                Err(_) => {
                    error!("❌ 写盘线程异常退出: {}", flush.path.display());
                    SessionEvent::ClipFailed {
                        modality: flush.modality,
                        path: flush.path,
                        reason: "writer thread panicked".to_string(),
                    }
                }
            };
            self.emit(event);
        }
    }

    fn collect_finished(&self) {
        self.collect(false);
    }

    /// 期望的刷新周期: 固定值或光学流帧率
    fn desired_period(&self, fixed: Option<Duration>) -> Duration {
        if let Some(period) = fixed {
            return period;
        }
        self.optical
            .stream_info()
            .and_then(|info| info.frame_interval())
            .unwrap_or(DEFAULT_TICK)
    }
}

/// 摄像头会话
pub struct CameraSession {
    core: Arc<SessionCore>,
    labels: LabelTable,
    events: Receiver<SessionEvent>,
    stop_tx: Mutex<Option<Sender<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraSession {
    /// 启动两个检测线程和刷新线程
    pub fn start<SO, ST, DO, DT>(
        options: SessionOptions,
        optical: (SO, DO),
        thermal: (ST, DT),
        alarm: Arc<AlarmController>,
    ) -> anyhow::Result<Self>
    where
        SO: StreamSource + 'static,
        ST: StreamSource + 'static,
        DO: ObjectDetector + 'static,
        DT: ObjectDetector + 'static,
    {
        options.settings.validate(&options.labels)?;
        let camera = options.camera.clone();
        let settings = options.settings.clone();

        let worker_options = |enabled: bool| WorkerOptions {
            frame_stride: options.frame_stride.max(1),
            detection_enabled: enabled,
            ..options.worker.clone()
        };
        let optical = DetectionWorker::spawn(
            format!("{}/optical", camera),
            Modality::Optical,
            optical.0,
            optical.1,
            worker_options(settings.optical_enabled),
        )?;
        let thermal = DetectionWorker::spawn(
            format!("{}/thermal", camera),
            Modality::Thermal,
            thermal.0,
            thermal.1,
            worker_options(settings.thermal_enabled),
        )?;

        if settings.armed {
            alarm.arm();
        }

        let (events_tx, events_rx) = unbounded();
        let core = Arc::new(SessionCore {
            camera: camera.clone(),
            optical,
            thermal,
            alarm,
            monitor: Mutex::new(IntrusionMonitor::new(
                camera.clone(),
                settings,
                options.record_dir,
                options.encoder,
            )),
            pending: Mutex::new(Vec::new()),
            events: events_tx,
            confidence: AtomicU32::new(0),
            optical_open: AtomicBool::new(false),
            thermal_open: AtomicBool::new(false),
        });

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let tick_interval = options.tick_interval;
        let ticker_core = Arc::clone(&core);
        let ticker = std::thread::Builder::new()
            .name(format!("session-{}", camera))
            .spawn(move || run_ticker(ticker_core, stop_rx, tick_interval))?;

        info!("📷 摄像头会话启动: {}", camera);
        Ok(Self {
            core,
            labels: options.labels,
            events: events_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            ticker: Mutex::new(Some(ticker)),
        })
    }

    pub fn camera(&self) -> &str {
        &self.core.camera
    }

    /// 事件接收端 (可克隆给多个消费者)
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    pub fn worker(&self, modality: Modality) -> &DetectionWorker {
        self.core.worker(modality)
    }

    pub fn settings(&self) -> IntruderSettings {
        self.core.monitor().settings().clone()
    }

    pub fn is_intruder_active(&self) -> bool {
        self.core.monitor().is_intruder_active()
    }

    /// 最近一个周期的综合置信度 (0..=1, 仅供显示)
    pub fn confidence(&self) -> f32 {
        f32::from_bits(self.core.confidence.load(Ordering::Acquire))
    }

    pub fn alarm_state(&self) -> AlarmState {
        self.core.alarm.state()
    }

    pub fn set_sensitivity(&self, value: f32) -> Result<(), ConfigError> {
        self.core.monitor().set_sensitivity(value)
    }

    /// 添加跟踪类别, 类别必须在标签表中
    pub fn add_tracked_label(&self, label: &str) -> Result<(), ConfigError> {
        if !self.labels.contains(label) {
            return Err(ConfigError::UnknownLabel(label.to_string()));
        }
        self.core.monitor().add_tracked_label(label);
        Ok(())
    }

    pub fn remove_tracked_label(&self, label: &str) -> bool {
        self.core.monitor().remove_tracked_label(label)
    }

    fn set_enabled(&self, modality: Modality, enabled: bool) {
        let worker = self.core.worker(modality);
        if enabled {
            worker.enable_detection();
        } else {
            worker.disable_detection();
        }
        self.core.monitor().set_enabled(modality, enabled);
        debug!("{} {} 检测: {}", self.core.camera, modality, enabled);
    }

    pub fn set_optical_enabled(&self, enabled: bool) {
        self.set_enabled(Modality::Optical, enabled);
    }

    pub fn set_thermal_enabled(&self, enabled: bool) {
        self.set_enabled(Modality::Thermal, enabled);
    }

    /// 布防/撤防, 同时驱动报警控制器
    pub fn set_armed(&self, armed: bool) {
        self.core.monitor().set_armed(armed);
        if armed {
            self.core.alarm.arm();
        } else {
            self.core.alarm.disarm();
        }
    }

    pub fn silence(&self) {
        self.core.alarm.silence();
    }

    pub fn set_record_enabled(&self, enabled: bool) {
        self.core.monitor().set_record_enabled(enabled);
    }

    pub fn set_before_seconds(&self, seconds: u32) -> Result<(), ConfigError> {
        self.core.monitor().set_before_seconds(seconds)
    }

    pub fn set_after_seconds(&self, seconds: u32) -> Result<(), ConfigError> {
        self.core.monitor().set_after_seconds(seconds)
    }

    /// 处理速度: 两路检测线程的步长
    pub fn set_frame_stride(&self, stride: usize) {
        self.core.optical.set_frame_stride(stride);
        self.core.thermal.set_frame_stride(stride);
    }

    /// 重新写出之前失败的片段, 返回派发的任务数
    pub fn retry_failed_clips(&self) -> usize {
        let flushes = self.core.monitor().retry_failed();
        let count = flushes.len();
        self.core.track(flushes);
        count
    }

    /// 停止刷新线程和两个检测线程, 等待写盘完成; 重复调用无副作用
    pub fn stop(&self) {
        let stop_tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(stop_tx) = stop_tx else {
            return;
        };
        let _ = stop_tx.send(());
        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(ticker) = ticker {
            if ticker.join().is_err() {
                error!("❌ 刷新线程异常退出: {}", self.core.camera);
            }
        }
        self.core.optical.stop();
        self.core.thermal.stop();
        self.core.collect(true);
        info!("🛑 摄像头会话已停止: {}", self.core.camera);
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_ticker(core: Arc<SessionCore>, stop_rx: Receiver<()>, fixed: Option<Duration>) {
    let mut period = core.desired_period(fixed);
    let mut ticker = tick(period);
    debug!("{} 刷新周期 {:?}", core.camera, period);

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                core.tick();
                let desired = core.desired_period(fixed);
                if desired != period {
                    debug!("{} 刷新周期 {:?} -> {:?}", core.camera, period, desired);
                    period = desired;
                    ticker = tick(period);
                }
            }
        }
    }

    if core.monitor().is_intruder_active() {
        warn!("⚠️ {} 会话在报警期间停止, 当前片段不会写盘", core.camera);
    }
}
