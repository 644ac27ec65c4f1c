//! 入侵判定与报警片段状态机 (每个刷新周期调用一次)
//!
//! 只处理已经发布的快照, 不持有任何线程, 便于离线复现。
//! 每个周期的顺序:
//! 1. 按当前 `intruder_active` 把新帧写入报警前/报警后缓冲
//! 2. 融合两路检测结果, 更新报警片段状态
//! 3. 片段结束且允许录像时, 两路缓冲各写出一个文件

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info, warn};

use super::fusion::{combined_confidence, combined_trigger, has_intruder, mean_score, Highlight, Reading};
use crate::detection::{LabelTable, Modality, Snapshot};
use crate::error::ConfigError;
use crate::input::StreamInfo;
use crate::recording::{clip_path, ClipEncoder, FlushHandle, FrameRingBuffer, MAX_RECORD_SECONDS};

/// 入侵者相关设置
#[derive(Debug, Clone, PartialEq)]
pub struct IntruderSettings {
    pub tracked_labels: BTreeSet<String>,
    pub sensitivity: f32,
    pub optical_enabled: bool,
    pub thermal_enabled: bool,
    pub armed: bool,
    pub record_enabled: bool,
    pub before_seconds: u32,
    pub after_seconds: u32,
}

impl Default for IntruderSettings {
    fn default() -> Self {
        Self {
            tracked_labels: BTreeSet::new(),
            sensitivity: 0.5,
            optical_enabled: false,
            thermal_enabled: false,
            armed: false,
            record_enabled: false,
            before_seconds: 5,
            after_seconds: 15,
        }
    }
}

pub fn check_sensitivity(value: f32) -> Result<f32, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            name: "sensitivity",
            value: value.to_string(),
            expected: "0.0..=1.0",
        })
    }
}

pub fn check_record_seconds(name: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value > 0 && value <= MAX_RECORD_SECONDS {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value: value.to_string(),
            expected: "1..=300 seconds",
        })
    }
}

impl IntruderSettings {
    pub fn validate(&self, labels: &LabelTable) -> Result<(), ConfigError> {
        check_sensitivity(self.sensitivity)?;
        check_record_seconds("before_seconds", self.before_seconds)?;
        check_record_seconds("after_seconds", self.after_seconds)?;
        labels.validate(self.tracked_labels.iter().map(String::as_str))
    }

    pub fn is_enabled(&self, modality: Modality) -> bool {
        match modality {
            Modality::Optical => self.optical_enabled,
            Modality::Thermal => self.thermal_enabled,
        }
    }
}

/// 单路在本周期的输入
#[derive(Debug, Clone, Default)]
pub struct ModalityTick {
    pub snapshot: Snapshot,
    pub info: Option<StreamInfo>,
}

/// 已派发的写盘任务
#[derive(Debug)]
pub struct PendingFlush {
    pub modality: Modality,
    pub path: PathBuf,
    pub handle: FlushHandle,
}

/// 一个周期的处理结果
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// 融合后的触发判断 (不考虑布防)
    pub trigger: bool,
    /// 本周期需要请求报警 (触发且已布防)
    pub alarm_requested: bool,
    pub episode_started: bool,
    pub episode_ended: bool,
    pub highlight: Highlight,
    pub confidence: f32,
    pub flushes: Vec<PendingFlush>,
}

/// 单路的录像缓冲以及上次写入的帧序号
struct Channel {
    modality: Modality,
    buffer: Option<FrameRingBuffer>,
    last_frame_id: Option<u64>,
}

impl Channel {
    fn new(modality: Modality) -> Self {
        Self {
            modality,
            buffer: None,
            last_frame_id: None,
        }
    }

    /// 按流信息(重新)创建缓冲
    fn ensure_buffer(&mut self, info: &StreamInfo, settings: &IntruderSettings) {
        let matches = self
            .buffer
            .as_ref()
            .map(|b| b.fps() == info.fps && b.resolution() == info.resolution())
            .unwrap_or(false);
        if matches || info.width == 0 || info.height == 0 {
            return;
        }
        if self.buffer.is_some() {
            info!("🔄 {} 视频参数变化, 重建录像缓冲", self.modality);
        }
        self.buffer = Some(FrameRingBuffer::new(
            self.modality,
            settings.before_seconds,
            settings.after_seconds,
            info.fps,
            info.resolution(),
        ));
    }

    fn append(&mut self, tick: &ModalityTick, alarm: bool) {
        let (Some(buffer), Some(frame)) = (self.buffer.as_mut(), tick.snapshot.frame.as_ref()) else {
            return;
        };
        // 刷新快于取帧时同一帧只写一次
        if self.last_frame_id == Some(frame.frame_id) {
            return;
        }
        self.last_frame_id = Some(frame.frame_id);
        if alarm {
            buffer.append_alarm(frame.clone());
        } else {
            buffer.append_normal(frame.clone());
        }
    }
}

/// 单个摄像头的入侵监视状态
pub struct IntrusionMonitor {
    camera: String,
    settings: IntruderSettings,
    record_dir: PathBuf,
    encoder: Arc<dyn ClipEncoder>,
    optical: Channel,
    thermal: Channel,
    intruder_active: bool,
    ready_to_save: bool,
}

impl IntrusionMonitor {
    pub fn new(
        camera: impl Into<String>,
        settings: IntruderSettings,
        record_dir: impl Into<PathBuf>,
        encoder: Arc<dyn ClipEncoder>,
    ) -> Self {
        Self {
            camera: camera.into(),
            settings,
            record_dir: record_dir.into(),
            encoder,
            optical: Channel::new(Modality::Optical),
            thermal: Channel::new(Modality::Thermal),
            intruder_active: false,
            ready_to_save: false,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn settings(&self) -> &IntruderSettings {
        &self.settings
    }

    pub fn record_dir(&self) -> &Path {
        &self.record_dir
    }

    pub fn is_intruder_active(&self) -> bool {
        self.intruder_active
    }

    pub fn buffer(&self, modality: Modality) -> Option<&FrameRingBuffer> {
        self.channel(modality).buffer.as_ref()
    }

    fn channel(&self, modality: Modality) -> &Channel {
        match modality {
            Modality::Optical => &self.optical,
            Modality::Thermal => &self.thermal,
        }
    }

    fn buffers_mut(&mut self) -> impl Iterator<Item = &mut FrameRingBuffer> {
        [&mut self.optical, &mut self.thermal]
            .into_iter()
            .filter_map(|c| c.buffer.as_mut())
    }

    pub fn set_sensitivity(&mut self, value: f32) -> Result<(), ConfigError> {
        self.settings.sensitivity = check_sensitivity(value)?;
        Ok(())
    }

    pub fn add_tracked_label(&mut self, label: &str) -> bool {
        self.settings.tracked_labels.insert(label.to_string())
    }

    pub fn remove_tracked_label(&mut self, label: &str) -> bool {
        self.settings.tracked_labels.remove(label)
    }

    pub fn set_enabled(&mut self, modality: Modality, enabled: bool) {
        match modality {
            Modality::Optical => self.settings.optical_enabled = enabled,
            Modality::Thermal => self.settings.thermal_enabled = enabled,
        }
    }

    pub fn set_armed(&mut self, armed: bool) {
        self.settings.armed = armed;
    }

    pub fn set_record_enabled(&mut self, enabled: bool) {
        self.settings.record_enabled = enabled;
    }

    /// 修改报警前时长, 丢弃已缓冲的报警前帧
    pub fn set_before_seconds(&mut self, seconds: u32) -> Result<(), ConfigError> {
        let seconds = check_record_seconds("before_seconds", seconds)?;
        self.settings.before_seconds = seconds;
        for buffer in self.buffers_mut() {
            buffer.resize_before(seconds);
        }
        Ok(())
    }

    /// 修改报警后时长, 丢弃已缓冲的报警帧
    pub fn set_after_seconds(&mut self, seconds: u32) -> Result<(), ConfigError> {
        let seconds = check_record_seconds("after_seconds", seconds)?;
        self.settings.after_seconds = seconds;
        for buffer in self.buffers_mut() {
            buffer.resize_after(seconds);
        }
        Ok(())
    }

    fn reading(&self, modality: Modality, tick: &ModalityTick) -> Reading {
        if !self.settings.is_enabled(modality) {
            return None;
        }
        Some(has_intruder(
            &tick.snapshot.detections,
            &self.settings.tracked_labels,
            self.settings.sensitivity,
        ))
    }

    /// 处理一个刷新周期
    pub fn process(&mut self, optical: &ModalityTick, thermal: &ModalityTick) -> TickOutcome {
        if let Some(info) = &optical.info {
            self.optical.ensure_buffer(info, &self.settings);
        }
        if let Some(info) = &thermal.info {
            self.thermal.ensure_buffer(info, &self.settings);
        }

        self.optical.append(optical, self.intruder_active);
        self.thermal.append(thermal, self.intruder_active);

        let optical_reading = self.reading(Modality::Optical, optical);
        let thermal_reading = self.reading(Modality::Thermal, thermal);
        let trigger = combined_trigger(optical_reading, thermal_reading);

        let mut outcome = TickOutcome {
            trigger,
            highlight: Highlight::from_readings(optical_reading, thermal_reading),
            confidence: combined_confidence(
                mean_score(&optical.snapshot.detections),
                mean_score(&thermal.snapshot.detections),
            ),
            ..Default::default()
        };

        if trigger && self.settings.armed {
            if !self.intruder_active {
                info!(
                    "🚨 {} 发现入侵者, 报警开始 (置信度 {:.0}%)",
                    self.camera,
                    outcome.confidence * 100.0
                );
                outcome.episode_started = true;
            }
            self.intruder_active = true;
            self.ready_to_save = true;
            outcome.alarm_requested = true;
        } else if self.intruder_active {
            self.intruder_active = false;
            outcome.episode_ended = true;
            info!("✅ {} 入侵者消失, 报警片段结束", self.camera);
            if self.ready_to_save && self.settings.record_enabled {
                outcome.flushes = self.flush_all();
                self.ready_to_save = false;
            }
        }

        outcome
    }

    /// 两路缓冲各写出一个文件 (同一时间戳)
    fn flush_all(&mut self) -> Vec<PendingFlush> {
        let now = Local::now();
        let camera = self.camera.clone();
        let record_dir = self.record_dir.clone();
        let encoder = Arc::clone(&self.encoder);

        let mut flushes = Vec::new();
        for buffer in self.buffers_mut() {
            if buffer.pre_ring().is_empty() && buffer.post_ring().is_empty() {
                debug!("{} 缓冲为空, 跳过写盘", buffer.modality());
                continue;
            }
            let path = clip_path(&record_dir, &camera, buffer.modality(), now, encoder.extension());
            match buffer.flush(path.clone(), Arc::clone(&encoder)) {
                Ok(handle) => flushes.push(PendingFlush {
                    modality: buffer.modality(),
                    path,
                    handle,
                }),
                Err(e) => warn!("⚠️ 无法启动写盘线程 {}: {}", path.display(), e),
            }
        }
        flushes
    }

    /// 重新派发写盘失败的片段, 文件名沿用首次写盘时的时间戳
    pub fn retry_failed(&mut self) -> Vec<PendingFlush> {
        let encoder = Arc::clone(&self.encoder);
        let mut flushes = Vec::new();
        for buffer in self.buffers_mut() {
            let modality = buffer.modality();
            for (path, handle) in buffer.retry_failed(Arc::clone(&encoder)) {
                match handle {
                    Ok(handle) => flushes.push(PendingFlush {
                        modality,
                        path,
                        handle,
                    }),
                    Err(e) => warn!("⚠️ 无法启动写盘线程 {}: {}", path.display(), e),
                }
            }
        }
        flushes
    }
}
