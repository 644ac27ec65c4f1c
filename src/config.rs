//! 哨兵配置 - 通过JSON文件调整参数
//!
//! 文件不存在时写出默认配置; 解析失败时告警并使用默认值。

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::alarm::{RelayChannels, RelayProfile, UdpRelay};
use crate::detection::LabelTable;
use crate::error::ConfigError;
use crate::input::{rtsp_url, MAX_STREAM_FPS, MIN_STREAM_FPS};
use crate::recording::ClipContainer;
use crate::session::monitor::{check_record_seconds, check_sensitivity, IntruderSettings};

/// 摄像头 (一台设备两路码流)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    pub address: String,
    pub optical_stream: String,
    pub thermal_stream: String,
    pub login: String,
    pub password: String,
    pub rtsp_port: u16,
    /// 流帧率提示值 (1..=240), 0 表示使用实测帧率
    pub fps_hint: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "cam-1".to_string(),
            address: "192.168.1.101".to_string(),
            optical_stream: "cam/realmonitor?channel=1&subtype=1".to_string(),
            thermal_stream: "cam/realmonitor?channel=2&subtype=1".to_string(),
            login: "admin".to_string(),
            password: String::new(),
            rtsp_port: 554,
            fps_hint: 25.0,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hint = self.fps_hint;
        if hint == 0.0 || (MIN_STREAM_FPS..=MAX_STREAM_FPS).contains(&hint) {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange {
                name: "fps_hint",
                value: hint.to_string(),
                expected: "0 (measured) or 1..=240",
            })
        }
    }

    pub fn optical_url(&self) -> String {
        rtsp_url(&self.login, &self.password, &self.address, self.rtsp_port, &self.optical_stream)
    }

    pub fn thermal_url(&self) -> String {
        rtsp_url(&self.login, &self.password, &self.address, self.rtsp_port, &self.thermal_stream)
    }
}

/// 继电器 (警笛 + 警灯)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub profile: RelayProfile,
    pub siren_channel: u8,
    pub lamp_channel: u8,
    pub blink_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 6723,
            profile: RelayProfile::Numeric,
            siren_channel: 1,
            lamp_channel: 2,
            blink_interval_ms: 500,
        }
    }
}

impl RelayConfig {
    pub fn channels(&self) -> RelayChannels {
        RelayChannels {
            siren: self.siren_channel,
            lamp: self.lamp_channel,
        }
    }

    pub fn blink_interval(&self) -> Duration {
        Duration::from_millis(self.blink_interval_ms.max(1))
    }

    pub fn connect(&self) -> UdpRelay {
        UdpRelay::new(&self.host, self.port, self.profile.clone(), self.channels())
    }
}

/// 报警录像
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub enabled: bool,
    pub base_dir: PathBuf,
    pub before_seconds: u32,
    pub after_seconds: u32,
    pub container: ClipContainer,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: PathBuf::from("./Video"),
            before_seconds: 5,
            after_seconds: 15,
            container: ClipContainer::Mp4,
        }
    }
}

/// 入侵判定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntruderConfig {
    pub tracked_labels: Vec<String>,
    pub sensitivity: f32,
    pub optical_enabled: bool,
    pub thermal_enabled: bool,
    pub armed: bool,
}

impl Default for IntruderConfig {
    fn default() -> Self {
        Self {
            tracked_labels: vec!["person".to_string()],
            sensitivity: 0.5,
            optical_enabled: true,
            thermal_enabled: false,
            armed: false,
        }
    }
}

/// 哨兵全局配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub cameras: Vec<CameraConfig>,
    pub relay: RelayConfig,
    pub record: RecordConfig,
    pub intruder: IntruderConfig,
    /// 每隔多少帧检测一次
    pub frame_stride: usize,
    /// 低延迟拉流参数 (key, value)
    pub ffmpeg_options: Vec<(String, String)>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        let ffmpeg_options = [
            ("analyzeduration", "0"),
            ("fflags", "nobuffer"),
            ("flags", "low_delay"),
            ("framedrop", "1"),
            ("sync", "video"),
            ("rtsp_transport", "tcp"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            cameras: vec![CameraConfig::default()],
            relay: RelayConfig::default(),
            record: RecordConfig::default(),
            intruder: IntruderConfig::default(),
            frame_stride: 10,
            ffmpeg_options,
        }
    }
}

impl SentinelConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::read(path) {
            Ok(config) => {
                info!("✅ 配置已从 {} 加载", path.display());
                config
            }
            Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                info!("📝 配置文件不存在, 创建默认配置: {}", path.display());
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    error!("❌ 保存配置失败: {}", e);
                }
                config
            }
            Err(e) => {
                warn!("⚠️ {}, 使用默认值", e);
                Self::default()
            }
        }
    }

    /// 读取并解析配置文件 (不做回退)
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 检查取值范围和跟踪类别
    pub fn validate(&self, labels: &LabelTable) -> Result<(), ConfigError> {
        check_sensitivity(self.intruder.sensitivity)?;
        check_record_seconds("before_seconds", self.record.before_seconds)?;
        check_record_seconds("after_seconds", self.record.after_seconds)?;
        if self.frame_stride == 0 {
            return Err(ConfigError::OutOfRange {
                name: "frame_stride",
                value: self.frame_stride.to_string(),
                expected: ">= 1",
            });
        }
        let mut names = std::collections::BTreeSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            // 录像目录按摄像头名区分
            if !names.insert(camera.name.as_str()) {
                return Err(ConfigError::OutOfRange {
                    name: "cameras",
                    value: camera.name.clone(),
                    expected: "unique camera names",
                });
            }
        }
        labels.validate(self.intruder.tracked_labels.iter().map(String::as_str))
    }

    /// 会话使用的入侵设置
    pub fn intruder_settings(&self) -> IntruderSettings {
        IntruderSettings {
            tracked_labels: self.intruder.tracked_labels.iter().cloned().collect(),
            sensitivity: self.intruder.sensitivity,
            optical_enabled: self.intruder.optical_enabled,
            thermal_enabled: self.intruder.thermal_enabled,
            armed: self.intruder.armed,
            record_enabled: self.record.enabled,
            before_seconds: self.record.before_seconds,
            after_seconds: self.record.after_seconds,
        }
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️ 当前哨兵配置:");
        for camera in &self.cameras {
            info!("  摄像头 {}: {}:{}", camera.name, camera.address, camera.rtsp_port);
        }
        info!(
            "  继电器: {}:{} ({:?})",
            self.relay.host, self.relay.port, self.relay.profile
        );
        info!(
            "  跟踪类别: {:?} | 灵敏度 {:.2} | 光学 {} | 热成像 {} | 布防 {}",
            self.intruder.tracked_labels,
            self.intruder.sensitivity,
            self.intruder.optical_enabled,
            self.intruder.thermal_enabled,
            self.intruder.armed
        );
        info!(
            "  录像: {} | 报警前 {}s | 报警后 {}s | {:?} -> {}",
            self.record.enabled,
            self.record.before_seconds,
            self.record.after_seconds,
            self.record.container,
            self.record.base_dir.display()
        );
        info!("  检测步长: {}", self.frame_stride);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sentinel-config-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_defaults() {
        let config = SentinelConfig::default();
        assert_eq!(config.frame_stride, 10);
        assert_eq!(config.record.before_seconds, 5);
        assert_eq!(config.record.after_seconds, 15);
        assert_eq!(config.relay.port, 6723);
        assert_eq!(config.relay.profile, RelayProfile::Numeric);
        assert_eq!(config.record.container, ClipContainer::Mp4);
        assert!(config.validate(&LabelTable::coco()).is_ok());
        assert_eq!(
            config.cameras[0].optical_url(),
            "rtsp://admin:@192.168.1.101:554/cam/realmonitor?channel=1&subtype=1"
        );
    }

    #[test]
    fn test_load_creates_missing_file() {
        let path = temp_path("missing.json");
        let _ = fs::remove_file(&path);
        let config = SentinelConfig::load(&path);
        assert_eq!(config, SentinelConfig::default());
        assert!(path.exists());
        assert_eq!(SentinelConfig::read(&path).unwrap(), config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_falls_back_on_parse_error() {
        let path = temp_path("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SentinelConfig::read(&path), Err(ConfigError::Parse { .. })));
        assert_eq!(SentinelConfig::load(&path), SentinelConfig::default());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = temp_path("partial.json");
        fs::write(
            &path,
            r#"{"intruder": {"tracked_labels": ["dog"], "sensitivity": 0.7},
                "relay": {"profile": {"kind": "credentialed", "login": "u", "password": "p"}}}"#,
        )
        .unwrap();
        let config = SentinelConfig::read(&path).unwrap();
        assert_eq!(config.intruder.tracked_labels, vec!["dog".to_string()]);
        assert!(config.intruder.optical_enabled);
        assert_eq!(config.relay.port, 6723);
        assert_eq!(config.relay.profile.encode(1, true), "u p k1=1");

        let settings = config.intruder_settings();
        assert!(settings.tracked_labels.contains("dog"));
        assert_eq!(settings.after_seconds, 15);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_validation_errors() {
        let labels = LabelTable::coco();
        let mut config = SentinelConfig::default();
        config.intruder.sensitivity = 1.2;
        assert!(matches!(config.validate(&labels), Err(ConfigError::OutOfRange { name: "sensitivity", .. })));

        let mut config = SentinelConfig::default();
        config.record.before_seconds = 301;
        assert!(config.validate(&labels).is_err());

        let mut config = SentinelConfig::default();
        config.frame_stride = 0;
        assert!(config.validate(&labels).is_err());

        let mut config = SentinelConfig::default();
        config.intruder.tracked_labels.push("ghost".into());
        assert!(matches!(config.validate(&labels), Err(ConfigError::UnknownLabel(_))));
    }

    #[test]
    fn test_camera_names_must_be_unique() {
        let labels = LabelTable::coco();
        let mut config = SentinelConfig::default();
        config.cameras.push(CameraConfig {
            name: "cam-2".to_string(),
            ..CameraConfig::default()
        });
        assert!(config.validate(&labels).is_ok());

        config.cameras.push(CameraConfig::default());
        assert!(matches!(config.validate(&labels), Err(ConfigError::OutOfRange { name: "cameras", .. })));
    }

    #[test]
    fn test_fps_hint_range() {
        let labels = LabelTable::coco();
        for hint in [1e-300, 0.5, -25.0, 241.0, 1e12, f64::NAN, f64::INFINITY] {
            let mut config = SentinelConfig::default();
            config.cameras[0].fps_hint = hint;
            assert!(
                matches!(config.validate(&labels), Err(ConfigError::OutOfRange { name: "fps_hint", .. })),
                "fps_hint {} accepted",
                hint
            );
        }
        for hint in [0.0, 1.0, 25.0, 29.97, 240.0] {
            let mut config = SentinelConfig::default();
            config.cameras[0].fps_hint = hint;
            assert!(config.validate(&labels).is_ok());
        }
    }
}
