/// 数字卫兵 (Digital Sentinel)
///
/// 双光谱入侵报警
///
/// 系统架构:
/// 1. 检测线程: 每路视频一个, 持续取帧并按步长调用检测器
/// 2. 刷新线程: 每个摄像头一个, 融合两路结果并驱动报警与录像
/// 3. 主线程:   操作台命令 (标准输入) 与事件日志
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{after, never, select, unbounded, Receiver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinel_guard::config::CameraConfig;
use sentinel_guard::detection::{Modality, NullDetector, ObjectDetector, ScriptedDetector};
use sentinel_guard::input::{FileSource, StreamSource};
use sentinel_guard::recording::ClipEncoder;
use sentinel_guard::{
    AlarmController, CameraSession, LabelTable, RelaySink, SentinelConfig, SessionEvent,
    SessionOptions,
};

/// 数字卫兵参数
#[derive(Parser, Debug)]
#[command(author, version, about = "数字卫兵 - 双光谱入侵报警", long_about = None)]
struct Args {
    /// 配置文件 (不存在时自动创建)
    #[arg(short, long, default_value = "sentinel.json")]
    config: PathBuf,

    /// 可见光图像序列目录 (回放模式)
    #[arg(long)]
    optical_dir: Option<PathBuf>,

    /// 热成像图像序列目录 (回放模式)
    #[arg(long)]
    thermal_dir: Option<PathBuf>,

    /// 可见光检测脚本 (JSON), 启用可见光检测时必须指定
    #[arg(short, long)]
    detections: Option<PathBuf>,

    /// 热成像检测脚本 (JSON), 启用热成像检测时必须指定
    #[arg(long)]
    thermal_detections: Option<PathBuf>,

    /// 启动即布防
    #[arg(long)]
    armed: bool,

    /// 启动即开启录像
    #[arg(long)]
    record: bool,

    /// 运行指定秒数后退出 (默认一直运行到 quit)
    #[arg(long)]
    duration: Option<u64>,
}

/// 操作台命令
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Arm,
    Disarm,
    Silence,
    Record(bool),
    Retry,
    Status,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next()?, words.next()) {
            ("arm", None) => Command::Arm,
            ("disarm", None) => Command::Disarm,
            ("silence", None) => Command::Silence,
            ("record", Some("on")) => Command::Record(true),
            ("record", Some("off")) => Command::Record(false),
            ("retry", None) => Command::Retry,
            ("status", None) => Command::Status,
            ("quit" | "exit", None) => Command::Quit,
            _ => return None,
        };
        Some(command)
    }
}

/// 每路的检测器; 启用检测的一路必须有检测脚本, 否则融合永远不会触发
fn detector(
    modality: Modality,
    path: Option<&PathBuf>,
    enabled: bool,
) -> Result<Box<dyn ObjectDetector>> {
    match path {
        Some(path) => {
            let script = ScriptedDetector::load(path)?;
            info!("📦 {} 检测脚本: {}", modality, path.display());
            Ok(Box::new(script))
        }
        None if enabled => {
            let flag = match modality {
                Modality::Optical => "--detections",
                Modality::Thermal => "--thermal-detections",
            };
            bail!("{} 检测已启用, 但没有检测器 (请指定 {} 或在配置中关闭)", modality, flag)
        }
        None => Ok(Box::new(NullDetector)),
    }
}

/// 回放目录或实时RTSP
type SourcePair = (Box<dyn StreamSource>, Box<dyn StreamSource>);

fn sources(args: &Args, camera: &CameraConfig, config: &SentinelConfig) -> Result<SourcePair> {
    if args.optical_dir.is_some() || args.thermal_dir.is_some() {
        let source = |dir: &Option<PathBuf>| -> Box<dyn StreamSource> {
            // 未指定的一路给一个不存在的目录, 检测线程会持续重试
            let dir = dir.clone().unwrap_or_else(|| PathBuf::from("<none>"));
            Box::new(FileSource::new(dir, camera.fps_hint).paced(true))
        };
        return Ok((source(&args.optical_dir), source(&args.thermal_dir)));
    }
    live_sources(camera, config)
}

#[cfg(feature = "rtsp")]
fn live_sources(camera: &CameraConfig, config: &SentinelConfig) -> Result<SourcePair> {
    use sentinel_guard::input::RtspSource;

    let source = |url: String, stream: &str| -> Box<dyn StreamSource> {
        let info = format!("{}:{}/{}", camera.address, camera.rtsp_port, stream);
        Box::new(RtspSource::new(url, info, camera.fps_hint, config.ffmpeg_options.clone()))
    };
    Ok((
        source(camera.optical_url(), &camera.optical_stream),
        source(camera.thermal_url(), &camera.thermal_stream),
    ))
}

#[cfg(not(feature = "rtsp"))]
fn live_sources(camera: &CameraConfig, _config: &SentinelConfig) -> Result<SourcePair> {
    bail!(
        "摄像头 {} 需要实时拉流, 请使用 --features rtsp 编译或指定 --optical-dir/--thermal-dir",
        camera.name
    )
}

fn log_events(camera: String, events: Receiver<SessionEvent>) {
    for event in events {
        match event {
            SessionEvent::StreamOpened {
                camera,
                modality,
                info,
            } => info!(
                "📹 {} {} 已连接: {}x{} @ {:.1}fps",
                camera, modality, info.width, info.height, info.fps
            ),
            SessionEvent::EpisodeStarted { camera, confidence } => {
                warn!("🚨 {} 入侵报警! 置信度 {:.0}%", camera, confidence * 100.0)
            }
            SessionEvent::EpisodeEnded { camera } => info!("✅ {} 报警结束", camera),
            SessionEvent::ClipSaved(clip) => info!(
                "💾 {} {} 录像: {} ({}帧)",
                camera,
                clip.modality,
                clip.path.display(),
                clip.frames
            ),
            SessionEvent::ClipFailed {
                modality,
                path,
                reason,
            } => warn!(
                "❌ {} {} 录像失败 {}: {} (输入 retry 重试)",
                camera,
                modality,
                path.display(),
                reason
            ),
        }
    }
}

fn console() -> Receiver<Command> {
    let (tx, rx) = unbounded();
    let spawned = std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match Command::parse(line) {
                    Some(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    None => warn!("未知命令: {} (arm/disarm/silence/record on|off/retry/status/quit)", line),
                }
            }
        });
    if let Err(e) = spawned {
        warn!("⚠️ 无法启动操作台线程: {}", e);
    }
    rx
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = SentinelConfig::load(&args.config);
    if args.armed {
        config.intruder.armed = true;
    }
    if args.record {
        config.record.enabled = true;
    }
    let labels = LabelTable::coco();
    config
        .validate(&labels)
        .with_context(|| format!("配置无效: {}", args.config.display()))?;
    config.print_summary();

    if config.cameras.is_empty() {
        bail!("配置中没有摄像头");
    }
    let replay = args.optical_dir.is_some() || args.thermal_dir.is_some();
    if replay && config.cameras.len() > 1 {
        bail!("回放模式只支持一个摄像头, 配置中有 {} 个", config.cameras.len());
    }

    // ========== 报警控制器 (所有会话共享) ==========
    let relay: Arc<dyn RelaySink> = Arc::new(config.relay.connect());
    let alarm = Arc::new(AlarmController::new(relay, config.relay.blink_interval()));
    let encoder = config.record.container.encoder_with_fallback();

    // ========== 摄像头会话 (每个摄像头一个) ==========
    let mut sessions = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        match start_session(&args, camera, &config, &labels, &encoder, &alarm) {
            Ok(session) => sessions.push(session),
            Err(e) => {
                // 已启动的会话要先停掉
                for session in &sessions {
                    session.stop();
                }
                alarm.shutdown();
                return Err(e.context(format!("摄像头 {} 启动失败", camera.name)));
            }
        }
    }

    info!(
        "✅ 系统就绪, {} 个摄像头开始监控... (输入 status 查看状态, quit 退出)",
        sessions.len()
    );

    // ========== 主线程: 操作台 ==========
    let mut commands = console();
    let deadline = args
        .duration
        .map(|secs| after(Duration::from_secs(secs)))
        .unwrap_or_else(never);
    loop {
        let next = select! {
            recv(deadline) -> _ => None,
            recv(commands) -> command => Some(command),
        };
        let command = match next {
            None => {
                info!("⏱️ 运行时间到");
                break;
            }
            Some(Ok(command)) => command,
            Some(Err(_)) => {
                // 标准输入已关闭, 继续运行
                commands = never();
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        for session in &sessions {
            apply(&command, session, &alarm);
        }
    }

    for session in &sessions {
        session.stop();
    }
    alarm.shutdown();
    info!("👋 数字卫兵已退出");
    Ok(())
}

fn start_session(
    args: &Args,
    camera: &CameraConfig,
    config: &SentinelConfig,
    labels: &LabelTable,
    encoder: &Arc<dyn ClipEncoder>,
    alarm: &Arc<AlarmController>,
) -> Result<CameraSession> {
    let settings = config.intruder_settings();
    let optical_detector = detector(
        Modality::Optical,
        args.detections.as_ref(),
        settings.optical_enabled,
    )?;
    let thermal_detector = detector(
        Modality::Thermal,
        args.thermal_detections.as_ref(),
        settings.thermal_enabled,
    )?;
    let (optical, thermal) = sources(args, camera, config)?;

    let mut options = SessionOptions::new(
        camera.name.clone(),
        config.record.base_dir.clone(),
        Arc::clone(encoder),
    );
    options.settings = settings;
    options.labels = labels.clone();
    options.frame_stride = config.frame_stride;

    let session = CameraSession::start(
        options,
        (optical, optical_detector),
        (thermal, thermal_detector),
        Arc::clone(alarm),
    )?;

    let events = session.events();
    let name = camera.name.clone();
    std::thread::Builder::new()
        .name(format!("events-{}", camera.name))
        .spawn(move || log_events(name, events))?;
    Ok(session)
}

/// 操作台命令作用于每个会话; 报警控制器共享, 重复的布防/消音不会改变状态
fn apply(command: &Command, session: &CameraSession, alarm: &AlarmController) {
    match command {
        Command::Arm => session.set_armed(true),
        Command::Disarm => session.set_armed(false),
        Command::Silence => session.silence(),
        Command::Record(on) => session.set_record_enabled(*on),
        Command::Retry => info!(
            "🔁 {} 重新写盘 {} 个片段",
            session.camera(),
            session.retry_failed_clips()
        ),
        Command::Status => info!(
            "📊 {} | 报警: {} | 入侵: {} | 置信度 {:.0}% | 录像: {}",
            session.camera(),
            alarm.state(),
            session.is_intruder_active(),
            session.confidence() * 100.0,
            session.settings().record_enabled
        ),
        Command::Quit => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("arm"), Some(Command::Arm));
        assert_eq!(Command::parse("  record on "), Some(Command::Record(true)));
        assert_eq!(Command::parse("record off"), Some(Command::Record(false)));
        assert_eq!(Command::parse("exit"), Some(Command::Quit));
        assert_eq!(Command::parse("record"), None);
        assert_eq!(Command::parse("arm now"), None);
        assert_eq!(Command::parse("dance"), None);
    }

    #[test]
    fn test_enabled_thermal_needs_a_detector() {
        let args = Args::try_parse_from(["sentinel"]).unwrap();
        assert!(args.thermal_detections.is_none());
        let err = detector(Modality::Thermal, args.thermal_detections.as_ref(), true)
            .err()
            .unwrap();
        assert!(err.to_string().contains("--thermal-detections"));
        assert!(detector(Modality::Thermal, None, false).is_ok());

        let script = std::env::temp_dir().join(format!("sentinel-thermal-{}.json", std::process::id()));
        std::fs::write(&script, r#"{"passes": []}"#).unwrap();
        let script_arg = script.display().to_string();
        let args = Args::try_parse_from(["sentinel", "--thermal-detections", script_arg.as_str()]).unwrap();
        assert_eq!(args.thermal_detections.as_ref(), Some(&script));
        assert!(detector(Modality::Thermal, args.thermal_detections.as_ref(), true).is_ok());
        let _ = std::fs::remove_file(&script);
    }

    #[test]
    fn test_every_camera_gets_a_session() {
        let record_dir = std::env::temp_dir().join(format!("sentinel-multi-{}", std::process::id()));
        let mut config = SentinelConfig::default();
        config.intruder.optical_enabled = false;
        config.record.base_dir = record_dir.clone();
        config.cameras = ["gate", "yard"]
            .into_iter()
            .map(|name| CameraConfig {
                name: name.to_string(),
                ..CameraConfig::default()
            })
            .collect();
        let args = Args::try_parse_from([
            "sentinel",
            "--optical-dir",
            "/definitely/not/here",
            "--duration",
            "0",
        ])
        .unwrap();

        let relay = Arc::new(sentinel_guard::alarm::RecordingRelay::default());
        let alarm = Arc::new(AlarmController::new(relay, Duration::from_millis(50)));
        let encoder: Arc<dyn ClipEncoder> = Arc::new(sentinel_guard::recording::GifClipEncoder::default());
        let labels = LabelTable::coco();
        let sessions: Vec<CameraSession> = config
            .cameras
            .iter()
            .map(|camera| start_session(&args, camera, &config, &labels, &encoder, &alarm).unwrap())
            .collect();
        let names: Vec<&str> = sessions.iter().map(|s| s.camera()).collect();
        assert_eq!(names, vec!["gate", "yard"]);

        for session in &sessions {
            apply(&Command::Arm, session, &alarm);
        }
        assert!(alarm.is_armed());
        assert!(sessions.iter().all(|s| s.settings().armed));

        for session in &sessions {
            session.stop();
        }
        alarm.shutdown();
        let _ = std::fs::remove_dir_all(record_dir);
    }
}
