//! 报警控制器 - 警笛/警灯状态机
//!
//! 状态转换全部在同一把锁内完成, 继电器命令不会交错。
//! 控制器由调用方创建并以 `Arc` 共享给需要它的摄像头会话。

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, info, warn};

use super::relay::{RelayOutput, RelaySink};

/// 默认警灯闪烁间隔
pub const DEFAULT_BLINK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmState {
    Disarmed,
    Armed,
    Active,
    Silenced,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Disarmed => "disarmed",
            AlarmState::Armed => "armed",
            AlarmState::Active => "active",
            AlarmState::Silenced => "silenced",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次实际发生的状态转换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AlarmState,
    pub to: AlarmState,
}

/// 警灯闪烁线程
struct Blinker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Blinker {
    fn spawn(relay: Arc<dyn RelaySink>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("alarm-blink".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                let mut lamp_on = true;
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            lamp_on = !lamp_on;
                            relay.set(RelayOutput::Lamp, lamp_on);
                        }
                    }
                }
                debug!("警灯闪烁线程退出");
            })?;
        Ok(Self { stop_tx, handle })
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("⚠️ 警灯闪烁线程异常退出");
        }
    }
}

struct Inner {
    state: AlarmState,
    blinker: Option<Blinker>,
}

/// 报警控制器
pub struct AlarmController {
    relay: Arc<dyn RelaySink>,
    blink_interval: Duration,
    inner: Mutex<Inner>,
}

impl AlarmController {
    /// 创建控制器 (初始 Disarmed), 同时复位全部继电器输出
    pub fn new(relay: Arc<dyn RelaySink>, blink_interval: Duration) -> Self {
        relay.reset();
        Self {
            relay,
            blink_interval,
            inner: Mutex::new(Inner {
                state: AlarmState::Disarmed,
                blinker: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> AlarmState {
        self.lock().state
    }

    pub fn is_armed(&self) -> bool {
        self.state() != AlarmState::Disarmed
    }

    pub fn blink_interval(&self) -> Duration {
        self.blink_interval
    }

    fn transition(inner: &mut Inner, to: AlarmState) -> Transition {
        let from = inner.state;
        inner.state = to;
        info!("🚨 报警状态: {} -> {}", from, to);
        Transition { from, to }
    }

    /// Disarmed/Silenced → Armed, 点亮布防指示灯
    pub fn arm(&self) -> Option<Transition> {
        let mut inner = self.lock();
        match inner.state {
            AlarmState::Disarmed | AlarmState::Silenced => {
                self.relay.set(RelayOutput::Lamp, true);
                Some(Self::transition(&mut inner, AlarmState::Armed))
            }
            AlarmState::Armed | AlarmState::Active => None,
        }
    }

    /// 任意状态 → Disarmed, 关闭全部输出
    pub fn disarm(&self) -> Option<Transition> {
        let mut inner = self.lock();
        if inner.state == AlarmState::Disarmed {
            return None;
        }
        if let Some(blinker) = inner.blinker.take() {
            blinker.stop();
        }
        self.relay.reset();
        Some(Self::transition(&mut inner, AlarmState::Disarmed))
    }

    /// 只允许 Armed → Active: 打开警笛并开始闪烁警灯
    pub fn trigger_alarm(&self) -> Option<Transition> {
        let mut inner = self.lock();
        if inner.state != AlarmState::Armed {
            return None;
        }
        self.relay.set(RelayOutput::Siren, true);
        match Blinker::spawn(Arc::clone(&self.relay), self.blink_interval) {
            Ok(blinker) => inner.blinker = Some(blinker),
            Err(e) => warn!("⚠️ 无法启动警灯闪烁线程: {}", e),
        }
        Some(Self::transition(&mut inner, AlarmState::Active))
    }

    /// 只允许 Active → Silenced: 关闭警笛和警灯
    pub fn silence(&self) -> Option<Transition> {
        let mut inner = self.lock();
        if inner.state != AlarmState::Active {
            return None;
        }
        if let Some(blinker) = inner.blinker.take() {
            blinker.stop();
        }
        self.relay.set(RelayOutput::Siren, false);
        self.relay.set(RelayOutput::Lamp, false);
        Some(Self::transition(&mut inner, AlarmState::Silenced))
    }

    /// 停止闪烁并复位继电器, 状态回到 Disarmed
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if let Some(blinker) = inner.blinker.take() {
            blinker.stop();
        }
        self.relay.reset();
        inner.state = AlarmState::Disarmed;
    }
}

impl Drop for AlarmController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::relay::RecordingRelay;
    use std::time::Instant;

    fn controller() -> (Arc<RecordingRelay>, AlarmController) {
        let relay = Arc::new(RecordingRelay::new());
        let controller = AlarmController::new(relay.clone(), Duration::from_millis(10));
        relay.clear();
        (relay, controller)
    }

    #[test]
    fn test_new_controller_resets_relay() {
        let relay = Arc::new(RecordingRelay::new());
        let controller = AlarmController::new(relay.clone(), DEFAULT_BLINK_INTERVAL);
        assert_eq!(controller.state(), AlarmState::Disarmed);
        assert_eq!(relay.last(RelayOutput::Siren), Some(false));
        assert_eq!(relay.last(RelayOutput::Lamp), Some(false));
    }

    #[test]
    fn test_trigger_only_from_armed() {
        for start in [AlarmState::Disarmed, AlarmState::Active, AlarmState::Silenced] {
            let (_relay, c) = controller();
            match start {
                AlarmState::Disarmed => {}
                AlarmState::Active => {
                    c.arm();
                    c.trigger_alarm();
                }
                AlarmState::Silenced => {
                    c.arm();
                    c.trigger_alarm();
                    c.silence();
                }
                AlarmState::Armed => unreachable!(),
            }
            assert_eq!(c.state(), start);
            assert!(c.trigger_alarm().is_none());
            assert_eq!(c.state(), start);
        }

        let (relay, c) = controller();
        c.arm();
        let t = c.trigger_alarm().unwrap();
        assert_eq!(t, Transition { from: AlarmState::Armed, to: AlarmState::Active });
        assert_eq!(relay.last(RelayOutput::Siren), Some(true));
    }

    #[test]
    fn test_silence_only_from_active() {
        let (relay, c) = controller();
        assert!(c.silence().is_none());
        c.arm();
        assert!(c.silence().is_none());
        assert_eq!(c.state(), AlarmState::Armed);

        c.trigger_alarm();
        let t = c.silence().unwrap();
        assert_eq!(t.to, AlarmState::Silenced);
        assert_eq!(relay.last(RelayOutput::Siren), Some(false));
        assert_eq!(relay.last(RelayOutput::Lamp), Some(false));
        assert!(c.silence().is_none());
    }

    #[test]
    fn test_arm_and_disarm() {
        let (relay, c) = controller();
        assert!(c.disarm().is_none());
        assert_eq!(c.arm().unwrap().to, AlarmState::Armed);
        assert_eq!(relay.last(RelayOutput::Lamp), Some(true));
        assert!(c.arm().is_none());

        c.trigger_alarm();
        assert!(c.arm().is_none());
        assert_eq!(c.disarm().unwrap().from, AlarmState::Active);
        assert_eq!(relay.last(RelayOutput::Siren), Some(false));
        assert_eq!(relay.last(RelayOutput::Lamp), Some(false));
    }

    #[test]
    fn test_rearm_after_silence() {
        let (_relay, c) = controller();
        c.arm();
        c.trigger_alarm();
        c.silence();
        assert_eq!(c.arm().unwrap(), Transition { from: AlarmState::Silenced, to: AlarmState::Armed });
        assert!(c.trigger_alarm().is_some());
    }

    #[test]
    fn test_lamp_blinks_while_active() {
        let (relay, c) = controller();
        c.arm();
        c.trigger_alarm();

        let deadline = Instant::now() + Duration::from_secs(2);
        let lamp_toggles = || {
            relay
                .commands()
                .iter()
                .filter(|(o, _)| *o == RelayOutput::Lamp)
                .count()
        };
        while lamp_toggles() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(lamp_toggles() >= 4);

        c.silence();
        let after_silence = relay.commands().len();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(relay.commands().len(), after_silence);
    }
}
