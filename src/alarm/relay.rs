//! 继电器 (警笛/警灯) UDP 控制
//!
//! 命令是单向UDP报文, 设备不回应, 发送失败只记录日志。
//! 支持两种设备协议:
//! - 数字协议: "1{通道}" 打开, "2{通道}" 关闭
//! - 带认证协议: "{login} {password} k{通道}=1|0"

use std::net::UdpSocket;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 继电器设备协议
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RelayProfile {
    #[default]
    Numeric,
    Credentialed { login: String, password: String },
}

/// 继电器输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayOutput {
    Siren,
    Lamp,
}

/// 输出到通道号的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayChannels {
    pub siren: u8,
    pub lamp: u8,
}

impl Default for RelayChannels {
    fn default() -> Self {
        Self { siren: 1, lamp: 2 }
    }
}

impl RelayChannels {
    pub fn channel(&self, output: RelayOutput) -> u8 {
        match output {
            RelayOutput::Siren => self.siren,
            RelayOutput::Lamp => self.lamp,
        }
    }
}

impl RelayProfile {
    /// 生成一条命令报文
    pub fn encode(&self, channel: u8, on: bool) -> String {
        match self {
            RelayProfile::Numeric => format!("{}{}", if on { 1 } else { 2 }, channel),
            RelayProfile::Credentialed { login, password } => {
                format!("{} {} k{}={}", login, password, channel, on as u8)
            }
        }
    }
}

/// 继电器命令出口
pub trait RelaySink: Send + Sync {
    fn set(&self, output: RelayOutput, on: bool);

    /// 全部输出关闭
    fn reset(&self) {
        self.set(RelayOutput::Siren, false);
        self.set(RelayOutput::Lamp, false);
    }
}

/// UDP继电器
pub struct UdpRelay {
    target: String,
    profile: RelayProfile,
    channels: RelayChannels,
    socket: Option<UdpSocket>,
}

impl UdpRelay {
    pub fn new(host: &str, port: u16, profile: RelayProfile, channels: RelayChannels) -> Self {
        let socket = match UdpSocket::bind("0.0.0.0:0") {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("⚠️ 无法创建继电器UDP套接字: {}", e);
                None
            }
        };
        Self {
            target: format!("{}:{}", host, port),
            profile,
            channels,
            socket,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl RelaySink for UdpRelay {
    fn set(&self, output: RelayOutput, on: bool) {
        let command = self.profile.encode(self.channels.channel(output), on);
        let Some(socket) = &self.socket else {
            debug!("继电器套接字不可用, 丢弃命令 {:?}", output);
            return;
        };
        match socket.send_to(command.as_bytes(), &self.target) {
            Ok(_) => debug!("🔔 继电器 {:?} -> {} ({})", output, on, self.target),
            Err(e) => warn!("⚠️ 继电器命令发送失败 {}: {}", self.target, e),
        }
    }
}

/// 记录全部命令, 不发送 (用于测试与演示模式)
#[derive(Debug, Default)]
pub struct RecordingRelay {
    commands: Mutex<Vec<(RelayOutput, bool)>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<(RelayOutput, bool)> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 某个输出最后一次被设置的状态
    pub fn last(&self, output: RelayOutput) -> Option<bool> {
        self.commands()
            .into_iter()
            .rev()
            .find(|(o, _)| *o == output)
            .map(|(_, on)| on)
    }

    pub fn clear(&self) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl RelaySink for RecordingRelay {
    fn set(&self, output: RelayOutput, on: bool) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((output, on));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_commands() {
        let profile = RelayProfile::Numeric;
        assert_eq!(profile.encode(1, true), "11");
        assert_eq!(profile.encode(2, true), "12");
        assert_eq!(profile.encode(1, false), "21");
        assert_eq!(profile.encode(2, false), "22");
    }

    #[test]
    fn test_credentialed_commands() {
        let profile = RelayProfile::Credentialed {
            login: "admin".into(),
            password: "secret".into(),
        };
        assert_eq!(profile.encode(1, true), "admin secret k1=1");
        assert_eq!(profile.encode(2, false), "admin secret k2=0");
    }

    #[test]
    fn test_profile_json() {
        let numeric: RelayProfile = serde_json::from_str(r#"{"kind":"numeric"}"#).unwrap();
        assert_eq!(numeric, RelayProfile::Numeric);
        let cred: RelayProfile =
            serde_json::from_str(r#"{"kind":"credentialed","login":"a","password":"b"}"#).unwrap();
        assert_eq!(cred.encode(2, true), "a b k2=1");
    }

    #[test]
    fn test_udp_relay_sends_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let relay = UdpRelay::new("127.0.0.1", port, RelayProfile::Numeric, RelayChannels::default());
        relay.set(RelayOutput::Lamp, true);

        let mut buf = [0u8; 32];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"12");
    }

    #[test]
    fn test_reset_turns_everything_off() {
        let relay = RecordingRelay::new();
        relay.reset();
        assert_eq!(
            relay.commands(),
            vec![(RelayOutput::Siren, false), (RelayOutput::Lamp, false)]
        );
    }
}
