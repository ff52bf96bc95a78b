//! 应用配置和持久化
//!
//! 协议参数（包体大小、帧间隔）、心跳/重连参数和扫描条件，
//! 存放在 `~/.config/lensbridge/settings.toml`。

use crate::link::{
    DiscoveryFilter, LivenessConfig, UART_NOTIFY_CHAR_UUID, UART_SERVICE_UUID,
    UART_WRITE_CHAR_UUID,
};
use crate::protocol::{DEFAULT_BITMAP_BODY_SIZE, DEFAULT_TEXT_BODY_SIZE};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// 配置校验错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// 分包与节流
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// 文本帧包体最大字节数
    pub text_body_size: usize,
    /// 位图帧包体字节数
    pub bitmap_body_size: usize,
    /// 帧间隔，眼镜处理速度有限，不能省略
    pub frame_delay_ms: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            text_body_size: DEFAULT_TEXT_BODY_SIZE,
            bitmap_body_size: DEFAULT_BITMAP_BODY_SIZE,
            frame_delay_ms: 50,
        }
    }
}

impl ProtocolSettings {
    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms)
    }
}

/// 心跳与重连
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    pub heartbeat_interval_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        let defaults = LivenessConfig::default();
        Self {
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_backoff_ms: defaults.reconnect_backoff.as_millis() as u64,
        }
    }
}

/// 扫描条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// 设备名前缀
    pub name_prefix: String,
    pub scan_timeout_secs: u64,
    pub service_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            name_prefix: "Even".to_string(),
            scan_timeout_secs: 10,
            service_uuid: UART_SERVICE_UUID,
            write_char_uuid: UART_WRITE_CHAR_UUID,
            notify_char_uuid: UART_NOTIFY_CHAR_UUID,
        }
    }
}

/// 应用设置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub protocol: ProtocolSettings,
    pub liveness: LivenessSettings,
    pub discovery: DiscoverySettings,
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lensbridge");
        config_dir.join("settings.toml")
    }

    /// 加载设置（文件不存在或无效时使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match Self::load_from(&path) {
                Ok(settings) => return settings,
                Err(e) => {
                    log::warn!("Failed to load settings: {:#}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 从指定文件加载并校验
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.text_body_size == 0 {
            return Err(ConfigError::Zero("protocol.text_body_size"));
        }
        if self.protocol.bitmap_body_size == 0 {
            return Err(ConfigError::Zero("protocol.bitmap_body_size"));
        }
        if self.liveness.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero("liveness.heartbeat_interval_ms"));
        }
        if self.liveness.reconnect_attempts == 0 {
            return Err(ConfigError::Zero("liveness.reconnect_attempts"));
        }
        Ok(())
    }

    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            heartbeat_interval: Duration::from_millis(self.liveness.heartbeat_interval_ms),
            max_reconnect_attempts: self.liveness.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.liveness.reconnect_backoff_ms),
        }
    }

    pub fn discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter {
            name_prefix: self.discovery.name_prefix.clone(),
            service: self.discovery.service_uuid,
            write_char: self.discovery.write_char_uuid,
            notify_char: self.discovery.notify_char_uuid,
            exclude: Vec::new(),
            timeout: Duration::from_secs(self.discovery.scan_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.protocol.text_body_size, 20);
        assert_eq!(settings.protocol.bitmap_body_size, 194);
        assert_eq!(settings.protocol.frame_delay(), Duration::from_millis(50));
        assert_eq!(settings.liveness_config(), LivenessConfig::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: AppSettings = toml::from_str(
            r#"
            [protocol]
            frame_delay_ms = 80

            [liveness]
            reconnect_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.protocol.frame_delay_ms, 80);
        assert_eq!(settings.protocol.text_body_size, 20);
        assert_eq!(settings.liveness.reconnect_attempts, 5);
        assert_eq!(settings.discovery.name_prefix, "Even");
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut settings = AppSettings::default();
        settings.protocol.text_body_size = 0;
        assert_eq!(
            settings.validate(),
            Err(ConfigError::Zero("protocol.text_body_size"))
        );

        let mut settings = AppSettings::default();
        settings.liveness.reconnect_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = AppSettings::default();
        let text = settings.to_toml().unwrap();
        let parsed: AppSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_discovery_filter() {
        let filter = AppSettings::default().discovery_filter();
        assert_eq!(filter.service, UART_SERVICE_UUID);
        assert_eq!(filter.timeout, Duration::from_secs(10));
        assert!(filter.exclude.is_empty());
    }
}
