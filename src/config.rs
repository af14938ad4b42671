//! 运行配置
//!
//! 由命令行参数构造，启动时校验一次

use std::path::PathBuf;
use std::time::Duration;

use crate::audio::DeviceSelector;
use crate::detect::LogStreamConfig;
use crate::engine::EngineConfig;
use crate::scheduler::PipelineConfig;

/// 配置错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("{name} must be positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        min: f64,
        value: f64,
    },
    #[error("player name is empty")]
    EmptyPlayer,
    #[error("hook script {} does not exist", .0.display())]
    ScriptNotFound(PathBuf),
}

/// 运行配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 日志流读数多久内算新鲜
    pub freshness_window: Duration,
    /// 心跳间隔
    pub heartbeat: Duration,
    /// 播放器轮询间隔（换曲检测）
    pub player_poll: Duration,
    /// 没有读数 / 设备不可用时的重试间隔
    pub retry_delay: Duration,
    /// true 写物理格式，false 只写标称采样率
    pub bit_depth_aware: bool,
    pub device: DeviceSelector,
    /// 采样率变化后执行的脚本
    pub script: Option<PathBuf>,
    /// 播放器应用名
    pub player: String,
    /// 是否查询播放器（兜底读数和换曲检测）
    pub query_player: bool,
    pub log_stream: LogStreamConfig,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(10),
            heartbeat: Duration::from_secs(2),
            player_poll: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            bit_depth_aware: true,
            device: DeviceSelector::Default,
            script: None,
            player: "Music".to_string(),
            query_player: true,
            log_stream: LogStreamConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("freshness window", self.freshness_window),
            ("heartbeat", self.heartbeat),
            ("player poll interval", self.player_poll),
            ("retry delay", self.retry_delay),
            ("downgrade recheck", self.engine.downgrade_recheck),
            ("reconfirm delay", self.engine.reconfirm_delay),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroInterval(name));
        }

        let thresholds = [
            ("stability band", self.engine.stability_band_hz),
            ("downgrade match tolerance", self.engine.downgrade_match_hz),
            ("pre-buffer threshold", self.engine.pre_buffer_threshold_hz),
        ];
        for (name, value) in thresholds {
            // NaN 也会被拒绝
            if !(value > 0.0) {
                return Err(ConfigError::NotPositive { name, value });
            }
        }

        if !(self.engine.upgrade_ratio >= 1.0) {
            return Err(ConfigError::TooSmall {
                name: "upgrade ratio",
                min: 1.0,
                value: self.engine.upgrade_ratio,
            });
        }

        if self.query_player && self.player.trim().is_empty() {
            return Err(ConfigError::EmptyPlayer);
        }

        if let Some(script) = &self.script {
            if !script.is_file() {
                return Err(ConfigError::ScriptNotFound(script.clone()));
            }
        }

        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            bit_depth_aware: self.bit_depth_aware,
            device: self.device.clone(),
            retry_delay: self.retry_delay,
        }
    }
}
