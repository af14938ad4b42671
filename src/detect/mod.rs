//! 格式检测模块
//!
//! 包含：
//! - DetectedFormat: 归一化的检测结果（采样率、位深、可信度）
//! - Parser: 日志行 → DetectedFormat
//! - Aggregator: 多来源融合（日志流 + 播放器查询 + 缓存）
//! - Fallback: 播放器一次性查询
//! - LogStream: 持续读取系统日志的后台线程

pub mod aggregator;
pub mod fallback;
pub mod log_stream;
pub mod parser;

use std::fmt;
use std::time::Instant;

pub use aggregator::{best_candidate, LatestDetection, SignalAggregator};
pub use fallback::{
    normalize_rate_hz, MusicAppQuery, PlayerQuery, PlayerReading, PlayerState, QueryError,
};
pub use log_stream::{LogStream, LogStreamConfig, StreamEndPolicy, StreamError};
pub use parser::parse_line;

/// 检测来源的可信度
///
/// 数值越大越权威，同时刻的两条读数以可信度高者为准
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trust {
    /// 播放器一次性查询（兜底路径）
    PlayerQuery,
    /// 播放器高层元数据日志（audioCapabilities）
    PlayerMetadata,
    /// AudioQueue 创建日志
    AudioQueue,
    /// 解码器日志（Input format）
    Decoder,
}

impl Trust {
    /// 数值等级：5 / 2 / 1 / 0
    pub fn level(self) -> u8 {
        match self {
            Self::Decoder => 5,
            Self::AudioQueue => 2,
            Self::PlayerMetadata => 1,
            Self::PlayerQuery => 0,
        }
    }

    /// 权威来源：可以立即确认降频
    #[inline]
    pub fn is_authoritative(self) -> bool {
        self.level() >= 5
    }
}

impl fmt::Display for Trust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decoder => "decoder",
            Self::AudioQueue => "audio-queue",
            Self::PlayerMetadata => "player-metadata",
            Self::PlayerQuery => "player-query",
        };
        write!(f, "{}({})", name, self.level())
    }
}

/// 一条归一化的格式检测结果
///
/// 构造后不可变，只会被更新的读数取代
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedFormat {
    sample_rate_hz: f64,
    bit_depth: u32,
    observed_at: Instant,
    trust: Trust,
    source_tag: Option<String>,
}

impl DetectedFormat {
    /// 创建检测结果，采样率单位必须是 Hz
    pub fn new(sample_rate_hz: f64, bit_depth: u32, observed_at: Instant, trust: Trust) -> Self {
        Self {
            sample_rate_hz: sample_rate_hz.max(0.0),
            bit_depth,
            observed_at,
            trust,
            source_tag: None,
        }
    }

    /// 附加来源进程名（仅用于日志）
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = Some(tag.into());
        self
    }

    #[inline]
    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    #[inline]
    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    #[inline]
    pub fn observed_at(&self) -> Instant {
        self.observed_at
    }

    #[inline]
    pub fn trust(&self) -> Trust {
        self.trust
    }

    pub fn source_tag(&self) -> Option<&str> {
        self.source_tag.as_deref()
    }

    /// 采样率是否在 `tolerance_hz` 内相同
    pub fn same_rate(&self, other_hz: f64, tolerance_hz: f64) -> bool {
        (self.sample_rate_hz - other_hz).abs() <= tolerance_hz
    }
}

impl fmt::Display for DetectedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} kHz / {}-bit [{}]",
            self.sample_rate_hz / 1000.0,
            self.bit_depth,
            self.trust
        )?;
        if let Some(tag) = &self.source_tag {
            write!(f, " from {}", tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_order_matches_levels() {
        let mut levels = vec![
            Trust::Decoder,
            Trust::PlayerQuery,
            Trust::AudioQueue,
            Trust::PlayerMetadata,
        ];
        levels.sort();
        let numeric: Vec<u8> = levels.iter().map(|t| t.level()).collect();
        assert_eq!(numeric, vec![0, 1, 2, 5]);
        assert!(Trust::Decoder.is_authoritative());
        assert!(!Trust::AudioQueue.is_authoritative());
    }

    #[test]
    fn test_negative_rate_is_clamped() {
        let format = DetectedFormat::new(-1.0, 16, Instant::now(), Trust::PlayerQuery);
        assert_eq!(format.sample_rate_hz(), 0.0);
    }

    #[test]
    fn test_display() {
        let format = DetectedFormat::new(44100.0, 16, Instant::now(), Trust::PlayerMetadata)
            .with_source_tag("Music");
        assert_eq!(format.to_string(), "44.1 kHz / 16-bit [player-metadata(1)] from Music");
    }
}
