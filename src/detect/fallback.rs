//! 播放器一次性查询（兜底检测路径）
//!
//! 日志流没有新鲜读数时，通过 osascript 直接询问播放器当前曲目的采样率。
//! 同一查询也给出曲目 ID 和播放状态，用于检测换曲。

use std::process::Command;
use std::time::Instant;

use super::{DetectedFormat, Trust};

/// 小于该值的读数按 kHz 处理
const KHZ_THRESHOLD: f64 = 384.0;

/// 兜底读数没有位深信息时的默认值
const FALLBACK_BIT_DEPTH: u32 = 24;

/// 播放器查询错误
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("player query exited with {status}: {stderr}")]
    Failed { status: i32, stderr: String },
    #[error("unexpected player query output: {0:?}")]
    Malformed(String),
}

/// 播放器状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Playing,
    Paused,
    Stopped,
    NotRunning,
}

impl PlayerState {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "playing" => Self::Playing,
            "paused" => Self::Paused,
            "not running" => Self::NotRunning,
            _ => Self::Stopped,
        }
    }
}

/// 一次播放器查询的结果
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerReading {
    pub state: PlayerState,
    pub track_id: Option<String>,
    /// 已归一化到 Hz
    pub sample_rate_hz: Option<f64>,
}

impl PlayerReading {
    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    /// 包装为可信度 0 的检测结果
    pub fn to_detected(&self, player: &str, observed_at: Instant) -> Option<DetectedFormat> {
        let hz = self.sample_rate_hz?;
        Some(
            DetectedFormat::new(hz, FALLBACK_BIT_DEPTH, observed_at, Trust::PlayerQuery)
                .with_source_tag(player),
        )
    }
}

/// 播放器查询接口
///
/// 由 SignalAggregator（兜底采样率）和播放器监视线程（换曲检测）共享，只读
pub trait PlayerQuery: Send + Sync {
    /// 播放器名称（用于日志与来源标记）
    fn name(&self) -> &str;

    /// 同步查询一次
    fn query(&self) -> Result<PlayerReading, QueryError>;
}

/// 把播放器报告的采样率归一化到 Hz
///
/// 有的播放器以 kHz 报告（如 96 或 44.1），小于 384 的值一律乘以 1000
pub fn normalize_rate_hz(value: f64) -> Option<f64> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    if value < KHZ_THRESHOLD {
        Some((value * 1000.0).round())
    } else {
        Some(value)
    }
}

/// 通过 osascript 查询 Music.app（或同一 AppleScript 字典的播放器）
pub struct MusicAppQuery {
    app: String,
}

impl MusicAppQuery {
    pub fn new(app: impl Into<String>) -> Self {
        Self { app: app.into() }
    }

    fn script(&self) -> String {
        format!(
            r#"if application "{app}" is running then
    tell application "{app}"
        set s to player state as string
        if s is "stopped" then return s & "||"
        try
            return s & "|" & (persistent ID of current track) & "|" & (sample rate of current track)
        on error
            return s & "||"
        end try
    end tell
end if
return "not running||""#,
            app = self.app
        )
    }
}

impl PlayerQuery for MusicAppQuery {
    fn name(&self) -> &str {
        &self.app
    }

    fn query(&self) -> Result<PlayerReading, QueryError> {
        let output = Command::new("/usr/bin/osascript")
            .arg("-e")
            .arg(self.script())
            .output()
            .map_err(|source| QueryError::Spawn {
                program: "osascript",
                source,
            })?;

        if !output.status.success() {
            return Err(QueryError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_reading(&String::from_utf8_lossy(&output.stdout))
    }
}

/// 解析 "state|track id|sample rate"
fn parse_reading(output: &str) -> Result<PlayerReading, QueryError> {
    let mut fields = output.trim().splitn(3, '|');
    let (Some(state), Some(track), Some(rate)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(QueryError::Malformed(output.to_string()));
    };

    let track = track.trim();
    let sample_rate_hz = rate
        .trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .and_then(normalize_rate_hz);

    Ok(PlayerReading {
        state: PlayerState::parse(state),
        track_id: (!track.is_empty()).then(|| track.to_string()),
        sample_rate_hz,
    })
}
