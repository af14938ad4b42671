//! 切换决策引擎
//!
//! 带滞回的状态机：给定一条候选读数，决定 立即切换 / 保持 / 延后复查 / 疑似预缓冲。
//! 核心设计：
//! - 升频宽松（比值 ≥ 1.05 即切换），降频严格（低可信度读数需持续 1s 以上）
//! - 两段式提交：evaluate 只给出建议，设备写入成功后 commit_applied 才改状态
//! - 所有状态只由决策线程修改，定时器复查时总是读取最新状态

use std::time::{Duration, Instant};

use crate::detect::DetectedFormat;

/// 换曲相关启发式（不同部署方案的差异统一到一个开关）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TrackPolicy {
    /// 不做换曲特殊处理
    Off,
    /// 换曲后下一条读数跳过滞回直接应用，并安排一串快速复查
    #[default]
    Override,
    /// 播放中途的变化视为下一首的预缓冲，等下一次换曲再应用
    PreBuffer,
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 差值小于此值视为同一格式
    pub stability_band_hz: f64,
    /// 升频比值低于此值视为抖动
    pub upgrade_ratio: f64,
    /// 待确认降频与新读数的匹配容差
    pub downgrade_match_hz: f64,
    /// 低可信度降频需要持续的时间
    pub downgrade_confirm: Duration,
    /// 记录待确认降频后多久复查
    pub downgrade_recheck: Duration,
    /// 距上次真正切换多久后清理换曲标记
    pub change_grace: Duration,
    pub track_policy: TrackPolicy,
    /// 换曲后的复查时间点（相对换曲时刻）
    pub track_burst: Vec<Duration>,
    /// 预缓冲判定的最小差值
    pub pre_buffer_threshold_hz: f64,
    /// 换曲后这段时间内的变化属于当前曲目
    pub pre_buffer_grace: Duration,
    /// 软硬件默认采样率，落在这里的切换需要再确认一次
    pub reconfirm_rate_hz: f64,
    pub reconfirm_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stability_band_hz: 1000.0,
            upgrade_ratio: 1.05,
            downgrade_match_hz: 1.0,
            downgrade_confirm: Duration::from_millis(1000),
            downgrade_recheck: Duration::from_millis(1200),
            change_grace: Duration::from_secs(3),
            track_policy: TrackPolicy::Override,
            track_burst: vec![
                Duration::from_millis(250),
                Duration::from_millis(600),
                Duration::from_millis(1200),
                Duration::from_millis(2000),
            ],
            pre_buffer_threshold_hz: 100.0,
            pre_buffer_grace: Duration::from_millis(2500),
            reconfirm_rate_hz: 48000.0,
            reconfirm_delay: Duration::from_secs(1),
        }
    }
}

/// 保持原因
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HoldReason {
    /// 与当前格式差值在稳定带内
    StableBand,
    /// 降频待确认，尚未持续足够久
    AwaitingDowngrade,
    /// 升频幅度太小
    UpgradeJitter,
    /// 刚换曲，但读数早于换曲时刻（描述的是上一首）
    PreviousTrack,
}

/// 一次评估的结论
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// 切换到该格式（设备写入成功后调用 commit_applied）
    Apply(DetectedFormat),
    Hold(HoldReason),
    /// 已记录待确认降频，`delay` 后复查
    Defer {
        candidate: DetectedFormat,
        delay: Duration,
    },
    /// 疑似下一首的预缓冲读数，已暂存
    SuspectHold(DetectedFormat),
}

/// 换曲通知的处理结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackChange {
    /// 需要安排的复查（相对当前时刻）
    pub burst: Vec<Duration>,
    /// 之前暂存的预缓冲读数，现在可以应用
    pub parked: Option<DetectedFormat>,
}

/// 引擎状态
///
/// 只由 DecisionEngine 在决策线程内修改
#[derive(Clone, Debug, Default)]
pub struct EngineState {
    pub current_applied_rate_hz: Option<f64>,
    pub last_change_at: Option<Instant>,
    /// (读数, 首次出现时刻)
    pub pending_downgrade: Option<(DetectedFormat, Instant)>,
    pub pending_pre_buffer: Option<DetectedFormat>,
    pub last_track_change_at: Option<Instant>,
    pub track_just_changed: bool,
    pub track_playing: bool,
}

/// 切换决策引擎
pub struct DecisionEngine {
    config: EngineConfig,
    state: EngineState,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: EngineState::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// 评估一条候选读数
    pub fn evaluate(&mut self, candidate: &DetectedFormat, now: Instant) -> Decision {
        let rate = candidate.sample_rate_hz();

        // 冷启动：第一条读数总是应用
        let prev = match self.state.current_applied_rate_hz {
            Some(prev) if prev > 0.0 => prev,
            _ => return Decision::Apply(candidate.clone()),
        };

        self.expire_track_flag(now);

        if self.state.track_just_changed && self.config.track_policy == TrackPolicy::Override {
            // 换曲标记留给下一首的第一条读数
            if self.observed_before_track_change(candidate) {
                log::debug!("{} predates the track change, waiting for a new reading", candidate);
                return Decision::Hold(HoldReason::PreviousTrack);
            }
            log::debug!("Track just changed, applying {} without hysteresis", candidate);
            return Decision::Apply(candidate.clone());
        }

        if (prev - rate).abs() < self.config.stability_band_hz {
            self.state.pending_downgrade = None;
            if self.state.track_just_changed && self.since_last_change(now) >= self.config.change_grace {
                self.state.track_just_changed = false;
            }
            return Decision::Hold(HoldReason::StableBand);
        }

        if self.looks_like_pre_buffer(prev, rate, now) {
            log::debug!("{} looks like pre-buffering of the next track, parking it", candidate);
            self.state.pending_pre_buffer = Some(candidate.clone());
            return Decision::SuspectHold(candidate.clone());
        }

        if rate < prev {
            return self.evaluate_downgrade(candidate, now);
        }

        if rate / prev < self.config.upgrade_ratio {
            return Decision::Hold(HoldReason::UpgradeJitter);
        }

        Decision::Apply(candidate.clone())
    }

    /// 降频：权威读数立即确认，其余需要同一读数持续超过确认时间
    fn evaluate_downgrade(&mut self, candidate: &DetectedFormat, now: Instant) -> Decision {
        if candidate.trust().is_authoritative() {
            return Decision::Apply(candidate.clone());
        }

        let rate = candidate.sample_rate_hz();
        let first_seen = self
            .state
            .pending_downgrade
            .as_ref()
            .filter(|(pending, _)| pending.same_rate(rate, self.config.downgrade_match_hz))
            .map(|(_, first_seen)| *first_seen);

        match first_seen {
            Some(first) if now.saturating_duration_since(first) > self.config.downgrade_confirm => {
                Decision::Apply(candidate.clone())
            }
            Some(_) => Decision::Hold(HoldReason::AwaitingDowngrade),
            None => {
                log::debug!("Downgrade to {} pending confirmation", candidate);
                self.state.pending_downgrade = Some((candidate.clone(), now));
                Decision::Defer {
                    candidate: candidate.clone(),
                    delay: self.config.downgrade_recheck,
                }
            }
        }
    }

    fn looks_like_pre_buffer(&self, prev: f64, rate: f64, now: Instant) -> bool {
        if self.config.track_policy != TrackPolicy::PreBuffer || !self.state.track_playing {
            return false;
        }
        if (rate - prev).abs() <= self.config.pre_buffer_threshold_hz {
            return false;
        }
        // 从未见过换曲时无法判断归属
        self.state
            .last_track_change_at
            .is_some_and(|t| now.saturating_duration_since(t) > self.config.pre_buffer_grace)
    }

    fn observed_before_track_change(&self, candidate: &DetectedFormat) -> bool {
        self.state
            .last_track_change_at
            .is_some_and(|t| candidate.observed_at() < t)
    }

    fn since_last_change(&self, now: Instant) -> Duration {
        self.state
            .last_change_at
            .map_or(Duration::MAX, |t| now.saturating_duration_since(t))
    }

    /// 换曲标记超过宽限期仍未被消费则作废
    fn expire_track_flag(&mut self, now: Instant) {
        let stale = self
            .state
            .last_track_change_at
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.change_grace);
        if self.state.track_just_changed && stale {
            self.state.track_just_changed = false;
        }
    }

    /// 设备写入成功后提交
    pub fn commit_applied(&mut self, format: &DetectedFormat, now: Instant) {
        self.state.current_applied_rate_hz = Some(format.sample_rate_hz());
        self.state.last_change_at = Some(now);
        self.state.pending_downgrade = None;
        self.state.pending_pre_buffer = None;
        self.state.track_just_changed = false;
    }

    /// 落在默认采样率上的切换需要再确认一次
    pub fn needs_reconfirmation(&self, rate_hz: f64) -> bool {
        (rate_hz - self.config.reconfirm_rate_hz).abs() < 0.5
    }

    pub fn reconfirm_delay(&self) -> Duration {
        self.config.reconfirm_delay
    }

    /// 换曲通知
    pub fn on_track_change(&mut self, now: Instant) -> TrackChange {
        self.state.last_track_change_at = Some(now);
        self.state.track_just_changed = true;
        // 上一首的降频证据不再适用
        self.state.pending_downgrade = None;

        match self.config.track_policy {
            TrackPolicy::Off => TrackChange::default(),
            TrackPolicy::Override => TrackChange {
                burst: self.config.track_burst.clone(),
                parked: None,
            },
            TrackPolicy::PreBuffer => TrackChange {
                burst: Vec::new(),
                parked: self.state.pending_pre_buffer.clone(),
            },
        }
    }

    pub fn note_playback(&mut self, playing: bool) {
        self.state.track_playing = playing;
    }

    /// 输出设备变化：下一条读数按冷启动处理
    pub fn reset(&mut self) {
        self.state.current_applied_rate_hz = None;
        self.state.last_change_at = None;
        self.state.pending_downgrade = None;
        self.state.pending_pre_buffer = None;
    }
}
