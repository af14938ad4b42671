//! 多来源信号融合
//!
//! 日志流（推送，单槽覆盖）+ 播放器查询（按需，带短时缓存），
//! 按“新鲜度优先、可信度其次”选出当前唯一的最佳读数。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::fallback::{PlayerQuery, PlayerReading};
use super::DetectedFormat;

/// 两条读数在此时间内视为“同时”，由可信度决定去留
const TIE_WINDOW: Duration = Duration::from_millis(250);

/// 只有采样率相同（与默认稳定带一致）的同时读数才按可信度取舍，
/// 采样率不同时新读数总是覆盖
const TIE_RATE_TOLERANCE_HZ: f64 = 1000.0;

/// 播放器查询结果缓存时长（避免连发复查时反复启动 osascript）
pub const DEFAULT_FALLBACK_CACHE_TTL: Duration = Duration::from_millis(1500);

#[inline]
fn is_fresh(format: &DetectedFormat, window: Duration, now: Instant) -> bool {
    now.saturating_duration_since(format.observed_at()) < window
}

/// 选择当前最佳读数（纯函数）
///
/// 新鲜的日志流读数无论可信度都排在兜底读数之前；
/// 日志流过期时用兜底读数；两者都没有则返回 None，由调用方安排重试
pub fn best_candidate(
    streamed: Option<&DetectedFormat>,
    fallback: Option<&DetectedFormat>,
    freshness_window: Duration,
    now: Instant,
) -> Option<DetectedFormat> {
    match streamed {
        Some(s) if is_fresh(s, freshness_window, now) => Some(s.clone()),
        _ => fallback.cloned(),
    }
}

/// 日志流最新读数（单槽，覆盖语义，无队列）
///
/// 生产线程写入，决策线程读取；跨线程只传递不可变的 DetectedFormat
#[derive(Default)]
pub struct LatestDetection {
    slot: Mutex<Option<DetectedFormat>>,
    published: AtomicU64,
}

impl LatestDetection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布新读数，返回是否替换了槽中的值
    ///
    /// 与现有读数几乎同时到达、采样率相同且可信度更低时保留现有读数
    pub fn publish(&self, format: DetectedFormat) -> bool {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.as_ref() {
            let gap = format.observed_at().saturating_duration_since(current.observed_at());
            if gap < TIE_WINDOW
                && format.trust() < current.trust()
                && format.same_rate(current.sample_rate_hz(), TIE_RATE_TOLERANCE_HZ)
            {
                log::trace!("Keeping {} over near-simultaneous {}", current, format);
                return false;
            }
        }
        *slot = Some(format);
        self.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// 当前读数的副本
    pub fn latest(&self) -> Option<DetectedFormat> {
        self.slot.lock().clone()
    }

    /// 累计发布次数
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// 播放器查询缓存
struct CachedReading {
    queried_at: Instant,
    reading: Option<PlayerReading>,
}

/// 信号聚合器
pub struct SignalAggregator {
    latest: Arc<LatestDetection>,
    player: Option<Arc<dyn PlayerQuery>>,
    freshness_window: Duration,
    cache_ttl: Duration,
    cache: Option<CachedReading>,
}

impl SignalAggregator {
    pub fn new(
        latest: Arc<LatestDetection>,
        player: Option<Arc<dyn PlayerQuery>>,
        freshness_window: Duration,
    ) -> Self {
        Self {
            latest,
            player,
            freshness_window,
            cache_ttl: DEFAULT_FALLBACK_CACHE_TTL,
            cache: None,
        }
    }

    /// 当前最佳读数
    ///
    /// 只有日志流读数过期时才查询播放器
    pub fn current_best(&mut self, now: Instant) -> Option<DetectedFormat> {
        let streamed = self.latest.latest();
        if let Some(s) = &streamed {
            if is_fresh(s, self.freshness_window, now) {
                return Some(s.clone());
            }
        }

        let fallback = self.fallback(now);
        best_candidate(streamed.as_ref(), fallback.as_ref(), self.freshness_window, now)
    }

    /// 换曲后缓存的播放器读数描述的是上一首
    pub fn invalidate_cache(&mut self) {
        self.cache = None;
    }

    fn fallback(&mut self, now: Instant) -> Option<DetectedFormat> {
        let player = self.player.as_ref()?;

        let expired = self
            .cache
            .as_ref()
            .map_or(true, |c| now.saturating_duration_since(c.queried_at) >= self.cache_ttl);

        if expired {
            let reading = match player.query() {
                Ok(reading) => Some(reading),
                Err(e) => {
                    log::warn!("Player query failed: {}", e);
                    None
                }
            };
            self.cache = Some(CachedReading {
                queried_at: now,
                reading,
            });
        }

        let cache = self.cache.as_ref()?;
        cache
            .reading
            .as_ref()?
            .to_detected(player.name(), cache.queried_at)
    }
}
