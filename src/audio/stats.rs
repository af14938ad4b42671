//! 切换统计
//!
//! 决策线程写入，展示层（状态行、退出时的报告）读取，全部 lock-free

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::atomic::AtomicCell;

use crate::engine::{Decision, HoldReason};

/// 切换统计收集器
pub struct SwitchStats {
    /// 当前设备采样率（Hz），0 表示未知
    current_rate_hz: AtomicCell<f64>,
    current_bits: AtomicU32,

    evaluations: AtomicU64,
    switches: AtomicU64,
    skipped_writes: AtomicU64,
    unverified_writes: AtomicU64,
    holds_stable: AtomicU64,
    holds_downgrade: AtomicU64,
    holds_jitter: AtomicU64,
    holds_previous_track: AtomicU64,
    defers: AtomicU64,
    suspects: AtomicU64,
    no_candidate: AtomicU64,
    device_errors: AtomicU64,
    hook_failures: AtomicU64,
}

impl SwitchStats {
    pub fn new() -> Self {
        Self {
            current_rate_hz: AtomicCell::new(0.0),
            current_bits: AtomicU32::new(0),
            evaluations: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            skipped_writes: AtomicU64::new(0),
            unverified_writes: AtomicU64::new(0),
            holds_stable: AtomicU64::new(0),
            holds_downgrade: AtomicU64::new(0),
            holds_jitter: AtomicU64::new(0),
            holds_previous_track: AtomicU64::new(0),
            defers: AtomicU64::new(0),
            suspects: AtomicU64::new(0),
            no_candidate: AtomicU64::new(0),
            device_errors: AtomicU64::new(0),
            hook_failures: AtomicU64::new(0),
        }
    }

    /// 记录一次评估结果
    pub fn record_decision(&self, decision: &Decision) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let counter = match decision {
            Decision::Apply(_) => return,
            Decision::Hold(HoldReason::StableBand) => &self.holds_stable,
            Decision::Hold(HoldReason::AwaitingDowngrade) => &self.holds_downgrade,
            Decision::Hold(HoldReason::UpgradeJitter) => &self.holds_jitter,
            Decision::Hold(HoldReason::PreviousTrack) => &self.holds_previous_track,
            Decision::Defer { .. } => &self.defers,
            Decision::SuspectHold(_) => &self.suspects,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 设备已切换到新格式
    pub fn record_switch(&self, rate_hz: f64, bits: Option<u32>) {
        self.switches.fetch_add(1, Ordering::Relaxed);
        self.set_current(rate_hz, bits);
    }

    /// 设备已经是目标格式，跳过写入
    #[inline]
    pub fn record_skipped_write(&self) {
        self.skipped_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// 写入后设备没有读回目标值
    #[inline]
    pub fn record_unverified_write(&self) {
        self.unverified_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_no_candidate(&self) {
        self.no_candidate.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 启动或换设备时读到的当前格式
    pub fn set_current(&self, rate_hz: f64, bits: Option<u32>) {
        self.current_rate_hz.store(rate_hz);
        if let Some(bits) = bits {
            self.current_bits.store(bits, Ordering::Relaxed);
        }
    }

    pub fn current_rate_hz(&self) -> Option<f64> {
        let rate = self.current_rate_hz.load();
        (rate > 0.0).then_some(rate)
    }

    /// 对外展示的当前采样率（kHz，一位小数）
    pub fn current_rate_khz(&self) -> String {
        match self.current_rate_hz() {
            Some(rate) => format!("{:.1}", rate / 1000.0),
            None => "--".to_string(),
        }
    }

    pub fn current_bits(&self) -> Option<u32> {
        match self.current_bits.load(Ordering::Relaxed) {
            0 => None,
            bits => Some(bits),
        }
    }

    #[inline]
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            current_rate_khz: self.current_rate_khz(),
            current_bits: self.current_bits(),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            skipped_writes: self.skipped_writes.load(Ordering::Relaxed),
            unverified_writes: self.unverified_writes.load(Ordering::Relaxed),
            holds_stable: self.holds_stable.load(Ordering::Relaxed),
            holds_downgrade: self.holds_downgrade.load(Ordering::Relaxed),
            holds_jitter: self.holds_jitter.load(Ordering::Relaxed),
            holds_previous_track: self.holds_previous_track.load(Ordering::Relaxed),
            defers: self.defers.load(Ordering::Relaxed),
            suspects: self.suspects.load(Ordering::Relaxed),
            no_candidate: self.no_candidate.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for SwitchStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub current_rate_khz: String,
    pub current_bits: Option<u32>,
    pub evaluations: u64,
    pub switches: u64,
    pub skipped_writes: u64,
    pub unverified_writes: u64,
    pub holds_stable: u64,
    pub holds_downgrade: u64,
    pub holds_jitter: u64,
    pub holds_previous_track: u64,
    pub defers: u64,
    pub suspects: u64,
    pub no_candidate: u64,
    pub device_errors: u64,
    pub hook_failures: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Switch Statistics")?;
        writeln!(f, "=================")?;
        match self.current_bits {
            Some(bits) => writeln!(f, "Current format: {} kHz / {}-bit", self.current_rate_khz, bits)?,
            None => writeln!(f, "Current format: {} kHz", self.current_rate_khz)?,
        }
        writeln!(f, "Evaluations: {}", self.evaluations)?;
        writeln!(f)?;

        writeln!(f, "Switches: {}", self.switches)?;
        writeln!(f, "  Skipped (already set): {}", self.skipped_writes)?;
        writeln!(f, "  Not read back: {}", self.unverified_writes)?;
        writeln!(f, "Holds:")?;
        writeln!(f, "  Stable band: {}", self.holds_stable)?;
        writeln!(f, "  Downgrade pending: {}", self.holds_downgrade)?;
        writeln!(f, "  Upgrade jitter: {}", self.holds_jitter)?;
        writeln!(f, "  Previous track reading: {}", self.holds_previous_track)?;
        writeln!(f, "Deferred downgrades: {}", self.defers)?;
        writeln!(f, "Suspected pre-buffer: {}", self.suspects)?;
        writeln!(f)?;

        writeln!(f, "No candidate: {}", self.no_candidate)?;
        writeln!(f, "Device errors: {}", self.device_errors)?;
        writeln!(f, "Hook failures: {}", self.hook_failures)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectedFormat, Trust};
    use std::time::{Duration, Instant};

    #[test]
    fn test_current_rate_khz() {
        let stats = SwitchStats::new();
        assert_eq!(stats.current_rate_khz(), "--");
        stats.record_switch(44100.0, Some(16));
        assert_eq!(stats.current_rate_khz(), "44.1");
        stats.record_switch(176400.0, None);
        assert_eq!(stats.current_rate_khz(), "176.4");
        assert_eq!(stats.current_bits(), Some(16));
        assert_eq!(stats.switch_count(), 2);
    }

    #[test]
    fn test_record_decision() {
        let stats = SwitchStats::new();
        let c = DetectedFormat::new(44100.0, 16, Instant::now(), Trust::AudioQueue);
        stats.record_decision(&Decision::Apply(c.clone()));
        stats.record_decision(&Decision::Hold(HoldReason::StableBand));
        stats.record_decision(&Decision::Defer {
            candidate: c.clone(),
            delay: Duration::from_millis(1200),
        });
        stats.record_decision(&Decision::SuspectHold(c));
        stats.record_decision(&Decision::Hold(HoldReason::PreviousTrack));

        let report = stats.report();
        assert_eq!(report.evaluations, 5);
        assert_eq!(report.holds_previous_track, 1);
        assert_eq!(report.holds_stable, 1);
        assert_eq!(report.defers, 1);
        assert_eq!(report.suspects, 1);
        assert_eq!(report.switches, 0);
        assert!(report.to_string().contains("Deferred downgrades: 1"));
    }
}
