//! 决策流水线
//!
//! 一次决策 = 取最佳读数 → 引擎评估 → 选格式 → 写设备 → 提交状态。
//! 所有触发（心跳、日志唤醒、换曲、设备变化、定时器）都走到这里，
//! 每次都读取最新状态，不在延迟之间携带旧状态。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::audio::{
    nearest_rate, select_format, AudioDevice, AudioHardware, DeviceError, DeviceSelector,
    HardwareEvent, PhysicalFormat, SelectError, Selection, SwitchStats,
};
use crate::detect::{DetectedFormat, SignalAggregator};
use crate::engine::{Decision, DecisionEngine};
use crate::hook::ScriptHook;

use super::timer::{TimerKind, TimerQueue};

/// 触发这次决策的原因
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cause {
    Heartbeat,
    /// 日志流发布了新读数
    LogStat,
    TrackChanged,
    DeviceChanged,
    Timer(TimerKind),
}

/// 一次成功切换（给展示层）
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchEvent {
    pub rate_hz: f64,
    pub bits: Option<u32>,
    pub device: String,
    pub source: DetectedFormat,
}

/// 一次决策的结果
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// 设备格式已改变
    Switched(SwitchEvent),
    /// 决定切换，但设备已经是目标格式
    AlreadySet,
    /// 保持 / 延后 / 疑似预缓冲
    Unchanged(Decision),
    NoCandidate,
    /// 设备调用失败，本轮放弃
    DeviceUnavailable,
    /// 设备没有合适的格式
    NoSuitableFormat,
    /// 与当前设备无关的通知
    Ignored,
}

/// 写设备错误
#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Select(#[from] SelectError),
}

enum Written {
    /// verified 为 false：写入被接受但没能读回
    Changed {
        rate_hz: f64,
        bits: Option<u32>,
        verified: bool,
    },
    AlreadySet,
}

/// 流水线配置
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// true 写物理格式（采样率 + 位深），false 只写标称采样率
    pub bit_depth_aware: bool,
    pub device: DeviceSelector,
    /// 没有读数 / 设备不可用时的重试间隔
    pub retry_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bit_depth_aware: true,
            device: DeviceSelector::Default,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// 决策流水线（只在决策线程上使用）
pub struct Pipeline {
    config: PipelineConfig,
    engine: DecisionEngine,
    aggregator: SignalAggregator,
    hardware: Box<dyn AudioHardware>,
    device: Option<Box<dyn AudioDevice>>,
    /// 上次写入的物理格式 / 标称采样率（幂等判断）
    last_written: Option<PhysicalFormat>,
    last_nominal: Option<f64>,
    timers: TimerQueue,
    hook: Option<ScriptHook>,
    stats: Arc<SwitchStats>,
    notifier: Option<Sender<SwitchEvent>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        engine: DecisionEngine,
        aggregator: SignalAggregator,
        hardware: Box<dyn AudioHardware>,
        stats: Arc<SwitchStats>,
    ) -> Self {
        Self {
            config,
            engine,
            aggregator,
            hardware,
            device: None,
            last_written: None,
            last_nominal: None,
            timers: TimerQueue::new(),
            hook: None,
            stats,
            notifier: None,
        }
    }

    pub fn with_hook(mut self, hook: Option<ScriptHook>) -> Self {
        self.hook = hook;
        self
    }

    /// 切换成功后向展示层发送事件
    pub fn with_notifier(mut self, notifier: Sender<SwitchEvent>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn stats(&self) -> &Arc<SwitchStats> {
        &self.stats
    }

    /// 打开设备并记录当前格式，失败时第一次决策会重试
    pub fn start(&mut self) -> Result<(), DeviceError> {
        let device = self.hardware.open(&self.config.device)?;
        let rate = device.nominal_rate()?;
        let bits = device.current_physical_format().ok().map(|f| f.bits_per_channel);
        log::info!("Following format on {} (currently {} Hz)", device.name(), rate);
        self.stats.set_current(rate, bits);
        self.device = Some(device);
        Ok(())
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// 执行所有到期的定时器
    pub fn run_due_timers(&mut self, now: Instant) -> Vec<Outcome> {
        self.timers
            .pop_due(now)
            .into_iter()
            .map(|kind| self.handle(Cause::Timer(kind), now))
            .collect()
    }

    /// 决策入口
    pub fn handle(&mut self, cause: Cause, now: Instant) -> Outcome {
        let Some(candidate) = self.aggregator.current_best(now) else {
            return self.no_candidate(cause, now);
        };

        let decision = self.engine.evaluate(&candidate, now);
        self.stats.record_decision(&decision);
        log::debug!("{:?}: {} -> {:?}", cause, candidate, decision);

        match decision {
            Decision::Apply(format) => self.apply(format, cause, now),
            Decision::Defer { delay, .. } => {
                self.timers.reschedule(TimerKind::DowngradeRecheck, now + delay);
                Outcome::Unchanged(decision)
            }
            Decision::Hold(_) | Decision::SuspectHold(_) => Outcome::Unchanged(decision),
        }
    }

    /// 换曲：安排连发复查，交出暂存的预缓冲读数
    pub fn track_changed(&mut self, track_id: Option<&str>, now: Instant) -> Outcome {
        log::info!("Track changed ({})", track_id.unwrap_or("unknown"));
        self.aggregator.invalidate_cache();

        let change = self.engine.on_track_change(now);
        self.timers.cancel(TimerKind::TrackBurst);
        for delay in change.burst {
            self.timers.schedule(TimerKind::TrackBurst, now + delay);
        }

        match change.parked {
            Some(parked) => {
                log::info!("Applying parked pre-buffer reading {}", parked);
                self.apply(parked, Cause::TrackChanged, now)
            }
            None => self.handle(Cause::TrackChanged, now),
        }
    }

    pub fn playback_changed(&mut self, playing: bool) {
        log::debug!("Playback {}", if playing { "started" } else { "stopped" });
        self.engine.note_playback(playing);
    }

    /// 设备列表 / 默认设备变化
    pub fn device_changed(&mut self, event: HardwareEvent, now: Instant) -> Outcome {
        if !self.affects_current_device(event) {
            return Outcome::Ignored;
        }

        log::info!("Output device changed ({:?}), starting over", event);
        self.device = None;
        self.last_written = None;
        self.last_nominal = None;
        self.engine.reset();
        self.timers.cancel(TimerKind::DowngradeRecheck);
        self.timers.cancel(TimerKind::Reconfirm);
        self.timers.cancel(TimerKind::DeviceRetry);

        if let Err(e) = self.start() {
            log::warn!("Cannot open output device: {}", e);
        }
        self.handle(Cause::DeviceChanged, now)
    }

    fn affects_current_device(&self, event: HardwareEvent) -> bool {
        match event {
            HardwareEvent::DefaultDeviceChanged => self.config.device.follows_default(),
            // 只关心当前设备是否消失
            HardwareEvent::DeviceListChanged => match (&self.device, self.hardware.output_devices()) {
                (Some(device), Ok(devices)) => !devices.iter().any(|d| d.id == device.id()),
                _ => true,
            },
        }
    }

    fn no_candidate(&mut self, cause: Cause, now: Instant) -> Outcome {
        self.stats.record_no_candidate();
        if cause == Cause::Timer(TimerKind::CandidateRetry) {
            log::debug!("Still no format reading, waiting for the next trigger");
        } else if self
            .timers
            .schedule_once(TimerKind::CandidateRetry, now + self.config.retry_delay)
        {
            log::debug!("No format reading, retrying in {:?}", self.config.retry_delay);
        }
        Outcome::NoCandidate
    }

    fn apply(&mut self, candidate: DetectedFormat, cause: Cause, now: Instant) -> Outcome {
        let mut device = match self.device.take() {
            Some(device) => device,
            None => match self.hardware.open(&self.config.device) {
                Ok(device) => device,
                Err(e) => return self.device_failed(e, cause, now),
            },
        };

        let result = if self.config.bit_depth_aware {
            write_physical(device.as_mut(), &candidate, &mut self.last_written)
        } else {
            write_nominal(device.as_mut(), candidate.sample_rate_hz(), &mut self.last_nominal)
        };

        let written = match result {
            Ok(written) => written,
            Err(ApplyError::Device(e)) => return self.device_failed(e, cause, now),
            Err(ApplyError::Select(e)) => {
                log::warn!("Cannot switch {} to {}: {}", device.name(), candidate, e);
                self.device = Some(device);
                return Outcome::NoSuitableFormat;
            }
        };

        let device_name = device.name().to_string();
        self.device = Some(device);

        // 写入成功才提交
        self.engine.commit_applied(&candidate, now);
        self.timers.cancel(TimerKind::DowngradeRecheck);
        self.timers.cancel(TimerKind::DeviceRetry);
        self.timers.cancel(TimerKind::CandidateRetry);

        if self.engine.needs_reconfirmation(candidate.sample_rate_hz())
            && cause != Cause::Timer(TimerKind::Reconfirm)
        {
            self.timers
                .schedule_once(TimerKind::Reconfirm, now + self.engine.reconfirm_delay());
        }

        match written {
            Written::AlreadySet => {
                log::debug!("{} already at {}", device_name, candidate);
                self.stats.record_skipped_write();
                Outcome::AlreadySet
            }
            Written::Changed {
                rate_hz,
                bits,
                verified,
            } => {
                log::info!("Switched {} to {} Hz ({})", device_name, rate_hz, candidate);
                if !verified {
                    self.stats.record_unverified_write();
                }
                self.stats.record_switch(rate_hz, bits);
                self.fire_hook(rate_hz);

                let event = SwitchEvent {
                    rate_hz,
                    bits,
                    device: device_name,
                    source: candidate,
                };
                if let Some(notifier) = &self.notifier {
                    let _ = notifier.try_send(event.clone());
                }
                Outcome::Switched(event)
            }
        }
    }

    fn device_failed(&mut self, error: DeviceError, cause: Cause, now: Instant) -> Outcome {
        log::warn!("Output device unavailable: {}", error);
        self.stats.record_device_error();
        // 下次重新打开
        self.device = None;
        self.last_written = None;
        self.last_nominal = None;

        if cause != Cause::Timer(TimerKind::DeviceRetry) {
            self.timers
                .schedule_once(TimerKind::DeviceRetry, now + self.config.retry_delay);
        }
        Outcome::DeviceUnavailable
    }

    fn fire_hook(&self, rate_hz: f64) {
        if let Some(hook) = &self.hook {
            if let Err(e) = hook.fire(rate_hz) {
                log::warn!("{}", e);
                self.stats.record_hook_failure();
            }
        }
    }
}

/// 写物理格式（采样率 + 位深）
fn write_physical(
    device: &mut dyn AudioDevice,
    candidate: &DetectedFormat,
    last_written: &mut Option<PhysicalFormat>,
) -> Result<Written, ApplyError> {
    let rates = device.supported_rates()?;
    let formats = device.physical_formats()?;
    let selection = select_format(
        candidate.sample_rate_hz(),
        candidate.bit_depth(),
        &rates,
        &formats,
    )?;
    if let Selection::RelaxedBits { format, wanted_bits } = &selection {
        log::info!(
            "{} has no {}-bit format at {} Hz, using {}-bit",
            device.name(),
            wanted_bits,
            format.sample_rate,
            format.bits_per_channel
        );
    }
    let target = *selection.format();

    if last_written.is_some_and(|w| w.same_as(&target)) {
        return Ok(Written::AlreadySet);
    }
    // 第一次写入前设备可能已经是目标格式
    if last_written.is_none()
        && device
            .current_physical_format()
            .is_ok_and(|current| current.same_as(&target))
    {
        *last_written = Some(target);
        return Ok(Written::AlreadySet);
    }

    // 读不回时不记住写入值，下次决策会重写
    let verified = match device.set_physical_format(&target) {
        Ok(()) => true,
        Err(DeviceError::Unconfirmed(what)) => {
            log::warn!("{}: {} written as {} but not read back", device.name(), what, target);
            false
        }
        Err(e) => return Err(e.into()),
    };
    *last_written = verified.then_some(target);
    Ok(Written::Changed {
        rate_hz: target.sample_rate,
        bits: Some(target.bits_per_channel),
        verified,
    })
}

/// 只写标称采样率
fn write_nominal(
    device: &mut dyn AudioDevice,
    target_rate_hz: f64,
    last_nominal: &mut Option<f64>,
) -> Result<Written, ApplyError> {
    let rates = device.supported_rates()?;
    let rate = nearest_rate(target_rate_hz, &rates).ok_or(SelectError::NoFormats)?;

    if last_nominal.is_some_and(|last| (last - rate).abs() < 1.0) {
        return Ok(Written::AlreadySet);
    }
    if last_nominal.is_none() && device.nominal_rate().is_ok_and(|current| (current - rate).abs() < 1.0) {
        *last_nominal = Some(rate);
        return Ok(Written::AlreadySet);
    }

    let verified = match device.set_nominal_rate(rate) {
        Ok(()) => true,
        Err(DeviceError::Unconfirmed(what)) => {
            log::warn!("{}: {} written as {} Hz but not read back", device.name(), what, rate);
            false
        }
        Err(e) => return Err(e.into()),
    };
    *last_nominal = verified.then_some(rate);
    Ok(Written::Changed {
        rate_hz: rate,
        bits: None,
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::mock::{MockDevice, MockHardware};
    use crate::detect::{LatestDetection, Trust};
    use crate::engine::{EngineConfig, HoldReason, TrackPolicy};

    struct Harness {
        pipeline: Pipeline,
        latest: Arc<LatestDetection>,
        device: MockDevice,
    }

    fn harness(bit_depth_aware: bool, policy: TrackPolicy) -> Harness {
        let latest = Arc::new(LatestDetection::new());
        let device = MockDevice::usb_dac();
        let aggregator = SignalAggregator::new(Arc::clone(&latest), None, Duration::from_secs(10));
        let engine = DecisionEngine::new(EngineConfig {
            track_policy: policy,
            ..EngineConfig::default()
        });
        let pipeline = Pipeline::new(
            PipelineConfig {
                bit_depth_aware,
                ..PipelineConfig::default()
            },
            engine,
            aggregator,
            Box::new(MockHardware {
                device: device.clone(),
            }),
            Arc::new(SwitchStats::new()),
        );
        Harness {
            pipeline,
            latest,
            device,
        }
    }

    impl Harness {
        fn publish(&self, rate: f64, bits: u32, trust: Trust, at: Instant) {
            self.latest.publish(DetectedFormat::new(rate, bits, at, trust));
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_cold_start_writes_physical_format() {
        let mut h = harness(true, TrackPolicy::Off);
        let t0 = Instant::now();
        h.publish(96000.0, 24, Trust::Decoder, t0);

        let outcome = h.pipeline.handle(Cause::LogStat, t0);
        assert!(matches!(outcome, Outcome::Switched(ref e) if e.rate_hz == 96000.0 && e.bits == Some(24)));

        let writes = h.device.physical_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].bits_per_channel, 24);
        assert_eq!(h.pipeline.stats().current_rate_khz(), "96.0");
        assert_eq!(h.pipeline.engine().state().current_applied_rate_hz, Some(96000.0));
    }

    #[test]
    fn test_idempotent_double_apply() {
        let mut h = harness(true, TrackPolicy::Off);
        let t0 = Instant::now();
        h.publish(88200.0, 24, Trust::Decoder, t0);
        h.pipeline.handle(Cause::LogStat, t0);

        // 设备变化后冷启动再次 Apply 同一格式：不再写入
        h.pipeline.device_changed(HardwareEvent::DefaultDeviceChanged, t0 + ms(100));
        assert_eq!(h.device.physical_writes().len(), 1);
        assert_eq!(h.pipeline.stats().report().skipped_writes, 1);
    }

    #[test]
    fn test_nominal_mode_skips_same_rate() {
        let mut h = harness(false, TrackPolicy::Off);
        let t0 = Instant::now();
        h.publish(44100.0, 16, Trust::Decoder, t0);
        assert!(matches!(h.pipeline.handle(Cause::LogStat, t0), Outcome::Switched(_)));

        h.pipeline.engine.reset();
        assert_eq!(h.pipeline.handle(Cause::Heartbeat, t0 + ms(10)), Outcome::AlreadySet);
        assert_eq!(h.device.nominal_writes(), vec![44100.0]);
        assert!(h.device.physical_writes().is_empty());
    }

    #[test]
    fn test_scenario_a_reconfirm_scheduled_once() {
        let mut h = harness(true, TrackPolicy::Off);
        let t0 = Instant::now();
        h.publish(44100.0, 16, Trust::Decoder, t0);
        h.pipeline.handle(Cause::LogStat, t0);

        let t1 = t0 + Duration::from_secs(5);
        h.publish(48000.0, 24, Trust::PlayerMetadata, t1);
        assert!(matches!(h.pipeline.handle(Cause::LogStat, t1), Outcome::Switched(_)));
        assert!(h.pipeline.timers.is_pending(TimerKind::Reconfirm));
        assert_eq!(h.pipeline.next_deadline(), Some(t1 + ms(1000)));

        // 再确认本身不再安排新的再确认
        let outcomes = h.pipeline.run_due_timers(t1 + ms(1000));
        assert_eq!(outcomes, vec![Outcome::Unchanged(Decision::Hold(HoldReason::StableBand))]);
        assert!(h.pipeline.timers.is_empty());
    }

    #[test]
    fn test_scenario_b_downgrade_through_timer() {
        let mut h = harness(true, TrackPolicy::Off);
        let t0 = Instant::now();
        h.publish(96000.0, 24, Trust::Decoder, t0);
        h.pipeline.handle(Cause::LogStat, t0);

        let t1 = t0 + Duration::from_secs(5);
        h.publish(44100.0, 16, Trust::PlayerMetadata, t1);
        assert!(matches!(
            h.pipeline.handle(Cause::LogStat, t1),
            Outcome::Unchanged(Decision::Defer { .. })
        ));
        assert_eq!(h.pipeline.next_deadline(), Some(t1 + ms(1200)));

        assert_eq!(
            h.pipeline.handle(Cause::Heartbeat, t1 + ms(500)),
            Outcome::Unchanged(Decision::Hold(HoldReason::AwaitingDowngrade))
        );

        let outcomes = h.pipeline.run_due_timers(t1 + ms(1200));
        assert!(matches!(outcomes.as_slice(), [Outcome::Switched(e)] if e.rate_hz == 44100.0));
        assert_eq!(h.device.physical_writes().len(), 2);
    }

    #[test]
    fn test_confirmed_apply_cancels_recheck() {
        let mut h = harness(true, TrackPolicy::Off);
        let t0 = Instant::now();
        h.publish(96000.0, 24, Trust::Decoder, t0);
        h.pipeline.handle(Cause::LogStat, t0);

        let t1 = t0 + Duration::from_secs(5);
        h.publish(44100.0, 16, Trust::AudioQueue, t1);
        h.pipeline.handle(Cause::LogStat, t1);

        // 权威读数先到，复查变成空操作
        h.publish(44100.0, 16, Trust::Decoder, t1 + ms(300));
        assert!(matches!(h.pipeline.handle(Cause::LogStat, t1 + ms(300)), Outcome::Switched(_)));
        assert!(h.pipeline.run_due_timers(t1 + ms(1200)).is_empty());
        assert_eq!(h.device.physical_writes().len(), 2);
    }

    #[test]
    fn test_no_candidate_retries_once() {
        let mut h = harness(true, TrackPolicy::Off);
        let t0 = Instant::now();

        assert_eq!(h.pipeline.handle(Cause::Heartbeat, t0), Outcome::NoCandidate);
        assert_eq!(h.pipeline.next_deadline(), Some(t0 + ms(1000)));

        assert_eq!(h.pipeline.run_due_timers(t0 + ms(1000)), vec![Outcome::NoCandidate]);
        assert!(h.pipeline.next_deadline().is_none());
    }

    #[test]
    fn test_device_unavailable_leaves_state_untouched() {
        let mut h = harness(true, TrackPolicy::Off);
        let t0 = Instant::now();
        h.device.set_unavailable(true);
        h.publish(96000.0, 24, Trust::Decoder, t0);

        assert_eq!(h.pipeline.handle(Cause::LogStat, t0), Outcome::DeviceUnavailable);
        assert_eq!(h.pipeline.engine().state().current_applied_rate_hz, None);
        assert!(h.pipeline.timers.is_pending(TimerKind::DeviceRetry));

        // 重试失败后不再安排
        assert_eq!(
            h.pipeline.run_due_timers(t0 + ms(1000)),
            vec![Outcome::DeviceUnavailable]
        );
        assert!(!h.pipeline.timers.is_pending(TimerKind::DeviceRetry));

        h.device.set_unavailable(false);
        assert!(matches!(h.pipeline.handle(Cause::Heartbeat, t0 + ms(2000)), Outcome::Switched(_)));
    }

    #[test]
    fn test_track_change_burst_and_override() {
        let mut h = harness(true, TrackPolicy::Override);
        let t0 = Instant::now();
        h.publish(96000.0, 24, Trust::Decoder, t0);
        h.pipeline.handle(Cause::LogStat, t0);

        let t1 = t0 + Duration::from_secs(60);
        h.publish(44100.0, 16, Trust::PlayerMetadata, t1);
        let outcome = h.pipeline.track_changed(Some("ABC"), t1);
        assert!(matches!(outcome, Outcome::Switched(ref e) if e.rate_hz == 44100.0));
        assert_eq!(h.pipeline.timers.len(), 4);
        assert_eq!(h.pipeline.next_deadline(), Some(t1 + ms(250)));
    }

    #[test]
    fn test_track_change_waits_for_new_track_reading() {
        let mut h = harness(true, TrackPolicy::Override);
        let t0 = Instant::now();
        h.publish(96000.0, 24, Trust::Decoder, t0);
        h.pipeline.handle(Cause::LogStat, t0);

        // 换曲通知先于新曲目的日志到达
        let t1 = t0 + Duration::from_secs(60);
        h.publish(96000.0, 24, Trust::Decoder, t1 - Duration::from_secs(2));
        assert_eq!(
            h.pipeline.track_changed(Some("B"), t1),
            Outcome::Unchanged(Decision::Hold(HoldReason::PreviousTrack))
        );
        assert!(h.pipeline.engine().state().track_just_changed);
        assert_eq!(
            h.pipeline.run_due_timers(t1 + ms(250)),
            vec![Outcome::Unchanged(Decision::Hold(HoldReason::PreviousTrack))]
        );

        h.publish(44100.0, 16, Trust::PlayerMetadata, t1 + ms(300));
        let outcomes = h.pipeline.run_due_timers(t1 + ms(600));
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], Outcome::Switched(ref e) if e.rate_hz == 44100.0));
        assert_eq!(h.device.physical_writes().len(), 2);

        // 剩余的连发复查回到正常滞回
        assert_eq!(
            h.pipeline.run_due_timers(t1 + ms(2000)),
            vec![
                Outcome::Unchanged(Decision::Hold(HoldReason::StableBand)),
                Outcome::Unchanged(Decision::Hold(HoldReason::StableBand)),
            ]
        );
        assert_eq!(h.pipeline.stats().report().holds_previous_track, 2);
    }

    #[test]
    fn test_pre_buffer_applied_on_track_change() {
        let mut h = harness(true, TrackPolicy::PreBuffer);
        let t0 = Instant::now();
        h.pipeline.playback_changed(true);
        h.publish(44100.0, 16, Trust::Decoder, t0);
        h.pipeline.track_changed(Some("first"), t0);

        let mid = t0 + Duration::from_secs(120);
        h.publish(96000.0, 24, Trust::Decoder, mid);
        assert!(matches!(
            h.pipeline.handle(Cause::LogStat, mid),
            Outcome::Unchanged(Decision::SuspectHold(_))
        ));
        assert_eq!(h.device.physical_writes().len(), 1);

        let next = mid + Duration::from_secs(30);
        assert!(matches!(
            h.pipeline.track_changed(Some("second"), next),
            Outcome::Switched(ref e) if e.rate_hz == 96000.0
        ));
    }

    #[test]
    fn test_write_not_read_back_is_counted() {
        let mut h = harness(true, TrackPolicy::Off);
        h.device.set_unconfirmed(true);
        let t0 = Instant::now();
        h.publish(96000.0, 24, Trust::Decoder, t0);

        // 写入被接受，照常提交，只记一笔
        let outcome = h.pipeline.handle(Cause::LogStat, t0);
        assert!(matches!(outcome, Outcome::Switched(ref e) if e.rate_hz == 96000.0));
        assert_eq!(h.pipeline.engine().state().current_applied_rate_hz, Some(96000.0));
        let report = h.pipeline.stats().report();
        assert_eq!(report.unverified_writes, 1);
        assert_eq!(report.device_errors, 0);
        assert!(h.pipeline.last_written.is_none());

        // 设备恢复后同一格式会再写一次
        h.device.set_unconfirmed(false);
        h.pipeline.engine.reset();
        assert!(matches!(h.pipeline.handle(Cause::Heartbeat, t0 + ms(10)), Outcome::Switched(_)));
        assert_eq!(h.device.physical_writes().len(), 2);
        assert_eq!(h.pipeline.stats().report().unverified_writes, 1);
    }

    #[test]
    fn test_relaxed_bits_selection_is_written() {
        let mut h = harness(true, TrackPolicy::Off);
        {
            let mut state = h.device.state.lock();
            state.formats.retain(|f| !(f.sample_rate == 192000.0 && f.bits_per_channel == 16));
        }
        let t0 = Instant::now();
        h.publish(192000.0, 16, Trust::Decoder, t0);
        let outcome = h.pipeline.handle(Cause::LogStat, t0);
        assert!(matches!(outcome, Outcome::Switched(ref e) if e.bits == Some(24)));
    }

    #[test]
    fn test_notifier_receives_switch() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut h = harness(true, TrackPolicy::Off);
        h.pipeline = h.pipeline.with_notifier(tx);
        let t0 = Instant::now();
        h.publish(176400.0, 24, Trust::Decoder, t0);
        h.pipeline.handle(Cause::LogStat, t0);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.rate_hz, 176400.0);
        assert_eq!(event.device, "Mock DAC");
    }
}
