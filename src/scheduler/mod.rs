//! 决策调度
//!
//! 所有触发汇入同一个决策线程，串行执行：
//! - 外部触发（换曲、播放状态、设备变化）走 Trigger 通道
//! - 日志流的新读数走容量为 1 的唤醒通道
//! - 心跳定时器
//! - TimerQueue 中最早到期的定时器

pub mod pipeline;
pub mod timer;
pub mod watch;

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, tick, Receiver};

use crate::audio::HardwareEvent;

pub use pipeline::{Cause, Outcome, Pipeline, PipelineConfig, SwitchEvent};
pub use timer::{TimerKind, TimerQueue};
pub use watch::{PlayerWatch, TrackTracker};

/// 没有定时器时的最长等待
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// 发给决策线程的外部触发
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    TrackChanged { track_id: Option<String> },
    Playback { playing: bool },
    DeviceListChanged,
    DefaultDeviceChanged,
    Shutdown,
}

impl From<HardwareEvent> for Trigger {
    fn from(event: HardwareEvent) -> Self {
        match event {
            HardwareEvent::DeviceListChanged => Self::DeviceListChanged,
            HardwareEvent::DefaultDeviceChanged => Self::DefaultDeviceChanged,
        }
    }
}

/// 决策线程主循环
pub struct Scheduler {
    pipeline: Pipeline,
    triggers: Receiver<Trigger>,
    wake: Receiver<()>,
    heartbeat: Duration,
}

impl Scheduler {
    pub fn new(
        pipeline: Pipeline,
        triggers: Receiver<Trigger>,
        wake: Receiver<()>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            pipeline,
            triggers,
            wake,
            heartbeat,
        }
    }

    /// 在名为 "decision" 的线程上运行，收到 Shutdown 或触发通道关闭后返回 Pipeline
    pub fn spawn(self) -> std::io::Result<JoinHandle<Pipeline>> {
        thread::Builder::new()
            .name("decision".to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> Pipeline {
        let heartbeat = tick(self.heartbeat);
        let triggers = self.triggers.clone();
        let mut wake = self.wake.clone();
        self.pipeline.handle(Cause::Heartbeat, Instant::now());

        loop {
            let timeout = self
                .pipeline
                .next_deadline()
                .map_or(IDLE_WAIT, |deadline| {
                    deadline.saturating_duration_since(Instant::now())
                });
            let mut wake_closed = false;
            let mut shutdown = false;

            select! {
                recv(triggers) -> msg => match msg {
                    Ok(Trigger::Shutdown) | Err(_) => shutdown = true,
                    Ok(trigger) => self.dispatch(trigger),
                },
                recv(wake) -> msg => match msg {
                    Ok(()) => {
                        self.pipeline.handle(Cause::LogStat, Instant::now());
                    }
                    Err(_) => wake_closed = true,
                },
                recv(heartbeat) -> _ => {
                    self.pipeline.handle(Cause::Heartbeat, Instant::now());
                },
                default(timeout) => {}
            }

            if shutdown {
                break;
            }
            if wake_closed {
                log::debug!("Log stream wake-up channel closed");
                wake = never();
            }
            self.pipeline.run_due_timers(Instant::now());
        }

        log::info!("Decision thread finished");
        self.pipeline
    }

    fn dispatch(&mut self, trigger: Trigger) {
        let now = Instant::now();
        match trigger {
            Trigger::TrackChanged { track_id } => {
                self.pipeline.track_changed(track_id.as_deref(), now);
            }
            Trigger::Playback { playing } => self.pipeline.playback_changed(playing),
            Trigger::DeviceListChanged => {
                self.pipeline.device_changed(HardwareEvent::DeviceListChanged, now);
            }
            Trigger::DefaultDeviceChanged => {
                self.pipeline.device_changed(HardwareEvent::DefaultDeviceChanged, now);
            }
            Trigger::Shutdown => {}
        }
    }
}
