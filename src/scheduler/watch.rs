//! 播放器监视线程
//!
//! 每秒查询一次播放器，把曲目 ID 和播放状态的变化转成 Trigger

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::detect::{PlayerQuery, PlayerReading};

use super::Trigger;

/// 只在变化时产生触发
#[derive(Debug, Default)]
pub struct TrackTracker {
    track_id: Option<String>,
    playing: Option<bool>,
}

impl TrackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第一次观察只建立基线，不算换曲
    pub fn observe(&mut self, reading: &PlayerReading) -> Vec<Trigger> {
        let mut triggers = Vec::new();

        let playing = reading.is_playing();
        if self.playing != Some(playing) {
            self.playing = Some(playing);
            triggers.push(Trigger::Playback { playing });
        }

        if let Some(track) = &reading.track_id {
            if self.track_id.as_ref() != Some(track) {
                let first = self.track_id.is_none();
                self.track_id = Some(track.clone());
                if !first {
                    triggers.push(Trigger::TrackChanged {
                        track_id: Some(track.clone()),
                    });
                }
            }
        }

        triggers
    }
}

/// 播放器监视线程
pub struct PlayerWatch {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlayerWatch {
    pub fn spawn(
        player: Arc<dyn PlayerQuery>,
        interval: Duration,
        triggers: Sender<Trigger>,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("player-watch".to_string())
                .spawn(move || watch_main(player, interval, triggers, running))?
        };
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PlayerWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_main(
    player: Arc<dyn PlayerQuery>,
    interval: Duration,
    triggers: Sender<Trigger>,
    running: Arc<AtomicBool>,
) {
    const STEP: Duration = Duration::from_millis(100);

    let mut tracker = TrackTracker::new();
    let mut failing = false;

    while running.load(Ordering::Acquire) {
        match player.query() {
            Ok(reading) => {
                failing = false;
                for trigger in tracker.observe(&reading) {
                    if triggers.send(trigger).is_err() {
                        return;
                    }
                }
            }
            // 只在开始失败时警告一次
            Err(e) if !failing => {
                log::warn!("{} query failed: {}", player.name(), e);
                failing = true;
            }
            Err(e) => log::debug!("{} query failed: {}", player.name(), e),
        }

        let deadline = Instant::now() + interval;
        while running.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(STEP.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{PlayerState, QueryError};
    use parking_lot::Mutex;

    fn reading(state: PlayerState, track: Option<&str>) -> PlayerReading {
        PlayerReading {
            state,
            track_id: track.map(str::to_string),
            sample_rate_hz: None,
        }
    }

    #[test]
    fn test_first_observation_is_baseline() {
        let mut tracker = TrackTracker::new();
        let triggers = tracker.observe(&reading(PlayerState::Playing, Some("A")));
        assert_eq!(triggers, vec![Trigger::Playback { playing: true }]);
    }

    #[test]
    fn test_track_change_detected() {
        let mut tracker = TrackTracker::new();
        tracker.observe(&reading(PlayerState::Playing, Some("A")));
        assert!(tracker.observe(&reading(PlayerState::Playing, Some("A"))).is_empty());

        let triggers = tracker.observe(&reading(PlayerState::Playing, Some("B")));
        assert_eq!(
            triggers,
            vec![Trigger::TrackChanged {
                track_id: Some("B".to_string())
            }]
        );
    }

    #[test]
    fn test_stop_keeps_last_track() {
        let mut tracker = TrackTracker::new();
        tracker.observe(&reading(PlayerState::Playing, Some("A")));
        let triggers = tracker.observe(&reading(PlayerState::Stopped, None));
        assert_eq!(triggers, vec![Trigger::Playback { playing: false }]);

        // 同一首继续播放不算换曲
        let triggers = tracker.observe(&reading(PlayerState::Playing, Some("A")));
        assert_eq!(triggers, vec![Trigger::Playback { playing: true }]);
    }

    struct Scripted {
        readings: Mutex<Vec<PlayerReading>>,
    }

    impl PlayerQuery for Scripted {
        fn name(&self) -> &str {
            "Scripted"
        }

        fn query(&self) -> Result<PlayerReading, QueryError> {
            let mut readings = self.readings.lock();
            if readings.len() > 1 {
                Ok(readings.remove(0))
            } else {
                readings
                    .first()
                    .cloned()
                    .ok_or_else(|| QueryError::Malformed(String::new()))
            }
        }
    }

    #[test]
    fn test_watch_thread_sends_triggers() {
        let player = Arc::new(Scripted {
            readings: Mutex::new(vec![
                reading(PlayerState::Playing, Some("A")),
                reading(PlayerState::Playing, Some("B")),
            ]),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watch = PlayerWatch::spawn(player, Duration::from_millis(10), tx).unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), Trigger::Playback { playing: true });
        assert_eq!(
            rx.recv_timeout(timeout).unwrap(),
            Trigger::TrackChanged {
                track_id: Some("B".to_string())
            }
        );
        watch.stop();
    }
}
