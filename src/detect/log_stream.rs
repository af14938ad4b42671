//! 系统日志流读取线程
//!
//! 启动 `log stream` 子进程，逐行解析，只把最新的一条读数写入
//! LatestDetection（覆盖语义），再用容量为 1 的通道唤醒决策线程。

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

use super::aggregator::LatestDetection;
use super::parser::parse_line;

/// 默认谓词：只要播放器进程和 CoreAudio 子系统里含格式信息的消息
pub const DEFAULT_PREDICATE: &str = concat!(
    r#"(process == "Music" OR subsystem == "com.apple.coreaudio" OR subsystem == "com.apple.Music") "#,
    r#"AND (eventMessage CONTAINS "Input format" OR eventMessage CONTAINS "audioCapabilities" "#,
    r#"OR eventMessage CONTAINS "AudioQueue creation")"#
);

/// 子进程退出（读到 EOF）后的处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StreamEndPolicy {
    /// 退避后重启，连续失败达到上限后停止
    #[default]
    Restart,
    /// 第一次 EOF 即停止，之后只依赖播放器查询
    Stop,
}

/// 日志流错误
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("log stream has no stdout")]
    NoStdout,
    #[error("failed to start log stream thread: {0}")]
    Thread(std::io::Error),
}

/// 日志流配置
#[derive(Clone, Debug)]
pub struct LogStreamConfig {
    pub program: PathBuf,
    pub predicate: String,
    pub level: String,
    pub end_policy: StreamEndPolicy,
    /// 重启前等待
    pub restart_backoff: Duration,
    /// 连续多少次没有读到任何数据就放弃
    pub max_consecutive_failures: u32,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/bin/log"),
            predicate: DEFAULT_PREDICATE.to_string(),
            level: "debug".to_string(),
            end_policy: StreamEndPolicy::Restart,
            restart_backoff: Duration::from_secs(2),
            max_consecutive_failures: 5,
        }
    }
}

impl LogStreamConfig {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("stream")
            .arg("--style")
            .arg("compact")
            .arg("--level")
            .arg(&self.level)
            .arg("--predicate")
            .arg(&self.predicate)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    fn spawn_child(&self) -> Result<Child, StreamError> {
        self.command().spawn().map_err(|source| StreamError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }
}

/// 日志流生产者
pub struct LogStream {
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    thread: Option<JoinHandle<()>>,
}

impl LogStream {
    /// 启动读取线程
    ///
    /// 第一次启动子进程失败直接返回错误，调用方可降级为只用播放器查询
    pub fn spawn(
        config: LogStreamConfig,
        latest: Arc<LatestDetection>,
        wake: Sender<()>,
    ) -> Result<Self, StreamError> {
        let mut first = config.spawn_child()?;
        let stdout = first.stdout.take().ok_or(StreamError::NoStdout)?;

        let running = Arc::new(AtomicBool::new(true));
        let child = Arc::new(Mutex::new(Some(first)));

        let spawned = {
            let running = Arc::clone(&running);
            let child = Arc::clone(&child);
            thread::Builder::new()
                .name("log-stream".to_string())
                .spawn(move || stream_main(config, stdout, latest, wake, running, child))
        };
        let thread = reap_on_error(&child, spawned)?;

        log::info!("Log stream started");

        Ok(Self {
            running,
            child,
            thread: Some(thread),
        })
    }

    /// 停止：杀掉子进程让阻塞的读取返回，再 join
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.kill();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stream_main(
    config: LogStreamConfig,
    first_stdout: impl Read,
    latest: Arc<LatestDetection>,
    wake: Sender<()>,
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
) {
    let mut failures = 0u32;
    let mut lines = pump(first_stdout, &latest, &wake, &running);
    reap(&child);

    loop {
        if lines > 0 {
            failures = 0;
        } else {
            failures += 1;
        }

        if !running.load(Ordering::Acquire) {
            break;
        }

        match config.end_policy {
            StreamEndPolicy::Stop => {
                log::warn!("Log stream ended, continuing with player queries only");
                break;
            }
            StreamEndPolicy::Restart if failures >= config.max_consecutive_failures => {
                log::warn!(
                    "Log stream failed {} times in a row, giving up (player queries only)",
                    failures
                );
                break;
            }
            StreamEndPolicy::Restart => {
                log::info!("Log stream ended, restarting in {:?}", config.restart_backoff);
            }
        }

        if !sleep_while_running(config.restart_backoff, &running) {
            break;
        }

        lines = match config.spawn_child() {
            Ok(mut next) => match next.stdout.take() {
                Some(stdout) => {
                    *child.lock() = Some(next);
                    // stop() 可能在 spawn 与写入槽之间发生
                    if !running.load(Ordering::Acquire) {
                        reap(&child);
                        break;
                    }
                    let n = pump(stdout, &latest, &wake, &running);
                    reap(&child);
                    n
                }
                None => {
                    let _ = next.kill();
                    let _ = next.wait();
                    0
                }
            },
            Err(e) => {
                log::warn!("{}", e);
                0
            }
        };
    }

    running.store(false, Ordering::Release);
    log::info!("Log stream thread finished");
}

/// 读到 EOF 为止，返回读到的行数
fn pump(
    stdout: impl Read,
    latest: &LatestDetection,
    wake: &Sender<()>,
    running: &AtomicBool,
) -> u64 {
    let reader = BufReader::new(stdout);
    let mut count = 0u64;

    for chunk in reader.split(b'\n') {
        let Ok(bytes) = chunk else { break };
        if !running.load(Ordering::Acquire) {
            break;
        }
        count += 1;

        let line = String::from_utf8_lossy(&bytes);
        log::trace!("log: {}", line);

        let Some(format) = parse_line(&line, Instant::now()) else {
            continue;
        };
        log::debug!("Detected {}", format);

        if latest.publish(format) {
            // 满了说明决策线程还没处理上一次唤醒，它会读到最新值
            if let Err(TrySendError::Disconnected(_)) = wake.try_send(()) {
                break;
            }
        }
    }

    count
}

/// 读取线程没起来时子进程不能留下
fn reap_on_error<T>(
    child: &Mutex<Option<Child>>,
    spawned: std::io::Result<T>,
) -> Result<T, StreamError> {
    spawned.map_err(|e| {
        reap(child);
        StreamError::Thread(e)
    })
}

fn reap(child: &Mutex<Option<Child>>) {
    if let Some(mut c) = child.lock().take() {
        let _ = c.kill();
        let _ = c.wait();
    }
}

/// 分段睡眠，期间被停止则返回 false
fn sleep_while_running(total: Duration, running: &AtomicBool) -> bool {
    const STEP: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        thread::sleep(STEP.min(deadline.saturating_duration_since(Instant::now())));
    }
    running.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    const SAMPLE: &str = "\
2024-05-01 10:00:00.000 Df Music[812:1a2b] ACAppleLosslessDecoder.cpp Input format: 2 ch, 96000 Hz, from 24-bit source
2024-05-01 10:00:00.100 Df Music[812:1a2b] unrelated chatter
2024-05-01 10:00:01.000 Df Music[812:1a2b] audioCapabilities asbdSampleRate = 96.0 kHz, sdBitDepth = 24 bit
";

    #[test]
    fn test_pump_publishes_latest_only() {
        let latest = LatestDetection::new();
        let (tx, rx) = bounded(1);
        let running = AtomicBool::new(true);

        let lines = pump(SAMPLE.as_bytes(), &latest, &tx, &running);
        assert_eq!(lines, 3);

        // 后一条读数同一采样率、在 tie 窗口内但可信度更低：保留解码器读数
        let current = latest.latest().unwrap();
        assert_eq!(current.sample_rate_hz(), 96000.0);
        assert_eq!(latest.published_count(), 1);

        // 唤醒被合并成一次
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pump_stops_when_not_running() {
        let latest = LatestDetection::new();
        let (tx, _rx) = bounded(1);
        let running = AtomicBool::new(false);

        assert_eq!(pump(SAMPLE.as_bytes(), &latest, &tx, &running), 0);
        assert!(latest.latest().is_none());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let config = LogStreamConfig {
            program: PathBuf::from("/nonexistent/log"),
            ..LogStreamConfig::default()
        };
        let (tx, _rx) = bounded(1);
        let result = LogStream::spawn(config, Arc::new(LatestDetection::new()), tx);
        assert!(matches!(result, Err(StreamError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_thread_spawn_failure_kills_child() {
        let sleeper = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = sleeper.id().to_string();
        let child = Mutex::new(Some(sleeper));

        let spawned: std::io::Result<()> = Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads"));
        assert!(matches!(reap_on_error(&child, spawned), Err(StreamError::Thread(_))));
        assert!(child.lock().is_none());

        // 已被回收，kill -0 找不到进程
        let alive = Command::new("kill").arg("-0").arg(&pid).status().unwrap();
        assert!(!alive.success());
    }

    #[test]
    fn test_sleep_interrupted() {
        let running = AtomicBool::new(false);
        assert!(!sleep_while_running(Duration::from_secs(5), &running));
    }
}
