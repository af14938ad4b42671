//! Rate Follower - 输出设备格式跟随
//!
//! 设计目标：
//! - 设备格式始终与正在解码的音频一致
//! - 不因日志抖动或预缓冲反复切换
//! - 只在真正需要时写设备

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};

use rate_follower::audio::DeviceSelector;
use rate_follower::config::Config;
use rate_follower::detect::{parse_line, StreamEndPolicy};
use rate_follower::engine::TrackPolicy;

/// 换曲处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TrackMode {
    Off,
    Override,
    PreBuffer,
}

impl From<TrackMode> for TrackPolicy {
    fn from(mode: TrackMode) -> Self {
        match mode {
            TrackMode::Off => TrackPolicy::Off,
            TrackMode::Override => TrackPolicy::Override,
            TrackMode::PreBuffer => TrackPolicy::PreBuffer,
        }
    }
}

/// 日志流结束后的处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StreamEnd {
    Restart,
    Stop,
}

impl From<StreamEnd> for StreamEndPolicy {
    fn from(end: StreamEnd) -> Self {
        match end {
            StreamEnd::Restart => StreamEndPolicy::Restart,
            StreamEnd::Stop => StreamEndPolicy::Stop,
        }
    }
}

/// Rate Follower - switches the output device to the format being played
#[derive(Parser)]
#[command(name = "rate-follower")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Select output device by name or ID (use 'info' command to list devices)
    #[arg(short, long)]
    device: Option<String>,

    /// Script to run after every rate change (receives the rate in Hz)
    #[arg(short, long, value_name = "PATH")]
    script: Option<PathBuf>,

    /// Player application to query
    #[arg(short, long, default_value = "Music")]
    player: String,

    /// How long a log reading stays trusted, in seconds
    #[arg(long, default_value = "10")]
    freshness_secs: u64,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "2")]
    heartbeat_secs: u64,

    /// Track change handling
    #[arg(long, value_enum, default_value = "override")]
    track_policy: TrackMode,

    /// What to do when the log stream ends
    #[arg(long, value_enum, default_value = "restart")]
    stream_end: StreamEnd,

    /// Only set the nominal sample rate, leave the bit depth alone
    #[arg(long)]
    nominal_only: bool,

    /// Never query the player (no fallback reading, no track change detection)
    #[arg(long)]
    no_player_query: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the playing format (default)
    Run,

    /// Show audio device information
    Info,

    /// Parse log lines from a file (or stdin) and print the detected formats
    Parse {
        /// Log file, stdin if omitted
        file: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Some(Commands::Info) => show_device_info(),
        Some(Commands::Parse { ref file }) => parse_log(file.as_ref()),
        Some(Commands::Run) | None => {
            let config = create_config(&cli);
            config.validate()?;
            follow(config)
        }
    }
}

/// 创建运行配置
fn create_config(cli: &Cli) -> Config {
    let mut config = Config {
        freshness_window: Duration::from_secs(cli.freshness_secs),
        heartbeat: Duration::from_secs(cli.heartbeat_secs),
        bit_depth_aware: !cli.nominal_only,
        device: cli
            .device
            .as_deref()
            .map_or(DeviceSelector::Default, DeviceSelector::parse),
        script: cli.script.clone(),
        player: cli.player.clone(),
        query_player: !cli.no_player_query,
        ..Config::default()
    };
    config.engine.track_policy = cli.track_policy.into();
    config.log_stream.end_policy = cli.stream_end.into();
    config
}

/// 从文件或标准输入读取日志行，打印识别出的格式
fn parse_log(file: Option<&PathBuf>) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = match file {
        Some(path) => Box::new(io::BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(io::BufReader::new(io::stdin())),
    };

    let mut found = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(format) = parse_line(&line, Instant::now()) {
            println!("{:>6}: {}", index + 1, format);
            found += 1;
        }
    }

    println!("\n{} detection(s)", found);
    Ok(())
}

#[cfg(target_os = "macos")]
fn show_device_info() -> anyhow::Result<()> {
    use rate_follower::audio::{AudioHardware, CoreAudioHardware};

    println!("=== Audio Output Devices ===\n");

    let hardware = CoreAudioHardware::new();
    for device in hardware.output_devices()? {
        let default_mark = if device.is_default { " *" } else { "" };
        println!(
            "[{:>3}] {} @ {:.1} kHz{}",
            device.id,
            device.name,
            device.current_sample_rate / 1000.0,
            default_mark
        );

        let rates: Vec<String> = device
            .supported_sample_rates
            .iter()
            .map(|r| format!("{}", r))
            .collect();
        println!("      rates: {}", rates.join(", "));
        for format in &device.physical_formats {
            println!("      {}", format);
        }
    }

    println!();
    println!("* = system default");
    println!("Select device: rate-follower -d <ID|NAME>");

    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn show_device_info() -> anyhow::Result<()> {
    anyhow::bail!(rate_follower::audio::DeviceError::Unsupported)
}

/// 主运行模式：启动日志流、播放器监视和决策线程，直到 Ctrl+C
#[cfg(target_os = "macos")]
fn follow(config: Config) -> anyhow::Result<()> {
    use std::sync::Arc;

    use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};

    use rate_follower::audio::{AudioHardware, CoreAudioHardware, SwitchStats};
    use rate_follower::detect::{
        LatestDetection, LogStream, MusicAppQuery, PlayerQuery, SignalAggregator,
    };
    use rate_follower::engine::DecisionEngine;
    use rate_follower::hook::ScriptHook;
    use rate_follower::scheduler::{Pipeline, PlayerWatch, Scheduler, Trigger};

    let latest = Arc::new(LatestDetection::new());
    let (wake_tx, wake_rx) = bounded(1);
    let (trigger_tx, trigger_rx) = unbounded();
    let (switch_tx, switch_rx) = unbounded();

    // 日志流起不来时只靠播放器查询
    let _log_stream = match LogStream::spawn(config.log_stream.clone(), Arc::clone(&latest), wake_tx)
    {
        Ok(stream) => Some(stream),
        Err(e) => {
            log::warn!("Log stream unavailable, using player queries only: {}", e);
            None
        }
    };

    let player: Option<Arc<dyn PlayerQuery>> = if config.query_player {
        Some(Arc::new(MusicAppQuery::new(config.player.clone())))
    } else {
        None
    };

    let aggregator = SignalAggregator::new(
        Arc::clone(&latest),
        player.clone(),
        config.freshness_window,
    );
    let engine = DecisionEngine::new(config.engine.clone());

    let hardware = CoreAudioHardware::new();
    {
        let trigger_tx = trigger_tx.clone();
        if let Err(e) = hardware.subscribe(Box::new(move |event| {
            let _ = trigger_tx.send(Trigger::from(event));
        })) {
            log::warn!("Device change notifications unavailable: {}", e);
        }
    }

    let hook = config.script.as_ref().map(ScriptHook::new).transpose()?;
    let stats = Arc::new(SwitchStats::new());

    let mut pipeline = Pipeline::new(
        config.pipeline_config(),
        engine,
        aggregator,
        Box::new(hardware),
        Arc::clone(&stats),
    )
    .with_hook(hook)
    .with_notifier(switch_tx);

    if let Err(e) = pipeline.start() {
        // 第一次决策时重新打开
        log::warn!("Output device not ready: {}", e);
    }

    let decision = Scheduler::new(pipeline, trigger_rx, wake_rx, config.heartbeat).spawn()?;

    let _watch = match player {
        Some(player) => Some(PlayerWatch::spawn(
            player,
            config.player_poll,
            trigger_tx.clone(),
        )?),
        None => None,
    };

    {
        let trigger_tx = trigger_tx.clone();
        ctrlc::set_handler(move || {
            let _ = trigger_tx.send(Trigger::Shutdown);
        })?;
    }

    println!("Rate Follower - following {}", config.player);
    println!("Current: {} kHz. Press Ctrl+C to stop.\n", stats.current_rate_khz());

    loop {
        match switch_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let bits = event
                    .bits
                    .map_or_else(String::new, |b| format!(" / {}-bit", b));
                println!(
                    "[{}] {} -> {:.1} kHz{} ({})",
                    chrono::Local::now().format("%H:%M:%S"),
                    event.device,
                    event.rate_hz / 1000.0,
                    bits,
                    event.source.trust()
                );
            }
            Err(RecvTimeoutError::Timeout) if decision.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if decision.join().is_err() {
        anyhow::bail!("decision thread panicked");
    }

    println!("\n{}", stats.report());
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn follow(_config: Config) -> anyhow::Result<()> {
    anyhow::bail!(rate_follower::audio::DeviceError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["rate-follower"]);
        let config = create_config(&cli);
        assert!(config.bit_depth_aware);
        assert_eq!(config.device, DeviceSelector::Default);
        assert_eq!(config.engine.track_policy, TrackPolicy::Override);
        assert_eq!(config.log_stream.end_policy, StreamEndPolicy::Restart);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "rate-follower",
            "-d",
            "73",
            "--track-policy",
            "pre-buffer",
            "--stream-end",
            "stop",
            "--nominal-only",
            "--no-player-query",
            "info",
        ]);
        assert!(matches!(cli.command, Some(Commands::Info)));

        let config = create_config(&cli);
        assert_eq!(config.device, DeviceSelector::Id(73));
        assert_eq!(config.engine.track_policy, TrackPolicy::PreBuffer);
        assert_eq!(config.log_stream.end_policy, StreamEndPolicy::Stop);
        assert!(!config.bit_depth_aware);
        assert!(!config.query_player);
    }
}
