//! 用户脚本钩子
//!
//! 每次设备采样率真正改变后执行一次用户脚本，参数是新采样率（Hz，取整）。
//! 不等待脚本结束，失败只记录日志。

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

/// 钩子错误
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook script {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("failed to run hook script {}: {source}", .path.display())]
    Spawn { path: PathBuf, source: io::Error },
    #[error("failed to start hook reaper thread: {0}")]
    Thread(io::Error),
}

/// 采样率变化时执行的外部脚本
#[derive(Clone, Debug)]
pub struct ScriptHook {
    path: PathBuf,
}

impl ScriptHook {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, HookError> {
        let path = path.into();
        if !path.is_file() {
            return Err(HookError::NotFound(path));
        }
        Ok(Self { path })
    }

    /// 脚本参数：整数 Hz
    pub fn argument(rate_hz: f64) -> String {
        (rate_hz.max(0.0).trunc() as u64).to_string()
    }

    /// 启动脚本，由后台线程回收子进程
    pub fn fire(&self, rate_hz: f64) -> Result<(), HookError> {
        let arg = Self::argument(rate_hz);
        let mut child = Command::new(&self.path)
            .arg(&arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| HookError::Spawn {
                path: self.path.clone(),
                source,
            })?;

        log::debug!("Hook {} started with {}", self.path.display(), arg);

        let path = self.path.clone();
        thread::Builder::new()
            .name("hook-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => log::warn!("Hook {} exited with {}", path.display(), status),
                Err(e) => log::warn!("Failed to wait for hook {}: {}", path.display(), e),
            })
            .map_err(HookError::Thread)?;

        Ok(())
    }
}
