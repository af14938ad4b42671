//! Rate Follower Library
//!
//! 跟随正在解码的音频格式，切换输出设备的采样率与位深。

pub mod audio;
pub mod config;
pub mod detect;
pub mod engine;
pub mod hook;
pub mod scheduler;
