//! 音频设备模块
//!
//! 包含：
//! - Format: 物理流格式
//! - Selector: 目标格式选择
//! - Device: 设备接口（trait）
//! - CoreAudio: macOS HAL 实现
//! - Stats: 切换统计

#[cfg(target_os = "macos")]
pub mod coreaudio;
pub mod device;
pub mod format;
pub mod selector;
pub mod stats;

#[cfg(target_os = "macos")]
pub use coreaudio::{CoreAudioDevice, CoreAudioHardware};
pub use device::{
    AudioDevice, AudioHardware, DeviceError, DeviceId, DeviceInfo, DeviceSelector, HardwareEvent,
    HardwareListener,
};
pub use format::{PhysicalFormat, StreamDescription};
pub use selector::{nearest_rate, select_format, SelectError, Selection};
pub use stats::{StatsReport, SwitchStats};
