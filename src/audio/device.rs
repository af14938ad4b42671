//! 输出设备接口
//!
//! 决策逻辑只通过这两个 trait 访问硬件，macOS 上由 CoreAudio 实现，
//! 测试中由内存 mock 实现。

use super::format::PhysicalFormat;

pub type DeviceId = u32;

/// 设备错误
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no default audio output device")]
    NoDefaultDevice,
    #[error("output device {0:?} not found")]
    NotFound(String),
    #[error("failed to get {property}: OSStatus {status}")]
    GetProperty { property: &'static str, status: i32 },
    #[error("failed to set {property}: OSStatus {status}")]
    SetProperty { property: &'static str, status: i32 },
    #[error("device has no output stream")]
    NoOutputStream,
    #[error("device reported no {0}")]
    Empty(&'static str),
    /// 写入被接受，但重读时设备没有报告目标值
    #[error("{0} did not read back the written value")]
    Unconfirmed(&'static str),
    #[error("audio device control is not supported on this platform")]
    Unsupported,
}

/// 设备信息（info 命令和日志用）
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub supported_sample_rates: Vec<f64>,
    pub current_sample_rate: f64,
    pub physical_formats: Vec<PhysicalFormat>,
    pub is_default: bool,
}

/// 用户指定的输出设备
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// 跟随系统默认输出设备
    #[default]
    Default,
    Id(DeviceId),
    /// 名称，先精确匹配再部分匹配（不区分大小写）
    Name(String),
}

impl DeviceSelector {
    /// 纯数字按设备 ID 处理
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("default") {
            return Self::Default;
        }
        match s.parse::<DeviceId>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Name(s.to_string()),
        }
    }

    pub fn follows_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

/// 按名称查找：先精确匹配，再部分匹配
pub fn find_by_name<'a>(devices: &'a [DeviceInfo], name: &str) -> Option<&'a DeviceInfo> {
    let name_lower = name.to_lowercase();
    devices
        .iter()
        .find(|d| d.name.to_lowercase() == name_lower)
        .or_else(|| devices.iter().find(|d| d.name.to_lowercase().contains(&name_lower)))
}

/// 一个已打开的输出设备
///
/// 所有调用都是同步的，只在决策线程上进行
pub trait AudioDevice: Send {
    fn id(&self) -> DeviceId;

    fn name(&self) -> &str;

    /// 当前标称采样率
    fn nominal_rate(&self) -> Result<f64, DeviceError>;

    /// 支持的标称采样率（升序）
    fn supported_rates(&self) -> Result<Vec<f64>, DeviceError>;

    /// 输出流可用的物理格式
    fn physical_formats(&self) -> Result<Vec<PhysicalFormat>, DeviceError>;

    fn current_physical_format(&self) -> Result<PhysicalFormat, DeviceError>;

    /// 写入物理格式（必须是 physical_formats 中的一项）
    fn set_physical_format(&mut self, format: &PhysicalFormat) -> Result<(), DeviceError>;

    /// 只写标称采样率
    fn set_nominal_rate(&mut self, rate_hz: f64) -> Result<(), DeviceError>;
}

/// 硬件变化通知
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwareEvent {
    DeviceListChanged,
    DefaultDeviceChanged,
}

pub type HardwareListener = Box<dyn Fn(HardwareEvent) + Send + Sync>;

/// 音频硬件（设备枚举与打开）
pub trait AudioHardware: Send {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError>;

    fn open(&self, selector: &DeviceSelector) -> Result<Box<dyn AudioDevice>, DeviceError>;

    /// 订阅设备列表 / 默认设备变化，回调在系统通知线程上执行
    fn subscribe(&self, _listener: HardwareListener) -> Result<(), DeviceError> {
        Ok(())
    }
}
