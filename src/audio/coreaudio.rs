//! Core Audio HAL 设备控制
//!
//! 直接通过 AudioObject 属性读写输出设备：
//! - 设备枚举、默认设备
//! - 标称采样率 ('nsrt') 与支持列表 ('nsr#')
//! - 输出流物理格式 ('pft ') 与可用列表 ('pft#')
//! - 设备列表 / 默认设备变化通知

use std::ffi::c_void;
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;

use super::device::{
    find_by_name, AudioDevice, AudioHardware, DeviceError, DeviceId, DeviceInfo, DeviceSelector,
    HardwareEvent, HardwareListener,
};
use super::format::{PhysicalFormat, StreamDescription};

/// Core Audio 类型定义
type AudioObjectID = u32;
type AudioObjectPropertySelector = u32;
type AudioObjectPropertyScope = u32;
type AudioObjectPropertyElement = u32;
type OSStatus = i32;

const K_AUDIO_OBJECT_SYSTEM_OBJECT: AudioObjectID = 1;
const K_AUDIO_HARDWARE_PROPERTY_DEVICES: AudioObjectPropertySelector = 0x64657623; // 'dev#'
const K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE: AudioObjectPropertySelector = 0x644F7574; // 'dOut'
const K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE: AudioObjectPropertySelector = 0x6E737274; // 'nsrt'
const K_AUDIO_DEVICE_PROPERTY_AVAILABLE_NOMINAL_SAMPLE_RATES: AudioObjectPropertySelector =
    0x6E737223; // 'nsr#'
const K_AUDIO_DEVICE_PROPERTY_STREAMS: AudioObjectPropertySelector = 0x73746D23; // 'stm#'
const K_AUDIO_STREAM_PROPERTY_PHYSICAL_FORMAT: AudioObjectPropertySelector = 0x70667420; // 'pft '
const K_AUDIO_STREAM_PROPERTY_AVAILABLE_PHYSICAL_FORMATS: AudioObjectPropertySelector =
    0x70667423; // 'pft#'

const K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT: AudioObjectPropertyScope = 0x6F757470; // 'outp'
const K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL: AudioObjectPropertyScope = 0x676C6F62; // 'glob'
const K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN: AudioObjectPropertyElement = 0;

const NO_ERR: OSStatus = 0;

/// 范围型采样率展开时使用的标准采样率
const STANDARD_RATES: [f64; 11] = [
    32000.0, 44100.0, 48000.0, 88200.0, 96000.0, 176400.0, 192000.0, 352800.0, 384000.0,
    705600.0, 768000.0,
];

/// 写入后验证
const VERIFY_RETRIES: u32 = 10;
const VERIFY_DELAY: Duration = Duration::from_millis(20);

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct AudioObjectPropertyAddress {
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    element: AudioObjectPropertyElement,
}

impl AudioObjectPropertyAddress {
    const fn new(selector: AudioObjectPropertySelector, scope: AudioObjectPropertyScope) -> Self {
        Self {
            selector,
            scope,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioValueRange {
    minimum: f64,
    maximum: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioStreamRangedDescription {
    format: StreamDescription,
    sample_rate_range: AudioValueRange,
}

type PropertyListenerProc = unsafe extern "C" fn(
    object_id: AudioObjectID,
    number_addresses: u32,
    addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus;

#[link(name = "CoreAudio", kind = "framework")]
extern "C" {
    fn AudioObjectGetPropertyDataSize(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        out_data_size: *mut u32,
    ) -> OSStatus;

    fn AudioObjectGetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        io_data_size: *mut u32,
        out_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectSetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        data_size: u32,
        data: *const c_void,
    ) -> OSStatus;

    fn AudioObjectAddPropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectRemovePropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;
}

/// 读取定长属性
fn get_property<T: Copy + Default>(
    object_id: AudioObjectID,
    address: &AudioObjectPropertyAddress,
    property: &'static str,
) -> Result<T, DeviceError> {
    let mut value = T::default();
    let mut size = std::mem::size_of::<T>() as u32;

    let status = unsafe {
        AudioObjectGetPropertyData(
            object_id,
            address,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        )
    };

    if status != NO_ERR {
        return Err(DeviceError::GetProperty { property, status });
    }
    Ok(value)
}

/// 读取数组属性
fn get_property_array<T: Copy + Default>(
    object_id: AudioObjectID,
    address: &AudioObjectPropertyAddress,
    property: &'static str,
) -> Result<Vec<T>, DeviceError> {
    let mut size: u32 = 0;
    let status = unsafe {
        AudioObjectGetPropertyDataSize(object_id, address, 0, ptr::null(), &mut size)
    };
    if status != NO_ERR {
        return Err(DeviceError::GetProperty { property, status });
    }

    let count = size as usize / std::mem::size_of::<T>();
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut values = vec![T::default(); count];
    let status = unsafe {
        AudioObjectGetPropertyData(
            object_id,
            address,
            0,
            ptr::null(),
            &mut size,
            values.as_mut_ptr() as *mut c_void,
        )
    };
    if status != NO_ERR {
        return Err(DeviceError::GetProperty { property, status });
    }

    values.truncate(size as usize / std::mem::size_of::<T>());
    Ok(values)
}

fn set_property<T>(
    object_id: AudioObjectID,
    address: &AudioObjectPropertyAddress,
    value: &T,
    property: &'static str,
) -> Result<(), DeviceError> {
    let status = unsafe {
        AudioObjectSetPropertyData(
            object_id,
            address,
            0,
            ptr::null(),
            std::mem::size_of::<T>() as u32,
            value as *const T as *const c_void,
        )
    };
    if status != NO_ERR {
        return Err(DeviceError::SetProperty { property, status });
    }
    Ok(())
}

/// 范围展开为标准采样率（离散值原样保留）
fn expand_range(range: &AudioValueRange) -> Vec<f64> {
    if (range.minimum - range.maximum).abs() < 0.1 {
        return vec![range.minimum];
    }
    STANDARD_RATES
        .iter()
        .copied()
        .filter(|&r| r >= range.minimum && r <= range.maximum)
        .collect()
}

fn default_output_id() -> Result<DeviceId, DeviceError> {
    let address = AudioObjectPropertyAddress::new(
        K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
        K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
    );
    let id: DeviceId = get_property(K_AUDIO_OBJECT_SYSTEM_OBJECT, &address, "default output device")?;
    if id == 0 {
        return Err(DeviceError::NoDefaultDevice);
    }
    Ok(id)
}

/// 输出流 ID 列表（空表示不是输出设备）
fn output_streams(device_id: DeviceId) -> Vec<u32> {
    let address = AudioObjectPropertyAddress::new(
        K_AUDIO_DEVICE_PROPERTY_STREAMS,
        K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
    );
    get_property_array(device_id, &address, "streams").unwrap_or_default()
}

/// 获取设备名称
fn device_name(device_id: DeviceId) -> String {
    // 使用 coreaudio_sys 的 CFString API
    use coreaudio_sys::{
        kAudioObjectPropertyElementMain, kAudioObjectPropertyName, kAudioObjectPropertyScopeGlobal,
        AudioObjectGetPropertyData as sysGetPropertyData,
        AudioObjectPropertyAddress as SysPropertyAddress,
    };

    let address = SysPropertyAddress {
        mSelector: kAudioObjectPropertyName,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMain,
    };

    let mut size: u32 = std::mem::size_of::<*const c_void>() as u32;
    let mut cf_string_ref: *const c_void = ptr::null();

    let status = unsafe {
        sysGetPropertyData(
            device_id,
            &address,
            0,
            ptr::null(),
            &mut size,
            &mut cf_string_ref as *mut _ as *mut c_void,
        )
    };

    if status != 0 || cf_string_ref.is_null() {
        return format!("Device {}", device_id);
    }

    use core_foundation::base::TCFType;
    use core_foundation::string::CFString;

    // create rule：我们拥有这个引用
    let cf_string = unsafe { CFString::wrap_under_create_rule(cf_string_ref as *const _) };
    cf_string.to_string()
}

/// 一个 Core Audio 输出设备
pub struct CoreAudioDevice {
    id: DeviceId,
    name: String,
    stream_id: u32,
}

impl CoreAudioDevice {
    pub fn open(id: DeviceId) -> Result<Self, DeviceError> {
        let stream_id = *output_streams(id).first().ok_or(DeviceError::NoOutputStream)?;
        let name = device_name(id);
        log::info!("Output device: {} (ID: {}, stream {})", name, id, stream_id);
        Ok(Self { id, name, stream_id })
    }

    fn nominal_rate_address(scope: AudioObjectPropertyScope) -> AudioObjectPropertyAddress {
        AudioObjectPropertyAddress::new(K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE, scope)
    }

    fn physical_format_address() -> AudioObjectPropertyAddress {
        AudioObjectPropertyAddress::new(
            K_AUDIO_STREAM_PROPERTY_PHYSICAL_FORMAT,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
        )
    }

    /// 轮询直到设备报告的值满足条件
    fn verify<F>(&self, what: &str, mut check: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        for attempt in 0..VERIFY_RETRIES {
            std::thread::sleep(VERIFY_DELAY);
            if check(self) {
                log::debug!("{} verified (attempt {})", what, attempt + 1);
                return true;
            }
        }
        log::debug!(
            "{} verification failed after {} attempts",
            what,
            VERIFY_RETRIES
        );
        false
    }

    pub fn info(&self, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            supported_sample_rates: self.supported_rates().unwrap_or_default(),
            current_sample_rate: self.nominal_rate().unwrap_or(0.0),
            physical_formats: self.physical_formats().unwrap_or_default(),
            is_default,
        }
    }
}

impl AudioDevice for CoreAudioDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn nominal_rate(&self) -> Result<f64, DeviceError> {
        // 某些设备只在 GLOBAL scope 上提供
        get_property(
            self.id,
            &Self::nominal_rate_address(K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT),
            "nominal sample rate",
        )
        .or_else(|_| {
            get_property(
                self.id,
                &Self::nominal_rate_address(K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL),
                "nominal sample rate",
            )
        })
    }

    fn supported_rates(&self) -> Result<Vec<f64>, DeviceError> {
        let address = AudioObjectPropertyAddress::new(
            K_AUDIO_DEVICE_PROPERTY_AVAILABLE_NOMINAL_SAMPLE_RATES,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
        );
        let ranges: Vec<AudioValueRange> =
            get_property_array(self.id, &address, "available sample rates")?;

        let mut rates: Vec<f64> = ranges.iter().flat_map(expand_range).collect();
        rates.sort_by(f64::total_cmp);
        rates.dedup();

        if rates.is_empty() {
            return Err(DeviceError::Empty("sample rates"));
        }
        Ok(rates)
    }

    fn physical_formats(&self) -> Result<Vec<PhysicalFormat>, DeviceError> {
        let address = AudioObjectPropertyAddress::new(
            K_AUDIO_STREAM_PROPERTY_AVAILABLE_PHYSICAL_FORMATS,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
        );
        let ranged: Vec<AudioStreamRangedDescription> =
            get_property_array(self.stream_id, &address, "available physical formats")?;

        let mut formats: Vec<PhysicalFormat> = Vec::new();
        for r in ranged.iter().filter(|r| r.format.is_linear_pcm()) {
            // sample_rate 为 0 表示范围内任意采样率
            let rates = if r.format.sample_rate > 0.0 {
                vec![r.format.sample_rate]
            } else {
                expand_range(&r.sample_rate_range)
            };
            for rate in rates {
                let format = PhysicalFormat::from_description(StreamDescription {
                    sample_rate: rate,
                    ..r.format
                });
                if !formats.iter().any(|f| f.description == format.description) {
                    formats.push(format);
                }
            }
        }

        if formats.is_empty() {
            return Err(DeviceError::Empty("physical formats"));
        }
        Ok(formats)
    }

    fn current_physical_format(&self) -> Result<PhysicalFormat, DeviceError> {
        let description: StreamDescription = get_property(
            self.stream_id,
            &Self::physical_format_address(),
            "physical format",
        )?;
        Ok(PhysicalFormat::from_description(description))
    }

    fn set_physical_format(&mut self, format: &PhysicalFormat) -> Result<(), DeviceError> {
        set_property(
            self.stream_id,
            &Self::physical_format_address(),
            &format.description,
            "physical format",
        )?;

        let confirmed = self.verify("Physical format", |dev| {
            dev.current_physical_format()
                .map(|actual| actual.same_as(format))
                .unwrap_or(false)
        });
        if !confirmed {
            return Err(DeviceError::Unconfirmed("physical format"));
        }
        Ok(())
    }

    fn set_nominal_rate(&mut self, rate_hz: f64) -> Result<(), DeviceError> {
        const TOLERANCE: f64 = 1.0;

        let output = Self::nominal_rate_address(K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT);
        let global = Self::nominal_rate_address(K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL);
        set_property(self.id, &output, &rate_hz, "nominal sample rate")
            .or_else(|_| set_property(self.id, &global, &rate_hz, "nominal sample rate"))?;

        let confirmed = self.verify("Sample rate", |dev| {
            dev.nominal_rate()
                .map(|actual| (actual - rate_hz).abs() < TOLERANCE)
                .unwrap_or(false)
        });
        if !confirmed {
            return Err(DeviceError::Unconfirmed("nominal sample rate"));
        }
        Ok(())
    }
}

/// 已注册的属性监听（Drop 时注销并释放回调）
struct Registration {
    addresses: Vec<AudioObjectPropertyAddress>,
    client: *mut HardwareListener,
}

// client 只在注册期间由 HAL 通知线程只读访问
unsafe impl Send for Registration {}

impl Drop for Registration {
    fn drop(&mut self) {
        for address in &self.addresses {
            unsafe {
                AudioObjectRemovePropertyListener(
                    K_AUDIO_OBJECT_SYSTEM_OBJECT,
                    address,
                    hardware_listener,
                    self.client as *mut c_void,
                );
            }
        }
        drop(unsafe { Box::from_raw(self.client) });
    }
}

unsafe extern "C" fn hardware_listener(
    _object_id: AudioObjectID,
    number_addresses: u32,
    addresses: *const AudioObjectPropertyAddress,
    client_data: *mut c_void,
) -> OSStatus {
    if client_data.is_null() || addresses.is_null() {
        return NO_ERR;
    }
    let listener = &*(client_data as *const HardwareListener);
    let addresses = std::slice::from_raw_parts(addresses, number_addresses as usize);
    for address in addresses {
        match address.selector {
            K_AUDIO_HARDWARE_PROPERTY_DEVICES => listener(HardwareEvent::DeviceListChanged),
            K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE => {
                listener(HardwareEvent::DefaultDeviceChanged)
            }
            _ => {}
        }
    }
    NO_ERR
}

/// Core Audio 硬件入口
#[derive(Default)]
pub struct CoreAudioHardware {
    registrations: Mutex<Vec<Registration>>,
}

impl CoreAudioHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn all_device_ids() -> Result<Vec<DeviceId>, DeviceError> {
        let address = AudioObjectPropertyAddress::new(
            K_AUDIO_HARDWARE_PROPERTY_DEVICES,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
        );
        get_property_array(K_AUDIO_OBJECT_SYSTEM_OBJECT, &address, "device list")
    }
}

impl AudioHardware for CoreAudioHardware {
    fn output_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let default_id = default_output_id().ok();
        let devices = Self::all_device_ids()?
            .into_iter()
            .filter(|&id| !output_streams(id).is_empty())
            .filter_map(|id| CoreAudioDevice::open(id).ok())
            .map(|dev| dev.info(Some(dev.id) == default_id))
            .collect();
        Ok(devices)
    }

    fn open(&self, selector: &DeviceSelector) -> Result<Box<dyn AudioDevice>, DeviceError> {
        let id = match selector {
            DeviceSelector::Default => default_output_id()?,
            DeviceSelector::Id(id) => *id,
            DeviceSelector::Name(name) => {
                let devices = self.output_devices()?;
                find_by_name(&devices, name)
                    .map(|d| d.id)
                    .ok_or_else(|| DeviceError::NotFound(name.clone()))?
            }
        };
        Ok(Box::new(CoreAudioDevice::open(id)?))
    }

    fn subscribe(&self, listener: HardwareListener) -> Result<(), DeviceError> {
        let addresses = vec![
            AudioObjectPropertyAddress::new(
                K_AUDIO_HARDWARE_PROPERTY_DEVICES,
                K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            ),
            AudioObjectPropertyAddress::new(
                K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
                K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            ),
        ];
        let client = Box::into_raw(Box::new(listener));

        let mut registered = Vec::with_capacity(addresses.len());
        for address in addresses {
            let status = unsafe {
                AudioObjectAddPropertyListener(
                    K_AUDIO_OBJECT_SYSTEM_OBJECT,
                    &address,
                    hardware_listener,
                    client as *mut c_void,
                )
            };
            if status != NO_ERR {
                // 已注册的部分由 Registration::drop 注销
                drop(Registration {
                    addresses: registered,
                    client,
                });
                return Err(DeviceError::SetProperty {
                    property: "property listener",
                    status,
                });
            }
            registered.push(address);
        }

        self.registrations.lock().push(Registration {
            addresses: registered,
            client,
        });
        log::debug!("Listening for device list and default device changes");
        Ok(())
    }
}
