//! 物理流格式
//!
//! 设备输出流广告的每一种格式都对应一个 AudioStreamBasicDescription，
//! 写回设备时必须原样使用广告值，不能自己拼。

use std::fmt;

pub const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'
pub const K_AUDIO_FORMAT_FLAG_IS_FLOAT: u32 = 1 << 0;
pub const K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER: u32 = 1 << 2;
pub const K_AUDIO_FORMAT_FLAG_IS_PACKED: u32 = 1 << 3;
pub const K_AUDIO_FORMAT_FLAG_IS_NON_INTERLEAVED: u32 = 1 << 5;

/// 与 CoreAudio 的 AudioStreamBasicDescription 内存布局一致
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamDescription {
    pub sample_rate: f64,
    pub format_id: u32,
    pub format_flags: u32,
    pub bytes_per_packet: u32,
    pub frames_per_packet: u32,
    pub bytes_per_frame: u32,
    pub channels_per_frame: u32,
    pub bits_per_channel: u32,
    pub reserved: u32,
}

impl StreamDescription {
    /// 打包的整数 LPCM 描述（测试和 mock 设备用）
    pub fn integer_pcm(sample_rate: f64, bits: u32, channels: u32) -> Self {
        let bytes = bits.div_ceil(8) * channels;
        Self {
            sample_rate,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags: K_AUDIO_FORMAT_FLAG_IS_SIGNED_INTEGER | K_AUDIO_FORMAT_FLAG_IS_PACKED,
            bytes_per_packet: bytes,
            frames_per_packet: 1,
            bytes_per_frame: bytes,
            channels_per_frame: channels,
            bits_per_channel: bits,
            reserved: 0,
        }
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        (self.format_flags & K_AUDIO_FORMAT_FLAG_IS_FLOAT) != 0
    }

    #[inline]
    pub fn is_linear_pcm(&self) -> bool {
        self.format_id == K_AUDIO_FORMAT_LINEAR_PCM
    }

    #[inline]
    pub fn is_non_interleaved(&self) -> bool {
        (self.format_flags & K_AUDIO_FORMAT_FLAG_IS_NON_INTERLEAVED) != 0
    }
}

/// 设备可用的一种物理格式
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhysicalFormat {
    pub sample_rate: f64,
    pub bits_per_channel: u32,
    /// 设备广告的原始描述，写回时使用
    pub description: StreamDescription,
}

impl PhysicalFormat {
    pub fn from_description(description: StreamDescription) -> Self {
        Self {
            sample_rate: description.sample_rate,
            bits_per_channel: description.bits_per_channel,
            description,
        }
    }

    /// 相同采样率与位深（1 Hz 容差）
    pub fn same_as(&self, other: &PhysicalFormat) -> bool {
        (self.sample_rate - other.sample_rate).abs() < 1.0
            && self.bits_per_channel == other.bits_per_channel
    }
}

impl fmt::Display for PhysicalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.description.is_float() { "float" } else { "int" };
        write!(
            f,
            "{:.1} kHz / {}-bit {}, {} ch",
            self.sample_rate / 1000.0,
            self.bits_per_channel,
            kind,
            self.description.channels_per_frame
        )?;
        if self.description.is_non_interleaved() {
            write!(f, " (non-interleaved)")?;
        }
        Ok(())
    }
}
