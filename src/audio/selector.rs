//! 目标格式选择
//!
//! 两个轴独立取最近值：
//! 1. 采样率：支持列表中距离目标最近的（相同距离取先出现的）
//! 2. 位深：可用格式中距离目标位深最近的
//!
//! 然后在可用格式里找同时满足两者的组合。找不到时放宽位深轴，
//! 在最近采样率下取位深最接近的一个。

use super::format::PhysicalFormat;

/// 采样率比较容差
const RATE_TOLERANCE_HZ: f64 = 1.0;

/// 选择错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectError {
    #[error("device reported no supported rates or physical formats")]
    NoFormats,
    #[error("no physical format at {rate_hz} Hz")]
    NoSuitableFormat { rate_hz: f64 },
}

/// 选择结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Selection {
    /// 最近采样率与最近位深的精确组合
    Exact(PhysicalFormat),
    /// 该采样率下没有最近位深，位深已放宽
    RelaxedBits {
        format: PhysicalFormat,
        wanted_bits: u32,
    },
}

impl Selection {
    pub fn format(&self) -> &PhysicalFormat {
        match self {
            Self::Exact(format) | Self::RelaxedBits { format, .. } => format,
        }
    }
}

/// 稳定最小值：距离相同取先出现的
fn nearest_by<T, F>(items: impl IntoIterator<Item = T>, distance: F) -> Option<T>
where
    F: Fn(&T) -> f64,
{
    let mut best: Option<(T, f64)> = None;
    for item in items {
        let d = distance(&item);
        if best.as_ref().map_or(true, |(_, best_d)| d < *best_d) {
            best = Some((item, d));
        }
    }
    best.map(|(item, _)| item)
}

/// 支持列表中距离目标最近的采样率
pub fn nearest_rate(target_rate_hz: f64, supported_rates: &[f64]) -> Option<f64> {
    nearest_by(supported_rates.iter().copied(), |r| (r - target_rate_hz).abs())
}

fn formats_at(available: &[PhysicalFormat], rate: f64) -> impl Iterator<Item = &PhysicalFormat> {
    available
        .iter()
        .filter(move |f| (f.sample_rate - rate).abs() < RATE_TOLERANCE_HZ)
}

/// 选择要写入设备的物理格式
pub fn select_format(
    target_rate_hz: f64,
    target_bits: u32,
    supported_rates: &[f64],
    available: &[PhysicalFormat],
) -> Result<Selection, SelectError> {
    if supported_rates.is_empty() || available.is_empty() {
        return Err(SelectError::NoFormats);
    }

    let rate = nearest_rate(target_rate_hz, supported_rates).ok_or(SelectError::NoFormats)?;
    let bits = nearest_by(available.iter(), |f| {
        (f.bits_per_channel as f64 - target_bits as f64).abs()
    })
    .map(|f| f.bits_per_channel)
    .ok_or(SelectError::NoFormats)?;

    if let Some(exact) = formats_at(available, rate).find(|f| f.bits_per_channel == bits) {
        return Ok(Selection::Exact(*exact));
    }

    let relaxed = nearest_by(formats_at(available, rate), |f| {
        (f.bits_per_channel as f64 - target_bits as f64).abs()
    })
    .ok_or(SelectError::NoSuitableFormat { rate_hz: rate })?;

    log::debug!(
        "No {}-bit format at {} Hz, relaxing to {}-bit",
        bits,
        rate,
        relaxed.bits_per_channel
    );

    Ok(Selection::RelaxedBits {
        format: *relaxed,
        wanted_bits: target_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::StreamDescription;
    use approx::assert_relative_eq;

    fn pf(rate: f64, bits: u32) -> PhysicalFormat {
        PhysicalFormat::from_description(StreamDescription::integer_pcm(rate, bits, 2))
    }

    fn usb_dac() -> (Vec<f64>, Vec<PhysicalFormat>) {
        let rates = vec![44100.0, 48000.0, 88200.0, 96000.0, 176400.0, 192000.0];
        let formats = rates
            .iter()
            .flat_map(|&r| [pf(r, 16), pf(r, 24), pf(r, 32)])
            .collect();
        (rates, formats)
    }

    #[test]
    fn test_exact_pair() {
        let (rates, formats) = usb_dac();
        let sel = select_format(96000.0, 24, &rates, &formats).unwrap();
        assert!(matches!(sel, Selection::Exact(_)));
        assert_relative_eq!(sel.format().sample_rate, 96000.0);
        assert_eq!(sel.format().bits_per_channel, 24);
    }

    #[test]
    fn test_nearest_rate_and_bits() {
        let (rates, formats) = usb_dac();
        let sel = select_format(95000.0, 20, &rates, &formats).unwrap();
        assert_relative_eq!(sel.format().sample_rate, 96000.0);
        // 20 与 16、24 等距，取先出现的 16
        assert_eq!(sel.format().bits_per_channel, 16);
    }

    #[test]
    fn test_rate_tie_takes_first_encountered() {
        let rates = vec![44100.0, 48000.0];
        let formats = vec![pf(44100.0, 24), pf(48000.0, 24)];
        let sel = select_format(46050.0, 24, &rates, &formats).unwrap();
        assert_relative_eq!(sel.format().sample_rate, 44100.0);
    }

    #[test]
    fn test_relaxed_bits_when_pair_missing() {
        // 32-bit 只在 44.1k 下可用
        let rates = vec![44100.0, 96000.0];
        let formats = vec![pf(44100.0, 32), pf(96000.0, 16), pf(96000.0, 24)];
        let sel = select_format(96000.0, 32, &rates, &formats).unwrap();
        match sel {
            Selection::RelaxedBits { format, wanted_bits } => {
                assert_eq!(wanted_bits, 32);
                assert_eq!(format.bits_per_channel, 24);
                assert_relative_eq!(format.sample_rate, 96000.0);
            }
            other => panic!("expected relaxed selection, got {:?}", other),
        }
    }

    #[test]
    fn test_no_format_at_rate() {
        let rates = vec![44100.0, 192000.0];
        let formats = vec![pf(44100.0, 24)];
        assert_eq!(
            select_format(192000.0, 24, &rates, &formats),
            Err(SelectError::NoSuitableFormat { rate_hz: 192000.0 })
        );
    }

    #[test]
    fn test_nearest_rate() {
        let rates = [44100.0, 48000.0, 96000.0];
        assert_eq!(nearest_rate(88200.0, &rates), Some(96000.0));
        assert_eq!(nearest_rate(8000.0, &rates), Some(44100.0));
        assert_eq!(nearest_rate(44100.0, &[]), None);
    }

    #[test]
    fn test_empty_inputs() {
        let (rates, formats) = usb_dac();
        assert_eq!(select_format(44100.0, 16, &[], &formats), Err(SelectError::NoFormats));
        assert_eq!(select_format(44100.0, 16, &rates, &[]), Err(SelectError::NoFormats));
    }
}
