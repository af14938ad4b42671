//! 日志行解析
//!
//! 纯函数：一行日志 → 零或一个 DetectedFormat。
//! 按可信度从高到低匹配，每行只取第一个命中的模式；
//! 无法解析的行直接丢弃，不视为错误。

use std::time::Instant;

use super::{DetectedFormat, Trust};

/// 解码器源文件标记（出现任一即视为解码器日志）
const DECODER_MARKERS: &[&str] = &[
    "ACAppleLosslessDecoder",
    "ACFLACDecoder",
    "ACMP4AACBaseDecoder",
];
const INPUT_FORMAT_MARKER: &str = "Input format";

const CAPABILITIES_MARKER: &str = "audioCapabilities";
const QUEUE_MARKER: &str = "AudioQueue creation";
const QUEUE_RATE_TOKEN: &str = "sampleRate:";

/// 位深未知时的默认值
const METADATA_DEFAULT_BITS: u32 = 16;
const QUEUE_DEFAULT_BITS: u32 = 24;

/// 解析一行日志
pub fn parse_line(line: &str, observed_at: Instant) -> Option<DetectedFormat> {
    let format = parse_decoder(line, observed_at)
        .or_else(|| parse_queue(line, observed_at))
        .or_else(|| parse_capabilities(line, observed_at))?;

    match source_tag(line) {
        Some(tag) => Some(format.with_source_tag(tag)),
        None => Some(format),
    }
}

/// 解码器日志: "... Input format: 2 ch, 192000 Hz, from 24-bit source"
fn parse_decoder(line: &str, observed_at: Instant) -> Option<DetectedFormat> {
    if !line.contains(INPUT_FORMAT_MARKER) || !DECODER_MARKERS.iter().any(|m| line.contains(m)) {
        return None;
    }

    let rate: f64 = between(line, "ch, ", " Hz")?.trim().parse().ok()?;
    let bits: u32 = between(line, "from ", "-bit source")?.trim().parse().ok()?;

    valid_rate(rate).map(|hz| DetectedFormat::new(hz, bits, observed_at, Trust::Decoder))
}

/// 播放器元数据: "audioCapabilities ... asbdSampleRate = 44.1 kHz ... sdBitDepth = 16 bit"
fn parse_capabilities(line: &str, observed_at: Instant) -> Option<DetectedFormat> {
    if !line.contains(CAPABILITIES_MARKER) {
        return None;
    }

    let khz: f64 = between(line, "asbdSampleRate = ", " kHz")?.trim().parse().ok()?;
    let bits = between(line, "sdBitDepth = ", " bit")
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(METADATA_DEFAULT_BITS);

    valid_rate((khz * 1000.0).round())
        .map(|hz| DetectedFormat::new(hz, bits, observed_at, Trust::PlayerMetadata))
}

/// AudioQueue 创建日志: "AudioQueue creation ... sampleRate:44100.000000, ..."
fn parse_queue(line: &str, observed_at: Instant) -> Option<DetectedFormat> {
    if !line.contains(QUEUE_MARKER) || !line.contains(QUEUE_RATE_TOKEN) {
        return None;
    }

    let rate = scan_float_after(line, QUEUE_RATE_TOKEN).or_else(|| split_field_after(line))?;

    valid_rate(rate).map(|hz| DetectedFormat::new(hz, QUEUE_DEFAULT_BITS, observed_at, Trust::AudioQueue))
}

/// 取 `start` 第一次出现之后、到下一个 `end` 为止的子串
fn between<'a>(line: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = line.find(start)? + start.len();
    let rest = &line[from..];
    let to = rest.find(end)?;
    Some(&rest[..to])
}

/// 主扫描：token 后跳过空白，读取连续的数字/小数点
fn scan_float_after(line: &str, token: &str) -> Option<f64> {
    let from = line.find(token)? + token.len();
    let rest = line[from..].trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// 兜底：按 token 切分，再按分隔符取第一个非空字段
fn split_field_after(line: &str) -> Option<f64> {
    let tail = line.split(QUEUE_RATE_TOKEN).nth(1)?;
    tail.split(|c: char| c.is_whitespace() || matches!(c, ',' | '[' | ']' | '(' | ')'))
        .find(|field| !field.is_empty())?
        .parse()
        .ok()
}

fn valid_rate(hz: f64) -> Option<f64> {
    (hz.is_finite() && hz > 0.0).then_some(hz)
}

/// 从 compact 风格日志中提取进程名
///
/// 形如 "2024-05-01 10:00:00.000 Df Music[812:1a2b] ..."，取 `[pid` 前的单词
fn source_tag(line: &str) -> Option<String> {
    line.split_whitespace().find_map(|word| {
        let (name, rest) = word.split_once('[')?;
        let pid_is_numeric = rest.chars().next().is_some_and(|c| c.is_ascii_digit());
        let name_ok = !name.is_empty()
            && name.chars().all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'));
        (pid_is_numeric && name_ok).then(|| name.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Option<DetectedFormat> {
        parse_line(line, Instant::now())
    }

    #[test]
    fn test_decoder_line() {
        let line = "2024-05-01 10:00:00.000 Df Music[812:1a2b] [com.apple.coreaudio:AudioConverter] \
                    ACAppleLosslessDecoder.cpp:412 Input format: 2 ch, 192000 Hz, from 24-bit source";
        let format = parse(line).unwrap();
        assert_eq!(format.sample_rate_hz(), 192000.0);
        assert_eq!(format.bit_depth(), 24);
        assert_eq!(format.trust(), Trust::Decoder);
        assert_eq!(format.source_tag(), Some("Music"));
    }

    #[test]
    fn test_decoder_line_requires_both_numbers() {
        let line = "ACAppleLosslessDecoder.cpp Input format: 2 ch, ??? Hz, from 24-bit source";
        assert!(parse(line).is_none());

        let line = "ACFLACDecoder.cpp Input format: 2 ch, 96000 Hz, from unknown-bit source";
        assert!(parse(line).is_none());
    }

    #[test]
    fn test_decoder_marker_without_input_format_is_ignored() {
        let line = "ACAppleLosslessDecoder.cpp: 2 ch, 96000 Hz, from 24-bit source";
        assert!(parse(line).is_none());
    }

    #[test]
    fn test_capabilities_line() {
        let line = "Music: audioCapabilities: { asbdSampleRate = 88.2 kHz, sdBitDepth = 24 bit }";
        let format = parse(line).unwrap();
        assert_eq!(format.sample_rate_hz(), 88200.0);
        assert_eq!(format.bit_depth(), 24);
        assert_eq!(format.trust(), Trust::PlayerMetadata);
    }

    #[test]
    fn test_capabilities_default_bit_depth() {
        let line = "audioCapabilities changed asbdSampleRate = 44.1 kHz";
        let format = parse(line).unwrap();
        assert_eq!(format.sample_rate_hz(), 44100.0);
        assert_eq!(format.bit_depth(), 16);
    }

    #[test]
    fn test_queue_line() {
        let line = "AudioQueueObject.cpp:2531 AudioQueue creation: sampleRate:48000.000000, channels:2";
        let format = parse(line).unwrap();
        assert_eq!(format.sample_rate_hz(), 48000.0);
        assert_eq!(format.bit_depth(), 24);
        assert_eq!(format.trust(), Trust::AudioQueue);
    }

    #[test]
    fn test_queue_line_trailing_bracket() {
        let line = "AudioQueue creation {sampleRate: 96000]";
        assert_eq!(parse(line).unwrap().sample_rate_hz(), 96000.0);
    }

    #[test]
    fn test_queue_line_split_fallback() {
        // 主扫描遇到 '[' 失败，兜底按分隔符取字段
        let line = "AudioQueue creation sampleRate: [44100] fmt lpcm";
        assert_eq!(parse(line).unwrap().sample_rate_hz(), 44100.0);
    }

    #[test]
    fn test_unrelated_lines_yield_nothing() {
        assert!(parse("").is_none());
        assert!(parse("kernel: something happened at 44100 Hz").is_none());
        assert!(parse("AudioQueue creation without a rate").is_none());
        assert!(parse("audioCapabilities asbdSampleRate = nan kHz").is_none());
    }

    #[test]
    fn test_source_tag_absent() {
        let line = "AudioQueue creation sampleRate:44100";
        assert_eq!(parse(line).unwrap().source_tag(), None);
    }
}
