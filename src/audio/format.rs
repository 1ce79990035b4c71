//! PCM 编码与流格式
//!
//! 输入是无头的交织 PCM 字节流，格式只能由外部给出：
//! (编码, 声道数, 采样率)。这里只支持固定的几种小端整数编码。

use std::fmt;
use std::str::FromStr;

/// 样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// 16-bit 有符号，2 字节
    S16Le,
    /// 24-bit 有符号，放在 4 字节容器中
    S24Le,
    /// 24-bit 有符号，紧凑 3 字节
    S24_3Le,
    /// 32-bit 有符号，4 字节
    S32Le,
}

impl SampleEncoding {
    pub const ALL: [SampleEncoding; 4] = [Self::S16Le, Self::S24Le, Self::S24_3Le, Self::S32Le];

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Le => 2,
            Self::S24_3Le => 3,
            Self::S24Le | Self::S32Le => 4,
        }
    }

    /// ALSA 风格的名称
    pub fn name(self) -> &'static str {
        match self {
            Self::S16Le => "S16_LE",
            Self::S24Le => "S24_LE",
            Self::S24_3Le => "S24_3LE",
            Self::S32Le => "S32_LE",
        }
    }
}

impl Default for SampleEncoding {
    fn default() -> Self {
        Self::S16Le
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 无法识别的编码名称
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sample format {0} not recognized (expected one of S16_LE, S24_LE, S24_3LE, S32_LE)")]
pub struct UnknownEncoding(pub String);

impl FromStr for SampleEncoding {
    type Err = UnknownEncoding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownEncoding(s.to_string()))
    }
}

/// 输入流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub encoding: SampleEncoding,
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmFormat {
    pub fn new(encoding: SampleEncoding, channels: u16, sample_rate: u32) -> Self {
        Self {
            encoding,
            channels,
            sample_rate,
        }
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.encoding.bytes_per_sample()
    }

    /// 每帧的字节数（所有声道各一个样本）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }

    /// 字节数换算为完整帧数（不足一帧的尾巴舍去）
    #[inline]
    pub fn frames_in(&self, bytes: usize) -> usize {
        match self.bytes_per_frame() {
            0 => 0,
            bpf => bytes / bpf,
        }
    }

    /// 播放给定帧数所需的时间（微秒）
    pub fn frames_to_micros(&self, frames: usize) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (frames as u64 * 1_000_000) / self.sample_rate as u64
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::new(SampleEncoding::S16Le, 2, 44_100)
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} channels with {} bytes per sample at {} Hz ({})",
            self.channels,
            self.bytes_per_sample(),
            self.sample_rate,
            self.encoding
        )
    }
}
