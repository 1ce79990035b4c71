//! 音频核心模块
//!
//! 包含：
//! - Format: PCM 编码与流格式
//! - Timing: 单调时钟与绝对时刻睡眠
//! - Source: 输入字节流（stdin / 管道 / TCP）
//! - Device: 输出设备契约与 mmap 租约
//! - Null: 内存输出设备
//! - Alsa: ALSA mmap 输出（`alsa` feature）
//! - Refresh: 提交前的内存刷新
//! - Stats: 播放统计

pub mod device;
pub mod format;
pub mod null;
pub mod refresh;
pub mod source;
pub mod stats;
pub mod timing;

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub mod alsa;

pub use device::{BufferLease, DeviceError, DeviceParams, Negotiated, OutputDevice};
pub use format::{PcmFormat, SampleEncoding};
pub use null::NullDevice;
pub use source::{read_exact_or_eof, InputStream, PcmSource, ReadOutcome};
pub use stats::{PlaybackStats, StatsReport};
pub use timing::{Clock, MonotonicClock, Timespec};

/// 按名称打开输出设备
///
/// `null` 为内存设备，其余名称交给 ALSA。
pub fn open_device(name: &str) -> Result<Box<dyn OutputDevice>, DeviceError> {
    if name == "null" {
        return Ok(Box::new(NullDevice::clocked()));
    }
    open_hardware(name)
}

#[cfg(all(feature = "alsa", target_os = "linux"))]
fn open_hardware(name: &str) -> Result<Box<dyn OutputDevice>, DeviceError> {
    Ok(Box::new(alsa::AlsaDevice::open(name)?))
}

#[cfg(not(all(feature = "alsa", target_os = "linux")))]
fn open_hardware(name: &str) -> Result<Box<dyn OutputDevice>, DeviceError> {
    Err(DeviceError::Open {
        name: name.to_string(),
        reason: "built without ALSA support (enable the `alsa` feature), only `null` is available"
            .to_string(),
    })
}
