//! 播放配置
//!
//! 启动时构造一次，之后不可变，以引用传给调度器、控制器和设备。

use crate::audio::{DeviceParams, PcmFormat};

/// 每次测量取平均的循环数
pub const LOOPS_AVG: u32 = 16;
/// 每隔多少循环重新计算一次修正
pub const LOOPS_CADENCE: u32 = 4000;
/// 比例系数
pub const KP: f64 = 1.0;
/// 积分系数
pub const KI: f64 = 0.05;
/// `Ki * Ta` 的上限
pub const MAX_KI_TA: f64 = 0.2;

/// 配置错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),

    #[error("sample rate {rate} Hz is lower than {loops} loops per second")]
    TooManyLoops { rate: u32, loops: u32 },

    #[error(
        "hardware buffer of {requested} frames holds only {normalized} frames as whole \
         loops of {frames_per_loop}; at least {minimum} needed"
    )]
    BufferTooSmall {
        requested: usize,
        normalized: usize,
        frames_per_loop: usize,
        minimum: usize,
    },

    #[error("controller window of {avg} loops does not fit in cadence of {cadence} loops")]
    Window { avg: u32, cadence: u32 },

    #[error("invalid controller gain {name} = {value}")]
    Gain { name: &'static str, value: f64 },
}

/// 启动前的等待方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupDelay {
    /// 固定睡眠（微秒）
    Fixed(u64),
    /// 等待上游可读，再按上游缓冲剩余填充时间睡眠
    Pipeline,
}

impl StartupDelay {
    /// `--sleep` 的语义：0 表示动态等待
    pub fn from_micros(us: u64) -> Self {
        if us > 0 {
            Self::Fixed(us)
        } else {
            Self::Pipeline
        }
    }
}

impl Default for StartupDelay {
    fn default() -> Self {
        Self::Pipeline
    }
}

/// PI 控制器参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerParams {
    pub loops_avg: u32,
    pub loops_cadence: u32,
    pub kp: f64,
    pub ki: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            loops_avg: LOOPS_AVG,
            loops_cadence: LOOPS_CADENCE,
            kp: KP,
            ki: KI,
        }
    }
}

impl ControllerParams {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.loops_avg == 0 {
            return Err(ConfigError::NotPositive("controller averaging window"));
        }
        if self.loops_avg > self.loops_cadence {
            return Err(ConfigError::Window {
                avg: self.loops_avg,
                cadence: self.loops_cadence,
            });
        }
        if !self.kp.is_finite() || self.kp < 0.0 {
            return Err(ConfigError::Gain { name: "Kp", value: self.kp });
        }
        if !self.ki.is_finite() || self.ki <= 0.0 {
            return Err(ConfigError::Gain { name: "Ki", value: self.ki });
        }
        Ok(())
    }
}

/// 用户请求的参数（未规整）
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub format: PcmFormat,
    pub loops_per_second: u32,
    pub hw_buffer_frames: usize,
    pub nonblocking: bool,
    pub startup: StartupDelay,
    pub controller: ControllerParams,
}

impl Default for PlaybackRequest {
    fn default() -> Self {
        Self {
            format: PcmFormat::default(),
            loops_per_second: 1000,
            hw_buffer_frames: 4096,
            nonblocking: false,
            startup: StartupDelay::default(),
            controller: ControllerParams::default(),
        }
    }
}

/// 规整后的播放配置
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    format: PcmFormat,
    loops_per_second: u32,
    frames_per_loop: usize,
    hw_buffer_frames: usize,
    requested_buffer_frames: usize,
    nonblocking: bool,
    startup: StartupDelay,
    controller: ControllerParams,
}

/// 把缓冲区规整为 `frames_per_loop` 的整数倍（不超过请求值）
///
/// mmap 写入要求硬件缓冲区能被每次循环的写入区域整除。
#[inline]
pub fn normalize_buffer(requested: usize, frames_per_loop: usize) -> usize {
    if frames_per_loop == 0 {
        return 0;
    }
    requested - requested % frames_per_loop
}

impl PlaybackConfig {
    pub fn new(req: PlaybackRequest) -> Result<Self, ConfigError> {
        let fmt = req.format;
        if fmt.sample_rate == 0 {
            return Err(ConfigError::NotPositive("sample rate"));
        }
        if fmt.channels == 0 {
            return Err(ConfigError::NotPositive("channel count"));
        }
        if req.loops_per_second == 0 {
            return Err(ConfigError::NotPositive("loops per second"));
        }

        let frames_per_loop = (fmt.sample_rate / req.loops_per_second) as usize;
        if frames_per_loop == 0 {
            return Err(ConfigError::TooManyLoops {
                rate: fmt.sample_rate,
                loops: req.loops_per_second,
            });
        }

        let normalized = normalize_buffer(req.hw_buffer_frames, frames_per_loop);
        let minimum = 2 * frames_per_loop;
        if normalized < minimum {
            return Err(ConfigError::BufferTooSmall {
                requested: req.hw_buffer_frames,
                normalized,
                frames_per_loop,
                minimum,
            });
        }

        req.controller.validate()?;

        Ok(Self {
            format: fmt,
            loops_per_second: req.loops_per_second,
            frames_per_loop,
            hw_buffer_frames: normalized,
            requested_buffer_frames: req.hw_buffer_frames,
            nonblocking: req.nonblocking,
            startup: req.startup,
            controller: req.controller,
        })
    }

    #[inline]
    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    #[inline]
    pub fn loops_per_second(&self) -> u32 {
        self.loops_per_second
    }

    /// 每次循环写入的帧数
    #[inline]
    pub fn frames_per_loop(&self) -> usize {
        self.frames_per_loop
    }

    /// 每次循环读取的字节数
    #[inline]
    pub fn bytes_per_loop(&self) -> usize {
        self.frames_per_loop * self.format.bytes_per_frame()
    }

    /// 规整后的硬件缓冲区大小（帧）
    #[inline]
    pub fn hw_buffer_frames(&self) -> usize {
        self.hw_buffer_frames
    }

    pub fn requested_buffer_frames(&self) -> usize {
        self.requested_buffer_frames
    }

    pub fn startup(&self) -> StartupDelay {
        self.startup
    }

    pub fn controller(&self) -> &ControllerParams {
        &self.controller
    }

    /// 标称循环间隔（纳秒，整数截断）
    #[inline]
    pub fn nominal_interval_ns(&self) -> i64 {
        1_000_000_000 / self.loops_per_second as i64
    }

    /// 填满半个缓冲区需要的循环数，在这一轮显式启动播放
    #[inline]
    pub fn start_count(&self) -> u64 {
        (self.hw_buffer_frames / (2 * self.frames_per_loop)) as u64
    }

    /// 目标占用：半个缓冲区
    #[inline]
    pub fn target_frames(&self) -> f64 {
        self.hw_buffer_frames as f64 / 2.0
    }

    /// 传给设备的参数
    pub fn device_params(&self) -> DeviceParams {
        DeviceParams {
            format: self.format,
            buffer_frames: self.hw_buffer_frames,
            nonblocking: self.nonblocking,
        }
    }
}
