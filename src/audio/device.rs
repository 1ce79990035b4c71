//! 输出设备抽象
//!
//! 硬件环形缓冲区以 mmap 方式访问：取得写位置的地址，原地写入，再提交。
//! 这里把"取地址 / 写 / 提交"建模为一个作用域租约 [`BufferLease`]：
//! 租约持有设备的 `&mut` 借用，存活期间任何其它代码都无法访问设备或该区域；
//! 提交后所有权还给设备。未提交就丢弃等于放弃该区域（写位置不前进）。

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::format::{PcmFormat, SampleEncoding};

/// 设备错误
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// 打开设备失败
    #[error("error opening PCM device {name}: {reason}")]
    Open { name: String, reason: String },

    /// 参数协商失败（不支持的格式/采样率/声道/缓冲区）
    #[error("error configuring {param}: {reason}")]
    Config { param: &'static str, reason: String },

    /// 设备给出的缓冲区与请求不一致
    #[error("device granted buffer size {granted} frames, requested {requested}")]
    BufferSize { requested: usize, granted: usize },

    /// 运行期错误（avail / mmap / commit / start / drain）
    #[error("error on {op}: {reason}")]
    Runtime { op: &'static str, reason: String },
}

impl DeviceError {
    pub fn config(param: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            param,
            reason: reason.into(),
        }
    }

    pub fn runtime(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Runtime {
            op,
            reason: reason.into(),
        }
    }

    /// 是否属于配置类错误
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::BufferSize { .. })
    }
}

/// 硬件参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceParams {
    pub format: PcmFormat,
    /// 请求的硬件缓冲区大小（帧）
    pub buffer_frames: usize,
    /// 非阻塞写
    pub nonblocking: bool,
}

impl DeviceParams {
    #[inline]
    pub fn encoding(&self) -> SampleEncoding {
        self.format.encoding
    }
}

/// 协商结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Negotiated {
    /// 实际得到的缓冲区大小（帧）
    pub buffer_frames: usize,
    /// 设备允许的缓冲区范围（min, max），查询不到时为 None
    pub buffer_range: Option<(usize, usize)>,
}

impl Negotiated {
    /// 核对设备实际给出的缓冲区，与请求不一致即为配置错误
    pub fn granted(
        requested: usize,
        granted: usize,
        buffer_range: Option<(usize, usize)>,
    ) -> Result<Self, DeviceError> {
        if granted != requested {
            return Err(DeviceError::BufferSize { requested, granted });
        }
        Ok(Self {
            buffer_frames: granted,
            buffer_range,
        })
    }
}

/// 设备给出的一段可写区域（裸描述）
///
/// 由 [`OutputDevice::map_region`] 返回，只在构造 [`BufferLease`] 时使用。
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    /// 区域起始地址（已加上 offset）
    pub addr: NonNull<u8>,
    /// 区域在环形缓冲区中的帧偏移
    pub offset: usize,
    /// 连续可写帧数
    pub frames: usize,
}

/// 输出设备契约
///
/// 调用顺序：`configure` → `set_start_threshold` → 循环
/// { `available_frames` / `lease_region` / `commit` } → `start`（一次）→ `drain` → `close`。
pub trait OutputDevice {
    /// 设备名（日志用）
    fn name(&self) -> &str;

    /// 协商硬件参数，返回实际得到的缓冲区大小
    fn configure(&mut self, params: &DeviceParams) -> Result<Negotiated, DeviceError>;

    /// 写满多少帧后硬件自动开始消费
    fn set_start_threshold(&mut self, frames: usize) -> Result<(), DeviceError>;

    /// 环形缓冲区当前空闲帧数
    ///
    /// 不阻塞、无副作用。出错（underrun / 断开）是致命的。
    fn available_frames(&mut self) -> Result<usize, DeviceError>;

    /// 取得当前写位置处最多 `frames_wanted` 帧的连续区域
    ///
    /// 实现必须保证：返回的地址在下一次 `map_region` 或 `commit_region`
    /// 之前有效，且指向至少 `frames * bytes_per_frame` 字节可写内存，
    /// 除硬件消费端外没有其它别名。写位置不前进。
    fn map_region(&mut self, frames_wanted: usize) -> Result<MappedRegion, DeviceError>;

    /// 提交 `offset` 处的 `frames` 帧，写位置前进
    fn commit_region(&mut self, offset: usize, frames: usize) -> Result<usize, DeviceError>;

    /// 显式触发硬件开始消费
    fn start(&mut self) -> Result<(), DeviceError>;

    /// 播放完缓冲区中剩余数据
    fn drain(&mut self) -> Result<(), DeviceError>;

    /// 释放设备
    fn close(&mut self) -> Result<(), DeviceError>;

    /// 每帧字节数（配置后有效）
    fn bytes_per_frame(&self) -> usize;

    /// 租用一段区域
    fn lease_region(&mut self, frames_wanted: usize) -> Result<BufferLease<'_, Self>, DeviceError>
    where
        Self: Sized,
    {
        let region = self.map_region(frames_wanted)?;
        let len = region.frames * self.bytes_per_frame();
        Ok(BufferLease {
            device: self,
            addr: region.addr,
            len,
            offset: region.offset,
            frames: region.frames,
            _region: PhantomData,
        })
    }
}

impl<D: OutputDevice + ?Sized> OutputDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn configure(&mut self, params: &DeviceParams) -> Result<Negotiated, DeviceError> {
        (**self).configure(params)
    }

    fn set_start_threshold(&mut self, frames: usize) -> Result<(), DeviceError> {
        (**self).set_start_threshold(frames)
    }

    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        (**self).available_frames()
    }

    fn map_region(&mut self, frames_wanted: usize) -> Result<MappedRegion, DeviceError> {
        (**self).map_region(frames_wanted)
    }

    fn commit_region(&mut self, offset: usize, frames: usize) -> Result<usize, DeviceError> {
        (**self).commit_region(offset, frames)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        (**self).start()
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        (**self).drain()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        (**self).close()
    }

    fn bytes_per_frame(&self) -> usize {
        (**self).bytes_per_frame()
    }
}

/// 一次循环独占的硬件缓冲区窗口
///
/// 生命周期被绑定在设备的可变借用上：不能跨迭代保留。
pub struct BufferLease<'a, D: OutputDevice> {
    device: &'a mut D,
    addr: NonNull<u8>,
    len: usize,
    offset: usize,
    frames: usize,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a, D: OutputDevice> BufferLease<'a, D> {
    /// 区域帧偏移
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 区域帧数
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// 可写字节视图
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: map_region 的契约保证 addr 开始的 len 字节在下一次
        // map_region / commit_region 前有效且无别名；租约持有设备的
        // 唯一可变借用，两者都不可能在租约存活期间被调用。
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }

    /// 提交前 `frames_written` 帧（不超过租到的帧数），归还区域
    pub fn commit(self, frames_written: usize) -> Result<usize, DeviceError> {
        let frames = frames_written.min(self.frames);
        self.device.commit_region(self.offset, frames)
    }

    /// 放弃该区域，不前进写位置
    pub fn discard(self) {}
}
