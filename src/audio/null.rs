//! 内存输出设备
//!
//! 行为与 mmap 硬件缓冲区一致的纯内存实现：
//! - 环形缓冲区大小即协商到的帧数，租约指向其中的连续区域
//! - 写满启动阈值或显式 `start` 后开始"消费"
//! - 消费可以手动推进（测试），也可以按单调时钟以标称采样率推进（`null` 设备）
//!
//! 消费追上写位置即为 underrun，`available_frames` 返回错误，与 ALSA 的 -EPIPE 对应。

use std::ptr::NonNull;

use super::device::{DeviceError, DeviceParams, MappedRegion, Negotiated, OutputDevice};
use super::timing::{Clock, MonotonicClock, Timespec};

/// 消费推进方式
#[derive(Debug, Clone, Copy)]
enum Consumer {
    /// 只在 `consume` 被调用时推进
    Manual,
    /// 按单调时钟以标称采样率推进
    Clocked,
}

/// 内存设备
pub struct NullDevice {
    name: String,
    consumer: Consumer,
    clock: MonotonicClock,
    ring: Vec<u8>,
    buffer_frames: usize,
    bytes_per_frame: usize,
    sample_rate: u32,
    configured: bool,
    start_threshold: usize,
    running: bool,
    /// 开始消费的时刻与当时已消费的帧数（Clocked 模式）
    started_at: Option<(Timespec, u64)>,
    /// 累计写入/消费帧数（单调递增）
    written: u64,
    consumed: u64,
    /// 被租出但未提交的区域
    leased: Option<(usize, usize)>,
    closed: bool,

    // 记录，供测试与会话报告使用
    commits: Vec<usize>,
    start_calls: Vec<u64>,
    drained: bool,
    capture: Option<Vec<u8>>,
    fail_next_avail: bool,
}

impl NullDevice {
    /// 按单调时钟消费的设备
    pub fn clocked() -> Self {
        Self::with_consumer("null", Consumer::Clocked, false)
    }

    /// 手动消费、记录所有写入数据的设备
    pub fn manual() -> Self {
        Self::with_consumer("null-manual", Consumer::Manual, true)
    }

    fn with_consumer(name: &str, consumer: Consumer, capture: bool) -> Self {
        Self {
            name: name.to_string(),
            consumer,
            clock: MonotonicClock,
            ring: Vec::new(),
            buffer_frames: 0,
            bytes_per_frame: 0,
            sample_rate: 0,
            configured: false,
            start_threshold: 0,
            running: false,
            started_at: None,
            written: 0,
            consumed: 0,
            leased: None,
            closed: false,
            commits: Vec::new(),
            start_calls: Vec::new(),
            drained: false,
            capture: capture.then(Vec::new),
            fail_next_avail: false,
        }
    }

    /// 手动推进消费（仅在运行中生效），返回实际消费帧数
    pub fn consume(&mut self, frames: usize) -> usize {
        if !self.running {
            return 0;
        }
        let filled = (self.written - self.consumed) as usize;
        let n = frames.min(filled);
        self.consumed += n as u64;
        n
    }

    /// 下一次 `available_frames` 返回错误
    pub fn fail_next_avail(&mut self) {
        self.fail_next_avail = true;
    }

    /// 每次提交的帧数
    pub fn commits(&self) -> &[usize] {
        &self.commits
    }

    /// 每次显式 `start` 时已写入的帧数
    pub fn start_calls(&self) -> &[u64] {
        &self.start_calls
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 所有提交过的数据（仅 manual 模式记录）
    pub fn written_bytes(&self) -> &[u8] {
        self.capture.as_deref().unwrap_or(&[])
    }

    fn filled(&self) -> u64 {
        self.written - self.consumed
    }

    /// Clocked 模式下按时间推进消费
    fn advance(&mut self) -> Result<(), DeviceError> {
        if !matches!(self.consumer, Consumer::Clocked) {
            return Ok(());
        }
        let Some((t0, consumed_at_start)) = self.started_at else {
            return Ok(());
        };
        let now = self
            .clock
            .now()
            .map_err(|e| DeviceError::runtime("avail", e.to_string()))?;
        let elapsed_ns = now.nanos_since(&t0).max(0) as f64;
        let target = consumed_at_start + (elapsed_ns * self.sample_rate as f64 / 1e9) as u64;

        if target > self.written {
            self.consumed = self.written;
            self.running = false;
            return Err(DeviceError::runtime("avail", "buffer underrun"));
        }
        self.consumed = self.consumed.max(target);
        Ok(())
    }

    fn begin_consuming(&mut self) -> Result<(), DeviceError> {
        self.running = true;
        if matches!(self.consumer, Consumer::Clocked) {
            let now = self
                .clock
                .now()
                .map_err(|e| DeviceError::runtime("start", e.to_string()))?;
            self.started_at = Some((now, self.consumed));
        }
        Ok(())
    }

    fn ensure_open(&self, op: &'static str) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::runtime(op, "device closed"));
        }
        if !self.configured {
            return Err(DeviceError::runtime(op, "device not configured"));
        }
        Ok(())
    }
}

impl OutputDevice for NullDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &DeviceParams) -> Result<Negotiated, DeviceError> {
        let bpf = params.format.bytes_per_frame();
        if bpf == 0 {
            return Err(DeviceError::config("channels", "zero bytes per frame"));
        }
        if params.format.sample_rate == 0 {
            return Err(DeviceError::config("rate", "sample rate must be positive"));
        }
        if params.buffer_frames == 0 {
            return Err(DeviceError::config("buffer size", "buffer must hold at least one frame"));
        }

        self.bytes_per_frame = bpf;
        self.sample_rate = params.format.sample_rate;
        self.buffer_frames = params.buffer_frames;
        self.ring = vec![0u8; params.buffer_frames * bpf];
        self.start_threshold = params.buffer_frames;
        self.configured = true;

        Negotiated::granted(
            params.buffer_frames,
            params.buffer_frames,
            Some((1, usize::MAX / bpf)),
        )
    }

    fn set_start_threshold(&mut self, frames: usize) -> Result<(), DeviceError> {
        self.ensure_open("start threshold")?;
        self.start_threshold = frames;
        Ok(())
    }

    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        self.ensure_open("avail")?;
        if std::mem::take(&mut self.fail_next_avail) {
            return Err(DeviceError::runtime("avail", "injected fault"));
        }
        self.advance()?;
        Ok(self.buffer_frames - self.filled() as usize)
    }

    fn map_region(&mut self, frames_wanted: usize) -> Result<MappedRegion, DeviceError> {
        self.ensure_open("mmap begin")?;
        let free = self.buffer_frames - self.filled() as usize;
        let offset = (self.written % self.buffer_frames as u64) as usize;
        let contiguous = self.buffer_frames - offset;
        let frames = frames_wanted.min(free).min(contiguous);

        let byte_offset = offset * self.bytes_per_frame;
        let addr = NonNull::new(self.ring[byte_offset..].as_mut_ptr())
            .ok_or_else(|| DeviceError::runtime("mmap begin", "no buffer address"))?;

        self.leased = Some((offset, frames));
        Ok(MappedRegion {
            addr,
            offset,
            frames,
        })
    }

    fn commit_region(&mut self, offset: usize, frames: usize) -> Result<usize, DeviceError> {
        self.ensure_open("mmap commit")?;
        match self.leased.take() {
            Some((leased_offset, leased_frames)) if leased_offset == offset && frames <= leased_frames => {}
            _ => return Err(DeviceError::runtime("mmap commit", "commit does not match lease")),
        }

        if let Some(capture) = self.capture.as_mut() {
            let start = offset * self.bytes_per_frame;
            let end = start + frames * self.bytes_per_frame;
            capture.extend_from_slice(&self.ring[start..end]);
        }

        self.written += frames as u64;
        self.commits.push(frames);

        if !self.running && self.filled() >= self.start_threshold as u64 {
            self.begin_consuming()?;
        }
        Ok(frames)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.ensure_open("start")?;
        self.start_calls.push(self.written);
        if !self.running {
            self.begin_consuming()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        self.ensure_open("drain")?;
        if matches!(self.consumer, Consumer::Clocked) {
            let remaining = self.filled();
            if remaining > 0 && self.sample_rate > 0 {
                let us = remaining * 1_000_000 / self.sample_rate as u64;
                self.clock
                    .sleep_for(Timespec::from_micros(us))
                    .map_err(|e| DeviceError::runtime("drain", e.to_string()))?;
            }
        }
        self.consumed = self.written;
        self.running = false;
        self.drained = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.closed = true;
        self.leased = None;
        Ok(())
    }

    fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }
}
