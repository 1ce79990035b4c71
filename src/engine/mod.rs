//! 播放引擎
//!
//! 单线程实时循环，每秒固定次数：
//! 读一块输入 → 测量缓冲区并喂给速率控制器 → 租用设备区域并拷入 →
//! 刷新内存 → 睡到绝对唤醒时刻 → 提交。
//!
//! 唯一的阻塞点是输入读取和绝对时刻睡眠。唤醒时刻由
//! `next_wakeup += interval` 累加得到，循环体本身的耗时不会累积成漂移。
//!
//! 注意：读取发生在睡眠修正之前。一次异常缓慢的读会直接拉长该次循环，
//! 控制器只修正时钟速率偏差，不补偿这种调度抖动。

pub mod config;
pub mod controller;
pub mod realtime;

use std::io;

use crate::audio::refresh::refresh_memory;
use crate::audio::{
    read_exact_or_eof, Clock, DeviceError, OutputDevice, PcmSource, PlaybackStats, StatsReport,
    Timespec,
};

pub use config::{ConfigError, ControllerParams, PlaybackConfig, PlaybackRequest, StartupDelay};
pub use controller::{Correction, RateController};

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// 等待上游填充管道
    WaitingForPrefill,
    /// 写入但尚未启动硬件
    Filling,
    /// 稳态播放
    Playing,
    /// 输入结束，排空设备
    Draining,
    /// 设备已关闭
    Closed,
}

/// 播放错误
///
/// 所有错误都是致命的，会话立即终止。
#[derive(Debug, thiserror::Error)]
pub enum PlayError {
    #[error("must specify --host and --port, --input or --stdin")]
    MissingSource,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("error setting up input ({what}): {source}")]
    Source {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("error getting monotonic clock ({op}): {source}")]
    Clock {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("error waiting for pipeline data: {0}")]
    PipelineWait(#[source] io::Error),

    #[error("error reading input stream: {0}")]
    Io(#[source] io::Error),
}

impl PlayError {
    fn clock(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Clock { op, source }
    }

    /// 进程退出码，每类致命错误一个
    ///
    /// 2 留给 clap 的参数解析错误。
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 3,
            Self::MissingSource => 4,
            Self::Source { .. } => 5,
            Self::Device(DeviceError::Open { .. }) => 6,
            Self::Device(e) if e.is_configuration() => 8,
            Self::Clock { .. } => 19,
            Self::PipelineWait(_) => 20,
            Self::Io(_) => 21,
            Self::Device(_) => 22,
        }
    }
}

/// 播放调度器
pub struct Scheduler<'a, S: PcmSource, D: OutputDevice, C: Clock> {
    config: &'a PlaybackConfig,
    source: S,
    device: D,
    clock: C,
    controller: RateController,
    stats: PlaybackStats,
    state: PlaybackState,
    /// 每次循环的读缓冲区（一块）
    scratch: Vec<u8>,
    memory_locked: bool,
    count: u64,
    next_wakeup: Timespec,
    started: bool,
}

impl<'a, S: PcmSource, D: OutputDevice, C: Clock> Scheduler<'a, S, D, C> {
    /// 配置设备并准备调度
    pub fn new(config: &'a PlaybackConfig, source: S, mut device: D, clock: C) -> Result<Self, PlayError> {
        let negotiated = device.configure(&config.device_params())?;
        if let Some((min, max)) = negotiated.buffer_range {
            log::debug!("Device buffer range {} .. {} frames", min, max);
        }
        if negotiated.buffer_frames != config.hw_buffer_frames() {
            return Err(DeviceError::BufferSize {
                requested: config.hw_buffer_frames(),
                granted: negotiated.buffer_frames,
            }
            .into());
        }
        device.set_start_threshold(config.hw_buffer_frames() / 2)?;

        log::info!(
            "Step size is {} nsec, {} frames per loop, hw buffer {} frames (requested {})",
            config.nominal_interval_ns(),
            config.frames_per_loop(),
            config.hw_buffer_frames(),
            config.requested_buffer_frames()
        );
        log::info!("{}", config.format());

        let scratch = vec![0u8; config.bytes_per_loop()];
        let memory_locked = realtime::lock_memory(&scratch);

        Ok(Self {
            config,
            source,
            device,
            clock,
            controller: RateController::new(config),
            stats: PlaybackStats::new(),
            state: PlaybackState::WaitingForPrefill,
            scratch,
            memory_locked,
            count: 0,
            next_wakeup: Timespec::default(),
            started: false,
        })
    }

    /// 跑完整个会话，返回统计报告
    pub fn run(&mut self) -> Result<StatsReport, PlayError> {
        while self.state != PlaybackState::Closed {
            self.step()?;
        }
        Ok(self.report())
    }

    /// 推进一步：启动等待、一次循环或排空
    pub fn step(&mut self) -> Result<PlaybackState, PlayError> {
        match self.state {
            PlaybackState::WaitingForPrefill => {
                self.wait_for_pipeline()?;
                self.state = PlaybackState::Filling;
            }
            PlaybackState::Filling | PlaybackState::Playing => self.iterate()?,
            PlaybackState::Draining => self.finish()?,
            PlaybackState::Closed => {}
        }
        Ok(self.state)
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// 已执行的循环次数
    pub fn loop_count(&self) -> u64 {
        self.count
    }

    pub fn controller(&self) -> &RateController {
        &self.controller
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn report(&self) -> StatsReport {
        self.stats.report(self.config.format().sample_rate)
    }

    /// 启动前等待上游
    fn wait_for_pipeline(&mut self) -> Result<(), PlayError> {
        let now = self.clock.now().map_err(PlayError::clock("pipeline wait"))?;
        log::info!("Wait for pipeline ({})", now);

        let delay = match self.config.startup() {
            StartupDelay::Fixed(us) => Timespec::from_micros(us),
            StartupDelay::Pipeline => {
                self.source.wait_readable().map_err(PlayError::PipelineWait)?;
                let capacity = self.source.pipeline_capacity().unwrap_or(0);
                let buffered = self.source.buffered_bytes().unwrap_or(0);
                let residual = capacity.saturating_sub(buffered);
                let fmt = self.config.format();
                let us = fmt.frames_to_micros(fmt.frames_in(residual));
                log::debug!(
                    "Pipeline capacity {} bytes, {} buffered, waiting {} us",
                    capacity,
                    buffered,
                    us
                );
                Timespec::from_micros(us)
            }
        };
        if delay.as_nanos() > 0 {
            self.clock
                .sleep_for(delay)
                .map_err(PlayError::clock("pipeline wait"))?;
        }

        self.next_wakeup = self.clock.now().map_err(PlayError::clock("pipeline ready"))?;
        log::info!("Pipeline ready    ({})", self.next_wakeup);
        Ok(())
    }

    /// 一次循环
    fn iterate(&mut self) -> Result<(), PlayError> {
        self.count += 1;

        // 半个缓冲区写满时显式启动
        if self.count == self.config.start_count() {
            self.start_device()?;
            self.state = PlaybackState::Playing;
        }

        let block = self.scratch.len();
        let outcome = read_exact_or_eof(&mut self.source, &mut self.scratch).map_err(PlayError::Io)?;
        self.stats.on_loop();
        self.stats.on_read(outcome.bytes, outcome.attempts);

        let fmt = *self.config.format();
        let frames = fmt.frames_in(outcome.bytes);
        if outcome.is_eof(block) {
            log::info!(
                "Incomplete read (pipe end): read={} targeted={}",
                outcome.bytes,
                block
            );
        } else if outcome.attempts > 1 {
            log::warn!("Multiple reads required (nloops={})", outcome.attempts);
        }
        if frames == 0 {
            self.state = PlaybackState::Draining;
            return Ok(());
        }

        let avail = self.device.available_frames()?;
        self.stats.on_avail(avail);
        if let Some(c) = self.controller.observe(self.count, avail) {
            self.stats.on_correction(c.extra_ns);
            log::debug!(
                "({}) buf: {:6.1} e: {:6.1} ei: {:6.1} dt: {:4} ns ({:+6.4}%)",
                self.next_wakeup.hms(),
                c.average,
                c.error,
                c.integrated,
                c.extra_ns,
                c.deviation * 100.0
            );
        }

        let frames_per_loop = self.config.frames_per_loop();
        let mut lease = self.device.lease_region(frames_per_loop)?;
        if lease.frames() < frames {
            return Err(DeviceError::runtime(
                "mmap begin",
                format!("device offered {} frames, {} needed", lease.frames(), frames),
            )
            .into());
        }

        let bytes = frames * fmt.bytes_per_frame();
        let region = &mut lease.as_mut_slice()[..bytes];
        region.copy_from_slice(&self.scratch[..bytes]);
        refresh_memory(region);

        self.next_wakeup = self.next_wakeup.add_nanos(self.controller.interval_ns().max(1));
        self.clock
            .sleep_until(self.next_wakeup)
            .map_err(PlayError::clock("sleep"))?;

        refresh_memory(&mut lease.as_mut_slice()[..bytes]);
        let committed = lease.commit(frames)?;
        self.stats.on_commit(committed);

        if outcome.is_eof(block) {
            self.state = PlaybackState::Draining;
        }
        Ok(())
    }

    fn start_device(&mut self) -> Result<(), PlayError> {
        self.device.start()?;
        self.started = true;
        if log::log_enabled!(log::Level::Info) {
            let now = self.clock.now().map_err(PlayError::clock("start"))?;
            log::info!("Start playback    ({})", now);
        }
        Ok(())
    }

    /// 排空并关闭设备
    fn finish(&mut self) -> Result<(), PlayError> {
        // 输入在半个缓冲区写满前就结束了
        if !self.started {
            self.start_device()?;
        }
        self.device.drain()?;
        self.device.close()?;
        if self.memory_locked {
            realtime::unlock_memory(&self.scratch);
            self.memory_locked = false;
        }
        self.state = PlaybackState::Closed;

        let report = self.report();
        log::info!("Loops: {}, bytes: {}", report.loops, report.bytes);
        Ok(())
    }
}

impl<S: PcmSource, D: OutputDevice, C: Clock> Drop for Scheduler<'_, S, D, C> {
    fn drop(&mut self) {
        if self.memory_locked {
            realtime::unlock_memory(&self.scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{DeviceParams, MappedRegion, Negotiated};
    use crate::audio::source::tests::ChunkedSource;
    use crate::audio::timing::tests::ManualClock;
    use crate::audio::{NullDevice, PcmFormat, SampleEncoding};

    const FPL: usize = 48;
    const BPF: usize = 4;

    fn config(buffer: usize, cadence: u32, avg: u32, startup: StartupDelay) -> PlaybackConfig {
        PlaybackConfig::new(PlaybackRequest {
            format: PcmFormat::new(SampleEncoding::S16Le, 2, 48_000),
            loops_per_second: 1000,
            hw_buffer_frames: buffer,
            startup,
            controller: ControllerParams {
                loops_avg: avg,
                loops_cadence: cadence,
                ..ControllerParams::default()
            },
            ..PlaybackRequest::default()
        })
        .unwrap()
    }

    fn pcm(frames: usize) -> Vec<u8> {
        (0..frames * BPF).map(|i| (i % 253) as u8).collect()
    }

    fn clock_at(sec: i64) -> ManualClock {
        ManualClock {
            now: Timespec::new(sec, 0),
            ..ManualClock::default()
        }
    }

    /// 每次查询空闲帧数前先消费固定帧数，模拟恒速 DAC
    struct SteadyDac {
        inner: NullDevice,
        per_loop: usize,
    }

    impl OutputDevice for SteadyDac {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn configure(&mut self, params: &DeviceParams) -> Result<Negotiated, DeviceError> {
            self.inner.configure(params)
        }
        fn set_start_threshold(&mut self, frames: usize) -> Result<(), DeviceError> {
            self.inner.set_start_threshold(frames)
        }
        fn available_frames(&mut self) -> Result<usize, DeviceError> {
            self.inner.consume(self.per_loop);
            self.inner.available_frames()
        }
        fn map_region(&mut self, frames_wanted: usize) -> Result<MappedRegion, DeviceError> {
            self.inner.map_region(frames_wanted)
        }
        fn commit_region(&mut self, offset: usize, frames: usize) -> Result<usize, DeviceError> {
            self.inner.commit_region(offset, frames)
        }
        fn start(&mut self) -> Result<(), DeviceError> {
            self.inner.start()
        }
        fn drain(&mut self) -> Result<(), DeviceError> {
            self.inner.drain()
        }
        fn close(&mut self) -> Result<(), DeviceError> {
            self.inner.close()
        }
        fn bytes_per_frame(&self) -> usize {
            self.inner.bytes_per_frame()
        }
    }

    #[test]
    fn test_three_blocks_then_eof() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let data = pcm(3 * FPL);
        let src = ChunkedSource::new(data.clone(), 1 << 16);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(100)).unwrap();

        let report = sched.run().unwrap();
        assert_eq!(sched.state(), PlaybackState::Closed);

        let dev = sched.device();
        assert_eq!(dev.commits(), &[FPL, FPL, FPL]);
        assert_eq!(dev.written_bytes(), &data[..]);
        assert!(dev.is_drained());
        assert!(dev.is_closed());
        // 输入在启动点之前结束，排空时补发一次 start
        assert_eq!(dev.start_calls().len(), 1);

        assert_eq!(report.loops, 4);
        assert_eq!(report.bytes, data.len() as u64);
        assert_eq!(report.frames_committed, 3 * FPL as u64);
    }

    #[test]
    fn test_state_sequence() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let src = ChunkedSource::new(pcm(FPL), 1 << 16);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        assert_eq!(sched.state(), PlaybackState::WaitingForPrefill);
        assert_eq!(sched.step().unwrap(), PlaybackState::Filling);
        assert_eq!(sched.step().unwrap(), PlaybackState::Filling);
        assert_eq!(sched.step().unwrap(), PlaybackState::Draining);
        assert_eq!(sched.step().unwrap(), PlaybackState::Closed);
        assert_eq!(sched.step().unwrap(), PlaybackState::Closed);
    }

    #[test]
    fn test_start_issued_once_at_start_count() {
        let cfg = config(4800, 4000, 16, StartupDelay::Fixed(0));
        let start = cfg.start_count();
        assert_eq!(start, 50);

        let src = ChunkedSource::new(pcm(80 * FPL), 1 << 16);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();
        sched.step().unwrap();

        while sched.loop_count() < start - 1 {
            assert_eq!(sched.step().unwrap(), PlaybackState::Filling);
        }
        assert!(sched.device().start_calls().is_empty());

        assert_eq!(sched.step().unwrap(), PlaybackState::Playing);
        assert_eq!(sched.loop_count(), start);
        // 启动发生在本次提交之前
        assert_eq!(sched.device().start_calls(), &[(start - 1) * FPL as u64]);

        sched.run().unwrap();
        assert_eq!(sched.device().start_calls().len(), 1);
        assert_eq!(sched.device().commits().len(), 80);
    }

    #[test]
    fn test_deadlines_advance_by_nominal_interval() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(250));
        let src = ChunkedSource::new(pcm(4 * FPL), 1 << 16);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(5)).unwrap();
        sched.run().unwrap();

        let d = &sched.clock().deadlines;
        // 启动等待 250us，然后 4 次循环
        assert_eq!(d.len(), 5);
        assert_eq!(d[0], Timespec::new(5, 250_000));
        for w in d[1..].windows(2) {
            assert_eq!(w[1].nanos_since(&w[0]), 1_000_000);
        }
        assert_eq!(d[1].nanos_since(&d[0]), 1_000_000);
    }

    #[test]
    fn test_short_reads_still_fill_blocks() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let data = pcm(3 * FPL);
        // 每次 read 只给 7 字节
        let src = ChunkedSource::new(data.clone(), 7);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        let report = sched.run().unwrap();
        assert_eq!(sched.device().commits(), &[FPL, FPL, FPL]);
        assert_eq!(sched.device().written_bytes(), &data[..]);
        // 最后一次只读到 EOF，不算多次读取
        assert_eq!(report.multi_read_loops, 3);
    }

    #[test]
    fn test_short_final_block_written_as_is() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        // 两块半，外加半帧尾巴
        let mut data = pcm(2 * FPL + FPL / 2);
        data.extend_from_slice(&[1, 2]);
        let src = ChunkedSource::new(data.clone(), 1 << 16);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        sched.run().unwrap();
        assert_eq!(sched.device().commits(), &[FPL, FPL, FPL / 2]);
        assert_eq!(sched.device().written_bytes(), &data[..data.len() - 2]);
        // 短读本身就结束了会话，不再多读一次
        assert_eq!(sched.loop_count(), 3);
    }

    #[test]
    fn test_empty_stream_drains_cleanly() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let src = ChunkedSource::new(Vec::new(), 1 << 16);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        let report = sched.run().unwrap();
        assert!(sched.device().commits().is_empty());
        assert!(sched.device().is_closed());
        assert_eq!(report.loops, 1);
    }

    #[test]
    fn test_controller_changes_deadline_spacing() {
        let cfg = config(4800, 40, 4, StartupDelay::Fixed(0));
        let src = ChunkedSource::new(pcm(200 * FPL), 1 << 16);
        // DAC 每循环多消费 2 帧：空闲帧数高于目标
        let dev = SteadyDac {
            inner: NullDevice::manual(),
            per_loop: FPL + 2,
        };
        let mut sched = Scheduler::new(&cfg, src, dev, clock_at(1)).unwrap();
        let report = sched.run().unwrap();

        assert!(report.corrections > 0);
        assert!(sched.controller().extra_ns() < 0);

        let d = &sched.clock().deadlines;
        let spacing: Vec<i64> = d.windows(2).map(|w| w[1].nanos_since(&w[0])).collect();
        // spacing[i] 是第 i + 2 次循环的间隔，第 79 次循环起使用修正值
        assert!(spacing[..77].iter().all(|&s| s == 1_000_000));
        assert!(spacing[77..].iter().all(|&s| s < 1_000_000), "{:?}", &spacing[75..90]);
        // 唤醒时刻严格递增
        assert!(spacing.iter().all(|&s| s > 0));
    }

    #[test]
    fn test_device_fault_is_fatal() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let src = ChunkedSource::new(pcm(10 * FPL), 1 << 16);
        let mut dev = NullDevice::manual();
        dev.fail_next_avail();
        let mut sched = Scheduler::new(&cfg, src, dev, clock_at(1)).unwrap();

        let err = sched.run().unwrap_err();
        assert!(matches!(err, PlayError::Device(DeviceError::Runtime { .. })));
        assert_eq!(err.exit_code(), 22);
        assert!(sched.device().commits().is_empty());
    }

    #[test]
    fn test_read_error_is_fatal() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let mut src = ChunkedSource::new(pcm(10 * FPL), FPL * BPF);
        src.fail_at = Some(3);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        let err = sched.run().unwrap_err();
        assert!(matches!(err, PlayError::Io(_)));
        assert_eq!(err.exit_code(), 21);
        assert_eq!(sched.device().commits().len(), 2);
    }

    #[test]
    fn test_clock_failure_is_fatal() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let src = ChunkedSource::new(pcm(FPL), 1 << 16);
        let clock = ManualClock {
            fail_now: true,
            ..ManualClock::default()
        };
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock).unwrap();

        let err = sched.step().unwrap_err();
        assert!(matches!(err, PlayError::Clock { .. }));
        assert_eq!(err.exit_code(), 19);
    }

    #[test]
    fn test_overrun_is_fatal() {
        // 缓冲区 10 块，DAC 不消费
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(0));
        let src = ChunkedSource::new(pcm(20 * FPL), 1 << 16);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        let err = sched.run().unwrap_err();
        assert!(matches!(err, PlayError::Device(DeviceError::Runtime { op: "mmap begin", .. })));
        assert_eq!(sched.device().commits().len(), 10);
    }

    /// 上游缓冲信息可查询的输入
    struct QueuedSource {
        inner: ChunkedSource,
        capacity: Option<usize>,
        buffered: Option<usize>,
        readable: bool,
        wait_calls: u32,
    }

    impl QueuedSource {
        fn new(data: Vec<u8>, capacity: Option<usize>, buffered: Option<usize>) -> Self {
            Self {
                inner: ChunkedSource::new(data, 1 << 16),
                capacity,
                buffered,
                readable: true,
                wait_calls: 0,
            }
        }
    }

    impl io::Read for QueuedSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            io::Read::read(&mut self.inner, buf)
        }
    }

    impl PcmSource for QueuedSource {
        fn wait_readable(&mut self) -> io::Result<()> {
            self.wait_calls += 1;
            if self.readable {
                Ok(())
            } else {
                Err(io::Error::from_raw_os_error(libc::EBADF))
            }
        }

        fn pipeline_capacity(&self) -> Option<usize> {
            self.capacity
        }

        fn buffered_bytes(&self) -> Option<usize> {
            self.buffered
        }
    }

    #[test]
    fn test_pipeline_wait_sleeps_for_residual_fill() {
        let cfg = config(480, 4000, 16, StartupDelay::Pipeline);
        // 64 KiB 管道已有 16 KiB：剩 49152 字节 = 12288 帧 = 256 ms
        let src = QueuedSource::new(pcm(2 * FPL), Some(65_536), Some(16_384));
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(10)).unwrap();

        assert_eq!(sched.step().unwrap(), PlaybackState::Filling);
        assert_eq!(sched.clock().deadlines, vec![Timespec::new(10, 256_000_000)]);

        sched.run().unwrap();
        let d = &sched.clock().deadlines;
        assert_eq!(
            d,
            &vec![
                Timespec::new(10, 256_000_000),
                Timespec::new(10, 257_000_000),
                Timespec::new(10, 258_000_000),
            ]
        );
        assert_eq!(sched.source.wait_calls, 1);
    }

    #[test]
    fn test_pipeline_wait_full_or_unknown_skips_sleep() {
        let cfg = config(480, 4000, 16, StartupDelay::Pipeline);

        // 已经缓冲满
        let src = QueuedSource::new(pcm(FPL), Some(65_536), Some(65_536));
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(3)).unwrap();
        sched.step().unwrap();
        assert!(sched.clock().deadlines.is_empty());

        // 容量未知
        let src = QueuedSource::new(pcm(FPL), None, None);
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(3)).unwrap();
        sched.step().unwrap();
        assert!(sched.clock().deadlines.is_empty());
        sched.run().unwrap();
        assert_eq!(sched.clock().deadlines, vec![Timespec::new(3, 1_000_000)]);
    }

    #[test]
    fn test_pipeline_wait_failure_is_fatal() {
        let cfg = config(480, 4000, 16, StartupDelay::Pipeline);
        let mut src = QueuedSource::new(pcm(FPL), Some(65_536), Some(0));
        src.readable = false;
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        let err = sched.run().unwrap_err();
        assert!(matches!(err, PlayError::PipelineWait(_)));
        assert_eq!(err.exit_code(), 20);
        assert_eq!(sched.state(), PlaybackState::WaitingForPrefill);
        assert!(sched.device().commits().is_empty());
    }

    #[test]
    fn test_fixed_startup_skips_pipeline_queries() {
        let cfg = config(480, 4000, 16, StartupDelay::Fixed(1_000));
        let mut src = QueuedSource::new(pcm(FPL), Some(65_536), Some(0));
        src.readable = false;
        let mut sched = Scheduler::new(&cfg, src, NullDevice::manual(), clock_at(1)).unwrap();

        sched.run().unwrap();
        assert_eq!(sched.source.wait_calls, 0);
        assert_eq!(sched.clock().deadlines[0], Timespec::new(1, 1_000_000));
    }

    #[test]
    fn test_exit_codes_distinct() {
        let errors = [
            PlayError::Config(ConfigError::NotPositive("sample rate")),
            PlayError::MissingSource,
            PlayError::Source {
                what: "connect",
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
            PlayError::Device(DeviceError::Open {
                name: "hw:9".into(),
                reason: "no such card".into(),
            }),
            PlayError::Device(DeviceError::config("rate", "unsupported")),
            PlayError::Clock {
                op: "sleep",
                source: io::Error::from_raw_os_error(libc::EINVAL),
            },
            PlayError::PipelineWait(io::Error::from(io::ErrorKind::BrokenPipe)),
            PlayError::Io(io::Error::from(io::ErrorKind::ConnectionReset)),
            PlayError::Device(DeviceError::runtime("avail", "EPIPE")),
        ];
        let mut codes: Vec<u8> = errors.iter().map(PlayError::exit_code).collect();
        // 0 是成功，2 是 clap 的参数错误
        assert!(codes.iter().all(|&c| c != 0 && c != 2), "{:?}", codes);
        assert_eq!(errors[0].exit_code(), 3);
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
