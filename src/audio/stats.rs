//! 播放统计
//!
//! 调度循环是单线程的，统计直接用普通字段累加，
//! 每次循环只做几次整数比较，会话结束时生成报告。

use std::fmt;

/// 会话统计收集器
#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    loops: u64,
    bytes: u64,
    frames_committed: u64,
    /// 需要多次 read 才凑满一块的循环数
    multi_read_loops: u64,
    /// 单次循环中最多的 read 次数
    max_reads_per_loop: u32,
    /// 观察到的空闲帧数
    avail_min: Option<usize>,
    avail_max: Option<usize>,
    corrections: u64,
    last_extra_ns: i64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次循环
    #[inline]
    pub fn on_loop(&mut self) {
        self.loops += 1;
    }

    /// 记录一次块读取
    #[inline]
    pub fn on_read(&mut self, bytes: usize, attempts: u32) {
        self.bytes += bytes as u64;
        if attempts > 1 {
            self.multi_read_loops += 1;
        }
        self.max_reads_per_loop = self.max_reads_per_loop.max(attempts);
    }

    /// 记录空闲帧数
    #[inline]
    pub fn on_avail(&mut self, avail: usize) {
        self.avail_min = Some(self.avail_min.map_or(avail, |m| m.min(avail)));
        self.avail_max = Some(self.avail_max.map_or(avail, |m| m.max(avail)));
    }

    #[inline]
    pub fn on_commit(&mut self, frames: usize) {
        self.frames_committed += frames as u64;
    }

    #[inline]
    pub fn on_correction(&mut self, extra_ns: i64) {
        self.corrections += 1;
        self.last_extra_ns = extra_ns;
    }

    /// 生成报告
    pub fn report(&self, sample_rate: u32) -> StatsReport {
        let played_secs = if sample_rate > 0 {
            self.frames_committed as f64 / sample_rate as f64
        } else {
            0.0
        };
        StatsReport {
            loops: self.loops,
            bytes: self.bytes,
            frames_committed: self.frames_committed,
            played_secs,
            multi_read_loops: self.multi_read_loops,
            max_reads_per_loop: self.max_reads_per_loop,
            avail_min: self.avail_min.unwrap_or(0),
            avail_max: self.avail_max.unwrap_or(0),
            corrections: self.corrections,
            last_extra_ns: self.last_extra_ns,
        }
    }
}

/// 统计报告
#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub loops: u64,
    pub bytes: u64,
    pub frames_committed: u64,
    pub played_secs: f64,
    pub multi_read_loops: u64,
    pub max_reads_per_loop: u32,
    pub avail_min: usize,
    pub avail_max: usize,
    pub corrections: u64,
    pub last_extra_ns: i64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Loops: {}, bytes: {}", self.loops, self.bytes)?;
        writeln!(
            f,
            "Frames committed: {} ({:.1} s)",
            self.frames_committed, self.played_secs
        )?;
        writeln!(
            f,
            "Loops needing multiple reads: {} (max {} reads)",
            self.multi_read_loops, self.max_reads_per_loop
        )?;
        writeln!(
            f,
            "Free frames in device buffer: min {}, max {}",
            self.avail_min, self.avail_max
        )?;
        write!(
            f,
            "Rate corrections: {} (last {} ns)",
            self.corrections, self.last_extra_ns
        )
    }
}
