//! 单调时钟与绝对时刻睡眠
//!
//! 整个调度模型依赖 CLOCK_MONOTONIC：
//! - 唤醒时刻通过累加得到，从不使用相对睡眠（避免累积漂移）
//! - `clock_nanosleep(TIMER_ABSTIME)` 被信号打断时重新等待同一时刻

use std::fmt;
use std::io;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// 单调时钟时间戳（秒 + 纳秒）
///
/// 不变量：`0 <= nsec < 1e9`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }.normalized()
    }

    pub fn from_micros(us: u64) -> Self {
        let sec = (us / 1_000_000) as i64;
        let nsec = ((us % 1_000_000) * 1_000) as i64;
        Self { sec, nsec }
    }

    fn normalized(mut self) -> Self {
        self.sec += self.nsec.div_euclid(NANOS_PER_SEC);
        self.nsec = self.nsec.rem_euclid(NANOS_PER_SEC);
        self
    }

    /// 向后（或向前，ns 为负时）偏移
    #[inline]
    pub fn add_nanos(self, ns: i64) -> Self {
        Self {
            sec: self.sec,
            nsec: self.nsec + ns,
        }
        .normalized()
    }

    /// `self - earlier`，单位纳秒
    #[inline]
    pub fn nanos_since(&self, earlier: &Timespec) -> i64 {
        (self.sec - earlier.sec) * NANOS_PER_SEC + (self.nsec - earlier.nsec)
    }

    #[inline]
    pub fn as_nanos(&self) -> i64 {
        self.sec * NANOS_PER_SEC + self.nsec
    }

    fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec as libc::time_t,
            tv_nsec: self.nsec as libc::c_long,
        }
    }

    fn from_libc(ts: libc::timespec) -> Self {
        Self::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }

    /// 时分秒格式
    pub fn hms(&self) -> Hms {
        Hms(*self)
    }
}

/// `hh:mm:ss.mmm uuu nnn`
impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hrs = self.sec / 3600;
        let min = (self.sec % 3600) / 60;
        let sec = self.sec % 60;
        let msec = self.nsec / 1_000_000;
        let usec = (self.nsec / 1_000) % 1_000;
        let nsec = self.nsec % 1_000;
        write!(
            f,
            "{:02}:{:02}:{:02}.{:03} {:03} {:03}",
            hrs, min, sec, msec, usec, nsec
        )
    }
}

/// `hh:mm:ss`
pub struct Hms(Timespec);

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.sec;
        write!(f, "{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
    }
}

/// 调度器使用的时钟
///
/// 只有两个操作：读当前时刻、睡到某个绝对时刻。
/// 测试中替换为不真正睡眠的实现。
pub trait Clock {
    fn now(&mut self) -> io::Result<Timespec>;

    /// 阻塞直到 `deadline`（已过去则立即返回）
    fn sleep_until(&mut self, deadline: Timespec) -> io::Result<()>;

    /// 相对睡眠，仅用于启动前的等待
    fn sleep_for(&mut self, duration: Timespec) -> io::Result<()> {
        let now = self.now()?;
        self.sleep_until(now.add_nanos(duration.as_nanos()))
    }
}

/// CLOCK_MONOTONIC
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&mut self) -> io::Result<Timespec> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Timespec::from_libc(ts))
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    fn sleep_until(&mut self, deadline: Timespec) -> io::Result<()> {
        let ts = deadline.to_libc();
        loop {
            // 返回值是错误码本身（不设置 errno）
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            };
            match rc {
                0 => return Ok(()),
                libc::EINTR => continue,
                code => return Err(io::Error::from_raw_os_error(code)),
            }
        }
    }

    // 没有 clock_nanosleep 的平台：退化为相对睡眠
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    fn sleep_until(&mut self, deadline: Timespec) -> io::Result<()> {
        let now = self.now()?;
        let remaining = deadline.nanos_since(&now);
        if remaining > 0 {
            std::thread::sleep(std::time::Duration::from_nanos(remaining as u64));
        }
        Ok(())
    }
}
