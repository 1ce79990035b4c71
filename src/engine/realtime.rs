//! 实时调度与内存锁定
//!
//! 都是尽力而为：失败只记录 warning，播放照常进行。

use std::io;

/// 把当前线程切换到 SCHED_FIFO
///
/// 通常需要 root 或 CAP_SYS_NICE。
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn set_realtime_priority(priority: i32) -> bool {
    let min = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    let priority = priority.clamp(min, max);

    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc == 0 {
        log::info!("Realtime priority set: SCHED_FIFO {}", priority);
        true
    } else {
        log::warn!(
            "Failed to set realtime priority {} ({}), using default scheduling",
            priority,
            io::Error::last_os_error()
        );
        false
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn set_realtime_priority(priority: i32) -> bool {
    log::warn!("SCHED_FIFO not available on this platform, ignoring priority {}", priority);
    false
}

/// 锁定缓冲区所在页，避免循环中发生 page fault
pub fn lock_memory(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let rc = unsafe { libc::mlock(buf.as_ptr() as *const libc::c_void, buf.len()) };
    if rc == 0 {
        log::debug!("Loop buffer locked: {} bytes", buf.len());
        true
    } else {
        log::warn!(
            "Failed to lock loop buffer memory ({})",
            io::Error::last_os_error()
        );
        false
    }
}

pub fn unlock_memory(buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    unsafe {
        libc::munlock(buf.as_ptr() as *const libc::c_void, buf.len());
    }
}
