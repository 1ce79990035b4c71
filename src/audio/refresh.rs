//! 内存刷新
//!
//! 提交给驱动前对待写区域做一次读回写：逐字读出再原样写回。
//! 样本值不变，可重复调用。使用 volatile 访问，编译器不能把它优化掉。

use std::ptr;

const WORD: usize = std::mem::size_of::<u64>();

/// 刷新 `region` 覆盖的内存
#[inline(never)]
pub fn refresh_memory(region: &mut [u8]) {
    let len = region.len();
    let base = region.as_mut_ptr();

    // 对齐前的头部逐字节处理
    let head = base.align_offset(WORD).min(len);
    for i in 0..head {
        // SAFETY: i < head <= len
        unsafe {
            let p = base.add(i);
            ptr::write_volatile(p, ptr::read_volatile(p));
        }
    }

    let words = (len - head) / WORD;
    for w in 0..words {
        // SAFETY: base + head 已按 u64 对齐，且 head + (w + 1) * WORD <= len
        unsafe {
            let p = base.add(head + w * WORD) as *mut u64;
            ptr::write_volatile(p, ptr::read_volatile(p));
        }
    }

    for i in (head + words * WORD)..len {
        // SAFETY: i < len
        unsafe {
            let p = base.add(i);
            ptr::write_volatile(p, ptr::read_volatile(p));
        }
    }
}
