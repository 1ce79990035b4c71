//! HRT Player Library
//!
//! 高精度定时的 PCM 播放引擎：固定频率循环、mmap 直写硬件缓冲区、
//! PI 控制器跟踪消费端时钟。

pub mod audio;
pub mod engine;
