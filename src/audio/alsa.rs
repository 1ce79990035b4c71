//! ALSA mmap 输出
//!
//! 直接写入驱动的 mmap 区域（SND_PCM_ACCESS_MMAP_INTERLEAVED）：
//! `snd_pcm_mmap_begin` 给出写位置地址，原地写入，`snd_pcm_mmap_commit` 提交。
//! 推荐使用 `hw:X,Y` 硬件设备，避免插件层的额外拷贝。

use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_uint};
use std::ptr::{self, NonNull};

use alsa_sys as sys;

use super::device::{DeviceError, DeviceParams, MappedRegion, Negotiated, OutputDevice};
use super::format::SampleEncoding;

fn strerror(code: c_int) -> String {
    // SAFETY: snd_strerror 返回静态字符串
    unsafe {
        let s = sys::snd_strerror(code);
        if s.is_null() {
            format!("ALSA error {}", code)
        } else {
            CStr::from_ptr(s).to_string_lossy().into_owned()
        }
    }
}

fn alsa_format(encoding: SampleEncoding) -> sys::snd_pcm_format_t {
    match encoding {
        SampleEncoding::S16Le => sys::SND_PCM_FORMAT_S16_LE,
        SampleEncoding::S24Le => sys::SND_PCM_FORMAT_S24_LE,
        SampleEncoding::S24_3Le => sys::SND_PCM_FORMAT_S24_3LE,
        SampleEncoding::S32Le => sys::SND_PCM_FORMAT_S32_LE,
    }
}

/// hw_params 的 RAII 包装
struct HwParams(*mut sys::snd_pcm_hw_params_t);

impl HwParams {
    fn new() -> Result<Self, DeviceError> {
        let mut p = ptr::null_mut();
        let rc = unsafe { sys::snd_pcm_hw_params_malloc(&mut p) };
        if rc < 0 || p.is_null() {
            return Err(DeviceError::config("hw params", strerror(rc)));
        }
        Ok(Self(p))
    }
}

impl Drop for HwParams {
    fn drop(&mut self) {
        unsafe { sys::snd_pcm_hw_params_free(self.0) };
    }
}

/// sw_params 的 RAII 包装
struct SwParams(*mut sys::snd_pcm_sw_params_t);

impl SwParams {
    fn new() -> Result<Self, DeviceError> {
        let mut p = ptr::null_mut();
        let rc = unsafe { sys::snd_pcm_sw_params_malloc(&mut p) };
        if rc < 0 || p.is_null() {
            return Err(DeviceError::config("sw params", strerror(rc)));
        }
        Ok(Self(p))
    }
}

impl Drop for SwParams {
    fn drop(&mut self) {
        unsafe { sys::snd_pcm_sw_params_free(self.0) };
    }
}

/// ALSA 回放设备
pub struct AlsaDevice {
    name: String,
    pcm: *mut sys::snd_pcm_t,
    bytes_per_frame: usize,
}

impl AlsaDevice {
    /// 打开回放 PCM
    pub fn open(name: &str) -> Result<Self, DeviceError> {
        let open_err = |reason: String| DeviceError::Open {
            name: name.to_string(),
            reason,
        };
        let cname = CString::new(name).map_err(|_| open_err("name contains NUL".into()))?;

        let mut pcm = ptr::null_mut();
        let rc = unsafe {
            sys::snd_pcm_open(&mut pcm, cname.as_ptr(), sys::SND_PCM_STREAM_PLAYBACK, 0)
        };
        if rc < 0 || pcm.is_null() {
            return Err(open_err(strerror(rc)));
        }

        log::info!("Opened PCM device {}", name);
        Ok(Self {
            name: name.to_string(),
            pcm,
            bytes_per_frame: 0,
        })
    }

    fn check(rc: c_int, param: &'static str) -> Result<(), DeviceError> {
        if rc < 0 {
            Err(DeviceError::config(param, strerror(rc)))
        } else {
            Ok(())
        }
    }

    fn runtime(rc: c_int, op: &'static str) -> Result<(), DeviceError> {
        if rc < 0 {
            Err(DeviceError::runtime(op, strerror(rc)))
        } else {
            Ok(())
        }
    }

    fn buffer_range(hw: &HwParams) -> Option<(usize, usize)> {
        let mut min: sys::snd_pcm_uframes_t = 0;
        let mut max: sys::snd_pcm_uframes_t = 0;
        let rc_min = unsafe { sys::snd_pcm_hw_params_get_buffer_size_min(hw.0, &mut min) };
        let rc_max = unsafe { sys::snd_pcm_hw_params_get_buffer_size_max(hw.0, &mut max) };
        (rc_min >= 0 && rc_max >= 0).then_some((min as usize, max as usize))
    }
}

impl OutputDevice for AlsaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, params: &DeviceParams) -> Result<Negotiated, DeviceError> {
        let pcm = self.pcm;

        if params.nonblocking {
            Self::check(unsafe { sys::snd_pcm_nonblock(pcm, 1) }, "non-block mode")?;
            log::info!("Using card in non-block mode");
        }

        let hw = HwParams::new()?;
        Self::check(unsafe { sys::snd_pcm_hw_params_any(pcm, hw.0) }, "PCM device")?;
        Self::check(
            unsafe {
                sys::snd_pcm_hw_params_set_access(pcm, hw.0, sys::SND_PCM_ACCESS_MMAP_INTERLEAVED)
            },
            "MMAP access",
        )?;
        Self::check(
            unsafe { sys::snd_pcm_hw_params_set_format(pcm, hw.0, alsa_format(params.encoding())) },
            "format",
        )?;
        Self::check(
            unsafe {
                sys::snd_pcm_hw_params_set_rate(pcm, hw.0, params.format.sample_rate as c_uint, 0)
            },
            "rate",
        )?;
        Self::check(
            unsafe {
                sys::snd_pcm_hw_params_set_channels(pcm, hw.0, params.format.channels as c_uint)
            },
            "channels",
        )?;

        let buffer_range = Self::buffer_range(&hw);
        if let Some((min, max)) = buffer_range {
            log::debug!("Min and max buffer size of device {} .. {}", min, max);
        }

        // 设备取最接近的可用值，不一致时报告实际得到的大小
        let mut granted = params.buffer_frames as sys::snd_pcm_uframes_t;
        Self::check(
            unsafe { sys::snd_pcm_hw_params_set_buffer_size_near(pcm, hw.0, &mut granted) },
            "buffer size",
        )?;
        log::info!(
            "Buffer size: requested {} frames, using {}",
            params.buffer_frames,
            granted
        );
        let negotiated = Negotiated::granted(params.buffer_frames, granted as usize, buffer_range)?;

        Self::check(unsafe { sys::snd_pcm_hw_params(pcm, hw.0) }, "HW params")?;

        self.bytes_per_frame = params.format.bytes_per_frame();
        Ok(negotiated)
    }

    fn set_start_threshold(&mut self, frames: usize) -> Result<(), DeviceError> {
        let sw = SwParams::new()?;
        Self::check(
            unsafe { sys::snd_pcm_sw_params_current(self.pcm, sw.0) },
            "current SW params",
        )?;
        Self::check(
            unsafe {
                sys::snd_pcm_sw_params_set_start_threshold(
                    self.pcm,
                    sw.0,
                    frames as sys::snd_pcm_uframes_t,
                )
            },
            "start threshold",
        )?;
        Self::check(unsafe { sys::snd_pcm_sw_params(self.pcm, sw.0) }, "SW params")
    }

    #[inline]
    fn available_frames(&mut self) -> Result<usize, DeviceError> {
        let avail = unsafe { sys::snd_pcm_avail(self.pcm) };
        if avail < 0 {
            return Err(DeviceError::runtime("snd_pcm_avail()", strerror(avail as c_int)));
        }
        Ok(avail as usize)
    }

    #[inline]
    fn map_region(&mut self, frames_wanted: usize) -> Result<MappedRegion, DeviceError> {
        let mut areas: *const sys::snd_pcm_channel_area_t = ptr::null();
        let mut offset: sys::snd_pcm_uframes_t = 0;
        let mut frames = frames_wanted as sys::snd_pcm_uframes_t;

        let rc = unsafe { sys::snd_pcm_mmap_begin(self.pcm, &mut areas, &mut offset, &mut frames) };
        if rc < 0 || areas.is_null() {
            return Err(DeviceError::runtime("mmap begin", strerror(rc)));
        }

        // 交织访问：所有声道共享 areas[0]，首帧从 first bit 处开始
        let area = unsafe { &*areas };
        let base = area.addr as *mut u8;
        let addr = NonNull::new(base)
            .map(|b| unsafe {
                b.as_ptr()
                    .add(area.first as usize / 8 + offset as usize * self.bytes_per_frame)
            })
            .and_then(NonNull::new)
            .ok_or_else(|| DeviceError::runtime("mmap begin", "no mmap address"))?;

        Ok(MappedRegion {
            addr,
            offset: offset as usize,
            frames: frames as usize,
        })
    }

    #[inline]
    fn commit_region(&mut self, offset: usize, frames: usize) -> Result<usize, DeviceError> {
        let rc = unsafe {
            sys::snd_pcm_mmap_commit(
                self.pcm,
                offset as sys::snd_pcm_uframes_t,
                frames as sys::snd_pcm_uframes_t,
            )
        };
        if rc < 0 {
            return Err(DeviceError::runtime("mmap commit", strerror(rc as c_int)));
        }
        Ok(rc as usize)
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        Self::runtime(unsafe { sys::snd_pcm_start(self.pcm) }, "start")
    }

    fn drain(&mut self) -> Result<(), DeviceError> {
        if self.pcm.is_null() {
            return Ok(());
        }
        // 非阻塞模式下 drain 会立即返回 -EAGAIN
        unsafe { sys::snd_pcm_nonblock(self.pcm, 0) };
        Self::runtime(unsafe { sys::snd_pcm_drain(self.pcm) }, "drain")
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.pcm.is_null() {
            return Ok(());
        }
        let rc = unsafe { sys::snd_pcm_close(self.pcm) };
        self.pcm = ptr::null_mut();
        Self::runtime(rc, "close")
    }

    fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }
}

impl Drop for AlsaDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // 需要音频设备
    fn test_open_default() {
        let dev = AlsaDevice::open("default").unwrap();
        assert_eq!(dev.name(), "default");
    }

    #[test]
    fn test_open_unknown_device_fails() {
        let err = AlsaDevice::open("hw:no-such-card-xyz")
            .err()
            .expect("opening a nonexistent card must fail");
        assert!(matches!(err, DeviceError::Open { .. }));
    }
}
