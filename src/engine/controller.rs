//! PI 速率控制
//!
//! 本地调度时钟与消费端（DAC）时钟之间哪怕只差几个 ppm，
//! 几分钟内也会累积成 underrun 或 overrun。控制器观察设备缓冲区的空闲帧数，
//! 每 `loops_cadence` 次循环修正一次循环间隔，使平均值跟踪半个缓冲区。
//!
//! ```text
//! avg      = sum(avail) / loops_avg
//! e        = avg - hw_buffer / 2
//! ei      += e
//! extra_ns = round(-(Kp * e + Ki * Ta * ei))
//! interval = 1e9 / loops_per_second + extra_ns
//! ```
//!
//! 空闲帧多于目标（e > 0）说明本地写得太慢，`extra_ns` 变负，间隔缩短。
//! 两次重算之间沿用上一次的修正值。

use super::config::{ControllerParams, PlaybackConfig, MAX_KI_TA};

/// 一次重算的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// 窗口内平均空闲帧数
    pub average: f64,
    /// 与目标的误差
    pub error: f64,
    /// 积分误差
    pub integrated: f64,
    /// 附加到标称间隔上的纳秒数
    pub extra_ns: i64,
    /// 新的循环间隔
    pub interval_ns: i64,
    /// 相对标称间隔的偏差（>0 本地时钟偏快，<0 偏慢）
    pub deviation: f64,
}

/// 控制器采样间隔 Ta（秒）
///
/// `Ta = loops_cadence / loops_per_second`，并限制 `Ki * Ta <= 0.2` 以免振荡。
pub fn sampling_interval(params: &ControllerParams, loops_per_second: u32) -> f64 {
    let ta = params.loops_cadence as f64 / loops_per_second as f64;
    if params.ki * ta > MAX_KI_TA {
        MAX_KI_TA / params.ki
    } else {
        ta
    }
}

/// PI 控制器状态
#[derive(Debug, Clone)]
pub struct RateController {
    params: ControllerParams,
    ta: f64,
    target: f64,
    nominal_ns: f64,
    start_count: u64,

    // 测量窗口
    remaining: u32,
    sum: u64,

    average: f64,
    error: f64,
    integrated: f64,
    extra_ns: i64,
    interval_ns: i64,
}

impl RateController {
    pub fn new(config: &PlaybackConfig) -> Self {
        let params = *config.controller();
        let nominal_ns = 1e9 / config.loops_per_second() as f64;
        Self {
            ta: sampling_interval(&params, config.loops_per_second()),
            params,
            target: config.target_frames(),
            nominal_ns,
            start_count: config.start_count(),
            remaining: 0,
            sum: 0,
            average: 0.0,
            error: 0.0,
            integrated: 0.0,
            extra_ns: 0,
            interval_ns: config.nominal_interval_ns(),
        }
    }

    /// 喂入第 `count` 次循环（从 1 开始）观察到的空闲帧数
    ///
    /// 播放开始前（`count <= start_count`）不会开启测量窗口。
    /// 窗口的最后一个样本到来时重算修正并返回。
    pub fn observe(&mut self, count: u64, avail: usize) -> Option<Correction> {
        let avg = self.params.loops_avg as u64;
        let cadence = self.params.loops_cadence as u64;

        if count > self.start_count && (count + avg) % cadence == 0 {
            self.remaining = self.params.loops_avg;
            self.sum = 0;
        }

        if self.remaining == 0 {
            return None;
        }

        self.sum += avail as u64;
        self.remaining -= 1;
        if self.remaining > 0 {
            return None;
        }

        Some(self.recompute())
    }

    fn recompute(&mut self) -> Correction {
        self.average = self.sum as f64 / self.params.loops_avg as f64;
        self.error = self.average - self.target;
        self.integrated += self.error;

        let u = self.params.kp * self.error + self.params.ki * self.ta * self.integrated;
        self.extra_ns = (-u).round() as i64;
        self.interval_ns = (self.nominal_ns as i64) + self.extra_ns;

        Correction {
            average: self.average,
            error: self.error,
            integrated: self.integrated,
            extra_ns: self.extra_ns,
            interval_ns: self.interval_ns,
            deviation: self.interval_ns as f64 / self.nominal_ns - 1.0,
        }
    }

    /// 当前循环间隔（纳秒）
    #[inline]
    pub fn interval_ns(&self) -> i64 {
        self.interval_ns
    }

    /// 当前修正量（纳秒）
    #[inline]
    pub fn extra_ns(&self) -> i64 {
        self.extra_ns
    }

    /// 采样间隔 Ta（秒）
    pub fn ta(&self) -> f64 {
        self.ta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{PcmFormat, SampleEncoding};
    use crate::engine::config::{PlaybackRequest, KI, LOOPS_AVG, LOOPS_CADENCE};

    fn config(loops: u32, cadence: u32, avg: u32) -> PlaybackConfig {
        PlaybackConfig::new(PlaybackRequest {
            format: PcmFormat::new(SampleEncoding::S32Le, 2, 48_000),
            loops_per_second: loops,
            hw_buffer_frames: 4800,
            controller: ControllerParams {
                loops_avg: avg,
                loops_cadence: cadence,
                ..ControllerParams::default()
            },
            ..PlaybackRequest::default()
        })
        .unwrap()
    }

    /// 跑 `loops` 次循环，每次观察 `avail(count)`，收集每次重算
    fn run<F: Fn(u64) -> usize>(ctl: &mut RateController, loops: u64, avail: F) -> Vec<Correction> {
        (1..=loops).filter_map(|c| ctl.observe(c, avail(c))).collect()
    }

    #[test]
    fn test_ta_clamp_holds_for_any_rate() {
        let params = ControllerParams::default();
        for lps in [1u32, 2, 10, 100, 500, 1000, 1001, 2000, 4000, 8000, 96_000, 192_000] {
            let ta = sampling_interval(&params, lps);
            assert!(KI * ta <= MAX_KI_TA + 1e-12, "lps={} ta={}", lps, ta);
            assert!(ta > 0.0);
        }
        // 1000 loops/s: Ta = 4s, Ki*Ta = 0.2，恰好不触发限制
        assert!((sampling_interval(&params, 1000) - 4.0).abs() < 1e-12);
        // 500 loops/s: Ta = 8s 被限制到 0.2 / 0.05 = 4s
        assert!((sampling_interval(&params, 500) - 4.0).abs() < 1e-12);
        // 2000 loops/s: Ta = 2s 不变
        assert!((sampling_interval(&params, 2000) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_measurement_before_start() {
        let cfg = config(1000, 40, 4);
        let mut ctl = RateController::new(&cfg);
        let start = cfg.start_count();
        assert_eq!(start, 50);

        // 启动前的窗口边界（36, 76 中只有 76 在启动后）
        let corrections = run(&mut ctl, start, |_| 0);
        assert!(corrections.is_empty());
        assert_eq!(ctl.interval_ns(), 1_000_000);
    }

    #[test]
    fn test_recompute_only_at_cadence_boundary() {
        let cfg = config(1000, 40, 4);
        let mut ctl = RateController::new(&cfg);

        let mut at = Vec::new();
        for c in 1..=200u64 {
            if ctl.observe(c, 2400).is_some() {
                at.push(c);
            }
        }
        // 窗口从 (c + 4) % 40 == 0 开始，第 4 个样本时重算
        assert_eq!(at, vec![79, 119, 159, 199]);
    }

    #[test]
    fn test_on_target_no_correction() {
        let cfg = config(1000, 40, 4);
        let mut ctl = RateController::new(&cfg);
        let corrections = run(&mut ctl, 400, |_| 2400);
        assert!(!corrections.is_empty());
        for c in corrections {
            assert_eq!(c.error, 0.0);
            assert_eq!(c.extra_ns, 0);
            assert_eq!(c.interval_ns, 1_000_000);
        }
    }

    #[test]
    fn test_surplus_drives_correction_negative() {
        // 默认节奏：Ki * Ta = 0.2，每个窗口积分项使修正多 20ns
        let cfg = config(1000, LOOPS_CADENCE, LOOPS_AVG);
        let mut ctl = RateController::new(&cfg);
        // 空闲帧比目标多 100
        let corrections = run(&mut ctl, 40_000, |_| 2500);
        assert!(corrections.len() > 3);

        let extras: Vec<i64> = corrections.iter().map(|c| c.extra_ns).collect();
        assert!(extras.iter().all(|&e| e < 0), "{:?}", extras);
        assert!(extras.windows(2).all(|w| w[1] < w[0]), "{:?}", extras);
        // 间隔缩短
        assert!(corrections.iter().all(|c| c.interval_ns < 1_000_000));
        assert!(corrections.iter().all(|c| c.deviation < 0.0));
        assert_eq!(extras[0], -120);
        assert_eq!(extras[1], -140);
    }

    #[test]
    fn test_deficit_drives_correction_positive() {
        let cfg = config(1000, LOOPS_CADENCE, LOOPS_AVG);
        let mut ctl = RateController::new(&cfg);
        let corrections = run(&mut ctl, 40_000, |_| 2300);
        assert_eq!(corrections.len(), 10);

        let extras: Vec<i64> = corrections.iter().map(|c| c.extra_ns).collect();
        assert!(extras.iter().all(|&e| e > 0), "{:?}", extras);
        assert!(extras.windows(2).all(|w| w[1] > w[0]), "{:?}", extras);
    }

    #[test]
    fn test_formula_values() {
        let cfg = config(1000, 40, 4);
        let mut ctl = RateController::new(&cfg);
        // Ta = 40 / 1000 = 0.04
        assert!((ctl.ta() - 0.04).abs() < 1e-12);

        let c = run(&mut ctl, 79, |_| 2410)[0];
        assert_eq!(c.average, 2410.0);
        assert_eq!(c.error, 10.0);
        assert_eq!(c.integrated, 10.0);
        // -(1.0 * 10 + 0.05 * 0.04 * 10) = -10.02
        assert_eq!(c.extra_ns, -10);
        assert_eq!(c.interval_ns, 999_990);
    }

    #[test]
    fn test_correction_held_between_boundaries() {
        let cfg = config(1000, 40, 4);
        let mut ctl = RateController::new(&cfg);
        run(&mut ctl, 79, |_| 2500);
        let held = ctl.interval_ns();

        for c in 80..=115u64 {
            assert!(ctl.observe(c, 0).is_none());
            assert_eq!(ctl.interval_ns(), held);
        }
    }

    #[test]
    fn test_average_uses_window_samples_only() {
        let cfg = config(1000, 40, 4);
        let mut ctl = RateController::new(&cfg);
        // 窗口是 76..=79，只有这 4 个样本计入
        let c = run(&mut ctl, 79, |c| if c >= 76 { 2404 } else { 99_999 })[0];
        assert_eq!(c.average, 2404.0);
    }
}
