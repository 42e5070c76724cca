//! 延迟计算
//!
//! "延迟" = 从现在起，最近入队的样本还要多久才能被听到（秒）。
//! 由两部分组成：
//! - 软件侧：环形缓冲区里尚未交给设备的样本
//! - 设备侧：驱动直接报告的延迟，或由"最后一个样本到达扬声器的绝对时间"外推

use super::format::AudioFormat;
use super::timing::{now_us, us_to_secs};

/// 软件缓冲区中的样本折算为秒
#[inline]
pub fn buffered_secs(format: &AudioFormat, buffered_samples: usize) -> f64 {
    format.samples_to_secs(buffered_samples)
}

/// 距 `end_time_us` 还剩多少秒（已过去则为 0）
#[inline]
pub fn remaining_secs(end_time_us: i64) -> f64 {
    remaining_secs_at(end_time_us, now_us())
}

#[inline]
pub fn remaining_secs_at(end_time_us: i64, now_us: i64) -> f64 {
    us_to_secs((end_time_us - now_us).max(0))
}

/// 设备侧延迟：设备报告了就用报告值，否则按时间戳外推
#[inline]
pub fn device_delay(reported: Option<f64>, end_time_us: i64) -> f64 {
    match reported {
        Some(delay) => delay.max(0.0),
        None => remaining_secs(end_time_us),
    }
}

/// 合并软件侧与设备侧两部分延迟
#[inline]
pub fn combined_delay(
    format: &AudioFormat,
    buffered_samples: usize,
    reported: Option<f64>,
    end_time_us: i64,
) -> f64 {
    buffered_secs(format, buffered_samples) + device_delay(reported, end_time_us)
}

/// 暂停期间冻结的延迟
///
/// 暂停时记住当时的总延迟，恢复时据此重建时间戳，
/// 保证 pause/resume 前后报告的延迟一致。
#[derive(Debug, Default, Clone, Copy)]
pub struct FrozenDelay {
    device_secs: Option<f64>,
}

impl FrozenDelay {
    pub fn freeze(&mut self, device_secs: f64) {
        self.device_secs = Some(device_secs.max(0.0));
    }

    #[inline]
    pub fn get(&self) -> Option<f64> {
        self.device_secs
    }

    /// 解冻，返回冻结时的设备侧延迟
    pub fn thaw(&mut self) -> Option<f64> {
        self.device_secs.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_never_negative() {
        assert_eq!(remaining_secs_at(1_000, 5_000), 0.0);
        assert_eq!(remaining_secs_at(1_250_000, 1_000_000), 0.25);
    }

    #[test]
    fn test_combined_prefers_device_report() {
        let format = AudioFormat::new(48000, 2, 16);
        let delay = combined_delay(&format, 4800, Some(0.05), i64::MAX);
        assert!((delay - 0.15).abs() < 1e-9);

        // 没有设备报告，时间戳已过去
        let delay = combined_delay(&format, 24000, None, 0);
        assert!((delay - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_frozen_delay() {
        let mut frozen = FrozenDelay::default();
        assert!(frozen.get().is_none());
        frozen.freeze(-1.0);
        assert_eq!(frozen.get(), Some(0.0));
        assert_eq!(frozen.thaw(), Some(0.0));
        assert!(frozen.thaw().is_none());
    }
}
