//! 播放统计与 underrun 记账
//!
//! 所有操作都是 lock-free 的，可以在设备回调中使用。
//! 日志只在非实时路径（`take_underflow`、报告）上输出。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::events::{EventSink, OutputEvent};
use super::timing::now_us;

/// 统计采样间隔：每 N 次设备写入/回调才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 采样缓冲区大小
const HISTORY_SIZE: usize = 256;

/// Underrun 记账
///
/// 一次 underrun 从第一次"读不满且不是最后一块"开始，
/// 到下一次读满为止。期间短缺的样本持续累加，事件只上报一次。
pub struct UnderrunTracker {
    /// 自上次上报以来短缺的样本数
    underflow: AtomicU64,
    /// 累计短缺样本数
    total_underflow: AtomicU64,
    /// 累计 underrun 次数
    episodes: AtomicU64,
    in_episode: AtomicBool,
}

impl UnderrunTracker {
    pub fn new() -> Self {
        Self {
            underflow: AtomicU64::new(0),
            total_underflow: AtomicU64::new(0),
            episodes: AtomicU64::new(0),
            in_episode: AtomicBool::new(false),
        }
    }

    /// 记录一次读不满，返回是否开启了新的 underrun
    #[inline]
    pub fn record(&self, shortfall: usize, events: &EventSink) -> bool {
        self.underflow.fetch_add(shortfall as u64, Ordering::Relaxed);
        self.total_underflow.fetch_add(shortfall as u64, Ordering::Relaxed);

        if self.in_episode.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.episodes.fetch_add(1, Ordering::Relaxed);
        events.raise(OutputEvent::Underrun);
        true
    }

    /// 一次完整的读取结束当前 underrun
    #[inline]
    pub fn satisfied(&self) {
        self.in_episode.store(false, Ordering::Release);
    }

    #[inline]
    pub fn in_underrun(&self) -> bool {
        self.in_episode.load(Ordering::Acquire)
    }

    /// 取走自上次调用以来的短缺样本数
    pub fn take_underflow(&self) -> u64 {
        let samples = self.underflow.swap(0, Ordering::AcqRel);
        if samples > 0 {
            log::warn!("Audio underrun: {} samples of silence inserted", samples);
        }
        samples
    }

    #[inline]
    pub fn total_underflow(&self) -> u64 {
        self.total_underflow.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }
}

impl Default for UnderrunTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 播放统计收集器
pub struct PlaybackStats {
    callback_count: AtomicU64,
    last_sampled_us: AtomicU64,

    // 两次采样之间的间隔（微秒）
    interval_buffer: Box<[AtomicU64; HISTORY_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 水位（样本数，也降频采样）
    water_level_buffer: Box<[AtomicUsize; HISTORY_SIZE]>,
    water_level_write_idx: AtomicUsize,

    samples_played: AtomicU64,

    underruns: UnderrunTracker,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            last_sampled_us: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            samples_played: AtomicU64::new(0),
            underruns: UnderrunTracker::new(),
        }
    }

    /// 每次向设备交付数据时调用
    ///
    /// `buffered`: 交付后软件缓冲区剩余样本数
    #[inline]
    pub fn on_delivery(&self, delivered: usize, buffered: usize) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);
        self.samples_played.fetch_add(delivered as u64, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let now = now_us().max(1) as u64;
            let last = self.last_sampled_us.swap(now, Ordering::Relaxed);
            if last > 0 {
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
                self.interval_buffer[idx].store(now.saturating_sub(last), Ordering::Relaxed);
            }

            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed) % HISTORY_SIZE;
            self.water_level_buffer[idx].store(buffered, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn underruns(&self) -> &UnderrunTracker {
        &self.underruns
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, sample_rate: u32) -> StatsReport {
        let intervals: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&v| v > 0)
            .collect();

        let water_levels: Vec<usize> = self
            .water_level_buffer
            .iter()
            .take(self.water_level_write_idx.load(Ordering::Relaxed).min(HISTORY_SIZE))
            .map(|v| v.load(Ordering::Relaxed))
            .collect();

        let interval_stats = IntervalStats {
            min_us: intervals.iter().copied().min().unwrap_or(0),
            max_us: intervals.iter().copied().max().unwrap_or(0),
            avg_us: if intervals.is_empty() {
                0
            } else {
                intervals.iter().sum::<u64>() / intervals.len() as u64
            },
        };

        let water_stats = WaterLevelStats {
            min: water_levels.iter().copied().min().unwrap_or(0),
            max: water_levels.iter().copied().max().unwrap_or(0),
        };

        StatsReport {
            callback_count: self.callback_count(),
            sample_interval: SAMPLE_INTERVAL,
            interval_stats,
            water_stats,
            underrun_episodes: self.underruns.episodes(),
            underflow_samples: self.underruns.total_underflow(),
            samples_played: self.samples_played(),
            sample_rate,
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub interval_stats: IntervalStats,
    pub water_stats: WaterLevelStats,
    pub underrun_episodes: u64,
    pub underflow_samples: u64,
    pub samples_played: u64,
    pub sample_rate: u32,
}

#[derive(Debug)]
pub struct IntervalStats {
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
}

#[derive(Debug)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Output Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "Device deliveries: {}", self.callback_count)?;
        writeln!(
            f,
            "Delivery timing (per {} deliveries):",
            self.sample_interval
        )?;
        writeln!(f, "    Min: {:.2} ms", self.interval_stats.min_us as f64 / 1000.0)?;
        writeln!(f, "    Max: {:.2} ms", self.interval_stats.max_us as f64 / 1000.0)?;
        writeln!(f, "    Avg: {:.2} ms", self.interval_stats.avg_us as f64 / 1000.0)?;
        writeln!(f)?;

        writeln!(f, "Ring Buffer Water Level:")?;
        writeln!(f, "  Min: {} samples", self.water_stats.min)?;
        writeln!(f, "  Max: {} samples", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_episodes)?;
        writeln!(f, "Underflowed samples: {}", self.underflow_samples)?;

        let secs = if self.sample_rate > 0 {
            self.samples_played as f64 / self.sample_rate as f64
        } else {
            0.0
        };
        writeln!(f, "Samples played: {} ({:.2}s)", self.samples_played, secs)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underrun_episode_reported_once() {
        let events = EventSink::default();
        let tracker = UnderrunTracker::new();

        assert!(tracker.record(100, &events));
        assert!(!tracker.record(50, &events));
        assert!(tracker.in_underrun());
        assert_eq!(tracker.episodes(), 1);
        assert!(events.take().contains(OutputEvent::Underrun));

        tracker.satisfied();
        assert!(tracker.record(10, &events));
        assert_eq!(tracker.episodes(), 2);

        assert_eq!(tracker.take_underflow(), 160);
        assert_eq!(tracker.take_underflow(), 0);
        assert_eq!(tracker.total_underflow(), 160);
    }

    #[test]
    fn test_report_counts() {
        let stats = PlaybackStats::new();
        for _ in 0..40 {
            stats.on_delivery(480, 1000);
        }

        let report = stats.report(48000);
        assert_eq!(report.callback_count, 40);
        assert_eq!(report.samples_played, 40 * 480);
        assert_eq!(report.water_stats.max, 1000);
        assert!(report.to_string().contains("Samples played: 19200 (0.40s)"));
    }
}
