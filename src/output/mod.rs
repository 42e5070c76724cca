//! 音频输出
//!
//! 解码线程唯一面对的接口。根据驱动类型选择推模式或拉模式调度，
//! 对外提供统一的 `play / get_space / get_delay / pause / resume / reset / drain`。
//!
//! 所有方法只能从同一个生产者线程调用。

pub mod pull;
pub mod push;
pub mod wakeup;

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::audio::{
    AudioFormat, EventSink, OutputEvent, OutputEvents, PlaybackStats, StatsReport, WakeupCallback,
};
use crate::driver::{
    Control, ControlReply, DeviceParams, DriverContext, DriverError, PlayFlags, PullDriver, PushDriver,
};

use self::pull::PullScheduler;
use self::push::PushScheduler;
use self::wakeup::FeederWaker;

/// 输出配置
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// 目标缓冲时长（软件 + 设备，毫秒）
    pub buffer_ms: u64,
    /// 持续输出：没有数据或暂停时向设备写静音，而不是停掉设备
    pub stream_silence: bool,
    /// mlock 环形缓冲区
    pub lock_memory: bool,
    /// drain 的额外等待上限（毫秒）
    pub drain_grace_ms: u64,
}

impl OutputConfig {
    /// 目标缓冲对应的样本数
    pub fn buffer_samples(&self, sample_rate: u32) -> usize {
        (sample_rate as u64 * self.buffer_ms / 1000) as usize
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 200,
            stream_silence: false,
            lock_memory: false,
            drain_grace_ms: 250,
        }
    }
}

/// 输出打开失败
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("invalid audio format: {0:?}")]
    InvalidFormat(AudioFormat),

    #[error("audio driver '{name}' failed to initialize: {source}")]
    DriverInit {
        name: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("couldn't probe device buffer size of '{0}'")]
    DeviceBufferUnknown(&'static str),

    #[error("failed to spawn audio feeder thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

/// 设备后端
pub enum Backend {
    Push(Box<dyn PushDriver>),
    Pull(Box<dyn PullDriver>),
}

enum Scheduler {
    Push(PushScheduler),
    Pull(PullScheduler),
}

/// 音频输出流
pub struct AudioOutput {
    scheduler: Scheduler,
    params: DeviceParams,
    driver_name: &'static str,
    events: Arc<EventSink>,
    stats: Arc<PlaybackStats>,
}

impl AudioOutput {
    /// 打开设备并启动调度
    ///
    /// `wakeup` 在输出需要更多数据或有事件待处理时被调用，
    /// 可能运行在设备的实时线程上，必须不阻塞。
    pub fn open(
        backend: Backend,
        format: AudioFormat,
        config: OutputConfig,
        wakeup: Option<WakeupCallback>,
    ) -> Result<Self, OutputError> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(OutputError::InvalidFormat(format));
        }

        let events = Arc::new(EventSink::new(wakeup));
        let stats = Arc::new(PlaybackStats::new());
        let mut params = DeviceParams::new(format);

        let (scheduler, driver_name) = match backend {
            Backend::Push(mut driver) => {
                let name = driver.name();
                let waker = Arc::new(FeederWaker::new());
                let wake = Arc::clone(&waker);
                let ctx = DriverContext::new(Arc::clone(&events), Some(Arc::new(move || wake.wake())));

                driver
                    .init(&mut params, ctx)
                    .map_err(|source| OutputError::DriverInit { name, source })?;
                Self::check_params(&mut params, name)?;

                if params.device_buffer == 0 {
                    driver.uninit();
                    return Err(OutputError::DeviceBufferUnknown(name));
                }

                let sched = PushScheduler::start(
                    driver,
                    params,
                    &config,
                    waker,
                    Arc::clone(&events),
                    Arc::clone(&stats),
                )?;
                (Scheduler::Push(sched), name)
            }
            Backend::Pull(mut driver) => {
                let name = driver.name();
                let ctx = DriverContext::new(Arc::clone(&events), None);

                driver
                    .init(&mut params, ctx)
                    .map_err(|source| OutputError::DriverInit { name, source })?;
                Self::check_params(&mut params, name)?;

                let sched = PullScheduler::start(
                    driver,
                    params.format,
                    params.device_buffer,
                    &config,
                    Arc::clone(&events),
                    Arc::clone(&stats),
                );
                (Scheduler::Pull(sched), name)
            }
        };

        log::info!(
            "Audio output started: driver={}, {} Hz, {} ch, {:?}, {:?}, buffer={} ms",
            driver_name,
            params.format.sample_rate,
            params.format.channels,
            params.format.sample_format,
            params.format.layout,
            config.buffer_ms
        );

        Ok(Self {
            scheduler,
            params,
            driver_name,
            events,
            stats,
        })
    }

    fn check_params(params: &mut DeviceParams, name: &'static str) -> Result<(), OutputError> {
        let format = params.format;
        if format.sample_rate == 0 || format.channels == 0 {
            log::error!("Driver '{}' negotiated an invalid format", name);
            return Err(OutputError::InvalidFormat(format));
        }
        params.period_size = params.period_size.max(1);
        Ok(())
    }

    /// 现在最多能 `play()` 多少样本
    pub fn get_space(&self) -> usize {
        match &self.scheduler {
            Scheduler::Push(s) => s.get_space(),
            Scheduler::Pull(s) => s.get_space(),
        }
    }

    /// 入队样本，返回接收的数量（可能小于 `samples`，调用方稍后重试剩余部分）
    ///
    /// `planes` 的数量必须等于 `params().format.num_planes()`。
    /// 接收量不超过最短的 plane 能容纳的样本数（plane 数不够时为 0）。
    pub fn play(&mut self, planes: &[&[u8]], samples: usize, flags: PlayFlags) -> usize {
        debug_assert_eq!(planes.len(), self.params.format.num_planes());
        match &mut self.scheduler {
            Scheduler::Push(s) => s.enqueue(planes, samples, flags.is_final()),
            Scheduler::Pull(s) => s.enqueue(planes, samples, flags.is_final()),
        }
    }

    /// 最近入队的样本还要多久才能被听到（秒）
    pub fn get_delay(&self) -> f64 {
        match &self.scheduler {
            Scheduler::Push(s) => s.get_delay(),
            Scheduler::Pull(s) => s.get_delay(),
        }
    }

    /// 立即停止并丢弃所有缓冲数据
    pub fn reset(&mut self) {
        match &mut self.scheduler {
            Scheduler::Push(s) => s.reset(),
            Scheduler::Pull(s) => s.reset(),
        }
    }

    pub fn pause(&mut self) {
        log::debug!("Audio output paused");
        match &mut self.scheduler {
            Scheduler::Push(s) => s.pause(),
            Scheduler::Pull(s) => s.pause(),
        }
    }

    pub fn resume(&mut self) {
        log::debug!("Audio output resumed");
        match &mut self.scheduler {
            Scheduler::Push(s) => s.resume(),
            Scheduler::Pull(s) => s.resume(),
        }
    }

    /// 阻塞直到所有已入队的音频播完（有超时保护）
    pub fn drain(&mut self) {
        match &mut self.scheduler {
            Scheduler::Push(s) => s.drain(),
            Scheduler::Pull(s) => s.drain(),
        }
    }

    /// 所有数据都已播放完毕
    pub fn eof_reached(&self) -> bool {
        match &self.scheduler {
            Scheduler::Push(s) => s.eof_reached(),
            Scheduler::Pull(s) => s.eof_reached(),
        }
    }

    pub fn control(&mut self, cmd: &Control) -> ControlReply {
        match &mut self.scheduler {
            Scheduler::Push(s) => s.control(cmd),
            Scheduler::Pull(s) => s.control(cmd),
        }
    }

    /// 取走待处理事件；实时路径上累积的 underrun 在这里记日志
    pub fn take_events(&self) -> OutputEvents {
        let events = self.events.take();
        if events.contains(OutputEvent::Underrun) || self.stats.underruns().in_underrun() {
            self.stats.underruns().take_underflow();
        }
        if events.contains(OutputEvent::Reload) {
            log::warn!("Audio device '{}' needs to be reloaded", self.driver_name);
        }
        events
    }

    /// 协商后的设备参数
    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn format(&self) -> AudioFormat {
        self.params.format
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver_name
    }

    pub fn is_push(&self) -> bool {
        matches!(self.scheduler, Scheduler::Push(_))
    }

    /// 软件缓冲区中的样本数
    pub fn buffered(&self) -> usize {
        match &self.scheduler {
            Scheduler::Push(s) => s.buffered(),
            Scheduler::Pull(s) => s.buffered(),
        }
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    pub fn stats_report(&self) -> StatsReport {
        self.stats.report(self.params.format.sample_rate)
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        log::debug!("Closing audio output '{}'", self.driver_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::null::{NullCallbackDriver, NullConfig, NullDriver};
    use crate::driver::Driver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn format() -> AudioFormat {
        AudioFormat::new(48000, 2, 16)
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    /// 不报告设备缓冲区大小的驱动
    struct Unprobed;

    impl Driver for Unprobed {
        fn name(&self) -> &'static str {
            "unprobed"
        }

        fn init(&mut self, _params: &mut DeviceParams, _ctx: DriverContext) -> Result<(), DriverError> {
            Ok(())
        }
    }

    impl PushDriver for Unprobed {
        fn get_space(&mut self) -> usize {
            0
        }

        fn play(&mut self, _planes: &[&[u8]], _samples: usize, _flags: PlayFlags) -> Result<usize, DriverError> {
            Ok(0)
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_push_requires_device_buffer() {
        let result = AudioOutput::open(Backend::Push(Box::new(Unprobed)), format(), OutputConfig::default(), None);
        assert!(matches!(result, Err(OutputError::DeviceBufferUnknown("unprobed"))));
    }

    #[test]
    fn test_invalid_format_rejected() {
        let driver = NullDriver::new(NullConfig::default());
        let result = AudioOutput::open(
            Backend::Push(Box::new(driver)),
            AudioFormat::new(0, 2, 16),
            OutputConfig::default(),
            None,
        );
        assert!(matches!(result, Err(OutputError::InvalidFormat(_))));
    }

    #[test]
    fn test_push_null_device_plays_to_eof() {
        let wakeups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&wakeups);
        let wakeup: WakeupCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let driver = NullDriver::new(NullConfig {
            buffer_ms: 20,
            ..NullConfig::default()
        });
        let config = OutputConfig {
            buffer_ms: 50,
            ..OutputConfig::default()
        };
        let mut out = AudioOutput::open(Backend::Push(Box::new(driver)), format(), config, Some(wakeup)).unwrap();
        assert!(out.is_push());
        assert!(out.eof_reached());

        // 0.05 秒的音频
        let data = vec![0u8; 2400 * 4];
        let mut offset = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while offset < 2400 && Instant::now() < deadline {
            let space = out.get_space().min(2400 - offset);
            if space == 0 {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            let last = offset + space == 2400;
            let flags = if last { PlayFlags::FINAL_CHUNK } else { PlayFlags::NONE };
            offset += out.play(&[&data[offset * 4..]], space, flags);
        }
        assert_eq!(offset, 2400);

        assert!(wait_until(Duration::from_secs(2), || out.eof_reached()));
        assert!(out.take_events().contains(OutputEvent::Eof));
        assert!(wakeups.load(Ordering::Relaxed) > 0);
        assert_eq!(out.stats().samples_played(), 2400);
    }

    #[test]
    fn test_pull_null_callback_drain() {
        let driver = NullCallbackDriver::new(NullConfig {
            buffer_ms: 10,
            ..NullConfig::default()
        });
        let mut out = AudioOutput::open(Backend::Pull(Box::new(driver)), format(), OutputConfig::default(), None).unwrap();
        assert!(!out.is_push());

        let data = vec![0u8; 960 * 4];
        assert_eq!(out.play(&[&data[..]], 960, PlayFlags::NONE), 960);
        assert!(out.get_delay() > 0.0);

        out.drain();
        assert_eq!(out.buffered(), 0);
        assert!(out.eof_reached());
        assert!(out.get_delay() <= 0.001);
    }

    #[test]
    fn test_planar_output() {
        use crate::audio::OutputLayout;

        let driver = NullCallbackDriver::new(NullConfig::default());
        let format = format().with_layout(OutputLayout::NonInterleaved);
        let mut out = AudioOutput::open(Backend::Pull(Box::new(driver)), format, OutputConfig::default(), None).unwrap();
        assert_eq!(out.params().format.num_planes(), 2);

        let left = vec![0u8; 100 * 2];
        let right = vec![0u8; 100 * 2];
        assert_eq!(out.play(&[&left[..], &right[..]], 100, PlayFlags::NONE), 100);
        out.reset();
        assert_eq!(out.buffered(), 0);
    }

    #[test]
    fn test_control_passthrough() {
        let driver = NullDriver::new(NullConfig::default());
        let mut out = AudioOutput::open(Backend::Push(Box::new(driver)), format(), OutputConfig::default(), None).unwrap();

        assert_eq!(out.control(&Control::SetVolume(0.5)), ControlReply::Done);
        assert_eq!(out.control(&Control::GetVolume), ControlReply::Volume(0.5));
        assert_eq!(
            out.control(&Control::UpdateStreamTitle("x".into())),
            ControlReply::Unknown
        );
    }

    #[test]
    fn test_reload_event_from_driver() {
        let driver = NullDriver::new(NullConfig::default());
        let handle = driver.handle();
        let out = AudioOutput::open(Backend::Push(Box::new(driver)), format(), OutputConfig::default(), None).unwrap();

        handle.simulate_device_loss();
        let events = out.take_events();
        assert!(events.contains(OutputEvent::Reload));
        assert!(!events.contains(OutputEvent::Underrun));
    }
}
