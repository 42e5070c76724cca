//! 拉模式调度
//!
//! 设备自己的实时线程调用 `PullSource::pull()` 取数据。
//! 这条路径上不加锁、不分配、不打日志，与生产者（解码线程）之间只通过
//! 环形缓冲区游标和一个原子状态寄存器协调：
//!
//! ```text
//! NONE ──enqueue/resume──▶ PLAY ──final enqueue──▶ WAIT
//!   ▲                       │ ▲                      │
//!   └──reset/pause──────────┘ └── pull: BUSY ◀──────┘ 环形缓冲区读空后 WAIT → NONE
//! ```
//!
//! BUSY 只在一次 pull 的读取过程中持有；其他线程想改状态时短暂自旋等待。

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;

use crate::audio::latency::{combined_delay, remaining_secs, FrozenDelay};
use crate::audio::timing::{now_us, secs_to_us};
use crate::audio::{AudioFormat, ChannelBuffers, EventSink, OutputEvent, PlaybackStats};
use crate::driver::{Control, ControlReply, PullDriver};

use super::OutputConfig;

const STATE_NONE: u8 = 0;
/// 最后一块已入队，读空即结束
const STATE_WAIT: u8 = 1;
const STATE_PLAY: u8 = 2;
const STATE_BUSY: u8 = 3;

/// 回调遇到 BUSY 时最多自旋的次数，之后按静音处理
const MAX_BUSY_SPINS: u32 = 16;

/// drain() 轮询状态的间隔
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// 设备线程与生产者共享的部分
struct PullShared {
    format: AudioFormat,
    ring: ChannelBuffers,
    state: AtomicU8,
    /// 最近一次 pull 的最后一个样本到达扬声器的时间（微秒）
    end_time_us: AtomicI64,
    events: Arc<EventSink>,
    stats: Arc<PlaybackStats>,
}

impl PullShared {
    /// 修改状态；对方处于 BUSY 时自旋等待
    fn set_state(&self, new: u8) {
        let backoff = Backoff::new();
        loop {
            let cur = self.state.load(Ordering::Acquire);
            if cur == STATE_BUSY {
                backoff.snooze();
                continue;
            }
            if self
                .state
                .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn fill_silence(&self, dst: &mut [&mut [u8]], from: usize, samples: usize) {
        let sstride = self.ring.sstride();
        if from >= samples {
            return;
        }
        for plane in dst.iter_mut() {
            let end = (samples * sstride).min(plane.len());
            let start = (from * sstride).min(end);
            self.format.fill_silence(&mut plane[start..end]);
        }
    }
}

/// 设备回调使用的句柄
///
/// 可以克隆后移入设备的实时线程
#[derive(Clone)]
pub struct PullSource {
    shared: Arc<PullShared>,
}

impl PullSource {
    #[inline]
    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    /// 从设备线程取数据（实时安全）
    ///
    /// `dst` 每个 plane 应有 `samples * sstride` 字节，短的 plane 会限制读取量，
    /// 其余部分按静音处理；`out_time_us` 是这批数据
    /// 最后一个样本预计到达扬声器的时间（`timing::now_us()` 参考系）。
    /// 返回真实数据的样本数，不足部分总是填成静音。
    pub fn pull(&self, dst: &mut [&mut [u8]], samples: usize, out_time_us: i64) -> usize {
        let shared = &*self.shared;

        // 取得 BUSY
        let backoff = Backoff::new();
        let mut spins = 0;
        let mut prev = shared.state();
        loop {
            match prev {
                STATE_PLAY | STATE_WAIT => {
                    match shared.state.compare_exchange_weak(
                        prev,
                        STATE_BUSY,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => prev = actual,
                    }
                }
                STATE_BUSY if spins < MAX_BUSY_SPINS => {
                    backoff.spin();
                    spins += 1;
                    prev = shared.state();
                }
                _ => {
                    shared.fill_silence(dst, 0, samples);
                    return 0;
                }
            }
        }

        let draining = prev == STATE_WAIT;
        let buffered = shared.ring.buffered();
        let read = shared.ring.read(dst, samples.min(buffered));

        if read > 0 {
            shared.end_time_us.store(out_time_us, Ordering::Release);
        }

        // 读掉超过一半就请求更多数据
        if buffered - read <= shared.ring.size() / 2 {
            shared.events.notify();
        }

        let underruns = shared.stats.underruns();
        if read < samples {
            if !draining {
                underruns.record(samples - read, &shared.events);
            }
        } else {
            underruns.satisfied();
        }
        shared.stats.on_delivery(read, buffered - read);

        shared.fill_silence(dst, read, samples);

        if draining && shared.ring.buffered() == 0 {
            shared.state.store(STATE_NONE, Ordering::Release);
            shared.events.raise(OutputEvent::Eof);
        } else {
            shared.state.store(prev, Ordering::Release);
        }

        read
    }
}

/// 拉模式调度器（生产者一侧）
pub struct PullScheduler {
    driver: Box<dyn PullDriver>,
    source: PullSource,
    stream_silence: bool,
    drain_grace: Duration,

    paused: bool,
    frozen: FrozenDelay,
    /// 最后一块已完整入队；暂停会把状态清成 NONE，恢复时据此回到 WAIT
    final_chunk: bool,
}

impl PullScheduler {
    /// 驱动必须已经 `init()` 完成
    pub(crate) fn start(
        driver: Box<dyn PullDriver>,
        format: AudioFormat,
        device_buffer: usize,
        config: &OutputConfig,
        events: Arc<EventSink>,
        stats: Arc<PlaybackStats>,
    ) -> Self {
        let buffer = config.buffer_samples(format.sample_rate).max(device_buffer);
        let ring = ChannelBuffers::new(&format, buffer);
        if config.lock_memory && !ring.lock_memory() {
            log::warn!("Failed to lock audio buffer memory");
        }

        let shared = Arc::new(PullShared {
            format,
            ring,
            state: AtomicU8::new(STATE_NONE),
            end_time_us: AtomicI64::new(0),
            events,
            stats,
        });

        let mut sched = Self {
            driver,
            source: PullSource { shared },
            stream_silence: config.stream_silence,
            drain_grace: Duration::from_millis(config.drain_grace_ms),
            paused: false,
            frozen: FrozenDelay::default(),
            final_chunk: false,
        };

        // 持续输出静音：设备回调一直运行，NONE 状态下回调只拿到静音
        if sched.stream_silence {
            sched.driver.resume(&sched.source);
        }

        log::debug!("Pull output started: buffer={} samples", buffer);
        sched
    }

    #[inline]
    fn shared(&self) -> &PullShared {
        &self.source.shared
    }

    #[inline]
    pub fn source(&self) -> &PullSource {
        &self.source
    }

    /// 入队（lock-free），返回接收的样本数
    pub fn enqueue(&mut self, planes: &[&[u8]], samples: usize, is_final: bool) -> usize {
        let shared = &*self.source.shared;
        let written = shared.ring.write(planes, samples);

        if shared.state() == STATE_NONE && !self.paused {
            shared.set_state(STATE_PLAY);
            if !self.stream_silence {
                self.driver.resume(&self.source);
            }
        }

        if is_final && written == samples {
            self.final_chunk = true;
            if !self.paused {
                shared.set_state(STATE_WAIT);
            }
        } else if written > 0 {
            self.final_chunk = false;
        }

        written
    }

    pub fn get_space(&self) -> usize {
        self.shared().ring.available()
    }

    pub fn get_delay(&self) -> f64 {
        let shared = self.shared();
        let frozen = if self.paused { self.frozen.get() } else { None };
        combined_delay(
            &shared.format,
            shared.ring.buffered(),
            frozen,
            shared.end_time_us.load(Ordering::Acquire),
        )
    }

    pub fn reset(&mut self) {
        if !self.stream_silence {
            self.driver.reset();
        }
        let shared = &*self.source.shared;
        shared.set_state(STATE_NONE);
        // 回调不会在 NONE 状态下碰环形缓冲区
        shared.ring.reset();
        shared.end_time_us.store(0, Ordering::Release);
        shared.stats.underruns().satisfied();

        self.paused = false;
        self.frozen = FrozenDelay::default();
        self.final_chunk = false;
    }

    pub fn pause(&mut self) {
        if self.paused {
            return;
        }

        let shared = &*self.source.shared;
        self.frozen
            .freeze(remaining_secs(shared.end_time_us.load(Ordering::Acquire)));

        if !self.stream_silence && !self.driver.pause() {
            self.driver.reset();
        }
        shared.set_state(STATE_NONE);
        self.paused = true;
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;

        let device = self.frozen.thaw().unwrap_or(0.0);
        let shared = &*self.source.shared;
        shared
            .end_time_us
            .store(now_us() + secs_to_us(device), Ordering::Release);

        shared.set_state(if self.final_chunk { STATE_WAIT } else { STATE_PLAY });
        if !self.stream_silence {
            self.driver.resume(&self.source);
        }
    }

    /// 等回调把缓冲区读空，再等设备延迟过去（都有上限），然后 reset
    pub fn drain(&mut self) {
        let shared = &*self.source.shared;
        log::debug!("Draining audio output...");

        let state = shared.state();
        if !self.paused && (state == STATE_PLAY || state == STATE_WAIT) {
            self.final_chunk = true;
            shared.set_state(STATE_WAIT);

            // 下限：缓冲区里的数据至少要这么久
            thread::sleep(shared.format.samples_to_duration(shared.ring.buffered()));

            // 然后轮询真正的结束
            let deadline = std::time::Instant::now() + self.drain_grace;
            while std::time::Instant::now() < deadline && shared.state() == STATE_WAIT {
                thread::sleep(DRAIN_POLL);
            }
            if shared.state() == STATE_WAIT {
                log::warn!("Draining is taking too long, aborting");
            } else {
                let remaining = remaining_secs(shared.end_time_us.load(Ordering::Acquire));
                thread::sleep(Duration::from_secs_f64(remaining).min(self.drain_grace));
            }
        }

        self.reset();
    }

    pub fn eof_reached(&self) -> bool {
        let shared = self.shared();
        !self.paused
            && shared.ring.buffered() == 0
            && shared.end_time_us.load(Ordering::Acquire) <= now_us()
    }

    pub fn control(&mut self, cmd: &Control) -> ControlReply {
        self.driver.control(cmd)
    }

    pub fn buffered(&self) -> usize {
        self.shared().ring.buffered()
    }
}

impl Drop for PullScheduler {
    fn drop(&mut self) {
        self.driver.reset();
        self.source.shared.set_state(STATE_NONE);
        self.driver.uninit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceParams, Driver, DriverContext, DriverError};
    use std::sync::atomic::AtomicUsize;

    /// 不启动任何线程的驱动；测试线程自己扮演设备回调
    #[derive(Default)]
    struct ManualDevice {
        resumes: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        native_pause: bool,
    }

    impl Driver for ManualDevice {
        fn name(&self) -> &'static str {
            "manual"
        }

        fn init(&mut self, _params: &mut DeviceParams, _ctx: DriverContext) -> Result<(), DriverError> {
            Ok(())
        }
    }

    impl PullDriver for ManualDevice {
        fn resume(&mut self, _source: &PullSource) {
            self.resumes.fetch_add(1, Ordering::Relaxed);
        }

        fn pause(&mut self) -> bool {
            self.native_pause
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn format() -> AudioFormat {
        AudioFormat::new(48000, 2, 16)
    }

    fn scheduler(device: ManualDevice) -> (PullScheduler, Arc<EventSink>, Arc<PlaybackStats>) {
        let events = Arc::new(EventSink::default());
        let stats = Arc::new(PlaybackStats::new());
        let config = OutputConfig {
            buffer_ms: 100,
            ..OutputConfig::default()
        };
        let sched = PullScheduler::start(
            Box::new(device),
            format(),
            0,
            &config,
            Arc::clone(&events),
            Arc::clone(&stats),
        );
        (sched, events, stats)
    }

    fn pull(source: &PullSource, samples: usize, fill: u8) -> (usize, Vec<u8>) {
        let mut buf = vec![fill; samples * 4];
        let n = source.pull(&mut [&mut buf[..]], samples, now_us());
        (n, buf)
    }

    #[test]
    fn test_idle_pull_is_silent() {
        let (sched, _events, stats) = scheduler(ManualDevice::default());

        let (n, buf) = pull(sched.source(), 64, 0x55);
        assert_eq!(n, 0);
        assert!(buf.iter().all(|&b| b == 0));
        // NONE 状态不是 underrun
        assert_eq!(stats.underruns().total_underflow(), 0);
    }

    #[test]
    fn test_underrun_pads_with_silence() {
        let device = ManualDevice::default();
        let resumes = Arc::clone(&device.resumes);
        let (mut sched, events, stats) = scheduler(device);

        let data = vec![0x11u8; 100 * 4];
        assert_eq!(sched.enqueue(&[&data[..]], 100, false), 100);
        assert_eq!(resumes.load(Ordering::Relaxed), 1);

        let (n, buf) = pull(sched.source(), 100, 0);
        assert_eq!(n, 100);
        assert!(buf.iter().all(|&b| b == 0x11));

        // 空缓冲区、非最后一块
        let (n, buf) = pull(sched.source(), 256, 0x55);
        assert_eq!(n, 0);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(stats.underruns().total_underflow(), 256);
        assert!(events.take().contains(OutputEvent::Underrun));

        // 同一次 underrun 不重复上报事件
        pull(sched.source(), 256, 0);
        assert_eq!(stats.underruns().episodes(), 1);
        assert!(!events.take().contains(OutputEvent::Underrun));
    }

    #[test]
    fn test_partial_read_padded() {
        let (mut sched, _events, stats) = scheduler(ManualDevice::default());

        let data = vec![0x22u8; 10 * 4];
        sched.enqueue(&[&data[..]], 10, false);

        let (n, buf) = pull(sched.source(), 16, 0x55);
        assert_eq!(n, 10);
        assert!(buf[..40].iter().all(|&b| b == 0x22));
        assert!(buf[40..].iter().all(|&b| b == 0));
        assert_eq!(stats.underruns().total_underflow(), 6);
    }

    #[test]
    fn test_final_chunk_reaches_eof() {
        let (mut sched, events, stats) = scheduler(ManualDevice::default());

        let data = vec![0x33u8; 300 * 4];
        sched.enqueue(&[&data[..]], 300, true);
        assert_eq!(sched.shared().state(), STATE_WAIT);
        assert!(!sched.eof_reached());

        let (n, _) = pull(sched.source(), 200, 0);
        assert_eq!(n, 200);
        assert_eq!(sched.shared().state(), STATE_WAIT);

        // 读空最后一块：短读不算 underrun
        let (n, _) = pull(sched.source(), 200, 0);
        assert_eq!(n, 100);
        assert_eq!(sched.shared().state(), STATE_NONE);
        assert_eq!(stats.underruns().total_underflow(), 0);
        assert!(events.take().contains(OutputEvent::Eof));

        // out_time_us 取的是 now，设备延迟已经过去
        assert!(sched.eof_reached());
    }

    #[test]
    fn test_final_chunk_survives_pause() {
        let (mut sched, events, stats) = scheduler(ManualDevice::default());

        let data = vec![0x33u8; 100 * 4];
        sched.enqueue(&[&data[..]], 100, true);
        sched.pause();
        sched.resume();
        assert_eq!(sched.shared().state(), STATE_WAIT);

        let (n, _) = pull(sched.source(), 200, 0);
        assert_eq!(n, 100);
        assert_eq!(stats.underruns().total_underflow(), 0);
        let raised = events.take();
        assert!(raised.contains(OutputEvent::Eof));
        assert!(!raised.contains(OutputEvent::Underrun));
        assert_eq!(sched.shared().state(), STATE_NONE);
    }

    #[test]
    fn test_final_enqueue_while_paused() {
        let (mut sched, events, stats) = scheduler(ManualDevice::default());

        sched.pause();
        let data = vec![0x33u8; 100 * 4];
        assert_eq!(sched.enqueue(&[&data[..]], 100, true), 100);
        // 暂停时不启动回调
        assert_eq!(sched.shared().state(), STATE_NONE);

        sched.resume();
        assert_eq!(sched.shared().state(), STATE_WAIT);
        let (n, _) = pull(sched.source(), 200, 0);
        assert_eq!(n, 100);
        assert_eq!(stats.underruns().episodes(), 0);
        assert!(events.take().contains(OutputEvent::Eof));

        // reset 后恢复的是普通播放
        sched.reset();
        sched.pause();
        sched.enqueue(&[&data[..]], 100, false);
        sched.resume();
        assert_eq!(sched.shared().state(), STATE_PLAY);
    }

    #[test]
    fn test_pause_resume_preserves_delay() {
        for native_pause in [true, false] {
            let device = ManualDevice {
                native_pause,
                ..ManualDevice::default()
            };
            let resets = Arc::clone(&device.resets);
            let (mut sched, _events, _stats) = scheduler(device);

            let data = vec![0u8; 2400 * 4];
            sched.enqueue(&[&data[..]], 2400, false);

            let mut buf = vec![0u8; 480 * 4];
            sched
                .source()
                .pull(&mut [&mut buf[..]], 480, now_us() + 100_000);

            let before = sched.get_delay();
            sched.pause();
            let paused = sched.get_delay();
            assert!((before - paused).abs() < 0.005, "{} vs {}", before, paused);
            assert_eq!(resets.load(Ordering::Relaxed), if native_pause { 0 } else { 1 });

            // 暂停时回调拿不到数据
            let (n, _) = pull(sched.source(), 64, 0);
            assert_eq!(n, 0);

            thread::sleep(Duration::from_millis(20));
            assert_eq!(sched.get_delay(), paused);

            sched.resume();
            let resumed = sched.get_delay();
            assert!((resumed - paused).abs() < 0.005, "{} vs {}", resumed, paused);
            assert_eq!(sched.buffered(), 1920);
        }
    }

    #[test]
    fn test_busy_state_returns_silence() {
        let (mut sched, _events, _stats) = scheduler(ManualDevice::default());
        let data = vec![0x44u8; 64 * 4];
        sched.enqueue(&[&data[..]], 64, false);

        sched.shared().state.store(STATE_BUSY, Ordering::Release);
        let (n, buf) = pull(sched.source(), 64, 0x55);
        assert_eq!(n, 0);
        assert!(buf.iter().all(|&b| b == 0));

        sched.shared().state.store(STATE_PLAY, Ordering::Release);
        let (n, _) = pull(sched.source(), 64, 0);
        assert_eq!(n, 64);
    }

    #[test]
    fn test_reset_clears_everything() {
        let device = ManualDevice::default();
        let resets = Arc::clone(&device.resets);
        let (mut sched, _events, _stats) = scheduler(device);

        let data = vec![0u8; 1000 * 4];
        sched.enqueue(&[&data[..]], 1000, false);
        sched.reset();

        assert_eq!(resets.load(Ordering::Relaxed), 1);
        assert_eq!(sched.shared().state(), STATE_NONE);
        assert_eq!(sched.buffered(), 0);
        assert_eq!(sched.get_space(), 4800);
        assert!(sched.get_delay() < 1e-9);
        assert!(sched.eof_reached());
    }

    #[test]
    fn test_concurrent_callback_sees_written_data_in_order() {
        let (mut sched, _events, _stats) = scheduler(ManualDevice::default());
        let source = sched.source().clone();

        const TOTAL: usize = 20_000;
        let consumer = thread::spawn(move || {
            let mut received = Vec::with_capacity(TOTAL);
            let mut buf = vec![0u8; 128 * 4];
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            while received.len() < TOTAL && std::time::Instant::now() < deadline {
                let n = source.pull(&mut [&mut buf[..]], 128, now_us());
                for frame in buf[..n * 4].chunks_exact(4) {
                    received.push(u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]));
                }
                thread::yield_now();
            }
            received
        });

        let mut next = 0u32;
        while (next as usize) < TOTAL {
            let chunk: Vec<u8> = (next..(next + 100).min(TOTAL as u32))
                .flat_map(|v| v.to_le_bytes())
                .collect();
            let samples = chunk.len() / 4;
            let n = sched.enqueue(&[&chunk[..]], samples, false);
            next += n as u32;
            if n < samples {
                thread::yield_now();
            }
        }

        let received = consumer.join().unwrap();
        assert_eq!(received.len(), TOTAL);
        assert!(received.iter().enumerate().all(|(i, &v)| v == i as u32));
    }
}
