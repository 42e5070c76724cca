//! 推模式调度
//!
//! 专用的喂数据线程反复询问设备还能接收多少样本，从环形缓冲区取出相应数量交给
//! 设备，然后睡眠直到被唤醒（入队、暂停/恢复、reset、驱动事件）或超时。
//!
//! 锁的划分：
//! - 状态锁（`Mutex<PushState>`）：流状态 + 所有驱动调用
//! - 唤醒锁（`FeederWaker` 内部）：只保护 `need_wakeup` / `terminate`
//!
//! 线程睡眠前总是先释放状态锁，设备 poll 也在锁外进行，
//! 所以驱动的等待不需要可重入锁。

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::latency::{combined_delay, device_delay, FrozenDelay};
use crate::audio::timing::{now_us, secs_to_us};
use crate::audio::{ChannelBuffers, EventSink, OutputEvent, PlaybackStats};
use crate::driver::{Control, ControlReply, DeviceParams, DriverError, PlayFlags, PushDriver};

use super::wakeup::{FeederWaker, WaitOutcome};
use super::{OutputConfig, OutputError};

/// 设备等待的最短超时，避免延迟为 0 的设备造成忙等
const MIN_DEVICE_WAIT: Duration = Duration::from_millis(1);

/// 目标水位之外多留的余量（样本），减少按字节工作的设备引起的频繁唤醒
const BUFFER_MARGIN: usize = 64;

/// 连续多少次"有空间有数据却一个样本都没收"才报错
const STUCK_REPORT_THRESHOLD: u32 = 16;

/// 设备报告的延迟超过设备缓冲区时长这么多（秒）就视为无效
const MAX_EXTRA_LATENCY: f64 = 5.0;

/// 被状态锁保护的部分
struct PushState {
    driver: Box<dyn PushDriver>,

    /// peek 出来交给设备的临时数据（每 plane 一个）
    scratch: Vec<Vec<u8>>,
    /// 静音数据（每 plane 一个，按需增长）
    silence: Vec<Vec<u8>>,
    poll_fds: Vec<libc::pollfd>,

    paused: bool,
    /// 暂停时驱动原生暂停成功
    hw_paused: bool,
    /// 暂停时的设备侧延迟
    frozen: FrozenDelay,

    /// 当前缓冲区里是完整的剩余音频
    final_chunk: bool,
    /// 设备里还有没播完的数据
    still_playing: bool,
    /// 真实数据已经开始流向设备（用于区分起播和 underrun）
    streaming: bool,
    wait_on_device: bool,
    /// 预计播完的时间（微秒），只在 EOF 等待时使用
    expected_end_us: Option<i64>,
    /// 最后一个写入设备的样本到达扬声器的时间，供不报告延迟的驱动使用
    end_time_us: i64,

    zero_accept_count: u32,
    unaligned_reported: bool,
    bad_delay_reported: bool,
}

struct PushShared {
    state: Mutex<PushState>,
    /// drain() 在这里等待喂数据线程的进度
    drained: Condvar,
    waker: Arc<FeederWaker>,

    ring: ChannelBuffers,
    params: DeviceParams,
    /// 目标总缓冲量（软件 + 设备，样本数）
    buffer: usize,
    stream_silence: bool,
    drain_grace: Duration,

    events: Arc<EventSink>,
    stats: Arc<PlaybackStats>,
}

/// 推模式调度器
pub struct PushScheduler {
    shared: Arc<PushShared>,
    feeder: Option<JoinHandle<()>>,
}

impl PushScheduler {
    /// 驱动必须已经 `init()` 完成
    pub(crate) fn start(
        driver: Box<dyn PushDriver>,
        params: DeviceParams,
        config: &OutputConfig,
        waker: Arc<FeederWaker>,
        events: Arc<EventSink>,
        stats: Arc<PlaybackStats>,
    ) -> Result<Self, OutputError> {
        let format = params.format;
        let buffer = config.buffer_samples(format.sample_rate).max(params.device_buffer);

        let ring = ChannelBuffers::new(&format, buffer);
        if config.lock_memory && !ring.lock_memory() {
            log::warn!("Failed to lock audio buffer memory");
        }

        let planes = format.num_planes();
        let state = PushState {
            driver,
            scratch: vec![Vec::new(); planes],
            silence: vec![Vec::new(); planes],
            poll_fds: Vec::new(),
            paused: false,
            hw_paused: false,
            frozen: FrozenDelay::default(),
            final_chunk: false,
            still_playing: false,
            streaming: false,
            wait_on_device: false,
            expected_end_us: None,
            end_time_us: 0,
            zero_accept_count: 0,
            unaligned_reported: false,
            bad_delay_reported: false,
        };

        let shared = Arc::new(PushShared {
            state: Mutex::new(state),
            drained: Condvar::new(),
            waker,
            ring,
            params,
            buffer,
            stream_silence: config.stream_silence,
            drain_grace: Duration::from_millis(config.drain_grace_ms),
            events,
            stats,
        });

        let thread_shared = Arc::clone(&shared);
        let feeder = thread::Builder::new()
            .name("aout-feeder".into())
            .spawn(move || feeder_loop(thread_shared));

        match feeder {
            Ok(handle) => {
                log::debug!(
                    "Push output started: buffer={} samples, device buffer={} samples, period={}",
                    buffer,
                    params.device_buffer,
                    params.period_size
                );
                Ok(Self {
                    shared,
                    feeder: Some(handle),
                })
            }
            Err(e) => {
                shared.lock().driver.uninit();
                Err(OutputError::ThreadSpawn(e))
            }
        }
    }

    /// 入队，返回接收的样本数；从不阻塞在设备 I/O 上
    pub fn enqueue(&self, planes: &[&[u8]], samples: usize, is_final: bool) -> usize {
        let shared = &self.shared;
        let mut st = shared.lock();

        let write = shared.ring.write(planes, samples);
        let is_final = is_final && write == samples;

        let was_paused = st.paused;
        if was_paused {
            shared.resume_locked(&mut st);
        }

        let got_data = write > 0 || was_paused || st.final_chunk != is_final;
        st.final_chunk = is_final;
        if got_data {
            st.still_playing = true;
            st.expected_end_us = None;
            // 没有新数据时，解码线程承诺一有数据就会再次调用
            shared.waker.wake();
        }

        log::trace!("enqueue samples={} accepted={} final={}", samples, write, is_final);
        write
    }

    pub fn get_space(&self) -> usize {
        let mut st = self.shared.lock();
        self.shared.unlocked_get_space(&mut st)
    }

    pub fn get_delay(&self) -> f64 {
        let mut st = self.shared.lock();
        self.shared.unlocked_get_delay(&mut st)
    }

    pub fn reset(&self) {
        let mut st = self.shared.lock();
        self.shared.reset_locked(&mut st);
    }

    pub fn pause(&self) {
        let shared = &self.shared;
        let mut st = shared.lock();
        if st.paused {
            return;
        }

        let device_delay = shared.device_delay(&mut st);
        st.frozen.freeze(device_delay);

        if !shared.stream_silence {
            if st.driver.pause() {
                st.hw_paused = true;
            } else {
                // 设备不能暂停：停掉它，恢复时用静音补回延迟
                log::debug!("Driver has no native pause, emulating with reset");
                st.driver.reset();
                st.hw_paused = false;
            }
        }

        st.paused = true;
        st.streaming = false;
        shared.waker.wake();
    }

    pub fn resume(&self) {
        let mut st = self.shared.lock();
        if st.paused {
            self.shared.resume_locked(&mut st);
            self.shared.waker.wake();
        }
    }

    /// 阻塞直到缓冲区播完（有超时保护），然后 reset
    pub fn drain(&self) {
        let shared = &self.shared;
        log::debug!("Draining audio output...");

        let mut st = shared.lock();
        if !st.paused {
            st.final_chunk = true;
            shared.waker.wake();

            let delay = shared.unlocked_get_delay(&mut st);
            let delay = Duration::try_from_secs_f64(delay).unwrap_or(Duration::ZERO);
            let deadline = Instant::now() + delay + shared.drain_grace;

            let mut timed_out = false;
            while st.still_playing && shared.ring.buffered() > 0 {
                let now = Instant::now();
                if now >= deadline {
                    timed_out = true;
                    break;
                }
                st = shared
                    .drained
                    .wait_timeout(st, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }

            if timed_out {
                log::warn!("Draining is taking too long, aborting");
            } else if !st.driver.drain() {
                let max = shared.params.format.samples_to_secs(shared.buffer) + shared.drain_grace.as_secs_f64();
                let delay = shared.unlocked_get_delay(&mut st).min(max);
                thread::sleep(Duration::try_from_secs_f64(delay).unwrap_or(Duration::ZERO));
            }
        }

        shared.reset_locked(&mut st);
    }

    pub fn eof_reached(&self) -> bool {
        !self.shared.lock().still_playing
    }

    pub fn control(&self, cmd: &Control) -> ControlReply {
        self.shared.lock().driver.control(cmd)
    }

    pub fn buffered(&self) -> usize {
        self.shared.ring.buffered()
    }
}

impl Drop for PushScheduler {
    fn drop(&mut self) {
        self.shared.waker.terminate();
        if let Some(handle) = self.feeder.take() {
            if handle.join().is_err() {
                log::error!("Audio feeder thread panicked");
            }
        }
        self.shared.lock().driver.uninit();
    }
}

impl PushShared {
    fn lock(&self) -> MutexGuard<'_, PushState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 驱动报告的延迟，无效值归零，过大的值截断
    fn reported_delay(&self, st: &mut PushState) -> Option<f64> {
        let delay = st.driver.get_delay()?;
        let ceiling = self.params.format.samples_to_secs(self.params.device_buffer) + MAX_EXTRA_LATENCY;

        let sane = if !delay.is_finite() {
            0.0
        } else if delay > ceiling {
            ceiling
        } else {
            return Some(delay.max(0.0));
        };
        if !st.bad_delay_reported {
            log::error!("Audio device returned nonsense delay ({}), using {}", delay, sane);
            st.bad_delay_reported = true;
        }
        Some(sane)
    }

    /// 设备侧延迟：驱动报告值，或按时间戳外推
    fn device_delay(&self, st: &mut PushState) -> f64 {
        let reported = self.reported_delay(st);
        device_delay(reported, st.end_time_us)
    }

    fn unlocked_get_delay(&self, st: &mut PushState) -> f64 {
        let device = match st.frozen.get() {
            Some(device) if st.paused => Some(device),
            _ => self.reported_delay(st),
        };
        combined_delay(&self.params.format, self.ring.buffered(), device, st.end_time_us)
    }

    /// 软件缓冲区可写空间，额外限制软件 + 设备的总缓冲量不超过目标水位
    fn unlocked_get_space(&self, st: &mut PushState) -> usize {
        let space = self.ring.available() as isize;

        let device_space = st.driver.get_space() as isize;
        let device_buffered = self.params.device_buffer as isize - device_space;
        let soft_buffered = self.ring.buffered() as isize;

        let min_buffer = (self.buffer + BUFFER_MARGIN) as isize;
        let missing = min_buffer - device_buffered - soft_buffered;
        // 但设备缓冲区总是尽量填满
        let device_missing = device_space - soft_buffered;
        let missing = missing.max(device_missing);
        if missing <= 0 {
            return 0;
        }

        // 向上取整到周期，设备只按整周期收数据
        let period = self.params.period_size.max(1) as isize;
        let missing = (missing + period - 1) / period * period;
        space.min(missing).max(0) as usize
    }

    fn reset_locked(&self, st: &mut PushState) {
        st.driver.reset();
        self.ring.reset();

        st.paused = false;
        st.hw_paused = false;
        st.frozen = FrozenDelay::default();
        st.final_chunk = false;
        st.streaming = false;
        st.wait_on_device = false;
        st.expected_end_us = None;
        st.end_time_us = 0;
        st.zero_accept_count = 0;
        self.stats.underruns().satisfied();

        if st.still_playing {
            self.waker.wake();
        }
        st.still_playing = false;
        self.drained.notify_all();
    }

    fn resume_locked(&self, st: &mut PushState) {
        let device_delay = st.frozen.thaw();

        if !self.stream_silence {
            if st.hw_paused {
                st.driver.resume();
            } else if let Some(delay) = device_delay {
                self.recover_pause(st, delay);
            }
        }

        st.end_time_us = now_us() + secs_to_us(device_delay.unwrap_or(0.0));
        st.paused = false;
        st.hw_paused = false;
        st.expected_end_us = None;
    }

    /// 设备被 reset 过：补入暂停前设备里那么多的静音，保持可听位置不变
    fn recover_pause(&self, st: &mut PushState, delay: f64) {
        let period = self.params.period_size.max(1);
        let wanted = self.params.format.secs_to_samples(delay);
        let samples = wanted.min(st.driver.get_space()) / period * period;
        if samples == 0 {
            return;
        }

        self.ensure_silence(st, samples);
        let planes: Vec<&[u8]> = st.silence.iter().map(|p| &p[..]).collect();
        match st.driver.play(&planes, samples, PlayFlags::NONE) {
            Ok(n) => log::debug!("Recovered pause delay with {} samples of silence", n.min(samples)),
            Err(e) => log::error!("Error writing audio to device: {}", e),
        }
    }

    fn ensure_silence(&self, st: &mut PushState, samples: usize) {
        let bytes = samples * self.ring.sstride();
        for plane in st.silence.iter_mut() {
            if plane.len() < bytes {
                plane.resize(bytes, 0);
                self.params.format.fill_silence(plane);
            }
        }
    }

    /// 一次写设备
    fn play_data(&self, st: &mut PushState) {
        let format = &self.params.format;
        let period = self.params.period_size.max(1);

        let space = st.driver.get_space();
        let play_silence = st.paused || (self.stream_silence && !st.still_playing);

        if space % period != 0 && !st.unaligned_reported {
            log::error!("Audio device reports unaligned available buffer size");
            st.unaligned_reported = true;
        }

        let max = if play_silence {
            self.ensure_silence(st, space);
            space
        } else {
            self.ring.buffered()
        };

        let mut samples = max.min(space);
        let mut flags = PlayFlags::NONE;
        if st.final_chunk && samples == max && !play_silence {
            flags = PlayFlags::FINAL_CHUNK;
        } else {
            samples = samples / period * period;
        }

        let mut r = 0;
        if samples > 0 {
            let source = if play_silence {
                &st.silence
            } else {
                self.ring.peek(&mut st.scratch, samples);
                &st.scratch
            };
            let planes: Vec<&[u8]> = source.iter().map(|p| &p[..]).collect();

            r = match st.driver.play(&planes, samples, flags) {
                Ok(n) if n > samples => {
                    log::error!("Audio device returned nonsense value ({} > {})", n, samples);
                    samples
                }
                Ok(n) => {
                    if n != samples {
                        log::trace!("device accepted {} of {} samples", n, samples);
                    }
                    n
                }
                Err(DriverError::DeviceLost) => {
                    log::error!("Audio device lost");
                    self.events.raise(OutputEvent::Reload);
                    0
                }
                Err(e) => {
                    log::error!("Error writing audio to device: {}", e);
                    0
                }
            };
        }

        // 多半是周期对齐导致剩余数据写不进去
        let stuck_eof = r == 0 && space >= max && samples > 0;
        if flags.is_final() && stuck_eof {
            log::error!("Audio output driver seems to ignore FINAL_CHUNK, dropping {} samples", max);
            r = max;
        }

        if !play_silence {
            self.underrun_check(st, space, max, r);
            self.ring.skip(r);
        }

        if r > 0 {
            st.expected_end_us = None;
            let now = now_us();
            st.end_time_us = st.end_time_us.max(now) + secs_to_us(format.samples_to_secs(r));
            self.stats.on_delivery(r, self.ring.buffered());
        }

        // 有空间、有数据却什么都没写：设备的 get_space() 不可信
        let stuck = r == 0 && max >= space && space > 0;
        if stuck {
            st.zero_accept_count += 1;
            if st.zero_accept_count == STUCK_REPORT_THRESHOLD {
                log::error!("Audio output is reporting incorrect buffer status");
            }
        } else {
            st.zero_accept_count = 0;
        }

        // 等设备腾出空间；刚写过数据也等设备，让它在需要时唤醒我们
        st.wait_on_device = space == 0 || r > 0 || stuck;
        st.still_playing |= r > 0 && !play_silence;
        st.streaming |= r > 0 && !play_silence;

        // 刚把设备填满（r == space）就暂时不要再请求，避免按字节工作的设备反复唤醒
        let needed = self.unlocked_get_space(st);
        let threshold = if r == space { self.params.device_buffer / 4 } else { 1 };
        let more = needed >= threshold.max(1) && !stuck && !flags.is_final();
        if more {
            self.events.notify();
        }

        log::trace!(
            "in={} final={} space={} r={} wait/playing={}/{} needed={} more={}",
            max,
            flags.is_final(),
            space,
            r,
            st.wait_on_device,
            st.still_playing,
            needed,
            more
        );
    }

    /// 设备已经完全空了而缓冲区里的数据不够填：这是一次 underrun
    fn underrun_check(&self, st: &PushState, space: usize, max: usize, written: usize) {
        let underruns = self.stats.underruns();
        if max >= space {
            if written > 0 {
                underruns.satisfied();
            }
            return;
        }

        let device_empty = space >= self.params.device_buffer;
        if st.streaming && !st.final_chunk && device_empty {
            underruns.record(space - max, &self.events);
        }
    }
}

enum FeederWait {
    Device,
    Timeout(Duration),
    Indefinite,
}

fn feeder_loop(shared: Arc<PushShared>) {
    log::debug!("Audio feeder thread started");

    while !shared.waker.is_terminated() {
        let mut st = shared.lock();

        let playing = !st.paused || shared.stream_silence;
        if playing {
            shared.play_data(&mut st);
            shared.drained.notify_all();
        }

        let wait = decide_wait(&shared, &mut st, playing);

        let outcome = match wait {
            FeederWait::Device => {
                let mut fds = std::mem::take(&mut st.poll_fds);
                fds.clear();
                if shared.waker.has_pipe() && st.driver.poll_descriptors(&mut fds) {
                    drop(st);
                    let outcome = shared.waker.poll(&mut fds);

                    let mut st = shared.lock();
                    if outcome != WaitOutcome::PollFailed {
                        st.driver.poll_finished(&fds);
                    }
                    st.poll_fds = fds;

                    match outcome {
                        WaitOutcome::PollFailed => {
                            let timeout = device_wait_timeout(&shared, &mut st);
                            drop(st);
                            shared.waker.wait(Some(timeout))
                        }
                        other => other,
                    }
                } else {
                    st.poll_fds = fds;
                    // 猜：设备里的数据播到 25% 时醒来
                    let timeout = device_wait_timeout(&shared, &mut st);
                    drop(st);
                    shared.waker.wait(Some(timeout))
                }
            }
            FeederWait::Timeout(timeout) => {
                drop(st);
                shared.waker.wait(Some(timeout))
            }
            FeederWait::Indefinite => {
                drop(st);
                shared.waker.wait(None)
            }
        };

        if outcome == WaitOutcome::Terminate {
            break;
        }
    }

    log::debug!("Audio feeder thread exiting");
}

fn device_wait_timeout(shared: &PushShared, st: &mut PushState) -> Duration {
    let delay = shared.device_delay(st);
    Duration::try_from_secs_f64(delay * 0.25)
        .unwrap_or(MIN_DEVICE_WAIT)
        .max(MIN_DEVICE_WAIT)
}

fn decide_wait(shared: &PushShared, st: &mut PushState, playing: bool) -> FeederWait {
    if st.wait_on_device && playing {
        return FeederWait::Device;
    }

    // 设备不会主动要数据，或者我们还没准备好：等解码线程来唤醒
    let was_playing = st.still_playing;
    let mut timeout = None;

    if st.still_playing && !st.paused && st.final_chunk && shared.ring.buffered() == 0 {
        let now = now_us();
        let expected = match st.expected_end_us {
            Some(t) => t,
            None => {
                let t = now + secs_to_us(shared.unlocked_get_delay(st));
                st.expected_end_us = Some(t);
                t
            }
        };
        if expected <= now {
            st.still_playing = false;
        } else {
            timeout = Some(Duration::from_micros((expected - now) as u64));
        }
    }

    if was_playing && !st.still_playing {
        log::debug!("Audio output reached end of stream");
        st.streaming = false;
        shared.events.raise(OutputEvent::Eof);
    }
    shared.drained.notify_all();

    match timeout {
        Some(t) if st.still_playing => FeederWait::Timeout(t),
        _ => FeederWait::Indefinite,
    }
}
