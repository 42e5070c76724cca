//! 演示播放引擎
//!
//! 扮演核心线程（生产者）：从样本来源读取数据，转换成设备格式，
//! 在输出有空间时调用 `play`，最后一块带上 `FINAL_CHUNK`，然后 `drain`。
//!
//! 设计要点：
//! - 输出只被核心线程访问，控制命令通过原子标志 + unpark 传递
//! - 输出请求数据时通过 wakeup 回调 unpark 核心线程，park 带超时兜底
//! - 可选的随机抖动模拟不规律的解码器

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::audio::{AudioFormat, OutputEvent, OutputLayout, SampleFormat, StatsReport, WakeupCallback};
use crate::decode::{AudioInfo, DecodeError, SampleSource};
use crate::driver::PlayFlags;
use crate::output::{AudioOutput, Backend, OutputConfig, OutputError};

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    /// 全部数据已入队，等待播完
    Draining,
    Finished,
}

impl PlaybackState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Playing,
            2 => Self::Paused,
            3 => Self::Draining,
            4 => Self::Finished,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Playing => 1,
            Self::Paused => 2,
            Self::Draining => 3,
            Self::Finished => 4,
        }
    }
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub output: OutputConfig,
    /// 每次从来源读取的帧数
    pub chunk_frames: usize,
    /// 输出布局（交织 / 非交织）
    pub layout: OutputLayout,
    /// 覆盖设备样本格式；`None` 时跟随来源位深
    pub sample_format: Option<SampleFormat>,
    /// 每次 `play` 之后随机休眠 0 ~ jitter_ms 毫秒
    pub jitter_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            chunk_frames: 4096,
            layout: OutputLayout::Interleaved,
            sample_format: None,
            jitter_ms: 0,
        }
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("failed to spawn core thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

/// 播放引擎统计
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// 已交给输出的帧数
    pub frames_queued: u64,
    /// 输出报告的延迟（秒）
    pub delay_secs: f64,
    /// 当前听到的位置（秒）
    pub position_secs: f64,
    pub underrun_count: u64,
}

/// 核心线程与控制端共享的状态
struct EngineShared {
    state: AtomicU8,
    stop: AtomicBool,
    pause_requested: AtomicBool,
    frames_queued: AtomicU64,
    /// f64 秒的位模式
    delay_bits: AtomicU64,
    underruns: AtomicU64,
    core: OnceLock<Thread>,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Stopped.as_u8()),
            stop: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            frames_queued: AtomicU64::new(0),
            delay_bits: AtomicU64::new(0f64.to_bits()),
            underruns: AtomicU64::new(0),
            core: OnceLock::new(),
        }
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn unpark_core(&self) {
        if let Some(t) = self.core.get() {
            t.unpark();
        }
    }
}

/// 播放引擎
pub struct Engine {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    core_thread: Option<JoinHandle<StatsReport>>,
    info: Option<AudioInfo>,
    format: Option<AudioFormat>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            shared: Arc::new(EngineShared::new()),
            core_thread: None,
            info: None,
            format: None,
        }
    }

    /// 打开输出并启动核心线程
    pub fn start(&mut self, source: Box<dyn SampleSource>, backend: Backend) -> Result<(), EngineError> {
        if self.core_thread.is_some() {
            return Err(EngineError::InvalidState("engine already running"));
        }

        let info = source.info().clone();
        log::info!(
            "Source: {} | Codec: {} | {}Hz {}ch {}bit | Duration: {:.1}s",
            info.format,
            info.codec,
            info.sample_rate,
            info.channels,
            info.bit_depth.unwrap_or(0),
            info.duration_secs.unwrap_or(0.0)
        );

        let bits = info.bit_depth.unwrap_or(24) as u16;
        let mut format = AudioFormat::new(info.sample_rate, info.channels, bits).with_layout(self.config.layout);
        if let Some(sample_format) = self.config.sample_format {
            format = format.with_sample_format(sample_format);
        }

        self.shared = Arc::new(EngineShared::new());
        let remote = Arc::clone(&self.shared);
        let wakeup: WakeupCallback = Arc::new(move || remote.unpark_core());

        let output = AudioOutput::open(backend, format, self.config.output.clone(), Some(wakeup))?;

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        self.shared.set_state(PlaybackState::Playing);

        let handle = thread::Builder::new()
            .name("core".to_string())
            .spawn(move || core_thread_main(output, source, shared, config))
            .map_err(|e| {
                self.shared.set_state(PlaybackState::Stopped);
                EngineError::ThreadSpawn(e)
            })?;

        self.core_thread = Some(handle);
        self.info = Some(info);
        self.format = Some(format);
        Ok(())
    }

    /// 暂停/恢复
    pub fn toggle_pause(&mut self) -> Result<(), EngineError> {
        match self.state() {
            PlaybackState::Playing => self.set_paused(true),
            PlaybackState::Paused => self.set_paused(false),
            PlaybackState::Draining => Err(EngineError::InvalidState("cannot pause while draining")),
            PlaybackState::Stopped | PlaybackState::Finished => {
                Err(EngineError::InvalidState("cannot pause when stopped"))
            }
        }
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), EngineError> {
        self.shared.pause_requested.store(paused, Ordering::Release);
        self.shared.unpark_core();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        match self.state() {
            PlaybackState::Playing => self.set_paused(true),
            _ => Err(EngineError::InvalidState("not playing")),
        }
    }

    pub fn resume(&mut self) -> Result<(), EngineError> {
        match self.state() {
            PlaybackState::Paused => self.set_paused(false),
            _ => Err(EngineError::InvalidState("not paused")),
        }
    }

    /// 停止播放并丢弃缓冲数据
    pub fn stop(&mut self) -> Option<StatsReport> {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.unpark_core();
        self.join()
    }

    /// 等待播放自然结束
    pub fn wait(&mut self) -> Option<StatsReport> {
        self.join()
    }

    fn join(&mut self) -> Option<StatsReport> {
        let handle = self.core_thread.take()?;
        match handle.join() {
            Ok(report) => Some(report),
            Err(_) => {
                log::error!("Core thread panicked");
                self.shared.set_state(PlaybackState::Stopped);
                None
            }
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// 核心线程已经退出（正常结束或被停止）
    pub fn is_finished(&self) -> bool {
        self.core_thread.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn stats(&self) -> EngineStats {
        let frames_queued = self.shared.frames_queued.load(Ordering::Relaxed);
        let delay_secs = f64::from_bits(self.shared.delay_bits.load(Ordering::Relaxed));
        let rate = self.format.map_or(48000, |f| f.sample_rate).max(1);

        EngineStats {
            frames_queued,
            delay_secs,
            position_secs: (frames_queued as f64 / rate as f64 - delay_secs).max(0.0),
            underrun_count: self.shared.underruns.load(Ordering::Relaxed),
        }
    }

    pub fn current_info(&self) -> Option<&AudioInfo> {
        self.info.as_ref()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.core_thread.is_some() {
            self.stop();
        }
    }
}

/// 交给输出之前已经打包好的一块数据
struct Chunk {
    planes: Vec<Vec<u8>>,
    frames: usize,
    offset: usize,
}

impl Chunk {
    fn new(num_planes: usize) -> Self {
        Self {
            planes: vec![Vec::new(); num_planes],
            frames: 0,
            offset: 0,
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.frames - self.offset
    }
}

/// 读一块并打包；返回 false 表示来源已结束
fn fill_chunk(
    source: &mut dyn SampleSource,
    format: &AudioFormat,
    scratch: &mut Vec<i32>,
    chunk: &mut Chunk,
    frames: usize,
) -> bool {
    let n = match source.read_frames(scratch, frames) {
        Ok(n) => n,
        Err(e) => {
            log::error!("Decode error: {}", e);
            0
        }
    };
    chunk.frames = if n > 0 { format.pack_planes(scratch, &mut chunk.planes) } else { 0 };
    chunk.offset = 0;
    chunk.frames > 0
}

/// 核心线程主函数
fn core_thread_main(
    mut output: AudioOutput,
    mut source: Box<dyn SampleSource>,
    shared: Arc<EngineShared>,
    config: EngineConfig,
) -> StatsReport {
    let _ = shared.core.set(thread::current());

    let format = output.format();
    let sstride = format.sstride();
    let chunk_frames = config.chunk_frames.max(1);
    // 输出没有主动唤醒时的兜底等待
    let idle_wait = Duration::from_millis((config.output.buffer_ms / 4).clamp(1, 50));
    let mut rng = rand::thread_rng();

    let mut scratch = Vec::with_capacity(chunk_frames * format.channels as usize);
    let mut current = Chunk::new(format.num_planes());
    let mut next = Chunk::new(format.num_planes());

    // 预读一块，用来判断当前块是不是最后一块
    let mut has_current = fill_chunk(source.as_mut(), &format, &mut scratch, &mut current, chunk_frames);
    let mut has_next = has_current && fill_chunk(source.as_mut(), &format, &mut scratch, &mut next, chunk_frames);
    let mut paused = false;

    log::info!("Core thread started, chunk={} frames", chunk_frames);

    while has_current {
        if shared.stop.load(Ordering::Acquire) {
            output.reset();
            shared.set_state(PlaybackState::Stopped);
            log::info!("Playback stopped");
            return output.stats_report();
        }

        let want_pause = shared.pause_requested.load(Ordering::Acquire);
        if want_pause != paused {
            paused = want_pause;
            if paused {
                output.pause();
                shared.set_state(PlaybackState::Paused);
                log::info!("Paused");
            } else {
                output.resume();
                shared.set_state(PlaybackState::Playing);
                log::info!("Resumed");
            }
        }
        if paused {
            thread::park();
            continue;
        }

        let events = output.take_events();
        if events.contains(OutputEvent::Underrun) {
            shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        shared
            .delay_bits
            .store(output.get_delay().to_bits(), Ordering::Relaxed);

        let space = output.get_space();
        if space == 0 {
            thread::park_timeout(idle_wait);
            continue;
        }

        let n = space.min(current.remaining());
        let flags = if !has_next && n == current.remaining() {
            PlayFlags::FINAL_CHUNK
        } else {
            PlayFlags::NONE
        };

        let start = current.offset * sstride;
        let end = (current.offset + n) * sstride;
        let planes: Vec<&[u8]> = current.planes.iter().map(|p| &p[start..end]).collect();
        let accepted = output.play(&planes, n, flags);

        current.offset += accepted;
        shared.frames_queued.fetch_add(accepted as u64, Ordering::Relaxed);

        if current.remaining() == 0 {
            if has_next {
                std::mem::swap(&mut current, &mut next);
                has_next = fill_chunk(source.as_mut(), &format, &mut scratch, &mut next, chunk_frames);
            } else {
                has_current = false;
            }
        } else if accepted == 0 {
            thread::park_timeout(idle_wait);
        }

        if config.jitter_ms > 0 {
            thread::sleep(Duration::from_millis(rng.gen_range(0..=config.jitter_ms)));
        }
    }

    shared.set_state(PlaybackState::Draining);
    log::info!("Source finished, draining audio output");
    output.drain();

    if output.take_events().contains(OutputEvent::Underrun) {
        shared.underruns.fetch_add(1, Ordering::Relaxed);
    }
    shared.delay_bits.store(0f64.to_bits(), Ordering::Relaxed);
    shared.set_state(PlaybackState::Finished);
    log::info!("Playback finished");

    output.stats_report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ToneSource;
    use crate::driver::null::{NullCallbackDriver, NullConfig, NullDriver};
    use std::time::Instant;

    fn config(layout: OutputLayout) -> EngineConfig {
        EngineConfig {
            output: OutputConfig {
                buffer_ms: 100,
                ..Default::default()
            },
            chunk_frames: 1000,
            layout,
            sample_format: None,
            jitter_ms: 0,
        }
    }

    fn null_config() -> NullConfig {
        NullConfig {
            buffer_ms: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_push_plays_tone_to_end() {
        let mut engine = Engine::new(config(OutputLayout::Interleaved));
        let tone = ToneSource::new(48000, 2, 440.0, 0.5, 0.3);
        let backend = Backend::Push(Box::new(NullDriver::new(null_config())));

        let start = Instant::now();
        engine.start(Box::new(tone), backend).unwrap();
        let report = engine.wait().unwrap();

        assert_eq!(engine.state(), PlaybackState::Finished);
        assert_eq!(engine.stats().frames_queued, 14400);
        assert!(report.samples_played > 0);
        // 0.3 秒的音频至少要实时播放 0.3 秒
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_pull_planar_plays_tone_to_end() {
        let mut engine = Engine::new(config(OutputLayout::NonInterleaved));
        let tone = ToneSource::new(48000, 2, 440.0, 0.5, 0.2);
        let backend = Backend::Pull(Box::new(NullCallbackDriver::new(null_config())));

        engine.start(Box::new(tone), backend).unwrap();
        engine.wait().unwrap();

        assert_eq!(engine.state(), PlaybackState::Finished);
        assert_eq!(engine.stats().frames_queued, 9600);
    }

    #[test]
    fn test_pause_resume_and_stop() {
        let mut engine = Engine::new(config(OutputLayout::Interleaved));
        let tone = ToneSource::new(48000, 2, 440.0, 0.5, 10.0);
        let backend = Backend::Push(Box::new(NullDriver::new(null_config())));
        engine.start(Box::new(tone), backend).unwrap();

        assert!(engine.toggle_pause().is_ok());
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.state() != PlaybackState::Paused && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.state(), PlaybackState::Paused);

        // 暂停期间不再入队
        let queued = engine.stats().frames_queued;
        thread::sleep(Duration::from_millis(100));
        assert_eq!(engine.stats().frames_queued, queued);

        engine.toggle_pause().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.stats().frames_queued == queued && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(engine.stats().frames_queued > queued);

        assert!(engine.stop().is_some());
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(engine.is_finished());
    }

    #[test]
    fn test_float_output_with_jitter() {
        let mut cfg = config(OutputLayout::Interleaved);
        cfg.sample_format = Some(SampleFormat::F32);
        cfg.jitter_ms = 2;
        let mut engine = Engine::new(cfg);
        let tone = ToneSource::new(48000, 1, 440.0, 0.5, 0.1);
        let backend = Backend::Push(Box::new(NullDriver::new(null_config())));

        engine.start(Box::new(tone), backend).unwrap();
        engine.wait().unwrap();
        assert_eq!(engine.state(), PlaybackState::Finished);
        assert_eq!(engine.stats().frames_queued, 4800);
    }

    #[test]
    fn test_empty_source_finishes() {
        let mut engine = Engine::new(config(OutputLayout::Interleaved));
        let tone = ToneSource::new(48000, 2, 440.0, 0.5, 0.0);
        let backend = Backend::Push(Box::new(NullDriver::new(null_config())));

        engine.start(Box::new(tone), backend).unwrap();
        engine.wait().unwrap();
        assert_eq!(engine.state(), PlaybackState::Finished);
        assert_eq!(engine.stats().frames_queued, 0);
    }

    #[test]
    fn test_pause_when_stopped_fails() {
        let mut engine = Engine::new(EngineConfig::default());
        assert!(matches!(
            engine.toggle_pause(),
            Err(EngineError::InvalidState(_))
        ));
    }
}
