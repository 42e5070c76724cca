//! 空设备
//!
//! 不发出声音，但按真实时钟消耗数据：
//! - `NullDriver`: 推模式，模拟一个按采样率排空的设备缓冲区
//! - `NullCallbackDriver`: 拉模式，自带一个周期性的"实时"回调线程
//!
//! 每个实例拥有自己的线程和状态，可以同时打开多个。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::timing::{now_us, secs_to_us};
use crate::audio::AudioFormat;
use crate::output::pull::PullSource;

use super::{
    Control, ControlReply, DeviceParams, Driver, DriverContext, DriverError, PlayFlags, PullDriver, PushDriver,
};

/// 空设备配置
#[derive(Clone, Debug)]
pub struct NullConfig {
    /// 设备缓冲区时长（毫秒）
    pub buffer_ms: u64,
    /// 写入对齐 / 回调周期（样本数）
    pub period_samples: usize,
    /// 缓冲区之外的固定输出延迟（毫秒）
    pub latency_ms: u64,
    /// 是否支持原生暂停
    pub native_pause: bool,
    /// 是否报告设备延迟；不报告时由调度层按时间戳推算
    pub report_delay: bool,
}

impl Default for NullConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 200,
            period_samples: 256,
            latency_ms: 0,
            native_pause: true,
            report_delay: true,
        }
    }
}

struct NullShared {
    ctx: Mutex<Option<DriverContext>>,
    lost: AtomicBool,
}

impl NullShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ctx: Mutex::new(None),
            lost: AtomicBool::new(false),
        })
    }

    fn set_context(&self, ctx: DriverContext) {
        *self.ctx.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
    }

    fn context(&self) -> Option<DriverContext> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// 从外部操纵空设备（模拟热拔插等）
#[derive(Clone)]
pub struct NullHandle {
    shared: Arc<NullShared>,
}

impl NullHandle {
    /// 模拟设备丢失：之后的写入失败，并请求宿主重建输出
    pub fn simulate_device_loss(&self) {
        self.shared.lost.store(true, Ordering::Release);
        if let Some(ctx) = self.shared.context() {
            ctx.request_reload();
        }
    }
}

/// 通用的音量 / 静音处理
#[derive(Debug)]
struct Mixer {
    volume: f32,
    muted: bool,
}

impl Mixer {
    fn new() -> Self {
        Self {
            volume: 1.0,
            muted: false,
        }
    }

    fn control(&mut self, cmd: &Control) -> ControlReply {
        match *cmd {
            Control::GetVolume => ControlReply::Volume(self.volume),
            Control::SetVolume(v) => {
                self.volume = v.clamp(0.0, 1.0);
                ControlReply::Done
            }
            Control::GetMute => ControlReply::Mute(self.muted),
            Control::SetMute(m) => {
                self.muted = m;
                ControlReply::Done
            }
            Control::UpdateStreamTitle(_) => ControlReply::Unknown,
        }
    }
}

/// 推模式空设备
pub struct NullDriver {
    config: NullConfig,
    shared: Arc<NullShared>,
    mixer: Mixer,

    rate: f64,
    device_buffer: usize,
    period: usize,

    /// 设备内尚未"播放"的样本（小数部分来自时钟换算）
    buffered: f64,
    last_tick: Instant,
    paused: bool,
}

impl NullDriver {
    pub fn new(config: NullConfig) -> Self {
        Self {
            config,
            shared: NullShared::new(),
            mixer: Mixer::new(),
            rate: 0.0,
            device_buffer: 0,
            period: 1,
            buffered: 0.0,
            last_tick: Instant::now(),
            paused: false,
        }
    }

    pub fn handle(&self) -> NullHandle {
        NullHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 按经过的时间排空设备缓冲区
    fn advance(&mut self) {
        let now = Instant::now();
        if !self.paused {
            let played = now.duration_since(self.last_tick).as_secs_f64() * self.rate;
            self.buffered = (self.buffered - played).max(0.0);
        }
        self.last_tick = now;
    }

    fn free(&self) -> usize {
        self.device_buffer
            .saturating_sub(self.buffered.ceil() as usize)
    }
}

impl Driver for NullDriver {
    fn name(&self) -> &'static str {
        "null"
    }

    fn init(&mut self, params: &mut DeviceParams, ctx: DriverContext) -> Result<(), DriverError> {
        let rate = params.format.sample_rate;
        if rate == 0 {
            return Err(DriverError::UnsupportedFormat(params.format));
        }

        self.rate = rate as f64;
        self.period = self.config.period_samples.max(1);
        let samples = (rate as u64 * self.config.buffer_ms / 1000) as usize;
        // 向上对齐到周期
        self.device_buffer = samples.div_ceil(self.period).max(1) * self.period;
        self.buffered = 0.0;
        self.last_tick = Instant::now();

        params.device_buffer = self.device_buffer;
        params.period_size = self.period;
        self.shared.set_context(ctx);

        log::debug!(
            "Null device opened: {} samples buffer, period {}",
            self.device_buffer,
            self.period
        );
        Ok(())
    }

    fn control(&mut self, cmd: &Control) -> ControlReply {
        self.mixer.control(cmd)
    }
}

impl PushDriver for NullDriver {
    fn get_space(&mut self) -> usize {
        self.advance();
        self.free() / self.period * self.period
    }

    fn play(&mut self, _planes: &[&[u8]], samples: usize, flags: PlayFlags) -> Result<usize, DriverError> {
        if self.shared.lost.load(Ordering::Acquire) {
            return Err(DriverError::DeviceLost);
        }

        self.advance();
        let mut accepted = samples.min(self.free());
        if !flags.is_final() {
            accepted = accepted / self.period * self.period;
        }
        self.buffered += accepted as f64;
        Ok(accepted)
    }

    fn get_delay(&mut self) -> Option<f64> {
        if !self.config.report_delay {
            return None;
        }
        self.advance();
        Some(self.config.latency_ms as f64 / 1000.0 + self.buffered / self.rate)
    }

    fn reset(&mut self) {
        self.buffered = 0.0;
        self.paused = false;
        self.last_tick = Instant::now();
    }

    fn pause(&mut self) -> bool {
        if !self.config.native_pause {
            return false;
        }
        self.advance();
        self.paused = true;
        true
    }

    fn resume(&mut self) -> bool {
        if !self.config.native_pause {
            return false;
        }
        self.advance();
        self.paused = false;
        true
    }
}

/// 拉模式空设备
pub struct NullCallbackDriver {
    config: NullConfig,
    shared: Arc<NullShared>,
    mixer: Mixer,

    format: Option<AudioFormat>,
    period: usize,

    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NullCallbackDriver {
    pub fn new(config: NullConfig) -> Self {
        Self {
            config,
            shared: NullShared::new(),
            mixer: Mixer::new(),
            format: None,
            period: 1,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn handle(&self) -> NullHandle {
        NullHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Null callback thread panicked");
            }
        }
    }
}

impl Driver for NullCallbackDriver {
    fn name(&self) -> &'static str {
        "null-callback"
    }

    fn init(&mut self, params: &mut DeviceParams, ctx: DriverContext) -> Result<(), DriverError> {
        if params.format.sample_rate == 0 {
            return Err(DriverError::UnsupportedFormat(params.format));
        }

        let rate = params.format.sample_rate as u64;
        // 回调周期：配置的周期和缓冲区时长取较大者
        self.period = self
            .config
            .period_samples
            .max((rate * self.config.buffer_ms / 1000) as usize)
            .max(1);
        self.format = Some(params.format);

        params.device_buffer = self.period;
        params.period_size = self.period;
        self.shared.set_context(ctx);
        Ok(())
    }

    fn uninit(&mut self) {
        self.stop();
    }

    fn control(&mut self, cmd: &Control) -> ControlReply {
        self.mixer.control(cmd)
    }
}

impl PullDriver for NullCallbackDriver {
    fn resume(&mut self, source: &PullSource) {
        if self.thread.is_some() {
            return;
        }
        let Some(format) = self.format else {
            log::error!("Null callback device resumed before init");
            return;
        };

        let period = self.period;
        let latency_us = secs_to_us(self.config.latency_ms as f64 / 1000.0);
        let running = Arc::clone(&self.running);
        let source = source.clone();
        running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("null-callback".into())
            .spawn(move || callback_loop(source, format, period, latency_us, running));

        match spawned {
            Ok(handle) => self.thread = Some(handle),
            Err(e) => {
                log::error!("Failed to start null callback thread: {}", e);
                self.running.store(false, Ordering::Release);
                if let Some(ctx) = self.shared.context() {
                    ctx.request_reload();
                }
            }
        }
    }

    fn pause(&mut self) -> bool {
        if !self.config.native_pause {
            return false;
        }
        self.stop();
        true
    }

    fn reset(&mut self) {
        self.stop();
    }
}

impl Drop for NullCallbackDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 模拟设备的实时回调：每个周期取一次数据
fn callback_loop(
    source: PullSource,
    format: AudioFormat,
    period: usize,
    latency_us: i64,
    running: Arc<AtomicBool>,
) {
    // 缓冲区只在启动时分配一次
    let mut planes = vec![vec![0u8; period * format.sstride()]; format.num_planes()];
    let mut refs: Vec<&mut [u8]> = planes.iter_mut().map(|p| &mut p[..]).collect();

    let interval = format.samples_to_duration(period);
    let interval_us = interval.as_micros() as i64;
    let mut next = Instant::now();

    while running.load(Ordering::Acquire) {
        // 这批数据的最后一个样本在一个周期之后被"听到"
        let out_time = now_us() + interval_us + latency_us;
        source.pull(&mut refs, period, out_time);

        next += interval;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else if now - next > interval {
            // 落后太多就不追了
            next = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::EventSink;
    use crate::audio::OutputEvent;

    fn params() -> DeviceParams {
        DeviceParams::new(AudioFormat::new(48000, 2, 16))
    }

    fn context(events: &Arc<EventSink>) -> DriverContext {
        DriverContext::new(Arc::clone(events), None)
    }

    #[test]
    fn test_null_device_buffer_drains_in_real_time() {
        let events = Arc::new(EventSink::default());
        let mut driver = NullDriver::new(NullConfig {
            buffer_ms: 100,
            ..NullConfig::default()
        });
        let mut params = params();
        driver.init(&mut params, context(&events)).unwrap();

        // 4800 向上对齐到 256 的倍数
        assert_eq!(params.device_buffer, 4864);
        assert_eq!(driver.get_space(), 4864);

        let data = vec![0u8; 4864 * 4];
        // 非最后一块：按周期对齐
        assert_eq!(driver.play(&[&data[..]], 1000, PlayFlags::NONE).unwrap(), 768);
        assert_eq!(driver.play(&[&data[..]], 100, PlayFlags::FINAL_CHUNK).unwrap(), 100);

        let delay = driver.get_delay().unwrap();
        assert!(delay <= 868.0 / 48000.0 && delay > 0.0);

        thread::sleep(Duration::from_millis(30));
        assert!(driver.get_delay().unwrap() < delay);
    }

    #[test]
    fn test_null_native_pause_stops_clock() {
        let events = Arc::new(EventSink::default());
        let mut driver = NullDriver::new(NullConfig::default());
        let mut params = params();
        driver.init(&mut params, context(&events)).unwrap();

        let data = vec![0u8; 2560 * 4];
        driver.play(&[&data[..]], 2560, PlayFlags::NONE).unwrap();
        assert!(driver.pause());
        let paused = driver.get_delay().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.get_delay().unwrap(), paused);
        assert!(driver.resume());

        driver.reset();
        assert_eq!(driver.get_delay(), Some(0.0));
    }

    #[test]
    fn test_null_device_loss() {
        let events = Arc::new(EventSink::default());
        let mut driver = NullDriver::new(NullConfig::default());
        let mut params = params();
        driver.init(&mut params, context(&events)).unwrap();

        driver.handle().simulate_device_loss();
        assert!(events.take().contains(OutputEvent::Reload));
        let data = vec![0u8; 256 * 4];
        assert!(matches!(
            driver.play(&[&data[..]], 256, PlayFlags::NONE),
            Err(DriverError::DeviceLost)
        ));
    }

    #[test]
    fn test_mixer_control() {
        let mut driver = NullCallbackDriver::new(NullConfig::default());
        assert_eq!(driver.control(&Control::SetVolume(2.0)), ControlReply::Done);
        assert_eq!(driver.control(&Control::GetVolume), ControlReply::Volume(1.0));
        assert_eq!(driver.control(&Control::SetMute(true)), ControlReply::Done);
        assert_eq!(driver.control(&Control::GetMute), ControlReply::Mute(true));
        assert!(!driver.is_running());
    }
}
