//! 设备驱动接口
//!
//! 具体后端（ALSA / PulseAudio / CoreAudio ...）通过这里的 trait 接入调度层。
//! 两种驱动方式二选一：
//! - `PushDriver`: 调度层的喂数据线程主动询问空间并写入
//! - `PullDriver`: 设备自己的实时线程回调 `PullSource::pull` 取数据
//!
//! 可选能力用默认实现表达（返回 `false` / `None` / `Unknown` 表示不支持）。

pub mod null;

use std::ops::BitOr;
use std::sync::Arc;

use thiserror::Error;

use crate::audio::{AudioFormat, EventSink, OutputEvent};
use crate::output::pull::PullSource;

/// 驱动错误
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("audio device not available: {0}")]
    Unavailable(String),

    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(AudioFormat),

    /// 设备丢失，调度层会发出 Reload 事件
    #[error("audio device lost")]
    DeviceLost,

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `play()` 标志
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayFlags(u8);

impl PlayFlags {
    pub const NONE: PlayFlags = PlayFlags(0);
    /// 这是流的最后一块数据：设备应立即冲刷，而不是等凑满一个周期
    pub const FINAL_CHUNK: PlayFlags = PlayFlags(1 << 0);

    #[inline]
    pub fn contains(self, other: PlayFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_final(self) -> bool {
        self.contains(Self::FINAL_CHUNK)
    }
}

impl BitOr for PlayFlags {
    type Output = PlayFlags;

    fn bitor(self, rhs: PlayFlags) -> PlayFlags {
        PlayFlags(self.0 | rhs.0)
    }
}

/// 设备参数
///
/// `init()` 可以修改格式（例如改成设备支持的位深或布局），
/// 并必须填写设备缓冲区深度；之后调度层视其为只读。
#[derive(Clone, Copy, Debug)]
pub struct DeviceParams {
    pub format: AudioFormat,
    /// 设备侧缓冲区深度（样本数），推模式必须大于 0
    pub device_buffer: usize,
    /// 设备要求的写入对齐（样本数），至少为 1
    pub period_size: usize,
}

impl DeviceParams {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            device_buffer: 0,
            period_size: 1,
        }
    }
}

/// 控制命令
#[derive(Clone, Debug, PartialEq)]
pub enum Control {
    GetVolume,
    /// 0.0 ~ 1.0
    SetVolume(f32),
    GetMute,
    SetMute(bool),
    UpdateStreamTitle(String),
}

/// 控制命令的结果
#[derive(Clone, Debug, PartialEq)]
pub enum ControlReply {
    Done,
    Volume(f32),
    Mute(bool),
    /// 驱动不支持该命令
    Unknown,
    Failed,
}

type FeederWake = Arc<dyn Fn() + Send + Sync>;

/// 驱动上下文
///
/// 驱动在 `init()` 时收到，之后可以在任意线程上使用。
#[derive(Clone)]
pub struct DriverContext {
    events: Arc<EventSink>,
    feeder: Option<FeederWake>,
}

impl DriverContext {
    pub(crate) fn new(events: Arc<EventSink>, feeder: Option<FeederWake>) -> Self {
        Self { events, feeder }
    }

    /// 请求宿主重建输出（设备丢失、格式改变）
    pub fn request_reload(&self) {
        log::warn!("Audio driver requested reload");
        self.events.raise(OutputEvent::Reload);
    }

    /// 上报设备侧事件（例如音量被外部修改）
    pub fn notify(&self) {
        self.events.raise(OutputEvent::Wakeup);
    }

    /// 唤醒推模式的喂数据线程（例如设备腾出了空间）
    ///
    /// 拉模式下为空操作
    pub fn wake_feeder(&self) {
        if let Some(ref wake) = self.feeder {
            wake();
        }
    }
}

/// 所有驱动共有的部分
pub trait Driver: Send {
    fn name(&self) -> &'static str;

    /// 打开设备
    fn init(&mut self, params: &mut DeviceParams, ctx: DriverContext) -> Result<(), DriverError>;

    /// 关闭设备；调用后不会再有任何回调
    fn uninit(&mut self) {}

    fn control(&mut self, _cmd: &Control) -> ControlReply {
        ControlReply::Unknown
    }
}

/// 推模式驱动
///
/// 所有方法都只在持有调度层状态锁时被调用，不会并发。
pub trait PushDriver: Driver {
    /// 设备当前能接收的样本数（应按 `period_size` 对齐）
    fn get_space(&mut self) -> usize;

    /// 写入 `samples` 个样本，返回设备实际接收的数量
    ///
    /// 除非带 `FINAL_CHUNK`，`samples` 总是 `period_size` 的整数倍
    fn play(&mut self, planes: &[&[u8]], samples: usize, flags: PlayFlags) -> Result<usize, DriverError>;

    /// 设备侧延迟（秒）；`None` 表示由调度层按时间戳推算
    fn get_delay(&mut self) -> Option<f64> {
        None
    }

    /// 停止输出并丢弃设备内缓冲
    fn reset(&mut self);

    /// 原生暂停，不支持时返回 `false`（调度层会改用 reset + 静音补偿）
    fn pause(&mut self) -> bool {
        false
    }

    fn resume(&mut self) -> bool {
        false
    }

    /// 阻塞直到设备播完，不支持时返回 `false`（调度层按延迟休眠）
    fn drain(&mut self) -> bool {
        false
    }

    /// 基于 poll 的等待：填入要等待的描述符，返回 `false` 表示不使用
    ///
    /// 调度层会追加自己的唤醒管道，在释放状态锁的情况下 poll，
    /// 然后重新加锁调用 `poll_finished`。
    fn poll_descriptors(&mut self, _fds: &mut Vec<libc::pollfd>) -> bool {
        false
    }

    /// poll 返回后处理 `revents`
    fn poll_finished(&mut self, _fds: &[libc::pollfd]) {}
}

/// 拉模式驱动
pub trait PullDriver: Driver {
    /// 启动设备回调；回调线程通过 `source.pull()` 取数据
    ///
    /// `source` 可以被克隆并移入回调线程
    fn resume(&mut self, source: &PullSource);

    /// 原生暂停，不支持时返回 `false`（调度层会改用 reset）
    fn pause(&mut self) -> bool {
        false
    }

    /// 停止回调；返回后不再调用 `pull`
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_flags() {
        assert!(!PlayFlags::NONE.is_final());
        assert!(PlayFlags::FINAL_CHUNK.is_final());
        assert!((PlayFlags::NONE | PlayFlags::FINAL_CHUNK).contains(PlayFlags::FINAL_CHUNK));
        assert_eq!(PlayFlags::default(), PlayFlags::NONE);
    }

    #[test]
    fn test_context_reload_event() {
        let events = Arc::new(EventSink::default());
        let ctx = DriverContext::new(Arc::clone(&events), None);
        ctx.wake_feeder();
        ctx.request_reload();
        assert!(events.take().contains(OutputEvent::Reload));
    }
}
