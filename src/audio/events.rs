//! 输出事件
//!
//! 事件以原子位集合累积，消费方（解码线程）通过 `take()` 取走并清零。
//! 可选的唤醒回调用于通知解码线程"需要更多数据 / 有事件待处理"。
//!
//! 唤醒回调可能在设备的实时线程上被调用，实现必须不阻塞
//! （例如 `Thread::unpark`）。

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// 唤醒回调
pub type WakeupCallback = Arc<dyn Fn() + Send + Sync>;

/// 输出事件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    /// 缓冲区饿死，一次 underrun 只上报一次
    Underrun,
    /// 设备丢失或需要重新初始化，由宿主负责重建输出
    Reload,
    /// 最后一个样本已播放完毕
    Eof,
    /// 设备侧请求唤醒（例如设备参数变化）
    Wakeup,
}

impl OutputEvent {
    const ALL: [OutputEvent; 4] = [Self::Underrun, Self::Reload, Self::Eof, Self::Wakeup];

    #[inline]
    fn bit(self) -> u32 {
        match self {
            Self::Underrun => 1 << 0,
            Self::Reload => 1 << 1,
            Self::Eof => 1 << 2,
            Self::Wakeup => 1 << 3,
        }
    }
}

/// 事件集合
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputEvents(u32);

impl OutputEvents {
    #[inline]
    pub fn contains(self, event: OutputEvent) -> bool {
        self.0 & event.bit() != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = OutputEvent> {
        OutputEvent::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl fmt::Debug for OutputEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// 事件汇
pub struct EventSink {
    pending: AtomicU32,
    wakeup: Option<WakeupCallback>,
}

impl EventSink {
    pub fn new(wakeup: Option<WakeupCallback>) -> Self {
        Self {
            pending: AtomicU32::new(0),
            wakeup,
        }
    }

    /// 记录事件并唤醒消费方
    pub fn raise(&self, event: OutputEvent) {
        self.pending.fetch_or(event.bit(), Ordering::AcqRel);
        self.notify();
    }

    /// 只唤醒消费方（请求更多数据），不记录事件
    #[inline]
    pub fn notify(&self) {
        if let Some(ref wakeup) = self.wakeup {
            wakeup();
        }
    }

    /// 取走所有待处理事件
    pub fn take(&self) -> OutputEvents {
        OutputEvents(self.pending.swap(0, Ordering::AcqRel))
    }

    /// 查看待处理事件但不清除
    pub fn peek(&self) -> OutputEvents {
        OutputEvents(self.pending.load(Ordering::Acquire))
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(None)
    }
}
