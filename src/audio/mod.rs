//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 字节环形缓冲区
//! - Planes: 按 plane 组织的缓冲区组
//! - Format: 音频格式和样本打包
//! - Timing: 单调时钟
//! - Latency: 延迟计算
//! - Events: 输出事件与唤醒回调
//! - Stats: 播放统计与 underrun 记账

pub mod events;
pub mod format;
pub mod latency;
pub mod planes;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use events::{EventSink, OutputEvent, OutputEvents, WakeupCallback};
pub use format::{AudioFormat, OutputLayout, SampleFormat};
pub use planes::ChannelBuffers;
pub use ring_buffer::RingBuffer;
pub use stats::{PlaybackStats, StatsReport, UnderrunTracker};
