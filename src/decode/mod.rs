//! 样本来源
//!
//! 演示引擎的生产者端：文件解码器和测试音发生器。
//! 两者都产出交织、左对齐到 i32 高位的样本。

mod decoder;

use std::f64::consts::TAU;

use thiserror::Error;

pub use decoder::AudioDecoder;

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("unsupported audio format")]
    UnsupportedFormat,

    #[error("no audio track found")]
    NoAudioTrack,

    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// 音源信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// 原始位深
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 容器名称
    pub format: String,
    /// 编解码器名称
    pub codec: String,
}

/// 可以逐块读取样本的来源
pub trait SampleSource: Send {
    fn info(&self) -> &AudioInfo;

    /// 读取最多 `frames` 帧到 `out`（先清空），返回实际帧数
    ///
    /// 返回 0 表示来源已经结束
    fn read_frames(&mut self, out: &mut Vec<i32>, frames: usize) -> Result<usize, DecodeError>;
}

/// 正弦测试音
pub struct ToneSource {
    info: AudioInfo,
    frequency: f64,
    amplitude: f64,
    phase: f64,
    remaining: u64,
}

impl ToneSource {
    /// `amplitude` 取值 0.0 ~ 1.0
    pub fn new(sample_rate: u32, channels: u16, frequency: f64, amplitude: f64, secs: f64) -> Self {
        let total_frames = (secs.max(0.0) * sample_rate as f64) as u64;
        Self {
            info: AudioInfo {
                sample_rate,
                channels,
                bit_depth: Some(32),
                total_frames: Some(total_frames),
                duration_secs: Some(total_frames as f64 / sample_rate.max(1) as f64),
                format: "Tone".to_string(),
                codec: "sine".to_string(),
            },
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
            remaining: total_frames,
        }
    }
}

impl SampleSource for ToneSource {
    fn info(&self) -> &AudioInfo {
        &self.info
    }

    fn read_frames(&mut self, out: &mut Vec<i32>, frames: usize) -> Result<usize, DecodeError> {
        out.clear();
        let frames = (frames as u64).min(self.remaining) as usize;
        let step = TAU * self.frequency / self.info.sample_rate.max(1) as f64;
        let scale = self.amplitude * i32::MAX as f64;

        for _ in 0..frames {
            let value = (self.phase.sin() * scale) as i32;
            for _ in 0..self.info.channels {
                out.push(value);
            }
            self.phase = (self.phase + step) % TAU;
        }

        self.remaining -= frames as u64;
        Ok(frames)
    }
}
