//! 音频格式与样本打包
//!
//! 内部表示：所有位深统一左对齐到 i32 的高位
//! - 16-bit: 占据 bit[31:16]，bit[15:0] = 0
//! - 24-bit: 占据 bit[31:8]，bit[7:0] = 0
//! - 32-bit: 占据 bit[31:0]
//!
//! 调度层的"样本数"指每个 plane 上的样本位置数（即帧数），
//! 一个样本在单个 plane 里占 `sstride()` 字节。

use std::time::Duration;

/// 样本编码
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// 无符号 8-bit，静音值 0x80
    U8,
    S16,
    /// 24-bit packed（3 字节）
    S24,
    S32,
    F32,
}

impl SampleFormat {
    /// 由位深选择整数格式
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(Self::U8),
            16 => Some(Self::S16),
            24 => Some(Self::S24),
            32 => Some(Self::S32),
            _ => None,
        }
    }

    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S24 => 3,
            Self::S32 | Self::F32 => 4,
        }
    }

    #[inline]
    pub fn bits(self) -> u16 {
        self.bytes() as u16 * 8
    }

    /// 静音的字节模式
    #[inline]
    fn silence_byte(self) -> u8 {
        match self {
            Self::U8 => 0x80,
            _ => 0,
        }
    }
}

/// 输出布局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OutputLayout {
    /// 交织：LRLRLR...，所有样本在 plane 0
    #[default]
    Interleaved,
    /// 非交织：每声道独立 plane，plane 0=L, plane 1=R
    NonInterleaved,
}

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub layout: OutputLayout,
}

impl AudioFormat {
    /// 创建交织整数格式；不支持的位深回退到 S32
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::from_bits(bits_per_sample).unwrap_or(SampleFormat::S32),
            layout: OutputLayout::default(),
        }
    }

    pub fn with_sample_format(mut self, sample_format: SampleFormat) -> Self {
        self.sample_format = sample_format;
        self
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    pub fn is_planar(&self) -> bool {
        self.layout == OutputLayout::NonInterleaved
    }

    /// plane 数（交织为 1，非交织为声道数）
    #[inline]
    pub fn num_planes(&self) -> usize {
        if self.is_planar() {
            self.channels as usize
        } else {
            1
        }
    }

    /// 单个 plane 中一个样本位置的字节数
    #[inline]
    pub fn sstride(&self) -> usize {
        if self.is_planar() {
            self.sample_format.bytes()
        } else {
            self.bytes_per_frame()
        }
    }

    /// 每帧的字节数（全部声道）
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes() * self.channels as usize
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.sample_format.bytes()
    }

    /// 样本数换算成秒
    #[inline]
    pub fn samples_to_secs(&self, samples: usize) -> f64 {
        samples as f64 / self.sample_rate as f64
    }

    /// 秒换算成样本数（向下取整，负数为 0）
    #[inline]
    pub fn secs_to_samples(&self, secs: f64) -> usize {
        (secs.max(0.0) * self.sample_rate as f64) as usize
    }

    #[inline]
    pub fn samples_to_duration(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(self.samples_to_secs(samples))
    }

    /// 用静音填充缓冲区
    pub fn fill_silence(&self, buf: &mut [u8]) {
        buf.fill(self.sample_format.silence_byte());
    }

    /// 将交织的 i32 样本（左对齐）打包为交织输出字节
    pub fn samples_to_bytes(&self, samples: &[i32], output: &mut [u8]) {
        let bytes = self.bytes_per_sample();
        for (sample, out) in samples.iter().zip(output.chunks_exact_mut(bytes)) {
            encode_sample(self.sample_format, *sample, out);
        }
    }

    /// 提取单个声道的样本并转换为字节
    ///
    /// 用于 NonInterleaved 输出
    pub fn extract_channel_to_bytes(
        &self,
        samples: &[i32],
        channel: usize,
        channels: usize,
        output: &mut [u8],
    ) {
        let bytes = self.bytes_per_sample();
        let source = samples.iter().skip(channel).step_by(channels);
        for (sample, out) in source.zip(output.chunks_exact_mut(bytes)) {
            encode_sample(self.sample_format, *sample, out);
        }
    }

    /// 按当前布局把交织样本打包到各 plane
    ///
    /// `planes` 的长度必须等于 `num_planes()`，返回写入的帧数
    pub fn pack_planes(&self, samples: &[i32], planes: &mut [Vec<u8>]) -> usize {
        let channels = self.channels as usize;
        let frames = samples.len() / channels;
        let plane_len = frames * self.sstride();

        for plane in planes.iter_mut() {
            plane.resize(plane_len, 0);
        }

        if self.is_planar() {
            for (ch, plane) in planes.iter_mut().enumerate() {
                self.extract_channel_to_bytes(&samples[..frames * channels], ch, channels, plane);
            }
        } else if let Some(plane) = planes.first_mut() {
            self.samples_to_bytes(&samples[..frames * channels], plane);
        }
        frames
    }
}

/// 单个左对齐样本写成目标编码（little-endian）
#[inline]
fn encode_sample(format: SampleFormat, sample: i32, out: &mut [u8]) {
    match format {
        SampleFormat::U8 => {
            // 有符号 → 无符号偏移
            out[0] = ((sample >> 24) as i8 as u8) ^ 0x80;
        }
        SampleFormat::S16 => {
            out.copy_from_slice(&((sample >> 16) as i16).to_le_bytes());
        }
        SampleFormat::S24 => {
            // 右移 8 位取回 24-bit（带符号）
            let v = sample >> 8;
            out[0] = (v & 0xFF) as u8;
            out[1] = ((v >> 8) & 0xFF) as u8;
            out[2] = ((v >> 16) & 0xFF) as u8;
        }
        SampleFormat::S32 => {
            out.copy_from_slice(&sample.to_le_bytes());
        }
        SampleFormat::F32 => {
            let f = sample as f32 / 2_147_483_648.0;
            out.copy_from_slice(&f.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        let fmt = AudioFormat::new(48000, 2, 16);
        assert_eq!(fmt.num_planes(), 1);
        assert_eq!(fmt.sstride(), 4);

        let planar = fmt.with_layout(OutputLayout::NonInterleaved);
        assert_eq!(planar.num_planes(), 2);
        assert_eq!(planar.sstride(), 2);
        assert_eq!(planar.bytes_per_frame(), 4);
    }

    #[test]
    fn test_silence_pattern() {
        let mut buf = [0x55u8; 4];
        AudioFormat::new(8000, 1, 8).fill_silence(&mut buf);
        assert_eq!(buf, [0x80; 4]);

        AudioFormat::new(8000, 1, 16).fill_silence(&mut buf);
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_16bit_pack() {
        let format = AudioFormat::new(48000, 1, 16);
        let mut out = [0u8; 4];
        format.samples_to_bytes(&[16384 << 16, -16384 << 16], &mut out);
        assert_eq!(out, [0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn test_24bit_pack_negative() {
        let format = AudioFormat::new(96000, 1, 24);
        let mut out = [0u8; 3];

        format.samples_to_bytes(&[(-1i32) << 8], &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0xFF]);

        format.samples_to_bytes(&[(-8388608i32) << 8], &mut out);
        assert_eq!(out, [0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_u8_pack() {
        let format = AudioFormat::new(8000, 1, 8);
        let mut out = [0u8; 3];
        format.samples_to_bytes(&[0, i32::MIN, i32::MAX], &mut out);
        assert_eq!(out, [0x80, 0x00, 0xFF]);
    }

    #[test]
    fn test_pack_planes_splits_channels() {
        let format = AudioFormat::new(48000, 2, 16).with_layout(OutputLayout::NonInterleaved);
        let samples = [1 << 16, 2 << 16, 3 << 16, 4 << 16, 5 << 16];
        let mut planes = vec![Vec::new(), Vec::new()];

        // 末尾不完整的帧被丢弃
        assert_eq!(format.pack_planes(&samples, &mut planes), 2);
        assert_eq!(planes[0], vec![1, 0, 3, 0]);
        assert_eq!(planes[1], vec![2, 0, 4, 0]);
    }

    #[test]
    fn test_pack_planes_interleaved() {
        let format = AudioFormat::new(48000, 2, 16);
        let mut planes = vec![Vec::new()];
        assert_eq!(format.pack_planes(&[1 << 16, 2 << 16], &mut planes), 1);
        assert_eq!(planes[0], vec![1, 0, 2, 0]);
    }
}
