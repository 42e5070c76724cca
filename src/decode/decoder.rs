//! 音频文件解码器
//!
//! 使用 symphonia 解码 FLAC / WAV / AIFF / MP3，
//! 输出交织、左对齐到 i32 高位的样本。

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{AudioInfo, DecodeError, SampleSource};

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    /// symphonia 的交织转换缓冲，按需重建
    sample_buf: Option<SampleBuffer<i32>>,
    /// 已解码但还没被读走的样本
    pending: Vec<i32>,
    position: usize,
    finished: bool,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let total_frames = params.n_frames;

        let codec = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            codec,
        };

        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            sample_buf: None,
            pending: Vec::new(),
            position: 0,
            finished: false,
        })
    }

    /// 解码下一个包到 `pending`；返回 false 表示文件结束
    fn decode_packet(&mut self) -> Result<bool, DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 损坏的帧直接跳过
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let frames = decoded.capacity();
            let needed = frames * spec.channels.count();
            if self.sample_buf.as_ref().map_or(true, |b| b.capacity() < needed) {
                self.sample_buf = Some(SampleBuffer::new(frames as u64, spec));
            }

            if let Some(buf) = self.sample_buf.as_mut() {
                // i32 转换即左对齐：16-bit 左移 16 位，24-bit 左移 8 位，浮点按满幅缩放
                buf.copy_interleaved_ref(decoded);
                self.pending.clear();
                self.pending.extend_from_slice(buf.samples());
                self.position = 0;
            }
            return Ok(true);
        }
    }
}

impl SampleSource for AudioDecoder {
    fn info(&self) -> &AudioInfo {
        &self.info
    }

    fn read_frames(&mut self, out: &mut Vec<i32>, frames: usize) -> Result<usize, DecodeError> {
        out.clear();
        let channels = self.info.channels.max(1) as usize;
        let wanted = frames * channels;

        while out.len() < wanted && !self.finished {
            if self.position >= self.pending.len() && !self.decode_packet()? {
                self.finished = true;
                break;
            }
            let n = (wanted - out.len()).min(self.pending.len() - self.position);
            out.extend_from_slice(&self.pending[self.position..self.position + n]);
            self.position += n;
        }

        Ok(out.len() / channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// 写一个 16-bit PCM WAV 文件
    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[i16]) {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        let mut file = File::create(path).unwrap();
        file.write_all(&bytes).unwrap();
    }

    #[test]
    fn test_decode_wav_left_aligned() {
        let path = std::env::temp_dir().join(format!("roger-aout-{}.wav", std::process::id()));
        let samples: Vec<i16> = (0..2000).map(|i| (i as i16) - 1000).collect();
        write_wav(&path, 8000, 2, &samples);

        let mut decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(decoder.info().sample_rate, 8000);
        assert_eq!(decoder.info().channels, 2);
        assert_eq!(decoder.info().bit_depth, Some(16));

        let mut out = Vec::new();
        let mut all = Vec::new();
        loop {
            let frames = decoder.read_frames(&mut out, 300).unwrap();
            if frames == 0 {
                break;
            }
            assert!(frames <= 300);
            all.extend_from_slice(&out);
        }

        let _ = std::fs::remove_file(&path);

        assert_eq!(all.len(), samples.len());
        for (got, want) in all.iter().zip(samples.iter()) {
            assert_eq!(*got, (*want as i32) << 16);
        }
    }

    #[test]
    fn test_open_missing_file() {
        let err = AudioDecoder::open("/nonexistent/roger-aout.flac");
        assert!(matches!(err, Err(DecodeError::FileOpen(_))));
    }
}
