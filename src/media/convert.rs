//! Format normalization ahead of the encoders.

use bytes::{BufMut, Bytes, BytesMut};

use crate::media::stage::Stage;
use crate::media::types::{AudioFormat, MediaBuffer};
use crate::scaler::i420_size;

/// Guarantees every video buffer is a complete I420 frame at the encoder
/// geometry. Short frames are rejected, trailing bytes trimmed.
pub struct VideoConvert {
    width: u32,
    height: u32,
    frame_len: usize,
}

impl VideoConvert {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_len: i420_size(width, height),
        }
    }
}

impl Stage for VideoConvert {
    fn name(&self) -> &str {
        "videoconvert"
    }

    fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
        if buf.len() < self.frame_len {
            anyhow::bail!(
                "frame of {} bytes is not {}x{} I420 ({} bytes)",
                buf.len(),
                self.width,
                self.height,
                self.frame_len
            );
        }
        if buf.len() == self.frame_len {
            return Ok(vec![buf]);
        }
        let data = buf.data.slice(..self.frame_len);
        Ok(vec![buf.with_data(data)])
    }
}

/// Converts pushed PCM to the encoder's interleaved f32 samples.
pub struct AudioConvert {
    format: AudioFormat,
}

impl AudioConvert {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }
}

impl Stage for AudioConvert {
    fn name(&self) -> &str {
        "audioconvert"
    }

    fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
        let width = self.format.bytes_per_sample();
        let whole = buf.len() - buf.len() % width;
        if whole == 0 {
            return Ok(Vec::new());
        }
        let data = match self.format {
            AudioFormat::FloatMono48k if whole == buf.len() => return Ok(vec![buf]),
            AudioFormat::FloatMono48k => buf.data.slice(..whole),
            AudioFormat::PcmS16Mono32k => s16_to_f32(&buf.data[..whole]),
        };
        Ok(vec![buf.with_data(data)])
    }
}

fn s16_to_f32(pcm: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(pcm.len() * 2);
    for sample in pcm.chunks_exact(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        out.put_f32_le(value as f32 / 32768.0);
    }
    out.freeze()
}

/// Little-endian f32 to s16 with clipping. A trailing partial sample is ignored.
pub fn f32_to_s16(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() / 2);
    for sample in f32_samples(data) {
        out.put_i16_le((sample.clamp(-1.0, 1.0) * 32767.0).round() as i16);
    }
    out.freeze()
}

/// Decodes little-endian f32 samples; a trailing partial sample is ignored.
pub fn f32_samples(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
