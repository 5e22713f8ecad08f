use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational, Rescale,
    codec::{self, encoder},
    format::{Pixel, Sample, sample::Type},
};

use crate::{
    frame::{i420_frame, mono_f32_frame},
    packet::{EncodedPacket, NANOS},
};

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: (u32, u32),
    pub keyframe_interval: u32,
    pub codec: String,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: (30, 1),
            keyframe_interval: 60,
            codec: "libx264".to_string(),
        }
    }
}

/// Drains every packet the encoder has ready.
fn receive_packets(
    encoder: &mut encoder::Encoder,
    time_base: Rational,
    offset_ns: i64,
) -> anyhow::Result<Vec<EncodedPacket>> {
    let mut out = Vec::new();
    loop {
        let mut packet = ffmpeg_next::Packet::empty();
        match encoder.receive_packet(&mut packet) {
            Ok(()) => out.push(EncodedPacket::from_av(&packet, time_base, offset_ns)),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                break;
            }
            Err(ffmpeg_next::Error::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(out)
}

/// Real-time H.264 encoder fed with packed I420 frames.
pub struct VideoEncoder {
    inner: encoder::Video,
    time_base: Rational,
    width: u32,
    height: u32,
    frames: u64,
}

impl VideoEncoder {
    pub fn open(settings: &VideoSettings) -> anyhow::Result<Self> {
        let codec = ffmpeg_next::encoder::find_by_name(&settings.codec)
            .ok_or(anyhow::anyhow!("codec not found: {}", settings.codec))?;
        let mut encoder = codec::Context::new_with_codec(codec).encoder().video()?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(Rational(
            settings.frame_rate.0 as i32,
            settings.frame_rate.1 as i32,
        )));
        encoder.set_time_base(ffmpeg_next::util::mathematics::rescale::TIME_BASE);
        encoder.set_gop(settings.keyframe_interval);
        // Both containers want SPS/PPS in extradata rather than in-band.
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
        let inner = encoder.open_with(opts)?;
        let time_base: Rational = unsafe { (*inner.0.as_ptr()).time_base.into() };
        log::info!(
            "video encoder opened: {} {}x{}",
            settings.codec,
            settings.width,
            settings.height
        );

        Ok(Self {
            inner,
            time_base,
            width: settings.width,
            height: settings.height,
            frames: 0,
        })
    }

    pub fn encode(&mut self, i420: &[u8], pts_ns: i64) -> anyhow::Result<Vec<EncodedPacket>> {
        let mut frame = i420_frame(i420, self.width, self.height)?;
        frame.set_pts(Some(pts_ns.rescale(NANOS, self.time_base)));
        self.inner.send_frame(&frame)?;
        self.frames += 1;
        receive_packets(&mut self.inner.0, self.time_base, 0)
    }

    pub fn flush(&mut self) -> anyhow::Result<Vec<EncodedPacket>> {
        self.inner.send_eof()?;
        let out = receive_packets(&mut self.inner.0, self.time_base, 0)?;
        log::info!("video encoder flushed after {} frames", self.frames);
        Ok(out)
    }

    pub(crate) fn context_ptr(&self) -> *const ffmpeg_next::ffi::AVCodecContext {
        unsafe { self.inner.0.as_ptr() }
    }

    pub(crate) fn time_base(&self) -> Rational {
        self.time_base
    }
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub bit_rate: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            bit_rate: 128_000,
        }
    }
}

/// Fixed-bitrate AAC encoder fed with mono f32 samples of any chunk size.
pub struct AudioEncoder {
    inner: encoder::Audio,
    time_base: Rational,
    rate: u32,
    frame_size: usize,
    pending: Vec<f32>,
    base_ns: Option<i64>,
    samples_sent: i64,
}

impl AudioEncoder {
    pub fn open(settings: &AudioSettings) -> anyhow::Result<Self> {
        let codec = ffmpeg_next::encoder::find(codec::Id::AAC)
            .ok_or(anyhow::anyhow!("codec not found: aac"))?;
        let mut encoder = codec::Context::new_with_codec(codec).encoder().audio()?;
        let time_base = Rational(1, settings.sample_rate as i32);
        encoder.set_rate(settings.sample_rate as i32);
        encoder.set_channel_layout(ChannelLayout::MONO);
        encoder.set_format(Sample::F32(Type::Planar));
        encoder.set_bit_rate(settings.bit_rate);
        encoder.set_time_base(time_base);
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let inner = encoder.open_with(Dictionary::new())?;
        let frame_size = match inner.frame_size() {
            0 => 1024,
            n => n as usize,
        };
        log::info!(
            "audio encoder opened: aac {} Hz {} bps, frame size {}",
            settings.sample_rate,
            settings.bit_rate,
            frame_size
        );

        Ok(Self {
            inner,
            time_base,
            rate: settings.sample_rate,
            frame_size,
            pending: Vec::new(),
            base_ns: None,
            samples_sent: 0,
        })
    }

    /// Queues little-endian f32 samples; returns packets for every complete
    /// encoder frame. The first call's `pts_ns` anchors the sample clock.
    pub fn encode(&mut self, samples: &[u8], pts_ns: i64) -> anyhow::Result<Vec<EncodedPacket>> {
        self.base_ns.get_or_insert(pts_ns);
        self.pending.extend(
            samples
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );

        let mut out = Vec::new();
        while self.pending.len() >= self.frame_size {
            let chunk: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            out.extend(self.send(&chunk)?);
        }
        Ok(out)
    }

    pub fn flush(&mut self) -> anyhow::Result<Vec<EncodedPacket>> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            out.extend(self.send(&rest)?);
        }
        self.inner.send_eof()?;
        out.extend(receive_packets(
            &mut self.inner.0,
            self.time_base,
            self.base_ns.unwrap_or(0),
        )?);
        log::info!("audio encoder flushed after {} samples", self.samples_sent);
        Ok(out)
    }

    fn send(&mut self, samples: &[f32]) -> anyhow::Result<Vec<EncodedPacket>> {
        let mut frame = mono_f32_frame(samples, self.rate);
        frame.set_pts(Some(self.samples_sent));
        self.inner.send_frame(&frame)?;
        self.samples_sent += samples.len() as i64;
        receive_packets(&mut self.inner.0, self.time_base, self.base_ns.unwrap_or(0))
    }

    pub(crate) fn context_ptr(&self) -> *const ffmpeg_next::ffi::AVCodecContext {
        unsafe { self.inner.0.as_ptr() }
    }

    pub(crate) fn time_base(&self) -> Rational {
        self.time_base
    }
}
