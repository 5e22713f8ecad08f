use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

/// One timed buffer travelling through the graph. Raw I420 or PCM before the
/// encoders, compressed access units after. All times are nanoseconds on the
/// pipeline clock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaBuffer {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub is_key: bool,
}

impl MediaBuffer {
    pub fn new(data: Bytes, pts: i64, duration: i64) -> Self {
        Self {
            data,
            pts,
            dts: pts,
            duration,
            is_key: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Same timing, different payload.
    pub fn with_data(&self, data: Bytes) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }
}

impl Display for MediaBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "MediaBuffer {{ len: {}, pts: {}, duration: {} }}",
            self.data.len(),
            self.pts,
            self.duration
        )
    }
}

/// What travels through a queue: data, or the end-of-stream marker.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaCmd {
    Data(MediaBuffer),
    EOF,
}

impl MediaCmd {
    pub fn byte_len(&self) -> usize {
        match self {
            MediaCmd::Data(buf) => buf.len(),
            MediaCmd::EOF => 0,
        }
    }
}

/// Internal notifications from queues and worker threads, consumed by the
/// pipeline's bus loop.
#[derive(Clone, Debug, PartialEq)]
pub enum BusMessage {
    /// A blocking queue was full when a producer arrived.
    Overrun { queue: String },
    /// A leaky queue discarded its oldest buffers.
    Evicted { queue: String, count: u64 },
    /// `fatal` means end of stream can no longer arrive intact: a worker died
    /// or the container could not be finalized. Other errors cost one buffer.
    Error {
        source: String,
        message: String,
        fatal: bool,
    },
    /// The sink saw end-of-stream: everything upstream drained.
    Eos,
}

/// Container profile of the produced artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// FLV with Annex B H.264, readable while it is being written.
    #[default]
    #[serde(alias = "flv")]
    Streamable,
    /// Fragmented MP4, emitted fragment by fragment as keyframes arrive.
    #[serde(alias = "mp4")]
    File,
}

impl OutputFormat {
    pub fn container(&self) -> &'static str {
        match self {
            OutputFormat::Streamable => "flv",
            OutputFormat::File => "mp4",
        }
    }
}

/// Sample format of what producers push into the audio branch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum AudioFormat {
    /// Signed 16-bit little endian, mono, 32 kHz.
    #[serde(rename = "pcm", alias = "s16")]
    PcmS16Mono32k,
    /// 32-bit float little endian, mono, 48 kHz.
    #[default]
    #[serde(rename = "float", alias = "f32")]
    FloatMono48k,
}

impl AudioFormat {
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioFormat::PcmS16Mono32k => 32_000,
            AudioFormat::FloatMono48k => 48_000,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioFormat::PcmS16Mono32k => 2,
            AudioFormat::FloatMono48k => 4,
        }
    }

    pub fn channels(&self) -> u32 {
        1
    }
}

/// Whether a full queue blocks its producer or drops old data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leaky {
    No,
    /// Evict the oldest buffered item to admit the new one.
    Downstream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct QueueLimits {
    pub max_buffers: usize,
    pub max_bytes: usize,
    pub leaky: Leaky,
}

impl QueueLimits {
    pub const fn blocking(max_buffers: usize, max_bytes: usize) -> Self {
        Self {
            max_buffers,
            max_bytes,
            leaky: Leaky::No,
        }
    }

    pub const fn leaky(max_buffers: usize, max_bytes: usize) -> Self {
        Self {
            max_buffers,
            max_bytes,
            leaky: Leaky::Downstream,
        }
    }
}

pub const VIDEO_INGEST: &str = "video-ingest";
pub const VIDEO_REENCODE: &str = "video-reencode";
pub const VIDEO_ENCODED: &str = "video-encoded";
pub const AUDIO_INGEST: &str = "audio-ingest";
pub const AUDIO_CONVERT: &str = "audio-convert";
pub const AUDIO_ENCODED: &str = "audio-encoded";
pub const MUX_OUTPUT: &str = "mux-output";

const MB: usize = 1_000_000;

/// Capacities of every named queue in the graph.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub video_ingest: QueueLimits,
    pub video_reencode: QueueLimits,
    pub video_encoded: QueueLimits,
    pub audio_ingest: QueueLimits,
    pub audio_convert: QueueLimits,
    pub audio_encoded: QueueLimits,
    pub mux_output: QueueLimits,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            video_ingest: QueueLimits::blocking(1000, 100 * MB),
            video_reencode: QueueLimits::blocking(5000, 500 * MB),
            video_encoded: QueueLimits::blocking(1000, 100 * MB),
            audio_ingest: QueueLimits::leaky(1_000_000, 100 * MB),
            audio_convert: QueueLimits::leaky(1_000_000, 100 * MB),
            audio_encoded: QueueLimits::leaky(1_000_000, 100 * MB),
            mux_output: QueueLimits::blocking(200, 10 * MB),
        }
    }
}

impl QueueSettings {
    /// `(name, limits)` for every queue, upstream first.
    pub fn named(&self) -> [(&'static str, QueueLimits); 7] {
        [
            (VIDEO_INGEST, self.video_ingest),
            (VIDEO_REENCODE, self.video_reencode),
            (VIDEO_ENCODED, self.video_encoded),
            (AUDIO_INGEST, self.audio_ingest),
            (AUDIO_CONVERT, self.audio_convert),
            (AUDIO_ENCODED, self.audio_encoded),
            (MUX_OUTPUT, self.mux_output),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_format: OutputFormat,
    pub video_frame_size: (u32, u32),
    /// Output frame rate as numerator/denominator.
    pub frame_rate: (u32, u32),
    /// Nominal duration stamped on every pushed frame.
    #[serde(with = "millis")]
    pub frame_duration: Duration,
    pub audio_format: AudioFormat,
    pub audio_bitrate: u32,
    /// Frames between forced keyframes.
    pub keyframe_interval: u32,
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
    #[serde(with = "millis")]
    pub stats_interval: Duration,
    /// How long the muxer holds one branch's buffer waiting for the other.
    #[serde(with = "millis")]
    pub interleave_window: Duration,
    pub queues: QueueSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::default(),
            video_frame_size: (1920, 1080),
            frame_rate: (30, 1),
            frame_duration: Duration::from_millis(33),
            audio_format: AudioFormat::default(),
            audio_bitrate: 128_000,
            keyframe_interval: 60,
            shutdown_timeout: Duration::from_secs(5 * 60),
            stats_interval: Duration::from_secs(15),
            interleave_window: Duration::from_millis(500),
            queues: QueueSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        let (w, h) = self.video_frame_size;
        if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
            return Err(format!("video_frame_size {}x{} must be even and non-zero", w, h));
        }
        if self.frame_rate.0 == 0 || self.frame_rate.1 == 0 {
            return Err(format!(
                "frame_rate {}/{} must be positive",
                self.frame_rate.0, self.frame_rate.1
            ));
        }
        if self.stats_interval.is_zero() {
            return Err("stats_interval must be positive".to_string());
        }
        for (name, limits) in self.queues.named() {
            if limits.max_buffers == 0 || limits.max_bytes == 0 {
                return Err(format!("queue {} needs a non-zero capacity", name));
            }
        }
        Ok(())
    }

    /// One output frame period in nanoseconds.
    pub fn frame_period_ns(&self) -> i64 {
        let (num, den) = self.frame_rate;
        (1_000_000_000i64 * den as i64) / num as i64
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_period_ns(), 33_333_333);
        assert_eq!(config.queues.video_ingest.max_buffers, 1000);
        assert_eq!(config.queues.audio_ingest.leaky, Leaky::Downstream);
    }

    #[test]
    fn test_config_from_json_with_aliases() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "output_format": "mp4",
                "video_frame_size": [1280, 720],
                "audio_format": "pcm",
                "shutdown_timeout": 2000
            }"#,
        )
        .unwrap();
        assert_eq!(config.output_format, OutputFormat::File);
        assert_eq!(config.video_frame_size, (1280, 720));
        assert_eq!(config.audio_format, AudioFormat::PcmS16Mono32k);
        assert_eq!(config.audio_format.sample_rate(), 32_000);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.stats_interval, Duration::from_secs(15));

        let flv: OutputFormat = serde_json::from_str(r#""flv""#).unwrap();
        assert_eq!(flv, OutputFormat::Streamable);
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let config = PipelineConfig {
            video_frame_size: (1921, 1080),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
