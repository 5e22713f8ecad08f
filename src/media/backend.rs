//! Codec backend seam: the pipeline asks a backend for its two encoders and
//! its muxer once, at construction.

use crate::media::mux::Muxer;
use crate::media::stage::Stage;
use crate::media::types::PipelineConfig;

pub struct Codecs {
    /// Consumes I420 frames at the configured geometry, emits H.264.
    pub video_encoder: Box<dyn Stage>,
    /// Consumes mono f32 PCM, emits AAC.
    pub audio_encoder: Box<dyn Stage>,
    pub muxer: Box<dyn Muxer>,
}

pub trait CodecBackend: Send + Sync {
    fn open(&self, config: &PipelineConfig) -> anyhow::Result<Codecs>;
}

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegBackend;

#[cfg(feature = "ffmpeg")]
mod ffmpeg {
    use bytes::Bytes;
    use ffmpeg_bus::{
        encoder::{AudioEncoder, AudioSettings, VideoEncoder, VideoSettings},
        output::{AUDIO_STREAM, AvOutput, VIDEO_STREAM},
        packet::EncodedPacket,
    };

    use super::{CodecBackend, Codecs};
    use crate::media::mux::{Muxer, Track};
    use crate::media::stage::Stage;
    use crate::media::types::{MediaBuffer, PipelineConfig};

    /// libx264 (ultrafast, zerolatency) + AAC into FLV or MP4.
    #[derive(Debug, Default)]
    pub struct FfmpegBackend;

    impl CodecBackend for FfmpegBackend {
        fn open(&self, config: &PipelineConfig) -> anyhow::Result<Codecs> {
            ffmpeg_bus::init()?;
            let (width, height) = config.video_frame_size;
            let video = VideoEncoder::open(&VideoSettings {
                width,
                height,
                frame_rate: config.frame_rate,
                keyframe_interval: config.keyframe_interval,
                ..Default::default()
            })?;
            let audio = AudioEncoder::open(&AudioSettings {
                sample_rate: config.audio_format.sample_rate(),
                bit_rate: config.audio_bitrate as usize,
            })?;
            let output = AvOutput::new(config.output_format.container(), &video, &audio)?;

            Ok(Codecs {
                video_encoder: Box::new(VideoEncode(video)),
                audio_encoder: Box::new(AudioEncode(audio)),
                muxer: Box::new(AvMuxer(output)),
            })
        }
    }

    fn to_buffers(packets: Vec<EncodedPacket>) -> Vec<MediaBuffer> {
        packets
            .into_iter()
            .map(|p| MediaBuffer {
                data: p.data,
                pts: p.pts,
                dts: p.dts,
                duration: p.duration,
                is_key: p.is_key,
            })
            .collect()
    }

    struct VideoEncode(VideoEncoder);

    impl Stage for VideoEncode {
        fn name(&self) -> &str {
            "x264enc"
        }

        fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
            Ok(to_buffers(self.0.encode(&buf.data, buf.pts)?))
        }

        fn flush(&mut self) -> anyhow::Result<Vec<MediaBuffer>> {
            Ok(to_buffers(self.0.flush()?))
        }
    }

    struct AudioEncode(AudioEncoder);

    impl Stage for AudioEncode {
        fn name(&self) -> &str {
            "aacenc"
        }

        fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
            Ok(to_buffers(self.0.encode(&buf.data, buf.pts)?))
        }

        fn flush(&mut self) -> anyhow::Result<Vec<MediaBuffer>> {
            Ok(to_buffers(self.0.flush()?))
        }
    }

    struct AvMuxer(AvOutput);

    impl Muxer for AvMuxer {
        fn write(&mut self, track: Track, buf: MediaBuffer) -> anyhow::Result<Vec<Bytes>> {
            let index = match track {
                Track::Video => VIDEO_STREAM,
                Track::Audio => AUDIO_STREAM,
            };
            self.0.write(
                index,
                &EncodedPacket {
                    data: buf.data,
                    pts: buf.pts,
                    dts: buf.dts,
                    duration: buf.duration,
                    is_key: buf.is_key,
                },
            )
        }

        fn finish(&mut self) -> anyhow::Result<Vec<Bytes>> {
            self.0.finish()
        }
    }
}
