//! Binary wire protocol spoken by the in-browser capture agent.
//!
//! Every message starts with a 4-byte little-endian kind:
//!
//! ```text
//! kind 1  [kind][utf-8 json .............................................]
//! kind 2  [kind][ts_us u64][sid_len u32][sid ...][width u32][height u32][I420 ...]
//! kind 3  [kind][ts_us u64][f32le mono samples ..........................]
//! ```
//!
//! Decoding never panics and never blocks; a malformed message yields a
//! [`DecodeError`] and the stream carries on with the next one.

use bytes::Bytes;
use serde::Deserialize;

use crate::error::DecodeError;

pub const KIND_CONTROL: u32 = 1;
pub const KIND_VIDEO: u32 = 2;
pub const KIND_AUDIO: u32 = 3;

const KIND_LEN: usize = 4;
const TIMESTAMP_LEN: usize = 8;
const VIDEO_FIXED_HEADER: usize = KIND_LEN + TIMESTAMP_LEN + 4 + 4 + 4;
const AUDIO_HEADER: usize = KIND_LEN + TIMESTAMP_LEN;

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Control(ControlEvent),
    Video(VideoFrame),
    Audio(AudioChunk),
}

/// One planar I420 frame at the capture geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub stream_id: String,
    pub width: u32,
    pub height: u32,
    pub capture_timestamp_ns: i64,
    pub data: Bytes,
}

/// Mono 32-bit float PCM, little endian.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub capture_timestamp_ns: i64,
    pub data: Bytes,
}

impl AudioChunk {
    pub fn sample_count(&self) -> usize {
        self.data.len() / 4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    AudioFormatUpdate(AudioFormatInfo),
    CaptionUpdate(serde_json::Value),
    UsersUpdate(UsersUpdate),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormatInfo {
    pub number_of_channels: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsersUpdate {
    pub new_users: Vec<Participant>,
    pub removed_users: Vec<Participant>,
    pub updated_users: Vec<Participant>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Participant {
    pub device_id: String,
    pub full_name: String,
    #[serde(rename = "humanized_status")]
    pub humanized_status: String,
}

impl Participant {
    pub fn is_in_meeting(&self) -> bool {
        self.humanized_status == "in_meeting"
    }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum KnownControl {
    AudioFormatUpdate { format: AudioFormatInfo },
    CaptionUpdate { caption: serde_json::Value },
    UsersUpdate(UsersUpdate),
}

impl ControlEvent {
    fn from_value(value: serde_json::Value) -> Self {
        match serde_json::from_value::<KnownControl>(value.clone()) {
            Ok(KnownControl::AudioFormatUpdate { format }) => {
                ControlEvent::AudioFormatUpdate(format)
            }
            Ok(KnownControl::CaptionUpdate { caption }) => ControlEvent::CaptionUpdate(caption),
            Ok(KnownControl::UsersUpdate(update)) => ControlEvent::UsersUpdate(update),
            Err(_) => ControlEvent::Other(value),
        }
    }
}

/// Decodes one message.
pub fn decode(message: &[u8]) -> Result<MediaEvent, DecodeError> {
    let kind = read_u32(message, 0).ok_or(DecodeError::Truncated {
        kind: "any",
        len: message.len(),
        need: KIND_LEN,
    })?;

    match kind {
        KIND_CONTROL => {
            let value: serde_json::Value = serde_json::from_slice(&message[KIND_LEN..])?;
            Ok(MediaEvent::Control(ControlEvent::from_value(value)))
        }
        KIND_VIDEO => decode_video(message).map(MediaEvent::Video),
        KIND_AUDIO => decode_audio(message).map(MediaEvent::Audio),
        other => Err(DecodeError::UnknownKind(other)),
    }
}

/// Decodes one message, logging and discarding anything malformed.
pub fn decode_message(message: &[u8]) -> Option<MediaEvent> {
    match decode(message) {
        Ok(event) => Some(event),
        Err(e) if e.is_silent() => None,
        Err(e) => {
            log::warn!("dropping wire message: {}", e);
            None
        }
    }
}

fn decode_video(message: &[u8]) -> Result<VideoFrame, DecodeError> {
    let truncated = |need: usize| DecodeError::Truncated {
        kind: "video",
        len: message.len(),
        need,
    };
    if message.len() < VIDEO_FIXED_HEADER {
        return Err(truncated(VIDEO_FIXED_HEADER));
    }

    let timestamp_us = read_u64(message, KIND_LEN).ok_or(truncated(VIDEO_FIXED_HEADER))?;
    let stream_id_len = read_u32(message, 12).ok_or(truncated(VIDEO_FIXED_HEADER))? as usize;
    let header_len = VIDEO_FIXED_HEADER
        .checked_add(stream_id_len)
        .ok_or(truncated(usize::MAX))?;
    if message.len() < header_len {
        return Err(truncated(header_len));
    }

    let stream_id = std::str::from_utf8(&message[16..16 + stream_id_len])
        .map_err(|_| DecodeError::StreamId)?
        .to_string();
    let offset = 16 + stream_id_len;
    let width = read_u32(message, offset).ok_or(truncated(header_len))?;
    let height = read_u32(message, offset + 4).ok_or(truncated(header_len))?;

    let need = (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(3))
        .map(|n| n / 2)
        .and_then(|payload_len| header_len.checked_add(payload_len))
        .ok_or(truncated(usize::MAX))?;
    if message.len() < need {
        return Err(truncated(need));
    }

    Ok(VideoFrame {
        stream_id,
        width,
        height,
        capture_timestamp_ns: micros_to_nanos(timestamp_us),
        data: Bytes::copy_from_slice(&message[header_len..need]),
    })
}

fn decode_audio(message: &[u8]) -> Result<AudioChunk, DecodeError> {
    let timestamp_us = read_u64(message, KIND_LEN).ok_or(DecodeError::Truncated {
        kind: "audio",
        len: message.len(),
        need: AUDIO_HEADER,
    })?;
    let payload = &message[AUDIO_HEADER..];
    if payload.len() % 4 != 0 {
        return Err(DecodeError::MisalignedAudio(payload.len()));
    }

    Ok(AudioChunk {
        capture_timestamp_ns: micros_to_nanos(timestamp_us),
        data: Bytes::copy_from_slice(payload),
    })
}

fn micros_to_nanos(us: u64) -> i64 {
    (us as i64).saturating_mul(1000)
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Encoders for the three message kinds. Used by tests and by tools replaying captures.
pub mod encode {
    use super::*;

    pub fn control(json: &serde_json::Value) -> Vec<u8> {
        let mut out = KIND_CONTROL.to_le_bytes().to_vec();
        out.extend_from_slice(json.to_string().as_bytes());
        out
    }

    pub fn video(
        timestamp_us: u64,
        stream_id: &str,
        width: u32,
        height: u32,
        i420: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(VIDEO_FIXED_HEADER + stream_id.len() + i420.len());
        out.extend_from_slice(&KIND_VIDEO.to_le_bytes());
        out.extend_from_slice(&timestamp_us.to_le_bytes());
        out.extend_from_slice(&(stream_id.len() as u32).to_le_bytes());
        out.extend_from_slice(stream_id.as_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(i420);
        out
    }

    pub fn audio(timestamp_us: u64, samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUDIO_HEADER + samples.len() * 4);
        out.extend_from_slice(&KIND_AUDIO.to_le_bytes());
        out.extend_from_slice(&timestamp_us.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_video_frame() {
        let payload = vec![7u8; 4 * 2 * 3 / 2];
        let msg = encode::video(1_500, "cam-1", 4, 2, &payload);

        let MediaEvent::Video(frame) = decode(&msg).unwrap() else {
            panic!("expected a video frame");
        };
        assert_eq!(frame.stream_id, "cam-1");
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.capture_timestamp_ns, 1_500_000);
        assert_eq!(&frame.data[..], &payload[..]);
    }

    #[test]
    fn test_decode_video_ignores_trailing_bytes() {
        let mut payload = vec![1u8; 12];
        payload.extend_from_slice(&[9, 9, 9]);
        let msg = encode::video(1, "", 4, 2, &payload);

        let MediaEvent::Video(frame) = decode(&msg).unwrap() else {
            panic!("expected a video frame");
        };
        assert_eq!(frame.data.len(), 12);
    }

    #[test]
    fn test_decode_video_truncated() {
        let msg = encode::video(1, "abc", 4, 2, &[0u8; 11]);
        assert!(matches!(
            decode(&msg),
            Err(DecodeError::Truncated { kind: "video", .. })
        ));

        // header cut inside the stream id
        let msg = encode::video(1, "a-long-stream-id", 4, 2, &[]);
        assert!(matches!(decode(&msg[..20]), Err(DecodeError::Truncated { .. })));
        assert!(decode_message(&msg[..20]).is_none());
    }

    #[test]
    fn test_decode_video_oversized_geometry() {
        let msg = encode::video(1, "", u32::MAX, u32::MAX, &[]);
        assert!(matches!(
            decode(&msg),
            Err(DecodeError::Truncated {
                kind: "video",
                need: usize::MAX,
                ..
            })
        ));
        assert!(decode_message(&msg).is_none());
    }

    #[test]
    fn test_decode_audio_chunk() {
        let msg = encode::audio(999_000, &[0.5, -0.25, 1.0]);
        let MediaEvent::Audio(chunk) = decode(&msg).unwrap() else {
            panic!("expected audio");
        };
        assert_eq!(chunk.capture_timestamp_ns, 999_000_000);
        assert_eq!(chunk.sample_count(), 3);
        assert_eq!(&chunk.data[4..8], &(-0.25f32).to_le_bytes());
    }

    #[test]
    fn test_decode_audio_rejects_short_and_misaligned() {
        let msg = encode::audio(5, &[]);
        assert!(decode(&msg[..10]).is_err());

        let mut msg = encode::audio(5, &[0.1]);
        msg.push(0);
        assert!(matches!(decode(&msg), Err(DecodeError::MisalignedAudio(5))));
    }

    #[test]
    fn test_decode_control_events() {
        let msg = encode::control(&json!({
            "type": "AudioFormatUpdate",
            "format": {"numberOfChannels": 1, "sampleRate": 48000}
        }));
        assert_eq!(
            decode(&msg).unwrap(),
            MediaEvent::Control(ControlEvent::AudioFormatUpdate(AudioFormatInfo {
                number_of_channels: 1,
                sample_rate: 48000,
            }))
        );

        let msg = encode::control(&json!({
            "type": "UsersUpdate",
            "newUsers": [{"deviceId": "d1", "fullName": "Ada", "humanized_status": "in_meeting"}],
            "removedUsers": [],
            "updatedUsers": []
        }));
        let MediaEvent::Control(ControlEvent::UsersUpdate(update)) = decode(&msg).unwrap() else {
            panic!("expected users update");
        };
        assert_eq!(update.new_users.len(), 1);
        assert!(update.new_users[0].is_in_meeting());

        let msg = encode::control(&json!({"type": "SomethingElse", "x": 1}));
        assert!(matches!(
            decode(&msg).unwrap(),
            MediaEvent::Control(ControlEvent::Other(_))
        ));
    }

    #[test]
    fn test_decode_control_invalid_json() {
        let mut msg = KIND_CONTROL.to_le_bytes().to_vec();
        msg.extend_from_slice(b"{not json");
        assert!(matches!(decode(&msg), Err(DecodeError::Control(_))));
    }

    #[test]
    fn test_unknown_and_empty_messages() {
        let msg = 42u32.to_le_bytes();
        let err = decode(&msg).unwrap_err();
        assert!(err.is_silent());
        assert!(decode_message(&msg).is_none());

        assert!(decode(&[1, 0]).is_err());
        assert!(decode_message(&[]).is_none());
    }
}
