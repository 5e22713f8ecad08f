//! Per-connection message router: decodes wire messages, tracks the
//! meeting roster and feeds media into the [`Pipeline`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

use crate::media::convert::f32_to_s16;
use crate::media::pipe::{Pipeline, PushOutcome};
use crate::media::types::AudioFormat;
use crate::protocol::{
    self, AudioChunk, AudioFormatInfo, ControlEvent, MediaEvent, Participant, UsersUpdate,
    VideoFrame,
};
use crate::scaler;

/// Timing thresholds for idle detection and the pre-shutdown drain.
#[derive(Debug, Clone, Copy)]
pub struct IdleSettings {
    /// Leave after being the only participant this long.
    pub alone_timeout: Duration,
    /// Leave after no media message for this long.
    pub media_timeout: Duration,
    /// Drain is done once no message arrived for this long...
    pub quiet_period: Duration,
    /// ...or once this much time has passed since the drain began.
    pub max_drain_wait: Duration,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            alone_timeout: Duration::from_secs(30),
            media_timeout: Duration::from_secs(30),
            quiet_period: Duration::from_secs(2),
            max_drain_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    OnlyParticipant,
    NoMedia,
}

/// Things a session surfaces to its owner while routing messages.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Caption(serde_json::Value),
    AudioFormat(AudioFormatInfo),
    RosterChanged { active: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub messages: u64,
    pub undecodable: u64,
    pub video_frames: u64,
    pub frames_scaled: u64,
    /// Frames not scaled because the pipeline did not want them.
    pub frames_skipped: u64,
    pub scale_failures: u64,
    pub audio_chunks: u64,
    /// Audio received before any format update.
    pub audio_unformatted: u64,
    /// Pushes the pipeline ignored or rejected.
    pub rejected: u64,
}

pub struct IngestSession {
    pipeline: Arc<Pipeline>,
    target: (u32, u32),
    audio_format: AudioFormat,
    wire_audio: Option<AudioFormatInfo>,
    roster: BTreeMap<String, Participant>,
    settings: IdleSettings,
    last_message_at: Instant,
    last_media_at: Instant,
    alone_since: Option<Instant>,
    stats: IngestStats,
}

impl IngestSession {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self::with_settings(pipeline, IdleSettings::default())
    }

    pub fn with_settings(pipeline: Arc<Pipeline>, settings: IdleSettings) -> Self {
        let config = pipeline.config();
        let target = config.video_frame_size;
        let audio_format = config.audio_format;
        let now = Instant::now();
        Self {
            pipeline,
            target,
            audio_format,
            wire_audio: None,
            roster: BTreeMap::new(),
            settings,
            last_message_at: now,
            last_media_at: now,
            alone_since: None,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Participants currently in the meeting.
    pub fn active_participants(&self) -> usize {
        self.roster.values().filter(|p| p.is_in_meeting()).count()
    }

    /// Routes one raw message received at `now`.
    pub fn handle_message(&mut self, message: &[u8], now: Instant) -> Option<SessionEvent> {
        self.stats.messages += 1;
        self.last_message_at = now;
        let Some(event) = protocol::decode_message(message) else {
            self.stats.undecodable += 1;
            return None;
        };

        match event {
            MediaEvent::Control(control) => self.handle_control(control, now),
            MediaEvent::Video(frame) => {
                self.last_media_at = now;
                self.handle_video(frame);
                None
            }
            MediaEvent::Audio(chunk) => {
                self.last_media_at = now;
                self.handle_audio(chunk);
                None
            }
        }
    }

    fn handle_control(&mut self, control: ControlEvent, now: Instant) -> Option<SessionEvent> {
        match control {
            ControlEvent::AudioFormatUpdate(format) => {
                if format.number_of_channels != 1
                    || format.sample_rate != self.audio_format.sample_rate()
                {
                    log::warn!(
                        "wire audio is {} ch @ {} Hz, pipeline expects mono @ {} Hz",
                        format.number_of_channels,
                        format.sample_rate,
                        self.audio_format.sample_rate()
                    );
                }
                self.wire_audio = Some(format);
                Some(SessionEvent::AudioFormat(format))
            }
            ControlEvent::CaptionUpdate(caption) => Some(SessionEvent::Caption(caption)),
            ControlEvent::UsersUpdate(update) => {
                self.apply_roster(update, now);
                Some(SessionEvent::RosterChanged {
                    active: self.active_participants(),
                })
            }
            ControlEvent::Other(value) => {
                log::debug!("ignoring control message: {}", value);
                None
            }
        }
    }

    fn apply_roster(&mut self, update: UsersUpdate, now: Instant) {
        for user in update.removed_users {
            self.roster.remove(&user.device_id);
        }
        for user in update.new_users.into_iter().chain(update.updated_users) {
            self.roster.insert(user.device_id.clone(), user);
        }

        if self.active_participants() == 1 {
            self.alone_since.get_or_insert(now);
        } else {
            self.alone_since = None;
        }
    }

    fn handle_video(&mut self, frame: VideoFrame) {
        self.stats.video_frames += 1;
        if !self.pipeline.wants_frames() {
            self.stats.frames_skipped += 1;
            return;
        }

        let data = if (frame.width, frame.height) == self.target {
            frame.data
        } else {
            match scaler::scale_i420(&frame.data, (frame.width, frame.height), self.target) {
                Ok(scaled) => {
                    self.stats.frames_scaled += 1;
                    Bytes::from(scaled)
                }
                Err(e) => {
                    self.stats.scale_failures += 1;
                    log::warn!(
                        "dropping {}x{} frame from {}: {}",
                        frame.width,
                        frame.height,
                        frame.stream_id,
                        e
                    );
                    return;
                }
            }
        };

        let outcome = self
            .pipeline
            .push_video_frame(data, frame.capture_timestamp_ns);
        self.count(outcome);
    }

    fn handle_audio(&mut self, chunk: AudioChunk) {
        if self.wire_audio.is_none() {
            self.stats.audio_unformatted += 1;
            return;
        }
        self.stats.audio_chunks += 1;

        let data = match self.audio_format {
            AudioFormat::FloatMono48k => chunk.data,
            AudioFormat::PcmS16Mono32k => f32_to_s16(&chunk.data),
        };
        let outcome = self
            .pipeline
            .push_audio_chunk(data, chunk.capture_timestamp_ns);
        self.count(outcome);
    }

    fn count(&mut self, outcome: PushOutcome) {
        if !matches!(outcome, PushOutcome::Queued { .. }) {
            self.stats.rejected += 1;
        }
    }

    /// Why the bot should leave the meeting, if it should.
    pub fn idle_reason(&self, now: Instant) -> Option<IdleReason> {
        if self.alone_since.is_some_and(|since| {
            now.saturating_duration_since(since) >= self.settings.alone_timeout
        }) {
            return Some(IdleReason::OnlyParticipant);
        }
        if now.saturating_duration_since(self.last_media_at) >= self.settings.media_timeout {
            return Some(IdleReason::NoMedia);
        }
        None
    }

    /// True once messages have stopped long enough to shut the pipeline
    /// down, or the drain that began at `drain_started` has waited too long.
    pub fn is_quiet(&self, now: Instant, drain_started: Instant) -> bool {
        now.saturating_duration_since(self.last_message_at) >= self.settings.quiet_period
            || now.saturating_duration_since(drain_started) >= self.settings.max_drain_wait
    }
}
