//! Encoding pipeline: raw meeting media in, one container byte stream out.
//!
//! Data Flow:
//! ```text
//! push_video_frame ─► [video-ingest] ─► convert, rate ─► [video-reencode] ─► H.264 ─► [video-encoded] ─┐
//!                                                                                                     ├─► mux ─► [mux-output] ─► ChunkSink
//! push_audio_chunk ─► [audio-ingest] ─► convert, rate ─► [audio-convert] ─► AAC ───► [audio-encoded] ─┘
//! ```
//!
//! Video queues block the producer when full, so no frame is ever lost.
//! Audio queues are leaky: they evict their oldest buffer instead of
//! blocking. Every queue reports overruns or evictions to the pipeline's
//! bus, which turns them into periodic drop reports.

pub mod backend;
pub mod convert;
pub mod mux;
pub mod pipe;
pub mod queue;
pub mod rate;
pub mod stage;
pub mod stream;
pub mod types;
