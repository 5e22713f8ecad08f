//! ffmpeg-next wrappers for the recorder's encode and mux stages.
//!
//! Everything here is synchronous and owned by a single worker thread; the
//! caller moves each value to the thread that drives it.

/// Registers FFmpeg codecs and muxers. Idempotent.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod encoder;
pub mod frame;
pub mod output;
pub mod packet;
