use bytes::Bytes;
use ffmpeg_next::{Rational, Rescale};

/// Nanosecond time base shared with the pipeline.
pub const NANOS: Rational = Rational(1, 1_000_000_000);

/// Compressed access unit. Timestamps are nanoseconds on the pipeline clock.
#[derive(Clone, Debug, Default)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub is_key: bool,
}

impl EncodedPacket {
    /// Copies `packet` out of FFmpeg, converting from `time_base` and adding
    /// `offset_ns` to both timestamps.
    pub(crate) fn from_av(
        packet: &ffmpeg_next::Packet,
        time_base: Rational,
        offset_ns: i64,
    ) -> Self {
        let to_ns = |ts: i64| ts.rescale(time_base, NANOS) + offset_ns;
        let pts = packet.pts().map(to_ns).unwrap_or(offset_ns);
        Self {
            data: packet
                .data()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            pts,
            dts: packet.dts().map(to_ns).unwrap_or(pts),
            duration: packet.duration().rescale(time_base, NANOS),
            is_key: packet.is_key(),
        }
    }
}
