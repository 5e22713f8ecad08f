//! Rate normalization: a constant frame rate for video and gap-free,
//! contiguous timestamps for audio.

use bytes::Bytes;

use crate::media::stage::Stage;
use crate::media::types::MediaBuffer;

const NANOS: i128 = 1_000_000_000;

/// Resamples a variable-rate frame sequence onto a fixed output grid by
/// duplicating or dropping frames. Each grid slot takes the input frame whose
/// timestamp is closest to it.
pub struct VideoRate {
    num: i128,
    den: i128,
    base: i64,
    next_slot: i64,
    prev: Option<MediaBuffer>,
    frames_in: u64,
    frames_out: u64,
    dropped: u64,
    duplicated: u64,
}

impl VideoRate {
    pub fn new((num, den): (u32, u32)) -> Self {
        Self {
            num: num.max(1) as i128,
            den: den.max(1) as i128,
            base: 0,
            next_slot: 0,
            prev: None,
            frames_in: 0,
            frames_out: 0,
            dropped: 0,
            duplicated: 0,
        }
    }

    fn slot_time(&self, slot: i64) -> i64 {
        (self.base as i128 + slot as i128 * NANOS * self.den / self.num) as i64
    }

    fn period(&self) -> i64 {
        (NANOS * self.den / self.num) as i64
    }

    /// Emits `frame` for every remaining slot up to and including `limit`.
    fn fill_until(&mut self, frame: &MediaBuffer, limit: i64, out: &mut Vec<MediaBuffer>) {
        let mut copies = 0u64;
        while self.slot_time(self.next_slot) <= limit {
            let pts = self.slot_time(self.next_slot);
            let end = self.slot_time(self.next_slot + 1);
            out.push(MediaBuffer {
                pts,
                dts: pts,
                duration: end - pts,
                ..frame.clone()
            });
            self.next_slot += 1;
            copies += 1;
        }
        match copies {
            0 => self.dropped += 1,
            1 => {}
            n => self.duplicated += n - 1,
        }
        self.frames_out += copies;
    }
}

impl Stage for VideoRate {
    fn name(&self) -> &str {
        "videorate"
    }

    fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
        self.frames_in += 1;
        let Some(prev) = self.prev.take() else {
            self.base = buf.pts;
            self.prev = Some(buf);
            return Ok(Vec::new());
        };

        if buf.pts <= prev.pts {
            self.dropped += 1;
            self.prev = Some(prev);
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let midpoint = prev.pts + (buf.pts - prev.pts) / 2;
        self.fill_until(&prev, midpoint, &mut out);
        self.prev = Some(buf);
        Ok(out)
    }

    fn flush(&mut self) -> anyhow::Result<Vec<MediaBuffer>> {
        let mut out = Vec::new();
        if let Some(last) = self.prev.take() {
            let limit = last.pts + self.period() / 2;
            self.fill_until(&last, limit, &mut out);
        }
        log::debug!(
            "videorate: in {} out {} dropped {} duplicated {}",
            self.frames_in,
            self.frames_out,
            self.dropped,
            self.duplicated
        );
        Ok(out)
    }
}

/// Fills gaps with silence and trims overlaps so consecutive audio buffers
/// are sample-contiguous. Input is mono f32.
pub struct AudioRate {
    sample_rate: i128,
    tolerance_ns: i64,
    base: Option<i64>,
    samples_out: i128,
    silence_added: u64,
    samples_dropped: u64,
}

const SAMPLE_BYTES: usize = 4;

impl AudioRate {
    pub const DEFAULT_TOLERANCE_NS: i64 = 40_000_000;

    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1) as i128,
            tolerance_ns: Self::DEFAULT_TOLERANCE_NS,
            base: None,
            samples_out: 0,
            silence_added: 0,
            samples_dropped: 0,
        }
    }

    pub fn with_tolerance(mut self, tolerance_ns: i64) -> Self {
        self.tolerance_ns = tolerance_ns;
        self
    }

    fn time_of(&self, samples: i128) -> i64 {
        (self.base.unwrap_or(0) as i128 + samples * NANOS / self.sample_rate) as i64
    }

    fn samples_in(&self, nanos: i64) -> usize {
        (nanos.max(0) as i128 * self.sample_rate / NANOS) as usize
    }

    fn emit(&mut self, data: Bytes, out: &mut Vec<MediaBuffer>) {
        let samples = (data.len() / SAMPLE_BYTES) as i128;
        let pts = self.time_of(self.samples_out);
        self.samples_out += samples;
        let end = self.time_of(self.samples_out);
        out.push(MediaBuffer::new(data, pts, end - pts));
    }
}

impl Stage for AudioRate {
    fn name(&self) -> &str {
        "audiorate"
    }

    fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
        let whole = buf.len() - buf.len() % SAMPLE_BYTES;
        if whole == 0 {
            return Ok(Vec::new());
        }
        if self.base.is_none() {
            self.base = Some(buf.pts);
        }

        let mut out = Vec::new();
        let mut data = buf.data.slice(..whole);
        let diff = buf.pts - self.time_of(self.samples_out);

        if diff > self.tolerance_ns {
            let mut missing = self.samples_in(diff);
            self.silence_added += missing as u64;
            let one_second = self.sample_rate as usize;
            while missing > 0 {
                let n = missing.min(one_second);
                self.emit(Bytes::from(vec![0u8; n * SAMPLE_BYTES]), &mut out);
                missing -= n;
            }
        } else if diff < -self.tolerance_ns {
            let overlap = self.samples_in(-diff);
            let available = data.len() / SAMPLE_BYTES;
            if overlap >= available {
                self.samples_dropped += available as u64;
                return Ok(out);
            }
            self.samples_dropped += overlap as u64;
            data = data.slice(overlap * SAMPLE_BYTES..);
        }

        self.emit(data, &mut out);
        Ok(out)
    }

    fn flush(&mut self) -> anyhow::Result<Vec<MediaBuffer>> {
        log::debug!(
            "audiorate: {} samples out, {} silence added, {} dropped",
            self.samples_out,
            self.silence_added,
            self.samples_dropped
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: i64) -> MediaBuffer {
        MediaBuffer::new(Bytes::from(pts.to_le_bytes().to_vec()), pts, 33_000_000)
    }

    fn run(stage: &mut dyn Stage, input: Vec<MediaBuffer>) -> Vec<MediaBuffer> {
        let mut out = Vec::new();
        for buf in input {
            out.extend(stage.push(buf).unwrap());
        }
        out.extend(stage.flush().unwrap());
        out
    }

    #[test]
    fn test_video_rate_regular_input_passes_one_to_one() {
        let mut rate = VideoRate::new((30, 1));
        let input: Vec<_> = (0..10).map(|i| frame(1_000_000 + i * 33_333_333)).collect();
        let out = run(&mut rate, input);
        assert_eq!(out.len(), 10);
        for (i, buf) in out.iter().enumerate() {
            assert_eq!(buf.pts, 1_000_000 + (i as i64 * 1_000_000_000) / 30);
            let source_pts = 1_000_000 + i as i64 * 33_333_333;
            assert_eq!(buf.data, Bytes::from(source_pts.to_le_bytes().to_vec()));
        }
    }

    #[test]
    fn test_video_rate_duplicates_across_gap() {
        let mut rate = VideoRate::new((10, 1));
        let out = run(&mut rate, vec![frame(0), frame(500_000_000)]);
        let pts: Vec<_> = out.iter().map(|b| b.pts).collect();
        assert_eq!(pts, vec![0, 100_000_000, 200_000_000, 300_000_000, 400_000_000, 500_000_000]);
        assert!(out[..3].iter().all(|b| b.data == frame(0).data));
        assert!(out[3..].iter().all(|b| b.data == frame(500_000_000).data));
        assert!(out.iter().all(|b| b.duration == 100_000_000));
    }

    #[test]
    fn test_video_rate_drops_bursts_and_regressions() {
        let mut rate = VideoRate::new((10, 1));
        let out = run(
            &mut rate,
            vec![
                frame(0),
                frame(10_000_000),
                frame(5_000_000),
                frame(20_000_000),
                frame(100_000_000),
            ],
        );
        let pts: Vec<_> = out.iter().map(|b| b.pts).collect();
        assert_eq!(pts, vec![0, 100_000_000]);
        assert_eq!(out[1].data, frame(100_000_000).data);
    }

    fn audio(pts: i64, samples: usize, value: f32) -> MediaBuffer {
        let data = value.to_le_bytes().repeat(samples);
        MediaBuffer::new(Bytes::from(data), pts, 0)
    }

    #[test]
    fn test_audio_rate_contiguous_input_is_restamped_only() {
        let mut rate = AudioRate::new(1000);
        let out = run(
            &mut rate,
            vec![audio(5_000_000, 10, 0.5), audio(15_000_000, 10, 0.5)],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].pts, 5_000_000);
        assert_eq!(out[0].duration, 10_000_000);
        assert_eq!(out[1].pts, 15_000_000);
    }

    #[test]
    fn test_audio_rate_fills_gap_with_silence() {
        let mut rate = AudioRate::new(1000);
        let out = run(
            &mut rate,
            vec![audio(0, 10, 0.5), audio(2_510_000_000, 10, 0.5)],
        );
        let sizes: Vec<_> = out.iter().map(|b| b.len() / 4).collect();
        assert_eq!(sizes, vec![10, 1000, 1000, 500, 10]);
        assert!(out[1].data.iter().all(|&b| b == 0));
        assert_eq!(out[4].pts, 2_510_000_000);
        for pair in out.windows(2) {
            assert_eq!(pair[0].pts + pair[0].duration, pair[1].pts);
        }
    }

    #[test]
    fn test_audio_rate_trims_overlap() {
        let mut rate = AudioRate::new(1000);
        let out = run(
            &mut rate,
            vec![
                audio(0, 100, 0.5),
                audio(50_000_000, 100, 0.25),
                audio(0, 10, 0.75),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].pts, 100_000_000);
        assert_eq!(out[1].len() / 4, 50);
    }
}
