use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::PipelineError;
use crate::media::queue::{Doorbell, Popped, Queue};
use crate::media::stage::{Stage, spawn_worker};
use crate::media::types::{BusMessage, MediaBuffer, MediaCmd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Video,
    Audio,
}

impl Track {
    fn index(self) -> usize {
        match self {
            Track::Video => 0,
            Track::Audio => 1,
        }
    }

    fn other(self) -> Track {
        match self {
            Track::Video => Track::Audio,
            Track::Audio => Track::Video,
        }
    }
}

/// Container writer. Returns the container bytes produced so far; chunk
/// boundaries carry no meaning.
pub trait Muxer: Send {
    fn write(&mut self, track: Track, buf: MediaBuffer) -> anyhow::Result<Vec<Bytes>>;

    /// Writes the trailer and returns whatever is still buffered.
    fn finish(&mut self) -> anyhow::Result<Vec<Bytes>>;
}

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

const NAL_IDR: u8 = 5;

/// Check if packet data is in Annex B format by looking at the start codes.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    data.starts_with(START_CODE) || data.starts_with(&START_CODE[1..])
}

/// Converts AVCC (4-byte length + NAL) to Annex B (start code + NAL).
/// Stops at the first truncated or empty NAL.
pub fn convert_avcc_to_annexb(avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(avcc.len());
    let mut i = 0;
    while i + 4 <= avcc.len() {
        let len = u32::from_be_bytes([avcc[i], avcc[i + 1], avcc[i + 2], avcc[i + 3]]) as usize;
        i += 4;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// NAL unit types of an Annex B access unit, in order.
fn annexb_nal_types(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut i = 0;
    std::iter::from_fn(move || {
        while i + 3 < data.len() {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                i += 3;
                return Some(data[i] & 0x1f);
            }
            i += 1;
        }
        None
    })
}

/// Re-packages encoded H.264 as an Annex B elementary stream and flags IDR
/// access units as keyframes. Used ahead of the streamable container.
#[derive(Default)]
pub struct H264Parse {
    converted: u64,
}

impl H264Parse {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for H264Parse {
    fn name(&self) -> &str {
        "h264parse"
    }

    fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
        if buf.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = if is_annexb_packet(&buf.data) {
            buf
        } else {
            let data = convert_avcc_to_annexb(&buf.data);
            if data.is_empty() {
                anyhow::bail!("access unit of {} bytes has no complete NAL", buf.len());
            }
            self.converted += 1;
            buf.with_data(data)
        };
        if !out.is_key {
            out.is_key = annexb_nal_types(&out.data).any(|t| t == NAL_IDR);
        }
        Ok(vec![out])
    }

    fn flush(&mut self) -> anyhow::Result<Vec<MediaBuffer>> {
        if self.converted > 0 {
            log::debug!("h264parse converted {} AVCC access units", self.converted);
        }
        Ok(Vec::new())
    }
}

/// Interleaves the two encoded branches by PTS into the muxer and forwards
/// container bytes to the output queue.
///
/// When only one branch has a buffer ready, it is held for up to `window`
/// before being written alone, so a stalled branch cannot stall the other.
pub struct MuxLoop {
    inputs: [Queue; 2],
    doorbell: Doorbell,
    muxer: Box<dyn Muxer>,
    output: Queue,
    bus: UnboundedSender<BusMessage>,
    window: Duration,
}

impl MuxLoop {
    /// `video` and `audio` must ring `doorbell` on push.
    pub fn new(
        video: Queue,
        audio: Queue,
        doorbell: Doorbell,
        muxer: Box<dyn Muxer>,
        output: Queue,
        bus: UnboundedSender<BusMessage>,
        window: Duration,
    ) -> Self {
        Self {
            inputs: [video, audio],
            doorbell,
            muxer,
            output,
            bus,
            window,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>, PipelineError> {
        let bus = self.bus.clone();
        spawn_worker("mux", bus, move || self.run())
    }

    fn run(mut self) {
        let mut heads: [Option<MediaBuffer>; 2] = [None, None];
        let mut eof = [false; 2];
        let mut lone_since: Option<Instant> = None;
        let mut written = [0u64; 2];

        loop {
            let seen = self.doorbell.seq();
            for track in [Track::Video, Track::Audio] {
                let i = track.index();
                if heads[i].is_some() || eof[i] {
                    continue;
                }
                match self.inputs[i].try_pop() {
                    Popped::Item(MediaCmd::Data(buf)) => heads[i] = Some(buf),
                    Popped::Item(MediaCmd::EOF) => eof[i] = true,
                    Popped::Empty => {}
                    Popped::Flushing => return,
                }
            }

            let next = match (&heads[0], &heads[1]) {
                (Some(v), Some(a)) => Some(if a.pts < v.pts {
                    Track::Audio
                } else {
                    Track::Video
                }),
                (Some(_), None) => self.lone_ready(Track::Video, &eof, &mut lone_since),
                (None, Some(_)) => self.lone_ready(Track::Audio, &eof, &mut lone_since),
                (None, None) if eof == [true, true] => {
                    self.finish(written);
                    return;
                }
                (None, None) => None,
            };

            match next {
                Some(track) => {
                    lone_since = None;
                    if let Some(buf) = heads[track.index()].take() {
                        written[track.index()] += 1;
                        if !self.write(track, buf) {
                            return;
                        }
                    }
                }
                None => {
                    let wait = match lone_since {
                        Some(since) => self.window.saturating_sub(since.elapsed()),
                        None => self.window,
                    };
                    self.doorbell.wait_past(seen, wait.max(Duration::from_millis(1)));
                }
            }
        }
    }

    fn lone_ready(
        &self,
        track: Track,
        eof: &[bool; 2],
        lone_since: &mut Option<Instant>,
    ) -> Option<Track> {
        if eof[track.other().index()] {
            return Some(track);
        }
        let since = *lone_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.window {
            log::debug!("mux: writing {:?} without a {:?} buffer", track, track.other());
            return Some(track);
        }
        None
    }

    /// Returns false once the output queue is flushing.
    fn write(&mut self, track: Track, buf: MediaBuffer) -> bool {
        let pts = buf.pts;
        match self.muxer.write(track, buf) {
            Ok(chunks) => self.forward(chunks, pts),
            Err(e) => {
                log::error!("mux: failed to write {:?} buffer at {}: {:#}", track, pts, e);
                let _ = self.bus.send(BusMessage::Error {
                    source: "mux".to_string(),
                    message: format!("{:#}", e),
                    fatal: false,
                });
                true
            }
        }
    }

    fn forward(&self, chunks: Vec<Bytes>, pts: i64) -> bool {
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            if self
                .output
                .push(MediaCmd::Data(MediaBuffer::new(chunk, pts, 0)))
                .is_err()
            {
                return false;
            }
        }
        true
    }

    fn finish(&mut self, written: [u64; 2]) {
        match self.muxer.finish() {
            Ok(chunks) => {
                if !self.forward(chunks, i64::MAX) {
                    return;
                }
            }
            Err(e) => {
                log::error!("mux: failed to finalize container: {:#}", e);
                let _ = self.bus.send(BusMessage::Error {
                    source: "mux".to_string(),
                    message: format!("{:#}", e),
                    fatal: true,
                });
            }
        }
        log::info!(
            "mux finished: {} video and {} audio buffers written",
            written[0],
            written[1]
        );
        let _ = self.output.push(MediaCmd::EOF);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::media::types::QueueLimits;

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb_packet(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb_packet(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb_packet(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_annexb_packet(&[0x00, 0x00]));
    }

    #[test]
    fn test_avcc_to_annexb() {
        let avcc = [0, 0, 0, 4, 0x65, 0x88, 0x81, 0x00, 0, 0, 0, 2, 0x41, 0x9a];
        let out = convert_avcc_to_annexb(&avcc);
        assert_eq!(
            &out[..],
            &[0, 0, 0, 1, 0x65, 0x88, 0x81, 0x00, 0, 0, 0, 1, 0x41, 0x9a][..]
        );
    }

    #[test]
    fn test_h264parse_flags_idr_access_units() {
        let mut parse = H264Parse::new();
        let idr = MediaBuffer::new(Bytes::from_static(&[0, 0, 0, 4, 0x65, 1, 2, 3]), 0, 1);
        let out = parse.push(idr).unwrap();
        assert!(out[0].is_key);
        assert!(out[0].data.starts_with(START_CODE));

        let slice = MediaBuffer::new(Bytes::from_static(&[0, 0, 1, 0x41, 9, 9]), 1, 1);
        let out = parse.push(slice).unwrap();
        assert!(!out[0].is_key);
        assert_eq!(&out[0].data[..], &[0, 0, 1, 0x41, 9, 9]);

        let broken = MediaBuffer::new(Bytes::from_static(&[0, 0, 0, 9, 1]), 2, 1);
        assert!(parse.push(broken).is_err());
    }

    /// Records the order of writes and emits one tagged chunk per buffer.
    struct Recorder(Arc<Mutex<Vec<(Track, i64)>>>);

    impl Muxer for Recorder {
        fn write(&mut self, track: Track, buf: MediaBuffer) -> anyhow::Result<Vec<Bytes>> {
            self.0.lock().unwrap().push((track, buf.pts));
            Ok(vec![Bytes::from(format!("{:?}@{}", track, buf.pts))])
        }

        fn finish(&mut self) -> anyhow::Result<Vec<Bytes>> {
            Ok(vec![Bytes::from_static(b"trailer")])
        }
    }

    type Written = Arc<Mutex<Vec<(Track, i64)>>>;

    fn setup(window: Duration) -> (Queue, Queue, Queue, Written, JoinHandle<()>) {
        let (bus, _) = tokio::sync::mpsc::unbounded_channel();
        let bell = Doorbell::new();
        let limits = QueueLimits::blocking(64, 1 << 20);
        let video = Queue::new("v", limits).with_doorbell(bell.clone());
        let audio = Queue::new("a", limits).with_doorbell(bell.clone());
        let output = Queue::new("out", limits);
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = MuxLoop::new(
            video.clone(),
            audio.clone(),
            bell,
            Box::new(Recorder(log.clone())),
            output.clone(),
            bus,
            window,
        )
        .spawn()
        .unwrap();
        (video, audio, output, log, handle)
    }

    fn data(pts: i64) -> MediaCmd {
        MediaCmd::Data(MediaBuffer::new(Bytes::from_static(b"p"), pts, 1))
    }

    #[test]
    fn test_interleaves_by_pts_and_finishes_on_both_eof() {
        let (video, audio, output, log, handle) = setup(Duration::from_secs(10));
        for pts in [0, 30, 60] {
            video.push(data(pts)).unwrap();
        }
        for pts in [10, 20, 50, 70] {
            audio.push(data(pts)).unwrap();
        }
        video.push(MediaCmd::EOF).unwrap();
        audio.push(MediaCmd::EOF).unwrap();
        handle.join().unwrap();

        let order: Vec<_> = log.lock().unwrap().iter().map(|(_, pts)| *pts).collect();
        assert_eq!(order, vec![0, 10, 20, 30, 50, 60, 70]);

        let mut chunks = Vec::new();
        while let Popped::Item(cmd) = output.try_pop() {
            chunks.push(cmd);
        }
        assert_eq!(chunks.len(), 9);
        assert!(matches!(&chunks[7], MediaCmd::Data(b) if &b.data[..] == b"trailer"));
        assert_eq!(chunks[8], MediaCmd::EOF);
    }

    #[test]
    fn test_lone_branch_is_written_after_window() {
        let (video, audio, _output, log, handle) = setup(Duration::from_millis(50));
        video.push(data(0)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(log.lock().unwrap().as_slice(), &[(Track::Video, 0)]);

        video.push(MediaCmd::EOF).unwrap();
        audio.push(MediaCmd::EOF).unwrap();
        handle.join().unwrap();
    }
}
