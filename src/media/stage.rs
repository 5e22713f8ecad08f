use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::PipelineError;
use crate::media::queue::Queue;
use crate::media::types::{BusMessage, MediaBuffer, MediaCmd};

/// One processing step of the graph: converters, rate normalizers, encoders.
///
/// A stage may return zero, one or many buffers per input. `flush` is called
/// once at end of stream and returns whatever the stage still holds.
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>>;

    fn flush(&mut self) -> anyhow::Result<Vec<MediaBuffer>> {
        Ok(Vec::new())
    }
}

/// A chain of stages run on its own thread between two queues.
pub struct Segment {
    name: String,
    input: Queue,
    stages: Vec<Box<dyn Stage>>,
    output: Queue,
    bus: UnboundedSender<BusMessage>,
}

impl Segment {
    pub fn new(
        name: impl Into<String>,
        input: Queue,
        stages: Vec<Box<dyn Stage>>,
        output: Queue,
        bus: UnboundedSender<BusMessage>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            stages,
            output,
            bus,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>, PipelineError> {
        let name = self.name.clone();
        let bus = self.bus.clone();
        spawn_worker(&name, bus, move || self.run())
    }

    fn run(mut self) {
        log::debug!(
            "segment {} started: {} -> [{}] -> {}",
            self.name,
            self.input.name(),
            self.stages
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(", "),
            self.output.name()
        );

        let mut forwarded = 0u64;
        while let Some(cmd) = self.input.pop() {
            match cmd {
                MediaCmd::Data(buf) => {
                    let out = drive(&mut self.stages, vec![buf], &self.bus);
                    for buf in out {
                        if self.output.push(MediaCmd::Data(buf)).is_err() {
                            log::debug!("segment {} stopped: output flushing", self.name);
                            return;
                        }
                        forwarded += 1;
                    }
                }
                MediaCmd::EOF => {
                    for buf in flush_chain(&mut self.stages, &self.bus) {
                        if self.output.push(MediaCmd::Data(buf)).is_err() {
                            return;
                        }
                        forwarded += 1;
                    }
                    let _ = self.output.push(MediaCmd::EOF);
                    log::info!(
                        "segment {} reached end of stream after {} buffers",
                        self.name,
                        forwarded
                    );
                    return;
                }
            }
        }
        log::debug!("segment {} stopped: input flushing", self.name);
    }
}

/// Runs `bufs` through every stage in order. A failing stage drops only the
/// buffer it failed on and reports the error on the bus.
pub(crate) fn drive(
    stages: &mut [Box<dyn Stage>],
    bufs: Vec<MediaBuffer>,
    bus: &UnboundedSender<BusMessage>,
) -> Vec<MediaBuffer> {
    let mut current = bufs;
    for stage in stages.iter_mut() {
        if current.is_empty() {
            break;
        }
        let mut next = Vec::with_capacity(current.len());
        for buf in current {
            match stage.push(buf) {
                Ok(out) => next.extend(out),
                Err(e) => report(bus, stage.name(), &e),
            }
        }
        current = next;
    }
    current
}

/// Flushes stages front to back, pushing each stage's leftovers through the
/// rest of the chain before flushing the next one.
pub(crate) fn flush_chain(
    stages: &mut [Box<dyn Stage>],
    bus: &UnboundedSender<BusMessage>,
) -> Vec<MediaBuffer> {
    let mut tail = Vec::new();
    for i in 0..stages.len() {
        let (head, rest) = stages.split_at_mut(i + 1);
        let stage = &mut head[i];
        let leftovers = match stage.flush() {
            Ok(out) => out,
            Err(e) => {
                report(bus, stage.name(), &e);
                Vec::new()
            }
        };
        let out = drive(rest, leftovers, bus);
        tail.extend(out);
    }
    tail
}

fn report(bus: &UnboundedSender<BusMessage>, source: &str, err: &anyhow::Error) {
    log::error!("{}: {:#}", source, err);
    let _ = bus.send(BusMessage::Error {
        source: source.to_string(),
        message: format!("{:#}", err),
        fatal: false,
    });
}

/// Runs `body` on a named thread. A panic is reported on the bus as a fatal
/// error, since the worker's downstream will never see end of stream.
pub(crate) fn spawn_worker<F>(
    name: &str,
    bus: UnboundedSender<BusMessage>,
    body: F,
) -> Result<JoinHandle<()>, PipelineError>
where
    F: FnOnce() + Send + 'static,
{
    let worker = name.to_string();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(body)) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                log::error!("worker {} died: {}", worker, message);
                let _ = bus.send(BusMessage::Error {
                    source: worker,
                    message,
                    fatal: true,
                });
            }
        })
        .map_err(|source| PipelineError::Spawn {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::media::types::QueueLimits;

    /// Doubles every buffer and holds one back until flush.
    struct Doubler {
        held: Option<MediaBuffer>,
    }

    impl Stage for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
            let mut out: Vec<_> = self.held.take().into_iter().collect();
            out.push(buf.clone());
            self.held = Some(buf);
            Ok(out)
        }

        fn flush(&mut self) -> anyhow::Result<Vec<MediaBuffer>> {
            Ok(self.held.take().into_iter().collect())
        }
    }

    struct RejectOdd;

    impl Stage for RejectOdd {
        fn name(&self) -> &str {
            "reject-odd"
        }

        fn push(&mut self, buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
            if buf.pts % 2 == 1 {
                anyhow::bail!("odd pts {}", buf.pts);
            }
            Ok(vec![buf])
        }
    }

    fn buf(pts: i64) -> MediaBuffer {
        MediaBuffer::new(Bytes::from_static(b"x"), pts, 1)
    }

    #[test]
    fn test_segment_forwards_then_flushes_on_eof() {
        let (bus, mut bus_rx) = tokio::sync::mpsc::unbounded_channel();
        let input = Queue::new("in", QueueLimits::blocking(16, 1 << 20));
        let output = Queue::new("out", QueueLimits::blocking(16, 1 << 20));
        let handle = Segment::new(
            "test-segment",
            input.clone(),
            vec![Box::new(Doubler { held: None }), Box::new(RejectOdd)],
            output.clone(),
            bus,
        )
        .spawn()
        .unwrap();

        for pts in [0, 2, 3, 4] {
            input.push(MediaCmd::Data(buf(pts))).unwrap();
        }
        input.push(MediaCmd::EOF).unwrap();
        handle.join().unwrap();

        let mut seen = Vec::new();
        while let crate::media::queue::Popped::Item(cmd) = output.try_pop() {
            seen.push(match cmd {
                MediaCmd::Data(b) => b.pts,
                MediaCmd::EOF => -1,
            });
        }
        assert_eq!(seen, vec![0, 0, 2, 2, 4, 4, -1]);

        let errors: Vec<_> = std::iter::from_fn(|| bus_rx.try_recv().ok()).collect();
        assert_eq!(errors.len(), 2, "both copies of pts 3 fail: {:?}", errors);
        assert!(matches!(&errors[0], BusMessage::Error { source, .. } if source == "reject-odd"));
    }

    struct Explode;

    impl Stage for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        fn push(&mut self, _buf: MediaBuffer) -> anyhow::Result<Vec<MediaBuffer>> {
            panic!("encoder state corrupted");
        }
    }

    #[test]
    fn test_stage_error_is_not_fatal() {
        let (bus, mut bus_rx) = tokio::sync::mpsc::unbounded_channel();
        let input = Queue::new("in", QueueLimits::blocking(4, 1 << 20));
        let output = Queue::new("out", QueueLimits::blocking(4, 1 << 20));
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(RejectOdd)];
        let handle = Segment::new("odd", input.clone(), stages, output, bus)
            .spawn()
            .unwrap();
        input.push(MediaCmd::Data(buf(1))).unwrap();
        input.push(MediaCmd::EOF).unwrap();
        handle.join().unwrap();

        assert!(matches!(bus_rx.try_recv(), Ok(BusMessage::Error { fatal: false, .. })));
        assert!(bus_rx.try_recv().is_err());
    }

    #[test]
    fn test_panicking_stage_reports_fatal_error() {
        let (bus, mut bus_rx) = tokio::sync::mpsc::unbounded_channel();
        let input = Queue::new("in", QueueLimits::blocking(4, 1 << 20));
        let output = Queue::new("out", QueueLimits::blocking(4, 1 << 20));
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(Explode)];
        let handle = Segment::new("boom", input.clone(), stages, output.clone(), bus)
            .spawn()
            .unwrap();
        input.push(MediaCmd::Data(buf(0))).unwrap();
        handle.join().unwrap();

        match bus_rx.try_recv() {
            Ok(BusMessage::Error {
                source,
                message,
                fatal,
            }) => {
                assert_eq!(source, "boom");
                assert_eq!(message, "encoder state corrupted");
                assert!(fatal);
            }
            other => panic!("expected a fatal error, got {:?}", other),
        }
        assert!(output.is_empty());
    }

    #[test]
    fn test_segment_exits_when_input_flushes() {
        let (bus, _bus_rx) = tokio::sync::mpsc::unbounded_channel();
        let input = Queue::new("in", QueueLimits::blocking(4, 1 << 20));
        let output = Queue::new("out", QueueLimits::blocking(4, 1 << 20));
        let handle = Segment::new("idle", input.clone(), Vec::new(), output.clone(), bus)
            .spawn()
            .unwrap();
        input.set_flushing();
        handle.join().unwrap();
        assert!(output.is_empty());
    }
}
