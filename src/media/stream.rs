use std::{
    pin::Pin,
    task::{Context, Poll},
    thread::JoinHandle,
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::PipelineError;
use crate::media::queue::Queue;
use crate::media::stage::spawn_worker;
use crate::media::types::{BusMessage, MediaCmd};

/// Receives container bytes in production order. Called synchronously from
/// the sink thread; an error is reported on the diagnostics channel and the
/// next chunk is still delivered.
pub trait ChunkSink: Send {
    fn write_chunk(&mut self, chunk: Bytes) -> anyhow::Result<()>;
}

impl<F> ChunkSink for F
where
    F: FnMut(Bytes) -> anyhow::Result<()> + Send,
{
    fn write_chunk(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        self(chunk)
    }
}

/// Drains the mux output queue into a [`ChunkSink`] and announces end of
/// stream on the bus.
pub struct SinkWorker {
    input: Queue,
    sink: Box<dyn ChunkSink>,
    bus: UnboundedSender<BusMessage>,
}

impl SinkWorker {
    pub fn new(input: Queue, sink: Box<dyn ChunkSink>, bus: UnboundedSender<BusMessage>) -> Self {
        Self { input, sink, bus }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>, PipelineError> {
        let bus = self.bus.clone();
        spawn_worker("sink", bus, move || self.run())
    }

    fn run(mut self) {
        let mut bytes = 0usize;
        while let Some(cmd) = self.input.pop() {
            match cmd {
                MediaCmd::Data(buf) => {
                    bytes += buf.len();
                    if let Err(e) = self.sink.write_chunk(buf.data) {
                        log::error!("sink: failed to deliver chunk: {:#}", e);
                        let _ = self.bus.send(BusMessage::Error {
                            source: "sink".to_string(),
                            message: format!("{:#}", e),
                            fatal: false,
                        });
                    }
                }
                MediaCmd::EOF => {
                    log::info!("sink reached end of stream after {} bytes", bytes);
                    let _ = self.bus.send(BusMessage::Eos);
                    return;
                }
            }
        }
    }
}

/// Creates a bounded hand-off from the sink thread to async consumers.
pub fn artifact_channel(capacity: usize) -> (ArtifactWriter, ArtifactStream) {
    let (writer, receiver) = tokio::sync::mpsc::channel(capacity.max(1));
    (ArtifactWriter { writer }, ArtifactStream { receiver })
}

/// The [`ChunkSink`] half. Blocks the sink thread when the consumer lags,
/// which backs up into the mux output queue.
pub struct ArtifactWriter {
    writer: tokio::sync::mpsc::Sender<Bytes>,
}

impl ChunkSink for ArtifactWriter {
    fn write_chunk(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        self.writer
            .blocking_send(chunk)
            .map_err(|_| anyhow::anyhow!("artifact consumer went away"))
    }
}

/// Ordered container bytes. Ends once the pipeline is torn down.
pub struct ArtifactStream {
    receiver: tokio::sync::mpsc::Receiver<Bytes>,
}

impl ArtifactStream {
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}

impl Stream for ArtifactStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;

    use super::*;
    use crate::media::types::{MediaBuffer, QueueLimits};

    fn chunk(s: &'static str) -> MediaCmd {
        MediaCmd::Data(MediaBuffer::new(Bytes::from_static(s.as_bytes()), 0, 0))
    }

    #[test]
    fn test_sink_worker_delivers_in_order_and_reports_eos() {
        let (bus, mut bus_rx) = tokio::sync::mpsc::unbounded_channel();
        let input = Queue::new("mux-output", QueueLimits::blocking(8, 1 << 20));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |chunk: Bytes| {
                if &chunk[..] == b"bad" {
                    anyhow::bail!("rejected");
                }
                seen.lock().unwrap().push(chunk);
                Ok(())
            }
        };
        let handle = SinkWorker::new(input.clone(), Box::new(sink), bus)
            .spawn()
            .unwrap();

        for c in ["a", "bad", "b"] {
            input.push(chunk(c)).unwrap();
        }
        input.push(MediaCmd::EOF).unwrap();
        handle.join().unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
        assert!(matches!(bus_rx.try_recv(), Ok(BusMessage::Error { .. })));
        assert_eq!(bus_rx.try_recv(), Ok(BusMessage::Eos));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_artifact_channel_streams_chunks() {
        let (mut writer, stream) = artifact_channel(4);
        let producer = std::thread::spawn(move || {
            for i in 0..10u8 {
                writer.write_chunk(Bytes::from(vec![i])).unwrap();
            }
        });
        let chunks: Vec<_> = stream.collect().await;
        producer.join().unwrap();
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[9], Bytes::from(vec![9u8]));
    }
}
