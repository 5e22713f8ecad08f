use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU8, Ordering},
};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::media::{
    backend::{CodecBackend, Codecs},
    convert::{AudioConvert, VideoConvert},
    mux::{H264Parse, MuxLoop},
    queue::{Doorbell, Queue, QueueStats},
    rate::{AudioRate, VideoRate},
    stage::{Segment, Stage},
    stream::{ChunkSink, SinkWorker},
    types::{BusMessage, MediaBuffer, MediaCmd, OutputFormat, PipelineConfig},
    types::{AUDIO_CONVERT, AUDIO_ENCODED, AUDIO_INGEST, MUX_OUTPUT},
    types::{VIDEO_ENCODED, VIDEO_INGEST, VIDEO_REENCODE},
};
use crate::monitor::{DropCounters, DropReport, DropReporter, QueueMonitor};
use crate::time_base::TimeBase;

/// Lifecycle of a [`Pipeline`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PipelineState {
    Uninitialized = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl From<u8> for PipelineState {
    fn from(value: u8) -> Self {
        match value {
            0 => PipelineState::Uninitialized,
            1 => PipelineState::Running,
            2 => PipelineState::Draining,
            _ => PipelineState::Stopped,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(PipelineState::Uninitialized as u8))
    }

    fn load(&self) -> PipelineState {
        self.0.load(Ordering::Acquire).into()
    }

    fn advance(&self, from: PipelineState, to: PipelineState) -> bool {
        from < to
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Moves to `Stopped` from wherever we are; returns the previous state.
    fn stop(&self) -> PipelineState {
        self.0
            .swap(PipelineState::Stopped as u8, Ordering::AcqRel)
            .into()
    }
}

/// Result of a push call. Pushing never fails loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued { pts: i64 },
    /// The pipeline is not running.
    Ignored,
    /// The capture time precedes the clock origin.
    BeforeOrigin { pts: i64 },
    /// Teardown raced with the push.
    Flushing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// End of stream reached the sink.
    Drained,
    /// The graph reported an error while draining.
    Failed(String),
    /// The drain deadline passed; buffered data was discarded.
    TimedOut,
    /// Another caller already shut the pipeline down.
    AlreadyRequested,
}

/// Diagnostics delivered on [`Pipeline::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Non-fatal errors cost one buffer and leave the graph running.
    Error {
        source: String,
        message: String,
        fatal: bool,
    },
    EndOfStream,
    /// Queue drops during the last stats interval.
    Drops(DropReport),
    StateChanged(PipelineState),
}

const EVENT_CHAN_CAP: usize = 64;

/// Handle to the running media graph:
///
/// ```text
/// video-ingest ─► convert ─► rate ─► video-reencode ─► h264 [─► parse] ─► video-encoded ─┐
///                                                                                          ├─► mux ─► mux-output ─► sink
/// audio-ingest ─► convert ─► rate ─► audio-convert ─► aac ──────────────► audio-encoded ─┘
/// ```
///
/// Every arrow between named queues is its own thread. The handle is
/// `Send + Sync`; video and audio producers may push concurrently.
pub struct Pipeline {
    config: PipelineConfig,
    state: Arc<StateCell>,
    time_base: TimeBase,
    video_in: Queue,
    audio_in: Queue,
    queues: Vec<Queue>,
    monitor: Arc<QueueMonitor>,
    events: broadcast::Sender<PipelineEvent>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            backend: None,
            sink: None,
        }
    }

    /// Builds the graph and starts every worker. Must be called inside a
    /// tokio runtime, which hosts the diagnostics loop.
    pub fn new(
        config: PipelineConfig,
        backend: &dyn CodecBackend,
        sink: Box<dyn ChunkSink>,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let Codecs {
            video_encoder,
            audio_encoder,
            muxer,
        } = backend.open(&config).map_err(PipelineError::Backend)?;

        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHAN_CAP);
        let monitor = Arc::new(QueueMonitor::new());
        let doorbell = Doorbell::new();

        let mut queues = Vec::new();
        let mut queue = |name: &str| {
            let limits = config
                .queues
                .named()
                .into_iter()
                .find(|(n, _)| *n == name)
                .map(|(_, limits)| limits)
                .unwrap_or(config.queues.mux_output);
            monitor.register(name);
            let mut q = Queue::new(name, limits).with_bus(bus_tx.clone());
            if name == VIDEO_ENCODED || name == AUDIO_ENCODED {
                q = q.with_doorbell(doorbell.clone());
            }
            queues.push(q.clone());
            q
        };
        let video_in = queue(VIDEO_INGEST);
        let video_reencode = queue(VIDEO_REENCODE);
        let video_encoded = queue(VIDEO_ENCODED);
        let audio_in = queue(AUDIO_INGEST);
        let audio_convert = queue(AUDIO_CONVERT);
        let audio_encoded = queue(AUDIO_ENCODED);
        let mux_output = queue(MUX_OUTPUT);

        let (width, height) = config.video_frame_size;
        let video_normalize: Vec<Box<dyn Stage>> = vec![
            Box::new(VideoConvert::new(width, height)),
            Box::new(VideoRate::new(config.frame_rate)),
        ];
        let audio_normalize: Vec<Box<dyn Stage>> = vec![
            Box::new(AudioConvert::new(config.audio_format)),
            Box::new(AudioRate::new(config.audio_format.sample_rate())),
        ];
        let mut video_encode: Vec<Box<dyn Stage>> = vec![video_encoder];
        if config.output_format == OutputFormat::Streamable {
            video_encode.push(Box::new(H264Parse::new()));
        }

        let pipeline = Self {
            config: config.clone(),
            state: Arc::new(StateCell::new()),
            time_base: TimeBase::new(),
            video_in: video_in.clone(),
            audio_in: audio_in.clone(),
            queues,
            monitor: monitor.clone(),
            events: events.clone(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        };

        let spawned = (|| -> Result<Vec<JoinHandle<()>>, PipelineError> {
            Ok(vec![
                Segment::new(
                    "video-normalize",
                    video_in,
                    video_normalize,
                    video_reencode.clone(),
                    bus_tx.clone(),
                )
                .spawn()?,
                Segment::new(
                    "video-encode",
                    video_reencode,
                    video_encode,
                    video_encoded.clone(),
                    bus_tx.clone(),
                )
                .spawn()?,
                Segment::new(
                    "audio-normalize",
                    audio_in,
                    audio_normalize,
                    audio_convert.clone(),
                    bus_tx.clone(),
                )
                .spawn()?,
                Segment::new(
                    "audio-encode",
                    audio_convert,
                    vec![audio_encoder],
                    audio_encoded.clone(),
                    bus_tx.clone(),
                )
                .spawn()?,
                MuxLoop::new(
                    video_encoded,
                    audio_encoded,
                    doorbell,
                    muxer,
                    mux_output.clone(),
                    bus_tx.clone(),
                    config.interleave_window,
                )
                .spawn()?,
                SinkWorker::new(mux_output, sink, bus_tx).spawn()?,
            ])
        })();

        match spawned {
            Ok(handles) => *lock(&pipeline.workers) = handles,
            Err(e) => {
                pipeline.teardown();
                return Err(e);
            }
        }

        runtime.spawn(bus_loop(
            bus_rx,
            monitor,
            events,
            pipeline.state.clone(),
            pipeline.cancel.clone(),
            config.stats_interval,
        ));

        pipeline
            .state
            .advance(PipelineState::Uninitialized, PipelineState::Running);
        pipeline.emit(PipelineEvent::StateChanged(PipelineState::Running));
        log::info!(
            "pipeline running: {} {}x{} @ {}/{}",
            config.output_format.container(),
            width,
            height,
            config.frame_rate.0,
            config.frame_rate.1
        );
        Ok(pipeline)
    }

    pub fn state(&self) -> PipelineState {
        self.state.load()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Clock origin, once the first buffer has arrived.
    pub fn origin(&self) -> Option<i64> {
        self.time_base.origin()
    }

    /// Cheap admission hint for producers: skip scaling when this is false.
    pub fn wants_frames(&self) -> bool {
        self.state() == PipelineState::Running && !self.video_in.is_flushing()
    }

    /// Submits one I420 frame. Blocks while the video ingest queue is full.
    pub fn push_video_frame(&self, frame: Bytes, capture_ts_ns: i64) -> PushOutcome {
        let duration = self.config.frame_duration.as_nanos() as i64;
        self.submit(&self.video_in, frame, capture_ts_ns, duration)
    }

    /// Submits PCM in the configured audio format. Never blocks.
    pub fn push_audio_chunk(&self, samples: Bytes, capture_ts_ns: i64) -> PushOutcome {
        let format = self.config.audio_format;
        let count = (samples.len() / format.bytes_per_sample()) as i64;
        let duration = count * 1_000_000_000 / format.sample_rate() as i64;
        self.submit(&self.audio_in, samples, capture_ts_ns, duration)
    }

    fn submit(&self, queue: &Queue, data: Bytes, capture_ts_ns: i64, duration: i64) -> PushOutcome {
        if self.state() != PipelineState::Running {
            return PushOutcome::Ignored;
        }
        if self.time_base.try_set_origin(capture_ts_ns) {
            log::info!("pipeline clock origin set to {} ns", capture_ts_ns);
        }
        let Some(pts) = self.time_base.pts_for(capture_ts_ns) else {
            return PushOutcome::Ignored;
        };
        if pts < 0 {
            return PushOutcome::BeforeOrigin { pts };
        }
        match queue.push(MediaCmd::Data(MediaBuffer::new(data, pts, duration))) {
            Ok(_) => PushOutcome::Queued { pts },
            Err(_) => PushOutcome::Flushing,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Cumulative drop counters per queue.
    pub fn drop_counters(&self) -> std::collections::BTreeMap<String, DropCounters> {
        self.monitor.snapshot()
    }

    pub fn queue_stats(&self) -> Vec<(String, QueueStats)> {
        self.queues
            .iter()
            .map(|q| (q.name().to_string(), q.stats()))
            .collect()
    }

    /// Sends end-of-stream into both branches and waits for it to reach the
    /// sink, for an error, or for the shutdown timeout, whichever is first.
    /// Always ends in [`PipelineState::Stopped`].
    pub async fn shutdown(&self) -> ShutdownOutcome {
        if !self
            .state
            .advance(PipelineState::Running, PipelineState::Draining)
        {
            return ShutdownOutcome::AlreadyRequested;
        }
        self.emit(PipelineEvent::StateChanged(PipelineState::Draining));
        let timeout = self.config.shutdown_timeout;
        log::info!("pipeline draining, waiting up to {:?}", timeout);

        let mut events = self.subscribe();

        // A full video ingest queue would block here; keep the runtime free.
        let video_in = self.video_in.clone();
        if let Err(e) = std::thread::Builder::new()
            .name("video-eos".to_string())
            .spawn(move || {
                let _ = video_in.push(MediaCmd::EOF);
            })
        {
            log::error!("failed to signal video end of stream: {}", e);
        }
        let _ = self.audio_in.push(MediaCmd::EOF);

        let drained = async {
            loop {
                match events.recv().await {
                    Ok(PipelineEvent::EndOfStream) => return ShutdownOutcome::Drained,
                    Ok(PipelineEvent::Error {
                        source,
                        message,
                        fatal: true,
                    }) => {
                        return ShutdownOutcome::Failed(format!("{}: {}", source, message));
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return ShutdownOutcome::Failed("event channel closed".to_string());
                    }
                }
            }
        };

        let outcome = match tokio::time::timeout(timeout, drained).await {
            Ok(outcome) => outcome,
            Err(_) => ShutdownOutcome::TimedOut,
        };
        match &outcome {
            ShutdownOutcome::Drained => log::info!("pipeline drained"),
            ShutdownOutcome::Failed(msg) => log::error!("pipeline drain failed: {}", msg),
            ShutdownOutcome::TimedOut => {
                log::warn!("pipeline drain timed out after {:?}, discarding buffers", timeout)
            }
            ShutdownOutcome::AlreadyRequested => {}
        }

        self.teardown();
        outcome
    }

    /// Stops everything immediately. Blocked producers and workers are
    /// released; workers that are still busy are detached.
    fn teardown(&self) {
        if self.state.stop() == PipelineState::Stopped {
            return;
        }
        self.cancel.cancel();
        for queue in &self.queues {
            queue.set_flushing();
        }
        let workers = std::mem::take(&mut *lock(&self.workers));
        let mut detached = 0;
        for handle in workers {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            log::warn!("pipeline stopped with {} busy workers detached", detached);
        } else {
            log::info!("pipeline stopped");
        }
        self.emit(PipelineEvent::StateChanged(PipelineState::Stopped));
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    backend: Option<Box<dyn CodecBackend>>,
    sink: Option<Box<dyn ChunkSink>>,
}

impl PipelineBuilder {
    pub fn backend(mut self, backend: impl CodecBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn sink(mut self, sink: impl ChunkSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn start(self) -> Result<Pipeline, PipelineError> {
        let backend = self
            .backend
            .ok_or_else(|| PipelineError::Config("no codec backend".to_string()))?;
        let sink = self
            .sink
            .ok_or_else(|| PipelineError::Config("no output sink".to_string()))?;
        Pipeline::new(self.config, backend.as_ref(), sink)
    }
}

/// Single consumer of queue and worker notifications. Owns drop accounting
/// and the periodic report.
async fn bus_loop(
    mut bus: mpsc::UnboundedReceiver<BusMessage>,
    monitor: Arc<QueueMonitor>,
    events: broadcast::Sender<PipelineEvent>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    stats_interval: Duration,
) {
    let mut reporter = DropReporter::new();
    let mut tick =
        tokio::time::interval_at(tokio::time::Instant::now() + stats_interval, stats_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            msg = bus.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                match msg {
                    BusMessage::Overrun { queue } => monitor.record_overrun(&queue),
                    BusMessage::Evicted { queue, count } => monitor.record_evictions(&queue, count),
                    BusMessage::Error { source, message, fatal } => {
                        let _ = events.send(PipelineEvent::Error { source, message, fatal });
                    }
                    BusMessage::Eos => {
                        log::info!("pipeline reached end of stream");
                        let _ = events.send(PipelineEvent::EndOfStream);
                    }
                }
            }
            _ = tick.tick() => {
                if state.load() == PipelineState::Running {
                    let report = reporter.report(&monitor.snapshot());
                    let _ = events.send(PipelineEvent::Drops(report));
                }
            }
        }
    }
    log::debug!("pipeline bus loop finished");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "pipe_test.rs"]
mod pipe_test;
