//! Bounded thread-crossing queues between graph stages.
//!
//! A blocking queue suspends its producer while full and reports one overrun
//! per blocked push. A leaky queue never blocks: it evicts its oldest data
//! buffers to admit the new one and reports how many it dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::media::types::{BusMessage, Leaky, MediaCmd, QueueLimits};

/// The queue is shutting down; the pushed item was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flushing;

impl std::fmt::Display for Flushing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("queue is flushing")
    }
}

impl std::error::Error for Flushing {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Admitted after discarding this many older buffers.
    Evicted(u64),
}

#[derive(Debug)]
pub enum Popped {
    Item(MediaCmd),
    Empty,
    Flushing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub current_buffers: usize,
    pub current_bytes: usize,
    pub total_pushed: u64,
    pub total_popped: u64,
    pub total_dropped: u64,
    pub total_overruns: u64,
}

/// Wakes a consumer that watches several queues at once.
#[derive(Debug, Clone, Default)]
pub struct Doorbell(Arc<(Mutex<u64>, Condvar)>);

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let (seq, cvar) = &*self.0;
        *lock(seq) += 1;
        cvar.notify_all();
    }

    pub fn seq(&self) -> u64 {
        *lock(&self.0.0)
    }

    /// Waits until the bell has rung past `seen` or `timeout` elapses.
    /// Returns the sequence number observed on wake-up.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let (seq, cvar) = &*self.0;
        let guard = lock(seq);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |current| *current <= seen)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

#[derive(Clone)]
pub struct Queue {
    name: String,
    limits: QueueLimits,
    inner: Arc<QueueInner>,
    bus: Option<UnboundedSender<BusMessage>>,
    doorbell: Option<Doorbell>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<MediaCmd>,
    bytes: usize,
    flushing: bool,
    stats: QueueStats,
}

impl Queue {
    pub fn new(name: impl Into<String>, limits: QueueLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(limits.max_buffers.min(1024)),
                    ..Default::default()
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
            bus: None,
            doorbell: None,
        }
    }

    /// Overrun and eviction notifications go to `bus`.
    pub fn with_bus(mut self, bus: UnboundedSender<BusMessage>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_doorbell(mut self, doorbell: Doorbell) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            current_buffers: state.items.len(),
            current_bytes: state.bytes,
            ..state.stats
        }
    }

    /// Admits `cmd`, blocking or evicting according to the leaky mode.
    pub fn push(&self, cmd: MediaCmd) -> Result<Admission, Flushing> {
        let len = cmd.byte_len();
        let mut state = self.state();
        if state.flushing {
            return Err(Flushing);
        }

        let mut evicted = 0u64;
        match self.limits.leaky {
            Leaky::No => {
                if self.is_full(&state) {
                    state.stats.total_overruns += 1;
                    self.notify(BusMessage::Overrun {
                        queue: self.name.clone(),
                    });
                    while self.is_full(&state) && !state.flushing {
                        state = self
                            .inner
                            .not_full
                            .wait(state)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    if state.flushing {
                        return Err(Flushing);
                    }
                }
            }
            Leaky::Downstream => {
                while self.is_full(&state) {
                    let Some(pos) = state
                        .items
                        .iter()
                        .position(|item| matches!(item, MediaCmd::Data(_)))
                    else {
                        break;
                    };
                    if let Some(old) = state.items.remove(pos) {
                        state.bytes = state.bytes.saturating_sub(old.byte_len());
                        evicted += 1;
                    }
                }
                if evicted > 0 {
                    state.stats.total_dropped += evicted;
                    self.notify(BusMessage::Evicted {
                        queue: self.name.clone(),
                        count: evicted,
                    });
                }
            }
        }

        state.items.push_back(cmd);
        state.bytes += len;
        state.stats.total_pushed += 1;
        drop(state);

        self.inner.not_empty.notify_one();
        self.ring();
        Ok(if evicted > 0 {
            Admission::Evicted(evicted)
        } else {
            Admission::Queued
        })
    }

    /// Blocks until an item is available. `None` once the queue is flushing.
    pub fn pop(&self) -> Option<MediaCmd> {
        let mut state = self.state();
        while state.items.is_empty() && !state.flushing {
            state = self
                .inner
                .not_empty
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.flushing {
            return None;
        }
        let item = self.take_front(&mut state);
        drop(state);
        self.inner.not_full.notify_one();
        item
    }

    pub fn try_pop(&self) -> Popped {
        let mut state = self.state();
        if state.flushing {
            return Popped::Flushing;
        }
        match self.take_front(&mut state) {
            Some(item) => {
                drop(state);
                self.inner.not_full.notify_one();
                Popped::Item(item)
            }
            None => Popped::Empty,
        }
    }

    /// Discards everything and releases all blocked producers and
    /// consumers. Later pushes fail with [`Flushing`].
    pub fn set_flushing(&self) {
        let mut state = self.state();
        state.flushing = true;
        state.items.clear();
        state.bytes = 0;
        drop(state);
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
        self.ring();
    }

    pub fn is_flushing(&self) -> bool {
        self.state().flushing
    }

    fn take_front(&self, state: &mut QueueState) -> Option<MediaCmd> {
        let item = state.items.pop_front()?;
        state.bytes = state.bytes.saturating_sub(item.byte_len());
        state.stats.total_popped += 1;
        Some(item)
    }

    fn is_full(&self, state: &QueueState) -> bool {
        state.items.len() >= self.limits.max_buffers || state.bytes >= self.limits.max_bytes
    }

    fn notify(&self, msg: BusMessage) {
        if let Some(bus) = &self.bus {
            let _ = bus.send(msg);
        }
    }

    fn ring(&self) {
        if let Some(doorbell) = &self.doorbell {
            doorbell.ring();
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.inner.state)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("len", &self.len())
            .finish()
    }
}

/// Worker threads never panic while holding a queue lock, but a poisoned
/// lock must not wedge shutdown either.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
