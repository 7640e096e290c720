//! Pads and subscriptions: how one producer feeds many consumers.
//!
//! An [`OutputPad`] broadcasts every unit it is given to each of its
//! [`Subscription`]s. A subscription delivers to one [`InputPad`], whose
//! [`Consumer`] decides what "delivery" means: push onto a stage queue, call
//! a closure, or forward into an async channel.
//!
//! Deliveries through one subscription are serialized, so a consumer sees
//! units in the order the producer emitted them. Units are shared, not
//! re-encoded: `T::clone` is expected to be a reference-count bump.

use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    queue::{BufferQueue, Delivery},
    stream::{PixelFormat, StreamKind, StreamParameters},
};

static NEXT_PAD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PadId(u64);

impl PadId {
    fn next() -> Self {
        PadId(NEXT_PAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pad#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Negotiated format of a pad.
///
/// On an output pad this describes what is produced. On an input pad it
/// describes what is accepted; unset fields and an empty `pixel_formats`
/// list accept anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PadMetadata {
    pub kind: Option<StreamKind>,
    pub codec: Option<String>,
    pub pixel_formats: Vec<PixelFormat>,
    /// Output: produces hardware-resident frames. Input: accepts them.
    pub hardware: bool,
    pub params: Option<StreamParameters>,
}

impl PadMetadata {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Metadata of a packet pad carrying the stream `params` describes.
    pub fn for_stream(params: &StreamParameters) -> Self {
        Self {
            kind: Some(params.kind),
            codec: Some(params.codec.clone()),
            pixel_formats: params.pixel_format.into_iter().collect(),
            hardware: false,
            params: Some(params.clone()),
        }
    }

    pub fn with_codec(mut self, codec: &str) -> Self {
        self.codec = Some(codec.to_string());
        self
    }

    pub fn with_pixel_formats(mut self, formats: &[PixelFormat]) -> Self {
        self.pixel_formats = formats.to_vec();
        self
    }

    pub fn with_hardware(mut self, hardware: bool) -> Self {
        self.hardware = hardware;
        self
    }

    /// Checks whether an input pad with `self` as its metadata can take
    /// what an output pad with `produced` emits.
    pub fn accepts(&self, produced: &PadMetadata) -> std::result::Result<(), String> {
        if let (Some(want), Some(have)) = (self.kind, produced.kind) {
            if want != have {
                return Err(format!("stream kind {:?} != {:?}", have, want));
            }
        }
        if let (Some(want), Some(have)) = (&self.codec, &produced.codec) {
            if want != have {
                return Err(format!("codec {} != {}", have, want));
            }
        }
        if !self.pixel_formats.is_empty() {
            if let Some(have) = produced.pixel_formats.first() {
                if !self.pixel_formats.contains(have) {
                    return Err(format!("pixel format {:?} not accepted", have));
                }
            }
        }
        if produced.hardware && !self.hardware {
            return Err("hardware surfaces not accepted".to_string());
        }
        Ok(())
    }
}

/// Lifecycle phase of the producer behind an output pad, replayed to late
/// subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerPhase {
    Idle,
    Open,
    Running,
}

/// Receiving side of a subscription.
///
/// Callbacks run on the producer's thread while the pad's subscriber list
/// is locked; they must not link or unlink on the same pad.
pub trait Consumer<T>: Send + Sync {
    /// Producer opened; `meta` is its current format.
    fn on_init(&self, _meta: &PadMetadata) {}

    /// Producer started.
    fn on_start(&self, _meta: &PadMetadata) {}

    /// Producer format changed mid-stream.
    fn on_format(&self, _meta: &PadMetadata) {}

    /// Takes one unit. May block for backpressure, but must give up when
    /// `cancel` fires.
    fn consume(&self, unit: T, cancel: &CancellationToken) -> Delivery;
}

/// Attachment point through which a stage (or sink) receives units.
pub struct InputPad<T> {
    id: PadId,
    name: String,
    meta: PadMetadata,
    consumer: Arc<dyn Consumer<T>>,
}

impl<T> Clone for InputPad<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            meta: self.meta.clone(),
            consumer: Arc::clone(&self.consumer),
        }
    }
}

impl<T> InputPad<T> {
    pub fn new(name: &str, meta: PadMetadata, consumer: Arc<dyn Consumer<T>>) -> Self {
        Self {
            id: PadId::next(),
            name: name.to_string(),
            meta,
            consumer,
        }
    }

    pub fn id(&self) -> PadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &PadMetadata {
        &self.meta
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer<T>> {
        &self.consumer
    }
}

/// Binding of one output pad to one input pad.
pub struct Subscription<T> {
    id: SubscriptionId,
    input: InputPad<T>,
    active: AtomicBool,
    /// Held for the duration of each delivery; unlink waits on it.
    gate: Mutex<()>,
    delivered: AtomicU64,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn input(&self) -> &InputPad<T> {
        &self.input
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn deliver(&self, unit: T, cancel: &CancellationToken) -> Delivery {
        let _gate = self.gate.lock();
        if !self.active.load(Ordering::Acquire) {
            return Delivery::Rejected;
        }
        let result = self.input.consumer.consume(unit, cancel);
        if result == Delivery::Accepted {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

struct OutputState<T> {
    phase: ProducerPhase,
    subs: Vec<Arc<Subscription<T>>>,
}

/// Attachment point through which a stage broadcasts units.
pub struct OutputPad<T> {
    id: PadId,
    name: String,
    meta: RwLock<PadMetadata>,
    state: Mutex<OutputState<T>>,
    next_sub: AtomicU64,
}

impl<T: Clone> OutputPad<T> {
    pub fn new(name: &str, meta: PadMetadata) -> Arc<Self> {
        Arc::new(Self {
            id: PadId::next(),
            name: name.to_string(),
            meta: RwLock::new(meta),
            state: Mutex::new(OutputState {
                phase: ProducerPhase::Idle,
                subs: Vec::new(),
            }),
            next_sub: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> PadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> PadMetadata {
        self.meta.read().clone()
    }

    pub fn phase(&self) -> ProducerPhase {
        self.state.lock().phase
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subs.len()
    }

    /// Subscribes `input` to this pad.
    ///
    /// A subscriber joining an open or running producer is first brought to
    /// the same phase as the existing ones (`on_init`, then `on_start`), with
    /// the current metadata, before it can see any unit.
    pub fn link(&self, input: &InputPad<T>) -> Result<SubscriptionId> {
        let meta = self.metadata();
        input
            .meta
            .accepts(&meta)
            .map_err(|reason| Error::IncompatiblePads {
                output: format!("{} ({})", self.name, self.id),
                input: format!("{} ({})", input.name, input.id),
                reason,
            })?;

        let mut state = self.state.lock();
        if state.subs.iter().any(|s| s.input.id == input.id) {
            return Err(Error::IncompatiblePads {
                output: format!("{} ({})", self.name, self.id),
                input: format!("{} ({})", input.name, input.id),
                reason: "already linked".to_string(),
            });
        }
        match state.phase {
            ProducerPhase::Idle => {}
            ProducerPhase::Open => input.consumer.on_init(&meta),
            ProducerPhase::Running => {
                input.consumer.on_init(&meta);
                input.consumer.on_start(&meta);
            }
        }
        let id = SubscriptionId(self.next_sub.fetch_add(1, Ordering::Relaxed));
        state.subs.push(Arc::new(Subscription {
            id,
            input: input.clone(),
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
            delivered: AtomicU64::new(0),
        }));
        log::debug!(
            "pad {} ({}) linked to {} ({})",
            self.name,
            self.id,
            input.name,
            input.id
        );
        Ok(id)
    }

    /// Removes a subscription. Returns once any delivery to it that was in
    /// flight has finished, so the consumer may be torn down afterwards.
    pub fn unlink(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let pos = state.subs.iter().position(|s| s.id == id);
            pos.map(|pos| state.subs.remove(pos))
        };
        match removed {
            Some(sub) => {
                sub.active.store(false, Ordering::Release);
                drop(sub.gate.lock());
                log::debug!("pad {}: unlinked {}", self.name, sub.input.name);
                true
            }
            None => false,
        }
    }

    /// Removes every subscription to the input pad `input`.
    pub fn unlink_pad(&self, input: PadId) -> bool {
        let ids: Vec<SubscriptionId> = self
            .state
            .lock()
            .subs
            .iter()
            .filter(|s| s.input.id == input)
            .map(|s| s.id)
            .collect();
        let mut any = false;
        for id in ids {
            any |= self.unlink(id);
        }
        any
    }

    /// Delivers `unit` to every current subscription and returns how many
    /// accepted it. Blocking deliveries give up when `cancel` fires.
    pub fn produce_until(&self, unit: T, cancel: &CancellationToken) -> usize {
        let subs: Vec<Arc<Subscription<T>>> = self.state.lock().subs.clone();
        let mut accepted = 0;
        let mut unit = Some(unit);
        let last = subs.len().saturating_sub(1);
        for (i, sub) in subs.iter().enumerate() {
            let item = if i == last {
                unit.take()
            } else {
                unit.clone()
            };
            if let Some(item) = item {
                if sub.deliver(item, cancel) == Delivery::Accepted {
                    accepted += 1;
                }
            }
        }
        accepted
    }

    /// [`produce_until`](Self::produce_until) without a way out of backpressure.
    pub fn produce(&self, unit: T) -> usize {
        self.produce_until(unit, &CancellationToken::new())
    }

    /// Moves the producer to `phase` and tells every subscriber.
    pub fn set_phase(&self, phase: ProducerPhase) {
        let meta = self.metadata();
        let mut state = self.state.lock();
        let previous = state.phase;
        state.phase = phase;
        if previous == phase {
            return;
        }
        for sub in state.subs.iter() {
            match (previous, phase) {
                (ProducerPhase::Idle, ProducerPhase::Open) => sub.input.consumer.on_init(&meta),
                (ProducerPhase::Idle, ProducerPhase::Running) => {
                    sub.input.consumer.on_init(&meta);
                    sub.input.consumer.on_start(&meta);
                }
                (ProducerPhase::Open, ProducerPhase::Running) => {
                    sub.input.consumer.on_start(&meta)
                }
                _ => {}
            }
        }
    }

    /// Replaces the pad metadata and notifies subscribers.
    pub fn update_metadata(&self, meta: PadMetadata) {
        *self.meta.write() = meta.clone();
        let state = self.state.lock();
        for sub in state.subs.iter() {
            sub.input.consumer.on_format(&meta);
        }
    }
}

// ============================================================================
// Consumers
// ============================================================================

/// Pushes units onto a stage's input queue, blocking while it is full.
pub struct QueueConsumer<T> {
    queue: Arc<BufferQueue<T>>,
}

impl<T> QueueConsumer<T> {
    pub fn new(queue: Arc<BufferQueue<T>>) -> Self {
        Self { queue }
    }
}

impl<T: Send> Consumer<T> for QueueConsumer<T> {
    fn consume(&self, unit: T, cancel: &CancellationToken) -> Delivery {
        self.queue.push_until(unit, cancel)
    }
}

/// Calls a closure for every unit. Meant for render/audio sinks.
pub struct FnConsumer<F> {
    f: F,
}

impl<F> FnConsumer<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<T, F> Consumer<T> for FnConsumer<F>
where
    F: Fn(T) + Send + Sync,
{
    fn consume(&self, unit: T, _cancel: &CancellationToken) -> Delivery {
        (self.f)(unit);
        Delivery::Accepted
    }
}

pub type UnitStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Forwards units into a bounded async channel, exposed as a [`Stream`].
///
/// `consume` waits for room in the channel, so a slow async reader slows
/// the producer down instead of losing units. Must be fed from a plain
/// thread (stage workers are), never from inside an async task.
pub struct StreamConsumer<T> {
    tx: tokio::sync::mpsc::Sender<T>,
}

impl<T: Send + 'static> StreamConsumer<T> {
    pub fn channel(capacity: usize) -> (Arc<Self>, UnitStream<T>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), Box::pin(ReceiverStream::new(rx)))
    }
}

impl<T: Send> Consumer<T> for StreamConsumer<T> {
    fn consume(&self, unit: T, cancel: &CancellationToken) -> Delivery {
        futures::executor::block_on(async {
            tokio::select! {
                sent = self.tx.send(unit) => match sent {
                    Ok(()) => Delivery::Accepted,
                    Err(_) => Delivery::Rejected,
                },
                _ = cancel.cancelled() => Delivery::Rejected,
            }
        })
    }
}

#[cfg(test)]
#[path = "pad_test.rs"]
mod pad_test;
