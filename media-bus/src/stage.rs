//! Generic stage runner: lifecycle calls, one worker thread, owned queues.
//!
//! Concrete stages (decoder, encoder, demux and mux adapters) supply a
//! [`Processor`] with their per-unit logic. [`Stage`] handles the rest: the
//! state machine, spawning and joining the worker, pausing, switching the
//! owned queues between modes, producer phase on output pads, the event
//! channel and counters.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    lifecycle::{Lifecycle, StageState},
    pad::{OutputPad, ProducerPhase},
    queue::{QueueControl, QueueMode},
};

/// Longest a worker waits for input or for a resume before re-checking
/// whether it should exit.
pub const IDLE_WAIT: Duration = Duration::from_millis(10);

const EVENT_CAPACITY: usize = 64;

/// Out-of-band notifications of a stage. Data never travels here.
#[derive(Debug, Clone)]
pub enum StageEvent {
    Started,
    Stopped,
    /// All input was processed and end of stream forwarded downstream.
    EndOfStream,
    /// The worker hit a resource-fatal error and exited.
    Fatal(Arc<Error>),
}

/// Outcome of one [`Processor::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// End of stream handled; the worker exits.
    Finished,
}

/// Per-unit logic of a stage. Runs on the worker thread between `start`
/// and `stop`, and on the caller's thread for the other hooks.
pub trait Processor: Send + 'static {
    /// Runs during `open()`. An error leaves the stage in its previous state.
    fn on_open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs during `start()`, before the worker exists.
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handles at most one unit. Must not block longer than [`IDLE_WAIT`]
    /// waiting for input.
    fn process(&mut self, ctx: &WorkerContext) -> Result<Flow>;

    /// Runs after the worker was joined: release codec and device
    /// resources, keep negotiated parameters.
    fn on_stop(&mut self) {}

    /// Runs during `close()`: forget everything.
    fn on_close(&mut self) {}
}

#[derive(Debug, Default)]
pub struct StageStats {
    units_in: AtomicU64,
    units_out: AtomicU64,
    host_copies: AtomicU64,
}

impl StageStats {
    pub fn record_in(&self) {
        self.units_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out(&self, count: u64) {
        self.units_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_host_copy(&self) {
        self.host_copies.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub units_in: u64,
    pub units_out: u64,
    pub host_copies: u64,
    pub peak_queue_depth: usize,
}

/// What a worker gets to see of its stage.
pub struct WorkerContext {
    name: String,
    cancel: CancellationToken,
    stats: Arc<StageStats>,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fires when the stage is being stopped. Pass it to blocking pushes.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }
}

/// Producer-phase control over an output pad, independent of its unit type.
pub trait PhaseControl: Send + Sync {
    fn set_phase(&self, phase: ProducerPhase);
}

impl<T: Clone> PhaseControl for OutputPad<T> {
    fn set_phase(&self, phase: ProducerPhase) {
        OutputPad::set_phase(self, phase)
    }
}

/// Lifecycle API of any stage, usable as a trait object by an orchestrator.
pub trait StageControl: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> StageState;
    fn init(&self) -> Result<()>;
    fn open(&self) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn pause(&self, paused: bool) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<StageEvent>;
    fn stats(&self) -> StatsSnapshot;
    /// Error that ended the worker, if any, since the last `start()`.
    fn fatal_error(&self) -> Option<Arc<Error>>;
}

struct Shared {
    lifecycle: Lifecycle,
    queues: Vec<Arc<dyn QueueControl>>,
    events: broadcast::Sender<StageEvent>,
    stats: Arc<StageStats>,
    fatal: Mutex<Option<Arc<Error>>>,
}

impl Shared {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn set_queue_mode(&self, mode: QueueMode) {
        for queue in &self.queues {
            queue.set_mode(mode);
        }
    }

    fn clear_queues(&self) -> usize {
        self.queues.iter().map(|q| q.clear()).sum()
    }

    fn emit(&self, event: StageEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

pub struct Stage<P: Processor> {
    shared: Arc<Shared>,
    outputs: Vec<Arc<dyn PhaseControl>>,
    processor: Arc<Mutex<Option<P>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

pub struct StageBuilder<P: Processor> {
    name: String,
    processor: P,
    queues: Vec<Arc<dyn QueueControl>>,
    outputs: Vec<Arc<dyn PhaseControl>>,
}

impl<P: Processor> StageBuilder<P> {
    /// Registers a queue owned by the stage.
    pub fn queue(mut self, queue: Arc<dyn QueueControl>) -> Self {
        self.queues.push(queue);
        self
    }

    /// Registers an output pad whose producer phase follows the stage.
    pub fn output(mut self, pad: Arc<dyn PhaseControl>) -> Self {
        self.outputs.push(pad);
        self
    }

    pub fn build(self) -> Stage<P> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Stage {
            shared: Arc::new(Shared {
                lifecycle: Lifecycle::new(&self.name),
                queues: self.queues,
                events,
                stats: Arc::new(StageStats::default()),
                fatal: Mutex::new(None),
            }),
            outputs: self.outputs,
            processor: Arc::new(Mutex::new(Some(self.processor))),
            worker: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

impl<P: Processor> Stage<P> {
    pub fn builder(name: &str, processor: P) -> StageBuilder<P> {
        StageBuilder {
            name: name.to_string(),
            processor,
            queues: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn state(&self) -> StageState {
        self.shared.lifecycle.state()
    }

    /// Whether a worker thread exists (running, or exited but not joined).
    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Runs `f` on the processor while no worker holds it.
    pub fn with_processor<R>(&self, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        self.processor.lock().as_mut().map(f)
    }

    fn set_output_phase(&self, phase: ProducerPhase) {
        for pad in &self.outputs {
            pad.set_phase(phase);
        }
    }

    fn processor_call<R>(&self, f: impl FnOnce(&mut P) -> Result<R>) -> Result<R> {
        match self.processor.lock().as_mut() {
            Some(processor) => f(processor),
            None => Err(Error::Worker(format!(
                "{}: processor is not available",
                self.name()
            ))),
        }
    }

    pub fn init(&self) -> Result<()> {
        self.shared
            .lifecycle
            .begin("init", &[StageState::Uninitialized], StageState::Initialized)?
            .commit();
        Ok(())
    }

    pub fn open(&self) -> Result<()> {
        let transition = self
            .shared
            .lifecycle
            .begin("open", &[StageState::Initialized], StageState::Open)?;
        self.processor_call(|p| p.on_open())?;
        self.shared.set_queue_mode(QueueMode::Idle);
        self.set_output_phase(ProducerPhase::Open);
        transition.commit();
        log::debug!("stage {} opened", self.name());
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let transition = self.shared.lifecycle.begin(
            "start",
            &[StageState::Open, StageState::Stopped],
            StageState::Running,
        )?;
        self.processor_call(|p| p.on_start())?;
        *self.shared.fatal.lock() = None;

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.shared.set_queue_mode(QueueMode::Running);
        self.set_output_phase(ProducerPhase::Running);

        let shared = Arc::clone(&self.shared);
        let slot = Arc::clone(&self.processor);
        let ctx = WorkerContext {
            name: self.name().to_string(),
            cancel,
            stats: Arc::clone(&self.shared.stats),
        };
        let spawned = thread::Builder::new()
            .name(format!("stage-{}", self.name()))
            .spawn(move || {
                let Some(mut processor) = slot.lock().take() else {
                    return;
                };
                run_worker(&mut processor, &ctx, &shared);
                *slot.lock() = Some(processor);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.set_queue_mode(QueueMode::Idle);
                self.set_output_phase(ProducerPhase::Open);
                return Err(Error::Worker(format!(
                    "{}: cannot spawn worker: {}",
                    self.name(),
                    err
                )));
            }
        };
        *self.worker.lock() = Some(handle);
        transition.commit();
        self.shared.emit(StageEvent::Started);
        log::info!("stage {} started", self.name());
        Ok(())
    }

    pub fn pause(&self, paused: bool) -> Result<()> {
        let (op, from, to) = if paused {
            ("pause", StageState::Running, StageState::Paused)
        } else {
            ("resume", StageState::Paused, StageState::Running)
        };
        self.shared.lifecycle.begin(op, &[from], to)?.commit();
        log::debug!("stage {} {}", self.name(), to);
        Ok(())
    }

    /// Stops the worker and waits for it. No unit is processed after this
    /// returns. Fails with `AlreadyInState` when the stage is not running.
    pub fn stop(&self) -> Result<()> {
        let transition = self.shared.lifecycle.begin(
            "stop",
            &[StageState::Running, StageState::Paused],
            StageState::Stopped,
        )?;
        self.cancel.lock().cancel();
        self.shared.set_queue_mode(QueueMode::Closed);

        let handle = self.worker.lock().take();
        let mut joined = Ok(());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("stage {} worker panicked", self.name());
                joined = Err(Error::Worker(format!("{}: worker panicked", self.name())));
            }
        }

        let purged = self.shared.clear_queues();
        if purged > 0 {
            log::debug!("stage {}: {} queued units released", self.name(), purged);
        }
        self.with_processor(|p| p.on_stop());
        self.set_output_phase(ProducerPhase::Open);
        transition.commit();
        self.shared.emit(StageEvent::Stopped);
        log::info!("stage {} stopped", self.name());
        joined
    }

    pub fn close(&self) -> Result<()> {
        let transition = self.shared.lifecycle.begin(
            "close",
            &[StageState::Initialized, StageState::Open, StageState::Stopped],
            StageState::Uninitialized,
        )?;
        self.with_processor(|p| p.on_close());
        self.shared.set_queue_mode(QueueMode::Closed);
        self.shared.clear_queues();
        self.set_output_phase(ProducerPhase::Idle);
        transition.commit();
        log::debug!("stage {} closed", self.name());
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StageEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.shared.stats;
        StatsSnapshot {
            units_in: stats.units_in.load(Ordering::Relaxed),
            units_out: stats.units_out.load(Ordering::Relaxed),
            host_copies: stats.host_copies.load(Ordering::Relaxed),
            peak_queue_depth: self
                .shared
                .queues
                .iter()
                .map(|q| q.peak())
                .max()
                .unwrap_or(0),
        }
    }

    pub fn fatal_error(&self) -> Option<Arc<Error>> {
        self.shared.fatal.lock().clone()
    }
}

fn run_worker<P: Processor>(processor: &mut P, ctx: &WorkerContext, shared: &Shared) {
    log::debug!("stage {} worker running", shared.name());
    loop {
        if ctx.is_cancelled() {
            break;
        }
        if shared.lifecycle.is_paused() {
            shared.lifecycle.wait_while_paused(IDLE_WAIT);
            continue;
        }
        match processor.process(ctx) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Finished) => {
                log::info!("stage {}: end of stream", shared.name());
                shared.set_queue_mode(QueueMode::Closed);
                shared.emit(StageEvent::EndOfStream);
                break;
            }
            Err(err) => {
                log::error!("stage {} failed: {}", shared.name(), err);
                let err = Arc::new(err);
                *shared.fatal.lock() = Some(Arc::clone(&err));
                // Upstream pushes become no-ops instead of blocking forever.
                shared.set_queue_mode(QueueMode::Closed);
                shared.emit(StageEvent::Fatal(err));
                break;
            }
        }
    }
    log::debug!("stage {} worker exited", shared.name());
}

impl<P: Processor> Drop for Stage<P> {
    fn drop(&mut self) {
        if self.state().is_active() {
            let _ = self.stop();
        }
    }
}

impl<P: Processor> StageControl for Stage<P> {
    fn name(&self) -> &str {
        Stage::name(self)
    }

    fn state(&self) -> StageState {
        Stage::state(self)
    }

    fn init(&self) -> Result<()> {
        Stage::init(self)
    }

    fn open(&self) -> Result<()> {
        Stage::open(self)
    }

    fn start(&self) -> Result<()> {
        Stage::start(self)
    }

    fn pause(&self, paused: bool) -> Result<()> {
        Stage::pause(self, paused)
    }

    fn stop(&self) -> Result<()> {
        Stage::stop(self)
    }

    fn close(&self) -> Result<()> {
        Stage::close(self)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<StageEvent> {
        Stage::subscribe_events(self)
    }

    fn stats(&self) -> StatsSnapshot {
        Stage::stats(self)
    }

    fn fatal_error(&self) -> Option<Arc<Error>> {
        Stage::fatal_error(self)
    }
}

#[cfg(test)]
#[path = "stage_test.rs"]
mod stage_test;
