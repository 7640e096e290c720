//! Mux adapter: collects packets of several streams onto one worker and
//! writes them through a [`ContainerSink`].

use std::{ops::Deref, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, PreconditionError, Result},
    packet::{CompressedPacket, PacketCmd},
    pad::{Consumer, InputPad, PadMetadata},
    queue::{BufferQueue, Delivery},
    stage::{Flow, IDLE_WAIT, Processor, Stage, StageControl, WorkerContext},
    stream::StreamParameters,
};

/// Container mux collaborator.
pub trait ContainerSink: Send + 'static {
    /// Registers an output stream and returns its id in the container.
    fn create_stream(&mut self, params: &StreamParameters) -> anyhow::Result<usize>;

    /// Writes one packet. Its timestamps are in `packet.time_base()`.
    fn write(&mut self, stream: usize, packet: CompressedPacket) -> anyhow::Result<()>;

    /// Writes the trailer. Called once, after the last packet.
    fn finish(&mut self) -> anyhow::Result<()>;
}

type Tagged = (usize, PacketCmd);

/// Tags units with the input they arrived on and pushes them onto the
/// shared mux queue.
struct TaggingConsumer {
    slot: usize,
    queue: Arc<BufferQueue<Tagged>>,
}

impl Consumer<PacketCmd> for TaggingConsumer {
    fn consume(&self, unit: PacketCmd, cancel: &CancellationToken) -> Delivery {
        self.queue.push_until((self.slot, unit), cancel)
    }
}

struct MuxInput {
    params: StreamParameters,
    stream_id: Option<usize>,
    ended: bool,
}

pub struct MuxProcessor {
    name: String,
    sink: Box<dyn ContainerSink>,
    queue: Arc<BufferQueue<Tagged>>,
    inputs: Vec<MuxInput>,
    finished: bool,
}

impl MuxProcessor {
    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.sink.finish().map_err(Error::Container)?;
        log::info!("{}: output finalized", self.name);
        Ok(())
    }
}

impl Processor for MuxProcessor {
    fn on_open(&mut self) -> Result<()> {
        for input in &mut self.inputs {
            if input.stream_id.is_some() {
                continue;
            }
            let id = self
                .sink
                .create_stream(&input.params)
                .map_err(Error::Container)?;
            log::debug!(
                "{}: input {} ({}) mapped to stream {}",
                self.name,
                input.params.index,
                input.params.codec,
                id
            );
            input.stream_id = Some(id);
        }
        Ok(())
    }

    fn on_start(&mut self) -> Result<()> {
        if self.finished {
            return Err(PreconditionError::Finalized {
                stage: self.name.clone(),
            }
            .into());
        }
        for input in &mut self.inputs {
            input.ended = false;
        }
        Ok(())
    }

    fn process(&mut self, ctx: &WorkerContext) -> Result<Flow> {
        let Some((slot, cmd)) = self.queue.pop_timeout(IDLE_WAIT) else {
            return Ok(Flow::Continue);
        };
        let Some(input) = self.inputs.get_mut(slot) else {
            return Err(Error::Worker(format!("{}: unknown input {}", self.name, slot)));
        };
        match cmd {
            PacketCmd::Data(packet) => {
                ctx.stats().record_in();
                if self.finished {
                    log::warn!("{}: packet after finalize dropped", self.name);
                    return Ok(Flow::Continue);
                }
                let Some(stream) = input.stream_id else {
                    return Err(Error::Worker(format!("{}: writing before open", self.name)));
                };
                log::trace!(
                    "{}: stream {} packet pts={:?}",
                    self.name,
                    stream,
                    packet.pts()
                );
                self.sink
                    .write(stream, packet)
                    .map_err(Error::Container)?;
                ctx.stats().record_out(1);
                Ok(Flow::Continue)
            }
            PacketCmd::Eof => {
                input.ended = true;
                if self.inputs.iter().all(|i| i.ended) {
                    self.finish()?;
                    return Ok(Flow::Finished);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn on_close(&mut self) {
        if self.inputs.iter().any(|i| i.stream_id.is_some()) {
            if let Err(err) = self.finish() {
                log::error!("{}: finalize on close failed: {}", self.name, err);
            }
        }
        for input in &mut self.inputs {
            input.stream_id = None;
            input.ended = false;
        }
        self.finished = false;
    }
}

/// Mux stage. One input pad per stream; all of them feed one bounded queue,
/// so a slow sink holds back every producer.
pub struct Muxer {
    stage: Arc<Stage<MuxProcessor>>,
    inputs: Vec<InputPad<PacketCmd>>,
}

impl Muxer {
    pub fn new(
        name: &str,
        sink: Box<dyn ContainerSink>,
        streams: &[StreamParameters],
        queue_capacity: usize,
    ) -> Self {
        let queue = Arc::new(BufferQueue::new(&format!("{}.in", name), queue_capacity));
        let inputs = streams
            .iter()
            .enumerate()
            .map(|(slot, params)| {
                InputPad::new(
                    &format!("{}.in{}", name, slot),
                    PadMetadata::for_stream(params),
                    Arc::new(TaggingConsumer {
                        slot,
                        queue: Arc::clone(&queue),
                    }),
                )
            })
            .collect();
        let processor = MuxProcessor {
            name: name.to_string(),
            sink,
            queue: Arc::clone(&queue),
            inputs: streams
                .iter()
                .map(|params| MuxInput {
                    params: params.clone(),
                    stream_id: None,
                    ended: false,
                })
                .collect(),
            finished: false,
        };
        let stage = Stage::builder(name, processor).queue(queue).build();
        Self {
            stage: Arc::new(stage),
            inputs,
        }
    }

    /// Input pad of the `slot`th stream passed to [`Muxer::new`].
    pub fn input(&self, slot: usize) -> Option<&InputPad<PacketCmd>> {
        self.inputs.get(slot)
    }

    pub fn control(&self) -> Arc<dyn StageControl> {
        self.stage.clone()
    }
}

impl Deref for Muxer {
    type Target = Stage<MuxProcessor>;

    fn deref(&self) -> &Self::Target {
        &self.stage
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        pad::OutputPad,
        rational::Rational,
        stage::StageEvent,
        stream::StreamKind,
        testing::wait_until,
    };

    #[derive(Default)]
    struct Written {
        streams: Vec<String>,
        packets: Vec<(usize, Option<i64>)>,
        finished: usize,
    }

    struct MemorySink(Arc<Mutex<Written>>);

    impl ContainerSink for MemorySink {
        fn create_stream(&mut self, params: &StreamParameters) -> anyhow::Result<usize> {
            let mut written = self.0.lock();
            written.streams.push(params.codec.clone());
            Ok(written.streams.len() - 1)
        }

        fn write(&mut self, stream: usize, packet: CompressedPacket) -> anyhow::Result<()> {
            self.0.lock().packets.push((stream, packet.pts()));
            Ok(())
        }

        fn finish(&mut self) -> anyhow::Result<()> {
            self.0.lock().finished += 1;
            Ok(())
        }
    }

    fn packet(kind: StreamKind, pts: i64) -> PacketCmd {
        PacketCmd::Data(
            CompressedPacket::new(0, kind, Bytes::from_static(b"p"), Rational::MICROSECONDS)
                .with_pts(Some(pts)),
        )
    }

    #[test]
    fn test_finishes_after_every_stream_ended() -> anyhow::Result<()> {
        let video = StreamParameters::video(0, "h264", 64, 32, Rational::MICROSECONDS);
        let audio = StreamParameters::audio(1, "aac", 48000, 2);
        let written = Arc::new(Mutex::new(Written::default()));
        let mux = Muxer::new(
            "mux",
            Box::new(MemorySink(Arc::clone(&written))),
            &[video.clone(), audio.clone()],
            8,
        );
        let video_out = OutputPad::new("enc.out", PadMetadata::for_stream(&video));
        let audio_out = OutputPad::new("audio.out", PadMetadata::for_stream(&audio));
        video_out.link(mux.input(0).expect("video input"))?;
        audio_out.link(mux.input(1).expect("audio input"))?;
        let mut events = mux.subscribe_events();

        mux.init()?;
        mux.open()?;
        assert_eq!(written.lock().streams, vec!["h264", "aac"]);
        mux.start()?;

        video_out.produce(packet(StreamKind::Video, 0));
        audio_out.produce(packet(StreamKind::Audio, 10));
        video_out.produce(packet(StreamKind::Video, 40_000));
        video_out.produce(PacketCmd::Eof);
        assert!(wait_until(Duration::from_secs(2), || written.lock().packets.len() == 3));
        assert_eq!(written.lock().finished, 0);

        audio_out.produce(PacketCmd::Eof);
        assert!(wait_until(Duration::from_secs(2), || written.lock().finished == 1));
        assert_eq!(
            written.lock().packets,
            vec![(0, Some(0)), (1, Some(10)), (0, Some(40_000))]
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut saw_eos = false;
        while !saw_eos && std::time::Instant::now() < deadline {
            match events.try_recv() {
                Ok(event) => saw_eos = matches!(event, StageEvent::EndOfStream),
                Err(_) => std::thread::sleep(Duration::from_millis(2)),
            }
        }
        assert!(saw_eos);

        mux.stop()?;
        mux.close()?;
        // Already finalized: close does not write a second trailer.
        assert_eq!(written.lock().finished, 1);
        Ok(())
    }

    #[test]
    fn test_close_finalizes_unfinished_output() -> anyhow::Result<()> {
        let video = StreamParameters::video(0, "h264", 64, 32, Rational::MICROSECONDS);
        let written = Arc::new(Mutex::new(Written::default()));
        let mux = Muxer::new("mux", Box::new(MemorySink(Arc::clone(&written))), &[video], 8);
        mux.init()?;
        mux.open()?;
        mux.start()?;
        mux.stop()?;
        mux.close()?;
        assert_eq!(written.lock().finished, 1);
        Ok(())
    }

    #[test]
    fn test_reopen_after_finalize_starts_a_new_run() -> anyhow::Result<()> {
        let video = StreamParameters::video(0, "h264", 64, 32, Rational::MICROSECONDS);
        let written = Arc::new(Mutex::new(Written::default()));
        let mux = Muxer::new(
            "mux",
            Box::new(MemorySink(Arc::clone(&written))),
            &[video.clone()],
            8,
        );
        let video_out = OutputPad::new("enc.out", PadMetadata::for_stream(&video));
        video_out.link(mux.input(0).expect("video input"))?;

        mux.init()?;
        mux.open()?;
        mux.start()?;
        video_out.produce(packet(StreamKind::Video, 0));
        video_out.produce(PacketCmd::Eof);
        assert!(wait_until(Duration::from_secs(2), || written.lock().finished == 1));
        mux.stop()?;

        // A finalized output cannot take more packets without a reopen.
        let err = mux.start().unwrap_err();
        assert!(matches!(
            err,
            Error::Precondition(PreconditionError::Finalized { .. })
        ));
        assert_eq!(mux.state(), crate::lifecycle::StageState::Stopped);

        mux.close()?;
        assert_eq!(written.lock().finished, 1);
        mux.init()?;
        mux.open()?;
        assert_eq!(written.lock().streams.len(), 2);
        mux.start()?;
        video_out.produce(packet(StreamKind::Video, 40_000));
        video_out.produce(packet(StreamKind::Video, 80_000));
        video_out.produce(PacketCmd::Eof);
        assert!(wait_until(Duration::from_secs(2), || written.lock().finished == 2));
        assert_eq!(
            written.lock().packets,
            vec![(0, Some(0)), (1, Some(40_000)), (1, Some(80_000))]
        );
        mux.stop()?;
        mux.close()?;
        assert_eq!(written.lock().finished, 2);
        Ok(())
    }
}
