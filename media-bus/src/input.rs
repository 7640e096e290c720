//! Demux adapter: drives a [`ContainerSource`] on its own worker and fans
//! each stream's packets out through one output pad per stream.

use std::{collections::BTreeMap, ops::Deref, sync::Arc};

use crate::{
    error::{Error, Result},
    packet::{CompressedPacket, PacketCmd},
    pad::{OutputPad, PadMetadata},
    stage::{Flow, Processor, Stage, StageControl, WorkerContext},
    stream::StreamParameters,
};

/// Container demux collaborator.
pub trait ContainerSource: Send + 'static {
    /// Streams of the opened container, announced once before any packet.
    fn streams(&self) -> Vec<StreamParameters>;

    /// Next packet in its stream's time base. `Ok(None)` at end of input.
    fn read_packet(&mut self) -> anyhow::Result<Option<CompressedPacket>>;
}

pub struct DemuxProcessor {
    name: String,
    source: Box<dyn ContainerSource>,
    pads: BTreeMap<usize, Arc<OutputPad<PacketCmd>>>,
}

impl DemuxProcessor {
    fn end_of_stream(&self, ctx: &WorkerContext) {
        log::info!("{}: end of input", self.name);
        for pad in self.pads.values() {
            pad.produce_until(PacketCmd::Eof, ctx.cancel());
        }
    }
}

impl Processor for DemuxProcessor {
    fn process(&mut self, ctx: &WorkerContext) -> Result<Flow> {
        let packet = match self.source.read_packet().map_err(Error::Container)? {
            Some(packet) => packet,
            None => {
                self.end_of_stream(ctx);
                return Ok(Flow::Finished);
            }
        };
        ctx.stats().record_in();
        let Some(pad) = self.pads.get(&packet.index()) else {
            log::trace!("{}: no pad for stream {}", self.name, packet.index());
            return Ok(Flow::Continue);
        };
        let packet = packet.normalized();
        log::trace!(
            "{}: stream {} packet pts={:?} size={}",
            self.name,
            packet.index(),
            packet.pts(),
            packet.size()
        );
        if pad.produce_until(PacketCmd::Data(packet), ctx.cancel()) > 0 {
            ctx.stats().record_out(1);
        }
        Ok(Flow::Continue)
    }
}

/// Demux stage. Packets leave it in microseconds.
pub struct Demuxer {
    stage: Arc<Stage<DemuxProcessor>>,
    streams: Vec<StreamParameters>,
    pads: BTreeMap<usize, Arc<OutputPad<PacketCmd>>>,
}

impl Demuxer {
    pub fn new(name: &str, source: Box<dyn ContainerSource>) -> Self {
        let streams = source.streams();
        let mut pads = BTreeMap::new();
        for params in &streams {
            log::info!(
                "{}: stream {} {:?} {} {}x{} tb={}",
                name,
                params.index,
                params.kind,
                params.codec,
                params.width,
                params.height,
                params.time_base
            );
            let pad = OutputPad::new(
                &format!("{}.{}", name, params.index),
                PadMetadata::for_stream(params),
            );
            pads.insert(params.index, pad);
        }

        let processor = DemuxProcessor {
            name: name.to_string(),
            source,
            pads: pads.clone(),
        };
        let mut builder = Stage::builder(name, processor);
        for pad in pads.values() {
            builder = builder.output(pad.clone());
        }
        Self {
            stage: Arc::new(builder.build()),
            streams,
            pads,
        }
    }

    pub fn streams(&self) -> &[StreamParameters] {
        &self.streams
    }

    /// First video stream, if any.
    pub fn video_stream(&self) -> Option<&StreamParameters> {
        self.streams.iter().find(|s| s.is_video())
    }

    pub fn output(&self, index: usize) -> Option<&Arc<OutputPad<PacketCmd>>> {
        self.pads.get(&index)
    }

    pub fn control(&self) -> Arc<dyn StageControl> {
        self.stage.clone()
    }
}

impl Deref for Demuxer {
    type Target = Stage<DemuxProcessor>;

    fn deref(&self) -> &Self::Target {
        &self.stage
    }
}
