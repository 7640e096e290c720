use std::{ops::Deref, sync::Arc};

use crate::{
    codec::{CodecParameters, ContextHandle, EncodeEngine, Retrieve, Submit},
    config::EncodeConfig,
    device::HwBackend,
    error::{Error, Result},
    frame::{DecodedFrame, FrameCmd},
    interop::{Converted, SurfaceInterop},
    packet::PacketCmd,
    pad::{InputPad, OutputPad, PadMetadata, QueueConsumer},
    queue::BufferQueue,
    stage::{Flow, IDLE_WAIT, Processor, Stage, StageControl, WorkerContext},
    stream::{StreamKind, StreamParameters},
};

struct EncodeSession {
    handle: ContextHandle,
    params: CodecParameters,
}

pub struct EncodeProcessor {
    name: String,
    config: EncodeConfig,
    output_params: StreamParameters,
    input: Arc<BufferQueue<FrameCmd>>,
    output: Arc<OutputPad<PacketCmd>>,
    engine: Box<EncodeEngine>,
    interop: SurfaceInterop,
    session: Option<EncodeSession>,
}

impl EncodeProcessor {
    fn codec_error(&self, code: i32) -> Error {
        Error::Codec {
            stage: self.name.clone(),
            code,
        }
    }

    fn codec_params(&self, frame: &DecodedFrame) -> CodecParameters {
        let mut stream = self.output_params.clone();
        stream.width = self.config.width.unwrap_or(frame.width());
        stream.height = self.config.height.unwrap_or(frame.height());
        stream.pixel_format = self.config.pixel_format.or(frame.pixel_format());
        CodecParameters::new(stream, self.interop.backend().kind()).with_gop(self.config.gop)
    }

    /// Negotiates surface interop for `frame` and (re)opens the codec context
    /// when the upstream format changed.
    fn ensure_session(&mut self, frame: &DecodedFrame, ctx: &WorkerContext) -> Result<()> {
        let renegotiated = self.interop.prepare(frame)?;
        if !renegotiated && self.session.is_some() {
            return Ok(());
        }
        if self.session.is_some() {
            log::info!("{}: upstream format changed, reopening encoder", self.name);
            self.finish_session(ctx)?;
        }

        let params = self.codec_params(frame);
        let device = self.interop.plan().and_then(|plan| plan.device()).cloned();
        let handle = self
            .engine
            .open_context(&params, device.as_ref())
            .map_err(|code| self.codec_error(code))?;
        log::info!(
            "{}: encode context {} opened: {} {}x{} {} kbps on {}",
            self.name,
            handle,
            params.stream.codec,
            params.stream.width,
            params.stream.height,
            params.stream.bit_rate / 1000,
            params.backend
        );

        let mut meta = self.output.metadata();
        if meta.params.as_ref() != Some(&params.stream) {
            meta.params = Some(params.stream.clone());
            self.output.update_metadata(meta);
        }
        self.session = Some(EncodeSession { handle, params });
        Ok(())
    }

    /// Flushes and closes the current context, forwarding what it still had.
    fn finish_session(&mut self, ctx: &WorkerContext) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        if let Submit::Fatal(code) = self.engine.flush() {
            return Err(self.codec_error(code));
        }
        self.drain(ctx)?;
        self.release();
        Ok(())
    }

    fn drain(&mut self, ctx: &WorkerContext) -> Result<()> {
        let time_base = self.config.time_base;
        let index = self.output_params.index;
        loop {
            match self.engine.retrieve() {
                Retrieve::Unit(mut packet) => {
                    packet.set_index(index);
                    packet.rescale_ts(time_base);
                    log::trace!("{}: packet pts={:?}", self.name, packet.pts());
                    self.output
                        .produce_until(PacketCmd::Data(packet), ctx.cancel());
                    ctx.stats().record_out(1);
                    if ctx.is_cancelled() {
                        return Ok(());
                    }
                }
                Retrieve::NoneAvailable => return Ok(()),
                Retrieve::Fatal(code) => return Err(self.codec_error(code)),
            }
        }
    }

    fn encode(&mut self, frame: DecodedFrame, ctx: &WorkerContext) -> Result<()> {
        self.ensure_session(&frame, ctx)?;
        let Converted { mut frame, copied } = self.interop.convert(frame)?;
        if copied {
            ctx.stats().record_host_copy();
        }
        let time_base = self.config.time_base;
        frame.set_pts(frame.pts().map(|pts| time_base.from_micros(pts)));
        frame.set_duration(time_base.from_micros(frame.duration()));
        match self.engine.submit(frame) {
            Submit::Accepted | Submit::NeedMoreInput => {}
            Submit::Fatal(code) => return Err(self.codec_error(code)),
        }
        self.drain(ctx)
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            self.engine.close_context(session.handle);
            log::debug!(
                "{}: encode context {} ({}) closed",
                self.name,
                session.handle,
                session.params.stream.codec
            );
        }
    }
}

impl Processor for EncodeProcessor {
    fn on_open(&mut self) -> Result<()> {
        if self.config.codec.is_empty() {
            return Err(Error::Config(format!("{}: no codec configured", self.name)));
        }
        if !self.config.time_base.is_valid() {
            return Err(Error::Config(format!(
                "{}: invalid time base {}",
                self.name, self.config.time_base
            )));
        }
        if self.config.width.is_some() != self.config.height.is_some() {
            return Err(Error::Config(format!(
                "{}: width and height must be set together",
                self.name
            )));
        }
        Ok(())
    }

    fn process(&mut self, ctx: &WorkerContext) -> Result<Flow> {
        let Some(cmd) = self.input.pop_timeout(IDLE_WAIT) else {
            return Ok(Flow::Continue);
        };
        match cmd {
            FrameCmd::Data(frame) => {
                if !frame.is_video() {
                    log::trace!("{}: skipping non-video frame", self.name);
                    return Ok(Flow::Continue);
                }
                ctx.stats().record_in();
                self.encode(frame, ctx)?;
                Ok(Flow::Continue)
            }
            FrameCmd::Eof => {
                self.finish_session(ctx)?;
                self.output.produce_until(PacketCmd::Eof, ctx.cancel());
                Ok(Flow::Finished)
            }
        }
    }

    fn on_stop(&mut self) {
        self.release();
        self.interop.reset();
    }

    fn on_close(&mut self) {
        self.release();
        self.interop.reset();
    }
}

/// Encoder stage: decoded frames in, packets out.
///
/// The encode context is opened on the first frame, once its geometry and
/// surface type are known, on whichever device surface interop settled on.
/// A full input queue blocks the upstream producer; frames are never dropped.
pub struct Encoder {
    stage: Arc<Stage<EncodeProcessor>>,
    input: InputPad<FrameCmd>,
    output: Arc<OutputPad<PacketCmd>>,
    output_params: StreamParameters,
}

impl Encoder {
    /// `upstream` describes the stream whose frames will be fed in; the
    /// produced stream keeps its index.
    pub fn new(
        name: &str,
        upstream: &StreamParameters,
        config: EncodeConfig,
        engine: Box<EncodeEngine>,
        backend: Arc<dyn HwBackend>,
    ) -> Self {
        let output_params = config.output_params(upstream);
        let queue = Arc::new(BufferQueue::new(
            &format!("{}.in", name),
            config.queue_capacity,
        ));
        let input = InputPad::new(
            &format!("{}.in", name),
            PadMetadata::new(StreamKind::Video).with_hardware(true),
            Arc::new(QueueConsumer::new(Arc::clone(&queue))),
        );
        let output = OutputPad::new(
            &format!("{}.out", name),
            PadMetadata::for_stream(&output_params),
        );
        let processor = EncodeProcessor {
            name: name.to_string(),
            config,
            output_params: output_params.clone(),
            input: Arc::clone(&queue),
            output: Arc::clone(&output),
            engine,
            interop: SurfaceInterop::new(backend),
            session: None,
        };
        let stage = Stage::builder(name, processor)
            .queue(queue)
            .output(output.clone())
            .build();
        Self {
            stage: Arc::new(stage),
            input,
            output,
            output_params,
        }
    }

    pub fn input(&self) -> &InputPad<FrameCmd> {
        &self.input
    }

    pub fn output(&self) -> &Arc<OutputPad<PacketCmd>> {
        &self.output
    }

    /// Parameters of the produced stream, as announced before the first frame.
    pub fn output_params(&self) -> &StreamParameters {
        &self.output_params
    }

    pub fn control(&self) -> Arc<dyn StageControl> {
        self.stage.clone()
    }
}

impl Deref for Encoder {
    type Target = Stage<EncodeProcessor>;

    fn deref(&self) -> &Self::Target {
        &self.stage
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
