use std::{ops::Deref, sync::Arc};

use crate::{
    codec::{CodecParameters, ContextHandle, DecodeEngine, Retrieve, Submit},
    config::DecoderSettings,
    device::{BackendKind, DeviceContext, HwBackend},
    error::{Error, Result},
    frame::{DecodedFrame, FrameCmd},
    packet::PacketCmd,
    pad::{InputPad, OutputPad, PadMetadata, QueueConsumer},
    queue::BufferQueue,
    rational::Rational,
    stage::{Flow, IDLE_WAIT, Processor, Stage, StageControl, WorkerContext},
    stream::StreamParameters,
};

struct DecodeSession {
    handle: ContextHandle,
    /// Held for the lifetime of the codec context.
    _device: Option<Arc<DeviceContext>>,
}

pub struct DecodeProcessor {
    name: String,
    stream: StreamParameters,
    hw_hint: Option<BackendKind>,
    input: Arc<BufferQueue<PacketCmd>>,
    output: Arc<OutputPad<FrameCmd>>,
    engine: Box<DecodeEngine>,
    backend: Arc<dyn HwBackend>,
    negotiated: Option<CodecParameters>,
    session: Option<DecodeSession>,
}

impl DecodeProcessor {
    fn codec_error(&self, code: i32) -> Error {
        Error::Codec {
            stage: self.name.clone(),
            code,
        }
    }

    /// Creates the device and codec context on the first packet. Later
    /// packets reuse them.
    fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let params = self.negotiated.clone().ok_or_else(|| {
            Error::Worker(format!("{}: decoding before open", self.name))
        })?;

        let device = if self.backend.kind().is_hardware() {
            Some(self.backend.create_device()?)
        } else {
            None
        };
        let handle = self
            .engine
            .open_context(&params, device.as_ref())
            .map_err(|code| self.codec_error(code))?;
        log::info!(
            "{}: decode context {} opened for {} {}x{} on {}",
            self.name,
            handle,
            params.stream.codec,
            params.stream.width,
            params.stream.height,
            params.backend
        );
        self.session = Some(DecodeSession {
            handle,
            _device: device,
        });
        Ok(())
    }

    fn time_base(&self) -> Rational {
        self.negotiated
            .as_ref()
            .map(|p| p.stream.time_base)
            .unwrap_or(Rational::MICROSECONDS)
    }

    /// Fans out every frame the engine has ready.
    fn drain(&mut self, ctx: &WorkerContext) -> Result<()> {
        let time_base = self.time_base();
        loop {
            match self.engine.retrieve() {
                Retrieve::Unit(mut frame) => {
                    frame.set_pts(frame.pts().map(|pts| time_base.to_micros(pts)));
                    frame.set_duration(time_base.to_micros(frame.duration()));
                    self.announce_format(&frame);
                    log::trace!("{}: frame pts={:?}", self.name, frame.pts());
                    self.output
                        .produce_until(FrameCmd::Data(frame), ctx.cancel());
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

    /// Tells subscribers when decoded frames differ from what the pad
    /// advertised.
    fn announce_format(&self, frame: &DecodedFrame) {
        let mut meta = self.output.metadata();
        let hardware = frame.surface().is_some();
        let format = frame.pixel_format();
        if meta.hardware == hardware && meta.pixel_formats.first().copied() == format {
            return;
        }
        log::debug!(
            "{}: output format now {:?} (hardware: {})",
            self.name,
            format,
            hardware
        );
        meta.pixel_formats = format.into_iter().collect();
        meta.hardware = hardware;
        self.output.update_metadata(meta);
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            self.engine.close_context(session.handle);
            log::debug!("{}: decode context {} closed", self.name, session.handle);
        }
    }
}

impl Processor for DecodeProcessor {
    fn on_open(&mut self) -> Result<()> {
        if self.stream.codec.is_empty() {
            return Err(Error::Config(format!("{}: stream has no codec", self.name)));
        }
        let backend = self.backend.kind();
        if let Some(hint) = self.hw_hint {
            if hint != backend {
                return Err(Error::Config(format!(
                    "{}: expected {} acceleration, backend is {}",
                    self.name, hint, backend
                )));
            }
        }
        let mut stream = self.stream.clone();
        if !stream.time_base.is_valid() {
            stream.time_base = Rational::MICROSECONDS;
        }
        self.negotiated = Some(CodecParameters::new(stream, backend));
        Ok(())
    }

    fn process(&mut self, ctx: &WorkerContext) -> Result<Flow> {
        let Some(cmd) = self.input.pop_timeout(IDLE_WAIT) else {
            return Ok(Flow::Continue);
        };
        match cmd {
            PacketCmd::Data(mut packet) => {
                if packet.index() != self.stream.index {
                    log::trace!(
                        "{}: packet of stream {} dropped, decoding stream {}",
                        ctx.name(),
                        packet.index(),
                        self.stream.index
                    );
                    return Ok(Flow::Continue);
                }
                ctx.stats().record_in();
                self.ensure_session()?;
                packet.rescale_ts(self.time_base());
                match self.engine.submit(packet) {
                    Submit::Accepted | Submit::NeedMoreInput => {}
                    Submit::Fatal(code) => return Err(self.codec_error(code)),
                }
                self.drain(ctx)?;
                Ok(Flow::Continue)
            }
            PacketCmd::Eof => {
                if self.session.is_some() {
                    if let Submit::Fatal(code) = self.engine.flush() {
                        return Err(self.codec_error(code));
                    }
                    self.drain(ctx)?;
                }
                self.output.produce_until(FrameCmd::Eof, ctx.cancel());
                Ok(Flow::Finished)
            }
        }
    }

    fn on_stop(&mut self) {
        self.release();
    }

    fn on_close(&mut self) {
        self.release();
        self.negotiated = None;
    }
}

/// Decoder stage: packets in, decoded frames out.
///
/// The codec context and device are created from the first packet, not at
/// `open()`, since some containers only reveal the real parameters then.
pub struct Decoder {
    stage: Arc<Stage<DecodeProcessor>>,
    input: InputPad<PacketCmd>,
    output: Arc<OutputPad<FrameCmd>>,
}

impl Decoder {
    pub fn new(
        name: &str,
        stream: StreamParameters,
        engine: Box<DecodeEngine>,
        backend: Arc<dyn HwBackend>,
        settings: &DecoderSettings,
    ) -> Self {
        let queue = Arc::new(BufferQueue::new(
            &format!("{}.in", name),
            settings.queue_capacity,
        ));
        let input = InputPad::new(
            &format!("{}.in", name),
            PadMetadata {
                kind: Some(stream.kind),
                codec: Some(stream.codec.clone()),
                ..Default::default()
            },
            Arc::new(QueueConsumer::new(Arc::clone(&queue))),
        );
        let output = OutputPad::new(
            &format!("{}.out", name),
            PadMetadata {
                kind: Some(stream.kind),
                codec: None,
                pixel_formats: stream.pixel_format.into_iter().collect(),
                hardware: backend.kind().is_hardware(),
                params: Some(stream.clone()),
            },
        );
        let processor = DecodeProcessor {
            name: name.to_string(),
            stream,
            hw_hint: settings.hw_hint,
            input: Arc::clone(&queue),
            output: Arc::clone(&output),
            engine,
            backend,
            negotiated: None,
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
        }
    }

    pub fn input(&self) -> &InputPad<PacketCmd> {
        &self.input
    }

    pub fn output(&self) -> &Arc<OutputPad<FrameCmd>> {
        &self.output
    }

    pub fn control(&self) -> Arc<dyn StageControl> {
        self.stage.clone()
    }
}

impl Deref for Decoder {
    type Target = Stage<DecodeProcessor>;

    fn deref(&self) -> &Self::Target {
        &self.stage
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
