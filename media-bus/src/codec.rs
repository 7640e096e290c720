//! Codec Engine capability consumed by the decoder and encoder stages.
//!
//! An engine wraps one concrete codec implementation (a platform SDK, FFmpeg,
//! or the built-in raw video engine). Stage loops only talk to it through
//! this trait, so they never know which backend does the work.

use std::{fmt, sync::Arc};

use crate::{
    device::{BackendKind, DeviceContext},
    frame::DecodedFrame,
    packet::CompressedPacket,
    stream::StreamParameters,
};

/// Negative status code reported by an engine for a fatal failure.
pub type FatalCode = i32;

/// Generic "operation not supported" code engines can return.
pub const CODE_UNSUPPORTED: FatalCode = -38;
/// Generic "invalid data" code.
pub const CODE_INVALID_DATA: FatalCode = -1094995529;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// What an engine is opened with.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecParameters {
    /// Decoder: the demuxed stream. Encoder: the stream to produce.
    pub stream: StreamParameters,
    /// Backend of the device passed to `open_context`, if any.
    pub backend: BackendKind,
    /// Encoder keyframe interval; ignored by decoders.
    pub gop: Option<u32>,
}

impl CodecParameters {
    pub fn new(stream: StreamParameters, backend: BackendKind) -> Self {
        Self {
            stream,
            backend,
            gop: None,
        }
    }

    pub fn with_gop(mut self, gop: Option<u32>) -> Self {
        self.gop = gop;
        self
    }
}

/// Result of handing one unit (or a flush) to an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Accepted,
    /// Taken, but the engine needs more input before it has output.
    NeedMoreInput,
    Fatal(FatalCode),
}

/// Result of asking an engine for output.
#[derive(Debug)]
pub enum Retrieve<O> {
    Unit(O),
    /// Nothing ready yet; submit more input (or flush) first.
    NoneAvailable,
    Fatal(FatalCode),
}

/// One codec implementation, driven from a single stage worker.
///
/// Timestamps go in and come out in the time base of the opened
/// `CodecParameters::stream`.
pub trait CodecEngine<I, O>: Send {
    fn open_context(
        &mut self,
        params: &CodecParameters,
        device: Option<&Arc<DeviceContext>>,
    ) -> Result<ContextHandle, FatalCode>;

    fn submit(&mut self, unit: I) -> Submit;

    /// Signals end of input. Remaining output is then drained with
    /// [`retrieve`](Self::retrieve) until `NoneAvailable`.
    fn flush(&mut self) -> Submit;

    fn retrieve(&mut self) -> Retrieve<O>;

    fn close_context(&mut self, handle: ContextHandle);
}

pub type DecodeEngine = dyn CodecEngine<CompressedPacket, DecodedFrame>;
pub type EncodeEngine = dyn CodecEngine<DecodedFrame, CompressedPacket>;
