//! Staged media pipeline engine: demux, decode, encode and mux stages
//! connected through pads, each stage running its own worker behind a
//! bounded queue, with device surfaces shared across stages where the
//! backends allow it.

/// Registers FFmpeg components. Call once at startup, before any FFmpeg
/// collaborator is created.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod bus;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod input;
pub mod interop;
pub mod lifecycle;
pub mod output;
pub mod packet;
pub mod pad;
pub mod queue;
pub mod rational;
pub mod raw;
pub mod sink;
pub mod stage;
pub mod stream;
pub mod testsrc;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "ffmpeg")]
pub mod hw;
#[cfg(feature = "ffmpeg")]
pub mod scaler;

#[cfg(test)]
mod testing;

pub use bus::{BuiltinCollaborators, Collaborators, Outcome, Pipeline, StageStatus};
pub use config::PipelineConfig;
pub use error::{Error, Result};
