//! Built-in mux sinks.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::{output::ContainerSink, packet::CompressedPacket, stream::StreamParameters};

/// Writes packet payloads back to back into a file. For raw video this
/// gives a plain `.yuv`/`.nv12` file.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    streams: usize,
    bytes: u64,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            streams: 0,
            bytes: 0,
        })
    }
}

impl ContainerSink for FileSink {
    fn create_stream(&mut self, params: &StreamParameters) -> anyhow::Result<usize> {
        log::debug!(
            "{}: stream {} ({})",
            self.path.display(),
            self.streams,
            params.codec
        );
        self.streams += 1;
        Ok(self.streams - 1)
    }

    fn write(&mut self, _stream: usize, packet: CompressedPacket) -> anyhow::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("{} already finished", self.path.display()))?;
        writer.write_all(&packet.data())?;
        self.bytes += packet.size() as u64;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::info!("{}: {} bytes written", self.path.display(), self.bytes);
        }
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink {
    packets: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContainerSink for NullSink {
    fn create_stream(&mut self, _params: &StreamParameters) -> anyhow::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, _stream: usize, _packet: CompressedPacket) -> anyhow::Result<()> {
        self.packets += 1;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        log::info!("null sink: {} packets discarded", self.packets);
        Ok(())
    }
}
