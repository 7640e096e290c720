//! Pipeline wiring: demux → decoder → encoders → muxers, built from a
//! [`PipelineConfig`] and driven as one unit.

use std::{collections::HashSet, pin::Pin, sync::Arc};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_stream::{StreamMap, wrappers::BroadcastStream};

use crate::{
    codec::{DecodeEngine, EncodeEngine},
    config::{EncodeConfig, InputConfig, OutputDest, PipelineConfig},
    decoder::Decoder,
    device::{BackendKind, HwBackend, SoftwareBackend},
    encoder::Encoder,
    error::{Error, Result},
    frame::FrameCmd,
    input::{ContainerSource, Demuxer},
    output::{ContainerSink, Muxer},
    pad::{InputPad, PadMetadata, StreamConsumer, UnitStream},
    raw::{RAW_VIDEO, RawVideoEngine},
    sink::{FileSink, NullSink},
    stage::{StageControl, StageEvent, StatsSnapshot},
    stream::{StreamKind, StreamParameters},
    testsrc::TestSource,
};

/// Creates the collaborators a pipeline is built from. Backend and engine
/// selection happens here, once, at build time.
pub trait Collaborators {
    fn source(&self, input: &InputConfig) -> Result<Box<dyn ContainerSource>>;

    fn backend(&self, kind: BackendKind) -> Result<Arc<dyn HwBackend>>;

    fn decode_engine(&self, stream: &StreamParameters) -> Result<Box<DecodeEngine>>;

    fn encode_engine(&self, config: &EncodeConfig) -> Result<Box<EncodeEngine>>;

    fn sink(&self, dest: &OutputDest) -> Result<Box<dyn ContainerSink>>;
}

/// Test source, raw video engine, software backend and the file/null
/// sinks, plus the FFmpeg collaborators when built with `ffmpeg`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCollaborators;

impl Collaborators for BuiltinCollaborators {
    fn source(&self, input: &InputConfig) -> Result<Box<dyn ContainerSource>> {
        match input {
            InputConfig::TestSource {
                width,
                height,
                frame_rate,
                frames,
                pixel_format,
            } => Ok(Box::new(TestSource::new(
                *width,
                *height,
                *frame_rate,
                *frames,
                *pixel_format,
            ))),
            #[cfg(feature = "ffmpeg")]
            InputConfig::File { path } => Ok(Box::new(crate::ffmpeg::FfmpegSource::open(path)?)),
            #[cfg(not(feature = "ffmpeg"))]
            InputConfig::File { path } => Err(Error::Config(format!(
                "cannot open {}: file input needs the ffmpeg feature",
                path
            ))),
        }
    }

    fn backend(&self, kind: BackendKind) -> Result<Arc<dyn HwBackend>> {
        match kind {
            BackendKind::Software => Ok(Arc::new(SoftwareBackend)),
            other => Err(Error::Config(format!(
                "no device backend for {} in this build",
                other
            ))),
        }
    }

    fn decode_engine(&self, stream: &StreamParameters) -> Result<Box<DecodeEngine>> {
        if stream.codec == RAW_VIDEO {
            return Ok(Box::new(RawVideoEngine::new()));
        }
        #[cfg(feature = "ffmpeg")]
        {
            Ok(Box::new(crate::ffmpeg::FfmpegDecodeEngine::new()))
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            Err(Error::Config(format!(
                "no decoder for {}: build with the ffmpeg feature",
                stream.codec
            )))
        }
    }

    fn encode_engine(&self, config: &EncodeConfig) -> Result<Box<EncodeEngine>> {
        if config.codec == RAW_VIDEO {
            return Ok(Box::new(RawVideoEngine::new()));
        }
        #[cfg(feature = "ffmpeg")]
        {
            Ok(Box::new(crate::ffmpeg::FfmpegEncodeEngine::new(config)))
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            Err(Error::Config(format!(
                "no encoder for {}: build with the ffmpeg feature",
                config.codec
            )))
        }
    }

    fn sink(&self, dest: &OutputDest) -> Result<Box<dyn ContainerSink>> {
        match dest {
            OutputDest::Null => Ok(Box::new(NullSink::new())),
            OutputDest::File { path, format: None } => Ok(Box::new(FileSink::create(path)?)),
            #[cfg(feature = "ffmpeg")]
            OutputDest::File {
                path,
                format: Some(format),
            } => Ok(Box::new(crate::ffmpeg::FfmpegSink::create(
                path,
                Some(format.as_str()),
            )?)),
            #[cfg(not(feature = "ffmpeg"))]
            OutputDest::File {
                path,
                format: Some(format),
            } => Err(Error::Config(format!(
                "cannot mux {} as {}: build with the ffmpeg feature",
                path, format
            ))),
        }
    }
}

pub type PipelineEvents = Pin<Box<dyn Stream<Item = (String, StageEvent)> + Send>>;

/// How a pipeline run ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Every output reached end of stream.
    Finished,
    Failed { stage: String, error: Arc<Error> },
    /// The event stream ended first.
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub name: String,
    pub state: String,
    pub stats: StatsSnapshot,
    pub error: Option<String>,
}

pub struct Pipeline {
    demux: Demuxer,
    decoder: Option<Decoder>,
    encoders: Vec<Encoder>,
    muxers: Vec<Muxer>,
    /// Upstream first.
    stages: Vec<Arc<dyn StageControl>>,
}

impl Pipeline {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::build(config, &BuiltinCollaborators)
    }

    pub fn build(config: &PipelineConfig, collaborators: &dyn Collaborators) -> Result<Self> {
        config.validate()?;
        let demux = Demuxer::new("demux", collaborators.source(&config.input)?);

        let encode_configs = config.encoders();
        let mut decoder = None;
        let mut encoders = Vec::new();
        if !encode_configs.is_empty() {
            let video = demux
                .video_stream()
                .cloned()
                .ok_or_else(|| Error::Config("input has no video stream to decode".to_string()))?;
            let kind = config.decoder.hw_hint.unwrap_or(BackendKind::Software);
            let dec = Decoder::new(
                "decoder",
                video.clone(),
                collaborators.decode_engine(&video)?,
                collaborators.backend(kind)?,
                &config.decoder,
            );
            demux
                .output(video.index)
                .ok_or_else(|| Error::Config(format!("no pad for stream {}", video.index)))?
                .link(dec.input())?;

            for (i, encode) in encode_configs.iter().enumerate() {
                let encoder = Encoder::new(
                    &format!("encoder{}", i),
                    &video,
                    encode.clone(),
                    collaborators.encode_engine(encode)?,
                    collaborators.backend(encode.backend)?,
                );
                dec.output().link(encoder.input())?;
                encoders.push(encoder);
            }
            decoder = Some(dec);
        }

        let mut muxers = Vec::new();
        for (i, output) in config.outputs.iter().enumerate() {
            let name = format!("mux{}", i);
            let sink = collaborators.sink(&output.dest)?;
            let mux = match &output.encode {
                Some(encode) => {
                    let encoder = encode_configs
                        .iter()
                        .position(|e| e == encode)
                        .and_then(|slot| encoders.get(slot))
                        .ok_or_else(|| Error::Config(format!("{}: encoder missing", name)))?;
                    let streams = [encoder.output_params().clone()];
                    let mux = Muxer::new(&name, sink, &streams, config.mux_queue_capacity);
                    encoder.output().link(mux_input(&mux, 0)?)?;
                    mux
                }
                None => {
                    let streams = demux.streams().to_vec();
                    let mux = Muxer::new(&name, sink, &streams, config.mux_queue_capacity);
                    for (slot, stream) in streams.iter().enumerate() {
                        demux
                            .output(stream.index)
                            .ok_or_else(|| {
                                Error::Config(format!("no pad for stream {}", stream.index))
                            })?
                            .link(mux_input(&mux, slot)?)?;
                    }
                    mux
                }
            };
            muxers.push(mux);
        }

        let mut stages = vec![demux.control()];
        stages.extend(decoder.iter().map(|d| d.control()));
        stages.extend(encoders.iter().map(|e| e.control()));
        stages.extend(muxers.iter().map(|m| m.control()));
        log::info!(
            "pipeline built: {}",
            stages
                .iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            demux,
            decoder,
            encoders,
            muxers,
            stages,
        })
    }

    pub fn stages(&self) -> &[Arc<dyn StageControl>] {
        &self.stages
    }

    pub fn input_streams(&self) -> &[StreamParameters] {
        self.demux.streams()
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }

    /// Initializes and opens every stage.
    pub fn open(&self) -> Result<()> {
        for stage in &self.stages {
            stage.init()?;
            stage.open()?;
        }
        Ok(())
    }

    /// Starts sinks first so nothing is produced into a stage that is not
    /// running yet. Stages already started are stopped again on failure.
    pub fn start(&self) -> Result<()> {
        for (started, stage) in self.stages.iter().rev().enumerate() {
            if let Err(err) = stage.start() {
                log::error!("pipeline start failed at {}: {}", stage.name(), err);
                for stage in self.stages.iter().rev().take(started) {
                    if let Err(err) = stage.stop() {
                        log::warn!("{}: {}", stage.name(), err);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Pauses or resumes every stage. If one stage refuses, the stages
    /// already switched are switched back.
    pub fn pause(&self, paused: bool) -> Result<()> {
        let mut switched = Vec::new();
        for stage in &self.stages {
            match stage.pause(paused) {
                Ok(()) => switched.push(stage),
                Err(err) if err.is_already_in_state() => {}
                Err(err) => {
                    log::error!("pipeline pause({}) failed at {}: {}", paused, stage.name(), err);
                    for stage in switched {
                        if let Err(err) = stage.pause(!paused) {
                            log::warn!("{}: {}", stage.name(), err);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Stops sources first so downstream stages are never left waiting on a
    /// producer that is gone. Stopping a stage that is not running is fine.
    pub fn stop(&self) -> Result<()> {
        let mut first = None;
        for stage in &self.stages {
            match stage.stop() {
                Ok(()) => {}
                Err(err) if err.is_already_in_state() => {}
                Err(err) => {
                    log::error!("{}: stop failed: {}", stage.name(), err);
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn close(&self) -> Result<()> {
        let mut first = None;
        for stage in &self.stages {
            match stage.close() {
                Ok(()) => {}
                Err(err) if err.is_already_in_state() => {}
                Err(err) => {
                    log::error!("{}: close failed: {}", stage.name(), err);
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Events of every stage, tagged with the stage name. Subscribe before
    /// `start()` to see everything.
    pub fn events(&self) -> PipelineEvents {
        let mut map = StreamMap::new();
        for stage in &self.stages {
            let events: Pin<Box<dyn Stream<Item = StageEvent> + Send>> = Box::pin(
                BroadcastStream::new(stage.subscribe_events())
                    .filter_map(|event| futures::future::ready(event.ok())),
            );
            map.insert(stage.name().to_string(), events);
        }
        Box::pin(map)
    }

    /// Waits until every output finished, a stage failed, or `events` ends.
    pub async fn wait(&self, events: &mut PipelineEvents) -> Outcome {
        let mut pending: HashSet<String> =
            self.muxers.iter().map(|m| m.name().to_string()).collect();
        while let Some((stage, event)) = events.next().await {
            match event {
                StageEvent::EndOfStream => {
                    log::debug!("{}: end of stream", stage);
                    pending.remove(&stage);
                    if pending.is_empty() {
                        return Outcome::Finished;
                    }
                }
                StageEvent::Fatal(error) => return Outcome::Failed { stage, error },
                StageEvent::Started | StageEvent::Stopped => {}
            }
        }
        Outcome::Interrupted
    }

    /// Decoded frames as an async stream, for render-style consumers. The
    /// decoder waits when the reader falls `capacity` frames behind.
    pub fn decoded_frames(&self, capacity: usize) -> Result<UnitStream<FrameCmd>> {
        let decoder = self
            .decoder
            .as_ref()
            .ok_or_else(|| Error::Config("pipeline has no decoder".to_string()))?;
        let (consumer, stream) = StreamConsumer::channel(capacity);
        let input = InputPad::new(
            "frames",
            PadMetadata::new(StreamKind::Video).with_hardware(true),
            consumer,
        );
        decoder.output().link(&input)?;
        Ok(stream)
    }

    pub fn status(&self) -> Vec<StageStatus> {
        self.stages
            .iter()
            .map(|stage| StageStatus {
                name: stage.name().to_string(),
                state: stage.state().to_string(),
                stats: stage.stats(),
                error: stage.fatal_error().map(|e| e.to_string()),
            })
            .collect()
    }
}

fn mux_input(mux: &Muxer, slot: usize) -> Result<&InputPad<crate::packet::PacketCmd>> {
    mux.input(slot)
        .ok_or_else(|| Error::Config(format!("{}: no input {}", mux.name(), slot)))
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;
