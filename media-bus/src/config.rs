//! Pipeline configuration, loadable from JSON.
//!
//! ```json
//! {
//!   "input": { "type": "test_source", "width": 320, "height": 240, "frame_rate": 25, "frames": 100 },
//!   "decoder": { "hw_hint": null },
//!   "outputs": [
//!     { "dest": { "type": "file", "path": "out.yuv" }, "encode": { "codec": "rawvideo" } },
//!     { "dest": { "type": "null" } }
//!   ]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    device::BackendKind,
    error::{Error, Result},
    queue::{DEFAULT_FRAME_QUEUE_CAPACITY, DEFAULT_MUX_QUEUE_CAPACITY, DEFAULT_PACKET_QUEUE_CAPACITY},
    rational::Rational,
    stream::{PixelFormat, StreamParameters},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputConfig {
    /// Synthetic raw video.
    TestSource {
        width: u32,
        height: u32,
        frame_rate: u32,
        /// `None` runs until stopped.
        #[serde(default)]
        frames: Option<u64>,
        #[serde(default = "default_test_format")]
        pixel_format: PixelFormat,
    },
    /// Any container FFmpeg can open (needs the `ffmpeg` feature).
    File { path: String },
}

fn default_test_format() -> PixelFormat {
    PixelFormat::Yuv420p
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig::TestSource {
            width: 320,
            height: 240,
            frame_rate: 25,
            frames: Some(250),
            pixel_format: default_test_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// Acceleration backend to decode on; software when unset.
    pub hw_hint: Option<BackendKind>,
    pub queue_capacity: usize,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            hw_hint: None,
            queue_capacity: DEFAULT_PACKET_QUEUE_CAPACITY,
        }
    }
}

/// Encoder settings. Outputs with equal settings share one encoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// "rawvideo", "h264", "hevc", ...
    pub codec: String,
    /// `None` keeps the upstream size.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Bits per second; 0 lets the codec decide.
    pub bitrate: u64,
    pub gop: Option<u32>,
    pub preset: Option<String>,
    pub pixel_format: Option<PixelFormat>,
    pub time_base: Rational,
    pub backend: BackendKind,
    pub queue_capacity: usize,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            codec: "rawvideo".to_string(),
            width: None,
            height: None,
            bitrate: 0,
            gop: None,
            preset: None,
            pixel_format: None,
            time_base: Rational::MICROSECONDS,
            backend: BackendKind::Software,
            queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
        }
    }
}

impl EncodeConfig {
    pub fn new(codec: &str) -> Self {
        Self {
            codec: codec.to_string(),
            ..Default::default()
        }
    }

    /// Stream an encoder with these settings produces from `upstream`.
    pub fn output_params(&self, upstream: &StreamParameters) -> StreamParameters {
        let mut params = upstream.for_encoder_output(&self.codec, self.time_base);
        if let Some(width) = self.width {
            params.width = width;
        }
        if let Some(height) = self.height {
            params.height = height;
        }
        if self.pixel_format.is_some() {
            params.pixel_format = self.pixel_format;
        }
        params.bit_rate = self.bitrate;
        params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputDest {
    /// Writes packets to a file; with the `ffmpeg` feature and a `format`
    /// the file is a real container.
    File {
        path: String,
        #[serde(default)]
        format: Option<String>,
    },
    /// Discards packets.
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dest: OutputDest,
    /// `None` remuxes the demuxed packets without decoding.
    #[serde(default)]
    pub encode: Option<EncodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: InputConfig,
    pub decoder: DecoderSettings,
    pub outputs: Vec<OutputConfig>,
    pub mux_queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: InputConfig::default(),
            decoder: DecoderSettings::default(),
            outputs: vec![OutputConfig {
                dest: OutputDest::Null,
                encode: Some(EncodeConfig::default()),
            }],
            mux_queue_capacity: DEFAULT_MUX_QUEUE_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: PipelineConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if let InputConfig::TestSource {
            width,
            height,
            frame_rate,
            ..
        } = &self.input
        {
            if *width == 0 || *height == 0 || *frame_rate == 0 {
                return Err(Error::Config(
                    "test source needs a non-zero size and frame rate".to_string(),
                ));
            }
        }
        if self.outputs.is_empty() {
            return Err(Error::Config("no outputs configured".to_string()));
        }
        for output in &self.outputs {
            if let Some(encode) = &output.encode {
                if encode.codec.is_empty() {
                    return Err(Error::Config("encoder codec is empty".to_string()));
                }
                if !encode.time_base.is_valid() {
                    return Err(Error::Config(format!(
                        "invalid encoder time base {}",
                        encode.time_base
                    )));
                }
            }
        }
        Ok(())
    }

    /// Distinct encoder settings, in first-use order.
    pub fn encoders(&self) -> Vec<EncodeConfig> {
        let mut distinct: Vec<EncodeConfig> = Vec::new();
        for encode in self.outputs.iter().filter_map(|o| o.encode.as_ref()) {
            if !distinct.contains(encode) {
                distinct.push(encode.clone());
            }
        }
        distinct
    }
}

#[derive(Default)]
pub struct PipelineConfigBuilder {
    input: Option<InputConfig>,
    decoder: DecoderSettings,
    outputs: Vec<OutputConfig>,
    mux_queue_capacity: Option<usize>,
}

impl PipelineConfigBuilder {
    pub fn test_source(mut self, width: u32, height: u32, frame_rate: u32, frames: Option<u64>) -> Self {
        self.input = Some(InputConfig::TestSource {
            width,
            height,
            frame_rate,
            frames,
            pixel_format: default_test_format(),
        });
        self
    }

    pub fn input_file(mut self, path: impl Into<String>) -> Self {
        self.input = Some(InputConfig::File { path: path.into() });
        self
    }

    pub fn hw_hint(mut self, backend: BackendKind) -> Self {
        self.decoder.hw_hint = Some(backend);
        self
    }

    /// Re-encodes into `dest`.
    pub fn add_encoded_output(mut self, dest: OutputDest, encode: EncodeConfig) -> Self {
        self.outputs.push(OutputConfig {
            dest,
            encode: Some(encode),
        });
        self
    }

    /// Copies demuxed packets into `dest` without decoding.
    pub fn add_remux_output(mut self, dest: OutputDest) -> Self {
        self.outputs.push(OutputConfig { dest, encode: None });
        self
    }

    pub fn mux_queue_capacity(mut self, capacity: usize) -> Self {
        self.mux_queue_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let config = PipelineConfig {
            input: self
                .input
                .ok_or_else(|| Error::Config("input is required".to_string()))?,
            decoder: self.decoder,
            outputs: self.outputs,
            mux_queue_capacity: self
                .mux_queue_capacity
                .unwrap_or(DEFAULT_MUX_QUEUE_CAPACITY),
        };
        config.validate()?;
        Ok(config)
    }
}
