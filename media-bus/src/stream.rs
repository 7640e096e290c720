use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::rational::Rational;

/// Elementary stream kind a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    P010,
    Rgb24,
    Bgra,
}

impl PixelFormat {
    /// Host plane sizes in bytes for a `width` x `height` image.
    pub fn plane_sizes(&self, width: u32, height: u32) -> Vec<usize> {
        let w = width as usize;
        let h = height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        match self {
            PixelFormat::Yuv420p => vec![w * h, cw * ch, cw * ch],
            PixelFormat::Nv12 => vec![w * h, cw * 2 * ch],
            PixelFormat::P010 => vec![w * h * 2, cw * 4 * ch],
            PixelFormat::Rgb24 => vec![w * h * 3],
            PixelFormat::Bgra => vec![w * h * 4],
        }
    }

    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        self.plane_sizes(width, height).iter().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    S16,
    S32,
    F32,
    F32Planar,
}

/// Codec parameters announced once per stream by a demux source, or
/// produced by an encoder for the mux side.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParameters {
    pub index: usize,
    pub kind: StreamKind,
    /// Codec name, e.g. "h264", "hevc", "aac", "rawvideo".
    pub codec: String,
    pub time_base: Rational,
    pub frame_rate: Option<Rational>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<PixelFormat>,
    pub sample_rate: u32,
    pub channels: u32,
    pub sample_format: Option<SampleFormat>,
    pub bit_rate: u64,
    pub extradata: Bytes,
}

impl StreamParameters {
    pub fn video(index: usize, codec: &str, width: u32, height: u32, time_base: Rational) -> Self {
        Self {
            index,
            kind: StreamKind::Video,
            codec: codec.to_string(),
            time_base,
            frame_rate: None,
            width,
            height,
            pixel_format: None,
            sample_rate: 0,
            channels: 0,
            sample_format: None,
            bit_rate: 0,
            extradata: Bytes::new(),
        }
    }

    pub fn audio(index: usize, codec: &str, sample_rate: u32, channels: u32) -> Self {
        Self {
            index,
            kind: StreamKind::Audio,
            codec: codec.to_string(),
            time_base: Rational::new(1, sample_rate.max(1) as i32),
            frame_rate: None,
            width: 0,
            height: 0,
            pixel_format: None,
            sample_rate,
            channels,
            sample_format: None,
            bit_rate: 0,
            extradata: Bytes::new(),
        }
    }

    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = Some(format);
        self
    }

    pub fn with_frame_rate(mut self, rate: Rational) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    pub fn is_video(&self) -> bool {
        self.kind == StreamKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == StreamKind::Audio
    }

    pub fn fps(&self) -> f32 {
        self.frame_rate
            .filter(|r| r.is_valid())
            .map(|r| r.to_f64() as f32)
            .unwrap_or(0.0)
    }

    /// Frame duration in microseconds, if the frame rate is known.
    pub fn frame_duration_us(&self) -> Option<i64> {
        self.frame_rate
            .filter(|r| r.is_valid())
            .map(|r| r.invert().to_micros(1))
    }

    /// Parameters for the stream an encoder produces from this one.
    pub fn for_encoder_output(&self, codec: &str, time_base: Rational) -> Self {
        let mut params = self.clone();
        params.codec = codec.to_string();
        params.time_base = time_base;
        params.extradata = Bytes::new();
        params
    }
}
