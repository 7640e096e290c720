use bytes::Bytes;

use crate::{
    device::{FrameGeometry, SurfaceDescriptor, SurfaceHandle},
    stream::{PixelFormat, SampleFormat},
};

/// Unit carried on frame queues and frame pads.
#[derive(Clone, Debug)]
pub enum FrameCmd {
    Data(DecodedFrame),
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    Video(PixelFormat),
    Audio(SampleFormat),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    Host,
    Hardware,
}

/// Where the pixel or sample data of a frame lives.
///
/// Consumers match on this before touching pixel data.
#[derive(Clone, Debug)]
pub enum FrameStorage {
    Host {
        planes: Vec<Bytes>,
    },
    /// `planes` is set when the surface also has a host mapping.
    Hardware {
        surface: SurfaceHandle,
        planes: Option<Vec<Bytes>>,
    },
}

/// One decoded image or audio block.
///
/// `pts` is in microseconds once the frame has left a decoder. Cloning is
/// cheap: planes are shared `Bytes` and surfaces are `Arc`s.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    format: FrameFormat,
    width: u32,
    height: u32,
    samples: usize,
    pts: Option<i64>,
    duration: i64,
    is_key: bool,
    storage: FrameStorage,
}

impl DecodedFrame {
    pub fn video(format: PixelFormat, width: u32, height: u32, planes: Vec<Bytes>) -> Self {
        Self {
            format: FrameFormat::Video(format),
            width,
            height,
            samples: 0,
            pts: None,
            duration: 0,
            is_key: false,
            storage: FrameStorage::Host { planes },
        }
    }

    pub fn hardware(format: PixelFormat, width: u32, height: u32, surface: SurfaceHandle) -> Self {
        Self {
            format: FrameFormat::Video(format),
            width,
            height,
            samples: 0,
            pts: None,
            duration: 0,
            is_key: false,
            storage: FrameStorage::Hardware {
                surface,
                planes: None,
            },
        }
    }

    pub fn audio(format: SampleFormat, samples: usize, planes: Vec<Bytes>) -> Self {
        Self {
            format: FrameFormat::Audio(format),
            width: 0,
            height: 0,
            samples,
            pts: None,
            duration: 0,
            is_key: false,
            storage: FrameStorage::Host { planes },
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    /// Same frame metadata on different storage.
    pub fn with_storage(&self, storage: FrameStorage) -> Self {
        Self {
            storage,
            ..self.clone()
        }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self.format {
            FrameFormat::Video(format) => Some(format),
            FrameFormat::Audio(_) => None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.pts = pts;
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: i64) {
        self.duration = duration;
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn is_video(&self) -> bool {
        matches!(self.format, FrameFormat::Video(_))
    }

    pub fn storage(&self) -> &FrameStorage {
        &self.storage
    }

    pub fn residency(&self) -> Residency {
        match self.storage {
            FrameStorage::Host { .. } => Residency::Host,
            FrameStorage::Hardware { .. } => Residency::Hardware,
        }
    }

    pub fn surface(&self) -> Option<&SurfaceHandle> {
        match &self.storage {
            FrameStorage::Hardware { surface, .. } => Some(surface),
            FrameStorage::Host { .. } => None,
        }
    }

    /// Host planes, if the frame has any.
    pub fn planes(&self) -> Option<&[Bytes]> {
        match &self.storage {
            FrameStorage::Host { planes } => Some(planes),
            FrameStorage::Hardware { planes, .. } => planes.as_deref(),
        }
    }

    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.pixel_format().map(|format| FrameGeometry {
            format,
            width: self.width,
            height: self.height,
        })
    }

    pub fn descriptor(&self) -> SurfaceDescriptor {
        match &self.storage {
            FrameStorage::Host { .. } => SurfaceDescriptor::host(self.geometry()),
            FrameStorage::Hardware { surface, .. } => SurfaceDescriptor {
                backend: surface.device().backend(),
                surface: surface.kind(),
                device: Some(surface.device().id()),
                geometry: self.geometry(),
            },
        }
    }

    /// All host planes concatenated. Copies.
    pub fn data(&self) -> Bytes {
        match self.planes() {
            Some([single]) => single.clone(),
            Some(planes) => {
                let mut out = Vec::with_capacity(planes.iter().map(|p| p.len()).sum());
                for plane in planes {
                    out.extend_from_slice(plane);
                }
                Bytes::from(out)
            }
            None => Bytes::new(),
        }
    }
}
