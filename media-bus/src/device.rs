//! Hardware device contexts, frame pools and surface handles.
//!
//! A [`DeviceContext`] and the [`FramePool`]s allocated from it are shared by
//! `Arc`. Every [`SurfaceHandle`] holds its pool, and every pool holds its
//! device, so a device outlives all frames drawn from it. Whichever stage
//! drops the last reference tears the device down.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    frame::{DecodedFrame, FrameStorage},
    stream::PixelFormat,
};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Acceleration backend a device context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Software,
    Vaapi,
    Qsv,
    D3d11va,
    Cuda,
    VideoToolbox,
}

impl BackendKind {
    /// Surface representation frames of this backend live in.
    pub fn native_surface(&self) -> SurfaceKind {
        match self {
            BackendKind::Software => SurfaceKind::Host,
            BackendKind::Vaapi => SurfaceKind::VaSurface,
            BackendKind::Qsv => SurfaceKind::QsvSurface,
            BackendKind::D3d11va => SurfaceKind::D3d11Texture,
            BackendKind::Cuda => SurfaceKind::CudaMemory,
            BackendKind::VideoToolbox => SurfaceKind::CvPixelBuffer,
        }
    }

    /// Foreign surface representations this backend can map without a copy
    /// by deriving a context bound to the same physical device.
    pub fn importable_surfaces(&self) -> &'static [SurfaceKind] {
        match self {
            BackendKind::Software => &[],
            BackendKind::Vaapi => &[SurfaceKind::DrmPrime],
            BackendKind::Qsv => &[
                SurfaceKind::VaSurface,
                SurfaceKind::DrmPrime,
                SurfaceKind::D3d11Texture,
            ],
            BackendKind::D3d11va => &[SurfaceKind::QsvSurface],
            BackendKind::Cuda => &[],
            BackendKind::VideoToolbox => &[],
        }
    }

    pub fn is_hardware(&self) -> bool {
        *self != BackendKind::Software
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Software => "software",
            BackendKind::Vaapi => "vaapi",
            BackendKind::Qsv => "qsv",
            BackendKind::D3d11va => "d3d11va",
            BackendKind::Cuda => "cuda",
            BackendKind::VideoToolbox => "videotoolbox",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Host,
    VaSurface,
    DrmPrime,
    QsvSurface,
    D3d11Texture,
    CudaMemory,
    CvPixelBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameGeometry {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// An opened acceleration device.
pub struct DeviceContext {
    id: DeviceId,
    backend: BackendKind,
    /// Source context when this one was derived; kept alive with it.
    parent: Option<Arc<DeviceContext>>,
}

impl DeviceContext {
    pub fn new(backend: BackendKind) -> Arc<Self> {
        let id = DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!("device context {} created ({})", id, backend);
        Arc::new(Self {
            id,
            backend,
            parent: None,
        })
    }

    /// New context for `backend` bound to the same physical device as `source`.
    pub fn derived(source: &Arc<DeviceContext>, backend: BackendKind) -> Arc<Self> {
        let id = DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            "device context {} ({}) derived from {} ({})",
            id,
            backend,
            source.id,
            source.backend
        );
        Arc::new(Self {
            id,
            backend,
            parent: Some(Arc::clone(source)),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn parent(&self) -> Option<&Arc<DeviceContext>> {
        self.parent.as_ref()
    }

    /// Root physical device this context ultimately refers to.
    pub fn root_id(&self) -> DeviceId {
        match &self.parent {
            Some(parent) => parent.root_id(),
            None => self.id,
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::debug!("device context {} ({}) released", self.id, self.backend);
    }
}

/// A pool of surfaces of one geometry, allocated on one device.
pub struct FramePool {
    id: u64,
    device: Arc<DeviceContext>,
    geometry: FrameGeometry,
    surface: SurfaceKind,
    next_surface: AtomicU64,
}

impl FramePool {
    pub fn new(device: &Arc<DeviceContext>, geometry: FrameGeometry, surface: SurfaceKind) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            device: Arc::clone(device),
            geometry,
            surface,
            next_surface: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn surface_kind(&self) -> SurfaceKind {
        self.surface
    }

    pub fn alloc(self: &Arc<Self>) -> SurfaceHandle {
        SurfaceHandle {
            pool: Arc::clone(self),
            surface_id: self.next_surface.fetch_add(1, Ordering::Relaxed),
            mapped_from: None,
        }
    }

    /// Maps a surface of another pool into this one without copying. The
    /// returned handle keeps `source` alive.
    pub fn map(self: &Arc<Self>, source: &SurfaceHandle) -> SurfaceHandle {
        SurfaceHandle {
            pool: Arc::clone(self),
            surface_id: source.surface_id,
            mapped_from: Some(Arc::new(source.clone())),
        }
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("id", &self.id)
            .field("device", &self.device.id())
            .field("geometry", &self.geometry)
            .field("surface", &self.surface)
            .finish()
    }
}

/// Reference to one hardware-resident frame buffer and the pool owning it.
#[derive(Clone, Debug)]
pub struct SurfaceHandle {
    pool: Arc<FramePool>,
    surface_id: u64,
    mapped_from: Option<Arc<SurfaceHandle>>,
}

impl SurfaceHandle {
    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        self.pool.device()
    }

    pub fn surface_id(&self) -> u64 {
        self.surface_id
    }

    pub fn kind(&self) -> SurfaceKind {
        self.pool.surface_kind()
    }

    /// Surface this one is a mapping of, if any.
    pub fn mapped_from(&self) -> Option<&SurfaceHandle> {
        self.mapped_from.as_deref()
    }
}

/// What a frame's storage looks like, for interop negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceDescriptor {
    pub backend: BackendKind,
    pub surface: SurfaceKind,
    pub device: Option<DeviceId>,
    pub geometry: Option<FrameGeometry>,
}

impl SurfaceDescriptor {
    pub fn host(geometry: Option<FrameGeometry>) -> Self {
        Self {
            backend: BackendKind::Software,
            surface: SurfaceKind::Host,
            device: None,
            geometry,
        }
    }

    pub fn is_host(&self) -> bool {
        self.surface == SurfaceKind::Host
    }
}

/// Where a transfer puts the copied frame.
#[derive(Debug, Clone)]
pub enum TransferTarget {
    Host,
    Pool(Arc<FramePool>),
}

/// Capability set of one acceleration backend.
///
/// Stage logic never knows which backend it talks to; it only calls through
/// this trait. Backends are passed in at construction time.
pub trait HwBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create_device(&self) -> Result<Arc<DeviceContext>>;

    /// Context of this backend on the same physical device as `source`.
    fn derive_device(&self, source: &Arc<DeviceContext>) -> Result<Arc<DeviceContext>>;

    fn create_frame_pool(
        &self,
        device: &Arc<DeviceContext>,
        geometry: FrameGeometry,
    ) -> Result<Arc<FramePool>>;

    /// Explicit GPU to host, host to GPU or GPU to GPU copy.
    fn transfer(&self, frame: &DecodedFrame, target: &TransferTarget) -> Result<DecodedFrame>;
}

/// Host-memory backend. Its device is a placeholder and every transfer is a
/// plain host copy of the mapped planes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareBackend;

impl HwBackend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn create_device(&self) -> Result<Arc<DeviceContext>> {
        Ok(DeviceContext::new(BackendKind::Software))
    }

    fn derive_device(&self, source: &Arc<DeviceContext>) -> Result<Arc<DeviceContext>> {
        Ok(DeviceContext::derived(source, BackendKind::Software))
    }

    fn create_frame_pool(
        &self,
        device: &Arc<DeviceContext>,
        geometry: FrameGeometry,
    ) -> Result<Arc<FramePool>> {
        Ok(FramePool::new(device, geometry, SurfaceKind::Host))
    }

    fn transfer(&self, frame: &DecodedFrame, target: &TransferTarget) -> Result<DecodedFrame> {
        let planes = match frame.storage() {
            FrameStorage::Host { planes } => planes,
            FrameStorage::Hardware {
                planes: Some(planes),
                ..
            } => planes,
            FrameStorage::Hardware { planes: None, .. } => {
                return Err(Error::device(
                    "software backend cannot read an unmapped hardware surface",
                ));
            }
        };
        let copied: Vec<Bytes> = planes.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        match target {
            TransferTarget::Host => Ok(frame.with_storage(FrameStorage::Host { planes: copied })),
            TransferTarget::Pool(pool) => Ok(frame.with_storage(FrameStorage::Hardware {
                surface: pool.alloc(),
                planes: Some(copied),
            })),
        }
    }
}
