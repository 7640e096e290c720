//! Surface interop: how a frame from one stage becomes consumable by the
//! device context of the next.
//!
//! [`negotiate`] is the pure decision. [`SurfaceInterop`] caches the decision
//! and the device/pool it needs for one upstream format, and applies it to
//! each frame.

use std::{fmt, sync::Arc};

use crate::{
    device::{
        BackendKind, DeviceContext, DeviceId, FramePool, HwBackend, SurfaceDescriptor,
        TransferTarget,
    },
    error::{Error, Result},
    frame::{DecodedFrame, FrameStorage},
};

/// Cheapest way to make a frame consumable downstream, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InteropDecision {
    /// Use the frame as it is.
    Adopt,
    /// Map the surface through a context derived from the same device.
    Derive,
    /// Copy the frame (GPU to host, host to GPU or GPU to GPU).
    Transfer,
}

impl fmt::Display for InteropDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InteropDecision::Adopt => "adopt",
            InteropDecision::Derive => "derive",
            InteropDecision::Transfer => "transfer",
        };
        f.write_str(name)
    }
}

/// What a consuming stage can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedSurfaces {
    pub backend: BackendKind,
    /// Device the consumer is already bound to. `None` means it can bind to
    /// whatever device the first frame arrives on.
    pub device: Option<DeviceId>,
    pub accepts_host: bool,
}

impl AcceptedSurfaces {
    /// A stage driven through `backend` that has not bound a device yet.
    /// Software backends take host frames, hardware ones only their own
    /// surfaces.
    pub fn for_backend(backend: BackendKind) -> Self {
        Self {
            backend,
            device: None,
            accepts_host: !backend.is_hardware(),
        }
    }
}

/// Picks the interop path for frames described by `source` going into a
/// consumer accepting `dest`.
pub fn negotiate(source: &SurfaceDescriptor, dest: &AcceptedSurfaces) -> InteropDecision {
    if source.is_host() {
        return if dest.accepts_host {
            InteropDecision::Adopt
        } else {
            InteropDecision::Transfer
        };
    }

    let same_device = match (dest.device, source.device) {
        (None, _) => true,
        (Some(want), Some(have)) => want == have,
        (Some(_), None) => false,
    };
    if source.backend == dest.backend
        && source.surface == dest.backend.native_surface()
        && same_device
    {
        return InteropDecision::Adopt;
    }
    if dest.backend.importable_surfaces().contains(&source.surface) {
        return InteropDecision::Derive;
    }
    InteropDecision::Transfer
}

/// Negotiated interop state for one upstream format.
pub struct InteropPlan {
    descriptor: SurfaceDescriptor,
    decision: InteropDecision,
    device: Option<Arc<DeviceContext>>,
    pool: Option<Arc<FramePool>>,
}

impl InteropPlan {
    pub fn descriptor(&self) -> &SurfaceDescriptor {
        &self.descriptor
    }

    pub fn decision(&self) -> InteropDecision {
        self.decision
    }

    /// Device the consumer should open its codec context on.
    pub fn device(&self) -> Option<&Arc<DeviceContext>> {
        self.device.as_ref()
    }

    pub fn pool(&self) -> Option<&Arc<FramePool>> {
        self.pool.as_ref()
    }
}

/// A frame after interop, and whether producing it took a copy.
pub struct Converted {
    pub frame: DecodedFrame,
    pub copied: bool,
}

/// Per-consumer interop state: renegotiates only when the upstream surface
/// descriptor changes.
pub struct SurfaceInterop {
    backend: Arc<dyn HwBackend>,
    accepted: AcceptedSurfaces,
    plan: Option<InteropPlan>,
}

impl SurfaceInterop {
    pub fn new(backend: Arc<dyn HwBackend>) -> Self {
        let accepted = AcceptedSurfaces::for_backend(backend.kind());
        Self {
            backend,
            accepted,
            plan: None,
        }
    }

    pub fn with_accepted(mut self, accepted: AcceptedSurfaces) -> Self {
        self.accepted = accepted;
        self
    }

    pub fn backend(&self) -> &Arc<dyn HwBackend> {
        &self.backend
    }

    pub fn plan(&self) -> Option<&InteropPlan> {
        self.plan.as_ref()
    }

    /// Drops the cached plan and the device/pool it holds.
    pub fn reset(&mut self) {
        self.plan = None;
    }

    /// Makes sure a plan exists for `frame`'s format. Returns `true` when a
    /// new plan was negotiated.
    pub fn prepare(&mut self, frame: &DecodedFrame) -> Result<bool> {
        let descriptor = frame.descriptor();
        if self
            .plan
            .as_ref()
            .is_some_and(|plan| plan.descriptor == descriptor)
        {
            return Ok(false);
        }

        let decision = negotiate(&descriptor, &self.accepted);
        let geometry = frame
            .geometry()
            .ok_or_else(|| Error::device("surface interop needs a video frame"))?;
        let (device, pool) = match decision {
            InteropDecision::Adopt => (frame.surface().map(|s| Arc::clone(s.device())), None),
            InteropDecision::Derive => {
                let source = frame
                    .surface()
                    .ok_or_else(|| Error::device("derive needs a hardware surface"))?;
                let device = self.backend.derive_device(source.device())?;
                let pool = self.backend.create_frame_pool(&device, geometry)?;
                (Some(device), Some(pool))
            }
            InteropDecision::Transfer if self.backend.kind().is_hardware() => {
                let device = self.backend.create_device()?;
                let pool = self.backend.create_frame_pool(&device, geometry)?;
                (Some(device), Some(pool))
            }
            InteropDecision::Transfer => (None, None),
        };

        match &self.plan {
            Some(previous) => log::info!(
                "surface interop renegotiated: {:?}/{:?} -> {:?}/{:?}, {}",
                previous.descriptor.surface,
                previous.descriptor.geometry,
                descriptor.surface,
                descriptor.geometry,
                decision
            ),
            None => log::info!(
                "surface interop: {:?} on {} into {}: {}",
                descriptor.surface,
                descriptor.backend,
                self.accepted.backend,
                decision
            ),
        }
        self.plan = Some(InteropPlan {
            descriptor,
            decision,
            device,
            pool,
        });
        Ok(true)
    }

    /// Applies the current plan to `frame`. Call [`prepare`](Self::prepare)
    /// first.
    pub fn convert(&self, frame: DecodedFrame) -> Result<Converted> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| Error::device("surface interop used before negotiation"))?;
        match plan.decision {
            InteropDecision::Adopt => Ok(Converted {
                frame,
                copied: false,
            }),
            InteropDecision::Derive => {
                let (pool, source) = match (&plan.pool, frame.surface()) {
                    (Some(pool), Some(source)) => (pool, source),
                    _ => return Err(Error::device("derived plan without pool or surface")),
                };
                let planes = match frame.storage() {
                    FrameStorage::Hardware { planes, .. } => planes.clone(),
                    FrameStorage::Host { .. } => None,
                };
                let mapped = frame.with_storage(FrameStorage::Hardware {
                    surface: pool.map(source),
                    planes,
                });
                Ok(Converted {
                    frame: mapped,
                    copied: false,
                })
            }
            InteropDecision::Transfer => {
                let target = match &plan.pool {
                    Some(pool) => TransferTarget::Pool(Arc::clone(pool)),
                    None => TransferTarget::Host,
                };
                let frame = self.backend.transfer(&frame, &target)?;
                Ok(Converted {
                    frame,
                    copied: true,
                })
            }
        }
    }
}
