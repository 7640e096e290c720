//! Test doubles shared by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{CodecEngine, CodecParameters, ContextHandle, FatalCode, Retrieve, Submit},
    device::{
        BackendKind, DeviceContext, FrameGeometry, FramePool, HwBackend, TransferTarget,
    },
    error::Result,
    frame::{DecodedFrame, FrameStorage},
    packet::CompressedPacket,
    pad::{Consumer, PadMetadata},
    queue::Delivery,
    rational::Rational,
    stream::{PixelFormat, StreamKind},
};

pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Records everything it is handed.
pub struct RecordingConsumer<T> {
    units: Mutex<Vec<T>>,
    notifications: Mutex<Vec<String>>,
}

impl<T> RecordingConsumer<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            units: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().clone()
    }
}

impl<T: Clone> RecordingConsumer<T> {
    pub fn units(&self) -> Vec<T> {
        self.units.lock().clone()
    }
}

impl<T: Send> Consumer<T> for RecordingConsumer<T> {
    fn on_init(&self, _meta: &PadMetadata) {
        self.notifications.lock().push("init".to_string());
    }

    fn on_start(&self, _meta: &PadMetadata) {
        self.notifications.lock().push("start".to_string());
    }

    fn on_format(&self, _meta: &PadMetadata) {
        self.notifications.lock().push("format".to_string());
    }

    fn consume(&self, unit: T, _cancel: &CancellationToken) -> Delivery {
        let mut units = self.units.lock();
        if units.is_empty() {
            self.notifications.lock().push("data".to_string());
        }
        units.push(unit);
        Delivery::Accepted
    }
}

/// `HwBackend` that counts every operation. Transfers go through
/// [`CountingBackend::copies`].
pub struct CountingBackend {
    kind: BackendKind,
    pub devices_created: AtomicUsize,
    pub devices_derived: AtomicUsize,
    pub pools_created: AtomicUsize,
    pub copies: AtomicUsize,
}

impl CountingBackend {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            devices_created: AtomicUsize::new(0),
            devices_derived: AtomicUsize::new(0),
            pools_created: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
        })
    }

    pub fn created(&self) -> usize {
        self.devices_created.load(Ordering::SeqCst)
    }

    pub fn derived(&self) -> usize {
        self.devices_derived.load(Ordering::SeqCst)
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }
}

impl HwBackend for CountingBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create_device(&self) -> Result<Arc<DeviceContext>> {
        self.devices_created.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which a second creation could sneak in.
        std::thread::sleep(Duration::from_millis(5));
        Ok(DeviceContext::new(self.kind))
    }

    fn derive_device(&self, source: &Arc<DeviceContext>) -> Result<Arc<DeviceContext>> {
        self.devices_derived.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceContext::derived(source, self.kind))
    }

    fn create_frame_pool(
        &self,
        device: &Arc<DeviceContext>,
        geometry: FrameGeometry,
    ) -> Result<Arc<FramePool>> {
        self.pools_created.fetch_add(1, Ordering::SeqCst);
        Ok(FramePool::new(device, geometry, device.backend().native_surface()))
    }

    fn transfer(&self, frame: &DecodedFrame, target: &TransferTarget) -> Result<DecodedFrame> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        let planes = frame
            .planes()
            .map(|p| p.to_vec())
            .unwrap_or_else(|| blank_planes(frame));
        Ok(match target {
            TransferTarget::Host => frame.with_storage(FrameStorage::Host { planes }),
            TransferTarget::Pool(pool) => frame.with_storage(FrameStorage::Hardware {
                surface: pool.alloc(),
                planes: Some(planes),
            }),
        })
    }
}

fn blank_planes(frame: &DecodedFrame) -> Vec<Bytes> {
    match frame.pixel_format() {
        Some(format) => format
            .plane_sizes(frame.width(), frame.height())
            .into_iter()
            .map(|size| Bytes::from(vec![0u8; size]))
            .collect(),
        None => Vec::new(),
    }
}

#[derive(Debug, Default)]
pub struct EngineLog {
    pub opened: Vec<CodecParameters>,
    pub opened_on: Vec<Option<BackendKind>>,
    pub submitted_pts: Vec<Option<i64>>,
    pub flushed: usize,
    pub closed: usize,
}

/// Decode engine double: every packet yields `frames_per_packet` frames of
/// the configured geometry, optionally on a hardware surface of the device
/// it was opened with.
pub struct ScriptedDecoder {
    log: Arc<Mutex<EngineLog>>,
    geometry: FrameGeometry,
    frames_per_packet: usize,
    hardware: bool,
    fail_on_submit: Option<usize>,
    pool: Option<Arc<FramePool>>,
    pending: VecDeque<DecodedFrame>,
    submitted: usize,
}

impl ScriptedDecoder {
    pub fn new(geometry: FrameGeometry) -> (Self, Arc<Mutex<EngineLog>>) {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        (
            Self {
                log: Arc::clone(&log),
                geometry,
                frames_per_packet: 1,
                hardware: false,
                fail_on_submit: None,
                pool: None,
                pending: VecDeque::new(),
                submitted: 0,
            },
            log,
        )
    }

    pub fn frames_per_packet(mut self, n: usize) -> Self {
        self.frames_per_packet = n;
        self
    }

    pub fn hardware(mut self, hardware: bool) -> Self {
        self.hardware = hardware;
        self
    }

    /// Submit number `n` (zero based) fails with code -22.
    pub fn fail_on_submit(mut self, n: usize) -> Self {
        self.fail_on_submit = Some(n);
        self
    }

    fn frame(&self, pts: Option<i64>) -> DecodedFrame {
        let g = self.geometry;
        let frame = match &self.pool {
            Some(pool) => DecodedFrame::hardware(g.format, g.width, g.height, pool.alloc()),
            None => {
                let planes = g
                    .format
                    .plane_sizes(g.width, g.height)
                    .into_iter()
                    .map(|size| Bytes::from(vec![0x10u8; size]))
                    .collect();
                DecodedFrame::video(g.format, g.width, g.height, planes)
            }
        };
        frame.with_pts(pts)
    }
}

impl CodecEngine<CompressedPacket, DecodedFrame> for ScriptedDecoder {
    fn open_context(
        &mut self,
        params: &CodecParameters,
        device: Option<&Arc<DeviceContext>>,
    ) -> std::result::Result<ContextHandle, FatalCode> {
        let mut log = self.log.lock();
        log.opened.push(params.clone());
        log.opened_on.push(device.map(|d| d.backend()));
        if self.hardware {
            if let Some(device) = device {
                self.pool = Some(FramePool::new(
                    device,
                    self.geometry,
                    device.backend().native_surface(),
                ));
            }
        }
        Ok(ContextHandle(log.opened.len() as u64))
    }

    fn submit(&mut self, unit: CompressedPacket) -> Submit {
        let n = self.submitted;
        self.submitted += 1;
        self.log.lock().submitted_pts.push(unit.pts());
        if self.fail_on_submit == Some(n) {
            return Submit::Fatal(-22);
        }
        for i in 0..self.frames_per_packet {
            let pts = unit.pts().map(|p| p + i as i64);
            let frame = self.frame(pts);
            self.pending.push_back(frame);
        }
        if self.frames_per_packet == 0 {
            Submit::NeedMoreInput
        } else {
            Submit::Accepted
        }
    }

    fn flush(&mut self) -> Submit {
        self.log.lock().flushed += 1;
        Submit::Accepted
    }

    fn retrieve(&mut self) -> Retrieve<DecodedFrame> {
        match self.pending.pop_front() {
            Some(frame) => Retrieve::Unit(frame),
            None => Retrieve::NoneAvailable,
        }
    }

    fn close_context(&mut self, _handle: ContextHandle) {
        self.log.lock().closed += 1;
        self.pool = None;
    }
}

/// Encode engine double: one packet per frame, payload is the frame's
/// surface id (hardware) or its first plane (host).
pub struct ScriptedEncoder {
    log: Arc<Mutex<EngineLog>>,
    time_base: Rational,
    pending: VecDeque<CompressedPacket>,
    pub frames: Arc<Mutex<Vec<DecodedFrame>>>,
}

impl ScriptedEncoder {
    pub fn new() -> (Self, Arc<Mutex<EngineLog>>, Arc<Mutex<Vec<DecodedFrame>>>) {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                log: Arc::clone(&log),
                time_base: Rational::MICROSECONDS,
                pending: VecDeque::new(),
                frames: Arc::clone(&frames),
            },
            log,
            frames,
        )
    }
}

impl CodecEngine<DecodedFrame, CompressedPacket> for ScriptedEncoder {
    fn open_context(
        &mut self,
        params: &CodecParameters,
        device: Option<&Arc<DeviceContext>>,
    ) -> std::result::Result<ContextHandle, FatalCode> {
        let mut log = self.log.lock();
        log.opened.push(params.clone());
        log.opened_on.push(device.map(|d| d.backend()));
        self.time_base = params.stream.time_base;
        Ok(ContextHandle(log.opened.len() as u64))
    }

    fn submit(&mut self, frame: DecodedFrame) -> Submit {
        self.log.lock().submitted_pts.push(frame.pts());
        let payload = match frame.surface() {
            Some(surface) => Bytes::from(surface.surface_id().to_le_bytes().to_vec()),
            None => frame.planes().and_then(|p| p.first().cloned()).unwrap_or_default(),
        };
        let packet = CompressedPacket::new(0, StreamKind::Video, payload, self.time_base)
            .with_pts(frame.pts())
            .with_dts(frame.pts())
            .with_duration(frame.duration())
            .with_key(frame.is_key());
        self.frames.lock().push(frame);
        self.pending.push_back(packet);
        Submit::Accepted
    }

    fn flush(&mut self) -> Submit {
        self.log.lock().flushed += 1;
        Submit::Accepted
    }

    fn retrieve(&mut self) -> Retrieve<CompressedPacket> {
        match self.pending.pop_front() {
            Some(packet) => Retrieve::Unit(packet),
            None => Retrieve::NoneAvailable,
        }
    }

    fn close_context(&mut self, _handle: ContextHandle) {
        self.log.lock().closed += 1;
    }
}

pub fn nv12_geometry(width: u32, height: u32) -> FrameGeometry {
    FrameGeometry {
        format: PixelFormat::Nv12,
        width,
        height,
    }
}

/// Host-resident NV12 frame filled with `fill`.
pub fn host_frame(width: u32, height: u32, fill: u8) -> DecodedFrame {
    let planes = PixelFormat::Nv12
        .plane_sizes(width, height)
        .into_iter()
        .map(|size| Bytes::from(vec![fill; size]))
        .collect();
    DecodedFrame::video(PixelFormat::Nv12, width, height, planes)
}

/// Hardware-resident frame on a fresh pool of `device`.
pub fn surface_frame(device: &Arc<DeviceContext>, width: u32, height: u32) -> DecodedFrame {
    let pool = FramePool::new(
        device,
        nv12_geometry(width, height),
        device.backend().native_surface(),
    );
    DecodedFrame::hardware(PixelFormat::Nv12, width, height, pool.alloc())
}
