use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use super::*;
use crate::{
    device::{BackendKind, DeviceContext, SoftwareBackend, SurfaceKind},
    lifecycle::StageState,
    rational::Rational,
    stream::PixelFormat,
    testing::{
        CountingBackend, EngineLog, RecordingConsumer, ScriptedEncoder, host_frame, surface_frame,
        wait_until,
    },
};

const WAIT: Duration = Duration::from_secs(2);

fn upstream_params() -> StreamParameters {
    StreamParameters::video(2, "h264", 64, 32, Rational::MPEG).with_pixel_format(PixelFormat::Nv12)
}

struct Harness {
    encoder: Encoder,
    upstream: Arc<OutputPad<FrameCmd>>,
    packets: Arc<RecordingConsumer<PacketCmd>>,
    log: Arc<Mutex<EngineLog>>,
    frames: Arc<Mutex<Vec<DecodedFrame>>>,
}

fn harness(config: EncodeConfig, backend: Arc<dyn HwBackend>) -> Harness {
    let (engine, log, frames) = ScriptedEncoder::new();
    let encoder = Encoder::new("encoder", &upstream_params(), config, Box::new(engine), backend);

    let upstream = OutputPad::new(
        "decoder.out",
        PadMetadata::new(StreamKind::Video).with_hardware(true),
    );
    upstream
        .link(encoder.input())
        .expect("decoder pad links to encoder");

    let packets = RecordingConsumer::<PacketCmd>::new();
    let sink = InputPad::<PacketCmd>::new("mux.in", PadMetadata::new(StreamKind::Video), packets.clone());
    encoder.output().link(&sink).expect("mux links to encoder");

    Harness {
        encoder,
        upstream,
        packets,
        log,
        frames,
    }
}

fn start(h: &Harness) -> anyhow::Result<()> {
    h.encoder.init()?;
    h.encoder.open()?;
    h.encoder.start()?;
    Ok(())
}

fn frame_at(frame: DecodedFrame, pts_us: i64) -> FrameCmd {
    FrameCmd::Data(frame.with_pts(Some(pts_us)).with_duration(40_000))
}

fn data_packets(units: &[PacketCmd]) -> Vec<crate::packet::CompressedPacket> {
    units
        .iter()
        .filter_map(|cmd| match cmd {
            PacketCmd::Data(packet) => Some(packet.clone()),
            PacketCmd::Eof => None,
        })
        .collect()
}

#[test]
fn test_same_device_frames_are_adopted() -> anyhow::Result<()> {
    let backend = CountingBackend::new(BackendKind::Vaapi);
    let h = harness(EncodeConfig::new("h264"), backend.clone());
    start(&h)?;

    let va = DeviceContext::new(BackendKind::Vaapi);
    h.upstream.produce(frame_at(surface_frame(&va, 64, 32), 0));
    h.upstream.produce(frame_at(surface_frame(&va, 64, 32), 40_000));
    assert!(wait_until(WAIT, || h.packets.len() == 2));

    assert_eq!(backend.copies(), 0);
    assert_eq!(backend.created(), 0);
    assert_eq!(h.encoder.stats().host_copies, 0);
    // The context was opened on the decoder's own device.
    assert_eq!(h.log.lock().opened_on, vec![Some(BackendKind::Vaapi)]);
    let device = h.frames.lock()[0].surface().map(|s| s.device().id());
    assert_eq!(device, Some(va.id()));
    h.encoder.stop()?;
    Ok(())
}

#[test]
fn test_foreign_surfaces_copied_once_per_frame() -> anyhow::Result<()> {
    let backend = CountingBackend::new(BackendKind::Cuda);
    let h = harness(EncodeConfig::new("h264"), backend.clone());
    start(&h)?;

    let va = DeviceContext::new(BackendKind::Vaapi);
    for i in 0..3 {
        h.upstream
            .produce(frame_at(surface_frame(&va, 64, 32), i * 40_000));
    }
    assert!(wait_until(WAIT, || h.packets.len() == 3));

    assert_eq!(backend.copies(), 3);
    assert_eq!(backend.created(), 1);
    assert_eq!(h.encoder.stats().host_copies, 3);
    let kinds: Vec<_> = h
        .frames
        .lock()
        .iter()
        .map(|f| f.surface().map(|s| s.kind()))
        .collect();
    assert_eq!(kinds, vec![Some(SurfaceKind::CudaMemory); 3]);
    h.encoder.stop()?;
    Ok(())
}

#[test]
fn test_derived_device_maps_without_copy() -> anyhow::Result<()> {
    let backend = CountingBackend::new(BackendKind::Qsv);
    let h = harness(EncodeConfig::new("h264"), backend.clone());
    start(&h)?;

    let va = DeviceContext::new(BackendKind::Vaapi);
    h.upstream.produce(frame_at(surface_frame(&va, 64, 32), 0));
    assert!(wait_until(WAIT, || h.packets.len() == 1));

    assert_eq!(backend.copies(), 0);
    assert_eq!(backend.derived(), 1);
    let frames = h.frames.lock();
    let surface = frames[0].surface().expect("mapped surface");
    assert_eq!(surface.kind(), SurfaceKind::QsvSurface);
    assert_eq!(surface.device().root_id(), va.id());
    assert!(surface.mapped_from().is_some());
    drop(frames);
    h.encoder.stop()?;
    Ok(())
}

#[test]
fn test_timestamps_rescaled_to_encoder_time_base() -> anyhow::Result<()> {
    let config = EncodeConfig {
        time_base: Rational::MPEG,
        ..EncodeConfig::new("h264")
    };
    let h = harness(config, Arc::new(SoftwareBackend));
    start(&h)?;

    h.upstream.produce(frame_at(host_frame(64, 32, 1), 40_000));
    assert!(wait_until(WAIT, || h.packets.len() == 1));

    assert_eq!(h.log.lock().submitted_pts, vec![Some(3600)]);
    let packets = data_packets(&h.packets.units());
    assert_eq!(packets[0].pts(), Some(3600));
    assert_eq!(packets[0].time_base(), Rational::MPEG);
    assert_eq!(packets[0].pts_us(), Some(40_000));
    // The produced stream keeps the upstream index.
    assert_eq!(packets[0].index(), 2);
    assert_eq!(h.encoder.output_params().index, 2);
    h.encoder.stop()?;
    Ok(())
}

#[test]
fn test_format_change_reopens_context() -> anyhow::Result<()> {
    let h = harness(EncodeConfig::new("h264"), Arc::new(SoftwareBackend));
    start(&h)?;

    h.upstream.produce(frame_at(host_frame(64, 32, 1), 0));
    h.upstream.produce(frame_at(host_frame(64, 32, 2), 40_000));
    assert!(wait_until(WAIT, || h.packets.len() == 2));
    assert_eq!(h.log.lock().opened.len(), 1);

    h.upstream.produce(frame_at(host_frame(128, 64, 3), 80_000));
    assert!(wait_until(WAIT, || h.packets.len() == 3));

    let log = h.log.lock();
    assert_eq!(log.opened.len(), 2);
    assert_eq!(log.flushed, 1);
    assert_eq!(log.closed, 1);
    assert_eq!((log.opened[1].stream.width, log.opened[1].stream.height), (128, 64));
    drop(log);

    let params = h.encoder.output().metadata().params.expect("announced params");
    assert_eq!(params.width, 128);
    assert!(h.packets.notifications().contains(&"format".to_string()));
    h.encoder.stop()?;
    Ok(())
}

#[test]
fn test_eof_flushes_and_closes_context() -> anyhow::Result<()> {
    let h = harness(EncodeConfig::new("h264"), Arc::new(SoftwareBackend));
    start(&h)?;

    h.upstream.produce(frame_at(host_frame(64, 32, 1), 0));
    h.upstream.produce(FrameCmd::Eof);
    assert!(wait_until(WAIT, || h.packets.len() == 2));

    let units = h.packets.units();
    assert!(matches!(units[0], PacketCmd::Data(_)));
    assert!(matches!(units[1], PacketCmd::Eof));
    assert_eq!(h.log.lock().flushed, 1);
    assert_eq!(h.log.lock().closed, 1);
    h.encoder.stop()?;
    Ok(())
}

#[test]
fn test_full_queue_blocks_instead_of_dropping() -> anyhow::Result<()> {
    let config = EncodeConfig {
        queue_capacity: 2,
        ..EncodeConfig::new("h264")
    };
    let h = harness(config, Arc::new(SoftwareBackend));
    start(&h)?;
    h.encoder.pause(true)?;
    // Let a pop already in flight finish.
    std::thread::sleep(Duration::from_millis(30));

    let sent = Arc::new(AtomicUsize::new(0));
    let producer = {
        let upstream = Arc::clone(&h.upstream);
        let sent = Arc::clone(&sent);
        std::thread::spawn(move || {
            for i in 0..5 {
                upstream.produce(frame_at(host_frame(64, 32, i as u8), i * 40_000));
                sent.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(sent.load(Ordering::SeqCst) < 5);
    assert_eq!(h.packets.len(), 0);

    h.encoder.pause(false)?;
    producer.join().expect("producer thread");
    assert!(wait_until(WAIT, || h.packets.len() == 5));

    let pts: Vec<_> = data_packets(&h.packets.units())
        .iter()
        .map(|p| p.pts_us())
        .collect();
    let expected: Vec<_> = (0..5).map(|i| Some(i * 40_000)).collect();
    assert_eq!(pts, expected);
    assert_eq!(h.encoder.stats().peak_queue_depth, 2);
    h.encoder.stop()?;
    Ok(())
}

#[test]
fn test_open_validates_config() {
    let half_size = EncodeConfig {
        width: Some(320),
        ..EncodeConfig::new("h264")
    };
    let h = harness(half_size, Arc::new(SoftwareBackend));
    h.encoder.init().unwrap();
    assert!(matches!(h.encoder.open(), Err(Error::Config(_))));
    assert_eq!(h.encoder.state(), StageState::Initialized);

    let no_codec = harness(EncodeConfig::new(""), Arc::new(SoftwareBackend));
    no_codec.encoder.init().unwrap();
    assert!(matches!(no_codec.encoder.open(), Err(Error::Config(_))));
}
