use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use futures::StreamExt;
use parking_lot::Mutex;

use super::*;
use crate::{
    queue::QueueMode,
    testing::{RecordingConsumer, wait_until},
};

fn video_pad<T: Clone>(name: &str) -> Arc<OutputPad<T>> {
    OutputPad::new(
        name,
        PadMetadata::new(StreamKind::Video).with_pixel_formats(&[PixelFormat::Nv12]),
    )
}

fn input_for<T: Send + 'static>(
    name: &str,
    consumer: Arc<dyn Consumer<T>>,
) -> InputPad<T> {
    InputPad::new(name, PadMetadata::new(StreamKind::Video), consumer)
}

#[test]
fn test_fan_out_exactly_once_and_independent() -> anyhow::Result<()> {
    let pad = video_pad::<Vec<u32>>("out");

    // The first consumer scribbles on its copy.
    let scribbled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&scribbled);
    let first = Arc::new(FnConsumer::new(move |mut unit: Vec<u32>| {
        unit.push(99);
        sink.lock().push(unit);
    }));
    let second = RecordingConsumer::<Vec<u32>>::new();

    pad.link(&input_for::<Vec<u32>>("first", first))?;
    pad.link(&input_for("second", second.clone()))?;

    assert_eq!(pad.produce(vec![1, 2, 3]), 2);

    assert_eq!(*scribbled.lock(), vec![vec![1, 2, 3, 99]]);
    assert_eq!(second.units(), vec![vec![1, 2, 3]]);
    assert_eq!(second.len(), 1);
    Ok(())
}

#[test]
fn test_order_preserved_per_subscription() -> anyhow::Result<()> {
    let pad = video_pad::<u32>("out");
    let a = RecordingConsumer::<u32>::new();
    let b = RecordingConsumer::<u32>::new();
    pad.link(&input_for("a", a.clone()))?;
    pad.link(&input_for("b", b.clone()))?;

    let producer = {
        let pad = Arc::clone(&pad);
        thread::spawn(move || {
            for i in 0..200 {
                pad.produce(i);
            }
        })
    };
    producer.join().unwrap();

    let expected: Vec<u32> = (0..200).collect();
    assert_eq!(a.units(), expected);
    assert_eq!(b.units(), expected);
    Ok(())
}

#[test]
fn test_late_link_replays_lifecycle() -> anyhow::Result<()> {
    let pad = video_pad::<u32>("out");
    let early = RecordingConsumer::<u32>::new();
    pad.link(&input_for("early", early.clone()))?;
    pad.set_phase(ProducerPhase::Open);
    pad.set_phase(ProducerPhase::Running);
    pad.produce(1);

    let late = RecordingConsumer::<u32>::new();
    pad.link(&input_for("late", late.clone()))?;
    assert_eq!(late.notifications(), vec!["init", "start"]);
    pad.produce(2);

    assert_eq!(early.notifications(), vec!["init", "start", "data"]);
    assert_eq!(late.notifications(), vec!["init", "start", "data"]);
    assert_eq!(early.units(), vec![1, 2]);
    assert_eq!(late.units(), vec![2]);
    Ok(())
}

#[test]
fn test_link_while_open_gets_init_only() -> anyhow::Result<()> {
    let pad = video_pad::<u32>("out");
    pad.set_phase(ProducerPhase::Open);
    let consumer = RecordingConsumer::<u32>::new();
    pad.link(&input_for("c", consumer.clone()))?;
    assert_eq!(consumer.notifications(), vec!["init"]);

    pad.set_phase(ProducerPhase::Running);
    assert_eq!(consumer.notifications(), vec!["init", "start"]);
    Ok(())
}

#[test]
fn test_format_update_notifies() -> anyhow::Result<()> {
    let pad = video_pad::<u32>("out");
    let consumer = RecordingConsumer::<u32>::new();
    pad.link(&input_for("c", consumer.clone()))?;
    pad.update_metadata(
        PadMetadata::new(StreamKind::Video).with_pixel_formats(&[PixelFormat::Yuv420p]),
    );
    assert_eq!(consumer.notifications(), vec!["format"]);
    assert_eq!(pad.metadata().pixel_formats, vec![PixelFormat::Yuv420p]);
    Ok(())
}

#[test]
fn test_incompatible_pads_rejected() {
    let pad: Arc<OutputPad<u32>> = OutputPad::new(
        "decoder.video",
        PadMetadata::new(StreamKind::Video)
            .with_pixel_formats(&[PixelFormat::Nv12])
            .with_hardware(true),
    );

    let audio = InputPad::<u32>::new(
        "mixer",
        PadMetadata::new(StreamKind::Audio),
        RecordingConsumer::<u32>::new(),
    );
    let err = pad.link(&audio).unwrap_err();
    assert!(matches!(err, Error::IncompatiblePads { .. }));

    let host_only = InputPad::<u32>::new(
        "render",
        PadMetadata::new(StreamKind::Video),
        RecordingConsumer::<u32>::new(),
    );
    assert!(pad.link(&host_only).is_err());

    let wrong_format = InputPad::<u32>::new(
        "rgb",
        PadMetadata::new(StreamKind::Video)
            .with_pixel_formats(&[PixelFormat::Rgb24])
            .with_hardware(true),
        RecordingConsumer::<u32>::new(),
    );
    assert!(pad.link(&wrong_format).is_err());

    let ok = InputPad::<u32>::new(
        "encoder",
        PadMetadata::new(StreamKind::Video).with_hardware(true),
        RecordingConsumer::<u32>::new(),
    );
    assert!(pad.link(&ok).is_ok());
    assert!(pad.link(&ok).is_err());
    assert_eq!(pad.subscriber_count(), 1);
}

#[test]
fn test_unlink_drains_in_flight_delivery() -> anyhow::Result<()> {
    let pad = video_pad::<u32>("out");
    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let consumer = {
        let entered = Arc::clone(&entered);
        let finished = Arc::clone(&finished);
        Arc::new(FnConsumer::new(move |_unit: u32| {
            entered.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(80));
            finished.store(true, Ordering::SeqCst);
        }))
    };
    let id = pad.link(&input_for("slow", consumer))?;

    let producer = {
        let pad = Arc::clone(&pad);
        thread::spawn(move || pad.produce(1))
    };
    assert!(wait_until(Duration::from_secs(2), || entered
        .load(Ordering::SeqCst)));
    assert!(pad.unlink(id));
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(producer.join().unwrap(), 1);

    assert!(!pad.unlink(id));
    assert_eq!(pad.produce(2), 0);
    Ok(())
}

#[test]
fn test_queue_consumer_respects_cancel() -> anyhow::Result<()> {
    let queue = Arc::new(BufferQueue::new("in", 1));
    queue.set_mode(QueueMode::Running);
    let pad = video_pad::<u32>("out");
    pad.link(&input_for("queue", Arc::new(QueueConsumer::new(Arc::clone(&queue)))))?;

    assert_eq!(pad.produce(1), 1);
    let cancel = CancellationToken::new();
    let producer = {
        let pad = Arc::clone(&pad);
        let cancel = cancel.clone();
        thread::spawn(move || pad.produce_until(2, &cancel))
    };
    thread::sleep(Duration::from_millis(30));
    cancel.cancel();
    assert_eq!(producer.join().unwrap(), 0);
    assert_eq!(queue.pop(), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_stream_consumer_feeds_async_reader() -> anyhow::Result<()> {
    let pad = video_pad::<u32>("out");
    let (consumer, mut stream) = StreamConsumer::<u32>::channel(2);
    pad.link(&input_for("stream", consumer))?;

    let producer = {
        let pad = Arc::clone(&pad);
        thread::spawn(move || {
            for i in 0..10 {
                assert_eq!(pad.produce(i), 1);
            }
        })
    };

    let mut received = Vec::new();
    while received.len() < 10 {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await? {
            Some(v) => received.push(v),
            None => break,
        }
    }
    producer.join().unwrap();
    assert_eq!(received, (0..10).collect::<Vec<_>>());
    Ok(())
}
