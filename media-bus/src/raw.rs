//! Built-in Codec Engine for uncompressed video: a packet's payload is the
//! frame's planes laid end to end.

use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};

use crate::{
    codec::{
        CODE_INVALID_DATA, CODE_UNSUPPORTED, CodecEngine, CodecParameters, ContextHandle,
        FatalCode, Retrieve, Submit,
    },
    device::DeviceContext,
    frame::DecodedFrame,
    packet::CompressedPacket,
    rational::Rational,
    stream::{PixelFormat, StreamKind},
};

pub const RAW_VIDEO: &str = "rawvideo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl Layout {
    fn from_params(params: &CodecParameters) -> Result<Self, FatalCode> {
        let stream = &params.stream;
        if stream.codec != RAW_VIDEO {
            log::error!("raw video engine cannot handle codec {}", stream.codec);
            return Err(CODE_UNSUPPORTED);
        }
        match stream.pixel_format {
            Some(format) if stream.width > 0 && stream.height > 0 => Ok(Self {
                format,
                width: stream.width,
                height: stream.height,
            }),
            _ => {
                log::error!(
                    "raw video needs a pixel format and a size, got {:?} {}x{}",
                    stream.pixel_format,
                    stream.width,
                    stream.height
                );
                Err(CODE_INVALID_DATA)
            }
        }
    }
}

/// Works as a decode engine (packet to host frame, no copy: planes are
/// slices of the payload) and as an encode engine (host frame to packet).
#[derive(Debug, Default)]
pub struct RawVideoEngine {
    layout: Option<Layout>,
    time_base: Option<Rational>,
    index: usize,
    opened: u64,
    frames: VecDeque<DecodedFrame>,
    packets: VecDeque<CompressedPacket>,
}

impl RawVideoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&mut self, params: &CodecParameters) -> Result<ContextHandle, FatalCode> {
        let layout = Layout::from_params(params)?;
        self.layout = Some(layout);
        self.time_base = Some(params.stream.time_base);
        self.index = params.stream.index;
        self.frames.clear();
        self.packets.clear();
        self.opened += 1;
        Ok(ContextHandle(self.opened))
    }

    fn close(&mut self) {
        self.layout = None;
        self.frames.clear();
        self.packets.clear();
    }
}

impl CodecEngine<CompressedPacket, DecodedFrame> for RawVideoEngine {
    fn open_context(
        &mut self,
        params: &CodecParameters,
        _device: Option<&Arc<DeviceContext>>,
    ) -> Result<ContextHandle, FatalCode> {
        self.open(params)
    }

    fn submit(&mut self, packet: CompressedPacket) -> Submit {
        let Some(layout) = self.layout else {
            return Submit::Fatal(CODE_UNSUPPORTED);
        };
        let data = packet.data();
        let sizes = layout.format.plane_sizes(layout.width, layout.height);
        let expected: usize = sizes.iter().sum();
        if data.len() != expected {
            log::error!(
                "raw video packet of {} bytes, expected {} for {:?} {}x{}",
                data.len(),
                expected,
                layout.format,
                layout.width,
                layout.height
            );
            return Submit::Fatal(CODE_INVALID_DATA);
        }
        let mut offset = 0;
        let planes = sizes
            .iter()
            .map(|size| {
                let plane = data.slice(offset..offset + size);
                offset += size;
                plane
            })
            .collect();
        let frame = DecodedFrame::video(layout.format, layout.width, layout.height, planes)
            .with_pts(packet.pts())
            .with_duration(packet.duration())
            .with_key(true);
        self.frames.push_back(frame);
        Submit::Accepted
    }

    fn flush(&mut self) -> Submit {
        Submit::Accepted
    }

    fn retrieve(&mut self) -> Retrieve<DecodedFrame> {
        match self.frames.pop_front() {
            Some(frame) => Retrieve::Unit(frame),
            None => Retrieve::NoneAvailable,
        }
    }

    fn close_context(&mut self, _handle: ContextHandle) {
        self.close();
    }
}

impl CodecEngine<DecodedFrame, CompressedPacket> for RawVideoEngine {
    fn open_context(
        &mut self,
        params: &CodecParameters,
        _device: Option<&Arc<DeviceContext>>,
    ) -> Result<ContextHandle, FatalCode> {
        self.open(params)
    }

    fn submit(&mut self, frame: DecodedFrame) -> Submit {
        let (Some(layout), Some(time_base)) = (self.layout, self.time_base) else {
            return Submit::Fatal(CODE_UNSUPPORTED);
        };
        let matches = frame.pixel_format() == Some(layout.format)
            && frame.width() == layout.width
            && frame.height() == layout.height;
        if !matches {
            log::error!(
                "raw video encoder opened for {:?} {}x{}, got {:?} {}x{}",
                layout.format,
                layout.width,
                layout.height,
                frame.pixel_format(),
                frame.width(),
                frame.height()
            );
            return Submit::Fatal(CODE_INVALID_DATA);
        }
        let Some(planes) = frame.planes() else {
            log::error!("raw video encoder needs host-mapped planes");
            return Submit::Fatal(CODE_UNSUPPORTED);
        };
        let payload = match planes {
            [single] => single.clone(),
            planes => {
                let mut buf = BytesMut::with_capacity(planes.iter().map(Bytes::len).sum());
                for plane in planes {
                    buf.extend_from_slice(plane);
                }
                buf.freeze()
            }
        };
        let packet = CompressedPacket::new(self.index, StreamKind::Video, payload, time_base)
            .with_pts(frame.pts())
            .with_dts(frame.pts())
            .with_duration(frame.duration())
            .with_key(true);
        self.packets.push_back(packet);
        Submit::Accepted
    }

    fn flush(&mut self) -> Submit {
        Submit::Accepted
    }

    fn retrieve(&mut self) -> Retrieve<CompressedPacket> {
        match self.packets.pop_front() {
            Some(packet) => Retrieve::Unit(packet),
            None => Retrieve::NoneAvailable,
        }
    }

    fn close_context(&mut self, _handle: ContextHandle) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::BackendKind, stream::StreamParameters};

    fn params(format: PixelFormat) -> CodecParameters {
        let stream = StreamParameters::video(0, RAW_VIDEO, 4, 2, Rational::new(1, 25))
            .with_pixel_format(format);
        CodecParameters::new(stream, BackendKind::Software)
    }

    fn decode(engine: &mut RawVideoEngine, packet: CompressedPacket) -> Submit {
        CodecEngine::<CompressedPacket, DecodedFrame>::submit(engine, packet)
    }

    #[test]
    fn test_packet_to_frame_shares_payload() {
        let mut engine = RawVideoEngine::new();
        let p = params(PixelFormat::Yuv420p);
        assert!(CodecEngine::<CompressedPacket, DecodedFrame>::open_context(&mut engine, &p, None).is_ok());

        let payload = Bytes::from((0u8..12).collect::<Vec<_>>());
        let packet = CompressedPacket::new(0, StreamKind::Video, payload, Rational::new(1, 25))
            .with_pts(Some(3))
            .with_duration(1);
        assert_eq!(decode(&mut engine, packet), Submit::Accepted);

        let Retrieve::Unit(frame) = CodecEngine::<CompressedPacket, DecodedFrame>::retrieve(&mut engine) else {
            panic!("expected a frame");
        };
        assert_eq!(frame.pts(), Some(3));
        let planes = frame.planes().expect("host planes");
        assert_eq!(planes.len(), 3);
        assert_eq!(&planes[0][..], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&planes[2][..], &[10, 11]);
    }

    #[test]
    fn test_wrong_size_is_fatal() {
        let mut engine = RawVideoEngine::new();
        let p = params(PixelFormat::Nv12);
        assert!(CodecEngine::<CompressedPacket, DecodedFrame>::open_context(&mut engine, &p, None).is_ok());
        let packet = CompressedPacket::new(
            0,
            StreamKind::Video,
            Bytes::from_static(b"short"),
            Rational::new(1, 25),
        );
        assert_eq!(decode(&mut engine, packet), Submit::Fatal(CODE_INVALID_DATA));
    }

    #[test]
    fn test_frame_to_packet() {
        let mut engine = RawVideoEngine::new();
        let p = params(PixelFormat::Nv12);
        assert!(CodecEngine::<DecodedFrame, CompressedPacket>::open_context(&mut engine, &p, None).is_ok());

        let frame = DecodedFrame::video(
            PixelFormat::Nv12,
            4,
            2,
            vec![Bytes::from_static(&[1; 8]), Bytes::from_static(&[2; 4])],
        )
        .with_pts(Some(7));
        assert_eq!(
            CodecEngine::<DecodedFrame, CompressedPacket>::submit(&mut engine, frame),
            Submit::Accepted
        );
        let Retrieve::Unit(packet) = CodecEngine::<DecodedFrame, CompressedPacket>::retrieve(&mut engine) else {
            panic!("expected a packet");
        };
        assert_eq!(packet.size(), 12);
        assert_eq!(packet.pts(), Some(7));
        assert_eq!(packet.time_base(), Rational::new(1, 25));

        let other = DecodedFrame::video(PixelFormat::Nv12, 8, 2, Vec::new());
        assert_eq!(
            CodecEngine::<DecodedFrame, CompressedPacket>::submit(&mut engine, other),
            Submit::Fatal(CODE_INVALID_DATA)
        );
    }

    #[test]
    fn test_rejects_other_codecs() {
        let mut engine = RawVideoEngine::new();
        let mut p = params(PixelFormat::Nv12);
        p.stream.codec = "h264".to_string();
        assert_eq!(
            CodecEngine::<CompressedPacket, DecodedFrame>::open_context(&mut engine, &p, None),
            Err(CODE_UNSUPPORTED)
        );
    }
}
