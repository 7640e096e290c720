//! Synthetic demux source producing one raw video stream of moving bars.

use bytes::{Bytes, BytesMut};

use crate::{
    input::ContainerSource,
    packet::CompressedPacket,
    rational::Rational,
    raw::RAW_VIDEO,
    stream::{PixelFormat, StreamKind, StreamParameters},
};

pub struct TestSource {
    params: StreamParameters,
    frames: Option<u64>,
    next: u64,
}

impl TestSource {
    /// `frames: None` produces frames until the pipeline is stopped.
    pub fn new(
        width: u32,
        height: u32,
        frame_rate: u32,
        frames: Option<u64>,
        pixel_format: PixelFormat,
    ) -> Self {
        let rate = frame_rate.max(1) as i32;
        let params = StreamParameters::video(0, RAW_VIDEO, width, height, Rational::new(1, rate))
            .with_pixel_format(pixel_format)
            .with_frame_rate(Rational::new(rate, 1));
        Self {
            params,
            frames,
            next: 0,
        }
    }

    fn render(&self, n: u64) -> Bytes {
        let width = self.params.width as usize;
        let format = self.params.pixel_format.unwrap_or(PixelFormat::Yuv420p);
        let sizes = format.plane_sizes(self.params.width, self.params.height);
        let mut buf = BytesMut::with_capacity(sizes.iter().sum());
        let shift = (n as usize).wrapping_mul(4);
        for (plane, size) in sizes.iter().enumerate() {
            if plane == 0 {
                let stride = size / self.params.height.max(1) as usize;
                buf.extend((0..*size).map(|i| {
                    let x = if stride > 0 { i % stride } else { i };
                    let bar = (x * 8 / width.max(1) + shift / 16) % 8;
                    (bar * 32 + 16) as u8
                }));
            } else {
                let value = (128 + (n % 64) as usize) as u8;
                buf.extend_from_slice(&vec![value; *size]);
            }
        }
        buf.freeze()
    }
}

impl ContainerSource for TestSource {
    fn streams(&self) -> Vec<StreamParameters> {
        vec![self.params.clone()]
    }

    fn read_packet(&mut self) -> anyhow::Result<Option<CompressedPacket>> {
        if self.frames.is_some_and(|limit| self.next >= limit) {
            return Ok(None);
        }
        let n = self.next;
        self.next += 1;
        let packet = CompressedPacket::new(0, StreamKind::Video, self.render(n), self.params.time_base)
            .with_pts(Some(n as i64))
            .with_dts(Some(n as i64))
            .with_duration(1)
            .with_key(true);
        Ok(Some(packet))
    }
}
