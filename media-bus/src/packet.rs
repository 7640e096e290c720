use bytes::Bytes;

use crate::{rational::Rational, stream::StreamKind};

/// Unit carried on packet queues and packet pads.
#[derive(Clone, Debug)]
pub enum PacketCmd {
    Data(CompressedPacket),
    Eof,
}

/// One encoded access unit of one elementary stream.
///
/// Timestamps only mean something together with `time_base`. Cloning shares
/// the payload by reference count.
#[derive(Clone, Debug, PartialEq)]
pub struct CompressedPacket {
    stream_index: usize,
    kind: StreamKind,
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    data: Bytes,
    time_base: Rational,
    is_key: bool,
}

impl CompressedPacket {
    pub fn new(stream_index: usize, kind: StreamKind, data: Bytes, time_base: Rational) -> Self {
        Self {
            stream_index,
            kind,
            pts: None,
            dts: None,
            duration: 0,
            data,
            time_base,
            is_key: false,
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_dts(mut self, dts: Option<i64>) -> Self {
        self.dts = dts;
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

    pub fn index(&self) -> usize {
        self.stream_index
    }

    pub fn set_index(&mut self, index: usize) {
        self.stream_index = index;
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: i64) {
        self.duration = duration;
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Shared view of the payload; no copy.
    pub fn data(&self) -> Bytes {
        self.data.clone()
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Rewrites pts, dts and duration into `target`.
    pub fn rescale_ts(&mut self, target: Rational) {
        if self.time_base == target {
            return;
        }
        let source = self.time_base;
        self.pts = self.pts.map(|v| source.rescale(v, target));
        self.dts = self.dts.map(|v| source.rescale(v, target));
        self.duration = source.rescale(self.duration, target);
        self.time_base = target;
    }

    /// Copy of this packet expressed in the pipeline-wide microsecond unit.
    pub fn normalized(mut self) -> Self {
        self.rescale_ts(Rational::MICROSECONDS);
        self
    }

    pub fn pts_us(&self) -> Option<i64> {
        self.pts.map(|v| self.time_base.to_micros(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_and_back() {
        let tb = Rational::MPEG;
        let packet = CompressedPacket::new(0, StreamKind::Video, Bytes::from_static(b"abc"), tb)
            .with_pts(Some(183_003))
            .with_dts(Some(180_000))
            .with_duration(3003);
        let mut us = packet.clone().normalized();
        assert_eq!(us.time_base(), Rational::MICROSECONDS);
        assert_eq!(us.pts(), Some(2_033_367));
        assert_eq!(us.dts(), Some(2_000_000));
        assert_eq!(us.duration(), 33_367);

        us.rescale_ts(tb);
        assert!((us.pts().unwrap() - 183_003).abs() <= 1);
        assert_eq!(us.dts(), Some(180_000));
    }

    #[test]
    fn test_clone_shares_payload() {
        let packet = CompressedPacket::new(
            1,
            StreamKind::Audio,
            Bytes::from(vec![1u8; 64]),
            Rational::new(1, 48000),
        );
        let copy = packet.clone();
        assert_eq!(packet.data().as_ptr(), copy.data().as_ptr());
        assert_eq!(copy.size(), 64);
    }
}
