//! FFmpeg-backed collaborators: container demux/mux and video codec engines.
//!
//! Engines work on host memory. Hardware codecs found through [`crate::hw`]
//! are used when the configured backend names one, with a software fallback
//! when the hardware codec is missing or fails to open.

use std::{collections::VecDeque, path::Path, sync::Arc};

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use ffmpeg_next::{
    Dictionary, Packet, codec, ffi,
    format::{self, Pixel},
    frame, media,
    util::error::EAGAIN,
};

use crate::{
    codec::{CODE_INVALID_DATA, CODE_UNSUPPORTED, CodecEngine, CodecParameters, ContextHandle, FatalCode, Retrieve, Submit},
    config::EncodeConfig,
    device::DeviceContext,
    frame::DecodedFrame,
    hw,
    packet::CompressedPacket,
    rational::Rational,
    scaler::Scaler,
    stream::{PixelFormat, StreamKind, StreamParameters},
};

fn to_ff_rational(r: Rational) -> ffmpeg_next::Rational {
    ffmpeg_next::Rational::new(r.num, r.den)
}

fn from_ff_rational(r: ffmpeg_next::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn fatal(err: ffmpeg_next::Error) -> FatalCode {
    i32::from(err)
}

fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == EAGAIN)
}

/// Copies `extradata` into codec-owned memory; the context frees it.
unsafe fn set_extradata(
    extradata: &mut *mut u8,
    extradata_size: &mut i32,
    data: &[u8],
) -> anyhow::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let padding = ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
    let buf = unsafe { ffi::av_mallocz(data.len() + padding) } as *mut u8;
    if buf.is_null() {
        anyhow::bail!("out of memory for {} bytes of extradata", data.len());
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len()) };
    *extradata = buf;
    *extradata_size = data.len() as i32;
    Ok(())
}

fn plane_rows(format: PixelFormat, plane: usize, height: u32) -> usize {
    match (format, plane) {
        (_, 0) => height as usize,
        _ => height.div_ceil(2) as usize,
    }
}

/// Packs the planes of an FFmpeg frame tightly, dropping line padding.
fn host_frame(video: &frame::Video, format: PixelFormat) -> DecodedFrame {
    let (width, height) = (video.width(), video.height());
    let planes = format
        .plane_sizes(width, height)
        .iter()
        .enumerate()
        .map(|(i, size)| {
            let rows = plane_rows(format, i, height).max(1);
            let row = size / rows;
            let stride = video.stride(i);
            let data = video.data(i);
            let mut buf = BytesMut::with_capacity(*size);
            for r in 0..rows {
                let start = r * stride;
                buf.extend_from_slice(&data[start..start + row]);
            }
            buf.freeze()
        })
        .collect();
    DecodedFrame::video(format, width, height, planes)
}

/// Inverse of [`host_frame`].
fn ffmpeg_frame(frame: &DecodedFrame, planes: &[Bytes]) -> Option<frame::Video> {
    let format = frame.pixel_format()?;
    let (width, height) = (frame.width(), frame.height());
    let mut video = frame::Video::new(hw::to_ffmpeg_pixel(format), width, height);
    for (i, plane) in planes.iter().enumerate() {
        let rows = plane_rows(format, i, height).max(1);
        let row = plane.len() / rows;
        let stride = video.stride(i);
        let data = video.data_mut(i);
        for r in 0..rows {
            data[r * stride..r * stride + row].copy_from_slice(&plane[r * row..(r + 1) * row]);
        }
    }
    Some(video)
}

/// Container demuxer over `libavformat`.
pub struct FfmpegSource {
    input: format::context::Input,
    streams: Vec<StreamParameters>,
}

// Only the demux worker touches the context.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let input =
            format::input(&path).with_context(|| format!("cannot open {}", path.display()))?;
        let streams = input
            .streams()
            .filter_map(|stream| match stream_parameters(&stream) {
                Ok(params) => params,
                Err(err) => {
                    log::warn!("{}: skipping stream {}: {}", path.display(), stream.index(), err);
                    None
                }
            })
            .collect();
        Ok(Self { input, streams })
    }
}

fn stream_parameters(stream: &format::stream::Stream) -> anyhow::Result<Option<StreamParameters>> {
    let parameters = stream.parameters();
    let kind = match parameters.medium() {
        media::Type::Video => StreamKind::Video,
        media::Type::Audio => StreamKind::Audio,
        media::Type::Subtitle => StreamKind::Subtitle,
        _ => return Ok(None),
    };
    let codec = parameters.id().name().to_string();
    let (width, height, bit_rate, sample_rate, channels, extradata) = unsafe {
        let ptr = parameters.as_ptr();
        let extradata = if (*ptr).extradata.is_null() || (*ptr).extradata_size <= 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(std::slice::from_raw_parts(
                (*ptr).extradata,
                (*ptr).extradata_size as usize,
            ))
        };
        (
            (*ptr).width.max(0) as u32,
            (*ptr).height.max(0) as u32,
            (*ptr).bit_rate.max(0) as u64,
            (*ptr).sample_rate.max(0) as u32,
            (*ptr).ch_layout.nb_channels.max(0) as u32,
            extradata,
        )
    };

    let mut params = match kind {
        StreamKind::Video => {
            let decoder = codec::Context::from_parameters(parameters)?.decoder().video()?;
            let mut params = StreamParameters::video(
                stream.index(),
                &codec,
                width,
                height,
                from_ff_rational(stream.time_base()),
            );
            params.pixel_format = hw::from_ffmpeg_pixel(decoder.format());
            let rate = stream.avg_frame_rate();
            if rate.numerator() > 0 && rate.denominator() > 0 {
                params.frame_rate = Some(from_ff_rational(rate));
            }
            params
        }
        _ => {
            let mut params = StreamParameters::audio(stream.index(), &codec, sample_rate, channels);
            params.kind = kind;
            params.time_base = from_ff_rational(stream.time_base());
            params
        }
    };
    params.bit_rate = bit_rate;
    params.extradata = extradata;
    Ok(Some(params))
}

impl crate::input::ContainerSource for FfmpegSource {
    fn streams(&self) -> Vec<StreamParameters> {
        self.streams.clone()
    }

    fn read_packet(&mut self) -> anyhow::Result<Option<CompressedPacket>> {
        loop {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(err) if is_again(&err) => continue,
                Err(err) => return Err(err.into()),
            }
            let Some(stream) = self.streams.iter().find(|s| s.index == packet.stream()) else {
                continue;
            };
            let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
            return Ok(Some(
                CompressedPacket::new(stream.index, stream.kind, data, stream.time_base)
                    .with_pts(packet.pts())
                    .with_dts(packet.dts())
                    .with_duration(packet.duration())
                    .with_key(packet.is_key()),
            ));
        }
    }
}

/// Container muxer over `libavformat`. The header goes out with the first
/// packet, the trailer on `finish`.
pub struct FfmpegSink {
    output: format::context::Output,
    time_bases: Vec<Rational>,
    header_written: bool,
    trailer_written: bool,
}

// Only the mux worker touches the context.
unsafe impl Send for FfmpegSink {}

impl FfmpegSink {
    pub fn create(path: impl AsRef<Path>, format: Option<&str>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let output = match format {
            Some(format) => format::output_as(&path, format),
            None => format::output(&path),
        }
        .with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self {
            output,
            time_bases: Vec::new(),
            header_written: false,
            trailer_written: false,
        })
    }
}

impl crate::output::ContainerSink for FfmpegSink {
    fn create_stream(&mut self, params: &StreamParameters) -> anyhow::Result<usize> {
        let id = hw::codec_id(&params.codec)
            .ok_or_else(|| anyhow::anyhow!("unknown codec {}", params.codec))?;
        let mut parameters = codec::Parameters::new();
        unsafe {
            let ptr = parameters.as_mut_ptr();
            (*ptr).codec_id = id.into();
            match params.kind {
                StreamKind::Video => {
                    (*ptr).codec_type = media::Type::Video.into();
                    (*ptr).width = params.width as i32;
                    (*ptr).height = params.height as i32;
                    if let Some(format) = params.pixel_format {
                        (*ptr).format = ffi::AVPixelFormat::from(hw::to_ffmpeg_pixel(format)) as i32;
                    }
                }
                StreamKind::Audio => {
                    (*ptr).codec_type = media::Type::Audio.into();
                    (*ptr).sample_rate = params.sample_rate as i32;
                    ffi::av_channel_layout_default(&mut (*ptr).ch_layout, params.channels as i32);
                }
                StreamKind::Subtitle => (*ptr).codec_type = media::Type::Subtitle.into(),
            }
            (*ptr).bit_rate = params.bit_rate as i64;
            set_extradata(&mut (*ptr).extradata, &mut (*ptr).extradata_size, &params.extradata)?;
        }
        let mut stream = self.output.add_stream(ffmpeg_next::encoder::find(id))?;
        stream.set_parameters(parameters);
        stream.set_time_base(to_ff_rational(params.time_base));
        let index = stream.index();
        if self.time_bases.len() <= index {
            self.time_bases.resize(index + 1, params.time_base);
        }
        self.time_bases[index] = params.time_base;
        Ok(index)
    }

    fn write(&mut self, stream: usize, packet: CompressedPacket) -> anyhow::Result<()> {
        if !self.header_written {
            self.output.write_header()?;
            self.header_written = true;
        }
        let out_time_base = self
            .output
            .stream(stream)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow::anyhow!("stream {} not found", stream))?;

        let mut p = Packet::copy(&packet.data());
        p.set_pts(packet.pts());
        p.set_dts(packet.dts());
        p.set_duration(packet.duration());
        if packet.is_key() {
            p.set_flags(codec::packet::Flags::KEY);
        }
        p.set_stream(stream);
        p.set_position(-1);
        p.rescale_ts(to_ff_rational(packet.time_base()), out_time_base);
        p.write_interleaved(&mut self.output)?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.header_written && !self.trailer_written {
            self.trailer_written = true;
            self.output.write_trailer()?;
        }
        Ok(())
    }
}

/// Video decode engine over `libavcodec`.
#[derive(Default)]
pub struct FfmpegDecodeEngine {
    decoder: Option<ffmpeg_next::decoder::Video>,
    scaler: Option<Scaler>,
    pending: VecDeque<DecodedFrame>,
    opened: u64,
}

// Only the decoder worker touches the context.
unsafe impl Send for FfmpegDecodeEngine {}

impl FfmpegDecodeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&mut self, params: &CodecParameters) -> anyhow::Result<ffmpeg_next::decoder::Video> {
        let stream = &params.stream;
        let software = hw::find_decoder(&stream.codec)
            .ok_or_else(|| anyhow::anyhow!("decoder not found: {}", stream.codec))?;
        let open = |codec: ffmpeg_next::Codec| -> anyhow::Result<ffmpeg_next::decoder::Video> {
            let mut ctx = codec::Context::new_with_codec(codec);
            unsafe {
                let ptr = ctx.as_mut_ptr();
                (*ptr).width = stream.width as i32;
                (*ptr).height = stream.height as i32;
                (*ptr).time_base = to_ff_rational(stream.time_base).into();
                set_extradata(&mut (*ptr).extradata, &mut (*ptr).extradata_size, &stream.extradata)?;
            }
            Ok(ctx.decoder().open_as(codec)?.video()?)
        };

        if let Some(hw_codec) = hw::find_hw_decoder(&stream.codec, params.backend) {
            let hw_name = hw_codec.name().to_string();
            match open(hw_codec) {
                Ok(decoder) => return Ok(decoder),
                Err(err) => log::warn!(
                    "hardware decoder {} failed: {}, falling back to {}",
                    hw_name,
                    err,
                    software.name()
                ),
            }
        }
        open(software)
    }

    /// Turns a decoded FFmpeg frame into a pipeline frame, converting
    /// formats the pipeline has no name for to YUV 4:2:0.
    fn convert(&mut self, video: frame::Video) -> Result<DecodedFrame, FatalCode> {
        let pts = video.timestamp().or(video.pts());
        let key = video.is_key();
        let frame = match hw::from_ffmpeg_pixel(video.format()) {
            Some(format) => host_frame(&video, format),
            None => {
                if !self.scaler.as_ref().is_some_and(|s| s.accepts(&video)) {
                    log::info!("decoder output {:?} converted to yuv420p", video.format());
                    let scaler = Scaler::new(&video, Pixel::YUV420P, video.width(), video.height())
                        .map_err(|err| {
                            log::error!("cannot convert {:?}: {}", video.format(), err);
                            CODE_UNSUPPORTED
                        })?;
                    self.scaler = Some(scaler);
                }
                let Some(scaler) = self.scaler.as_mut() else {
                    return Err(CODE_UNSUPPORTED);
                };
                let converted = scaler.run(&video).map_err(|err| {
                    log::error!("format conversion failed: {}", err);
                    CODE_INVALID_DATA
                })?;
                host_frame(&converted, PixelFormat::Yuv420p)
            }
        };
        Ok(frame.with_pts(pts).with_duration(video.packet().duration).with_key(key))
    }

    /// Moves everything the decoder has ready onto `pending`.
    fn receive_all(&mut self) -> Result<(), FatalCode> {
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(());
            };
            let mut video = frame::Video::empty();
            match decoder.receive_frame(&mut video) {
                Ok(()) => {
                    let frame = self.convert(video)?;
                    self.pending.push_back(frame);
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(err) if is_again(&err) => return Ok(()),
                Err(err) => return Err(fatal(err)),
            }
        }
    }
}

impl CodecEngine<CompressedPacket, DecodedFrame> for FfmpegDecodeEngine {
    fn open_context(
        &mut self,
        params: &CodecParameters,
        _device: Option<&Arc<DeviceContext>>,
    ) -> Result<ContextHandle, FatalCode> {
        let decoder = self.open(params).map_err(|err| {
            log::error!("cannot open decoder for {}: {:#}", params.stream.codec, err);
            CODE_UNSUPPORTED
        })?;
        self.decoder = Some(decoder);
        self.pending.clear();
        self.opened += 1;
        Ok(ContextHandle(self.opened))
    }

    fn submit(&mut self, packet: CompressedPacket) -> Submit {
        let mut p = Packet::copy(&packet.data());
        p.set_pts(packet.pts());
        p.set_dts(packet.dts());
        p.set_duration(packet.duration());
        if packet.is_key() {
            p.set_flags(codec::packet::Flags::KEY);
        }
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Submit::Fatal(CODE_UNSUPPORTED);
            };
            match decoder.send_packet(&p) {
                Ok(()) => return Submit::Accepted,
                Err(err) if is_again(&err) => {
                    // Output is full: park it and retry.
                    if let Err(code) = self.receive_all() {
                        return Submit::Fatal(code);
                    }
                }
                Err(ffmpeg_next::Error::InvalidData) => {
                    log::warn!("corrupt packet pts={:?} skipped", packet.pts());
                    return Submit::NeedMoreInput;
                }
                Err(err) => return Submit::Fatal(fatal(err)),
            }
        }
    }

    fn flush(&mut self) -> Submit {
        let Some(decoder) = self.decoder.as_mut() else {
            return Submit::Accepted;
        };
        match decoder.send_eof() {
            Ok(()) | Err(ffmpeg_next::Error::Eof) => Submit::Accepted,
            Err(err) => Submit::Fatal(fatal(err)),
        }
    }

    fn retrieve(&mut self) -> Retrieve<DecodedFrame> {
        if self.pending.is_empty() {
            if let Err(code) = self.receive_all() {
                return Retrieve::Fatal(code);
            }
        }
        match self.pending.pop_front() {
            Some(frame) => Retrieve::Unit(frame),
            None => Retrieve::NoneAvailable,
        }
    }

    fn close_context(&mut self, _handle: ContextHandle) {
        self.decoder = None;
        self.scaler = None;
        self.pending.clear();
    }
}

struct OpenEncoder {
    encoder: ffmpeg_next::encoder::Video,
    name: String,
    time_base: Rational,
    index: usize,
}

/// Video encode engine over `libavcodec`.
pub struct FfmpegEncodeEngine {
    preset: Option<String>,
    encoder: Option<OpenEncoder>,
    scaler: Option<Scaler>,
    pending: VecDeque<CompressedPacket>,
    opened: u64,
}

// Only the encoder worker touches the context.
unsafe impl Send for FfmpegEncodeEngine {}

impl FfmpegEncodeEngine {
    pub fn new(config: &EncodeConfig) -> Self {
        Self {
            preset: config.preset.clone(),
            encoder: None,
            scaler: None,
            pending: VecDeque::new(),
            opened: 0,
        }
    }

    fn open(&self, params: &CodecParameters) -> anyhow::Result<OpenEncoder> {
        let stream = &params.stream;
        let source = stream
            .pixel_format
            .map(hw::to_ffmpeg_pixel)
            .unwrap_or(Pixel::YUV420P);

        let open = |codec: ffmpeg_next::Codec| -> anyhow::Result<OpenEncoder> {
            let name = codec.name().to_string();
            let mut encoder = codec::Context::new_with_codec(codec).encoder().video()?;
            encoder.set_width(stream.width);
            encoder.set_height(stream.height);
            encoder.set_format(hw::pixel_format_for_encoder(source, &name));
            encoder.set_frame_rate(stream.frame_rate.map(to_ff_rational));
            encoder.set_time_base(to_ff_rational(stream.time_base));
            if stream.bit_rate > 0 {
                encoder.set_bit_rate(stream.bit_rate as usize);
            }
            if let Some(gop) = params.gop {
                encoder.set_gop(gop);
            }

            let mut opts = Dictionary::new();
            opts.set("preset", self.preset.as_deref().unwrap_or("ultrafast"));
            opts.set("tune", "zerolatency");
            let encoder = encoder.open_with(opts)?;
            let time_base = unsafe { from_ff_rational((*encoder.as_ptr()).time_base.into()) };
            Ok(OpenEncoder {
                encoder,
                name,
                time_base,
                index: stream.index,
            })
        };

        if let Some(hw_codec) = hw::find_hw_encoder(&stream.codec, params.backend) {
            let hw_name = hw_codec.name().to_string();
            log::info!("attempting hardware encoder: {}", hw_name);
            match open(hw_codec) {
                Ok(encoder) => return Ok(encoder),
                Err(err) => log::warn!(
                    "hardware encoder {} failed: {}, falling back to software",
                    hw_name,
                    err
                ),
            }
        }
        let software = hw::find_encoder(&stream.codec)
            .ok_or_else(|| anyhow::anyhow!("codec not found: {}", stream.codec))?;
        open(software)
    }

    fn receive(&mut self) -> Result<Option<CompressedPacket>, FatalCode> {
        let Some(open) = self.encoder.as_mut() else {
            return Ok(None);
        };
        let mut packet = Packet::empty();
        match open.encoder.receive_packet(&mut packet) {
            Ok(()) => {
                let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
                Ok(Some(
                    CompressedPacket::new(open.index, StreamKind::Video, data, open.time_base)
                        .with_pts(packet.pts())
                        .with_dts(packet.dts())
                        .with_duration(packet.duration())
                        .with_key(packet.is_key()),
                ))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) if is_again(&err) => Ok(None),
            Err(err) => Err(fatal(err)),
        }
    }
}

impl CodecEngine<DecodedFrame, CompressedPacket> for FfmpegEncodeEngine {
    fn open_context(
        &mut self,
        params: &CodecParameters,
        _device: Option<&Arc<DeviceContext>>,
    ) -> Result<ContextHandle, FatalCode> {
        let open = self.open(params).map_err(|err| {
            log::error!("cannot open encoder for {}: {:#}", params.stream.codec, err);
            CODE_UNSUPPORTED
        })?;
        log::info!("encoder opened successfully: {}", open.name);
        self.encoder = Some(open);
        self.scaler = None;
        self.pending.clear();
        self.opened += 1;
        Ok(ContextHandle(self.opened))
    }

    fn submit(&mut self, frame: DecodedFrame) -> Submit {
        let Some(planes) = frame.planes() else {
            log::error!("ffmpeg encoder needs host-mapped planes");
            return Submit::Fatal(CODE_UNSUPPORTED);
        };
        let Some(mut video) = ffmpeg_frame(&frame, planes) else {
            return Submit::Fatal(CODE_UNSUPPORTED);
        };
        let Some(open) = self.encoder.as_mut() else {
            return Submit::Fatal(CODE_UNSUPPORTED);
        };
        let target = (open.encoder.format(), open.encoder.width(), open.encoder.height());
        if (video.format(), video.width(), video.height()) != target {
            if !self.scaler.as_ref().is_some_and(|s| s.accepts(&video) && s.output() == target) {
                match Scaler::new(&video, target.0, target.1, target.2) {
                    Ok(scaler) => self.scaler = Some(scaler),
                    Err(err) => {
                        log::error!("cannot convert frames for the encoder: {}", err);
                        return Submit::Fatal(CODE_UNSUPPORTED);
                    }
                }
            }
            if let Some(scaler) = self.scaler.as_mut() {
                match scaler.run(&video) {
                    Ok(converted) => video = converted,
                    Err(err) => {
                        log::error!("format conversion failed: {}", err);
                        return Submit::Fatal(CODE_INVALID_DATA);
                    }
                }
            }
        }
        video.set_pts(frame.pts());
        loop {
            let Some(open) = self.encoder.as_mut() else {
                return Submit::Fatal(CODE_UNSUPPORTED);
            };
            match open.encoder.send_frame(&video) {
                Ok(()) => return Submit::Accepted,
                Err(err) if is_again(&err) => loop {
                    match self.receive() {
                        Ok(Some(packet)) => self.pending.push_back(packet),
                        Ok(None) => break,
                        Err(code) => return Submit::Fatal(code),
                    }
                },
                Err(err) => return Submit::Fatal(fatal(err)),
            }
        }
    }

    fn flush(&mut self) -> Submit {
        let Some(open) = self.encoder.as_mut() else {
            return Submit::Accepted;
        };
        match open.encoder.send_eof() {
            Ok(()) | Err(ffmpeg_next::Error::Eof) => Submit::Accepted,
            Err(err) => Submit::Fatal(fatal(err)),
        }
    }

    fn retrieve(&mut self) -> Retrieve<CompressedPacket> {
        if let Some(packet) = self.pending.pop_front() {
            return Retrieve::Unit(packet);
        }
        match self.receive() {
            Ok(Some(packet)) => Retrieve::Unit(packet),
            Ok(None) => Retrieve::NoneAvailable,
            Err(code) => Retrieve::Fatal(code),
        }
    }

    fn close_context(&mut self, _handle: ContextHandle) {
        self.encoder = None;
        self.scaler = None;
        self.pending.clear();
    }
}
