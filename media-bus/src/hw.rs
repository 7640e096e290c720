//! Hardware codec discovery for the FFmpeg engines.
//!
//! FFmpeg exposes hardware codecs as separately named codecs (`h264_cuvid`,
//! `hevc_vaapi`, ...). These helpers pick the first one available in the
//! linked FFmpeg build for a backend, falling back to the software codec.

use ffmpeg_next::{codec, format::Pixel};

use crate::{device::BackendKind, stream::PixelFormat};

fn decoder_suffixes(backend: BackendKind) -> &'static [&'static str] {
    match backend {
        BackendKind::Cuda => &["cuvid"],
        BackendKind::Qsv => &["qsv"],
        BackendKind::Software => &[],
        // vaapi/d3d11va/videotoolbox decode through hwaccels on the plain
        // decoder; v4l2m2m is the only other named family.
        _ => &["v4l2m2m"],
    }
}

fn encoder_suffixes(backend: BackendKind) -> &'static [&'static str] {
    match backend {
        BackendKind::Cuda => &["nvenc"],
        BackendKind::Vaapi => &["vaapi"],
        BackendKind::Qsv => &["qsv"],
        BackendKind::VideoToolbox => &["videotoolbox"],
        BackendKind::D3d11va => &["amf", "mf"],
        BackendKind::Software => &[],
    }
}

/// Maps "h264", "libx264", "h265", ... to the family prefix hardware codecs use.
fn family(codec_name: &str) -> Option<&'static str> {
    match codec_name {
        "h264" | "libx264" => Some("h264"),
        "hevc" | "h265" | "libx265" => Some("hevc"),
        "vp8" | "libvpx" => Some("vp8"),
        "vp9" | "libvpx-vp9" => Some("vp9"),
        "av1" | "libaom-av1" | "libsvtav1" => Some("av1"),
        "mpeg2video" => Some("mpeg2"),
        "mpeg4" => Some("mpeg4"),
        _ => None,
    }
}

/// Codec id of a codec name, software or hardware.
pub fn codec_id(codec_name: &str) -> Option<codec::Id> {
    ffmpeg_next::decoder::find_by_name(codec_name)
        .or_else(|| ffmpeg_next::encoder::find_by_name(codec_name))
        .map(|c| c.id())
}

/// First named hardware decoder for `codec_name` on `backend`.
pub fn find_hw_decoder(codec_name: &str, backend: BackendKind) -> Option<ffmpeg_next::Codec> {
    let family = family(codec_name)?;
    for suffix in decoder_suffixes(backend) {
        let name = format!("{}_{}", family, suffix);
        if let Some(codec) = ffmpeg_next::decoder::find_by_name(&name) {
            log::info!("found hardware decoder: {}", name);
            return Some(codec);
        }
    }
    None
}

/// First named hardware encoder for `codec_name` on `backend`.
pub fn find_hw_encoder(codec_name: &str, backend: BackendKind) -> Option<ffmpeg_next::Codec> {
    let family = family(codec_name)?;
    for suffix in encoder_suffixes(backend) {
        let name = format!("{}_{}", family, suffix);
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(&name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

pub fn find_decoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    ffmpeg_next::decoder::find_by_name(codec_name)
        .or_else(|| codec_id(codec_name).and_then(ffmpeg_next::decoder::find))
}

/// Software encoder for a codec name: "h264" resolves to whatever FFmpeg
/// registered for the id (usually libx264).
pub fn find_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    ffmpeg_next::encoder::find_by_name(codec_name)
        .or_else(|| codec_id(codec_name).and_then(ffmpeg_next::encoder::find))
}

pub fn is_hw_codec(codec_name: &str) -> bool {
    ["nvenc", "cuvid", "vaapi", "qsv", "v4l2m2m", "videotoolbox", "amf"]
        .iter()
        .any(|s| codec_name.contains(s))
}

/// Pixel format to feed an encoder with. RGB sources go to YUV; hardware
/// encoders get NV12.
pub fn pixel_format_for_encoder(source: Pixel, codec_name: &str) -> Pixel {
    match source {
        Pixel::RGB24 | Pixel::BGR24 | Pixel::BGRA if is_hw_codec(codec_name) => Pixel::NV12,
        Pixel::RGB24 | Pixel::BGR24 | Pixel::BGRA => Pixel::YUV420P,
        Pixel::YUV420P if is_hw_codec(codec_name) && !codec_name.contains("nvenc") => Pixel::NV12,
        other => other,
    }
}

pub fn to_ffmpeg_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::P010 => Pixel::P010LE,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Bgra => Pixel::BGRA,
    }
}

pub fn from_ffmpeg_pixel(format: Pixel) -> Option<PixelFormat> {
    match format {
        Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::Yuv420p),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::P010LE => Some(PixelFormat::P010),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        Pixel::BGRA => Some(PixelFormat::Bgra),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_for_encoder() {
        assert_eq!(pixel_format_for_encoder(Pixel::RGB24, "libx264"), Pixel::YUV420P);
        assert_eq!(pixel_format_for_encoder(Pixel::RGB24, "h264_nvenc"), Pixel::NV12);
        assert_eq!(pixel_format_for_encoder(Pixel::YUV420P, "h264_vaapi"), Pixel::NV12);
        assert_eq!(pixel_format_for_encoder(Pixel::NV12, "libx264"), Pixel::NV12);
    }

    #[test]
    fn test_pixel_mapping() {
        for format in [
            PixelFormat::Yuv420p,
            PixelFormat::Nv12,
            PixelFormat::P010,
            PixelFormat::Rgb24,
            PixelFormat::Bgra,
        ] {
            assert_eq!(from_ffmpeg_pixel(to_ffmpeg_pixel(format)), Some(format));
        }
        assert_eq!(family("libx265"), Some("hevc"));
        assert_eq!(family("rawvideo"), None);
    }
}
