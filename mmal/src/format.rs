// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Port format descriptors and buffer sizing.

use std::fmt;

use mmal_sys::{
    EsFormatWire, FORMAT_EXTRADATA_SIZE, FormatChangedEvent, PortWire, RationalWire, RectWire,
    VideoFormatWire,
};
use zerocopy::little_endian::{I32, U32};

use crate::{Error, Result};

/// Buffer size for compressed streams up to 1280x720.
pub const COMPRESSED_BUFFER_SIZE_720P_OR_LESS: u32 = 512 << 10;
/// Buffer size for compressed streams above 1280x720.
pub const COMPRESSED_BUFFER_SIZE_GREATER_720P: u32 = 768 << 10;

/// A stream encoding, identified by its fourcc.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Encoding(pub u32);

impl Encoding {
    pub const UNKNOWN: Encoding = Encoding(mmal_sys::ENCODING_UNKNOWN);
    pub const H264: Encoding = Encoding(mmal_sys::ENCODING_H264);
    pub const MVC: Encoding = Encoding(mmal_sys::ENCODING_MVC);
    pub const H263: Encoding = Encoding(mmal_sys::ENCODING_H263);
    pub const MP4V: Encoding = Encoding(mmal_sys::ENCODING_MP4V);
    pub const MP2V: Encoding = Encoding(mmal_sys::ENCODING_MP2V);
    pub const MP1V: Encoding = Encoding(mmal_sys::ENCODING_MP1V);
    pub const WVC1: Encoding = Encoding(mmal_sys::ENCODING_WVC1);
    pub const VP8: Encoding = Encoding(mmal_sys::ENCODING_VP8);
    pub const MJPEG: Encoding = Encoding(mmal_sys::ENCODING_MJPEG);
    pub const JPEG: Encoding = Encoding(mmal_sys::ENCODING_JPEG);
    pub const I420: Encoding = Encoding(mmal_sys::ENCODING_I420);
    pub const YV12: Encoding = Encoding(mmal_sys::ENCODING_YV12);
    pub const NV12: Encoding = Encoding(mmal_sys::ENCODING_NV12);
    pub const NV21: Encoding = Encoding(mmal_sys::ENCODING_NV21);
    pub const YUYV: Encoding = Encoding(mmal_sys::ENCODING_YUYV);
    pub const YVYU: Encoding = Encoding(mmal_sys::ENCODING_YVYU);
    pub const UYVY: Encoding = Encoding(mmal_sys::ENCODING_UYVY);
    pub const VYUY: Encoding = Encoding(mmal_sys::ENCODING_VYUY);
    pub const RGB24: Encoding = Encoding(mmal_sys::ENCODING_RGB24);
    pub const BGR24: Encoding = Encoding(mmal_sys::ENCODING_BGR24);
    pub const RGBA: Encoding = Encoding(mmal_sys::ENCODING_RGBA);
    pub const BGRA: Encoding = Encoding(mmal_sys::ENCODING_BGRA);
    pub const RGB16: Encoding = Encoding(mmal_sys::ENCODING_RGB16);
    pub const OPAQUE: Encoding = Encoding(mmal_sys::ENCODING_OPAQUE);

    pub const fn from_fourcc(code: &[u8; 4]) -> Self {
        Encoding(mmal_sys::fourcc(code))
    }

    /// `true` for bitstream encodings whose buffers carry no fixed geometry.
    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            Encoding::H264
                | Encoding::MVC
                | Encoding::H263
                | Encoding::MP4V
                | Encoding::MP2V
                | Encoding::MP1V
                | Encoding::WVC1
                | Encoding::VP8
                | Encoding::MJPEG
                | Encoding::JPEG
        )
    }

    /// Memory layout of a raw pixel encoding.
    pub fn layout(self) -> Option<PixelLayout> {
        let (depth, size_multiplier_x2) = match self {
            Encoding::I420 | Encoding::YV12 | Encoding::NV12 | Encoding::NV21 => (8, 3),
            Encoding::YUYV | Encoding::YVYU | Encoding::UYVY | Encoding::VYUY => (16, 2),
            Encoding::RGB16 => (16, 2),
            Encoding::RGB24 | Encoding::BGR24 => (24, 2),
            Encoding::RGBA | Encoding::BGRA => (32, 2),
            _ => return None,
        };
        Some(PixelLayout { depth, size_multiplier_x2 })
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mmal_sys::fourcc_to_string(self.0))
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Encoding({self})")
    }
}

/// Packing of a raw pixel encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    /// Bits per pixel of the first plane.
    pub depth: u32,
    /// Total image size relative to the first plane, times two.
    pub size_multiplier_x2: u32,
}

impl PixelLayout {
    /// Stride of the first plane, rounded up to `align` bytes. `None` when
    /// it does not fit in 32 bits.
    pub fn bytes_per_line(&self, width: u32, align: u32) -> Option<u32> {
        (width.checked_mul(self.depth)? >> 3).checked_next_multiple_of(align.max(1))
    }

    pub fn image_size(&self, bytes_per_line: u32, height: u32) -> Option<u32> {
        let doubled = bytes_per_line.checked_mul(height)?.checked_mul(self.size_multiplier_x2)?;
        Some(doubled >> 1)
    }
}

/// Buffer size a port of `encoding` needs for a `width` x `height` image.
///
/// Compressed encodings get a fixed size that depends only on resolution.
/// Returns `None` for encodings without a known layout and for images
/// larger than 32-bit sizes can describe.
pub fn image_size(encoding: Encoding, width: u32, height: u32, align: u32) -> Option<u32> {
    if encoding.is_compressed() {
        return Some(if u64::from(width) * u64::from(height) > 1280 * 720 {
            COMPRESSED_BUFFER_SIZE_GREATER_720P
        } else {
            COMPRESSED_BUFFER_SIZE_720P_OR_LESS
        });
    }
    let layout = encoding.layout()?;
    layout.image_size(layout.bytes_per_line(width, align)?, height)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EsType {
    #[default]
    Unknown,
    Control,
    Audio,
    Video,
    Subpicture,
}

impl EsType {
    fn from_wire(value: u32) -> Self {
        match value {
            mmal_sys::ES_TYPE_CONTROL => EsType::Control,
            mmal_sys::ES_TYPE_AUDIO => EsType::Audio,
            mmal_sys::ES_TYPE_VIDEO => EsType::Video,
            mmal_sys::ES_TYPE_SUBPICTURE => EsType::Subpicture,
            _ => EsType::Unknown,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            EsType::Unknown => mmal_sys::ES_TYPE_UNKNOWN,
            EsType::Control => mmal_sys::ES_TYPE_CONTROL,
            EsType::Audio => mmal_sys::ES_TYPE_AUDIO,
            EsType::Video => mmal_sys::ES_TYPE_VIDEO,
            EsType::Subpicture => mmal_sys::ES_TYPE_SUBPICTURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn sized(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

/// Colour space of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    #[default]
    Unknown,
    /// ITU-R BT.601
    Bt601,
    /// ITU-R BT.709
    Bt709,
    /// Full-range BT.601 as used by JFIF
    Jfif,
    Smpte240m,
    Other(u32),
}

impl ColorSpace {
    pub fn from_wire(value: u32) -> Self {
        match value {
            mmal_sys::COLOR_SPACE_UNKNOWN => ColorSpace::Unknown,
            mmal_sys::COLOR_SPACE_ITUR_BT601 => ColorSpace::Bt601,
            mmal_sys::COLOR_SPACE_ITUR_BT709 => ColorSpace::Bt709,
            mmal_sys::COLOR_SPACE_JPEG_JFIF => ColorSpace::Jfif,
            mmal_sys::COLOR_SPACE_SMPTE240M => ColorSpace::Smpte240m,
            other => ColorSpace::Other(other),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            ColorSpace::Unknown => mmal_sys::COLOR_SPACE_UNKNOWN,
            ColorSpace::Bt601 => mmal_sys::COLOR_SPACE_ITUR_BT601,
            ColorSpace::Bt709 => mmal_sys::COLOR_SPACE_ITUR_BT709,
            ColorSpace::Jfif => mmal_sys::COLOR_SPACE_JPEG_JFIF,
            ColorSpace::Smpte240m => mmal_sys::COLOR_SPACE_SMPTE240M,
            ColorSpace::Other(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub crop: Rect,
    pub frame_rate: Rational,
    /// Pixel aspect ratio
    pub par: Rational,
    pub color_space: ColorSpace,
}

/// Everything negotiated about the data flowing through a port.
///
/// Raw video needs its buffer geometry; compressed video may leave width and
/// height at zero (decode input) and learn them from a format change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortFormat {
    pub es_type: EsType,
    pub encoding: Encoding,
    pub encoding_variant: Encoding,
    /// Bits per second, zero when not applicable
    pub bitrate: u32,
    pub flags: u32,
    pub video: VideoFormat,
    /// Codec configuration data
    pub extradata: Vec<u8>,
}

impl PortFormat {
    /// Raw or compressed video of the given geometry, cropped to its full size.
    pub fn video(encoding: Encoding, width: u32, height: u32) -> Self {
        Self {
            es_type: EsType::Video,
            encoding,
            video: VideoFormat {
                width,
                height,
                crop: Rect::sized(width, height),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Compressed video whose geometry is not known yet.
    pub fn compressed_video(encoding: Encoding) -> Self {
        Self {
            flags: mmal_sys::ES_FORMAT_FLAG_FRAMED,
            ..Self::video(encoding, 0, 0)
        }
    }

    /// Checks the fields that are legal for this kind of stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFormat`] when the encoding is unset, raw video
    /// lacks a geometry or is too large to size, the crop rectangle leaves the buffer, or the
    /// extradata does not fit in a format message.
    pub fn validate(&self) -> Result<()> {
        if self.encoding == Encoding::UNKNOWN || self.extradata.len() > FORMAT_EXTRADATA_SIZE {
            return Err(Error::InvalidFormat);
        }
        if self.es_type != EsType::Video {
            return Ok(());
        }
        let video = &self.video;
        let sized = video.width != 0 && video.height != 0;
        if !self.encoding.is_compressed() && !sized {
            return Err(Error::InvalidFormat);
        }
        if self.encoding.layout().is_some()
            && image_size(self.encoding, video.width, video.height, 1).is_none()
        {
            return Err(Error::InvalidFormat);
        }
        if sized {
            let crop = &video.crop;
            let right = i64::from(crop.x) + i64::from(crop.width);
            let bottom = i64::from(crop.y) + i64::from(crop.height);
            if crop.x < 0
                || crop.y < 0
                || right > i64::from(video.width)
                || bottom > i64::from(video.height)
            {
                return Err(Error::InvalidFormat);
            }
        }
        Ok(())
    }

    pub(crate) fn to_wire(&self) -> (EsFormatWire, VideoFormatWire, [u8; FORMAT_EXTRADATA_SIZE]) {
        let es = EsFormatWire {
            es_type: U32::new(self.es_type.to_wire()),
            encoding: U32::new(self.encoding.0),
            encoding_variant: U32::new(self.encoding_variant.0),
            bitrate: U32::new(self.bitrate),
            flags: U32::new(self.flags),
            extradata_size: U32::new(self.extradata.len() as u32),
        };
        let video = &self.video;
        let video = VideoFormatWire {
            width: U32::new(video.width),
            height: U32::new(video.height),
            crop: RectWire {
                x: I32::new(video.crop.x),
                y: I32::new(video.crop.y),
                width: I32::new(video.crop.width as i32),
                height: I32::new(video.crop.height as i32),
            },
            frame_rate: RationalWire {
                num: I32::new(video.frame_rate.num),
                den: I32::new(video.frame_rate.den),
            },
            par: RationalWire { num: I32::new(video.par.num), den: I32::new(video.par.den) },
            color_space: U32::new(video.color_space.to_wire()),
        };
        let mut extradata = [0u8; FORMAT_EXTRADATA_SIZE];
        extradata[..self.extradata.len()].copy_from_slice(&self.extradata);
        (es, video, extradata)
    }

    pub(crate) fn from_wire(es: &EsFormatWire, video: &VideoFormatWire, extradata: &[u8]) -> Self {
        let extradata_len = (es.extradata_size.get() as usize).min(extradata.len());
        Self {
            es_type: EsType::from_wire(es.es_type.get()),
            encoding: Encoding(es.encoding.get()),
            encoding_variant: Encoding(es.encoding_variant.get()),
            bitrate: es.bitrate.get(),
            flags: es.flags.get(),
            video: VideoFormat {
                width: video.width.get(),
                height: video.height.get(),
                crop: Rect {
                    x: video.crop.x.get(),
                    y: video.crop.y.get(),
                    width: video.crop.width.get().max(0) as u32,
                    height: video.crop.height.get().max(0) as u32,
                },
                frame_rate: Rational {
                    num: video.frame_rate.num.get(),
                    den: video.frame_rate.den.get(),
                },
                par: Rational { num: video.par.num.get(), den: video.par.den.get() },
                color_space: ColorSpace::from_wire(video.color_space.get()),
            },
            extradata: extradata[..extradata_len].to_vec(),
        }
    }
}

/// Buffer count and size contract of a port.
///
/// The minimum and recommended values come from the firmware; `num` and
/// `size` are what the host negotiated and may not go below the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRequirements {
    pub num_min: u32,
    pub size_min: u32,
    pub alignment_min: u32,
    pub num_recommended: u32,
    pub size_recommended: u32,
    pub num: u32,
    pub size: u32,
}

impl BufferRequirements {
    pub(crate) fn from_wire(port: &PortWire) -> Self {
        Self {
            num_min: port.buffer_num_min.get(),
            size_min: port.buffer_size_min.get(),
            alignment_min: port.buffer_alignment_min.get(),
            num_recommended: port.buffer_num_recommended.get(),
            size_recommended: port.buffer_size_recommended.get(),
            num: port.buffer_num.get(),
            size: port.buffer_size.get(),
        }
    }

    pub(crate) fn write_wire(&self, port: &mut PortWire) {
        port.buffer_num_min = U32::new(self.num_min);
        port.buffer_size_min = U32::new(self.size_min);
        port.buffer_alignment_min = U32::new(self.alignment_min);
        port.buffer_num_recommended = U32::new(self.num_recommended);
        port.buffer_size_recommended = U32::new(self.size_recommended);
        port.buffer_num = U32::new(self.num);
        port.buffer_size = U32::new(self.size);
    }
}

/// New stream properties announced by the firmware mid-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatChange {
    pub format: PortFormat,
    pub buffer_num_min: u32,
    pub buffer_size_min: u32,
    pub buffer_num_recommended: u32,
    pub buffer_size_recommended: u32,
}

impl FormatChange {
    pub(crate) fn from_wire(event: &FormatChangedEvent) -> Self {
        Self {
            format: PortFormat::from_wire(&event.format, &event.video, &[]),
            buffer_num_min: event.buffer_num_min.get(),
            buffer_size_min: event.buffer_size_min.get(),
            buffer_num_recommended: event.buffer_num_recommended.get(),
            buffer_size_recommended: event.buffer_size_recommended.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_video_needs_geometry() {
        assert!(matches!(
            PortFormat::video(Encoding::I420, 0, 480).validate(),
            Err(Error::InvalidFormat)
        ));
        assert!(PortFormat::video(Encoding::I420, 640, 480).validate().is_ok());
        assert!(PortFormat::compressed_video(Encoding::H264).validate().is_ok());
    }

    #[test]
    fn crop_must_stay_inside_the_buffer() {
        let mut format = PortFormat::video(Encoding::NV12, 1920, 1088);
        format.video.crop = Rect { x: 0, y: 8, width: 1920, height: 1080 };
        assert!(format.validate().is_ok());
        format.video.crop.y = 16;
        assert!(matches!(format.validate(), Err(Error::InvalidFormat)));
    }

    #[test]
    fn sizing_follows_the_encoding() {
        assert_eq!(image_size(Encoding::H264, 1280, 720, 32), Some(512 << 10));
        assert_eq!(image_size(Encoding::H264, 1920, 1080, 32), Some(768 << 10));
        // 650 bytes per line rounds up to 672; I420 is 1.5 bytes per pixel.
        assert_eq!(image_size(Encoding::I420, 650, 480, 32), Some(672 * 480 * 3 / 2));
        assert_eq!(image_size(Encoding::OPAQUE, 640, 480, 32), None);
    }

    #[test]
    fn oversized_images_have_no_size() {
        assert_eq!(image_size(Encoding::I420, 70_000, 70_000, 32), None);
        assert_eq!(image_size(Encoding::RGBA, u32::MAX, 1, 32), None);
        assert_eq!(image_size(Encoding::H264, 70_000, 70_000, 32), Some(768 << 10));
        assert!(matches!(
            PortFormat::video(Encoding::I420, 70_000, 70_000).validate(),
            Err(Error::InvalidFormat)
        ));
    }

    #[test]
    fn encodings_print_as_fourcc() {
        assert_eq!(Encoding::H264.to_string(), "H264");
        assert_eq!(format!("{:?}", Encoding::RGB24), "Encoding(RGB3)");
    }
}
