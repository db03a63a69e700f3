// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Elementary-stream format descriptors, encodings and colour spaces.

use static_assertions::const_assert_eq;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{I32, U32},
};

use crate::fourcc;

pub const ES_TYPE_UNKNOWN: u32 = 0;
pub const ES_TYPE_CONTROL: u32 = 1;
pub const ES_TYPE_AUDIO: u32 = 2;
pub const ES_TYPE_VIDEO: u32 = 3;
pub const ES_TYPE_SUBPICTURE: u32 = 4;

/// Elementary stream carries framed data (one frame per buffer).
pub const ES_FORMAT_FLAG_FRAMED: u32 = 0x1;

pub const ENCODING_H264: u32 = fourcc(b"H264");
pub const ENCODING_MVC: u32 = fourcc(b"MVC ");
pub const ENCODING_H263: u32 = fourcc(b"H263");
pub const ENCODING_MP4V: u32 = fourcc(b"MP4V");
pub const ENCODING_MP2V: u32 = fourcc(b"MP2V");
pub const ENCODING_MP1V: u32 = fourcc(b"MP1V");
pub const ENCODING_WVC1: u32 = fourcc(b"WVC1");
pub const ENCODING_VP8: u32 = fourcc(b"VP8 ");
pub const ENCODING_MJPEG: u32 = fourcc(b"MJPG");
pub const ENCODING_JPEG: u32 = fourcc(b"JPEG");

pub const ENCODING_I420: u32 = fourcc(b"I420");
pub const ENCODING_YV12: u32 = fourcc(b"YV12");
pub const ENCODING_NV12: u32 = fourcc(b"NV12");
pub const ENCODING_NV21: u32 = fourcc(b"NV21");
pub const ENCODING_YUYV: u32 = fourcc(b"YUYV");
pub const ENCODING_YVYU: u32 = fourcc(b"YVYU");
pub const ENCODING_UYVY: u32 = fourcc(b"UYVY");
pub const ENCODING_VYUY: u32 = fourcc(b"VYUY");
pub const ENCODING_RGB24: u32 = fourcc(b"RGB3");
pub const ENCODING_BGR24: u32 = fourcc(b"BGR3");
pub const ENCODING_RGBA: u32 = fourcc(b"RGBA");
pub const ENCODING_BGRA: u32 = fourcc(b"BGRA");
pub const ENCODING_RGB16: u32 = fourcc(b"RGB2");
pub const ENCODING_OPAQUE: u32 = fourcc(b"OPQV");

pub const ENCODING_PCM_SIGNED: u32 = fourcc(b"PCMS");

pub const ENCODING_UNKNOWN: u32 = 0;

pub const COLOR_SPACE_UNKNOWN: u32 = 0;
pub const COLOR_SPACE_ITUR_BT601: u32 = fourcc(b"Y601");
pub const COLOR_SPACE_ITUR_BT709: u32 = fourcc(b"Y709");
pub const COLOR_SPACE_JPEG_JFIF: u32 = fourcc(b"YJFI");
pub const COLOR_SPACE_FCC: u32 = fourcc(b"YFCC");
pub const COLOR_SPACE_SMPTE240M: u32 = fourcc(b"Y240");
pub const COLOR_SPACE_BT470_2_M: u32 = fourcc(b"Y__M");
pub const COLOR_SPACE_BT470_2_BG: u32 = fourcc(b"Y_BG");

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RectWire {
    pub x: I32,
    pub y: I32,
    pub width: I32,
    pub height: I32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RationalWire {
    pub num: I32,
    pub den: I32,
}

/// Stream-independent part of a port format.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EsFormatWire {
    /// One of the `ES_TYPE_*` values
    pub es_type: U32,
    /// Fourcc of the encoding (`ENCODING_*`)
    pub encoding: U32,
    pub encoding_variant: U32,
    /// Bits per second; zero when unknown
    pub bitrate: U32,
    /// `ES_FORMAT_FLAG_*` bits
    pub flags: U32,
    pub extradata_size: U32,
}

/// Video-specific part of a port format. Zeroed for other stream types.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct VideoFormatWire {
    /// Buffer width in pixels
    pub width: U32,
    /// Buffer height in pixels
    pub height: U32,
    /// Visible region within the buffer
    pub crop: RectWire,
    pub frame_rate: RationalWire,
    pub par: RationalWire,
    /// Fourcc of the colour space (`COLOR_SPACE_*`)
    pub color_space: U32,
}

const_assert_eq!(size_of::<EsFormatWire>(), 24);
const_assert_eq!(size_of::<VideoFormatWire>(), 44);
