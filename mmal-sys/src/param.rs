// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Parameter ids and the fixed-size parameter payloads the host uses.

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, little_endian::U32};

pub const PARAMETER_GROUP_COMMON: u32 = 0;
pub const PARAMETER_GROUP_CAMERA: u32 = 1 << 16;
pub const PARAMETER_GROUP_VIDEO: u32 = 2 << 16;
pub const PARAMETER_GROUP_AUDIO: u32 = 3 << 16;

/// Array of encoding fourccs the port accepts.
pub const PARAMETER_SUPPORTED_ENCODINGS: u32 = PARAMETER_GROUP_COMMON + 1;
pub const PARAMETER_URI: u32 = PARAMETER_GROUP_COMMON + 2;
pub const PARAMETER_CHANGE_EVENT_REQUEST: u32 = PARAMETER_GROUP_COMMON + 3;
/// Boolean: buffers are exchanged through memory-sharing handles.
pub const PARAMETER_ZERO_COPY: u32 = PARAMETER_GROUP_COMMON + 4;
pub const PARAMETER_BUFFER_REQUIREMENTS: u32 = PARAMETER_GROUP_COMMON + 5;
pub const PARAMETER_STATISTICS: u32 = PARAMETER_GROUP_COMMON + 6;
pub const PARAMETER_NO_IMAGE_PADDING: u32 = PARAMETER_GROUP_COMMON + 14;

pub const PARAMETER_VIDEO_PROFILE: u32 = PARAMETER_GROUP_VIDEO + 2;
pub const PARAMETER_VIDEO_INTRAPERIOD: u32 = PARAMETER_GROUP_VIDEO + 3;
pub const PARAMETER_VIDEO_RATECONTROL: u32 = PARAMETER_GROUP_VIDEO + 4;
pub const PARAMETER_VIDEO_REQUEST_I_FRAME: u32 = PARAMETER_GROUP_VIDEO + 0xb;
pub const PARAMETER_VIDEO_BIT_RATE: u32 = PARAMETER_GROUP_VIDEO + 0xe;
pub const PARAMETER_VIDEO_FRAME_RATE: u32 = PARAMETER_GROUP_VIDEO + 0xf;

pub const VIDEO_PROFILE_H264_BASELINE: u32 = 0x19;
pub const VIDEO_PROFILE_H264_MAIN: u32 = 0x1a;
pub const VIDEO_PROFILE_H264_HIGH: u32 = 0x1c;
pub const VIDEO_PROFILE_H264_CONSTRAINED_BASELINE: u32 = 0x21;

pub const VIDEO_LEVEL_H264_1: u32 = 0x1c;
pub const VIDEO_LEVEL_H264_2: u32 = 0x23;
pub const VIDEO_LEVEL_H264_3: u32 = 0x27;
pub const VIDEO_LEVEL_H264_31: u32 = 0x28;
pub const VIDEO_LEVEL_H264_4: u32 = 0x2a;
pub const VIDEO_LEVEL_H264_41: u32 = 0x2b;
pub const VIDEO_LEVEL_H264_42: u32 = 0x2c;

pub const VIDEO_RATECONTROL_DEFAULT: u32 = 0;
pub const VIDEO_RATECONTROL_VARIABLE: u32 = 1;
pub const VIDEO_RATECONTROL_CONSTANT: u32 = 2;

/// Profile and level pair shared by `PARAMETER_VIDEO_PROFILE`.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct VideoProfileWire {
    pub profile: U32,
    pub level: U32,
}

const_assert_eq!(size_of::<VideoProfileWire>(), 8);
