// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer and event messages of the data plane.

use bitflags::bitflags;
use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{I64, U32},
};

use crate::{
    SHORT_DATA_SIZE, fourcc,
    format::{EsFormatWire, VideoFormatWire},
    msg::MSG_MAX_BODY,
};

/// Timestamp value meaning "no timestamp".
pub const TIME_UNKNOWN: i64 = i64::MIN;

/// Marks the driver-buffer block of every buffer message the host sends.
pub const DRIVER_BUFFER_MAGIC: u32 = fourcc(b"drvb");

/// Event payload capacity of an `EVENT_TO_HOST` message.
pub const EVENT_DATA_SIZE: usize = 256;

pub const EVENT_ERROR: u32 = fourcc(b"ERRO");
pub const EVENT_EOS: u32 = fourcc(b"EEOS");
pub const EVENT_FORMAT_CHANGED: u32 = fourcc(b"EFCH");
pub const EVENT_PARAMETER_CHANGED: u32 = fourcc(b"EPCH");

bitflags! {
    /// Flags of a buffer header.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// End of stream
        const EOS = 1 << 0;
        /// Buffer starts a frame
        const FRAME_START = 1 << 1;
        /// Buffer ends a frame
        const FRAME_END = 1 << 2;
        /// Buffer holds a whole frame
        const FRAME = Self::FRAME_START.bits() | Self::FRAME_END.bits();
        /// Buffer holds a key frame
        const KEYFRAME = 1 << 3;
        /// Data is not contiguous with the previous buffer
        const DISCONTINUITY = 1 << 4;
        /// Codec configuration data
        const CONFIG = 1 << 5;
        const ENCRYPTED = 1 << 6;
        const CODECSIDEINFO = 1 << 7;
        const SNAPSHOT = 1 << 8;
        /// Data is known to be corrupted
        const CORRUPTED = 1 << 9;
        const TRANSMISSION_FAILED = 1 << 10;
        const DECODEONLY = 1 << 11;
        /// Buffer ends a NAL unit
        const NAL_END = 1 << 12;
    }
}

/// Firmware-visible buffer header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BufferHeaderWire {
    /// Zero for data; an `EVENT_*` fourcc for in-band commands
    pub cmd: U32,
    /// Memory-sharing handle of the payload when zero-copy
    pub data: U32,
    pub alloc_size: U32,
    pub length: U32,
    pub offset: U32,
    /// [`BufferFlags`] bits
    pub flags: U32,
    /// Presentation timestamp in microseconds, or [`TIME_UNKNOWN`]
    pub pts: I64,
    /// Decode timestamp in microseconds, or [`TIME_UNKNOWN`]
    pub dts: I64,
}

/// Host-owned routing block, echoed back verbatim by the firmware.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DriverBuffer {
    /// Must be [`DRIVER_BUFFER_MAGIC`]
    pub magic: U32,
    /// Host-side id of the owning component
    pub client_component: U32,
    /// Firmware handle of the port the buffer was submitted to
    pub port_handle: U32,
    /// Correlates the returned buffer with the submitted one
    pub cookie: U32,
}

/// Body of `BUFFER_FROM_HOST` and `BUFFER_TO_HOST`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BufferMsg {
    pub drvbuf: DriverBuffer,
    pub buffer_header: BufferHeaderWire,
    /// Non-zero when the payload travels in `short_data`
    pub payload_in_message: U32,
    /// Non-zero when `buffer_header.data` is a memory-sharing handle
    pub is_zero_copy: U32,
    pub short_data: [u8; SHORT_DATA_SIZE],
}

/// Body of `EVENT_TO_HOST`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct EventToHost {
    pub client_component: U32,
    pub port_type: U32,
    pub port_num: U32,
    /// `EVENT_*` fourcc
    pub cmd: U32,
    pub length: U32,
    pub data: [u8; EVENT_DATA_SIZE],
}

/// Payload of an [`EVENT_FORMAT_CHANGED`] command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FormatChangedEvent {
    pub buffer_size_min: U32,
    pub buffer_num_min: U32,
    pub buffer_size_recommended: U32,
    pub buffer_num_recommended: U32,
    pub format: EsFormatWire,
    pub video: VideoFormatWire,
}

/// Payload of an [`EVENT_ERROR`] command.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ErrorEvent {
    pub status: U32,
}

const_assert_eq!(size_of::<BufferHeaderWire>(), 40);
const_assert_eq!(size_of::<BufferMsg>(), 192);
const_assert!(size_of::<EventToHost>() <= MSG_MAX_BODY);
const_assert!(size_of::<FormatChangedEvent>() <= SHORT_DATA_SIZE);
