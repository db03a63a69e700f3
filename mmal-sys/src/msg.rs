// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Message header, message types, status codes and the control-plane bodies.

use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, little_endian::U32};

use crate::{
    fourcc, service_fourcc,
    format::{EsFormatWire, VideoFormatWire},
};

/// `mmal` in every message header.
pub const MMAL_MAGIC: u32 = fourcc(b"mmal");

/// VCHIQ service carrying the MMAL protocol.
pub const MMAL_SERVICE_FOURCC: u32 = service_fourcc(b"mmal");

/// Largest message the transport carries, header included.
pub const MSG_MAX_SIZE: usize = 512;

/// Largest payload that fits inside a buffer message.
pub const SHORT_DATA_SIZE: usize = 128;

/// Largest component name, terminator included.
pub const COMPONENT_NAME_SIZE: usize = 128;

/// Raw parameter payload capacity of a parameter message.
pub const PARAMETER_SPACE: usize = 384;

/// Extradata (codec config) carried in port format messages.
pub const FORMAT_EXTRADATA_SIZE: usize = 128;

pub const MSG_TYPE_QUIT: u32 = 1;
pub const MSG_TYPE_SERVICE_CLOSED: u32 = 2;
pub const MSG_TYPE_GET_VERSION: u32 = 3;
pub const MSG_TYPE_COMPONENT_CREATE: u32 = 4;
pub const MSG_TYPE_COMPONENT_DESTROY: u32 = 5;
pub const MSG_TYPE_COMPONENT_ENABLE: u32 = 6;
pub const MSG_TYPE_COMPONENT_DISABLE: u32 = 7;
pub const MSG_TYPE_PORT_INFO_GET: u32 = 8;
pub const MSG_TYPE_PORT_INFO_SET: u32 = 9;
pub const MSG_TYPE_PORT_ACTION: u32 = 10;
pub const MSG_TYPE_BUFFER_FROM_HOST: u32 = 11;
pub const MSG_TYPE_BUFFER_TO_HOST: u32 = 12;
pub const MSG_TYPE_GET_STATS: u32 = 13;
pub const MSG_TYPE_PORT_PARAMETER_SET: u32 = 14;
pub const MSG_TYPE_PORT_PARAMETER_GET: u32 = 15;
pub const MSG_TYPE_EVENT_TO_HOST: u32 = 16;
pub const MSG_TYPE_GET_CORE_STATS_FOR_PORT: u32 = 17;
pub const MSG_TYPE_OPAQUE_ALLOCATOR: u32 = 18;
pub const MSG_TYPE_CONSUME_MEM: u32 = 19;
pub const MSG_TYPE_LMK: u32 = 20;
pub const MSG_TYPE_OPAQUE_ALLOCATOR_DESC: u32 = 21;
pub const MSG_TYPE_DRM_GET_LHS32: u32 = 22;
pub const MSG_TYPE_DRM_GET_TIME: u32 = 23;
pub const MSG_TYPE_BUFFER_FROM_HOST_ZEROLEN: u32 = 24;
pub const MSG_TYPE_PORT_FLUSH: u32 = 25;
pub const MSG_TYPE_HOST_LOG: u32 = 26;

pub const STATUS_SUCCESS: u32 = 0;
pub const STATUS_ENOMEM: u32 = 1;
pub const STATUS_ENOSPC: u32 = 2;
pub const STATUS_EINVAL: u32 = 3;
pub const STATUS_ENOSYS: u32 = 4;
pub const STATUS_ENOENT: u32 = 5;
pub const STATUS_ENXIO: u32 = 6;
pub const STATUS_EIO: u32 = 7;
pub const STATUS_ESPIPE: u32 = 8;
pub const STATUS_ECORRUPT: u32 = 9;
pub const STATUS_ENOTREADY: u32 = 10;
pub const STATUS_ECONFIG: u32 = 11;
pub const STATUS_EISCONN: u32 = 12;
pub const STATUS_ENOTCONN: u32 = 13;
pub const STATUS_EAGAIN: u32 = 14;
pub const STATUS_EFAULT: u32 = 15;

pub const PORT_TYPE_UNKNOWN: u32 = 0;
pub const PORT_TYPE_CONTROL: u32 = 1;
pub const PORT_TYPE_INPUT: u32 = 2;
pub const PORT_TYPE_OUTPUT: u32 = 3;
pub const PORT_TYPE_CLOCK: u32 = 4;

pub const PORT_ACTION_ENABLE: u32 = 1;
pub const PORT_ACTION_DISABLE: u32 = 2;
pub const PORT_ACTION_FLUSH: u32 = 3;
pub const PORT_ACTION_CONNECT: u32 = 4;
pub const PORT_ACTION_DISCONNECT: u32 = 5;
pub const PORT_ACTION_SET_REQUIREMENTS: u32 = 6;

/// Header shared by every MMAL message.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MsgHeader {
    /// Must be [`MMAL_MAGIC`]
    pub magic: U32,
    /// One of the `MSG_TYPE_*` values
    pub msg_type: U32,
    /// Unused by the host, echoed by firmware
    pub control_service: U32,
    /// Correlation id; zero for unsolicited messages
    pub context: U32,
    /// `STATUS_*` of a reply
    pub status: U32,
    pub padding: U32,
}

const_assert_eq!(size_of::<MsgHeader>(), 24);

/// Largest body that still fits in one message.
pub const MSG_MAX_BODY: usize = MSG_MAX_SIZE - size_of::<MsgHeader>();

/// `COMPONENT_CREATE` request.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ComponentCreate {
    /// Host-side id the firmware echoes in events for this component
    pub client_component: U32,
    /// NUL-terminated remote component name
    pub name: [u8; COMPONENT_NAME_SIZE],
    pub pid: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ComponentCreateReply {
    pub status: U32,
    pub component_handle: U32,
    pub input_num: U32,
    pub output_num: U32,
    pub clock_num: U32,
}

/// Body of `COMPONENT_DESTROY`, `COMPONENT_ENABLE` and `COMPONENT_DISABLE`.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ComponentHandleMsg {
    pub component_handle: U32,
}

/// Reply body carrying nothing but a status.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct StatusReply {
    pub status: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct GetVersionReply {
    pub flags: U32,
    pub major: U32,
    pub minor: U32,
    pub minimum: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PortInfoGet {
    pub component_handle: U32,
    pub port_type: U32,
    pub index: U32,
}

/// Firmware's view of a port: sizing contract and enable state.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PortWire {
    pub port_type: U32,
    pub index: U32,
    pub index_all: U32,
    pub is_enabled: U32,
    pub buffer_num_min: U32,
    pub buffer_size_min: U32,
    pub buffer_alignment_min: U32,
    pub buffer_num_recommended: U32,
    pub buffer_size_recommended: U32,
    pub buffer_num: U32,
    pub buffer_size: U32,
    pub capabilities: U32,
}

/// Reply to `PORT_INFO_GET` and `PORT_INFO_SET`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PortInfoReply {
    pub status: U32,
    pub component_handle: U32,
    pub port_type: U32,
    pub port_index: U32,
    /// Opaque firmware handle used by every later port message
    pub port_handle: U32,
    pub found: U32,
    pub port: PortWire,
    pub format: EsFormatWire,
    pub video: VideoFormatWire,
    pub extradata: [u8; FORMAT_EXTRADATA_SIZE],
}

/// `PORT_INFO_SET` request: commits format and buffer sizing of a port.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PortInfoSet {
    pub component_handle: U32,
    pub port_type: U32,
    pub port_index: U32,
    pub port_handle: U32,
    pub port: PortWire,
    pub format: EsFormatWire,
    pub video: VideoFormatWire,
    pub extradata: [u8; FORMAT_EXTRADATA_SIZE],
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PortAction {
    pub component_handle: U32,
    pub port_handle: U32,
    /// One of the `PORT_ACTION_*` values
    pub action: U32,
    pub connect_component_handle: U32,
    pub connect_port_handle: U32,
}

/// `PORT_PARAMETER_SET` request.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ParameterSet {
    pub component_handle: U32,
    pub port_handle: U32,
    pub id: U32,
    /// Size of the parameter including the id/size pair, as firmware expects
    pub size: U32,
    pub value: [u8; PARAMETER_SPACE],
}

/// `PORT_PARAMETER_GET` request.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ParameterGet {
    pub component_handle: U32,
    pub port_handle: U32,
    pub id: U32,
    pub size: U32,
}

/// Reply to `PORT_PARAMETER_GET` and `PORT_PARAMETER_SET`.
///
/// When `status` is `STATUS_ENOSPC`, `size` holds the size the firmware
/// needed, id/size pair included.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ParameterGetReply {
    pub status: U32,
    pub id: U32,
    pub size: U32,
    pub value: [u8; PARAMETER_SPACE],
}

/// Size of the id/size pair that prefixes every parameter on the wire.
pub const PARAMETER_HEADER_SIZE: usize = 8;

const_assert_eq!(size_of::<PortWire>(), 48);
const_assert_eq!(size_of::<ComponentCreate>(), 136);
const_assert_eq!(size_of::<PortInfoReply>(), 268);

// Every request and reply has to fit in one transport message.
const_assert!(size_of::<PortInfoReply>() <= MSG_MAX_BODY);
const_assert!(size_of::<PortInfoSet>() <= MSG_MAX_BODY);
const_assert!(size_of::<ParameterSet>() <= MSG_MAX_BODY);
const_assert!(size_of::<ParameterGetReply>() <= MSG_MAX_BODY);
