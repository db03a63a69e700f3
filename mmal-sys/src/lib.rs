// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Raw wire format of the MMAL message protocol spoken over a VCHIQ service,
//! plus the VCHI audio service that shares the same transport.
//!
//! Everything in this crate is plain data: `#[repr(C)]` structures built from
//! little-endian, alignment-1 integer types so that a message can be read
//! straight out of (or written straight into) a received byte slice. The safe
//! protocol engine lives in the `mmal` crate.

#![deny(unsafe_code)]

pub mod audio;
pub mod buffer;
pub mod format;
pub mod msg;
pub mod param;

pub use buffer::*;
pub use format::*;
pub use msg::*;
pub use param::*;

use zerocopy::{FromBytes, Immutable, IntoBytes, little_endian::U32};

/// Packs four ASCII characters the way MMAL encodes encodings and events
/// (first character in the least significant byte).
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// Packs four ASCII characters the way VCHIQ names services
/// (first character in the most significant byte).
pub const fn service_fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | (code[3] as u32)
}

/// Renders a fourcc packed with [`fourcc`] as text, replacing non-printable
/// bytes with `.`.
pub fn fourcc_to_string(value: u32) -> String {
    value
        .to_le_bytes()
        .iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
        .collect()
}

/// Serialises a header followed by `body` into one message.
pub fn encode_message<T: IntoBytes + Immutable>(msg_type: u32, context: u32, body: &T) -> Vec<u8> {
    encode_reply(msg_type, context, 0, body)
}

/// Same as [`encode_message`] with an explicit header status, as used by the
/// firmware side when it answers a request.
pub fn encode_reply<T: IntoBytes + Immutable>(
    msg_type: u32,
    context: u32,
    status: u32,
    body: &T,
) -> Vec<u8> {
    let header = MsgHeader {
        magic: U32::new(MMAL_MAGIC),
        msg_type: U32::new(msg_type),
        control_service: U32::new(0),
        context: U32::new(context),
        status: U32::new(status),
        padding: U32::new(0),
    };
    let mut message = Vec::with_capacity(size_of::<MsgHeader>() + size_of::<T>());
    message.extend_from_slice(header.as_bytes());
    message.extend_from_slice(body.as_bytes());
    message
}

/// Splits a received message into its header and body.
///
/// Returns `None` when the message is shorter than a header. The magic is not
/// checked here; callers decide how to treat a foreign message.
pub fn decode_header(message: &[u8]) -> Option<(MsgHeader, &[u8])> {
    MsgHeader::read_from_prefix(message).ok()
}

/// Reads a body structure from the start of `body`, ignoring trailing bytes.
pub fn decode_body<T: FromBytes>(body: &[u8]) -> Option<T> {
    T::read_from_prefix(body).ok().map(|(value, _)| value)
}
