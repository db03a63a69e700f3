// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! VCHI audio service messages.
//!
//! Every message is a type word followed by a fixed 20 byte union body; the
//! body structures below are written into [`AudioMsg::body`].

use static_assertions::const_assert_eq;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    little_endian::{I32, U16, U32},
};

use crate::service_fourcc;

/// VCHIQ service carrying the audio protocol.
pub const AUDIO_SERVICE_FOURCC: u32 = service_fourcc(b"AUDS");

pub const AUDIO_WRITE_COOKIE1: u32 = service_fourcc(b"BCMA");
pub const AUDIO_WRITE_COOKIE2: u32 = service_fourcc(b"DATA");

pub const AUDIO_MSG_RESULT: u32 = 0;
pub const AUDIO_MSG_COMPLETE: u32 = 1;
pub const AUDIO_MSG_CONFIG: u32 = 2;
pub const AUDIO_MSG_CONTROL: u32 = 3;
pub const AUDIO_MSG_OPEN: u32 = 4;
pub const AUDIO_MSG_CLOSE: u32 = 5;
pub const AUDIO_MSG_START: u32 = 6;
pub const AUDIO_MSG_STOP: u32 = 7;
pub const AUDIO_MSG_WRITE: u32 = 8;

/// Largest body of any audio message.
pub const AUDIO_BODY_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AudioMsg {
    pub msg_type: U32,
    pub body: [u8; AUDIO_BODY_SIZE],
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AudioConfig {
    pub channels: U32,
    pub samplerate: U32,
    pub bps: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AudioControl {
    /// Volume in firmware units (millibels, negative is quieter)
    pub volume: I32,
    pub dest: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AudioStop {
    /// Non-zero to play out queued data before stopping
    pub draining: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AudioWrite {
    pub count: U32,
    pub cookie1: U32,
    pub cookie2: U32,
    pub silence: U16,
    /// Zero when the data follows as one bulk transfer
    pub max_packet: U16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AudioResult {
    pub success: I32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AudioComplete {
    /// Bytes consumed, or negative on error
    pub count: I32,
    pub cookie1: U32,
    pub cookie2: U32,
}

impl AudioMsg {
    /// Builds a message whose body starts with `body`.
    pub fn new<T: IntoBytes + Immutable>(msg_type: u32, body: &T) -> Self {
        let mut msg = Self { msg_type: U32::new(msg_type), ..Default::default() };
        let bytes = body.as_bytes();
        let len = bytes.len().min(AUDIO_BODY_SIZE);
        msg.body[..len].copy_from_slice(&bytes[..len]);
        msg
    }

    /// Reads the body as `T`.
    pub fn body_as<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(&self.body).ok().map(|(value, _)| value)
    }
}

const_assert_eq!(size_of::<AudioMsg>(), 24);
const_assert_eq!(size_of::<AudioWrite>(), 16);
