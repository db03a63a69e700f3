// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Device roles and the capabilities each one implies.
//!
//! A media-device adapter serves one role for its whole lifetime. The role
//! is resolved into a [`Capabilities`] record once, so that nothing
//! downstream branches on the role again.

use std::{fmt, str::FromStr};

use crate::{
    Error, Result,
    format::{self, Encoding, PortFormat},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Decode,
    Encode,
    Isp,
}

/// Everything role-specific a session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub role: Role,
    /// Name of the remote component to create.
    pub component_name: &'static str,
    pub default_width: u32,
    pub default_height: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// The source (input) side carries a bitstream.
    pub compressed_input: bool,
    /// The destination (output) side carries a bitstream.
    pub compressed_output: bool,
    /// The role implements the stop command by sending end of stream.
    pub supports_stop_command: bool,
    /// Output ports the component must expose.
    pub output_ports: usize,
    /// Row alignment of raw images, in bytes.
    pub bytes_per_line_align: u32,
}

impl Role {
    pub fn capabilities(self) -> Capabilities {
        let codec = Capabilities {
            role: self,
            component_name: "",
            default_width: 640,
            default_height: 480,
            min_width: 32,
            min_height: 32,
            max_width: 1920,
            max_height: 1088,
            compressed_input: false,
            compressed_output: false,
            supports_stop_command: true,
            output_ports: 1,
            bytes_per_line_align: 32,
        };
        match self {
            Role::Decode => Capabilities {
                component_name: "ril.video_decode",
                compressed_input: true,
                ..codec
            },
            Role::Encode => Capabilities {
                component_name: "ril.video_encode",
                compressed_output: true,
                ..codec
            },
            Role::Isp => Capabilities {
                component_name: "ril.isp",
                default_width: 1280,
                default_height: 1280,
                min_width: 64,
                min_height: 64,
                max_width: 16384,
                max_height: 16384,
                supports_stop_command: false,
                // Two image outputs and statistics.
                output_ports: 3,
                ..codec
            },
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Decode => "decode",
            Role::Encode => "encode",
            Role::Isp => "isp",
        })
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "decode" => Ok(Role::Decode),
            "encode" => Ok(Role::Encode),
            "isp" => Ok(Role::Isp),
            _ => Err(Error::NotFound(format!("role {s}"))),
        }
    }
}

impl Capabilities {
    /// Stride of a raw image row, aligned for the firmware.
    pub fn bytes_per_line(&self, encoding: Encoding, width: u32) -> Option<u32> {
        encoding.layout()?.bytes_per_line(width, self.bytes_per_line_align)
    }

    /// Buffer size of one frame of `encoding` at `width` x `height`.
    pub fn image_size(&self, encoding: Encoding, width: u32, height: u32) -> Option<u32> {
        format::image_size(encoding, width, height, self.bytes_per_line_align)
    }

    /// Clamps a requested format into what the role supports.
    ///
    /// Dimensions are limited to the role's maximum. Raw formats are also
    /// raised to the minimum, and a decoder's raw output is padded to a
    /// multiple of 16 lines. A compressed 0x0 format stays unsized.
    pub fn try_format(&self, format: &PortFormat) -> PortFormat {
        let mut format = format.clone();
        let video = &mut format.video;
        video.width = video.width.min(self.max_width);
        video.height = video.height.min(self.max_height);
        if !format.encoding.is_compressed() {
            video.width = video.width.max(self.min_width);
            video.height = video.height.max(self.min_height);
            if self.role == Role::Decode {
                video.height = video.height.next_multiple_of(16);
            }
        }
        video.crop.width = video.crop.width.min(video.width);
        video.crop.height = video.crop.height.min(video.height);
        format
    }

    /// The format a fresh session starts with on the source side.
    pub fn default_source_format(&self) -> PortFormat {
        if self.compressed_input {
            PortFormat::video(Encoding::H264, self.default_width, self.default_height)
        } else {
            PortFormat::video(Encoding::I420, self.default_width, self.default_height)
        }
    }

    /// The format a fresh session starts with on the destination side.
    pub fn default_destination_format(&self) -> PortFormat {
        if self.compressed_output {
            PortFormat::video(Encoding::H264, self.default_width, self.default_height)
        } else {
            PortFormat::video(Encoding::I420, self.default_width, self.default_height)
        }
    }
}
