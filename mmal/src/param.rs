// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Parameter get/set on ports.

use mmal_sys::{
    MSG_TYPE_PORT_PARAMETER_GET, MSG_TYPE_PORT_PARAMETER_SET, PARAMETER_HEADER_SIZE,
    PARAMETER_SPACE, ParameterGet, ParameterGetReply, ParameterSet, VideoProfileWire,
};
use tracing::debug;
use zerocopy::{FromBytes, IntoBytes, little_endian::U32};

use crate::{Error, Port, Result, format::Encoding};

/// Capacity of the first supported-encodings query.
const SUPPORTED_ENCODINGS_HINT: usize = 40;

/// H.264 profile and level as the firmware numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub profile: u32,
    pub level: u32,
}

impl Port {
    /// Sets parameter `id` to the raw `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] when `value` does not fit in one
    /// parameter message, or the firmware's status mapped by
    /// [`Error::from_status`].
    pub fn set_parameter(&self, id: u32, value: &[u8]) -> Result<()> {
        self.check_alive()?;
        if value.len() > PARAMETER_SPACE {
            return Err(Error::InvalidArg);
        }
        let mut request = ParameterSet {
            component_handle: U32::new(self.component_handle()),
            port_handle: U32::new(self.handle()),
            id: U32::new(id),
            size: U32::new((PARAMETER_HEADER_SIZE + value.len()) as u32),
            value: [0; PARAMETER_SPACE],
        };
        request.value[..value.len()].copy_from_slice(value);
        debug!("{} set parameter {:#x}, {} bytes", self, id, value.len());
        self.context().request_status(MSG_TYPE_PORT_PARAMETER_SET, &request)
    }

    /// Reads parameter `id` into `value` and returns the number of bytes
    /// the firmware reported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientSpace`] with the size the firmware needs
    /// when `value` is too small; retrying with a buffer of that size
    /// succeeds.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # fn read(port: &mmal::Port) -> mmal::Result<()> {
    /// let mut value = [0u8; 16];
    /// let value = match port.get_parameter(mmal_sys::PARAMETER_SUPPORTED_ENCODINGS, &mut value) {
    ///     Ok(size) => value[..size].to_vec(),
    ///     Err(mmal::Error::InsufficientSpace { required }) => {
    ///         let mut value = vec![0u8; required];
    ///         let size = port.get_parameter(mmal_sys::PARAMETER_SUPPORTED_ENCODINGS, &mut value)?;
    ///         value.truncate(size);
    ///         value
    ///     }
    ///     Err(error) => return Err(error),
    /// };
    /// # let _ = value;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_parameter(&self, id: u32, value: &mut [u8]) -> Result<usize> {
        self.check_alive()?;
        let capacity = value.len().min(PARAMETER_SPACE);
        let request = ParameterGet {
            component_handle: U32::new(self.component_handle()),
            port_handle: U32::new(self.handle()),
            id: U32::new(id),
            size: U32::new((PARAMETER_HEADER_SIZE + capacity) as u32),
        };
        let reply: ParameterGetReply = self.context().request(MSG_TYPE_PORT_PARAMETER_GET, &request)?;
        let reported = (reply.size.get() as usize).saturating_sub(PARAMETER_HEADER_SIZE);
        match reply.status.get() {
            mmal_sys::STATUS_ENOSPC => return Err(Error::InsufficientSpace { required: reported }),
            status => Error::from_status(status)?,
        }
        // Some firmware truncates silently instead of failing.
        if reported > capacity {
            return Err(Error::InsufficientSpace { required: reported });
        }
        value[..reported].copy_from_slice(&reply.value[..reported]);
        Ok(reported)
    }

    pub fn set_parameter_u32(&self, id: u32, value: u32) -> Result<()> {
        self.set_parameter(id, U32::new(value).as_bytes())
    }

    pub fn get_parameter_u32(&self, id: u32) -> Result<u32> {
        let mut value = U32::new(0);
        let size = self.get_parameter(id, value.as_mut_bytes())?;
        if size != size_of::<U32>() {
            return Err(Error::ProtocolViolation(format!(
                "parameter {id:#x} is {size} bytes, expected 4"
            )));
        }
        Ok(value.get())
    }

    pub fn set_parameter_bool(&self, id: u32, value: bool) -> Result<()> {
        self.set_parameter_u32(id, value.into())
    }

    /// Switches the port between copied and shared-memory buffers.
    pub fn set_zero_copy(&self, enabled: bool) -> Result<()> {
        self.set_parameter_bool(mmal_sys::PARAMETER_ZERO_COPY, enabled)
    }

    /// Lists the encodings the port accepts.
    ///
    /// Starts with room for 40 entries and retries once with the size the
    /// firmware asks for.
    pub fn supported_encodings(&self) -> Result<Vec<Encoding>> {
        let mut raw = vec![0u8; SUPPORTED_ENCODINGS_HINT * size_of::<U32>()];
        let size = match self.get_parameter(mmal_sys::PARAMETER_SUPPORTED_ENCODINGS, &mut raw) {
            Err(Error::InsufficientSpace { required }) => {
                debug!("{} supports more than {} encodings, retrying", self, SUPPORTED_ENCODINGS_HINT);
                raw.resize(required, 0);
                self.get_parameter(mmal_sys::PARAMETER_SUPPORTED_ENCODINGS, &mut raw)?
            }
            other => other?,
        };
        let entries = <[U32]>::ref_from_bytes(&raw[..size - size % size_of::<U32>()])
            .map_err(|_| Error::ProtocolViolation("misaligned encoding list".to_string()))?;
        Ok(entries.iter().map(|fourcc| Encoding(fourcc.get())).collect())
    }

    pub fn video_profile(&self) -> Result<VideoProfile> {
        let mut value = VideoProfileWire::default();
        self.get_parameter(mmal_sys::PARAMETER_VIDEO_PROFILE, value.as_mut_bytes())?;
        Ok(VideoProfile { profile: value.profile.get(), level: value.level.get() })
    }

    pub fn set_video_profile(&self, profile: VideoProfile) -> Result<()> {
        let value = VideoProfileWire {
            profile: U32::new(profile.profile),
            level: U32::new(profile.level),
        };
        self.set_parameter(mmal_sys::PARAMETER_VIDEO_PROFILE, value.as_bytes())
    }

    /// Changes only the profile half of the profile/level parameter.
    pub fn set_h264_profile(&self, profile: u32) -> Result<()> {
        let current = self.video_profile()?;
        self.set_video_profile(VideoProfile { profile, ..current })
    }

    /// Changes only the level half of the profile/level parameter.
    pub fn set_h264_level(&self, level: u32) -> Result<()> {
        let current = self.video_profile()?;
        self.set_video_profile(VideoProfile { level, ..current })
    }

    /// Target bitrate in bits per second.
    pub fn set_bitrate(&self, bits_per_second: u32) -> Result<()> {
        self.set_parameter_u32(mmal_sys::PARAMETER_VIDEO_BIT_RATE, bits_per_second)
    }

    /// Distance between key frames, in frames.
    pub fn set_intra_period(&self, frames: u32) -> Result<()> {
        self.set_parameter_u32(mmal_sys::PARAMETER_VIDEO_INTRAPERIOD, frames)
    }

    /// One of the `VIDEO_RATECONTROL_*` modes.
    pub fn set_rate_control(&self, mode: u32) -> Result<()> {
        self.set_parameter_u32(mmal_sys::PARAMETER_VIDEO_RATECONTROL, mode)
    }

    pub fn request_key_frame(&self) -> Result<()> {
        self.set_parameter_bool(mmal_sys::PARAMETER_VIDEO_REQUEST_I_FRAME, true)
    }
}
