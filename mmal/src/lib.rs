// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! # MMAL - host side of the multimedia abstraction layer
//!
//! Safe, idiomatic Rust client for the MMAL component protocol spoken by the
//! VideoCore firmware, plus the firmware's audio service. Media-device
//! adapters (codec, ISP, audio) use it to drive remote processing
//! components over a message channel.
//!
//! ## Overview
//!
//! Everything runs over a [`channel::MessageChannel`]: ordered messages per
//! service plus bulk transfers. Raw wire structures live in [`mmal_sys`];
//! this crate adds request/response correlation, component and port
//! lifecycles, buffer accounting and teardown.
//!
//! ### Key Concepts
//!
//! - **Instance**: one open MMAL service and its dispatch thread ([`Instance`])
//! - **Component**: a remote processing unit created by name ([`Component`])
//! - **Port**: a typed endpoint of a component with a negotiated format ([`Port`])
//! - **Buffer**: a unit of data owned by exactly one side at a time ([`Buffer`])
//! - **Parameter**: a raw value addressed by id on a port
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐
//! │ Instance │  (one MMAL service, one dispatch thread)
//! └────┬─────┘
//!      │
//!      └─► Component ──► control Port
//!                    ├─► input Ports  ──► submit_buffer ─┐
//!                    └─► output Ports ──► submit_buffer ─┤
//!                                                        ▼
//!                                        firmware ─► completion callback
//! ```
//!
//! Control requests (create, format, enable, parameters) are synchronous and
//! bounded by [`config::Config::request_timeout_ms`]. Buffer submission is
//! asynchronous; completions and port events run on the dispatch thread,
//! in submission order per port.
//!
//! ## Examples
//!
//! ### Decoding against the loopback firmware
//!
//! The in-process firmware double lives behind the `loopback` feature.
//!
//! ```
//! use std::sync::{Arc, mpsc};
//!
//! use mmal::{
//!     Buffer, BufferState, Instance, PortFormat,
//!     config::Config,
//!     format::Encoding,
//!     loopback::{CountingMemory, LoopbackFirmware},
//! };
//!
//! # fn main() -> Result<(), mmal::Error> {
//! let firmware = Arc::new(LoopbackFirmware::with_video_components());
//! let config = Config { zero_copy: false, ..Config::default() };
//! let instance = Instance::new(firmware, Arc::new(CountingMemory::default()), config)?;
//! let decoder = instance.create_component("ril.video_decode")?;
//!
//! let input = decoder.input(0)?;
//! let output = decoder.output(0)?;
//! input.set_format(&PortFormat::compressed_video(Encoding::H264))?;
//! output.set_format(&PortFormat::video(Encoding::I420, 64, 64))?;
//!
//! let (frames, decoded) = mpsc::channel();
//! decoder.enable()?;
//! output.enable(move |_, completion| {
//!     let _ = frames.send(completion);
//! })?;
//! input.enable(|_, _| {})?;
//!
//! output.submit_buffer(Buffer::new(0, 64 * 64 * 3 / 2)).map_err(mmal::Error::from)?;
//! let mut access_unit = Buffer::new(0, 4096);
//! access_unit.fill(&[0, 0, 0, 1, 0x65]);
//! input.submit_buffer(access_unit).map_err(mmal::Error::from)?;
//!
//! let frame = decoded.recv().expect("decoded frame");
//! assert_eq!(frame.state, BufferState::Done);
//!
//! input.disable()?;
//! output.disable()?;
//! decoder.destroy()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - [`Instance`], [`Component`] and [`Port`] are `Send + Sync` handles
//! - Control requests are serialised per instance; buffer submissions never
//!   wait behind them
//! - Callbacks may resubmit buffers but must not issue control requests,
//!   which fail with [`Error::InvalidState`] on the dispatch thread

mod buffer;
mod component;
mod error;
mod event;
mod instance;
mod param;
mod port;
mod request;
mod sync;

pub mod audio;
pub mod channel;
pub mod config;
pub mod format;
#[cfg(feature = "loopback")]
pub mod loopback;
pub mod m2m;
pub mod memory;
pub mod role;

pub use buffer::{Buffer, BufferCompletion, BufferFlags, BufferState};
pub use component::Component;
pub use error::{Error, Result, SubmitError};
pub use event::{BufferCallback, EventCallback, PortEvent};
pub use format::{BufferRequirements, FormatChange, PortFormat};
pub use instance::{FirmwareVersion, Instance};
pub use param::VideoProfile;
pub use port::{Port, PortKind, PortState};
