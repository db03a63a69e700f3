// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Ports: format negotiation, enable/disable, buffer submission and completion.
//!
//! # Locking
//!
//! Each port has four locks, always taken in this order when nested:
//!
//! 1. `on_buffer` (completion callback); held while the callback runs, which
//!    may resubmit
//! 2. `control` (state, format, sizing); never held across a control request
//! 3. `in_flight` (buffers held by the firmware, paired with `drained`)
//! 4. the instance's data-plane lock, inside [`InstanceContext::send_buffer`]
//!
//! The buffers-with-firmware counter changes only under `in_flight`.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Instant,
};

use mmal_sys::{
    BufferHeaderWire, BufferMsg, DriverBuffer, ErrorEvent, FormatChangedEvent,
    MSG_TYPE_BUFFER_FROM_HOST, MSG_TYPE_PORT_ACTION, MSG_TYPE_PORT_INFO_GET,
    MSG_TYPE_PORT_INFO_SET, PortAction, PortInfoGet, PortInfoReply, PortInfoSet, PortWire,
    SHORT_DATA_SIZE, TIME_UNKNOWN, decode_body, encode_message,
};
use tracing::{debug, info, trace, warn};
use zerocopy::{
    FromZeros,
    little_endian::{I64, U32},
};

use crate::{
    Buffer, BufferCompletion, BufferFlags, BufferState, Error, Result, SubmitError,
    buffer::PoolLease,
    event::{BufferCallback, EventCallback, PortEvent},
    format::{BufferRequirements, Encoding, EsType, FormatChange, PortFormat},
    instance::{InstanceContext, Router},
    memory::Mapping,
    sync::{Condvar, Mutex},
};

/// Cookie of the reserved end-of-stream buffer of an input port.
const EOS_COOKIE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Control,
    Input,
    Output,
    Clock,
}

impl PortKind {
    pub(crate) fn from_wire(port_type: u32) -> Option<Self> {
        match port_type {
            mmal_sys::PORT_TYPE_CONTROL => Some(PortKind::Control),
            mmal_sys::PORT_TYPE_INPUT => Some(PortKind::Input),
            mmal_sys::PORT_TYPE_OUTPUT => Some(PortKind::Output),
            mmal_sys::PORT_TYPE_CLOCK => Some(PortKind::Clock),
            _ => None,
        }
    }

    pub(crate) fn to_wire(self) -> u32 {
        match self {
            PortKind::Control => mmal_sys::PORT_TYPE_CONTROL,
            PortKind::Input => mmal_sys::PORT_TYPE_INPUT,
            PortKind::Output => mmal_sys::PORT_TYPE_OUTPUT,
            PortKind::Clock => mmal_sys::PORT_TYPE_CLOCK,
        }
    }
}

/// Lifecycle of a port.
///
/// `Disabled -> Enabling -> Enabled -> Disabling -> Disabled`, and
/// `Destroyed` once the owning component is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
    Destroyed,
}

struct PortControl {
    state: PortState,
    format: PortFormat,
    requirements: BufferRequirements,
    /// A port-info-set is on the wire; the pool cannot be allocated.
    configuring: bool,
}

pub(crate) struct PortInner {
    context: Arc<InstanceContext>,
    component_handle: u32,
    client_component: u32,
    kind: PortKind,
    index: u32,
    handle: u32,
    control: Mutex<PortControl>,
    on_buffer: Mutex<Option<BufferCallback>>,
    on_event: Mutex<Option<EventCallback>>,
    in_flight: Mutex<HashMap<u32, Buffer>>,
    drained: Condvar,
    with_firmware: AtomicU32,
    next_cookie: AtomicU32,
    eos_in_use: AtomicBool,
    eos_reported: AtomicBool,
    pool: Arc<AtomicUsize>,
}

/// One data endpoint of a [`crate::Component`].
///
/// `Port` is a cheap handle; clones refer to the same port. All handles
/// become inert (every operation fails with [`Error::InvalidState`]) once
/// the component is destroyed.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

pub(crate) fn timestamp_to_wire(ns: Option<i64>) -> i64 {
    ns.map_or(TIME_UNKNOWN, |ns| ns / 1000)
}

pub(crate) fn timestamp_from_wire(us: i64) -> Option<i64> {
    if us == TIME_UNKNOWN { None } else { us.checked_mul(1000) }
}

impl Port {
    /// Queries a port of a freshly created component.
    pub(crate) fn query(
        context: &Arc<InstanceContext>,
        component_handle: u32,
        client_component: u32,
        kind: PortKind,
        index: u32,
    ) -> Result<Self> {
        let request = PortInfoGet {
            component_handle: U32::new(component_handle),
            port_type: U32::new(kind.to_wire()),
            index: U32::new(index),
        };
        let reply: PortInfoReply = context.request(MSG_TYPE_PORT_INFO_GET, &request)?;
        Error::from_status(reply.status.get())?;
        if reply.found.get() == 0 {
            return Err(Error::NotFound(format!("{kind:?} port {index}")));
        }

        Ok(Self {
            inner: Arc::new(PortInner {
                context: context.clone(),
                component_handle,
                client_component,
                kind,
                index,
                handle: reply.port_handle.get(),
                control: Mutex::new(PortControl {
                    state: PortState::Disabled,
                    format: PortFormat::from_wire(&reply.format, &reply.video, &reply.extradata),
                    requirements: BufferRequirements::from_wire(&reply.port),
                    configuring: false,
                }),
                on_buffer: Mutex::new(None),
                on_event: Mutex::new(None),
                in_flight: Mutex::new(HashMap::new()),
                drained: Condvar::new(),
                with_firmware: AtomicU32::new(0),
                next_cookie: AtomicU32::new(1),
                eos_in_use: AtomicBool::new(false),
                eos_reported: AtomicBool::new(false),
                pool: Arc::new(AtomicUsize::new(0)),
            }),
        })
    }

    pub fn kind(&self) -> PortKind {
        self.inner.kind
    }

    /// Index among the component's ports of the same kind.
    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// Opaque firmware handle.
    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    pub fn state(&self) -> PortState {
        self.inner.control.lock().state
    }

    /// The format last committed to or announced by the firmware.
    pub fn format(&self) -> PortFormat {
        self.inner.control.lock().format.clone()
    }

    pub fn requirements(&self) -> BufferRequirements {
        self.inner.control.lock().requirements
    }

    /// Number of buffers currently held by the firmware. The reserved
    /// end-of-stream buffer is not counted.
    pub fn buffers_with_firmware(&self) -> u32 {
        self.inner.with_firmware.load(Ordering::Acquire)
    }

    /// `true` while buffers allocated from this port exist.
    pub fn is_busy(&self) -> bool {
        self.inner.pool.load(Ordering::Acquire) > 0
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.state() == PortState::Destroyed {
            return Err(Error::InvalidState(format!("{self} belongs to a destroyed component")));
        }
        Ok(())
    }

    pub(crate) fn context(&self) -> &Arc<InstanceContext> {
        &self.inner.context
    }

    pub(crate) fn component_handle(&self) -> u32 {
        self.inner.component_handle
    }

    /// Claims the port for a format or sizing commit.
    ///
    /// The claim is held until [`Port::commit`] stores the reply; meanwhile
    /// no pool can be allocated and no other commit can start.
    fn begin_configure(&self) -> Result<(PortFormat, BufferRequirements)> {
        let mut control = self.inner.control.lock();
        if control.state != PortState::Disabled {
            return Err(Error::InvalidState(format!(
                "{self} is {:?}, formats change only while disabled",
                control.state
            )));
        }
        if control.configuring || self.is_busy() {
            return Err(Error::Busy);
        }
        control.configuring = true;
        Ok((control.format.clone(), control.requirements))
    }

    fn end_configure(&self) {
        self.inner.control.lock().configuring = false;
    }

    /// Negotiates a new format.
    ///
    /// Legal only while the port is disabled and no buffers allocated from
    /// it are alive, since the pool geometry depends on the format. On
    /// success the recorded format and sizing are what the firmware
    /// confirmed. On failure nothing recorded changes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidFormat`] when the descriptor is inconsistent or the
    ///   firmware rejects it
    /// - [`Error::Busy`] while the buffer pool is allocated or another change
    ///   is being negotiated
    /// - [`Error::InvalidState`] when the port is not disabled
    pub fn set_format(&self, format: &PortFormat) -> Result<()> {
        format.validate()?;
        let (_, requirements) = self.begin_configure()?;
        self.commit(format, &requirements)
    }

    /// Negotiates buffer count and size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] below the firmware minimum, otherwise as
    /// [`Port::set_format`].
    pub fn set_buffer_requirements(&self, num: u32, size: u32) -> Result<()> {
        let (format, mut requirements) = self.begin_configure()?;
        if num < requirements.num_min || size < requirements.size_min {
            self.end_configure();
            return Err(Error::InvalidArg);
        }
        requirements.num = num;
        requirements.size = size;
        self.commit(&format, &requirements)
    }

    /// Sends the port-info-set of a claimed port and records the reply.
    fn commit(&self, format: &PortFormat, requirements: &BufferRequirements) -> Result<()> {
        let reply = self.port_info_set(format, requirements);
        let mut control = self.inner.control.lock();
        control.configuring = false;
        let reply = reply?;
        if self.is_busy() {
            return Err(Error::Busy);
        }
        control.format = PortFormat::from_wire(&reply.format, &reply.video, &reply.extradata);
        control.requirements = BufferRequirements::from_wire(&reply.port);
        debug!(
            "{} format {} {}x{}, {} x {} bytes",
            self,
            control.format.encoding,
            control.format.video.width,
            control.format.video.height,
            control.requirements.num,
            control.requirements.size
        );
        Ok(())
    }

    fn port_info_set(
        &self,
        format: &PortFormat,
        requirements: &BufferRequirements,
    ) -> Result<PortInfoReply> {
        let (es, video, extradata) = format.to_wire();
        let mut port = PortWire {
            port_type: U32::new(self.inner.kind.to_wire()),
            index: U32::new(self.inner.index),
            ..Default::default()
        };
        requirements.write_wire(&mut port);
        let request = PortInfoSet {
            component_handle: U32::new(self.inner.component_handle),
            port_type: U32::new(self.inner.kind.to_wire()),
            port_index: U32::new(self.inner.index),
            port_handle: U32::new(self.inner.handle),
            port,
            format: es,
            video,
            extradata,
        };
        let reply: PortInfoReply = self.inner.context.request(MSG_TYPE_PORT_INFO_SET, &request)?;
        match reply.status.get() {
            mmal_sys::STATUS_SUCCESS => {}
            mmal_sys::STATUS_EINVAL => return Err(Error::InvalidFormat),
            other => Error::from_status(other)?,
        }
        Ok(reply)
    }

    /// Allocates `count` buffers sized for the negotiated format.
    ///
    /// The port counts as busy until every buffer returned here is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] while a format or sizing change is being
    /// negotiated, since the size is not known yet.
    pub fn allocate_buffers(&self, count: u32) -> Result<Vec<Buffer>> {
        self.check_alive()?;
        if count == 0 {
            return Err(Error::InvalidArg);
        }
        let control = self.inner.control.lock();
        if control.configuring {
            return Err(Error::Busy);
        }
        let size = control.requirements.size.max(control.requirements.size_min) as usize;
        Ok((0..count)
            .map(|index| Buffer::pooled(index, size, PoolLease::new(&self.inner.pool)))
            .collect())
    }

    /// Registers the event callback ([`PortEvent`]s of this port).
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: FnMut(&Port, PortEvent) + Send + 'static,
    {
        *self.inner.on_event.lock() = Some(Box::new(callback));
    }

    /// Enables the port.
    ///
    /// Every buffer returned on this port from now on goes to `on_buffer`,
    /// on the instance's dispatch thread. The callback may resubmit buffers
    /// but cannot issue control requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the port is disabled, and
    /// [`Error::Busy`] while its format is being negotiated.
    pub fn enable<F>(&self, on_buffer: F) -> Result<()>
    where
        F: FnMut(&Port, BufferCompletion) + Send + 'static,
    {
        self.inner.context.ensure_control_thread()?;
        {
            let mut control = self.inner.control.lock();
            if control.state != PortState::Disabled {
                return Err(Error::InvalidState(format!(
                    "cannot enable {self} while {:?}",
                    control.state
                )));
            }
            if control.configuring {
                return Err(Error::Busy);
            }
            control.state = PortState::Enabling;
        }
        *self.inner.on_buffer.lock() = Some(Box::new(on_buffer));
        self.inner.eos_reported.store(false, Ordering::Release);

        let result = self.port_action(mmal_sys::PORT_ACTION_ENABLE);
        let mut control = self.inner.control.lock();
        if control.state == PortState::Enabling {
            control.state = if result.is_ok() { PortState::Enabled } else { PortState::Disabled };
        }
        debug!("{} enabled: {:?}", self, result);
        result
    }

    /// Disables the port, draining every buffer the firmware holds.
    ///
    /// The firmware returns outstanding buffers through the completion
    /// callback. The call waits until none are left; each wait that passes
    /// the drain timeout without any buffer coming back ends the drain with
    /// a warning, and the port is disabled regardless. Buffers completing
    /// after that still reach the callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the port is enabled or when
    /// called from a callback, and the firmware's error if it failed the
    /// disable (the port is still marked disabled locally).
    pub fn disable(&self) -> Result<()> {
        self.inner.context.ensure_control_thread()?;
        {
            let mut control = self.inner.control.lock();
            if control.state != PortState::Enabled {
                return Err(Error::InvalidState(format!(
                    "cannot disable {self} while {:?}",
                    control.state
                )));
            }
            control.state = PortState::Disabling;
        }

        let result = self.port_action(mmal_sys::PORT_ACTION_DISABLE);
        if let Err(error) = &result {
            warn!("Firmware failed to disable {}: {}", self, error);
        }
        self.drain();
        // A completion already past the counter finishes its callback first.
        drop(self.inner.on_buffer.lock());

        let mut control = self.inner.control.lock();
        if control.state == PortState::Disabling {
            control.state = PortState::Disabled;
        }
        debug!("{} disabled", self);
        result
    }

    fn drain(&self) {
        let timeout = self.inner.context.config.drain_timeout();
        let mut in_flight = self.inner.in_flight.lock();
        let mut outstanding = self.buffers_with_firmware();
        let mut deadline = Instant::now() + timeout;
        while outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} still has {} buffers with the firmware after {:?}, giving up",
                    self, outstanding, timeout
                );
                break;
            }
            in_flight = self.inner.drained.wait_timeout(in_flight, deadline - now).0;
            let remaining = self.buffers_with_firmware();
            if remaining < outstanding {
                deadline = Instant::now() + timeout;
            }
            outstanding = remaining;
        }
    }

    /// Asks the firmware to return every buffer it holds without disabling
    /// the port. Returned buffers come back empty and complete as
    /// [`BufferState::Error`].
    pub fn flush(&self) -> Result<()> {
        if self.state() != PortState::Enabled {
            return Err(Error::InvalidState(format!("cannot flush {self} while not enabled")));
        }
        self.port_action(mmal_sys::PORT_ACTION_FLUSH)
    }

    fn port_action(&self, action: u32) -> Result<()> {
        let request = PortAction {
            component_handle: U32::new(self.inner.component_handle),
            port_handle: U32::new(self.inner.handle),
            action: U32::new(action),
            ..Default::default()
        };
        self.inner.context.request_status(MSG_TYPE_PORT_ACTION, &request)
    }

    /// Hands a buffer to the firmware.
    ///
    /// Returns as soon as the message is queued; the buffer comes back
    /// through the completion callback. Submissions never wait behind a
    /// control request.
    ///
    /// # Errors
    ///
    /// The buffer is returned inside [`SubmitError`] when the port is not
    /// enabled, a buffer with the same index is already with the firmware,
    /// or the transport fails.
    pub fn submit_buffer(&self, mut buffer: Buffer) -> std::result::Result<(), SubmitError> {
        let control = self.inner.control.lock();
        if control.state != PortState::Enabled {
            let error = Error::InvalidState(format!("cannot submit to {self} while not enabled"));
            return Err(SubmitError { error, buffer });
        }
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.values().any(|held| held.index() == buffer.index()) {
            let error = Error::ProtocolViolation(format!(
                "buffer {} is already with the firmware",
                buffer.index()
            ));
            return Err(SubmitError { error, buffer });
        }

        let config = &self.inner.context.config;
        if config.zero_copy {
            match Mapping::import(&self.inner.context.memory, buffer.bytes()) {
                Ok(mapping) => buffer.mapping = Some(mapping),
                Err(error) => return Err(SubmitError { error, buffer }),
            }
        }
        let inline = !config.zero_copy && buffer.len() <= config.max_inline_payload;
        let cookie = self.next_cookie();
        let message = self.buffer_message(&buffer, cookie, inline);
        trace!("{} submit buffer {} cookie {:#x}, {} bytes", self, buffer.index(), cookie, buffer.len());

        let bulk = (!config.zero_copy && !inline).then(|| buffer.payload());
        // The dispatch thread cannot look the buffer up before `in_flight`
        // is released, so sending ahead of the insert is race-free.
        if let Err(error) = self.inner.context.send_buffer(&message, bulk) {
            if let Err(release_error) = buffer.release_mapping() {
                warn!("Failed to release shared memory of unsent buffer: {}", release_error);
            }
            return Err(SubmitError { error, buffer });
        }
        in_flight.insert(cookie, buffer);
        self.inner.with_firmware.fetch_add(1, Ordering::AcqRel);
        drop(control);
        Ok(())
    }

    /// Submits the port's reserved end-of-stream buffer.
    ///
    /// The reserved buffer never reaches the completion callback and does
    /// not count as a buffer with the firmware.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] while the reserved buffer is still with the
    /// firmware, and [`Error::InvalidState`] on a port that is not an
    /// enabled input.
    pub fn send_end_of_stream(&self) -> Result<()> {
        let control = self.inner.control.lock();
        if self.inner.kind != PortKind::Input || control.state != PortState::Enabled {
            return Err(Error::InvalidState(format!("cannot signal end of stream on {self}")));
        }
        if self.inner.eos_in_use.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        let mut eos = Buffer::new(u32::MAX, 0);
        eos.flags = BufferFlags::EOS;
        let message = self.buffer_message(&eos, EOS_COOKIE, true);
        debug!("{} sending end of stream", self);
        self.inner
            .context
            .send_buffer(&message, None)
            .inspect_err(|_| self.inner.eos_in_use.store(false, Ordering::Release))
    }

    fn next_cookie(&self) -> u32 {
        loop {
            let cookie = self.inner.next_cookie.fetch_add(1, Ordering::Relaxed);
            if cookie != 0 && cookie != EOS_COOKIE {
                return cookie;
            }
        }
    }

    fn buffer_message(&self, buffer: &Buffer, cookie: u32, inline: bool) -> Vec<u8> {
        let mut msg = BufferMsg::new_zeroed();
        msg.drvbuf = DriverBuffer {
            magic: U32::new(mmal_sys::DRIVER_BUFFER_MAGIC),
            client_component: U32::new(self.inner.client_component),
            port_handle: U32::new(self.inner.handle),
            cookie: U32::new(cookie),
        };
        let handle = buffer.mapping.as_ref().and_then(Mapping::handle);
        msg.buffer_header = BufferHeaderWire {
            cmd: U32::new(0),
            data: U32::new(handle.map_or(0, |handle| handle.0)),
            alloc_size: U32::new(buffer.capacity() as u32),
            length: U32::new(buffer.len() as u32),
            offset: U32::new(0),
            flags: U32::new(buffer.flags.bits()),
            pts: I64::new(timestamp_to_wire(buffer.pts)),
            dts: I64::new(timestamp_to_wire(buffer.dts)),
        };
        msg.is_zero_copy = U32::new(handle.is_some() as u32);
        if inline {
            msg.payload_in_message = U32::new(1);
            msg.short_data[..buffer.len()].copy_from_slice(buffer.payload());
        }
        encode_message(MSG_TYPE_BUFFER_FROM_HOST, 0, &msg)
    }

    /// Handles a buffer the firmware returned on this port.
    pub(crate) fn complete_buffer(&self, status: u32, msg: &BufferMsg, router: &Router) {
        let cookie = msg.drvbuf.cookie.get();
        let header = &msg.buffer_header;
        if cookie == EOS_COOKIE {
            if self.inner.eos_in_use.swap(false, Ordering::AcqRel) {
                debug!("{} end-of-stream buffer returned", self);
            } else {
                warn!("{} end-of-stream buffer returned twice", self);
            }
            return;
        }
        if status == mmal_sys::STATUS_SUCCESS && header.cmd.get() != 0 {
            let length = (header.length.get() as usize).min(SHORT_DATA_SIZE);
            let payload: &[u8] =
                if msg.payload_in_message.get() != 0 { &msg.short_data[..length] } else { &[] };
            self.handle_command(header.cmd.get(), payload);
            return;
        }

        let mut on_buffer = self.inner.on_buffer.lock();
        let Some(mut buffer) = self.take_in_flight(cookie) else {
            warn!("{} dropping completion for unknown buffer cookie {:#x}", self, cookie);
            return;
        };
        if let Err(error) = buffer.release_mapping() {
            warn!("{} failed to release shared memory: {}", self, error);
        }
        let state = if status != mmal_sys::STATUS_SUCCESS {
            debug!("{} buffer {} returned with status {}", self, buffer.index(), status);
            BufferState::Error
        } else {
            self.read_payload(&mut buffer, msg, router)
        };
        let end_of_stream = state == BufferState::Done && buffer.is_last();
        trace!("{} buffer {} {:?}, {} bytes", self, buffer.index(), state, buffer.len());

        match on_buffer.as_mut() {
            Some(callback) => callback(self, BufferCompletion { buffer, state }),
            None => warn!("{} has no completion callback, dropping buffer", self),
        }
        drop(on_buffer);

        if end_of_stream && !self.inner.eos_reported.swap(true, Ordering::AcqRel) {
            self.raise(PortEvent::EndOfStream);
        }
    }

    fn take_in_flight(&self, cookie: u32) -> Option<Buffer> {
        let mut in_flight = self.inner.in_flight.lock();
        let buffer = in_flight.remove(&cookie)?;
        self.inner.with_firmware.fetch_sub(1, Ordering::AcqRel);
        self.inner.drained.notify_all();
        Some(buffer)
    }

    fn read_payload(&self, buffer: &mut Buffer, msg: &BufferMsg, router: &Router) -> BufferState {
        let header = &msg.buffer_header;
        let length = header.length.get() as usize;
        buffer.flags = BufferFlags::from_bits_retain(header.flags.get());
        buffer.pts = timestamp_from_wire(header.pts.get());
        buffer.dts = timestamp_from_wire(header.dts.get());
        buffer.set_last(false);
        if length > buffer.capacity() {
            warn!("{} returned {} bytes into a {} byte buffer", self, length, buffer.capacity());
            return BufferState::Error;
        }

        // Input buffers come back consumed; only outputs carry data home.
        if self.inner.kind == PortKind::Output && length > 0 {
            if msg.payload_in_message.get() != 0 {
                if length > SHORT_DATA_SIZE {
                    warn!("{} inline payload of {} bytes", self, length);
                    return BufferState::Error;
                }
                buffer.bytes_mut()[..length].copy_from_slice(&msg.short_data[..length]);
            } else if msg.is_zero_copy.get() == 0
                && let Err(error) = router.bulk_receive(&mut buffer.bytes_mut()[..length])
            {
                warn!("{} bulk receive of {} bytes failed: {}", self, length, error);
                return BufferState::Error;
            }
        }
        buffer.set_len(length);

        let end_of_stream = buffer.flags.contains(BufferFlags::EOS);
        if length == 0 && !end_of_stream {
            debug!("{} empty buffer {} without end of stream", self, buffer.index());
            return BufferState::Error;
        }
        if end_of_stream {
            buffer.set_last(true);
        }
        BufferState::Done
    }

    /// Handles an in-band command or event addressed to this port.
    pub(crate) fn handle_command(&self, cmd: u32, payload: &[u8]) {
        match cmd {
            mmal_sys::EVENT_FORMAT_CHANGED => self.format_changed(payload),
            mmal_sys::EVENT_EOS => {
                if !self.inner.eos_reported.swap(true, Ordering::AcqRel) {
                    self.raise(PortEvent::EndOfStream);
                }
            }
            mmal_sys::EVENT_ERROR => {
                let status = decode_body::<ErrorEvent>(payload).map_or(0, |event| event.status.get());
                warn!("{} firmware error event, status {}", self, status);
                self.raise(PortEvent::Error(status));
            }
            other => debug!("{} ignoring event {}", self, mmal_sys::fourcc_to_string(other)),
        }
    }

    fn format_changed(&self, payload: &[u8]) {
        let Some(event) = decode_body::<FormatChangedEvent>(payload) else {
            warn!("{} dropping truncated format change of {} bytes", self, payload.len());
            return;
        };
        let change = FormatChange::from_wire(&event);
        if change.format.es_type != EsType::Video {
            debug!("{} ignoring format change of a {:?} stream", self, change.format.es_type);
            return;
        }

        let enabled = {
            let mut control = self.inner.control.lock();
            if control.state == PortState::Destroyed {
                return;
            }
            if change.format.encoding != Encoding::UNKNOWN {
                control.format.encoding = change.format.encoding;
                control.format.encoding_variant = change.format.encoding_variant;
            }
            control.format.es_type = EsType::Video;
            control.format.video = change.format.video;
            let requirements = &mut control.requirements;
            requirements.num_min = change.buffer_num_min;
            requirements.size_min = change.buffer_size_min;
            requirements.num_recommended = change.buffer_num_recommended;
            requirements.size_recommended = change.buffer_size_recommended;
            control.state == PortState::Enabled
        };

        if enabled {
            info!(
                "{} source changed to {}x{}",
                self, change.format.video.width, change.format.video.height
            );
            self.raise(PortEvent::SourceChanged(change));
        } else {
            debug!("{} format updated, source change not raised while not enabled", self);
        }
    }

    fn raise(&self, event: PortEvent) {
        if let Some(callback) = self.inner.on_event.lock().as_mut() {
            callback(self, event);
        }
    }

    /// Marks the port destroyed and releases whatever the firmware still holds.
    pub(crate) fn invalidate(&self) {
        self.inner.control.lock().state = PortState::Destroyed;
        let stranded: Vec<Buffer> = {
            let mut in_flight = self.inner.in_flight.lock();
            self.inner.with_firmware.store(0, Ordering::Release);
            self.inner.drained.notify_all();
            in_flight.drain().map(|(_, buffer)| buffer).collect()
        };
        if !stranded.is_empty() {
            warn!("{} released {} buffers still held by the firmware", self, stranded.len());
        }
        for mut buffer in stranded {
            if let Err(error) = buffer.release_mapping() {
                warn!("{} failed to release shared memory: {}", self, error);
            }
        }
        self.inner.eos_in_use.store(false, Ordering::Release);
        *self.inner.on_buffer.lock() = None;
        *self.inner.on_event.lock() = None;
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} port {} ({:#x})", self.inner.kind, self.inner.index, self.inner.handle)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("kind", &self.inner.kind)
            .field("index", &self.inner.index)
            .field("handle", &self.inner.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_convert_between_units() {
        assert_eq!(timestamp_to_wire(Some(1_500_000)), 1_500);
        assert_eq!(timestamp_to_wire(None), TIME_UNKNOWN);
        assert_eq!(timestamp_from_wire(1_500), Some(1_500_000));
        assert_eq!(timestamp_from_wire(TIME_UNKNOWN), None);
        assert_eq!(timestamp_from_wire(i64::MAX), None);
    }
}
