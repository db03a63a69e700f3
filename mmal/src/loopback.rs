// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! An in-process firmware for tests and demos.
//!
//! [`LoopbackFirmware`] implements [`MessageChannel`] and answers the MMAL
//! and audio protocols from memory. Components are registered by name with
//! a [`ComponentSpec`]. Input buffers are consumed as soon as they arrive;
//! a component in passthrough mode copies each consumed input into the next
//! output buffer, otherwise output buffers stay held until the test produces
//! data with [`LoopbackFirmware::produce_output`].
//!
//! A set of switches injects the failures the host must survive: a firmware
//! that stops answering, replies that arrive after the host gave up, ports
//! that keep their buffers across a disable, and refused sends.
//!
//! [`CountingMemory`] is the matching [`MemorySharing`] double; it records
//! every import and release so tests can check that each handle is given
//! back exactly once.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use mmal_sys::{
    BufferMsg, ComponentCreate, ComponentCreateReply, ComponentHandleMsg, ErrorEvent,
    EsFormatWire, EventToHost, FORMAT_EXTRADATA_SIZE, FormatChangedEvent, GetVersionReply,
    MsgHeader, PARAMETER_HEADER_SIZE, PARAMETER_SPACE, ParameterGet, ParameterGetReply,
    ParameterSet, PortAction, PortInfoGet, PortInfoReply, PortInfoSet, PortWire, SHORT_DATA_SIZE,
    StatusReply, VideoFormatWire,
    audio::{
        AUDIO_MSG_CLOSE, AUDIO_MSG_COMPLETE, AUDIO_MSG_CONFIG, AUDIO_MSG_CONTROL,
        AUDIO_MSG_RESULT, AUDIO_MSG_WRITE, AUDIO_WRITE_COOKIE1, AUDIO_WRITE_COOKIE2,
        AudioComplete, AudioMsg, AudioResult, AudioWrite,
    },
    decode_body, decode_header, encode_message, encode_reply,
};
use tracing::{debug, trace, warn};
use zerocopy::{
    FromZeros, Immutable, IntoBytes,
    little_endian::{I32, I64, U32},
};

use crate::{
    BufferFlags, Error, Result,
    channel::{BulkTransfer, MessageChannel, ReceiveCallback, ServiceHandle, ServiceId},
    format::{self, Encoding},
    memory::{MemHandle, MemorySharing},
    sync::Mutex,
};

/// Row alignment the loopback applies to raw images.
const IMAGE_ALIGN: u32 = 32;

/// Shape of a component the loopback can create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub inputs: u32,
    pub outputs: u32,
    pub clocks: u32,
    /// Encodings input ports accept; empty accepts anything.
    pub input_encodings: Vec<Encoding>,
    /// Encodings output ports accept; empty accepts anything.
    pub output_encodings: Vec<Encoding>,
    /// Copy every consumed input into the first output port.
    pub passthrough: bool,
    /// Minimum buffer count of every port.
    pub buffer_num_min: u32,
    /// Minimum buffer size of ports carrying compressed data.
    pub buffer_size_min: u32,
}

impl ComponentSpec {
    pub fn new(inputs: u32, outputs: u32) -> Self {
        Self {
            inputs,
            outputs,
            clocks: 0,
            input_encodings: Vec::new(),
            output_encodings: Vec::new(),
            passthrough: false,
            buffer_num_min: 1,
            buffer_size_min: 4096,
        }
    }

    pub fn with_encodings(mut self, input: &[Encoding], output: &[Encoding]) -> Self {
        self.input_encodings = input.to_vec();
        self.output_encodings = output.to_vec();
        self
    }

    pub fn with_passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    pub fn with_clocks(mut self, clocks: u32) -> Self {
        self.clocks = clocks;
        self
    }
}

/// Output produced from a consumed input, waiting for an output buffer.
struct Work {
    payload: Vec<u8>,
    flags: u32,
    pts: i64,
    dts: i64,
}

struct FakePort {
    handle: u32,
    port_type: u32,
    index: u32,
    enabled: bool,
    port: PortWire,
    es: EsFormatWire,
    video: VideoFormatWire,
    extradata: [u8; FORMAT_EXTRADATA_SIZE],
    encodings: Vec<u32>,
    params: HashMap<u32, Vec<u8>>,
    held: VecDeque<BufferMsg>,
}

impl FakePort {
    fn new(handle: u32, port_type: u32, index: u32, encodings: &[Encoding], spec: &ComponentSpec) -> Self {
        let mut port = PortWire {
            port_type: U32::new(port_type),
            index: U32::new(index),
            index_all: U32::new(handle & 0xff),
            buffer_num_min: U32::new(spec.buffer_num_min),
            buffer_size_min: U32::new(spec.buffer_size_min),
            buffer_alignment_min: U32::new(16),
            buffer_num_recommended: U32::new(spec.buffer_num_min.max(3)),
            buffer_size_recommended: U32::new(spec.buffer_size_min),
            ..Default::default()
        };
        port.buffer_num = port.buffer_num_recommended;
        port.buffer_size = port.buffer_size_recommended;
        let es = EsFormatWire {
            es_type: U32::new(mmal_sys::ES_TYPE_VIDEO),
            encoding: U32::new(encodings.first().map_or(mmal_sys::ENCODING_UNKNOWN, |e| e.0)),
            ..Default::default()
        };
        Self {
            handle,
            port_type,
            index,
            enabled: false,
            port,
            es,
            video: VideoFormatWire::default(),
            extradata: [0; FORMAT_EXTRADATA_SIZE],
            encodings: encodings.iter().map(|encoding| encoding.0).collect(),
            params: HashMap::new(),
            held: VecDeque::new(),
        }
    }

    fn info_reply(&self, component_handle: u32) -> PortInfoReply {
        let mut reply = PortInfoReply::new_zeroed();
        reply.component_handle = U32::new(component_handle);
        reply.port_type = U32::new(self.port_type);
        reply.port_index = U32::new(self.index);
        reply.port_handle = U32::new(self.handle);
        reply.found = U32::new(1);
        reply.port = self.port;
        reply.port.is_enabled = U32::new(self.enabled.into());
        reply.format = self.es;
        reply.video = self.video;
        reply.extradata = self.extradata;
        reply
    }

    /// Buffer size the current format needs at minimum.
    fn required_size(&self, fallback: u32) -> u32 {
        let encoding = Encoding(self.es.encoding.get());
        if encoding.is_compressed() {
            return fallback;
        }
        format::image_size(encoding, self.video.width.get(), self.video.height.get(), IMAGE_ALIGN)
            .unwrap_or(fallback)
    }
}

struct FakeComponent {
    client_component: u32,
    name: String,
    enabled: bool,
    passthrough: bool,
    size_min: u32,
    /// Control port first, then inputs, outputs and clocks.
    ports: Vec<FakePort>,
    pending: VecDeque<Work>,
}

impl FakeComponent {
    fn first_output(&self) -> Option<usize> {
        self.ports.iter().position(|port| port.port_type == mmal_sys::PORT_TYPE_OUTPUT)
    }
}

#[derive(Default)]
struct AudioState {
    /// Inline bytes still expected for the current write.
    inline_remaining: usize,
    inline_total: usize,
    /// A bulk write of this many bytes is expected next.
    bulk_expected: Option<usize>,
    bytes_written: usize,
    packets: usize,
    bulk_transfers: usize,
    result: i32,
}

#[derive(Default)]
struct State {
    services: HashMap<u32, (ServiceId, Arc<ReceiveCallback>)>,
    next_service: u32,
    specs: HashMap<String, ComponentSpec>,
    components: HashMap<u32, FakeComponent>,
    next_component: u32,
    max_components: Option<usize>,
    unresponsive: bool,
    fail_sends: bool,
    defer_replies: bool,
    keep_buffers_on_disable: bool,
    deferred: Vec<(u32, Vec<u8>)>,
    outbox: Vec<(u32, Vec<u8>)>,
    /// Payloads of buffer messages whose data follows as a bulk transfer.
    to_host_bulk: VecDeque<Vec<u8>>,
    /// Host-to-firmware bulk transfer announced by the last buffer message.
    from_host_bulk: Option<(u32, BufferMsg)>,
    bulk_bytes_received: usize,
    received: HashMap<u32, usize>,
    peer_version: u32,
    audio: AudioState,
}

/// Firmware double speaking MMAL and the audio protocol over an in-memory
/// channel.
pub struct LoopbackFirmware {
    state: Mutex<State>,
}

impl Default for LoopbackFirmware {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFirmware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_service: 1,
                next_component: 1,
                peer_version: 2,
                ..Default::default()
            }),
        }
    }

    /// A firmware offering the decoder, encoder and ISP components.
    pub fn with_video_components() -> Self {
        let compressed = [Encoding::H264, Encoding::MJPEG, Encoding::MP4V, Encoding::MP2V, Encoding::VP8];
        let raw = [Encoding::I420, Encoding::YV12, Encoding::NV12, Encoding::NV21, Encoding::RGBA];
        let firmware = Self::new();
        firmware.register_component(
            "ril.video_decode",
            ComponentSpec::new(1, 1).with_encodings(&compressed, &raw).with_passthrough(),
        );
        firmware.register_component(
            "ril.video_encode",
            ComponentSpec::new(1, 1).with_encodings(&raw, &compressed).with_passthrough(),
        );
        firmware.register_component(
            "ril.isp",
            ComponentSpec::new(1, 3).with_encodings(&raw, &raw).with_passthrough(),
        );
        firmware
    }

    pub fn register_component(&self, name: &str, spec: ComponentSpec) {
        self.state.lock().specs.insert(name.to_string(), spec);
    }

    /// Fails component creation with `ENOMEM` beyond `max` live components.
    pub fn set_max_components(&self, max: usize) {
        self.state.lock().max_components = Some(max);
    }

    /// Stops answering anything on the MMAL service.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().unresponsive = unresponsive;
    }

    /// Makes every send fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Holds control replies and audio results back until
    /// [`LoopbackFirmware::flush_deferred`].
    pub fn set_defer_replies(&self, defer: bool) {
        self.state.lock().defer_replies = defer;
    }

    /// Keeps held buffers when a port is disabled or flushed.
    pub fn set_keep_buffers_on_disable(&self, keep: bool) {
        self.state.lock().keep_buffers_on_disable = keep;
    }

    /// Protocol version announced to the audio client.
    pub fn set_peer_version(&self, version: u32) {
        self.state.lock().peer_version = version;
    }

    /// Value the audio service answers requests with; zero is success.
    pub fn set_audio_result(&self, result: i32) {
        self.state.lock().audio.result = result;
    }

    /// Number of replies currently held back.
    pub fn deferred_replies(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Delivers the replies held back so far.
    pub fn flush_deferred(&self) {
        self.deliver(|state| {
            let deferred = std::mem::take(&mut state.deferred);
            state.outbox.extend(deferred);
        });
    }

    /// Number of messages of `msg_type` the host sent on the MMAL service.
    pub fn messages_received(&self, msg_type: u32) -> usize {
        self.state.lock().received.get(&msg_type).copied().unwrap_or(0)
    }

    /// Bytes the host moved with bulk transfers on the MMAL service.
    pub fn bulk_bytes_received(&self) -> usize {
        self.state.lock().bulk_bytes_received
    }

    /// Number of components currently alive.
    pub fn component_count(&self) -> usize {
        self.state.lock().components.len()
    }

    /// Number of buffers held on the port with firmware handle `port`.
    pub fn held_count(&self, port: u32) -> usize {
        let state = self.state.lock();
        state.port(port).map_or(0, |port| port.held.len())
    }

    /// `true` if the port with handle `port` is enabled on the firmware side.
    pub fn is_port_enabled(&self, port: u32) -> bool {
        self.state.lock().port(port).is_some_and(|port| port.enabled)
    }

    /// Raw value of a parameter the host set on `port`.
    pub fn parameter(&self, port: u32, id: u32) -> Option<Vec<u8>> {
        self.state.lock().port(port).and_then(|port| port.params.get(&id).cloned())
    }

    /// Audio bytes received, inline or bulk.
    pub fn audio_bytes_written(&self) -> usize {
        self.state.lock().audio.bytes_written
    }

    /// Inline audio data packets received.
    pub fn audio_packets(&self) -> usize {
        self.state.lock().audio.packets
    }

    /// Audio bulk transfers received.
    pub fn audio_bulk_transfers(&self) -> usize {
        self.state.lock().audio.bulk_transfers
    }

    /// Returns the oldest held buffer of `port` filled with `payload`.
    ///
    /// Payloads up to the short-data size travel in the message, larger ones
    /// as a bulk transfer the host pulls. Returns `false` when no buffer is
    /// held.
    pub fn produce_output(&self, port: u32, payload: &[u8], flags: BufferFlags, pts_us: i64) -> bool {
        let mut produced = false;
        self.deliver(|state| {
            let work = Work { payload: payload.to_vec(), flags: flags.bits(), pts: pts_us, dts: pts_us };
            produced = state.produce(port, &work);
        });
        produced
    }

    /// Returns every held buffer of `port` empty, as a flush would.
    pub fn return_held(&self, port: u32) -> usize {
        let mut returned = 0;
        self.deliver(|state| returned = state.return_held(port));
        returned
    }

    /// Announces new stream properties on `port`.
    pub fn emit_format_changed(&self, port: u32, width: u32, height: u32) {
        self.deliver(|state| state.format_changed(port, width, height));
    }

    /// Reports an asynchronous firmware error on `port`, in-band.
    pub fn emit_error(&self, port: u32, status: u32) {
        self.deliver(|state| {
            let Some((client_component, _)) = state.owner(port) else {
                return;
            };
            let event = ErrorEvent { status: U32::new(status) };
            let mut msg = BufferMsg::new_zeroed();
            msg.drvbuf.magic = U32::new(mmal_sys::DRIVER_BUFFER_MAGIC);
            msg.drvbuf.client_component = U32::new(client_component);
            msg.drvbuf.port_handle = U32::new(port);
            msg.buffer_header.cmd = U32::new(mmal_sys::EVENT_ERROR);
            msg.buffer_header.length = U32::new(size_of::<ErrorEvent>() as u32);
            msg.payload_in_message = U32::new(1);
            msg.short_data[..size_of::<ErrorEvent>()].copy_from_slice(event.as_bytes());
            state.notify(mmal_sys::MSG_TYPE_BUFFER_TO_HOST, &msg);
        });
    }

    /// Runs `f` on the state, then hands everything it queued to the host
    /// with the lock released.
    fn deliver<F: FnOnce(&mut State)>(&self, f: F) {
        let messages: Vec<(Arc<ReceiveCallback>, Vec<u8>)> = {
            let mut state = self.state.lock();
            f(&mut state);
            let outbox = std::mem::take(&mut state.outbox);
            outbox
                .into_iter()
                .filter_map(|(handle, message)| {
                    state.services.get(&handle).map(|(_, callback)| (callback.clone(), message))
                })
                .collect()
        };
        for (callback, message) in messages {
            callback(&message);
        }
    }
}

impl State {
    fn mmal_service(&self) -> Option<u32> {
        self.services
            .iter()
            .find(|(_, (id, _))| *id == ServiceId::MMAL)
            .map(|(handle, _)| *handle)
    }

    fn port(&self, handle: u32) -> Option<&FakePort> {
        self.components.get(&(handle >> 8))?.ports.get((handle & 0xff) as usize)
    }

    fn port_mut(&mut self, handle: u32) -> Option<&mut FakePort> {
        self.components.get_mut(&(handle >> 8))?.ports.get_mut((handle & 0xff) as usize)
    }

    /// Client component id and port position of a port handle.
    fn owner(&self, handle: u32) -> Option<(u32, usize)> {
        let component = self.components.get(&(handle >> 8))?;
        let position = (handle & 0xff) as usize;
        (position < component.ports.len()).then_some((component.client_component, position))
    }

    fn reply<T: IntoBytes + Immutable>(&mut self, msg_type: u32, context: u32, body: &T) {
        let Some(service) = self.mmal_service() else {
            return;
        };
        let message = encode_reply(msg_type, context, 0, body);
        if self.defer_replies {
            self.deferred.push((service, message));
        } else {
            self.outbox.push((service, message));
        }
    }

    fn reply_status(&mut self, msg_type: u32, context: u32, status: u32) {
        self.reply(msg_type, context, &StatusReply { status: U32::new(status) });
    }

    fn notify<T: IntoBytes + Immutable>(&mut self, msg_type: u32, body: &T) {
        if let Some(service) = self.mmal_service() {
            self.outbox.push((service, encode_message(msg_type, 0, body)));
        }
    }

    fn handle_mmal(&mut self, message: &[u8]) {
        let Some((header, body)) = decode_header(message) else {
            warn!("Loopback dropping runt message");
            return;
        };
        let msg_type = header.msg_type.get();
        *self.received.entry(msg_type).or_default() += 1;
        if self.unresponsive {
            trace!("Loopback swallowing message type {}", msg_type);
            return;
        }
        let context = header.context.get();
        match msg_type {
            mmal_sys::MSG_TYPE_GET_VERSION => {
                let reply = GetVersionReply {
                    flags: U32::new(0),
                    major: U32::new(0),
                    minor: U32::new(4),
                    minimum: U32::new(0),
                };
                self.reply(msg_type, context, &reply);
            }
            mmal_sys::MSG_TYPE_COMPONENT_CREATE => self.component_create(&header, body),
            mmal_sys::MSG_TYPE_COMPONENT_DESTROY
            | mmal_sys::MSG_TYPE_COMPONENT_ENABLE
            | mmal_sys::MSG_TYPE_COMPONENT_DISABLE => {
                let status = match decode_body::<ComponentHandleMsg>(body) {
                    Some(request) => self.component_state(msg_type, request.component_handle.get()),
                    None => mmal_sys::STATUS_EINVAL,
                };
                self.reply_status(msg_type, context, status);
            }
            mmal_sys::MSG_TYPE_PORT_INFO_GET => self.port_info_get(&header, body),
            mmal_sys::MSG_TYPE_PORT_INFO_SET => self.port_info_set(&header, body),
            mmal_sys::MSG_TYPE_PORT_ACTION => {
                let status = match decode_body::<PortAction>(body) {
                    Some(action) => self.port_action(&action),
                    None => mmal_sys::STATUS_EINVAL,
                };
                self.reply_status(msg_type, context, status);
            }
            mmal_sys::MSG_TYPE_PORT_PARAMETER_SET => {
                let status = match decode_body::<ParameterSet>(body) {
                    Some(request) => self.parameter_set(&request),
                    None => mmal_sys::STATUS_EINVAL,
                };
                self.reply_status(msg_type, context, status);
            }
            mmal_sys::MSG_TYPE_PORT_PARAMETER_GET => self.parameter_get(&header, body),
            mmal_sys::MSG_TYPE_BUFFER_FROM_HOST => self.buffer_from_host(body),
            other => {
                debug!("Loopback does not implement message type {}", other);
                self.reply_status(other, context, mmal_sys::STATUS_ENOSYS);
            }
        }
    }

    fn component_create(&mut self, header: &MsgHeader, body: &[u8]) {
        let msg_type = header.msg_type.get();
        let context = header.context.get();
        let mut reply = ComponentCreateReply::new_zeroed();
        let Some(request) = decode_body::<ComponentCreate>(body) else {
            reply.status = U32::new(mmal_sys::STATUS_EINVAL);
            return self.reply(msg_type, context, &reply);
        };
        let end = request.name.iter().position(|b| *b == 0).unwrap_or(request.name.len());
        let name = String::from_utf8_lossy(&request.name[..end]).into_owned();
        let Some(spec) = self.specs.get(&name).cloned() else {
            reply.status = U32::new(mmal_sys::STATUS_ENOENT);
            return self.reply(msg_type, context, &reply);
        };
        if self.max_components.is_some_and(|max| self.components.len() >= max) {
            reply.status = U32::new(mmal_sys::STATUS_ENOMEM);
            return self.reply(msg_type, context, &reply);
        }

        let handle = self.next_component;
        self.next_component += 1;
        let mut ports = vec![FakePort::new(handle << 8, mmal_sys::PORT_TYPE_CONTROL, 0, &[], &spec)];
        let groups = [
            (mmal_sys::PORT_TYPE_INPUT, spec.inputs, &spec.input_encodings),
            (mmal_sys::PORT_TYPE_OUTPUT, spec.outputs, &spec.output_encodings),
            (mmal_sys::PORT_TYPE_CLOCK, spec.clocks, &Vec::new()),
        ];
        for (port_type, count, encodings) in groups {
            for index in 0..count {
                let port_handle = (handle << 8) | ports.len() as u32;
                ports.push(FakePort::new(port_handle, port_type, index, encodings, &spec));
            }
        }
        debug!("Loopback created {} as {:#x}", name, handle);
        self.components.insert(
            handle,
            FakeComponent {
                client_component: request.client_component.get(),
                name,
                enabled: false,
                passthrough: spec.passthrough,
                size_min: spec.buffer_size_min,
                ports,
                pending: VecDeque::new(),
            },
        );
        reply.component_handle = U32::new(handle);
        reply.input_num = U32::new(spec.inputs);
        reply.output_num = U32::new(spec.outputs);
        reply.clock_num = U32::new(spec.clocks);
        self.reply(msg_type, context, &reply);
    }

    fn component_state(&mut self, msg_type: u32, handle: u32) -> u32 {
        if msg_type == mmal_sys::MSG_TYPE_COMPONENT_DESTROY {
            return match self.components.remove(&handle) {
                Some(component) => {
                    debug!("Loopback destroyed {}", component.name);
                    mmal_sys::STATUS_SUCCESS
                }
                None => mmal_sys::STATUS_ENOENT,
            };
        }
        let Some(component) = self.components.get_mut(&handle) else {
            return mmal_sys::STATUS_ENOENT;
        };
        component.enabled = msg_type == mmal_sys::MSG_TYPE_COMPONENT_ENABLE;
        mmal_sys::STATUS_SUCCESS
    }

    fn port_info_get(&mut self, header: &MsgHeader, body: &[u8]) {
        let msg_type = header.msg_type.get();
        let context = header.context.get();
        let mut reply = PortInfoReply::new_zeroed();
        let found = decode_body::<PortInfoGet>(body).and_then(|request| {
            let handle = request.component_handle.get();
            let port = self.components.get(&handle)?.ports.iter().find(|port| {
                port.port_type == request.port_type.get() && port.index == request.index.get()
            })?;
            Some(port.info_reply(handle))
        });
        match found {
            Some(found) => reply = found,
            None => reply.status = U32::new(mmal_sys::STATUS_SUCCESS),
        }
        self.reply(msg_type, context, &reply);
    }

    fn port_info_set(&mut self, header: &MsgHeader, body: &[u8]) {
        let msg_type = header.msg_type.get();
        let context = header.context.get();
        let mut reply = PortInfoReply::new_zeroed();
        let Some(request) = decode_body::<PortInfoSet>(body) else {
            reply.status = U32::new(mmal_sys::STATUS_EINVAL);
            return self.reply(msg_type, context, &reply);
        };
        let component_handle = request.component_handle.get();
        let size_min = self.components.get(&component_handle).map_or(0, |c| c.size_min);
        let Some(port) = self.port_mut(request.port_handle.get()) else {
            reply.status = U32::new(mmal_sys::STATUS_ENOENT);
            return self.reply(msg_type, context, &reply);
        };
        let encoding = request.format.encoding.get();
        if encoding == mmal_sys::ENCODING_UNKNOWN
            || (!port.encodings.is_empty() && !port.encodings.contains(&encoding))
        {
            reply.status = U32::new(mmal_sys::STATUS_EINVAL);
            return self.reply(msg_type, context, &reply);
        }
        if port.enabled {
            reply.status = U32::new(mmal_sys::STATUS_EINVAL);
            return self.reply(msg_type, context, &reply);
        }

        port.es = request.format;
        port.video = request.video;
        port.extradata = request.extradata;
        let required = port.required_size(size_min);
        port.port.buffer_size_min = U32::new(required);
        port.port.buffer_size_recommended = U32::new(required);
        let num_min = port.port.buffer_num_min.get();
        port.port.buffer_num = U32::new(request.port.buffer_num.get().max(num_min));
        port.port.buffer_size = U32::new(request.port.buffer_size.get().max(required));
        let reply = port.info_reply(component_handle);
        self.reply(msg_type, context, &reply);
    }

    fn port_action(&mut self, action: &PortAction) -> u32 {
        let handle = action.port_handle.get();
        let keep = self.keep_buffers_on_disable;
        let Some(port) = self.port_mut(handle) else {
            return mmal_sys::STATUS_ENOENT;
        };
        match action.action.get() {
            mmal_sys::PORT_ACTION_ENABLE => {
                if port.enabled {
                    return mmal_sys::STATUS_EINVAL;
                }
                port.enabled = true;
            }
            mmal_sys::PORT_ACTION_DISABLE => {
                port.enabled = false;
                if !keep {
                    self.return_held(handle);
                }
                if let Some(component) = self.components.get_mut(&(handle >> 8)) {
                    component.pending.clear();
                }
            }
            mmal_sys::PORT_ACTION_FLUSH => {
                if !keep {
                    self.return_held(handle);
                }
            }
            _ => return mmal_sys::STATUS_ENOSYS,
        }
        mmal_sys::STATUS_SUCCESS
    }

    fn parameter_set(&mut self, request: &ParameterSet) -> u32 {
        let Some(length) = (request.size.get() as usize).checked_sub(PARAMETER_HEADER_SIZE) else {
            return mmal_sys::STATUS_EINVAL;
        };
        if length > PARAMETER_SPACE {
            return mmal_sys::STATUS_EINVAL;
        }
        match self.port_mut(request.port_handle.get()) {
            Some(port) => {
                port.params.insert(request.id.get(), request.value[..length].to_vec());
                mmal_sys::STATUS_SUCCESS
            }
            None => mmal_sys::STATUS_ENOENT,
        }
    }

    fn parameter_get(&mut self, header: &MsgHeader, body: &[u8]) {
        let msg_type = header.msg_type.get();
        let context = header.context.get();
        let mut reply = ParameterGetReply::new_zeroed();
        let value = decode_body::<ParameterGet>(body).and_then(|request| {
            reply.id = request.id;
            let port = self.port(request.port_handle.get())?;
            let value = match request.id.get() {
                mmal_sys::PARAMETER_SUPPORTED_ENCODINGS => {
                    port.encodings.iter().flat_map(|encoding| encoding.to_le_bytes()).collect()
                }
                id => port.params.get(&id)?.clone(),
            };
            let room = (request.size.get() as usize).saturating_sub(PARAMETER_HEADER_SIZE);
            Some((value, room))
        });

        match value {
            None => reply.status = U32::new(mmal_sys::STATUS_ENOENT),
            Some((value, room)) => {
                reply.size = U32::new((PARAMETER_HEADER_SIZE + value.len()) as u32);
                if value.len() > room || value.len() > PARAMETER_SPACE {
                    reply.status = U32::new(mmal_sys::STATUS_ENOSPC);
                } else {
                    reply.value[..value.len()].copy_from_slice(&value);
                }
            }
        }
        self.reply(msg_type, context, &reply);
    }

    fn buffer_from_host(&mut self, body: &[u8]) {
        let Some(msg) = decode_body::<BufferMsg>(body) else {
            warn!("Loopback dropping truncated buffer");
            return;
        };
        let handle = msg.drvbuf.port_handle.get();
        let Some(port) = self.port_mut(handle) else {
            warn!("Loopback dropping buffer for unknown port {:#x}", handle);
            return;
        };
        if !port.enabled {
            let mut returned = msg;
            returned.buffer_header.length = U32::new(0);
            return self.send_buffer(returned, mmal_sys::STATUS_ENOTREADY);
        }
        if port.port_type == mmal_sys::PORT_TYPE_OUTPUT {
            port.held.push_back(msg);
            self.pump(handle >> 8);
            return;
        }

        let header = &msg.buffer_header;
        let length = header.length.get() as usize;
        if msg.payload_in_message.get() == 0 && msg.is_zero_copy.get() == 0 && length > 0 {
            self.from_host_bulk = Some((handle, msg));
            return;
        }
        let payload = if msg.payload_in_message.get() != 0 {
            msg.short_data[..length.min(SHORT_DATA_SIZE)].to_vec()
        } else {
            vec![0; length]
        };
        self.consume(handle, msg, payload);
    }

    /// Returns a consumed input buffer and queues its output.
    fn consume(&mut self, handle: u32, msg: BufferMsg, payload: Vec<u8>) {
        let header = msg.buffer_header;
        let mut returned = msg;
        returned.payload_in_message = U32::new(0);
        self.send_buffer(returned, mmal_sys::STATUS_SUCCESS);

        let component_handle = handle >> 8;
        let Some(component) = self.components.get_mut(&component_handle) else {
            return;
        };
        let end_of_stream = header.flags.get() & BufferFlags::EOS.bits() != 0;
        if (component.passthrough && !payload.is_empty()) || end_of_stream {
            component.pending.push_back(Work {
                payload,
                flags: header.flags.get(),
                pts: header.pts.get(),
                dts: header.dts.get(),
            });
        }
        self.pump(component_handle);
    }

    /// Moves pending output into held output buffers of the first output port.
    fn pump(&mut self, component_handle: u32) {
        loop {
            let Some(component) = self.components.get_mut(&component_handle) else {
                return;
            };
            let Some(position) = component.first_output() else {
                component.pending.clear();
                return;
            };
            let port = &component.ports[position];
            if port.held.is_empty() || !port.enabled {
                return;
            }
            let port_handle = port.handle;
            let Some(work) = component.pending.pop_front() else {
                return;
            };
            self.produce(port_handle, &work);
        }
    }

    fn produce(&mut self, handle: u32, work: &Work) -> bool {
        let Some(mut msg) = self.port_mut(handle).and_then(|port| port.held.pop_front()) else {
            return false;
        };
        let length = work.payload.len().min(msg.buffer_header.alloc_size.get() as usize);
        let header = &mut msg.buffer_header;
        header.length = U32::new(length as u32);
        header.flags = U32::new(work.flags);
        header.pts = I64::new(work.pts);
        header.dts = I64::new(work.dts);
        msg.payload_in_message = U32::new(0);
        if msg.is_zero_copy.get() == 0 && length > 0 {
            if length <= SHORT_DATA_SIZE {
                msg.payload_in_message = U32::new(1);
                msg.short_data[..length].copy_from_slice(&work.payload[..length]);
            } else {
                self.to_host_bulk.push_back(work.payload[..length].to_vec());
            }
        }
        self.send_buffer(msg, mmal_sys::STATUS_SUCCESS);
        true
    }

    fn return_held(&mut self, handle: u32) -> usize {
        let held: Vec<BufferMsg> = match self.port_mut(handle) {
            Some(port) => port.held.drain(..).collect(),
            None => return 0,
        };
        let count = held.len();
        for mut msg in held {
            msg.buffer_header.length = U32::new(0);
            msg.buffer_header.flags = U32::new(0);
            msg.payload_in_message = U32::new(0);
            self.send_buffer(msg, mmal_sys::STATUS_SUCCESS);
        }
        count
    }

    fn send_buffer(&mut self, msg: BufferMsg, status: u32) {
        if let Some(service) = self.mmal_service() {
            let message = encode_reply(mmal_sys::MSG_TYPE_BUFFER_TO_HOST, 0, status, &msg);
            self.outbox.push((service, message));
        }
    }

    fn format_changed(&mut self, handle: u32, width: u32, height: u32) {
        let Some((client_component, _)) = self.owner(handle) else {
            return;
        };
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        port.video.width = U32::new(width);
        port.video.height = U32::new(height);
        port.video.crop.x = I32::new(0);
        port.video.crop.y = I32::new(0);
        port.video.crop.width = I32::new(width as i32);
        port.video.crop.height = I32::new(height as i32);
        let size = port.required_size(port.port.buffer_size_min.get());
        port.port.buffer_size_min = U32::new(size);
        port.port.buffer_size_recommended = U32::new(size);

        let event = FormatChangedEvent {
            buffer_size_min: U32::new(size),
            buffer_num_min: port.port.buffer_num_min,
            buffer_size_recommended: U32::new(size),
            buffer_num_recommended: port.port.buffer_num_recommended,
            format: port.es,
            video: port.video,
        };
        let mut msg = EventToHost::new_zeroed();
        msg.client_component = U32::new(client_component);
        msg.port_type = U32::new(port.port_type);
        msg.port_num = U32::new(port.index);
        msg.cmd = U32::new(mmal_sys::EVENT_FORMAT_CHANGED);
        msg.length = U32::new(size_of::<FormatChangedEvent>() as u32);
        msg.data[..size_of::<FormatChangedEvent>()].copy_from_slice(event.as_bytes());
        self.notify(mmal_sys::MSG_TYPE_EVENT_TO_HOST, &msg);
    }

    fn handle_audio(&mut self, service: u32, message: &[u8]) {
        if self.audio.inline_remaining > 0 {
            let bytes = message.len().min(self.audio.inline_remaining);
            self.audio.packets += 1;
            self.audio.bytes_written += bytes;
            self.audio.inline_remaining -= bytes;
            if self.audio.inline_remaining == 0 {
                let total = self.audio.inline_total;
                self.audio_complete(service, total);
            }
            return;
        }
        let Some(msg) = decode_body::<AudioMsg>(message) else {
            warn!("Loopback dropping runt audio message");
            return;
        };
        match msg.msg_type.get() {
            AUDIO_MSG_CONTROL | AUDIO_MSG_CONFIG | AUDIO_MSG_CLOSE => {
                let result = AudioResult { success: I32::new(self.audio.result) };
                let reply = (service, AudioMsg::new(AUDIO_MSG_RESULT, &result).as_bytes().to_vec());
                if self.defer_replies {
                    self.deferred.push(reply);
                } else {
                    self.outbox.push(reply);
                }
            }
            AUDIO_MSG_WRITE => {
                let Some(write) = msg.body_as::<AudioWrite>() else {
                    return;
                };
                let count = write.count.get() as usize;
                if write.max_packet.get() == 0 {
                    self.audio.bulk_expected = Some(count);
                } else {
                    self.audio.inline_remaining = count;
                    self.audio.inline_total = count;
                }
            }
            other => trace!("Loopback audio message {}", other),
        }
    }

    fn audio_complete(&mut self, service: u32, count: usize) {
        let complete = AudioComplete {
            count: I32::new(count as i32),
            cookie1: U32::new(AUDIO_WRITE_COOKIE1),
            cookie2: U32::new(AUDIO_WRITE_COOKIE2),
        };
        let msg = AudioMsg::new(AUDIO_MSG_COMPLETE, &complete);
        self.outbox.push((service, msg.as_bytes().to_vec()));
    }
}

impl MessageChannel for LoopbackFirmware {
    fn open(&self, service: ServiceId, on_message: ReceiveCallback) -> Result<ServiceHandle> {
        let mut state = self.state.lock();
        if state.services.values().any(|(id, _)| *id == service) {
            return Err(Error::Transport(format!("service {service} already open")));
        }
        let handle = state.next_service;
        state.next_service += 1;
        state.services.insert(handle, (service, Arc::new(on_message)));
        Ok(ServiceHandle(handle))
    }

    fn close(&self, handle: ServiceHandle) -> Result<()> {
        match self.state.lock().services.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(Error::Transport(format!("service {:?} not open", handle))),
        }
    }

    fn send(&self, handle: ServiceHandle, message: &[u8]) -> Result<()> {
        let mut result = Ok(());
        self.deliver(|state| {
            if state.fail_sends {
                result = Err(Error::Transport("loopback refuses sends".to_string()));
                return;
            }
            match state.services.get(&handle.0).map(|(id, _)| *id) {
                Some(ServiceId::MMAL) => state.handle_mmal(message),
                Some(ServiceId::AUDIO) => state.handle_audio(handle.0, message),
                _ => result = Err(Error::Transport(format!("service {:?} not open", handle))),
            }
        });
        result
    }

    fn bulk_transfer(&self, handle: ServiceHandle, transfer: BulkTransfer<'_>) -> Result<()> {
        let mut result = Ok(());
        self.deliver(|state| {
            if state.fail_sends {
                result = Err(Error::Transport("loopback refuses bulk transfers".to_string()));
                return;
            }
            let service = state.services.get(&handle.0).map(|(id, _)| *id);
            match (service, transfer) {
                (Some(ServiceId::MMAL), BulkTransfer::Transmit(data)) => {
                    state.bulk_bytes_received += data.len();
                    if state.unresponsive {
                        return;
                    }
                    match state.from_host_bulk.take() {
                        Some((port, msg)) => state.consume(port, msg, data.to_vec()),
                        None => result = Err(Error::Transport("unexpected bulk transmit".to_string())),
                    }
                }
                (Some(ServiceId::MMAL), BulkTransfer::Receive(destination)) => {
                    match state.to_host_bulk.pop_front() {
                        Some(data) if data.len() == destination.len() => {
                            destination.copy_from_slice(&data);
                        }
                        Some(data) => {
                            result = Err(Error::Transport(format!(
                                "bulk of {} bytes read as {}",
                                data.len(),
                                destination.len()
                            )));
                        }
                        None => result = Err(Error::Transport("no bulk data pending".to_string())),
                    }
                }
                (Some(ServiceId::AUDIO), BulkTransfer::Transmit(data)) => {
                    match state.audio.bulk_expected.take() {
                        Some(count) if count == data.len() => {
                            state.audio.bulk_transfers += 1;
                            state.audio.bytes_written += count;
                            state.audio_complete(handle.0, count);
                        }
                        _ => result = Err(Error::Transport("unexpected audio bulk".to_string())),
                    }
                }
                _ => result = Err(Error::Transport(format!("no bulk on {:?}", handle))),
            }
        });
        result
    }

    fn peer_version(&self, _handle: ServiceHandle) -> u32 {
        self.state.lock().peer_version
    }
}

#[derive(Default)]
struct Ledger {
    live: HashMap<u32, usize>,
    releases: HashMap<u32, usize>,
    imports: usize,
}

/// Memory-sharing double that counts imports and releases per handle.
#[derive(Default)]
pub struct CountingMemory {
    next: AtomicU32,
    ledger: Mutex<Ledger>,
}

impl CountingMemory {
    pub fn imports(&self) -> usize {
        self.ledger.lock().imports
    }

    /// Handles imported and not released yet.
    pub fn live(&self) -> usize {
        self.ledger.lock().live.len()
    }

    /// How often `handle` was released.
    pub fn releases_of(&self, handle: MemHandle) -> usize {
        self.ledger.lock().releases.get(&handle.0).copied().unwrap_or(0)
    }

    /// `true` when every imported handle was released exactly once.
    pub fn all_released_once(&self) -> bool {
        let ledger = self.ledger.lock();
        ledger.live.is_empty()
            && ledger.releases.len() == ledger.imports
            && ledger.releases.values().all(|count| *count == 1)
    }
}

impl MemorySharing for CountingMemory {
    fn import(&self, data: &[u8]) -> Result<MemHandle> {
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let mut ledger = self.ledger.lock();
        ledger.imports += 1;
        ledger.live.insert(handle, data.len());
        Ok(MemHandle(handle))
    }

    fn release(&self, handle: MemHandle) -> Result<()> {
        let mut ledger = self.ledger.lock();
        *ledger.releases.entry(handle.0).or_default() += 1;
        match ledger.live.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidArg),
        }
    }
}
