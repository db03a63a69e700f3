// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Instance management and the request/response engine.
//!
//! This module provides [`Instance`], the entry point of the crate. An
//! instance owns one open MMAL service on a [`MessageChannel`], the table of
//! outstanding control requests, and the dispatch thread that routes every
//! incoming message either to a waiting request or to the port it concerns.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU32, Ordering},
    },
};

use mmal_sys::{
    BufferMsg, EventToHost, GetVersionReply, MMAL_MAGIC, MSG_TYPE_BUFFER_TO_HOST,
    MSG_TYPE_EVENT_TO_HOST, MSG_TYPE_GET_VERSION, MSG_TYPE_SERVICE_CLOSED, MsgHeader,
    StatusReply, decode_body, decode_header, encode_message,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::{
    Component, Error, Result,
    channel::{BulkTransfer, DispatchedService, MessageChannel, ServiceHandle, ServiceId},
    component::ComponentInner,
    config::Config,
    memory::MemorySharing,
    request::RequestTable,
    sync::Mutex,
};

/// State the dispatch thread works on.
///
/// Kept apart from [`InstanceContext`] so that the dispatch thread never
/// holds the instance itself alive.
pub(crate) struct Router {
    instance_id: Uuid,
    requests: RequestTable,
    components: Mutex<HashMap<u32, Weak<ComponentInner>>>,
    channel: Arc<dyn MessageChannel>,
    service: OnceLock<ServiceHandle>,
}

impl Router {
    fn dispatch(&self, message: &[u8]) {
        let Some((header, body)) = decode_header(message) else {
            warn!("Dropping runt message of {} bytes", message.len());
            return;
        };
        if header.magic.get() != MMAL_MAGIC {
            warn!("Dropping message with bad magic {:#010x}", header.magic.get());
            return;
        }
        match header.msg_type.get() {
            MSG_TYPE_BUFFER_TO_HOST => self.buffer_to_host(&header, body),
            MSG_TYPE_EVENT_TO_HOST => self.event_to_host(body),
            MSG_TYPE_SERVICE_CLOSED => warn!(instance = %self.instance_id, "Firmware closed the service"),
            msg_type => {
                if let Err(error) = self.requests.complete(header.context.get(), message) {
                    warn!("Dropping response of type {}: {}", msg_type, error);
                }
            }
        }
    }

    fn component(&self, client_component: u32) -> Option<Arc<ComponentInner>> {
        self.components.lock().get(&client_component).and_then(Weak::upgrade)
    }

    fn buffer_to_host(&self, header: &MsgHeader, body: &[u8]) {
        let Some(msg) = decode_body::<BufferMsg>(body) else {
            warn!("Dropping truncated buffer message of {} bytes", body.len());
            return;
        };
        if msg.drvbuf.magic.get() != mmal_sys::DRIVER_BUFFER_MAGIC {
            warn!("Dropping buffer message with bad driver magic");
            return;
        }
        let client_component = msg.drvbuf.client_component.get();
        let Some(component) = self.component(client_component) else {
            debug!(
                "Dropping buffer {:#x} returned for destroyed component {}",
                msg.drvbuf.cookie.get(),
                client_component
            );
            return;
        };
        match component.port_by_handle(msg.drvbuf.port_handle.get()) {
            Some(port) => port.complete_buffer(header.status.get(), &msg, self),
            None => warn!(
                "Dropping buffer for unknown port handle {:#x}",
                msg.drvbuf.port_handle.get()
            ),
        }
    }

    fn event_to_host(&self, body: &[u8]) {
        let Some(event) = decode_body::<EventToHost>(body) else {
            warn!("Dropping truncated event message of {} bytes", body.len());
            return;
        };
        let Some(component) = self.component(event.client_component.get()) else {
            debug!("Dropping event for destroyed component {}", event.client_component.get());
            return;
        };
        let port = component.port_by_position(event.port_type.get(), event.port_num.get());
        let length = (event.length.get() as usize).min(event.data.len());
        match port {
            Some(port) => port.handle_command(event.cmd.get(), &event.data[..length]),
            None => warn!(
                "Dropping event {} for unknown port {}:{}",
                mmal_sys::fourcc_to_string(event.cmd.get()),
                event.port_type.get(),
                event.port_num.get()
            ),
        }
    }

    /// Receives the payload of the buffer message being dispatched.
    pub(crate) fn bulk_receive(&self, destination: &mut [u8]) -> Result<()> {
        let service = self
            .service
            .get()
            .copied()
            .ok_or_else(|| Error::InvalidState("service not open".to_string()))?;
        self.channel.bulk_transfer(service, BulkTransfer::Receive(destination))
    }
}

/// Internal shared context of an [`Instance`].
///
/// Components keep the context alive; the dispatch thread only reaches the
/// [`Router`].
pub(crate) struct InstanceContext {
    pub(crate) id: Uuid,
    pub(crate) config: Config,
    pub(crate) memory: Arc<dyn MemorySharing>,
    channel: Arc<dyn MessageChannel>,
    router: Arc<Router>,
    service: Mutex<DispatchedService>,
    service_handle: ServiceHandle,
    /// Serialises control requests: one on the wire at a time.
    control: Mutex<()>,
    /// Serialises buffer messages and their bulk transfers.
    data: Mutex<()>,
    next_client_component: AtomicU32,
}

impl InstanceContext {
    /// Sends a control request and blocks until its response arrives.
    ///
    /// Returns the response body. The response must carry the request's
    /// message type.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] when called from a completion or event
    ///   callback, which runs on the dispatch thread that would have to
    ///   deliver the response
    /// - [`Error::Transport`] when the channel refuses the message
    /// - [`Error::Timeout`] when no response arrives in time
    /// - [`Error::ProtocolViolation`] for a response of the wrong shape
    pub(crate) fn send_and_wait<T: IntoBytes + Immutable>(
        &self,
        msg_type: u32,
        body: &T,
    ) -> Result<Vec<u8>> {
        self.ensure_control_thread()?;
        let _control = self.control.lock();
        let timeout = self.config.request_timeout();
        let pending = self.router.requests.acquire(timeout)?;
        let message = encode_message(msg_type, pending.context(), body);
        trace!("Sending request type {} context {:#x}", msg_type, pending.context());
        self.channel.send(self.service_handle, &message)?;

        let response = pending.wait(timeout).inspect_err(|_| {
            warn!(instance = %self.id, "Request type {} timed out after {:?}", msg_type, timeout);
        })?;
        let (header, reply) = decode_header(&response)
            .ok_or_else(|| Error::ProtocolViolation("runt response".to_string()))?;
        if header.msg_type.get() != msg_type {
            return Err(Error::ProtocolViolation(format!(
                "response type {} to request type {}",
                header.msg_type.get(),
                msg_type
            )));
        }
        Ok(reply.to_vec())
    }

    /// Fails with [`Error::InvalidState`] on the dispatch thread, where a
    /// control request could never see its response.
    pub(crate) fn ensure_control_thread(&self) -> Result<()> {
        if self.service.lock().is_current_thread() {
            return Err(Error::InvalidState(
                "control request issued from a dispatch callback".to_string(),
            ));
        }
        Ok(())
    }

    /// [`Self::send_and_wait`] decoding the response body as `R`.
    pub(crate) fn request<T, R>(&self, msg_type: u32, body: &T) -> Result<R>
    where
        T: IntoBytes + Immutable,
        R: FromBytes,
    {
        let reply = self.send_and_wait(msg_type, body)?;
        decode_body(&reply).ok_or_else(|| {
            Error::ProtocolViolation(format!("truncated response to request type {msg_type}"))
        })
    }

    /// Sends a request whose response is a bare status.
    pub(crate) fn request_status<T: IntoBytes + Immutable>(
        &self,
        msg_type: u32,
        body: &T,
    ) -> Result<()> {
        let reply: StatusReply = self.request(msg_type, body)?;
        Error::from_status(reply.status.get())
    }

    /// Sends a buffer message, followed by its bulk payload if any.
    ///
    /// Takes the data-plane lock only; a slow control request never delays
    /// a submission.
    pub(crate) fn send_buffer(&self, message: &[u8], bulk: Option<&[u8]>) -> Result<()> {
        let _data = self.data.lock();
        self.channel.send(self.service_handle, message)?;
        if let Some(payload) = bulk {
            self.channel.bulk_transfer(self.service_handle, BulkTransfer::Transmit(payload))?;
        }
        Ok(())
    }

    pub(crate) fn next_client_component(&self) -> u32 {
        self.next_client_component.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_component(&self, client_component: u32, component: Weak<ComponentInner>) {
        self.router.components.lock().insert(client_component, component);
    }

    pub(crate) fn unregister_component(&self, client_component: u32) {
        self.router.components.lock().remove(&client_component);
    }

    fn shutdown(&self) -> Result<()> {
        debug!(instance = %self.id, "Closing MMAL service");
        self.service.lock().close(self.channel.as_ref())
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            error!("Failed to close MMAL service on drop: {:?}", error);
        }
    }
}

/// Version triple reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub minimum: u32,
}

/// One open connection to the firmware's media subsystem.
///
/// The instance is cheaply cloneable and thread-safe (`Send + Sync`).
/// Components created from it keep the connection open until they are gone.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use mmal::{Instance, config::Config, loopback::{CountingMemory, LoopbackFirmware}};
///
/// # fn main() -> Result<(), mmal::Error> {
/// let firmware = Arc::new(LoopbackFirmware::with_video_components());
/// let instance = Instance::new(firmware, Arc::new(CountingMemory::default()), Config::default())?;
///
/// let decoder = instance.create_component("ril.video_decode")?;
/// assert_eq!(decoder.inputs().len(), 1);
/// decoder.destroy()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Instance {
    context: Arc<InstanceContext>,
}

impl Instance {
    /// Opens the MMAL service on `channel` and starts the dispatch thread.
    ///
    /// # Arguments
    ///
    /// * `channel` - Transport to the firmware
    /// * `memory` - Memory manager used for zero-copy buffers
    /// * `config` - Tunables; validated here
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] for an invalid configuration and the
    /// channel's error if the service cannot be opened.
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        memory: Arc<dyn MemorySharing>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let router = Arc::new(Router {
            instance_id: id,
            requests: RequestTable::new(config.max_pending_requests),
            components: Mutex::new(HashMap::new()),
            channel: channel.clone(),
            service: OnceLock::new(),
        });

        let dispatch_router = router.clone();
        let service = DispatchedService::open(
            channel.as_ref(),
            ServiceId::MMAL,
            "mmal-dispatch",
            move |message| dispatch_router.dispatch(message),
        )?;
        let service_handle = service.handle();
        let _ = router.service.set(service_handle);
        info!(instance = %id, "Opened MMAL instance");

        Ok(Self {
            context: Arc::new(InstanceContext {
                id,
                config,
                memory,
                channel,
                router,
                service: Mutex::new(service),
                service_handle,
                control: Mutex::new(()),
                data: Mutex::new(()),
                next_client_component: AtomicU32::new(1),
            }),
        })
    }

    /// Random identifier of this instance, used in log records.
    pub fn id(&self) -> Uuid {
        self.context.id
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Queries the firmware's MMAL version.
    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        let reply: GetVersionReply =
            self.context.request(MSG_TYPE_GET_VERSION, &mmal_sys::ComponentHandleMsg::default())?;
        Ok(FirmwareVersion {
            major: reply.major.get(),
            minor: reply.minor.get(),
            minimum: reply.minimum.get(),
        })
    }

    /// Creates a remote component by name.
    ///
    /// See [`Component::create`].
    pub fn create_component(&self, name: &str) -> Result<Component> {
        Component::create(&self.context, name)
    }

    /// Closes the connection now.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Other`] while other clones of the instance or
    /// components created from it are still alive.
    pub fn destroy(self) -> Result<()> {
        let context = Arc::into_inner(self.context)
            .ok_or_else(|| Error::Other("Instance is still in use.".to_string()))?;
        context.shutdown()
    }
}
