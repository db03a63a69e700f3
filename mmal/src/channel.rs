// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The message channel consumed by the protocol engine.
//!
//! The channel is the transport to the firmware: ordered, reliable message
//! delivery per service plus a bulk mode for payloads too large for a
//! message. Implementations deliver incoming messages through the
//! [`ReceiveCallback`] registered at [`MessageChannel::open`]; the engine
//! never blocks inside that callback, it only queues the bytes for its own
//! dispatch thread.

use std::{
    fmt,
    sync::mpsc::{self, Sender},
    thread::{self, JoinHandle, ThreadId},
};

use tracing::{debug, error};

use crate::{Error, Result};

/// Name of a firmware service, packed as a big-endian fourcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u32);

impl ServiceId {
    /// The MMAL component service.
    pub const MMAL: ServiceId = ServiceId(mmal_sys::MMAL_SERVICE_FOURCC);
    /// The VCHI audio service.
    pub const AUDIO: ServiceId = ServiceId(mmal_sys::audio::AUDIO_SERVICE_FOURCC);
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: String = self.0.to_be_bytes().iter().map(|b| *b as char).collect();
        f.write_str(&text)
    }
}

/// An open service on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(pub u32);

/// Invoked by the channel for every message arriving on a service.
pub type ReceiveCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Direction and local memory of a bulk transfer.
#[derive(Debug)]
pub enum BulkTransfer<'a> {
    /// Host to firmware.
    Transmit(&'a [u8]),
    /// Firmware to host; the slice length is the expected transfer size.
    Receive(&'a mut [u8]),
}

/// Ordered, reliable message transport to the firmware.
pub trait MessageChannel: Send + Sync {
    /// Opens `service`, registering the callback that receives its messages.
    fn open(&self, service: ServiceId, on_message: ReceiveCallback) -> Result<ServiceHandle>;

    /// Closes a service. The channel drops its receive callback.
    fn close(&self, handle: ServiceHandle) -> Result<()>;

    /// Queues one message. Fails with [`Error::Transport`] when the message
    /// cannot be delivered.
    fn send(&self, handle: ServiceHandle, message: &[u8]) -> Result<()>;

    /// Performs a bulk transfer paired with the last buffer message on `handle`.
    fn bulk_transfer(&self, handle: ServiceHandle, transfer: BulkTransfer<'_>) -> Result<()>;

    /// Protocol version the firmware side announced for the service.
    fn peer_version(&self, _handle: ServiceHandle) -> u32 {
        2
    }
}

enum Incoming {
    Message(Vec<u8>),
    Shutdown,
}

/// A service whose messages are handled on a dedicated thread.
///
/// Opening registers a callback that only copies each message into a queue;
/// the thread drains the queue in arrival order and runs the handler. The
/// handler therefore never runs inside the transport's own context, and
/// messages of one service are handled strictly one at a time.
pub(crate) struct DispatchedService {
    handle: ServiceHandle,
    sender: Sender<Incoming>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl DispatchedService {
    pub(crate) fn open<F>(
        channel: &dyn MessageChannel,
        service: ServiceId,
        thread_name: &str,
        handler: F,
    ) -> Result<Self>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Incoming>();
        let thread = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let mut handler = handler;
                while let Ok(Incoming::Message(message)) = receiver.recv() {
                    handler(&message);
                }
            })?;
        let thread_id = thread.thread().id();

        let queue = sender.clone();
        let on_message: ReceiveCallback = Box::new(move |message| {
            // Only fails once the thread is gone, when nobody listens anyway.
            let _ = queue.send(Incoming::Message(message.to_vec()));
        });
        let handle = match channel.open(service, on_message) {
            Ok(handle) => handle,
            Err(error) => {
                let _ = sender.send(Incoming::Shutdown);
                let _ = thread.join();
                return Err(error);
            }
        };
        debug!("Opened service {} as {:?}", service, handle);

        Ok(Self { handle, sender, thread: Some(thread), thread_id })
    }

    pub(crate) fn handle(&self) -> ServiceHandle {
        self.handle
    }

    /// `true` when called from the dispatch thread of this service.
    pub(crate) fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Closes the service and stops the dispatch thread.
    ///
    /// Messages already queued are handled before the thread exits. When
    /// called from the dispatch thread itself the thread is left to finish
    /// on its own.
    pub(crate) fn close(&mut self, channel: &dyn MessageChannel) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let result = channel.close(self.handle);
        let _ = self.sender.send(Incoming::Shutdown);
        if thread.thread().id() != thread::current().id() && thread.join().is_err() {
            error!("Dispatch thread for {:?} panicked", self.handle);
            return Err(Error::Other("Dispatch thread panicked.".to_string()));
        }
        result
    }
}
