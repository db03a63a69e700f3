// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Memory-to-memory sessions: one component fed from a source queue and
//! drained into a destination queue.
//!
//! This is the sequencing a codec or ISP adapter performs around the core:
//! the component is enabled before the first port starts streaming and
//! disabled once both queues stopped, queue sizes never go below the
//! firmware minimum, and the stop command is the reserved end-of-stream
//! buffer.

use tracing::{debug, info};

use crate::{
    Buffer, BufferCompletion, Component, Error, Instance, Port, Result, SubmitError,
    format::PortFormat,
    port::PortState,
    role::{Capabilities, Role},
};

/// The two sides of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Data flowing into the component (its input port).
    Source,
    /// Data produced by the component (its first output port).
    Destination,
}

/// A component driven as a memory-to-memory device.
pub struct Mem2Mem {
    component: Component,
    capabilities: Capabilities,
}

impl Mem2Mem {
    /// Creates the component that serves `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] when the firmware component
    /// exposes fewer ports than the role needs, besides any error of
    /// [`Instance::create_component`].
    pub fn new(instance: &Instance, role: Role) -> Result<Self> {
        let capabilities = role.capabilities();
        let component = instance.create_component(capabilities.component_name)?;
        if component.inputs().is_empty() || component.outputs().len() < capabilities.output_ports
        {
            let message = format!(
                "{} has {} inputs and {} outputs, {} needs 1 and {}",
                component.name(),
                component.inputs().len(),
                component.outputs().len(),
                role,
                capabilities.output_ports
            );
            if let Err(error) = component.destroy() {
                debug!("Failed to destroy mismatched component: {}", error);
            }
            return Err(Error::ProtocolViolation(message));
        }

        let session = Self { component, capabilities };
        if instance.config().zero_copy {
            session.port(Queue::Source).set_zero_copy(true)?;
            session.port(Queue::Destination).set_zero_copy(true)?;
        }
        info!("Created {} session on {}", role, session.component.name());
        Ok(session)
    }

    pub fn component(&self) -> &Component {
        &self.component
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn port(&self, queue: Queue) -> &Port {
        match queue {
            Queue::Source => &self.component.inputs()[0],
            Queue::Destination => &self.component.outputs()[0],
        }
    }

    /// Negotiates the format of `queue` and sizes it for `requested`
    /// buffers.
    ///
    /// The format is first clamped to the role's limits. Returns the number
    /// of buffers the adapter should allocate, which is at least the
    /// firmware minimum. On a role with a stop command, the firmware-side
    /// count of the source queue includes one more buffer for the reserved
    /// end-of-stream buffer.
    pub fn configure(&self, queue: Queue, format: &PortFormat, requested: u32) -> Result<u32> {
        let port = self.port(queue);
        let format = self.capabilities.try_format(format);
        port.set_format(&format)?;

        let requirements = port.requirements();
        let count = requested.max(requirements.num_min).max(1);
        let frame_size = self
            .capabilities
            .image_size(format.encoding, format.video.width, format.video.height)
            .unwrap_or(0);
        let size = frame_size.max(requirements.size_min).max(requirements.size);
        let reserved = u32::from(queue == Queue::Source && self.capabilities.supports_stop_command);
        port.set_buffer_requirements(count + reserved, size)?;
        debug!("{:?} queue: {} buffers of {} bytes", queue, count, size);
        Ok(count)
    }

    /// Starts streaming on `queue`; the component is enabled first if needed.
    pub fn start_streaming<F>(&self, queue: Queue, on_buffer: F) -> Result<()>
    where
        F: FnMut(&Port, BufferCompletion) + Send + 'static,
    {
        if !self.component.is_enabled() {
            self.component.enable()?;
        }
        self.port(queue).enable(on_buffer)
    }

    /// A job can run whenever both queues have a buffer; the firmware does
    /// its own flow control.
    pub fn job_ready(&self) -> bool {
        true
    }

    /// Hands one source and one destination buffer to the firmware.
    ///
    /// If the destination submission fails, the source buffer stays
    /// submitted and completes normally.
    pub fn run_job(&self, source: Buffer, destination: Buffer) -> std::result::Result<(), SubmitError> {
        self.port(Queue::Source).submit_buffer(source)?;
        self.port(Queue::Destination).submit_buffer(destination)
    }

    /// The stop command: ends the stream on the source side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for a role without a stop command and
    /// [`Error::Busy`] while a previous stop is still in progress.
    pub fn stop(&self) -> Result<()> {
        if !self.capabilities.supports_stop_command {
            return Err(Error::InvalidState(format!(
                "{} has no stop command",
                self.capabilities.role
            )));
        }
        self.port(Queue::Source).send_end_of_stream()
    }

    /// Stops streaming on `queue`, draining its buffers. The component is
    /// disabled once neither queue streams.
    pub fn stop_streaming(&self, queue: Queue) -> Result<()> {
        let port = self.port(queue);
        let result = if port.state() == PortState::Enabled { port.disable() } else { Ok(()) };

        let streaming = [Queue::Source, Queue::Destination]
            .into_iter()
            .any(|queue| self.port(queue).state() != PortState::Disabled);
        if !streaming && self.component.is_enabled() {
            self.component.disable()?;
        }
        result
    }

    /// Ends the session and destroys the component.
    pub fn destroy(self) -> Result<()> {
        self.component.destroy()
    }
}
