// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Remote processing components.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use mmal_sys::{
    COMPONENT_NAME_SIZE, ComponentCreate, ComponentCreateReply, ComponentHandleMsg,
    MSG_TYPE_COMPONENT_CREATE, MSG_TYPE_COMPONENT_DESTROY, MSG_TYPE_COMPONENT_DISABLE,
    MSG_TYPE_COMPONENT_ENABLE,
};
use tracing::{debug, error, info, warn};
use zerocopy::{FromZeros, little_endian::U32};

use crate::{
    Error, Port, Result,
    instance::InstanceContext,
    port::{PortKind, PortState},
};

pub(crate) struct ComponentInner {
    context: Arc<InstanceContext>,
    name: String,
    client_component: u32,
    handle: u32,
    enabled: AtomicBool,
    destroyed: AtomicBool,
    control: Port,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    clocks: Vec<Port>,
}

impl ComponentInner {
    fn ports(&self) -> impl Iterator<Item = &Port> {
        std::iter::once(&self.control)
            .chain(self.inputs.iter())
            .chain(self.outputs.iter())
            .chain(self.clocks.iter())
    }

    pub(crate) fn port_by_handle(&self, handle: u32) -> Option<&Port> {
        self.ports().find(|port| port.handle() == handle)
    }

    /// Finds a port by wire port type and index within that type.
    pub(crate) fn port_by_position(&self, port_type: u32, index: u32) -> Option<&Port> {
        let ports = match PortKind::from_wire(port_type)? {
            PortKind::Control => return (index == 0).then_some(&self.control),
            PortKind::Input => &self.inputs,
            PortKind::Output => &self.outputs,
            PortKind::Clock => &self.clocks,
        };
        ports.get(index as usize)
    }
}

/// A processing element living in the firmware.
///
/// Created from an [`crate::Instance`]; owns its ports. Ports cannot be
/// destroyed on their own: [`Component::destroy`] (or dropping the
/// component) tears down the component and invalidates every port handle
/// cloned from it.
pub struct Component {
    inner: Arc<ComponentInner>,
}

impl Component {
    /// Creates the remote component `name` and discovers its ports.
    ///
    /// The port layout is whatever the firmware reports; nothing about the
    /// number of inputs or outputs is assumed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArg`] for an empty or over-long name
    /// - [`Error::NotFound`] when the firmware has no such component
    /// - [`Error::ResourceExhausted`] when the firmware cannot create another
    /// - any request error while querying the ports; the half-created
    ///   component is destroyed again before returning
    pub(crate) fn create(context: &Arc<InstanceContext>, name: &str) -> Result<Self> {
        if name.is_empty() || name.len() >= COMPONENT_NAME_SIZE || name.contains('\0') {
            return Err(Error::InvalidArg);
        }
        let client_component = context.next_client_component();
        let mut request = ComponentCreate::new_zeroed();
        request.client_component = U32::new(client_component);
        request.name[..name.len()].copy_from_slice(name.as_bytes());
        request.pid = U32::new(std::process::id());

        let reply: ComponentCreateReply = context.request(MSG_TYPE_COMPONENT_CREATE, &request)?;
        match reply.status.get() {
            mmal_sys::STATUS_SUCCESS => {}
            mmal_sys::STATUS_ENOENT => return Err(Error::NotFound(name.to_string())),
            mmal_sys::STATUS_ENOMEM | mmal_sys::STATUS_ENOSPC => {
                return Err(Error::ResourceExhausted);
            }
            other => Error::from_status(other)?,
        }
        let handle = reply.component_handle.get();

        let query = |kind: PortKind, count: u32| -> Result<Vec<Port>> {
            (0..count)
                .map(|index| Port::query(context, handle, client_component, kind, index))
                .collect()
        };
        let ports = (|| -> Result<_> {
            let control = Port::query(context, handle, client_component, PortKind::Control, 0)?;
            Ok((
                control,
                query(PortKind::Input, reply.input_num.get())?,
                query(PortKind::Output, reply.output_num.get())?,
                query(PortKind::Clock, reply.clock_num.get())?,
            ))
        })();
        let (control, inputs, outputs, clocks) = match ports {
            Ok(ports) => ports,
            Err(error) => {
                if let Err(destroy_error) = context
                    .request_status(MSG_TYPE_COMPONENT_DESTROY, &handle_msg(handle))
                {
                    warn!("Failed to destroy half-created component {}: {}", name, destroy_error);
                }
                return Err(error);
            }
        };

        info!(
            instance = %context.id,
            "Created component {} ({:#x}) with {} inputs, {} outputs",
            name,
            handle,
            inputs.len(),
            outputs.len()
        );
        let inner = Arc::new(ComponentInner {
            context: context.clone(),
            name: name.to_string(),
            client_component,
            handle,
            enabled: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            control,
            inputs,
            outputs,
            clocks,
        });
        context.register_component(client_component, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Opaque firmware handle.
    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    pub fn control(&self) -> &Port {
        &self.inner.control
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inner.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.inner.outputs
    }

    pub fn clocks(&self) -> &[Port] {
        &self.inner.clocks
    }

    pub fn input(&self, index: usize) -> Result<&Port> {
        self.inner.inputs.get(index).ok_or(Error::InvalidArg)
    }

    pub fn output(&self, index: usize) -> Result<&Port> {
        self.inner.outputs.get(index).ok_or(Error::InvalidArg)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Starts the component's processing.
    pub fn enable(&self) -> Result<()> {
        self.check_alive()?;
        self.inner
            .context
            .request_status(MSG_TYPE_COMPONENT_ENABLE, &handle_msg(self.inner.handle))?;
        self.inner.enabled.store(true, Ordering::Release);
        debug!("Enabled component {}", self.inner.name);
        Ok(())
    }

    /// Stops the component's processing.
    pub fn disable(&self) -> Result<()> {
        self.check_alive()?;
        self.inner
            .context
            .request_status(MSG_TYPE_COMPONENT_DISABLE, &handle_msg(self.inner.handle))?;
        self.inner.enabled.store(false, Ordering::Release);
        debug!("Disabled component {}", self.inner.name);
        Ok(())
    }

    /// Destroys the component now.
    ///
    /// Ports still enabled are disabled first. Local state is freed even if
    /// a remote step fails: buffers the firmware still holds get their
    /// shared memory released here, and any completion for them arriving
    /// later is dropped. The first remote failure is returned after cleanup.
    pub fn destroy(self) -> Result<()> {
        self.teardown()
    }

    fn check_alive(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("component destroyed".to_string()));
        }
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for port in inner.ports().filter(|port| port.state() == PortState::Enabled) {
            warn!("{} still enabled while destroying {}, disabling", port, inner.name);
            if let Err(error) = port.disable() {
                warn!("Failed to disable {}: {}", port, error);
            }
        }
        if inner.enabled.swap(false, Ordering::AcqRel)
            && let Err(error) = inner
                .context
                .request_status(MSG_TYPE_COMPONENT_DISABLE, &handle_msg(inner.handle))
        {
            warn!("Failed to disable component {}: {}", inner.name, error);
        }

        let result = inner
            .context
            .request_status(MSG_TYPE_COMPONENT_DESTROY, &handle_msg(inner.handle));
        inner.context.unregister_component(inner.client_component);
        for port in inner.ports() {
            port.invalidate();
        }
        match &result {
            Ok(()) => debug!(instance = %inner.context.id, "Destroyed component {}", inner.name),
            Err(error) => warn!("Firmware failed to destroy component {}: {}", inner.name, error),
        }
        result
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        if let Err(error) = self.teardown() {
            error!("Failed to destroy component {} on drop: {:?}", self.inner.name, error);
        }
    }
}

fn handle_msg(handle: u32) -> ComponentHandleMsg {
    ComponentHandleMsg { component_handle: U32::new(handle) }
}
