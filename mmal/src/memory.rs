// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Cross-processor memory sharing for zero-copy buffers.

use std::{fmt, sync::Arc};

use tracing::{error, trace};

use crate::Result;

/// Firmware-visible handle of a shared memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u32);

/// Exports host buffer memory to the firmware.
///
/// Every successful [`MemorySharing::import`] must be matched by exactly one
/// [`MemorySharing::release`] of the returned handle.
pub trait MemorySharing: Send + Sync {
    /// Makes `data` visible to the firmware.
    fn import(&self, data: &[u8]) -> Result<MemHandle>;

    /// Withdraws a handle returned by [`MemorySharing::import`].
    fn release(&self, handle: MemHandle) -> Result<()>;
}

/// The handle a buffer is currently registered under.
///
/// [`Mapping::release`] is the single place a handle is given back. It is
/// idempotent, and dropping a mapping releases it, so whichever path sees the
/// buffer last (completion, error completion or teardown) performs exactly
/// one release.
pub struct Mapping {
    handle: Option<MemHandle>,
    memory: Arc<dyn MemorySharing>,
}

impl Mapping {
    pub(crate) fn import(memory: &Arc<dyn MemorySharing>, data: &[u8]) -> Result<Self> {
        let handle = memory.import(data)?;
        trace!("Imported {} bytes as {:?}", data.len(), handle);
        Ok(Self { handle: Some(handle), memory: memory.clone() })
    }

    /// The firmware handle, or `None` once released.
    pub fn handle(&self) -> Option<MemHandle> {
        self.handle
    }

    pub fn is_mapped(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn release(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.memory.release(handle),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping").field("handle", &self.handle).finish()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            error!("Failed to release shared memory on drop: {:?}", error);
        }
    }
}
