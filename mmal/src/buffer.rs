// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Data buffers exchanged with a port.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

pub use mmal_sys::BufferFlags;

use crate::memory::Mapping;

/// One unit of data moving through a port.
///
/// A buffer is owned by exactly one side at a time: the caller before
/// [`crate::Port::submit_buffer`] and after its completion callback, the
/// firmware in between. Submission takes the buffer by value, which makes
/// handing the same buffer over twice impossible.
///
/// Timestamps are nanoseconds; `None` means unknown.
#[derive(Debug)]
pub struct Buffer {
    index: u32,
    data: Vec<u8>,
    length: usize,
    pub flags: BufferFlags,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    last: bool,
    pub(crate) mapping: Option<Mapping>,
    lease: Option<PoolLease>,
}

impl Buffer {
    /// Creates a buffer of `capacity` bytes.
    ///
    /// `index` identifies the buffer to its owner; a port refuses a buffer
    /// whose index is already with the firmware.
    pub fn new(index: u32, capacity: usize) -> Self {
        Self {
            index,
            data: vec![0; capacity],
            length: 0,
            flags: BufferFlags::empty(),
            pts: None,
            dts: None,
            last: false,
            mapping: None,
            lease: None,
        }
    }

    pub(crate) fn pooled(index: u32, capacity: usize, lease: PoolLease) -> Self {
        Self { lease: Some(lease), ..Self::new(index, capacity) }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid payload bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The valid payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// The whole backing memory, for filling before submission.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Sets the number of valid bytes, clamped to the capacity.
    pub fn set_len(&mut self, length: usize) {
        self.length = length.min(self.data.len());
    }

    /// Copies `payload` in and sets the length.
    ///
    /// Returns `false` without copying when the payload does not fit.
    pub fn fill(&mut self, payload: &[u8]) -> bool {
        if payload.len() > self.data.len() {
            return false;
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.length = payload.len();
        true
    }

    /// `true` when this buffer ended the stream.
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// `true` while the buffer is registered with the firmware's memory
    /// manager.
    pub fn is_mapped(&self) -> bool {
        self.mapping.as_ref().is_some_and(Mapping::is_mapped)
    }

    /// `true` when the buffer came from [`crate::Port::allocate_buffers`].
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn set_last(&mut self, last: bool) {
        self.last = last;
    }

    /// Gives the buffer's memory-sharing handle back, if it holds one.
    ///
    /// Both the completion path and the teardown path go through here.
    pub(crate) fn release_mapping(&mut self) -> crate::Result<()> {
        match self.mapping.as_mut() {
            Some(mapping) => mapping.release(),
            None => Ok(()),
        }
    }
}

/// Outcome of a returned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// The firmware processed the buffer.
    Done,
    /// The transfer failed or the buffer was flushed; contents are not valid.
    Error,
}

/// A buffer handed back by the firmware.
#[derive(Debug)]
pub struct BufferCompletion {
    pub buffer: Buffer,
    pub state: BufferState,
}

/// Counts the live buffers of a port's pool; the queue is busy while any
/// exist.
#[derive(Debug)]
pub(crate) struct PoolLease {
    live: Arc<AtomicUsize>,
}

impl PoolLease {
    pub(crate) fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self { live: live.clone() }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
