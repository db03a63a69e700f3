// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Correlation of control requests with their responses.
//!
//! A request borrows a slot from a bounded table. The slot's correlation id
//! combines the slot index with a generation counter that advances each time
//! the slot is freed, so a response that arrives after its request gave up
//! names a generation nobody waits for and is rejected.

use std::time::{Duration, Instant};

use crate::{
    Error, Result,
    sync::{Condvar, Mutex},
};

#[derive(Debug)]
enum SlotState {
    Free,
    Waiting,
    Done(Vec<u8>),
    Answered,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
}

#[derive(Debug)]
pub(crate) struct RequestTable {
    slots: Mutex<Vec<Slot>>,
    changed: Condvar,
}

const GENERATION_MASK: u32 = 0x00ff_ffff;

fn context_of(index: usize, generation: u32) -> u32 {
    // Index is stored plus one so that no live request uses context 0.
    ((generation & GENERATION_MASK) << 8) | (index as u32 + 1)
}

impl RequestTable {
    pub(crate) fn new(size: usize) -> Self {
        let slots = (0..size.clamp(1, 255))
            .map(|_| Slot { generation: 0, state: SlotState::Free })
            .collect();
        Self { slots: Mutex::new(slots), changed: Condvar::new() }
    }

    /// Takes a free slot, waiting up to `timeout` for one.
    pub(crate) fn acquire(&self, timeout: Duration) -> Result<PendingRequest<'_>> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        loop {
            if let Some(index) = slots.iter().position(|slot| matches!(slot.state, SlotState::Free)) {
                let slot = &mut slots[index];
                slot.state = SlotState::Waiting;
                let context = context_of(index, slot.generation);
                return Ok(PendingRequest { table: self, index, context });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            slots = self.changed.wait_timeout(slots, deadline - now).0;
        }
    }

    /// Hands a response to the request waiting under `context`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolViolation`] when no request waits under that
    /// id: it was never issued, already answered, or timed out.
    pub(crate) fn complete(&self, context: u32, response: &[u8]) -> Result<()> {
        let index = (context & 0xff) as usize;
        let mut slots = self.slots.lock();
        let slot = index
            .checked_sub(1)
            .and_then(|index| slots.get_mut(index).map(|slot| (index, slot)));
        match slot {
            Some((index, slot))
                if context_of(index, slot.generation) == context
                    && matches!(slot.state, SlotState::Waiting) =>
            {
                slot.state = SlotState::Done(response.to_vec());
                self.changed.notify_all();
                Ok(())
            }
            _ => Err(Error::ProtocolViolation(format!(
                "response for unknown or expired request {context:#x}"
            ))),
        }
    }

    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| !matches!(slot.state, SlotState::Free))
            .count()
    }
}

/// A slot owned by one in-flight request. Dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct PendingRequest<'a> {
    table: &'a RequestTable,
    index: usize,
    context: u32,
}

impl PendingRequest<'_> {
    pub(crate) fn context(&self) -> u32 {
        self.context
    }

    /// Blocks until the response arrives or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.table.slots.lock();
        loop {
            let slot = &mut slots[self.index];
            match std::mem::replace(&mut slot.state, SlotState::Answered) {
                SlotState::Done(response) => return Ok(response),
                other => slot.state = other,
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            slots = self.table.changed.wait_timeout(slots, deadline - now).0;
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        let mut slots = self.table.slots.lock();
        let slot = &mut slots[self.index];
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        slot.state = SlotState::Free;
        self.table.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_reaches_its_request() {
        let table = RequestTable::new(2);
        let request = table.acquire(Duration::from_millis(10)).unwrap();
        table.complete(request.context(), b"reply").unwrap();
        assert_eq!(request.wait(Duration::from_millis(10)).unwrap(), b"reply");
    }

    #[test]
    fn late_response_is_rejected_after_timeout() {
        let table = RequestTable::new(1);
        let stale = {
            let request = table.acquire(Duration::from_millis(10)).unwrap();
            assert!(matches!(request.wait(Duration::from_millis(5)), Err(Error::Timeout)));
            request.context()
        };
        assert_eq!(table.in_use(), 0);

        let request = table.acquire(Duration::from_millis(10)).unwrap();
        assert_ne!(request.context(), stale);
        assert!(matches!(table.complete(stale, b"late"), Err(Error::ProtocolViolation(_))));
        table.complete(request.context(), b"fresh").unwrap();
        assert!(matches!(
            table.complete(request.context(), b"again"),
            Err(Error::ProtocolViolation(_))
        ));
        assert_eq!(request.wait(Duration::from_millis(10)).unwrap(), b"fresh");
    }

    #[test]
    fn exhausted_table_times_out() {
        let table = RequestTable::new(1);
        let _held = table.acquire(Duration::from_millis(10)).unwrap();
        assert!(matches!(table.acquire(Duration::from_millis(5)), Err(Error::Timeout)));
        assert!(matches!(table.complete(0, b""), Err(Error::ProtocolViolation(_))));
    }
}
