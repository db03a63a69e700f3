// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Notifications delivered to the adapter besides buffer completions.

use crate::{BufferCompletion, Port, format::FormatChange};

/// Out-of-band event raised on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A buffer flagged end-of-stream came back. Raised once per streaming
    /// session, after that buffer's completion.
    EndOfStream,
    /// The firmware discovered new stream properties. The port's recorded
    /// format already reflects the change; renegotiating is up to the adapter.
    SourceChanged(FormatChange),
    /// The firmware reported an asynchronous error with this status.
    Error(u32),
}

/// Receives every buffer the firmware returns on a port.
pub type BufferCallback = Box<dyn FnMut(&Port, BufferCompletion) + Send>;

/// Receives the [`PortEvent`]s of a port.
pub type EventCallback = Box<dyn FnMut(&Port, PortEvent) + Send>;
