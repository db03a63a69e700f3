// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Common utilities shared across examples.

/// Initializes tracing subscriber for examples.
///
/// Logs to stdout at INFO unless `RUST_LOG` asks for something else, e.g.
/// `RUST_LOG=mmal=trace` to follow every buffer.
pub fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

/// Waits up to five seconds for the next item from a completion callback.
pub fn recv<T>(receiver: &std::sync::mpsc::Receiver<T>) -> mmal::Result<T> {
    receiver
        .recv_timeout(std::time::Duration::from_secs(5))
        .map_err(|_| mmal::Error::Timeout)
}
