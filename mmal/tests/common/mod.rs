// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Shared setup for the integration tests.
//!
//! Every test runs against its own [`LoopbackFirmware`] and
//! [`CountingMemory`], so tests are isolated from each other.

#![allow(dead_code)]

use std::{
    sync::{Arc, mpsc::Receiver},
    time::{Duration, Instant},
};

use mmal::{
    Instance,
    config::Config,
    loopback::{CountingMemory, LoopbackFirmware},
};

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

/// Generous bound for anything the loopback does asynchronously.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestSetup {
    pub firmware: Arc<LoopbackFirmware>,
    pub memory: Arc<CountingMemory>,
    pub instance: Instance,
}

pub fn setup_logging() {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    });
}

/// Opens an instance on `firmware` with `config`.
pub fn setup_with(firmware: LoopbackFirmware, config: Config) -> TestSetup {
    setup_logging();
    let firmware = Arc::new(firmware);
    let memory = Arc::new(CountingMemory::default());
    let instance = Instance::new(firmware.clone(), memory.clone(), config).unwrap();
    TestSetup { firmware, memory, instance }
}

/// Opens an instance on a firmware with the video components.
pub fn setup_test(config: Config) -> TestSetup {
    setup_with(LoopbackFirmware::with_video_components(), config)
}

/// Configuration that copies payloads instead of sharing memory, with short
/// timeouts.
pub fn copy_config() -> Config {
    Config { zero_copy: false, ..fast_config() }
}

/// Default configuration with timeouts short enough for failure tests.
pub fn fast_config() -> Config {
    Config { request_timeout_ms: 300, drain_timeout_ms: 150, ..Config::default() }
}

/// Polls `condition` until it holds or [`WAIT`] passes.
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Receives exactly `count` items, failing the test on timeout.
pub fn recv_n<T>(receiver: &Receiver<T>, count: usize) -> Vec<T> {
    (0..count)
        .map(|_| receiver.recv_timeout(WAIT).expect("completion within the wait bound"))
        .collect()
}
