// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Runs a memory-to-memory session against the loopback firmware.
//!
//! ```text
//! cargo run --example loopback_session -- --role decode --frames 30
//! ```

mod common;

use std::{path::PathBuf, sync::Arc, sync::mpsc};

use clap::Parser;
use mmal::{
    Buffer, Error, Instance, PortFormat,
    config::Config,
    loopback::{CountingMemory, LoopbackFirmware},
    m2m::{Mem2Mem, Queue},
    role::Role,
};
use tracing::info;

/// Frame duration at 30 frames per second, in nanoseconds.
const FRAME_DURATION_NS: i64 = 33_333_333;

#[derive(Parser, Debug)]
#[command(version, about = "Drive a codec or ISP session on the loopback firmware", long_about = None)]
struct Args {
    /// Device role: decode, encode or isp
    #[arg(long, default_value = "decode")]
    role: Role,

    /// Number of jobs to run
    #[arg(long, default_value_t = 10)]
    frames: u32,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// JSON configuration file; payloads are copied when omitted
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Error> {
    common::setup_logging();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_json(&std::fs::read_to_string(path)?)?,
        None => Config { zero_copy: false, ..Config::default() },
    };

    let firmware = Arc::new(LoopbackFirmware::with_video_components());
    let memory = Arc::new(CountingMemory::default());
    let instance = Instance::new(firmware.clone(), memory.clone(), config)?;
    let version = instance.firmware_version()?;
    info!(instance = %instance.id(), "Firmware MMAL version {}.{}", version.major, version.minor);

    let session = Mem2Mem::new(&instance, args.role)?;
    let caps = session.capabilities().clone();
    let source_format =
        PortFormat::video(caps.default_source_format().encoding, args.width, args.height);
    let destination_format =
        PortFormat::video(caps.default_destination_format().encoding, args.width, args.height);
    let source_count = session.configure(Queue::Source, &source_format, 2)?;
    let destination_count = session.configure(Queue::Destination, &destination_format, 3)?;
    let mut sources = session.port(Queue::Source).allocate_buffers(source_count)?;
    let mut destinations = session.port(Queue::Destination).allocate_buffers(destination_count)?;
    info!(
        "{} session: {} source and {} destination buffers",
        caps.role,
        sources.len(),
        destinations.len()
    );

    let (consumed_tx, consumed) = mpsc::channel();
    session.start_streaming(Queue::Source, move |_, completion| {
        let _ = consumed_tx.send(completion.buffer);
    })?;
    let (produced_tx, produced) = mpsc::channel();
    session.start_streaming(Queue::Destination, move |_, completion| {
        let _ = produced_tx.send(completion);
    })?;

    let mut bytes = 0;
    for frame in 0..args.frames {
        let mut source = match sources.pop() {
            Some(buffer) => buffer,
            None => common::recv(&consumed)?,
        };
        let payload = format!("frame {frame} of {}", args.frames).into_bytes();
        source.fill(&payload);
        source.pts = Some(i64::from(frame) * FRAME_DURATION_NS);
        let destination = destinations.pop().ok_or(Error::Busy)?;
        session.run_job(source, destination)?;

        let output = common::recv(&produced)?;
        bytes += output.buffer.len();
        info!(
            "Job {}: {:?}, {} bytes, pts {:?}",
            frame,
            output.state,
            output.buffer.len(),
            output.buffer.pts
        );
        destinations.push(output.buffer);
    }

    if caps.supports_stop_command {
        let mut spare = destinations.pop().ok_or(Error::Busy)?;
        spare.set_len(0);
        session.port(Queue::Destination).submit_buffer(spare)?;
        session.stop()?;
        loop {
            let output = common::recv(&produced)?;
            if output.buffer.is_last() {
                info!("End of stream after {} jobs", args.frames);
                break;
            }
        }
    }

    session.stop_streaming(Queue::Source)?;
    session.stop_streaming(Queue::Destination)?;
    session.destroy()?;
    info!("Moved {} bytes, {} shared memory imports", bytes, memory.imports());

    instance.destroy()
}
