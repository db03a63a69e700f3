// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Memory-to-memory sessions for the codec and ISP roles.

mod common;

use std::sync::mpsc;

use mmal::{
    Buffer, BufferState, Error, PortFormat, PortState,
    format::Encoding,
    loopback::{ComponentSpec, LoopbackFirmware},
    m2m::{Mem2Mem, Queue},
    role::Role,
};

use crate::common::*;

#[test]
fn decode_session_runs_jobs_until_stopped() {
    let setup = setup_test(fast_config());
    let session = Mem2Mem::new(&setup.instance, Role::Decode).unwrap();
    let source = session.port(Queue::Source).clone();
    let destination = session.port(Queue::Destination).clone();
    assert_eq!(
        setup.firmware.parameter(source.handle(), mmal_sys::PARAMETER_ZERO_COPY),
        Some(vec![1, 0, 0, 0])
    );

    let caps = session.capabilities();
    let sources = session.configure(Queue::Source, &caps.default_source_format(), 2).unwrap();
    assert_eq!(sources, 2);
    // One more on the firmware side for the end-of-stream buffer.
    assert_eq!(source.requirements().num, 3);
    assert_eq!(source.requirements().size, 512 << 10);

    let destinations = session
        .configure(Queue::Destination, &PortFormat::video(Encoding::I420, 640, 360), 4)
        .unwrap();
    assert_eq!(destinations, 4);
    assert_eq!(destination.requirements().num, 4);
    assert_eq!(destination.format().video.height, 368);
    assert_eq!(destination.requirements().size, 640 * 368 * 3 / 2);

    let (consumed_tx, consumed) = mpsc::channel();
    let (decoded_tx, decoded) = mpsc::channel();
    session
        .start_streaming(Queue::Destination, move |_, completion| {
            let _ = decoded_tx.send(completion);
        })
        .unwrap();
    session
        .start_streaming(Queue::Source, move |_, completion| {
            let _ = consumed_tx.send(completion);
        })
        .unwrap();
    assert!(session.component().is_enabled());
    assert!(session.job_ready());

    let frame_size = destination.requirements().size as usize;
    let mut access_unit = Buffer::new(0, source.requirements().size as usize);
    access_unit.fill(&[0, 0, 0, 1, 0x65, 0x88]);
    session.run_job(access_unit, Buffer::new(0, frame_size)).unwrap();
    assert_eq!(consumed.recv_timeout(WAIT).unwrap().state, BufferState::Done);
    let frame = decoded.recv_timeout(WAIT).unwrap();
    assert_eq!(frame.state, BufferState::Done);
    assert_eq!(frame.buffer.len(), 6);

    destination.submit_buffer(Buffer::new(1, frame_size)).unwrap();
    session.stop().unwrap();
    let last = decoded.recv_timeout(WAIT).unwrap();
    assert!(last.buffer.is_last());

    session.stop_streaming(Queue::Source).unwrap();
    assert_eq!(source.state(), PortState::Disabled);
    assert!(session.component().is_enabled());
    session.stop_streaming(Queue::Destination).unwrap();
    assert!(!session.component().is_enabled());

    session.destroy().unwrap();
    assert_eq!(setup.firmware.component_count(), 0);
    assert!(setup.memory.all_released_once());
}

#[test]
fn isp_has_no_stop_command() {
    let setup = setup_test(fast_config());
    let session = Mem2Mem::new(&setup.instance, "isp".parse().unwrap()).unwrap();
    assert_eq!(session.component().outputs().len(), 3);
    assert_eq!(session.capabilities().max_width, 16384);

    let sources = session
        .configure(Queue::Source, &PortFormat::video(Encoding::I420, 8, 8), 1)
        .unwrap();
    assert_eq!(sources, 1);
    assert_eq!(session.port(Queue::Source).requirements().num, 1);
    assert_eq!(session.port(Queue::Source).format().video.width, 64);

    session.start_streaming(Queue::Source, |_, _| {}).unwrap();
    assert!(matches!(session.stop(), Err(Error::InvalidState(_))));
    session.stop_streaming(Queue::Source).unwrap();
    assert!(!session.component().is_enabled());
}

#[test]
fn component_without_enough_ports_is_refused() {
    let firmware = LoopbackFirmware::new();
    firmware.register_component("ril.video_decode", ComponentSpec::new(1, 0));
    let setup = setup_with(firmware, fast_config());

    assert!(matches!(
        Mem2Mem::new(&setup.instance, Role::Decode),
        Err(Error::ProtocolViolation(_))
    ));
    assert_eq!(setup.firmware.component_count(), 0);
}
