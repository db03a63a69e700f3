// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer exchange tests.
//!
//! Covers ordering and accounting of submitted buffers, the transfer mode
//! chosen for each payload, end-of-stream handling and shared memory
//! bookkeeping.

mod common;

use std::{sync::mpsc, thread, time::Duration};

use mmal::{
    Buffer, BufferCompletion, BufferFlags, BufferState, Component, Error, PortEvent, PortFormat,
    PortState,
    config::Config,
    format::Encoding,
    loopback::{ComponentSpec, LoopbackFirmware},
    memory::MemHandle,
};

use crate::common::*;

/// A firmware whose only component holds output buffers until the test
/// produces data, and consumes its input without producing anything.
fn held_firmware() -> LoopbackFirmware {
    let firmware = LoopbackFirmware::new();
    firmware.register_component("vc.held", ComponentSpec::new(1, 1));
    firmware
}

/// Enables `component` and its first output, forwarding completions and
/// events to the returned receivers.
fn start_output(
    component: &Component,
) -> (mpsc::Receiver<BufferCompletion>, mpsc::Receiver<PortEvent>) {
    let output = component.output(0).unwrap();
    let (events_tx, events) = mpsc::channel();
    output.set_event_callback(move |_, event| {
        let _ = events_tx.send(event);
    });
    let (done_tx, done) = mpsc::channel();
    component.enable().unwrap();
    output
        .enable(move |_, completion| {
            let _ = done_tx.send(completion);
        })
        .unwrap();
    (done, events)
}

#[test]
fn buffers_complete_in_submission_order() {
    let setup = setup_with(held_firmware(), copy_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let (done, _events) = start_output(&component);
    let output = component.output(0).unwrap();

    for index in 0..4 {
        output.submit_buffer(Buffer::new(index, 4096)).unwrap();
    }
    assert_eq!(output.buffers_with_firmware(), 4);
    assert!(wait_until(|| setup.firmware.held_count(output.handle()) == 4));

    for frame in 0..4i64 {
        let payload = format!("frame {frame}");
        assert!(setup.firmware.produce_output(
            output.handle(),
            payload.as_bytes(),
            BufferFlags::FRAME_END,
            frame * 33_000,
        ));
    }
    let completions = recv_n(&done, 4);
    for (frame, completion) in completions.iter().enumerate() {
        assert_eq!(completion.state, BufferState::Done);
        assert_eq!(completion.buffer.index(), frame as u32);
        assert_eq!(completion.buffer.payload(), format!("frame {frame}").as_bytes());
        assert_eq!(completion.buffer.pts, Some(frame as i64 * 33_000_000));
        assert!(completion.buffer.flags.contains(BufferFlags::FRAME_END));
    }
    assert_eq!(output.buffers_with_firmware(), 0);
    assert!(!setup.firmware.produce_output(output.handle(), b"late", BufferFlags::empty(), 0));
}

#[test]
fn empty_returns_complete_as_errors() {
    let setup = setup_with(held_firmware(), copy_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let (done, _events) = start_output(&component);
    let output = component.output(0).unwrap();

    output.submit_buffer(Buffer::new(0, 1024)).unwrap();
    output.submit_buffer(Buffer::new(1, 1024)).unwrap();
    assert!(wait_until(|| setup.firmware.held_count(output.handle()) == 2));
    assert_eq!(setup.firmware.return_held(output.handle()), 2);

    for completion in recv_n(&done, 2) {
        assert_eq!(completion.state, BufferState::Error);
        assert!(completion.buffer.is_empty());
    }
    assert_eq!(output.buffers_with_firmware(), 0);
}

#[test]
fn end_of_stream_is_reported_once_per_session() {
    let setup = setup_with(held_firmware(), copy_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let (done, events) = start_output(&component);
    let output = component.output(0).unwrap();

    for index in 0..2 {
        output.submit_buffer(Buffer::new(index, 1024)).unwrap();
    }
    assert!(wait_until(|| setup.firmware.held_count(output.handle()) == 2));
    for _ in 0..2 {
        assert!(setup.firmware.produce_output(output.handle(), &[], BufferFlags::EOS, 0));
    }
    for completion in recv_n(&done, 2) {
        assert_eq!(completion.state, BufferState::Done);
        assert!(completion.buffer.is_last());
    }
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::EndOfStream);
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

    // A new streaming session reports end of stream again.
    output.disable().unwrap();
    let (done_tx, done) = mpsc::channel();
    output
        .enable(move |_, completion| {
            let _ = done_tx.send(completion);
        })
        .unwrap();
    output.submit_buffer(Buffer::new(0, 1024)).unwrap();
    assert!(wait_until(|| setup.firmware.held_count(output.handle()) == 1));
    assert!(setup.firmware.produce_output(output.handle(), &[], BufferFlags::EOS, 0));
    assert!(done.recv_timeout(WAIT).unwrap().buffer.is_last());
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::EndOfStream);
}

#[test]
fn rejected_submissions_return_the_buffer() {
    let setup = setup_with(held_firmware(), copy_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let output = component.output(0).unwrap();

    let error = output.submit_buffer(Buffer::new(3, 512)).unwrap_err();
    assert!(matches!(error.error, Error::InvalidState(_)));
    assert_eq!(error.buffer.index(), 3);

    let (_done, _events) = start_output(&component);
    output.submit_buffer(Buffer::new(7, 512)).unwrap();
    let error = output.submit_buffer(Buffer::new(7, 512)).unwrap_err();
    assert!(matches!(error.error, Error::ProtocolViolation(_)));
    assert_eq!(error.buffer.index(), 7);
    assert_eq!(output.buffers_with_firmware(), 1);
}

#[test]
fn shared_memory_is_released_once_per_submission() {
    let setup = setup_with(held_firmware(), fast_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let (done, _events) = start_output(&component);
    let output = component.output(0).unwrap();

    for index in 0..3 {
        output.submit_buffer(Buffer::new(index, 2048)).unwrap();
    }
    assert_eq!(setup.memory.imports(), 3);
    assert_eq!(setup.memory.live(), 3);
    assert!(wait_until(|| setup.firmware.held_count(output.handle()) == 3));

    for _ in 0..3 {
        assert!(setup.firmware.produce_output(output.handle(), &[0; 600], BufferFlags::empty(), 0));
    }
    let completions = recv_n(&done, 3);
    assert!(completions.iter().all(|c| c.state == BufferState::Done && c.buffer.len() == 600));
    assert!(completions.iter().all(|c| !c.buffer.is_mapped()));
    assert!(setup.memory.all_released_once());
    // Shared payloads never cross the channel.
    assert_eq!(setup.firmware.bulk_bytes_received(), 0);
}

#[test]
fn failed_send_gives_everything_back() {
    let setup = setup_with(held_firmware(), fast_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let (_done, _events) = start_output(&component);
    let output = component.output(0).unwrap();

    setup.firmware.set_fail_sends(true);
    let error = output.submit_buffer(Buffer::new(0, 2048)).unwrap_err();
    assert!(matches!(error.error, Error::Transport(_)));
    assert!(!error.buffer.is_mapped());
    assert_eq!(output.buffers_with_firmware(), 0);
    assert_eq!(setup.memory.imports(), 1);
    assert_eq!(setup.memory.live(), 0);
    assert_eq!(setup.memory.releases_of(MemHandle(1)), 1);

    setup.firmware.set_fail_sends(false);
    output.submit_buffer(error.buffer).unwrap();
    assert_eq!(output.buffers_with_firmware(), 1);
}

#[test]
fn small_payloads_travel_inline() {
    let config = Config { max_inline_payload: 16, ..copy_config() };
    let setup = setup_with(held_firmware(), config);
    let component = setup.instance.create_component("vc.held").unwrap();
    let input = component.input(0).unwrap();
    let (done_tx, done) = mpsc::channel();
    input
        .enable(move |_, completion| {
            let _ = done_tx.send(completion);
        })
        .unwrap();

    let mut inline = Buffer::new(0, 64);
    inline.fill(&[1; 16]);
    input.submit_buffer(inline).unwrap();
    let mut bulk = Buffer::new(1, 64);
    bulk.fill(&[2; 17]);
    input.submit_buffer(bulk).unwrap();

    let completions = recv_n(&done, 2);
    assert_eq!(completions[0].buffer.len(), 16);
    assert_eq!(completions[1].buffer.len(), 17);
    assert!(completions.iter().all(|c| c.state == BufferState::Done));
    assert_eq!(setup.firmware.bulk_bytes_received(), 17);
}

#[test]
fn reserved_end_of_stream_buffer_is_single() {
    let setup = setup_with(held_firmware(), copy_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let input = component.input(0).unwrap();
    let output = component.output(0).unwrap();
    input.enable(|_, _| {}).unwrap();
    let (_done, _events) = start_output(&component);

    assert!(matches!(output.send_end_of_stream(), Err(Error::InvalidState(_))));

    setup.firmware.set_unresponsive(true);
    input.send_end_of_stream().unwrap();
    assert!(matches!(input.send_end_of_stream(), Err(Error::Busy)));
    // The reserved buffer is not accounted as a submitted buffer.
    assert_eq!(input.buffers_with_firmware(), 0);
    setup.firmware.set_unresponsive(false);
}

#[test]
fn end_of_stream_passes_through_to_output() {
    let setup = setup_test(copy_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let input = decoder.input(0).unwrap();
    let output = decoder.output(0).unwrap();
    output.set_format(&PortFormat::video(Encoding::I420, 32, 32)).unwrap();
    input.enable(|_, _| {}).unwrap();
    let (done, events) = start_output(&decoder);

    output.submit_buffer(Buffer::new(0, 2048)).unwrap();
    input.send_end_of_stream().unwrap();
    let last = done.recv_timeout(WAIT).unwrap();
    assert_eq!(last.state, BufferState::Done);
    assert!(last.buffer.is_last());
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::EndOfStream);

    // The reserved buffer came back, so it can be sent again.
    assert!(wait_until(|| input.send_end_of_stream().is_ok()));
}

#[test]
fn timestamps_survive_the_round_trip() {
    let setup = setup_test(copy_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let input = decoder.input(0).unwrap();
    let output = decoder.output(0).unwrap();
    output.set_format(&PortFormat::video(Encoding::I420, 32, 32)).unwrap();
    input.enable(|_, _| {}).unwrap();
    let (done, _events) = start_output(&decoder);

    let stamps = [(Some(1_234_567_000), None), (Some(1_234_567_890), Some(40)), (None, Some(-5_000))];
    for index in 0..stamps.len() as u32 {
        output.submit_buffer(Buffer::new(index, 2048)).unwrap();
    }
    for (index, (pts, dts)) in stamps.iter().enumerate() {
        let mut buffer = Buffer::new(index as u32, 256);
        buffer.fill(b"access unit");
        buffer.pts = *pts;
        buffer.dts = *dts;
        input.submit_buffer(buffer).unwrap();
    }

    let frames = recv_n(&done, 3);
    // Nanoseconds below a microsecond do not survive.
    assert_eq!((frames[0].buffer.pts, frames[0].buffer.dts), (Some(1_234_567_000), None));
    assert_eq!((frames[1].buffer.pts, frames[1].buffer.dts), (Some(1_234_567_000), Some(0)));
    assert_eq!((frames[2].buffer.pts, frames[2].buffer.dts), (None, Some(-5_000)));
}

#[test]
fn flush_returns_buffers_and_keeps_streaming() {
    let setup = setup_with(held_firmware(), copy_config());
    let component = setup.instance.create_component("vc.held").unwrap();
    let (done, _events) = start_output(&component);
    let output = component.output(0).unwrap();

    output.submit_buffer(Buffer::new(0, 256)).unwrap();
    output.submit_buffer(Buffer::new(1, 256)).unwrap();
    output.flush().unwrap();
    assert!(recv_n(&done, 2).iter().all(|c| c.state == BufferState::Error));
    assert_eq!(output.buffers_with_firmware(), 0);

    output.submit_buffer(Buffer::new(0, 256)).unwrap();
    assert!(wait_until(|| setup.firmware.held_count(output.handle()) == 1));
    assert!(setup.firmware.produce_output(output.handle(), b"after flush", BufferFlags::empty(), 0));
    assert_eq!(done.recv_timeout(WAIT).unwrap().buffer.payload(), b"after flush");
}

#[test]
fn firmware_events_reach_the_event_callback() {
    let setup = setup_test(copy_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let output = decoder.output(0).unwrap();
    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();
    let (_done, events) = start_output(&decoder);

    setup.firmware.emit_format_changed(output.handle(), 1280, 720);
    match events.recv_timeout(WAIT).unwrap() {
        PortEvent::SourceChanged(change) => {
            assert_eq!((change.format.video.width, change.format.video.height), (1280, 720));
            assert_eq!(change.buffer_size_min, 1280 * 720 * 3 / 2);
        }
        other => panic!("expected a source change, got {other:?}"),
    }
    assert_eq!(output.format().video.width, 1280);
    assert_eq!(output.format().encoding, Encoding::I420);
    assert_eq!(output.requirements().size_min, 1280 * 720 * 3 / 2);

    setup.firmware.emit_error(output.handle(), mmal_sys::STATUS_EIO);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::Error(mmal_sys::STATUS_EIO));
}

#[test]
fn format_changes_outside_streaming_raise_no_event() {
    let config = Config { drain_timeout_ms: 2000, ..copy_config() };
    let setup = setup_test(config);
    setup.firmware.set_keep_buffers_on_disable(true);
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let output = decoder.output(0).unwrap().clone();
    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();
    let (_done, events) = start_output(&decoder);
    output.submit_buffer(Buffer::new(0, 8192)).unwrap();

    // The firmware keeps the buffer, so the port stays disabling.
    let disabling = output.clone();
    let disable = thread::spawn(move || disabling.disable());
    assert!(wait_until(|| output.state() == PortState::Disabling));
    setup.firmware.emit_format_changed(output.handle(), 320, 240);
    assert!(wait_until(|| output.format().video.width == 320));
    // Events are dispatched in order: the error is the first thing raised.
    setup.firmware.emit_error(output.handle(), mmal_sys::STATUS_EIO);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::Error(mmal_sys::STATUS_EIO));

    assert_eq!(setup.firmware.return_held(output.handle()), 1);
    disable.join().unwrap().unwrap();
    assert_eq!(output.state(), PortState::Disabled);

    setup.firmware.emit_format_changed(output.handle(), 640, 480);
    assert!(wait_until(|| output.format().video.height == 480));
    assert_eq!(output.requirements().size_min, 640 * 480 * 3 / 2);
    setup.firmware.emit_error(output.handle(), mmal_sys::STATUS_EIO);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::Error(mmal_sys::STATUS_EIO));
    assert!(events.try_recv().is_err());
}
