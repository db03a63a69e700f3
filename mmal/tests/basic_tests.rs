// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Basic integration tests for the MMAL client.
//!
//! These tests drive components of the loopback firmware through their
//! whole life: creation, format negotiation, parameters and a complete
//! decode session.
//!
//! # Test Coverage
//!
//! - Component creation, discovery and destruction
//! - Format and buffer requirement negotiation
//! - Parameter access, including oversized reads
//! - End-to-end decoding with inline and bulk payloads

mod common;

use std::{sync::mpsc, thread, time::Duration};

use mmal::{
    Buffer, BufferFlags, BufferState, Error, PortEvent, PortFormat, PortState, VideoProfile,
    config::Config,
    format::Encoding,
    loopback::{ComponentSpec, LoopbackFirmware},
};
use tracing::info;

use crate::common::*;

#[test]
fn create_and_destroy_decoder() {
    let setup = setup_test(fast_config());

    let version = setup.instance.firmware_version().unwrap();
    assert_eq!((version.major, version.minor), (0, 4));

    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    assert_eq!(decoder.inputs().len(), 1);
    assert_eq!(decoder.outputs().len(), 1);
    assert!(decoder.clocks().is_empty());
    assert_eq!(setup.firmware.component_count(), 1);

    let input = decoder.input(0).unwrap();
    assert_eq!(input.state(), PortState::Disabled);
    assert_eq!(input.format().encoding, Encoding::H264);
    assert_eq!(decoder.output(0).unwrap().format().encoding, Encoding::I420);
    assert!(matches!(decoder.output(1), Err(Error::InvalidArg)));
    info!("Created {} with input {}", decoder.name(), input);

    decoder.destroy().unwrap();
    assert_eq!(setup.firmware.component_count(), 0);
    setup.instance.destroy().unwrap();
}

#[test]
fn unknown_component_is_not_found() {
    let setup = setup_test(fast_config());
    assert!(matches!(
        setup.instance.create_component("ril.teleporter"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(setup.instance.create_component(""), Err(Error::InvalidArg)));
    assert_eq!(setup.firmware.component_count(), 0);
}

#[test]
fn component_limit_is_resource_exhaustion() {
    let setup = setup_test(fast_config());
    setup.firmware.set_max_components(1);

    let first = setup.instance.create_component("ril.video_encode").unwrap();
    assert!(matches!(
        setup.instance.create_component("ril.video_encode"),
        Err(Error::ResourceExhausted)
    ));

    first.destroy().unwrap();
    let second = setup.instance.create_component("ril.video_encode").unwrap();
    second.destroy().unwrap();
}

#[test]
fn rejected_format_leaves_port_unchanged() {
    let setup = setup_test(fast_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let output = decoder.output(0).unwrap();
    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();
    let before = output.format();

    // The decoder only produces raw frames.
    assert!(matches!(
        output.set_format(&PortFormat::video(Encoding::H264, 64, 64)),
        Err(Error::InvalidFormat)
    ));
    assert_eq!(output.format(), before);

    // Raw video without a geometry never reaches the firmware.
    let sets = setup.firmware.messages_received(mmal_sys::MSG_TYPE_PORT_INFO_SET);
    assert!(matches!(
        output.set_format(&PortFormat::video(Encoding::I420, 0, 0)),
        Err(Error::InvalidFormat)
    ));
    // Neither does one too large to size.
    assert!(matches!(
        output.set_format(&PortFormat::video(Encoding::I420, 70_000, 70_000)),
        Err(Error::InvalidFormat)
    ));
    assert_eq!(setup.firmware.messages_received(mmal_sys::MSG_TYPE_PORT_INFO_SET), sets);

    // A rejected negotiation does not keep the port claimed.
    output.set_format(&PortFormat::video(Encoding::I420, 128, 64)).unwrap();
    assert_eq!(output.format().video.width, 128);
}

#[test]
fn negotiated_format_sets_requirements() {
    let setup = setup_test(fast_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let output = decoder.output(0).unwrap();

    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();
    let requirements = output.requirements();
    assert_eq!(requirements.size_min, 64 * 64 * 3 / 2);
    assert!(requirements.size >= requirements.size_min);

    assert!(matches!(output.set_buffer_requirements(1, 100), Err(Error::InvalidArg)));
    output.set_buffer_requirements(6, 8192).unwrap();
    assert_eq!(output.requirements().num, 6);
    assert_eq!(output.requirements().size, 8192);
}

#[test]
fn allocated_pool_keeps_port_busy() {
    let setup = setup_test(fast_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let output = decoder.output(0).unwrap();
    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();

    let pool = output.allocate_buffers(3).unwrap();
    assert_eq!(pool.len(), 3);
    assert!(pool.iter().all(|buffer| buffer.is_pooled() && buffer.capacity() >= 6144));
    assert!(output.is_busy());
    assert!(matches!(
        output.set_format(&PortFormat::video(Encoding::I420, 128, 128)),
        Err(Error::Busy)
    ));

    drop(pool);
    assert!(!output.is_busy());
    output.set_format(&PortFormat::video(Encoding::I420, 128, 128)).unwrap();
    assert_eq!(output.format().video.width, 128);
}

#[test]
fn pool_cannot_be_allocated_while_a_format_is_negotiated() {
    let config = Config { request_timeout_ms: 5000, ..fast_config() };
    let setup = setup_test(config);
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let output = decoder.output(0).unwrap().clone();
    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();

    setup.firmware.set_defer_replies(true);
    let sets = setup.firmware.messages_received(mmal_sys::MSG_TYPE_PORT_INFO_SET);
    let negotiating = output.clone();
    let pending =
        thread::spawn(move || negotiating.set_format(&PortFormat::video(Encoding::I420, 320, 240)));
    assert!(wait_until(|| {
        setup.firmware.messages_received(mmal_sys::MSG_TYPE_PORT_INFO_SET) == sets + 1
    }));

    assert!(matches!(output.allocate_buffers(2), Err(Error::Busy)));
    assert!(matches!(
        output.set_buffer_requirements(4, 1 << 20),
        Err(Error::Busy)
    ));
    assert!(matches!(output.enable(|_, _| {}), Err(Error::Busy)));
    assert!(!output.is_busy());
    assert_eq!(output.state(), PortState::Disabled);

    setup.firmware.set_defer_replies(false);
    setup.firmware.flush_deferred();
    pending.join().unwrap().unwrap();
    assert_eq!(output.format().video.width, 320);

    let pool = output.allocate_buffers(2).unwrap();
    assert!(pool.iter().all(|buffer| buffer.capacity() >= 320 * 240 * 3 / 2));
}

#[test]
fn format_is_fixed_while_enabled() {
    let setup = setup_test(fast_config());
    let encoder = setup.instance.create_component("ril.video_encode").unwrap();
    let input = encoder.input(0).unwrap();
    input.set_format(&PortFormat::video(Encoding::NV12, 320, 240)).unwrap();

    input.enable(|_, _| {}).unwrap();
    assert!(matches!(input.enable(|_, _| {}), Err(Error::InvalidState(_))));
    assert!(matches!(
        input.set_format(&PortFormat::video(Encoding::I420, 320, 240)),
        Err(Error::InvalidState(_))
    ));
    input.disable().unwrap();
    assert!(matches!(input.disable(), Err(Error::InvalidState(_))));
    input.set_format(&PortFormat::video(Encoding::I420, 320, 240)).unwrap();
}

#[test]
fn long_encoding_lists_are_read_in_two_steps() {
    let encodings: Vec<Encoding> = (0..45u8)
        .map(|i| Encoding::from_fourcc(&[b'T', b'0' + i / 10, b'0' + i % 10, b' ']))
        .collect();
    let firmware = LoopbackFirmware::new();
    firmware.register_component("vc.many_encodings", ComponentSpec::new(1, 1).with_encodings(&encodings, &[]));
    let setup = setup_with(firmware, fast_config());
    let component = setup.instance.create_component("vc.many_encodings").unwrap();
    let input = component.input(0).unwrap();

    let gets = setup.firmware.messages_received(mmal_sys::MSG_TYPE_PORT_PARAMETER_GET);
    assert_eq!(input.supported_encodings().unwrap(), encodings);
    assert_eq!(setup.firmware.messages_received(mmal_sys::MSG_TYPE_PORT_PARAMETER_GET), gets + 2);

    let mut short = vec![0u8; 40 * 4];
    match input.get_parameter(mmal_sys::PARAMETER_SUPPORTED_ENCODINGS, &mut short) {
        Err(Error::InsufficientSpace { required }) => assert_eq!(required, 180),
        other => panic!("expected InsufficientSpace, got {other:?}"),
    }
    let mut exact = vec![0u8; 180];
    assert_eq!(input.get_parameter(mmal_sys::PARAMETER_SUPPORTED_ENCODINGS, &mut exact).unwrap(), 180);
    assert_eq!(&exact[..4], b"T00 ");
}

#[test]
fn encoder_parameters() {
    let setup = setup_test(fast_config());
    let encoder = setup.instance.create_component("ril.video_encode").unwrap();
    let output = encoder.output(0).unwrap();

    output.set_bitrate(10_000_000).unwrap();
    assert_eq!(output.get_parameter_u32(mmal_sys::PARAMETER_VIDEO_BIT_RATE).unwrap(), 10_000_000);
    assert_eq!(
        setup.firmware.parameter(output.handle(), mmal_sys::PARAMETER_VIDEO_BIT_RATE),
        Some(10_000_000u32.to_le_bytes().to_vec())
    );

    assert!(matches!(
        output.get_parameter_u32(mmal_sys::PARAMETER_VIDEO_INTRAPERIOD),
        Err(Error::NotFound(_))
    ));
    output.set_intra_period(30).unwrap();
    assert_eq!(output.get_parameter_u32(mmal_sys::PARAMETER_VIDEO_INTRAPERIOD).unwrap(), 30);

    output
        .set_video_profile(VideoProfile {
            profile: mmal_sys::VIDEO_PROFILE_H264_HIGH,
            level: mmal_sys::VIDEO_LEVEL_H264_4,
        })
        .unwrap();
    output.set_h264_level(mmal_sys::VIDEO_LEVEL_H264_42).unwrap();
    assert_eq!(
        output.video_profile().unwrap(),
        VideoProfile { profile: mmal_sys::VIDEO_PROFILE_H264_HIGH, level: mmal_sys::VIDEO_LEVEL_H264_42 }
    );
    output.set_h264_profile(mmal_sys::VIDEO_PROFILE_H264_MAIN).unwrap();
    assert_eq!(output.video_profile().unwrap().level, mmal_sys::VIDEO_LEVEL_H264_42);

    output.set_rate_control(mmal_sys::VIDEO_RATECONTROL_VARIABLE).unwrap();
    output.request_key_frame().unwrap();
    assert_eq!(
        setup.firmware.parameter(output.handle(), mmal_sys::PARAMETER_VIDEO_REQUEST_I_FRAME),
        Some(vec![1, 0, 0, 0])
    );

    assert!(matches!(output.set_parameter(mmal_sys::PARAMETER_URI, &[0; 400]), Err(Error::InvalidArg)));
}

#[test]
fn decode_stream_end_to_end() {
    let setup = setup_test(copy_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let input = decoder.input(0).unwrap().clone();
    let output = decoder.output(0).unwrap().clone();
    input.set_format(&PortFormat::compressed_video(Encoding::H264)).unwrap();
    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();
    let frame_size = output.requirements().size as usize;

    let (events_tx, events) = mpsc::channel();
    output.set_event_callback(move |_, event| {
        let _ = events_tx.send(event);
    });
    let (frames_tx, frames) = mpsc::channel();
    let (consumed_tx, consumed) = mpsc::channel();
    decoder.enable().unwrap();
    output
        .enable(move |_, completion| {
            let _ = frames_tx.send(completion);
        })
        .unwrap();
    input
        .enable(move |_, completion| {
            let _ = consumed_tx.send(completion);
        })
        .unwrap();

    for index in 0..3 {
        output.submit_buffer(Buffer::new(index, frame_size)).unwrap();
    }

    // Small access units travel inline, the others as bulk transfers.
    let sizes = [64usize, 200, 32, 300, 100];
    for (index, size) in sizes.iter().enumerate() {
        let mut access_unit = Buffer::new(index as u32, 4096);
        assert!(access_unit.fill(&vec![index as u8 + 1; *size]));
        access_unit.flags = BufferFlags::FRAME_END;
        access_unit.pts = Some(index as i64 * 40_000_000);
        input.submit_buffer(access_unit).unwrap();
    }

    for (index, size) in sizes.iter().enumerate() {
        let frame = frames.recv_timeout(WAIT).unwrap();
        assert_eq!(frame.state, BufferState::Done);
        assert_eq!(frame.buffer.pts, Some(index as i64 * 40_000_000));
        assert_eq!(frame.buffer.payload(), vec![index as u8 + 1; *size].as_slice());
        assert!(!frame.buffer.is_last());
        output.submit_buffer(frame.buffer).unwrap();
    }
    for (completion, size) in recv_n(&consumed, sizes.len()).iter().zip(sizes) {
        assert_eq!(completion.state, BufferState::Done);
        assert_eq!(completion.buffer.len(), size);
    }
    assert_eq!(setup.firmware.bulk_bytes_received(), 500);

    input.send_end_of_stream().unwrap();
    let last = frames.recv_timeout(WAIT).unwrap();
    assert_eq!(last.state, BufferState::Done);
    assert!(last.buffer.is_last());
    assert!(last.buffer.is_empty());
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::EndOfStream);

    assert!(wait_until(|| input.buffers_with_firmware() == 0));
    assert_eq!(output.buffers_with_firmware(), 2);

    input.disable().unwrap();
    output.disable().unwrap();
    assert_eq!(output.buffers_with_firmware(), 0);
    let flushed = recv_n(&frames, 2);
    assert!(flushed.iter().all(|frame| frame.state == BufferState::Error));

    decoder.destroy().unwrap();
    assert_eq!(input.state(), PortState::Destroyed);
    drop(input);
    drop(output);
    setup.instance.destroy().unwrap();
}

#[test]
fn decoder_reports_the_stream_geometry_once() {
    let firmware = LoopbackFirmware::new();
    firmware.register_component(
        "ril.video_decode",
        ComponentSpec::new(1, 1).with_encodings(&[Encoding::H264], &[Encoding::I420]),
    );
    let setup = setup_with(firmware, copy_config());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();
    let input = decoder.input(0).unwrap();
    let output = decoder.output(0).unwrap();
    input.set_format(&PortFormat::compressed_video(Encoding::H264)).unwrap();
    assert_eq!(input.format().video.width, 0);
    output.set_format(&PortFormat::video(Encoding::I420, 64, 64)).unwrap();
    let frame_size = output.requirements().size as usize;

    let (events_tx, events) = mpsc::channel();
    output.set_event_callback(move |_, event| {
        let _ = events_tx.send(event);
    });
    let (frames_tx, frames) = mpsc::channel();
    let (consumed_tx, consumed) = mpsc::channel();
    decoder.enable().unwrap();
    output
        .enable(move |_, completion| {
            let _ = frames_tx.send(completion);
        })
        .unwrap();
    input
        .enable(move |_, completion| {
            let _ = consumed_tx.send(completion);
        })
        .unwrap();
    output.submit_buffer(Buffer::new(0, frame_size)).unwrap();
    output.submit_buffer(Buffer::new(1, frame_size)).unwrap();

    let mut access_unit = Buffer::new(0, 8192);
    assert!(access_unit.fill(&[0x42; 4000]));
    access_unit.flags = BufferFlags::FRAME_END;
    input.submit_buffer(access_unit).unwrap();
    let completion = consumed.recv_timeout(WAIT).unwrap();
    assert_eq!(completion.state, BufferState::Done);
    assert_eq!(completion.buffer.len(), 4000);
    assert!(consumed.recv_timeout(Duration::from_millis(50)).is_err());

    setup.firmware.emit_format_changed(output.handle(), 1920, 1080);
    match events.recv_timeout(WAIT).unwrap() {
        PortEvent::SourceChanged(change) => {
            assert_eq!((change.format.video.width, change.format.video.height), (1920, 1080));
        }
        other => panic!("expected a source change, got {other:?}"),
    }
    assert_eq!(output.format().video.width, 1920);
    assert_eq!(output.format().video.height, 1080);
    assert_eq!(output.requirements().size_min, 1920 * 1080 * 3 / 2);
    // Raised exactly once: the next event is the one emitted after it.
    setup.firmware.emit_error(output.handle(), mmal_sys::STATUS_EIO);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), PortEvent::Error(mmal_sys::STATUS_EIO));

    input.disable().unwrap();
    output.disable().unwrap();
    assert_eq!(output.buffers_with_firmware(), 0);
    let returned: Vec<_> = frames.try_iter().collect();
    assert_eq!(returned.len(), 2);
    assert!(returned.iter().all(|frame| frame.state == BufferState::Error));

    decoder.destroy().unwrap();
    assert_eq!(setup.firmware.component_count(), 0);
}
