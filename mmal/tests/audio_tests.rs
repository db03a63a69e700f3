// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Audio service tests against the loopback firmware.

mod common;

use std::{
    sync::{Arc, mpsc},
    thread,
};

use mmal::{
    Error,
    audio::{AudioControls, AudioParams, AudioService},
    config::Config,
    loopback::LoopbackFirmware,
};

use crate::common::*;

const STEREO_48K: AudioParams = AudioParams { channels: 2, sample_rate: 48_000, bits_per_sample: 16 };

fn open(firmware: &Arc<LoopbackFirmware>, config: &Config) -> AudioService {
    setup_logging();
    AudioService::open(firmware.clone(), config).unwrap()
}

#[test]
fn writes_are_split_into_packets() {
    let firmware = Arc::new(LoopbackFirmware::new());
    let config = Config { audio_max_packet: 1000, ..Config::default() };
    let audio = open(&firmware, &config);
    assert_eq!(audio.max_packet(), 1000);

    let (complete_tx, completed) = mpsc::channel();
    audio.set_complete_callback(move |count| {
        let _ = complete_tx.send(count);
    });
    audio.set_controls(AudioControls { volume: -200, dest: 1 }).unwrap();
    audio.set_params(STEREO_48K).unwrap();
    audio.start().unwrap();

    audio.write(&[0x55; 2500]).unwrap();
    assert_eq!(completed.recv_timeout(WAIT).unwrap(), 2500);
    assert_eq!(firmware.audio_packets(), 3);
    assert_eq!(firmware.audio_bulk_transfers(), 0);
    assert_eq!(firmware.audio_bytes_written(), 2500);

    audio.write(&[]).unwrap();
    assert_eq!(firmware.audio_packets(), 3);
    audio.drain().unwrap();
    audio.close().unwrap();
}

#[test]
fn old_firmware_gets_bulk_writes() {
    let firmware = Arc::new(LoopbackFirmware::new());
    firmware.set_peer_version(1);
    let audio = open(&firmware, &Config::default());
    assert_eq!(audio.max_packet(), 0);

    let (complete_tx, completed) = mpsc::channel();
    audio.set_complete_callback(move |count| {
        let _ = complete_tx.send(count);
    });
    audio.write(&[1; 6000]).unwrap();
    assert_eq!(completed.recv_timeout(WAIT).unwrap(), 6000);
    assert_eq!(firmware.audio_bulk_transfers(), 1);
    assert_eq!(firmware.audio_packets(), 0);
}

#[test]
fn bulk_writes_can_be_forced() {
    let firmware = Arc::new(LoopbackFirmware::new());
    let config = Config { force_bulk: true, ..Config::default() };
    let audio = open(&firmware, &config);
    assert_eq!(audio.max_packet(), 0);

    audio.write(&[2; 100]).unwrap();
    assert!(wait_until(|| firmware.audio_bytes_written() == 100));
    assert_eq!(firmware.audio_bulk_transfers(), 1);
    audio.stop().unwrap();
}

#[test]
fn firmware_refusals_are_reported() {
    let firmware = Arc::new(LoopbackFirmware::new());
    let audio = open(&firmware, &Config::default());

    firmware.set_audio_result(-1);
    assert!(matches!(audio.set_params(STEREO_48K), Err(Error::Remote(code)) if code == u32::MAX));
    firmware.set_audio_result(0);
    audio.set_params(STEREO_48K).unwrap();
}

#[test]
fn late_results_do_not_answer_the_next_request() {
    let firmware = Arc::new(LoopbackFirmware::new());
    let config = Config { audio_request_timeout_ms: 300, ..Config::default() };
    let audio = open(&firmware, &config);

    firmware.set_defer_replies(true);
    assert!(matches!(audio.set_params(STEREO_48K), Err(Error::Timeout)));
    assert_eq!(firmware.deferred_replies(), 1);

    // Both answers arrive while the second request waits, the stale
    // success first.
    firmware.set_audio_result(-1);
    let releasing = firmware.clone();
    let release = thread::spawn(move || {
        assert!(wait_until(|| releasing.deferred_replies() == 2));
        releasing.set_defer_replies(false);
        releasing.flush_deferred();
    });
    assert!(matches!(
        audio.set_controls(AudioControls::default()),
        Err(Error::Remote(code)) if code == u32::MAX
    ));
    release.join().unwrap();

    firmware.set_audio_result(0);
    audio.set_params(STEREO_48K).unwrap();
}

#[test]
fn audio_shares_the_channel_with_mmal() {
    let setup = setup_test(fast_config());
    let audio = open(&setup.firmware, &Config::default());
    let decoder = setup.instance.create_component("ril.video_decode").unwrap();

    audio.set_controls(AudioControls::default()).unwrap();
    assert!(matches!(
        AudioService::open(setup.firmware.clone(), &Config::default()),
        Err(Error::Transport(_))
    ));
    audio.close().unwrap();

    // The service can be opened again once closed.
    let again = open(&setup.firmware, &Config::default());
    again.start().unwrap();
    decoder.destroy().unwrap();
}
