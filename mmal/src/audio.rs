// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Client of the firmware's audio service.
//!
//! The audio service shares the message channel with MMAL but speaks its own
//! protocol: fixed 24 byte messages, a bare RESULT reply to the requests that
//! want one, and COMPLETE notifications as written audio is consumed.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use mmal_sys::audio::{
    AUDIO_MSG_CLOSE, AUDIO_MSG_COMPLETE, AUDIO_MSG_CONFIG, AUDIO_MSG_CONTROL, AUDIO_MSG_OPEN,
    AUDIO_MSG_RESULT, AUDIO_MSG_START, AUDIO_MSG_STOP, AUDIO_MSG_WRITE, AUDIO_WRITE_COOKIE1,
    AUDIO_WRITE_COOKIE2, AudioComplete, AudioConfig, AudioControl, AudioMsg, AudioResult,
    AudioStop, AudioWrite,
};
use tracing::{debug, error, trace, warn};
use zerocopy::{
    IntoBytes,
    little_endian::{I32, U16, U32},
};

use crate::{
    Error, Result,
    channel::{BulkTransfer, DispatchedService, MessageChannel, ServiceHandle, ServiceId},
    config::Config,
    sync::{Condvar, Mutex},
};

/// Receives the byte count of every completed write.
pub type CompleteCallback = Box<dyn FnMut(u32) + Send>;

/// Output routing and volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioControls {
    /// Firmware volume units; negative is quieter.
    pub volume: i32,
    /// Output destination (0 auto, 1 headphones, 2 HDMI).
    pub dest: u32,
}

/// Sample format of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub channels: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u32,
}

/// RESULT bookkeeping. The service answers requests in order, so the
/// replies of abandoned requests are the next ones to arrive.
#[derive(Default)]
struct Results {
    latest: Option<i32>,
    /// Requests that timed out but may still be answered.
    abandoned: usize,
}

/// State shared with the dispatch thread.
#[derive(Default)]
struct Shared {
    results: Mutex<Results>,
    answered: Condvar,
    on_complete: Mutex<Option<CompleteCallback>>,
}

impl Shared {
    fn handle_message(&self, message: &[u8]) {
        let Some(msg) = mmal_sys::decode_body::<AudioMsg>(message) else {
            warn!("Dropping runt audio message of {} bytes", message.len());
            return;
        };
        match msg.msg_type.get() {
            AUDIO_MSG_RESULT => {
                let success = msg.body_as::<AudioResult>().map_or(-1, |result| result.success.get());
                let mut results = self.results.lock();
                if results.abandoned > 0 {
                    results.abandoned -= 1;
                    debug!("Dropping late audio result {}", success);
                    return;
                }
                results.latest = Some(success);
                self.answered.notify_all();
            }
            AUDIO_MSG_COMPLETE => {
                let Some(complete) = msg.body_as::<AudioComplete>() else {
                    return;
                };
                if complete.cookie1.get() != AUDIO_WRITE_COOKIE1
                    || complete.cookie2.get() != AUDIO_WRITE_COOKIE2
                {
                    error!("Audio completion with invalid cookie");
                    return;
                }
                let count = complete.count.get();
                if count < 0 {
                    warn!("Audio write failed with {}", count);
                    return;
                }
                trace!("Audio consumed {} bytes", count);
                if let Some(callback) = self.on_complete.lock().as_mut() {
                    callback(count as u32);
                }
            }
            other => warn!("Unexpected audio message type {}", other),
        }
    }
}

/// An open audio stream.
///
/// Requests go out one at a time; those that expect a RESULT wait for it
/// up to [`Config::audio_request_timeout`].
pub struct AudioService {
    channel: Arc<dyn MessageChannel>,
    service: Mutex<DispatchedService>,
    handle: ServiceHandle,
    shared: Arc<Shared>,
    request: Mutex<()>,
    controls: Mutex<AudioControls>,
    max_packet: u16,
    timeout: Duration,
}

impl AudioService {
    /// Opens the audio service and the stream on it.
    ///
    /// Writes travel as inline packets of [`Config::audio_max_packet`]
    /// bytes, unless the firmware predates version 2 of the service or
    /// [`Config::force_bulk`] is set, in which case each write is one bulk
    /// transfer.
    pub fn open(channel: Arc<dyn MessageChannel>, config: &Config) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::default());
        let dispatch = shared.clone();
        let service = DispatchedService::open(
            channel.as_ref(),
            ServiceId::AUDIO,
            "auds-dispatch",
            move |message| dispatch.handle_message(message),
        )?;
        let handle = service.handle();
        let peer_version = channel.peer_version(handle);
        let max_packet =
            if peer_version < 2 || config.force_bulk { 0 } else { config.audio_max_packet };

        let audio = Self {
            channel,
            service: Mutex::new(service),
            handle,
            shared,
            request: Mutex::new(()),
            controls: Mutex::new(AudioControls::default()),
            max_packet,
            timeout: config.audio_request_timeout(),
        };
        audio.send(&AudioMsg::new(AUDIO_MSG_OPEN, &()), false)?;
        debug!("Opened audio stream, peer version {}, max packet {}", peer_version, max_packet);
        Ok(audio)
    }

    /// Bytes per inline write packet; zero when writes use bulk transfers.
    pub fn max_packet(&self) -> u16 {
        self.max_packet
    }

    /// Registers the callback receiving write completions.
    pub fn set_complete_callback<F>(&self, callback: F)
    where
        F: FnMut(u32) + Send + 'static,
    {
        *self.shared.on_complete.lock() = Some(Box::new(callback));
    }

    pub fn set_controls(&self, controls: AudioControls) -> Result<()> {
        *self.controls.lock() = controls;
        self.send_controls(controls)
    }

    fn send_controls(&self, controls: AudioControls) -> Result<()> {
        let body = AudioControl { volume: I32::new(controls.volume), dest: U32::new(controls.dest) };
        self.send(&AudioMsg::new(AUDIO_MSG_CONTROL, &body), true)
    }

    /// Configures the sample format. The current controls are sent again
    /// first, since the stream may not have existed when they were set.
    pub fn set_params(&self, params: AudioParams) -> Result<()> {
        let controls = *self.controls.lock();
        self.send_controls(controls)?;
        let body = AudioConfig {
            channels: U32::new(params.channels),
            samplerate: U32::new(params.sample_rate),
            bps: U32::new(params.bits_per_sample),
        };
        self.send(&AudioMsg::new(AUDIO_MSG_CONFIG, &body), true)
    }

    pub fn start(&self) -> Result<()> {
        self.send(&AudioMsg::new(AUDIO_MSG_START, &()), false)
    }

    /// Stops playback, discarding queued audio.
    pub fn stop(&self) -> Result<()> {
        self.send(&AudioMsg::new(AUDIO_MSG_STOP, &AudioStop::default()), false)
    }

    /// Stops playback once queued audio has played out.
    pub fn drain(&self) -> Result<()> {
        let body = AudioStop { draining: U32::new(1) };
        self.send(&AudioMsg::new(AUDIO_MSG_STOP, &body), false)
    }

    /// Queues `samples` for playback. Completion is reported through the
    /// complete callback.
    pub fn write(&self, samples: &[u8]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let count = u32::try_from(samples.len()).map_err(|_| Error::InvalidArg)?;
        let body = AudioWrite {
            count: U32::new(count),
            cookie1: U32::new(AUDIO_WRITE_COOKIE1),
            cookie2: U32::new(AUDIO_WRITE_COOKIE2),
            silence: U16::new(0),
            max_packet: U16::new(self.max_packet),
        };

        let _request = self.request.lock();
        self.channel.send(self.handle, AudioMsg::new(AUDIO_MSG_WRITE, &body).as_bytes())?;
        let sent = if self.max_packet == 0 {
            self.channel.bulk_transfer(self.handle, BulkTransfer::Transmit(samples))
        } else {
            samples
                .chunks(self.max_packet.into())
                .try_for_each(|packet| self.channel.send(self.handle, packet))
        };
        sent.inspect_err(|error| error!("Audio write of {} bytes failed: {}", samples.len(), error))
    }

    /// Closes the stream and the service.
    pub fn close(self) -> Result<()> {
        let result = self.send(&AudioMsg::new(AUDIO_MSG_CLOSE, &()), true);
        let closed = self.service.lock().close(self.channel.as_ref());
        result.and(closed)
    }

    fn send(&self, msg: &AudioMsg, wait: bool) -> Result<()> {
        if wait && self.service.lock().is_current_thread() {
            return Err(Error::InvalidState(
                "audio request issued from a completion callback".to_string(),
            ));
        }
        let _request = self.request.lock();
        if wait {
            self.shared.results.lock().latest = None;
        }
        self.channel.send(self.handle, msg.as_bytes()).inspect_err(|error| {
            error!("Audio message {} failed to queue: {}", msg.msg_type.get(), error)
        })?;
        if !wait {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        let mut results = self.shared.results.lock();
        loop {
            if let Some(success) = results.latest.take() {
                return match success {
                    0 => Ok(()),
                    code => {
                        error!("Audio message {} answered {}", msg.msg_type.get(), code);
                        Err(Error::Remote(code as u32))
                    }
                };
            }
            let now = Instant::now();
            if now >= deadline {
                error!("Audio message {} timed out", msg.msg_type.get());
                results.abandoned += 1;
                return Err(Error::Timeout);
            }
            results = self.shared.answered.wait_timeout(results, deadline - now).0;
        }
    }
}

impl Drop for AudioService {
    fn drop(&mut self) {
        if let Err(error) = self.service.lock().close(self.channel.as_ref()) {
            error!("Failed to close audio service on drop: {:?}", error);
        }
    }
}

impl fmt::Debug for AudioService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioService")
            .field("handle", &self.handle)
            .field("max_packet", &self.max_packet)
            .finish()
    }
}
