//! The engine thread: sole owner of transport state, the active stream and its decoder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use audio_engine_types::{EngineEvent, ErrorKind, Track, TransportState};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select};

use crate::config::EngineConfig;
use crate::decode::SourceOpener;
use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::normalize::Normalizer;
use crate::output::{
    ErrorSink, OutputBackend, OutputFormat, OutputRequest, OutputStream, RenderCallback,
    RenderControls,
};
use crate::queue::QueueCoordinator;
use crate::ring::RingBuffer;
use crate::session::{DecodeFeed, DecodeSession, Notice};
use crate::status::{EngineShared, PlaybackInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Command {
    Play,
    Pause,
    Toggle,
    Stop,
    Next,
    Previous,
    Seek(u64),
    Shutdown,
}

impl Command {
    pub(super) fn name(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Toggle => "toggle",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::Seek(_) => "seek",
            Self::Shutdown => "shutdown",
        }
    }
}

pub(super) struct Request {
    pub command: Command,
    pub reply: Sender<EngineResult<()>>,
}

/// Everything that exists only while a track is loaded.
struct Active {
    /// Identifies the output stream in device error notices.
    token: u64,
    /// Identifies the current decode session in worker notices.
    session_token: u64,
    track: Track,
    format: OutputFormat,
    ring: Arc<RingBuffer>,
    controls: RenderControls,
    stream: Box<dyn OutputStream>,
    session: Option<DecodeSession>,
    device_retried: bool,
}

impl Active {
    fn source_rate(&self) -> u32 {
        self.track.sample_rate.unwrap_or(self.format.sample_rate)
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        // Silence first; the stream and the decode worker go down with the fields.
        self.controls.gate.store(true, Ordering::Release);
    }
}

pub(super) struct Controller {
    config: EngineConfig,
    backend: Arc<dyn OutputBackend>,
    opener: Arc<dyn SourceOpener>,
    shared: Arc<EngineShared>,
    queue: QueueCoordinator,
    bus: EventBus,
    notice_tx: Sender<Notice>,
    notice_rx: Receiver<Notice>,
    active: Option<Active>,
    next_token: u64,
    last_position: Option<u64>,
    seen_underrun_events: u64,
    seen_underrun_frames: u64,
}

impl Controller {
    pub(super) fn new(
        config: EngineConfig,
        backend: Arc<dyn OutputBackend>,
        opener: Arc<dyn SourceOpener>,
        shared: Arc<EngineShared>,
        queue: QueueCoordinator,
        bus: EventBus,
    ) -> Self {
        let (notice_tx, notice_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            backend,
            opener,
            shared,
            queue,
            bus,
            notice_tx,
            notice_rx,
            active: None,
            next_token: 0,
            last_position: None,
            seen_underrun_events: 0,
            seen_underrun_frames: 0,
        }
    }

    pub(super) fn run(mut self, commands: Receiver<Request>) {
        let notices = self.notice_rx.clone();
        let ticker = crossbeam_channel::tick(self.config.position_interval());
        tracing::debug!("engine thread started");

        loop {
            select! {
                recv(commands) -> msg => {
                    let Ok(Request { command, reply }) = msg else {
                        break;
                    };
                    if command == Command::Shutdown {
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    let result = self.handle(command);
                    if let Err(e) = &result {
                        tracing::debug!(command = command.name(), error = %e, "command rejected");
                    }
                    let _ = reply.send(result);
                }
                recv(notices) -> notice => {
                    if let Ok(notice) = notice {
                        self.on_notice(notice);
                    }
                }
                recv(ticker) -> _ => self.on_tick(),
            }
        }

        self.active = None;
        self.shared.clear_playback();
        self.set_state(TransportState::Stopped);
        tracing::info!("engine stopped");
    }

    fn handle(&mut self, command: Command) -> EngineResult<()> {
        match command {
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::Toggle => match self.shared.state() {
                TransportState::Playing => self.pause(),
                _ => self.play(),
            },
            Command::Stop => {
                self.stop();
                Ok(())
            }
            Command::Next => self.next(),
            Command::Previous => self.previous(),
            Command::Seek(frame) => self.seek(frame),
            Command::Shutdown => Ok(()),
        }
    }

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn set_state(&self, state: TransportState) {
        if self.shared.state() != state {
            self.shared.store_state(state);
            tracing::debug!(?state, "transport state");
            self.bus.publish(EngineEvent::StateChanged { state });
        }
    }

    fn report(&self, error: &EngineError, track: &Track) {
        tracing::warn!(path = %track.path.display(), error = %error, "playback error");
        self.bus.publish(EngineEvent::Error {
            kind: error.kind(),
            message: format!("{}: {error}", track.display_name()),
        });
    }

    fn play(&mut self) -> EngineResult<()> {
        match self.shared.state() {
            TransportState::Playing | TransportState::Seeking => Ok(()),
            TransportState::Paused if self.active.is_some() => self.resume(),
            _ => {
                let track = self.queue.dequeue_next()?;
                self.start_or_stop(track)
            }
        }
    }

    fn resume(&mut self) -> EngineResult<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active.controls.gate.store(false, Ordering::Release);
        if let Err(e) = active.stream.play() {
            active.controls.gate.store(true, Ordering::Release);
            self.fail_device(e.to_string());
            return Err(e);
        }
        self.set_state(TransportState::Playing);
        Ok(())
    }

    fn pause(&mut self) -> EngineResult<()> {
        if self.shared.state() != TransportState::Playing {
            return Ok(());
        }
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        active.controls.gate.store(true, Ordering::Release);
        if let Err(e) = active.stream.pause() {
            // The gate already silences output; a stuck device stream is not fatal here.
            tracing::warn!(error = %e, "device pause failed");
        }
        self.set_state(TransportState::Paused);
        self.publish_position();
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            self.queue.push_front(active.track.clone());
            drop(active);
            self.go_idle();
        } else {
            self.set_state(TransportState::Stopped);
        }
    }

    fn next(&mut self) -> EngineResult<()> {
        let track = self.queue.dequeue_next()?;
        if let Some(active) = self.active.take() {
            self.queue.push_history(active.track.clone());
        }
        self.start_or_stop(track)
    }

    fn previous(&mut self) -> EngineResult<()> {
        let track = self.queue.previous()?;
        if let Some(active) = self.active.take() {
            self.queue.push_front(active.track.clone());
        }
        self.start_or_stop(track)
    }

    fn seek(&mut self, frame: u64) -> EngineResult<()> {
        let Some(active) = self.active.as_ref() else {
            return Err(EngineError::InvalidSeek {
                position: frame,
                duration: 0,
            });
        };
        if !active.track.seekable {
            return Err(EngineError::SeekUnsupported);
        }
        if let Some(duration) = active.track.duration_frames {
            if frame >= duration {
                return Err(EngineError::InvalidSeek {
                    position: frame,
                    duration,
                });
            }
        }

        let stream_token = active.token;
        let prior = self.shared.state();
        self.set_state(TransportState::Seeking);
        let result = self.reposition(frame);
        if self.active.as_ref().map(|a| a.token) != Some(stream_token) {
            // The track was dropped or requeued; playback already moved on.
            return result;
        }
        if prior == TransportState::Playing {
            if let Some(active) = self.active.as_ref() {
                active.controls.gate.store(false, Ordering::Release);
            }
        }
        self.set_state(prior);
        self.publish_position();
        result
    }

    /// Halt decode-ahead, move the decoder, discard buffered audio and refill.
    ///
    /// If the decoder refuses the seek, the halted feed resumes exactly where it stopped.
    fn reposition(&mut self, frame: u64) -> EngineResult<()> {
        let session_token = self.next_token();
        let chunk = self.config.chunk_frames;
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let track = active.track.clone();
        let src_channels = track.channels.unwrap_or(active.format.channels) as usize;
        let normalizer = Normalizer::new(
            active.source_rate(),
            src_channels,
            active.format.sample_rate,
            active.format.channels as usize,
            chunk,
        )?;

        active.controls.gate.store(true, Ordering::Release);
        let Some(mut feed) = active.session.take().and_then(DecodeSession::halt) else {
            let error = EngineError::CorruptStream("decode worker exited".to_string());
            return self.abandon(&track, error);
        };

        let seeked = feed.decoder.seek(frame);
        match &seeked {
            Ok(_) => {
                active.ring.flush();
                feed.restart(normalizer);
            }
            Err(e) => tracing::warn!(requested = frame, error = %e, "seek failed, continuing"),
        }
        let prefill = self.config.prefill_frames(active.format.sample_rate);
        let spawned = DecodeSession::spawn(
            feed,
            active.ring.clone(),
            self.notice_tx.clone(),
            session_token,
            chunk,
            prefill,
        );
        match spawned {
            Ok(session) => {
                active.session = Some(session);
                active.session_token = session_token;
            }
            Err(e) => return self.abandon(&track, e),
        }

        let reached = seeked?;
        self.shared.clock.rebase(reached);
        self.shared.bump_generation();
        self.last_position = None;
        tracing::debug!(requested = frame, reached, "seek");
        self.await_refill(session_token, &track)
    }

    /// Wait for the post-seek refill without losing the track to a transient failure.
    fn await_refill(&mut self, session_token: u64, track: &Track) -> EngineResult<()> {
        loop {
            match self.wait_primed(session_token) {
                Ok(()) => return Ok(()),
                Err(EngineError::DeviceError(message)) => {
                    self.recover_device(message.clone());
                    if self.active.is_none() {
                        return Err(EngineError::DeviceError(message));
                    }
                }
                Err(EngineError::Timeout(what)) => {
                    // Keep the track; the worker is still filling and playback resumes late.
                    let error = EngineError::Timeout(what);
                    self.report(&error, track);
                    return Err(error);
                }
                Err(e) => return self.abandon(track, e),
            }
        }
    }

    /// Drop the current track after a decode failure and move on.
    fn abandon(&mut self, track: &Track, error: EngineError) -> EngineResult<()> {
        self.report(&error, track);
        self.set_state(TransportState::Stopped);
        self.active = None;
        self.advance();
        Err(error)
    }

    /// Start `track`, or settle in Stopped and surface why it could not start.
    fn start_or_stop(&mut self, track: Track) -> EngineResult<()> {
        match self.start_track(track.clone()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.report(&e, &track);
                self.go_idle();
                Err(e)
            }
        }
    }

    fn start_track(&mut self, track: Track) -> EngineResult<()> {
        self.active = None;
        let token = self.next_token();
        let session_token = self.next_token();
        let chunk = self.config.chunk_frames;

        let decoder = self.opener.open(&track)?;
        let resolved = decoder.track().clone();
        let (Some(src_rate), Some(src_channels)) = (resolved.sample_rate, resolved.channels)
        else {
            return Err(EngineError::UnsupportedFormat(format!(
                "{}: unknown sample rate or channel count",
                resolved.display_name()
            )));
        };

        let request = OutputRequest {
            device: self.config.device.name.clone(),
            sample_rate: src_rate,
            channels: src_channels,
        };
        let timeout = self.config.open_timeout();
        let format = retry_device(|| self.backend.negotiate(&request, timeout))?;

        let normalizer = Normalizer::new(
            src_rate,
            src_channels as usize,
            format.sample_rate,
            format.channels as usize,
            chunk,
        )?;
        let resampling = normalizer.is_resampling();
        let ring = Arc::new(RingBuffer::new(
            format.channels as usize,
            self.config.buffer_frames(format.sample_rate),
        ));
        let controls = RenderControls {
            gate: Arc::new(AtomicBool::new(true)),
            ..self.shared.controls.clone()
        };
        let stream = retry_device(|| self.open_stream(&format, &ring, &controls, token))?;

        self.shared
            .clock
            .reset(0, src_rate, format.sample_rate, resolved.duration_frames);
        self.shared.bump_generation();
        self.last_position = None;
        self.shared.set_playback(PlaybackInfo {
            track: Some(resolved.clone()),
            device: Some(format.device.clone()),
            output_sample_rate: Some(format.sample_rate),
            output_channels: Some(format.channels),
            resampling: Some(resampling),
            ring: Some(ring.clone()),
        });

        let session = DecodeSession::spawn(
            DecodeFeed::new(decoder, normalizer),
            ring.clone(),
            self.notice_tx.clone(),
            session_token,
            chunk,
            self.config.prefill_frames(format.sample_rate),
        )?;

        tracing::info!(
            path = %resolved.path.display(),
            device = %format.device,
            src_hz = src_rate,
            out_hz = format.sample_rate,
            channels = format.channels,
            resampling,
            "starting track"
        );
        self.active = Some(Active {
            token,
            session_token,
            track: resolved.clone(),
            format,
            ring,
            controls,
            stream,
            session: Some(session),
            device_retried: false,
        });

        if let Err(e) = self.wait_primed(session_token) {
            self.active = None;
            return Err(e);
        }
        let Some(active) = self.active.as_mut() else {
            return Err(EngineError::EngineClosed);
        };
        active.controls.gate.store(false, Ordering::Release);
        if let Err(e) = active.stream.play() {
            self.active = None;
            return Err(e);
        }

        self.bus.publish(EngineEvent::TrackChanged {
            track: Some(resolved),
        });
        self.set_state(TransportState::Playing);
        self.publish_position();
        Ok(())
    }

    fn open_stream(
        &self,
        format: &OutputFormat,
        ring: &Arc<RingBuffer>,
        controls: &RenderControls,
        token: u64,
    ) -> EngineResult<Box<dyn OutputStream>> {
        let render = RenderCallback::new(ring.clone(), controls.clone());
        let notices = self.notice_tx.clone();
        let on_error: ErrorSink = Arc::new(move |message| {
            let _ = notices.send(Notice::DeviceFailed { token, message });
        });
        self.backend
            .open(format, render, on_error, self.config.open_timeout())
    }

    /// Block until the worker for `session_token` has buffered the prefill.
    fn wait_primed(&mut self, session_token: u64) -> EngineResult<()> {
        let deadline = Instant::now() + self.config.refill_timeout();
        let stream_token = self.active.as_ref().map(|a| a.token);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.notice_rx.recv_timeout(left) {
                Ok(Notice::Primed { token }) if token == session_token => return Ok(()),
                Ok(Notice::Failed { token, error }) if token == session_token => return Err(error),
                Ok(Notice::DeviceFailed { token, message }) if Some(token) == stream_token => {
                    return Err(EngineError::DeviceError(message));
                }
                Ok(stale) => tracing::trace!(?stale, "ignoring stale notice"),
                Err(RecvTimeoutError::Timeout) => return Err(EngineError::Timeout("decoder prefill")),
                Err(RecvTimeoutError::Disconnected) => return Err(EngineError::EngineClosed),
            }
        }
    }

    fn on_notice(&mut self, notice: Notice) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        match notice {
            Notice::Finished { token } if token == active.session_token => {
                tracing::debug!(path = %active.track.path.display(), "decoder drained");
            }
            Notice::Failed { token, error } if token == active.session_token => {
                let track = active.track.clone();
                let _ = self.abandon(&track, error);
            }
            Notice::DeviceFailed { token, message } if token == active.token => {
                self.recover_device(message);
            }
            _ => {}
        }
    }

    /// One immediate re-open on the same ring; a second failure stops playback.
    fn recover_device(&mut self, message: String) {
        tracing::warn!(error = %message, "output stream failed");
        let retry = match self.active.as_ref() {
            Some(active) if !active.device_retried => self.open_stream(
                &active.format,
                &active.ring,
                &active.controls,
                active.token,
            ),
            Some(_) => Err(EngineError::DeviceError(message)),
            None => return,
        };
        // Mid-seek the gate stays closed until the seek restores it, so the stream may run.
        let playing = matches!(
            self.shared.state(),
            TransportState::Playing | TransportState::Seeking
        );
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.device_retried = true;
        match retry {
            Ok(mut stream) => {
                let started = if playing { stream.play() } else { Ok(()) };
                active.stream = stream;
                match started {
                    Ok(()) => tracing::info!(device = %active.format.device, "output stream reopened"),
                    Err(e) => self.fail_device(e.to_string()),
                }
            }
            Err(e) => self.fail_device(e.to_string()),
        }
    }

    /// Give up on the device: requeue the track, surface the error, stop.
    fn fail_device(&mut self, message: String) {
        let Some(active) = self.active.take() else {
            return;
        };
        let track = active.track.clone();
        drop(active);
        tracing::error!(error = %message, "output device lost");
        self.bus.publish(EngineEvent::Error {
            kind: ErrorKind::DeviceError,
            message,
        });
        self.queue.push_front(track);
        self.go_idle();
    }

    fn on_tick(&mut self) {
        if self.shared.state() != TransportState::Playing {
            return;
        }
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let drained = active.ring.is_drained();
        self.publish_position();
        self.publish_underruns();
        if drained {
            self.track_ended();
        }
    }

    fn publish_position(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let frame = self.shared.clock.current();
        if self.last_position != Some(frame) {
            self.last_position = Some(frame);
            self.bus.publish(EngineEvent::PositionChanged {
                frame,
                sample_rate: active.source_rate(),
            });
        }
    }

    fn publish_underruns(&mut self) {
        let controls = &self.shared.controls;
        let events = controls.underrun_events.load(Ordering::Relaxed);
        if events == self.seen_underrun_events {
            return;
        }
        let frames = controls.underrun_frames.load(Ordering::Relaxed);
        let missing_frames = frames.saturating_sub(self.seen_underrun_frames);
        self.seen_underrun_events = events;
        self.seen_underrun_frames = frames;
        tracing::debug!(missing_frames, "output underrun");
        self.bus.publish(EngineEvent::Underrun { missing_frames });
    }

    fn track_ended(&mut self) {
        self.set_state(TransportState::TrackEnded);
        if let Some(active) = self.active.take() {
            tracing::info!(path = %active.track.path.display(), "track ended");
            self.queue.push_history(active.track.clone());
        }
        self.set_state(TransportState::Stopped);
        self.advance();
    }

    /// Play the next queue entry that opens, reporting and skipping the ones that don't.
    fn advance(&mut self) {
        loop {
            let Ok(track) = self.queue.dequeue_next() else {
                self.go_idle();
                return;
            };
            match self.start_track(track.clone()) {
                Ok(()) => return,
                Err(e) => self.report(&e, &track),
            }
        }
    }

    fn go_idle(&mut self) {
        self.active = None;
        let had_track = self.shared.track().is_some();
        self.shared.clear_playback();
        self.last_position = None;
        self.set_state(TransportState::Stopped);
        if had_track {
            self.bus.publish(EngineEvent::TrackChanged { track: None });
        }
    }
}

/// Run a device call, retrying once immediately if the device reports an error.
fn retry_device<T>(mut op: impl FnMut() -> EngineResult<T>) -> EngineResult<T> {
    match op() {
        Err(EngineError::DeviceError(message)) => {
            tracing::warn!(error = %message, "device call failed, retrying once");
            op()
        }
        other => other,
    }
}

