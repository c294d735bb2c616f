//! Playback engine / transport state machine.
//!
//! [`PlaybackEngine`] is a cheap front for a dedicated engine thread. Transport commands
//! travel over a channel and wait (bounded) for the thread's answer; state, position and
//! status reads go straight to shared atomics and never wait on the engine thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use audio_engine_types::{EngineStatus, EventKind, TransportState, duration_to_frames};
use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::analysis::AnalysisHandle;
use crate::config::EngineConfig;
use crate::decode::{SourceOpener, SymphoniaOpener};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, Subscription};
use crate::output::{CpalBackend, OutputBackend};
use crate::queue::QueueCoordinator;
use crate::ring::RingBuffer;
use crate::status::EngineShared;

mod control;

use control::{Command, Controller, Request};

/// Capacity of the analysis tap in mono frames (over a second at common rates).
const TAP_CAPACITY_FRAMES: usize = 1 << 16;

/// An explicitly owned player instance.
///
/// Dropping the engine stops playback and joins its threads.
pub struct PlaybackEngine {
    commands: Sender<Request>,
    shared: Arc<EngineShared>,
    queue: QueueCoordinator,
    bus: EventBus,
    command_timeout: Duration,
    control: Option<JoinHandle<()>>,
    analysis: Option<AnalysisHandle>,
}

impl PlaybackEngine {
    /// Build an engine on explicit output and decoder implementations.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn OutputBackend>,
        opener: Arc<dyn SourceOpener>,
    ) -> EngineResult<Self> {
        let config = config.validate();
        let bus = EventBus::new(config.telemetry.lossy_capacity);
        let queue = QueueCoordinator::new(bus.clone());
        let tap = Arc::new(RingBuffer::new(1, TAP_CAPACITY_FRAMES));
        let shared = Arc::new(EngineShared::new(Some(tap.clone())));

        let analysis = AnalysisHandle::spawn(&config.analysis, shared.clone(), tap, bus.clone())
            .map_err(|e| EngineError::DeviceError(format!("spawn analysis thread: {e}")))?;

        let (commands, command_rx) = crossbeam_channel::unbounded();
        let controller = Controller::new(
            config.clone(),
            backend,
            opener,
            shared.clone(),
            queue.clone(),
            bus.clone(),
        );
        let control = thread::Builder::new()
            .name("peachy-engine".to_string())
            .spawn(move || controller.run(command_rx))
            .map_err(|e| EngineError::DeviceError(format!("spawn engine thread: {e}")))?;

        tracing::info!(
            buffer_seconds = config.buffer_seconds,
            analysis = ?config.analysis.mode,
            "playback engine ready"
        );
        Ok(Self {
            commands,
            shared,
            queue,
            bus,
            command_timeout: config.command_timeout(),
            control: Some(control),
            analysis: Some(analysis),
        })
    }

    /// Engine on the system audio output with the Symphonia decoder.
    pub fn with_defaults(config: EngineConfig) -> EngineResult<Self> {
        Self::new(config, Arc::new(CpalBackend), Arc::new(SymphoniaOpener))
    }

    fn request(&self, command: Command) -> EngineResult<()> {
        let (reply, answer) = crossbeam_channel::bounded(1);
        self.commands
            .send(Request { command, reply })
            .map_err(|_| EngineError::EngineClosed)?;
        match answer.recv_timeout(self.command_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout(command.name())),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::EngineClosed),
        }
    }

    /// Start the queue head when stopped, or resume when paused.
    pub fn play(&self) -> EngineResult<()> {
        self.request(Command::Play)
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.request(Command::Pause)
    }

    pub fn toggle(&self) -> EngineResult<()> {
        self.request(Command::Toggle)
    }

    /// Stop playback. The active track goes back to the head of the queue.
    pub fn stop(&self) -> EngineResult<()> {
        self.request(Command::Stop)
    }

    /// Skip to the next queued track; the current one moves to history.
    pub fn next(&self) -> EngineResult<()> {
        self.request(Command::Next)
    }

    /// Play the most recent history entry; the current track returns to the queue head.
    pub fn previous(&self) -> EngineResult<()> {
        self.request(Command::Previous)
    }

    /// Seek to `frame` in the current track's own sample rate.
    pub fn seek(&self, frame: u64) -> EngineResult<()> {
        self.request(Command::Seek(frame))
    }

    pub fn seek_to(&self, position: Duration) -> EngineResult<()> {
        let rate = self
            .shared
            .track()
            .and_then(|t| t.sample_rate)
            .ok_or(EngineError::InvalidSeek {
                position: 0,
                duration: 0,
            })?;
        self.seek(duration_to_frames(position, rate))
    }

    /// Output gain in `0.0..=1.0`. Takes effect on the next device callback.
    pub fn set_volume(&self, level: f32) {
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        self.shared.controls.set_volume(level);
    }

    pub fn volume(&self) -> f32 {
        self.shared.controls.volume()
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    /// Current position in frames of the active track (0 when idle).
    pub fn position(&self) -> u64 {
        self.shared.clock.current()
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.snapshot(&self.queue)
    }

    pub fn queue(&self) -> &QueueCoordinator {
        &self.queue
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn subscribe_to(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe_to(kinds)
    }

    /// Stop playback and join the engine threads.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(control) = self.control.take() {
            if let Err(e) = self.request(Command::Shutdown) {
                tracing::warn!(error = %e, "engine did not acknowledge shutdown");
            }
            if control.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
        self.analysis.take();
        self.bus.close();
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}
