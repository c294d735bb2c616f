//! State shared between the engine thread, the public handle and the analysis thread.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use audio_engine_types::{EngineStatus, Track, TransportState, frames_to_duration};

use crate::output::RenderControls;
use crate::queue::QueueCoordinator;
use crate::ring::RingBuffer;

/// Track position derived from output frames played since the last reset.
///
/// Output frames are converted back to source frames so position stays in the track's own
/// timeline when the device runs at a different rate. Reads never go backwards until the
/// next reset.
pub(crate) struct PositionClock {
    played: Arc<AtomicU64>,
    inner: Mutex<ClockState>,
}

#[derive(Default)]
struct ClockState {
    base: u64,
    src_rate: u32,
    out_rate: u32,
    duration: Option<u64>,
    last: u64,
}

impl PositionClock {
    pub(crate) fn new(played: Arc<AtomicU64>) -> Self {
        Self {
            played,
            inner: Mutex::new(ClockState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restart counting at `base` (track start or seek). Call with the output gated.
    pub(crate) fn reset(&self, base: u64, src_rate: u32, out_rate: u32, duration: Option<u64>) {
        let mut st = self.lock();
        self.played.store(0, Ordering::Release);
        *st = ClockState {
            base,
            src_rate,
            out_rate,
            duration,
            last: base,
        };
    }

    /// Move the base without touching the rates (seek within the same stream).
    pub(crate) fn rebase(&self, base: u64) {
        let mut st = self.lock();
        self.played.store(0, Ordering::Release);
        st.base = base;
        st.last = base;
    }

    pub(crate) fn clear(&self) {
        self.reset(0, 0, 0, None);
    }

    /// Current position in source frames.
    pub(crate) fn current(&self) -> u64 {
        let mut st = self.lock();
        let played = self.played.load(Ordering::Acquire);
        let advanced = if st.out_rate == 0 || st.src_rate == st.out_rate {
            played
        } else {
            (played as u128 * st.src_rate as u128 / st.out_rate as u128) as u64
        };
        let mut pos = st.base.saturating_add(advanced);
        if let Some(d) = st.duration {
            pos = pos.min(d);
        }
        st.last = st.last.max(pos);
        st.last
    }

    pub(crate) fn source_rate(&self) -> u32 {
        self.lock().src_rate
    }
}

/// Descriptive fields of the active playback, written by the engine thread.
#[derive(Default)]
pub(crate) struct PlaybackInfo {
    pub track: Option<Track>,
    pub device: Option<String>,
    pub output_sample_rate: Option<u32>,
    pub output_channels: Option<u16>,
    pub resampling: Option<bool>,
    pub ring: Option<Arc<RingBuffer>>,
}

pub(crate) struct EngineShared {
    state: AtomicU8,
    /// Bumped on track change and seek so analysis drops stale history.
    generation: AtomicU64,
    output_rate: AtomicU32,
    pub controls: RenderControls,
    pub clock: PositionClock,
    info: Mutex<PlaybackInfo>,
}

impl EngineShared {
    pub(crate) fn new(tap: Option<Arc<RingBuffer>>) -> Self {
        let controls = RenderControls::new(tap);
        let clock = PositionClock::new(controls.played.clone());
        Self {
            state: AtomicU8::new(TransportState::Stopped as u8),
            generation: AtomicU64::new(0),
            output_rate: AtomicU32::new(0),
            controls,
            clock,
            info: Mutex::new(PlaybackInfo::default()),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn store_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Device rate of the active stream (0 when idle).
    pub(crate) fn output_rate(&self) -> u32 {
        self.output_rate.load(Ordering::Acquire)
    }

    fn info(&self) -> MutexGuard<'_, PlaybackInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_playback(&self, info: PlaybackInfo) {
        self.output_rate
            .store(info.output_sample_rate.unwrap_or(0), Ordering::Release);
        *self.info() = info;
    }

    pub(crate) fn clear_playback(&self) {
        self.output_rate.store(0, Ordering::Release);
        *self.info() = PlaybackInfo::default();
        self.clock.clear();
    }

    pub(crate) fn track(&self) -> Option<Track> {
        self.info().track.clone()
    }

    pub(crate) fn snapshot(&self, queue: &QueueCoordinator) -> EngineStatus {
        let info = self.info();
        let position_frames = self.clock.current();
        let rate = info.track.as_ref().and_then(|t| t.sample_rate);
        let elapsed_ms = rate
            .and_then(|r| frames_to_duration(position_frames, r))
            .map(|d| d.as_millis() as u64);
        EngineStatus {
            state: self.state(),
            track: info.track.clone(),
            position_frames,
            elapsed_ms,
            duration_ms: info
                .track
                .as_ref()
                .and_then(|t| t.duration())
                .map(|d| d.as_millis() as u64),
            device: info.device.clone(),
            output_sample_rate: info.output_sample_rate,
            output_channels: info.output_channels,
            resampling: info.resampling,
            volume: self.controls.volume(),
            buffered_frames: info.ring.as_ref().map(|r| r.available() as u64),
            buffer_capacity_frames: info.ring.as_ref().map(|r| r.capacity() as u64),
            underrun_frames: self.controls.underrun_frames.load(Ordering::Relaxed),
            underrun_events: self.controls.underrun_events.load(Ordering::Relaxed),
            queue_len: queue.len(),
            has_previous: queue.has_previous(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    #[test]
    fn clock_converts_output_frames_to_source_frames() {
        let played = Arc::new(AtomicU64::new(0));
        let clock = PositionClock::new(played.clone());
        clock.reset(1_000, 44_100, 88_200, None);
        played.store(2_000, Ordering::Relaxed);
        assert_eq!(clock.current(), 2_000);
    }

    #[test]
    fn clock_is_monotonic_and_clamped() {
        let played = Arc::new(AtomicU64::new(0));
        let clock = PositionClock::new(played.clone());
        clock.reset(0, 48_000, 48_000, Some(100));
        played.store(50, Ordering::Relaxed);
        assert_eq!(clock.current(), 50);
        played.store(10, Ordering::Relaxed);
        assert_eq!(clock.current(), 50);
        played.store(500, Ordering::Relaxed);
        assert_eq!(clock.current(), 100);
        clock.rebase(20);
        assert_eq!(clock.current(), 20);
    }

    #[test]
    fn snapshot_reports_elapsed_and_buffer() {
        let shared = EngineShared::new(None);
        let ring = Arc::new(RingBuffer::new(2, 4_800));
        ring.try_write(&[0.0; 200]).unwrap();
        let mut track = Track::from_path("/music/a.flac");
        track.sample_rate = Some(48_000);
        track.duration_frames = Some(480_000);
        shared.set_playback(PlaybackInfo {
            track: Some(track),
            device: Some("manual".into()),
            output_sample_rate: Some(48_000),
            output_channels: Some(2),
            resampling: Some(false),
            ring: Some(ring),
        });
        shared.clock.reset(96_000, 48_000, 48_000, Some(480_000));
        shared.store_state(TransportState::Paused);

        let queue = QueueCoordinator::new(EventBus::new(4));
        let snap = shared.snapshot(&queue);
        assert_eq!(snap.state, TransportState::Paused);
        assert_eq!(snap.elapsed_ms, Some(2_000));
        assert_eq!(snap.duration_ms, Some(10_000));
        assert_eq!(snap.buffered_frames, Some(100));
        assert_eq!(snap.buffer_capacity_frames, Some(4_800));
        assert_eq!(snap.volume, 1.0);
        assert_eq!(shared.output_rate(), 48_000);

        shared.clear_playback();
        let snap = shared.snapshot(&queue);
        assert!(snap.track.is_none());
        assert_eq!(snap.position_frames, 0);
        assert_eq!(shared.output_rate(), 0);
    }
}
