//! Output device abstraction and the real-time render callback.
//!
//! A backend negotiates a device format for a track, then opens a stream that repeatedly
//! calls [`RenderCallback::render`] from the device's own thread. The engine never talks to
//! a concrete audio API directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::error::{EngineError, EngineResult};
use crate::ring::RingBuffer;

mod cpal_backend;
mod manual;

pub use cpal_backend::{CpalBackend, DeviceInfo, list_devices};
pub use manual::{ManualBackend, ManualHandle};

/// Mono frames mixed per pass when feeding the analysis tap.
const TAP_CHUNK_FRAMES: usize = 1024;

/// What the engine would like the device to run at (the track's native format).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRequest {
    /// Substring of the device name; default device when `None`.
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I32,
    I16,
    U16,
}

/// Format the device actually agreed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Fixed callback size in frames, if the device advertised a range.
    pub buffer_frames: Option<u32>,
}

/// Called (from an arbitrary thread) when a running stream fails.
pub type ErrorSink = Arc<dyn Fn(String) + Send + Sync>;

/// An audio output API.
pub trait OutputBackend: Send + Sync {
    /// Pick a device and a format as close to `request` as the device allows.
    fn negotiate(&self, request: &OutputRequest, timeout: Duration) -> EngineResult<OutputFormat>;

    /// Build a stream for `format` that pulls from `render`. The stream starts paused.
    fn open(
        &self,
        format: &OutputFormat,
        render: RenderCallback,
        on_error: ErrorSink,
        timeout: Duration,
    ) -> EngineResult<Box<dyn OutputStream>>;
}

/// A running device stream. Dropping it closes the stream.
pub trait OutputStream: Send {
    fn play(&mut self) -> EngineResult<()>;
    fn pause(&mut self) -> EngineResult<()>;
}

/// Lock-free state shared between the engine and the render callback.
#[derive(Clone)]
pub struct RenderControls {
    /// When set the callback emits silence and leaves the ring untouched.
    pub gate: Arc<AtomicBool>,
    /// Linear gain as `f32` bits.
    pub volume: Arc<AtomicU32>,
    /// Output frames emitted since the last position reset.
    pub played: Arc<AtomicU64>,
    pub underrun_frames: Arc<AtomicU64>,
    pub underrun_events: Arc<AtomicU64>,
    /// Mono pre-gain copy of everything played, for analysis.
    pub tap: Option<Arc<RingBuffer>>,
}

impl RenderControls {
    pub fn new(tap: Option<Arc<RingBuffer>>) -> Self {
        Self {
            gate: Arc::new(AtomicBool::new(true)),
            volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            played: Arc::new(AtomicU64::new(0)),
            underrun_frames: Arc::new(AtomicU64::new(0)),
            underrun_events: Arc::new(AtomicU64::new(0)),
            tap,
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, level: f32) {
        self.volume.store(level.to_bits(), Ordering::Relaxed);
    }
}

/// The device-thread side of playback.
///
/// `render` only reads pre-buffered frames, copies a mono mix to the analysis tap and applies
/// gain. It does not allocate, lock, log or block.
pub struct RenderCallback {
    channels: usize,
    ring: Arc<RingBuffer>,
    controls: RenderControls,
    mono: Box<[f32]>,
}

impl RenderCallback {
    pub fn new(ring: Arc<RingBuffer>, controls: RenderControls) -> Self {
        Self {
            channels: ring.channels(),
            ring,
            controls,
            mono: vec![0.0; TAP_CHUNK_FRAMES].into_boxed_slice(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Fill `out` (interleaved, device channel count) with the next frames.
    pub fn render(&mut self, out: &mut [f32]) {
        let c = &self.controls;
        if c.gate.load(Ordering::Acquire) {
            out.fill(0.0);
            return;
        }

        let wanted = out.len() / self.channels;
        let got = self.ring.read(out);
        let filled = got * self.channels;

        if let Some(tap) = &c.tap {
            tap_mono(&out[..filled], self.channels, &mut self.mono, tap);
        }

        let gain = f32::from_bits(c.volume.load(Ordering::Relaxed));
        if gain != 1.0 {
            for s in &mut out[..filled] {
                *s *= gain;
            }
        }
        out[filled..].fill(0.0);

        let missing = wanted - got;
        if missing > 0 && !self.ring.is_ended() {
            c.underrun_events.fetch_add(1, Ordering::Relaxed);
            c.underrun_frames
                .fetch_add(missing as u64, Ordering::Relaxed);
            c.played.fetch_add(wanted as u64, Ordering::Release);
        } else if got > 0 {
            c.played.fetch_add(got as u64, Ordering::Release);
        }
    }
}

fn tap_mono(frames: &[f32], channels: usize, scratch: &mut [f32], tap: &RingBuffer) {
    let inv = 1.0 / channels as f32;
    for chunk in frames.chunks(scratch.len() * channels) {
        let n = chunk.len() / channels;
        for (f, slot) in scratch[..n].iter_mut().enumerate() {
            let frame = &chunk[f * channels..(f + 1) * channels];
            *slot = frame.iter().sum::<f32>() * inv;
        }
        tap.write_partial(&scratch[..n]);
    }
}

/// Run `job` on a helper thread and give up after `timeout`.
///
/// The helper is detached on timeout; a hung platform call cannot hang the engine.
pub(crate) fn run_bounded<T, F>(timeout: Duration, what: &'static str, job: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name(format!("peachy-{what}"))
        .spawn(move || {
            let _ = tx.send(job());
        })
        .map_err(|e| EngineError::DeviceError(format!("spawn {what}: {e}")))?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(EngineError::DeviceError(format!(
            "{what} timed out after {} ms",
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(EngineError::DeviceError(format!("{what} thread exited")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback(channels: usize, cap: usize, tap: bool) -> (RenderCallback, Arc<RingBuffer>, RenderControls) {
        let ring = Arc::new(RingBuffer::new(channels, cap));
        let tap = tap.then(|| Arc::new(RingBuffer::new(1, 64)));
        let controls = RenderControls::new(tap);
        controls.gate.store(false, Ordering::Release);
        (RenderCallback::new(ring.clone(), controls.clone()), ring, controls)
    }

    #[test]
    fn gated_callback_outputs_silence_without_draining() {
        let (mut cb, ring, controls) = callback(2, 16, false);
        ring.try_write(&[0.5; 8]).unwrap();
        controls.gate.store(true, Ordering::Release);
        let mut out = [1.0f32; 8];
        cb.render(&mut out);
        assert_eq!(out, [0.0; 8]);
        assert_eq!(ring.available(), 4);
        assert_eq!(controls.played.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn gain_applies_after_tap() {
        let (mut cb, ring, controls) = callback(2, 16, true);
        ring.try_write(&[0.8, 0.4, 0.8, 0.4]).unwrap();
        controls.set_volume(0.5);
        let mut out = [0.0f32; 4];
        cb.render(&mut out);
        assert_eq!(out, [0.4, 0.2, 0.4, 0.2]);

        let tap = controls.tap.as_ref().unwrap();
        let mut mono = [0.0f32; 4];
        assert_eq!(tap.read(&mut mono), 2);
        assert!((mono[0] - 0.6).abs() < 1e-6);
        assert_eq!(controls.played.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn starvation_fills_silence_and_counts_underrun() {
        let (mut cb, ring, controls) = callback(1, 16, false);
        ring.try_write(&[0.3, 0.3]).unwrap();
        let mut out = [9.0f32; 6];
        cb.render(&mut out);
        assert_eq!(out, [0.3, 0.3, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(controls.underrun_events.load(Ordering::Relaxed), 1);
        assert_eq!(controls.underrun_frames.load(Ordering::Relaxed), 4);
        // Underrun silence still advances the clock.
        assert_eq!(controls.played.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn silence_after_end_of_stream_is_not_an_underrun() {
        let (mut cb, ring, controls) = callback(1, 16, false);
        ring.try_write(&[0.3]).unwrap();
        ring.mark_ended();
        let mut out = [0.0f32; 4];
        cb.render(&mut out);
        cb.render(&mut out);
        assert_eq!(controls.underrun_events.load(Ordering::Relaxed), 0);
        assert_eq!(controls.played.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn run_bounded_times_out() {
        let err = run_bounded(Duration::from_millis(10), "test-job", || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::DeviceError(_)));
    }
}
