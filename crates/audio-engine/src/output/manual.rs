//! Pull-driven output device with no hardware behind it.
//!
//! The host (or a test) decides when audio is consumed by calling [`ManualHandle::pull`],
//! which makes engine behavior deterministic.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    ErrorSink, OutputBackend, OutputFormat, OutputRequest, OutputStream, RenderCallback,
    SampleFormat,
};
use crate::error::{EngineError, EngineResult};

struct ManualSlot {
    id: u64,
    format: OutputFormat,
    render: RenderCallback,
    playing: bool,
    on_error: ErrorSink,
}

struct ManualInner {
    sample_rate: Option<u32>,
    channels: Option<u16>,
    slot: Mutex<Option<ManualSlot>>,
    next_id: AtomicU64,
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
}

impl ManualInner {
    fn slot(&self) -> MutexGuard<'_, Option<ManualSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output backend driven by [`ManualHandle::pull`].
#[derive(Clone)]
pub struct ManualBackend {
    inner: Arc<ManualInner>,
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualBackend {
    /// A device that accepts whatever format the track asks for.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A device fixed at `sample_rate`/`channels`, forcing normalization.
    pub fn fixed(sample_rate: u32, channels: u16) -> Self {
        Self::build(Some(sample_rate), Some(channels))
    }

    fn build(sample_rate: Option<u32>, channels: Option<u16>) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                sample_rate,
                channels,
                slot: Mutex::new(None),
                next_id: AtomicU64::new(1),
                opens: AtomicUsize::new(0),
                failing_opens: AtomicUsize::new(0),
            }),
        }
    }

    pub fn handle(&self) -> ManualHandle {
        ManualHandle {
            inner: self.inner.clone(),
        }
    }
}

impl OutputBackend for ManualBackend {
    fn negotiate(&self, request: &OutputRequest, _timeout: Duration) -> EngineResult<OutputFormat> {
        Ok(OutputFormat {
            device: request
                .device
                .clone()
                .unwrap_or_else(|| "manual".to_string()),
            sample_rate: self.inner.sample_rate.unwrap_or(request.sample_rate),
            channels: self.inner.channels.unwrap_or(request.channels),
            sample_format: SampleFormat::F32,
            buffer_frames: None,
        })
    }

    fn open(
        &self,
        format: &OutputFormat,
        render: RenderCallback,
        on_error: ErrorSink,
        _timeout: Duration,
    ) -> EngineResult<Box<dyn OutputStream>> {
        let failing = self.inner.failing_opens.load(Ordering::Acquire);
        if failing > 0 {
            self.inner.failing_opens.store(failing - 1, Ordering::Release);
            return Err(EngineError::DeviceError("manual device refused to open".to_string()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        *self.inner.slot() = Some(ManualSlot {
            id,
            format: format.clone(),
            render,
            playing: false,
            on_error,
        });
        self.inner.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ManualStream {
            inner: self.inner.clone(),
            id,
        }))
    }
}

struct ManualStream {
    inner: Arc<ManualInner>,
    id: u64,
}

impl ManualStream {
    fn set_playing(&self, playing: bool) -> EngineResult<()> {
        match self.inner.slot().as_mut() {
            Some(slot) if slot.id == self.id => {
                slot.playing = playing;
                Ok(())
            }
            _ => Err(EngineError::DeviceError("stream closed".to_string())),
        }
    }
}

impl OutputStream for ManualStream {
    fn play(&mut self) -> EngineResult<()> {
        self.set_playing(true)
    }

    fn pause(&mut self) -> EngineResult<()> {
        self.set_playing(false)
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        let mut slot = self.inner.slot();
        if slot.as_ref().map(|s| s.id) == Some(self.id) {
            *slot = None;
        }
    }
}

/// Host-side control of a [`ManualBackend`].
#[derive(Clone)]
pub struct ManualHandle {
    inner: Arc<ManualInner>,
}

impl ManualHandle {
    /// Consume `frames` frames from the open stream, like one device callback.
    ///
    /// Returns interleaved samples; silence when no stream is open or it is paused.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut slot = self.inner.slot();
        match slot.as_mut() {
            Some(s) => {
                let mut out = vec![0.0f32; frames * s.format.channels as usize];
                if s.playing {
                    s.render.render(&mut out);
                }
                out
            }
            None => Vec::new(),
        }
    }

    /// Format of the open stream, if any.
    pub fn format(&self) -> Option<OutputFormat> {
        self.inner.slot().as_ref().map(|s| s.format.clone())
    }

    pub fn is_open(&self) -> bool {
        self.inner.slot().is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.slot().as_ref().map(|s| s.playing).unwrap_or(false)
    }

    /// Streams opened so far.
    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::Relaxed)
    }

    /// Make the next `n` opens fail with a device error.
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.failing_opens.store(n, Ordering::Release);
    }

    /// Report a runtime failure on the open stream, as a disconnect would.
    pub fn fail_stream(&self, message: &str) {
        let sink = self.inner.slot().as_ref().map(|s| s.on_error.clone());
        if let Some(sink) = sink {
            sink(message.to_string());
        }
    }
}
