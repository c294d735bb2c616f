//! Fixtures shared by the unit tests: temp dirs, WAV writer, synthetic sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use audio_engine_types::{AudioFormat, EngineEvent, Track};

use crate::decode::{Decoder, FrameBlock, SourceOpener};
use crate::error::{EngineError, EngineResult};
use crate::events::Subscription;

/// Temporary directory removed on drop.
pub(crate) struct TempDir(tempfile::TempDir);

impl TempDir {
    pub(crate) fn new(name: &str) -> Self {
        let dir = tempfile::Builder::new()
            .prefix(&format!("peachy-{name}-"))
            .tempdir()
            .unwrap();
        Self(dir)
    }

    pub(crate) fn path(&self) -> &Path {
        self.0.path()
    }
}

/// Write a 16-bit PCM WAV whose every channel ramps from 0 towards 0.9.
pub(crate) fn write_wav_ramp(path: &Path, rate: u32, channels: u16, frames: u32) {
    let block_align = channels as u32 * 2;
    let data_len = frames * block_align;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&channels.to_le_bytes());
    bytes.extend_from_slice(&rate.to_le_bytes());
    bytes.extend_from_slice(&(rate * block_align).to_le_bytes());
    bytes.extend_from_slice(&(block_align as u16).to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    for f in 0..frames {
        let value = (f as f32 / frames as f32 * 0.9 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    std::fs::write(path, bytes).unwrap();
}

/// Sample value a synthetic source emits for `frame`; invert with [`frame_of`].
pub(crate) fn ramp_value(frame: u64) -> f32 {
    frame as f32 * 1e-6
}

pub(crate) fn frame_of(sample: f32) -> u64 {
    (sample as f64 * 1e6).round() as u64
}

/// In-memory decoder emitting [`ramp_value`] on every channel.
pub(crate) struct SyntheticDecoder {
    track: Track,
    channels: usize,
    cursor: u64,
    corrupt_at: Option<u64>,
    panic_at: Option<u64>,
    seek_fails: bool,
    on_seek: Option<SeekHook>,
    closed: bool,
}

impl SyntheticDecoder {
    pub(crate) fn new(rate: u32, channels: u16, frames: u64) -> Self {
        Self::from_spec(Path::new("/synthetic/track.wav"), &SyntheticSpec::new(rate, channels, frames))
    }

    fn from_spec(path: &Path, spec: &SyntheticSpec) -> Self {
        let mut track = Track::from_path(path);
        track.format = AudioFormat::Wav;
        track.sample_rate = Some(spec.rate);
        track.channels = Some(spec.channels);
        track.duration_frames = Some(spec.frames);
        track.seekable = spec.seekable;
        Self {
            track,
            channels: spec.channels as usize,
            cursor: 0,
            corrupt_at: spec.corrupt_at,
            panic_at: spec.panic_at,
            seek_fails: spec.seek_fails,
            on_seek: spec.on_seek.clone(),
            closed: false,
        }
    }

    pub(crate) fn corrupt_at(mut self, frame: u64) -> Self {
        self.corrupt_at = Some(frame);
        self
    }
}

impl Decoder for SyntheticDecoder {
    fn track(&self) -> &Track {
        &self.track
    }

    fn read_frames(&mut self, max_frames: usize) -> EngineResult<FrameBlock> {
        if self.closed {
            return Ok(FrameBlock::empty(self.channels));
        }
        if self.panic_at.is_some_and(|at| self.cursor >= at) {
            panic!("synthetic decoder blew up at frame {}", self.cursor);
        }
        let total = self.track.duration_frames.unwrap_or(0);
        let mut end = (self.cursor + max_frames as u64).min(total);
        if let Some(bad) = self.corrupt_at {
            if self.cursor >= bad {
                return Err(EngineError::CorruptStream(format!("bad packet at frame {bad}")));
            }
            end = end.min(bad);
        }
        let mut samples = Vec::with_capacity((end - self.cursor) as usize * self.channels);
        for f in self.cursor..end {
            for _ in 0..self.channels {
                samples.push(ramp_value(f));
            }
        }
        self.cursor = end;
        Ok(FrameBlock::new(self.channels, samples))
    }

    fn seek(&mut self, frame: u64) -> EngineResult<u64> {
        if let Some(hook) = &self.on_seek {
            (hook.0)();
        }
        if !self.track.seekable {
            return Err(EngineError::SeekUnsupported);
        }
        let duration = self.track.duration_frames.unwrap_or(0);
        if frame >= duration {
            return Err(EngineError::InvalidSeek {
                position: frame,
                duration,
            });
        }
        if self.seek_fails {
            return Err(EngineError::CorruptStream(format!("no index entry for frame {frame}")));
        }
        self.cursor = frame;
        Ok(frame)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Runs on the engine thread whenever a synthetic decoder is asked to seek.
#[derive(Clone)]
pub(crate) struct SeekHook(pub Arc<dyn Fn() + Send + Sync>);

impl std::fmt::Debug for SeekHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SeekHook")
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SyntheticSpec {
    pub rate: u32,
    pub channels: u16,
    pub frames: u64,
    pub seekable: bool,
    pub corrupt_at: Option<u64>,
    /// The decode thread panics on reaching this frame.
    pub panic_at: Option<u64>,
    /// Advertised as seekable, but every seek errors and leaves the cursor alone.
    pub seek_fails: bool,
    pub on_seek: Option<SeekHook>,
    pub unsupported: bool,
}

impl SyntheticSpec {
    pub(crate) fn new(rate: u32, channels: u16, frames: u64) -> Self {
        Self {
            rate,
            channels,
            frames,
            seekable: true,
            corrupt_at: None,
            panic_at: None,
            seek_fails: false,
            on_seek: None,
            unsupported: false,
        }
    }
}

/// Opener serving registered synthetic tracks; unknown paths are `FileNotFound`.
#[derive(Clone, Default)]
pub(crate) struct SyntheticOpener {
    specs: Arc<Mutex<HashMap<PathBuf, SyntheticSpec>>>,
    opens: Arc<AtomicUsize>,
}

impl SyntheticOpener {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a source and return the track to enqueue for it.
    pub(crate) fn add(&self, name: &str, spec: SyntheticSpec) -> Track {
        let path = PathBuf::from(format!("/synthetic/{name}.wav"));
        self.specs.lock().unwrap().insert(path.clone(), spec);
        Track::from_path(path)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl SourceOpener for SyntheticOpener {
    fn open(&self, track: &Track) -> EngineResult<Box<dyn Decoder>> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        let spec = self
            .specs
            .lock()
            .unwrap()
            .get(&track.path)
            .cloned()
            .ok_or_else(|| EngineError::FileNotFound(track.path.clone()))?;
        if spec.unsupported {
            return Err(EngineError::UnsupportedFormat(format!(
                "{} is not audio",
                track.path.display()
            )));
        }
        Ok(Box::new(SyntheticDecoder::from_spec(&track.path, &spec)))
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Receive events until one matches, returning everything seen up to and including it.
pub(crate) fn wait_for_event(
    sub: &Subscription,
    timeout: Duration,
    mut matches: impl FnMut(&EngineEvent) -> bool,
) -> Option<Vec<EngineEvent>> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = sub.recv_timeout(left)?;
        let hit = matches(&event);
        seen.push(event);
        if hit {
            return Some(seen);
        }
    }
}
