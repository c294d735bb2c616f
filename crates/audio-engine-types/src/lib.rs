//! Payload types shared between the playback engine and its UI collaborators.
//!
//! Nothing here knows about threads, devices or decoders; these are the values
//! that cross the telemetry bus and the status API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Container/codec family of a track.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    Flac,
    Mp3,
    Aac,
    Alac,
    Vorbis,
    Opus,
    Wav,
    Aiff,
    /// Raw PCM inside a container we could not name more precisely.
    Pcm,
    #[default]
    Unknown,
}

impl AudioFormat {
    /// Guess the format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "flac" => Self::Flac,
            "mp3" => Self::Mp3,
            "aac" | "m4a" | "mp4" => Self::Aac,
            "alac" => Self::Alac,
            "ogg" | "oga" => Self::Vorbis,
            "opus" => Self::Opus,
            "wav" | "wave" => Self::Wav,
            "aif" | "aiff" => Self::Aiff,
            _ => Self::Unknown,
        }
    }

    /// Guess the format of `path` from its extension.
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or_default()
    }

    /// Short upper-case label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Flac => "FLAC",
            Self::Mp3 => "MP3",
            Self::Aac => "AAC",
            Self::Alac => "ALAC",
            Self::Vorbis => "VORBIS",
            Self::Opus => "OPUS",
            Self::Wav => "WAV",
            Self::Aiff => "AIFF",
            Self::Pcm => "PCM",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Immutable track descriptor.
///
/// Queued tracks usually only know their path (and maybe a title from the
/// library scanner). Once a decoder opens the file it hands back a resolved
/// copy with the stream fields filled in.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    /// Local file path.
    pub path: PathBuf,
    /// Display title supplied by the library scanner, if any.
    pub title: Option<String>,
    /// Container/codec family.
    pub format: AudioFormat,
    /// Source sample rate (Hz), known after open.
    pub sample_rate: Option<u32>,
    /// Source channel count, known after open.
    pub channels: Option<u16>,
    /// Total length in source frames, when the container reports it.
    pub duration_frames: Option<u64>,
    /// Whether the source supports random access.
    pub seekable: bool,
}

impl Track {
    /// Describe a not-yet-opened file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = AudioFormat::from_path(&path);
        Self {
            path,
            title: None,
            format,
            sample_rate: None,
            channels: None,
            duration_frames: None,
            seekable: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Title if known, otherwise the file name.
    pub fn display_name(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }

    /// Track length as wall-clock time, when both duration and rate are known.
    pub fn duration(&self) -> Option<Duration> {
        let frames = self.duration_frames?;
        let rate = self.sample_rate?;
        frames_to_duration(frames, rate)
    }
}

/// Convert a frame count at `sample_rate` to a [`Duration`].
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Option<Duration> {
    if sample_rate == 0 {
        return None;
    }
    let rate = sample_rate as u64;
    let secs = frames / rate;
    let rem = frames % rate;
    Some(Duration::from_secs(secs) + Duration::from_nanos(rem * 1_000_000_000 / rate))
}

/// Convert a [`Duration`] to a frame count at `sample_rate` (floor).
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

/// Transport state of the single player session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransportState {
    #[default]
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    /// Transient: decoder repositioning and buffer refilling.
    Seeking = 3,
    /// Transient: end of stream reached and the buffer drained.
    TrackEnded = 4,
}

impl TransportState {
    /// Inverse of `state as u8`; unknown values read as `Stopped`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Playing,
            2 => Self::Paused,
            3 => Self::Seeking,
            4 => Self::TrackEnded,
            _ => Self::Stopped,
        }
    }
}

/// Serializable error classification published on the telemetry bus.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedFormat,
    FileNotFound,
    CorruptStream,
    SeekUnsupported,
    DeviceError,
    BufferUnderrun,
    BufferFull,
    EmptyQueue,
    EmptyHistory,
    InvalidArgument,
    Timeout,
    EngineClosed,
}

/// One visualization frame. The vector lengths are fixed by configuration and
/// never depend on the source channel count or sample rate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisFrame {
    /// Downsampled amplitude envelope, values in `0.0..=1.0`.
    Waveform { points: Vec<f32> },
    /// Band magnitudes in `0.0..=1.0` plus slowly decaying peak markers.
    Spectrum { bars: Vec<f32>, peaks: Vec<f32> },
}

impl AnalysisFrame {
    pub fn silent_waveform(points: usize) -> Self {
        Self::Waveform {
            points: vec![0.0; points],
        }
    }

    pub fn silent_spectrum(bands: usize) -> Self {
        Self::Spectrum {
            bars: vec![0.0; bands],
            peaks: vec![0.0; bands],
        }
    }

    /// Number of points/bands in the frame.
    pub fn len(&self) -> usize {
        match self {
            Self::Waveform { points } => points.len(),
            Self::Spectrum { bars, .. } => bars.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every value is zero.
    pub fn is_silent(&self) -> bool {
        match self {
            Self::Waveform { points } => points.iter().all(|v| *v == 0.0),
            Self::Spectrum { bars, peaks } => {
                bars.iter().all(|v| *v == 0.0) && peaks.iter().all(|v| *v == 0.0)
            }
        }
    }
}

/// Events published on the telemetry bus.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Playback position of the active track, in source frames.
    PositionChanged { frame: u64, sample_rate: u32 },
    StateChanged { state: TransportState },
    /// Active track changed; `None` once playback runs out of tracks.
    TrackChanged { track: Option<Track> },
    /// The output emitted silence because the buffer ran dry.
    Underrun { missing_frames: u64 },
    AnalysisFrameReady { frame: AnalysisFrame },
    Error { kind: ErrorKind, message: String },
    QueueChanged,
}

/// Event discriminant, used for subscription filters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Position,
    State,
    Track,
    Underrun,
    Analysis,
    Error,
    Queue,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PositionChanged { .. } => EventKind::Position,
            Self::StateChanged { .. } => EventKind::State,
            Self::TrackChanged { .. } => EventKind::Track,
            Self::Underrun { .. } => EventKind::Underrun,
            Self::AnalysisFrameReady { .. } => EventKind::Analysis,
            Self::Error { .. } => EventKind::Error,
            Self::QueueChanged => EventKind::Queue,
        }
    }

    /// High-frequency events that may be dropped (oldest first) when a
    /// subscriber falls behind.
    pub fn is_lossy(&self) -> bool {
        matches!(self.kind(), EventKind::Position | EventKind::Analysis)
    }
}

/// Point-in-time engine status for polling UIs.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStatus {
    pub state: TransportState,
    /// Active track descriptor (resolved).
    pub track: Option<Track>,
    /// Position of the active track in source frames.
    pub position_frames: u64,
    /// Elapsed playback time in milliseconds.
    pub elapsed_ms: Option<u64>,
    /// Total media duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Output device display name.
    pub device: Option<String>,
    /// Rate the device was opened at (Hz).
    pub output_sample_rate: Option<u32>,
    /// Channel count the device was opened with.
    pub output_channels: Option<u16>,
    /// Whether the source is being resampled for the device.
    pub resampling: Option<bool>,
    /// Linear output gain, `0.0..=1.0`.
    pub volume: f32,
    /// Frames currently waiting in the ring buffer.
    pub buffered_frames: Option<u64>,
    /// Ring buffer capacity in frames.
    pub buffer_capacity_frames: Option<u64>,
    /// Frames emitted as silence because the buffer was empty.
    pub underrun_frames: u64,
    /// Number of callbacks that hit an empty buffer.
    pub underrun_events: u64,
    /// Tracks waiting in the queue.
    pub queue_len: usize,
    /// Whether `previous()` has somewhere to go.
    pub has_previous: bool,
}

/// Serializable view of the queue and history, oldest history entry first.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub upcoming: Vec<Track>,
    pub history: Vec<Track>,
}
