//! Engine tuning parameters, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Smallest ring capacity we accept, in seconds.
const MIN_BUFFER_SECONDS: f32 = 0.1;

/// Top-level engine configuration.
///
/// Every field has a default, so an empty file (or no file) is valid.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer capacity in seconds of output audio.
    pub buffer_seconds: f32,
    /// Decoder/resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Audio buffered before output starts (track start and after seek).
    pub prefill_ms: u64,
    /// Upper bound on waiting for the prefill.
    pub refill_timeout_ms: u64,
    /// Cadence of position telemetry and end-of-stream checks.
    pub position_interval_ms: u64,
    /// How long a caller waits for the engine thread to answer a command.
    pub command_timeout_ms: u64,
    pub device: DeviceConfig,
    pub analysis: AnalysisConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 1.0,
            chunk_frames: 1024,
            prefill_ms: 100,
            refill_timeout_ms: 2000,
            position_interval_ms: 50,
            command_timeout_ms: 5000,
            device: DeviceConfig::default(),
            analysis: AnalysisConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Output device selection.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Case-insensitive substring of the output device name; default device when unset.
    pub name: Option<String>,
    /// Bound on device negotiation and stream construction.
    pub open_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: None,
            open_timeout_ms: 2000,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Spectrum,
    Waveform,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BandScale {
    Log,
    Linear,
}

/// Per-bucket reduction used by the waveform envelope.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    Peak,
    Rms,
}

/// Visualization pipeline settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub mode: AnalysisMode,
    /// Tick cadence, independent of the device callback.
    pub interval_ms: u64,
    /// Length of the PCM history window.
    pub history_ms: u64,
    /// FFT length in samples (spectrum mode).
    pub fft_size: usize,
    pub waveform_points: usize,
    pub spectrum_bands: usize,
    pub band_scale: BandScale,
    pub envelope: Envelope,
    /// Weight of the previous bar value (0 disables smoothing).
    pub smoothing: f32,
    /// Ticks a peak marker holds before it starts falling.
    pub peak_hold_ticks: u32,
    /// Per-tick multiplier applied to falling peak markers.
    pub peak_gravity: f32,
    /// Magnitudes at or below this level (dBFS) map to zero.
    pub db_floor: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mode: AnalysisMode::Spectrum,
            interval_ms: 33,
            history_ms: 500,
            fft_size: 2048,
            waveform_points: 200,
            spectrum_bands: 64,
            band_scale: BandScale::Log,
            envelope: Envelope::Peak,
            smoothing: 0.7,
            peak_hold_ticks: 20,
            peak_gravity: 0.95,
            db_floor: -80.0,
        }
    }
}

/// Event bus settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// High-frequency events kept per subscriber before the oldest are dropped.
    pub lossy_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { lossy_capacity: 64 }
    }
}

impl EngineConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<EngineConfig>(raw)?;
        Ok(cfg.validate())
    }

    /// Replace degenerate values (zero sizes, NaN, out-of-range factors) with usable ones.
    pub fn validate(mut self) -> Self {
        let defaults = EngineConfig::default();
        if !self.buffer_seconds.is_finite() {
            self.buffer_seconds = defaults.buffer_seconds;
        }
        self.buffer_seconds = self.buffer_seconds.max(MIN_BUFFER_SECONDS);
        self.chunk_frames = self.chunk_frames.max(1);
        self.position_interval_ms = self.position_interval_ms.max(1);
        self.command_timeout_ms = self.command_timeout_ms.max(1);
        self.refill_timeout_ms = self.refill_timeout_ms.max(1);
        self.device.open_timeout_ms = self.device.open_timeout_ms.max(1);
        if let Some(name) = &self.device.name {
            if name.trim().is_empty() {
                self.device.name = None;
            }
        }

        let a = &mut self.analysis;
        let da = AnalysisConfig::default();
        a.interval_ms = a.interval_ms.max(1);
        a.history_ms = a.history_ms.max(1);
        a.fft_size = a.fft_size.max(16);
        a.waveform_points = a.waveform_points.max(1);
        a.spectrum_bands = a.spectrum_bands.max(1);
        if !a.smoothing.is_finite() {
            a.smoothing = da.smoothing;
        }
        a.smoothing = a.smoothing.clamp(0.0, 0.99);
        if !a.peak_gravity.is_finite() {
            a.peak_gravity = da.peak_gravity;
        }
        a.peak_gravity = a.peak_gravity.clamp(0.0, 1.0);
        if !a.db_floor.is_finite() || a.db_floor >= 0.0 {
            a.db_floor = da.db_floor;
        }

        self.telemetry.lossy_capacity = self.telemetry.lossy_capacity.max(1);
        self
    }

    /// Ring capacity in frames at `rate_hz`.
    pub fn buffer_frames(&self, rate_hz: u32) -> usize {
        let secs = if self.buffer_seconds.is_finite() {
            self.buffer_seconds.max(MIN_BUFFER_SECONDS)
        } else {
            MIN_BUFFER_SECONDS
        };
        // Round, not ceil: 0.1f32 is slightly above a tenth.
        ((rate_hz as f64 * secs as f64).round() as usize).max(1)
    }

    /// Prefill target in frames at `rate_hz`, never above the ring capacity.
    pub fn prefill_frames(&self, rate_hz: u32) -> usize {
        let frames = (rate_hz as u64 * self.prefill_ms / 1000) as usize;
        frames.clamp(1, self.buffer_frames(rate_hz))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn refill_timeout(&self) -> Duration {
        Duration::from_millis(self.refill_timeout_ms)
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.device.open_timeout_ms)
    }
}
