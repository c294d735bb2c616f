//! Visualization pipeline: waveform envelope or band spectrum of recent output.
//!
//! The render callback copies a mono pre-gain mix of everything it plays into a tap ring.
//! The analysis thread drains that ring into a private history window on its own timer,
//! so it never touches the playback ring or the device thread's timing. Frames always
//! have the configured length; while history is too short they are silent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use audio_engine_types::{AnalysisFrame, EngineEvent, TransportState};
use crossbeam_channel::{Sender, select};
use rustfft::{Fft, FftPlanner, num_complex::Complex};

use crate::config::{AnalysisConfig, AnalysisMode, BandScale, Envelope};
use crate::events::EventBus;
use crate::ring::RingBuffer;
use crate::status::EngineShared;

/// Lowest frequency shown by log-scaled spectra.
const MIN_LOG_HZ: f32 = 20.0;

/// Frames drained from the tap per read.
const DRAIN_CHUNK: usize = 4096;

/// Per-frame transform selected by [`AnalysisMode`].
pub enum Analyzer {
    Spectrum(SpectrumAnalyzer),
    Waveform(WaveformAnalyzer),
}

impl Analyzer {
    pub fn from_config(cfg: &AnalysisConfig) -> Self {
        match cfg.mode {
            AnalysisMode::Spectrum => Self::Spectrum(SpectrumAnalyzer::new(cfg)),
            AnalysisMode::Waveform => Self::Waveform(WaveformAnalyzer::new(cfg)),
        }
    }

    /// Analyze mono `history` (newest sample last) captured at `sample_rate`.
    pub fn analyze(&mut self, history: &[f32], sample_rate: u32) -> AnalysisFrame {
        match self {
            Self::Spectrum(a) => a.analyze(history, sample_rate),
            Self::Waveform(a) => a.analyze(history, sample_rate),
        }
    }

    pub fn silent_frame(&self) -> AnalysisFrame {
        match self {
            Self::Spectrum(a) => AnalysisFrame::silent_spectrum(a.bands),
            Self::Waveform(a) => AnalysisFrame::silent_waveform(a.points),
        }
    }

    /// Forget smoothing and peak state (seek, track change).
    pub fn reset(&mut self) {
        if let Self::Spectrum(a) = self {
            a.reset();
        }
    }
}

/// Hann-windowed FFT reduced to a fixed number of bands, with smoothing and falling peaks.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_sum: f32,
    buffer: Vec<Complex<f32>>,
    bands: usize,
    scale: BandScale,
    smoothing: f32,
    hold_ticks: u32,
    gravity: f32,
    db_floor: f32,
    bars: Vec<f32>,
    peaks: Vec<f32>,
    holds: Vec<u32>,
    ranges: Vec<(usize, usize)>,
    ranges_rate: u32,
}

impl SpectrumAnalyzer {
    pub fn new(cfg: &AnalysisConfig) -> Self {
        let n = cfg.fft_size.max(16);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let window: Vec<f32> = (0..n)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();
        let window_sum = window.iter().sum::<f32>().max(f32::EPSILON);
        let bands = cfg.spectrum_bands.max(1);
        Self {
            fft,
            window,
            window_sum,
            buffer: vec![Complex::new(0.0, 0.0); n],
            bands,
            scale: cfg.band_scale,
            smoothing: cfg.smoothing,
            hold_ticks: cfg.peak_hold_ticks,
            gravity: cfg.peak_gravity,
            db_floor: cfg.db_floor,
            bars: vec![0.0; bands],
            peaks: vec![0.0; bands],
            holds: vec![0; bands],
            ranges: Vec::new(),
            ranges_rate: 0,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    pub fn reset(&mut self) {
        self.bars.fill(0.0);
        self.peaks.fill(0.0);
        self.holds.fill(0);
    }

    pub fn analyze(&mut self, history: &[f32], sample_rate: u32) -> AnalysisFrame {
        let n = self.fft_size();
        if history.len() < n || sample_rate == 0 {
            return AnalysisFrame::silent_spectrum(self.bands);
        }
        if self.ranges_rate != sample_rate {
            self.ranges = band_ranges(self.scale, self.bands, n, sample_rate);
            self.ranges_rate = sample_rate;
        }

        let recent = &history[history.len() - n..];
        for ((slot, s), w) in self.buffer.iter_mut().zip(recent).zip(&self.window) {
            *slot = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.buffer);

        let span = -self.db_floor;
        for (band, &(lo, hi)) in self.ranges.iter().enumerate() {
            let mag = self.buffer[lo..hi]
                .iter()
                .map(|c| c.norm())
                .fold(0.0f32, f32::max);
            let amplitude = mag * 2.0 / self.window_sum;
            let db = 20.0 * amplitude.max(1e-12).log10();
            let level = ((db - self.db_floor) / span).clamp(0.0, 1.0);

            let bar = self.smoothing * self.bars[band] + (1.0 - self.smoothing) * level;
            self.bars[band] = bar;

            if bar >= self.peaks[band] {
                self.peaks[band] = bar;
                self.holds[band] = self.hold_ticks;
            } else if self.holds[band] > 0 {
                self.holds[band] -= 1;
            } else {
                self.peaks[band] = (self.peaks[band] * self.gravity).max(bar);
            }
        }

        AnalysisFrame::Spectrum {
            bars: self.bars.clone(),
            peaks: self.peaks.clone(),
        }
    }
}

/// Half-open FFT bin ranges for each band; every band covers at least one bin.
pub fn band_ranges(scale: BandScale, bands: usize, fft_size: usize, sample_rate: u32) -> Vec<(usize, usize)> {
    let half = (fft_size / 2).max(2);
    let rate = sample_rate as f32;
    let bin_for_hz = |hz: f32| -> usize {
        ((hz * fft_size as f32 / rate).floor() as usize).clamp(1, half - 1)
    };
    (0..bands)
        .map(|i| {
            let (lo, hi) = match scale {
                BandScale::Linear => (
                    1 + i * (half - 1) / bands,
                    1 + (i + 1) * (half - 1) / bands,
                ),
                BandScale::Log => {
                    let f_lo = MIN_LOG_HZ.max(rate / fft_size as f32);
                    let f_hi = rate / 2.0;
                    let ratio = f_hi / f_lo;
                    let edge = |k: usize| f_lo * ratio.powf(k as f32 / bands as f32);
                    (bin_for_hz(edge(i)), bin_for_hz(edge(i + 1)))
                }
            };
            let lo = lo.min(half - 1);
            (lo, hi.max(lo + 1).min(half))
        })
        .collect()
}

/// Fixed-length peak or RMS envelope of the whole history window.
pub struct WaveformAnalyzer {
    points: usize,
    envelope: Envelope,
    history_ms: u64,
}

impl WaveformAnalyzer {
    pub fn new(cfg: &AnalysisConfig) -> Self {
        Self {
            points: cfg.waveform_points.max(1),
            envelope: cfg.envelope,
            history_ms: cfg.history_ms,
        }
    }

    /// Samples needed before a non-silent frame is produced.
    pub fn required_samples(&self, sample_rate: u32) -> usize {
        ((sample_rate as u64 * self.history_ms / 1000) as usize).max(self.points)
    }

    pub fn analyze(&mut self, history: &[f32], sample_rate: u32) -> AnalysisFrame {
        let needed = self.required_samples(sample_rate);
        if history.len() < needed || sample_rate == 0 {
            return AnalysisFrame::silent_waveform(self.points);
        }
        let window = &history[history.len() - needed..];
        let points = (0..self.points)
            .map(|i| {
                let start = i * window.len() / self.points;
                let end = ((i + 1) * window.len() / self.points).max(start + 1);
                let bucket = &window[start..end];
                let v = match self.envelope {
                    Envelope::Peak => bucket.iter().map(|s| s.abs()).fold(0.0f32, f32::max),
                    Envelope::Rms => {
                        (bucket.iter().map(|s| s * s).sum::<f32>() / bucket.len() as f32).sqrt()
                    }
                };
                v.clamp(0.0, 1.0)
            })
            .collect();
        AnalysisFrame::Waveform { points }
    }
}

/// Running analysis thread. Dropping the handle stops and joins it.
pub(crate) struct AnalysisHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl AnalysisHandle {
    pub(crate) fn spawn(
        cfg: &AnalysisConfig,
        shared: Arc<EngineShared>,
        tap: Arc<RingBuffer>,
        bus: EventBus,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let interval = Duration::from_millis(cfg.interval_ms.max(1));
        let mut analyzer = Analyzer::from_config(cfg);
        let history_ms = cfg.history_ms;
        let fft_size = cfg.fft_size;

        let join = thread::Builder::new()
            .name("peachy-analysis".to_string())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                let mut history: VecDeque<f32> = VecDeque::new();
                let mut scratch = vec![0.0f32; DRAIN_CHUNK];
                let mut generation = shared.generation();

                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {}
                    }

                    let current = shared.generation();
                    if current != generation {
                        generation = current;
                        history.clear();
                        tap.flush();
                        analyzer.reset();
                    }

                    loop {
                        let n = tap.read(&mut scratch);
                        if n == 0 {
                            break;
                        }
                        history.extend(&scratch[..n]);
                    }

                    let rate = shared.output_rate();
                    let keep = ((rate as u64 * history_ms / 1000) as usize).max(fft_size);
                    if history.len() > keep {
                        history.drain(..history.len() - keep);
                    }

                    if shared.state() != TransportState::Playing {
                        continue;
                    }
                    let frame = if rate == 0 {
                        analyzer.silent_frame()
                    } else {
                        analyzer.analyze(history.make_contiguous(), rate)
                    };
                    bus.publish(EngineEvent::AnalysisFrameReady { frame });
                }
                tracing::debug!("analysis thread stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::PlaybackInfo;
    use audio_engine_types::EventKind;

    fn sine(freq: f32, rate: u32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn spectrum_cfg() -> AnalysisConfig {
        AnalysisConfig {
            smoothing: 0.0,
            ..AnalysisConfig::default()
        }
    }

    fn bars_of(frame: &AnalysisFrame) -> (&[f32], &[f32]) {
        match frame {
            AnalysisFrame::Spectrum { bars, peaks } => (bars, peaks),
            other => panic!("expected spectrum, got {other:?}"),
        }
    }

    fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, v)| if *v > acc.1 { (i, *v) } else { acc })
            .0
    }

    #[test]
    fn band_ranges_cover_at_least_one_bin() {
        for scale in [BandScale::Log, BandScale::Linear] {
            for rate in [8_000, 44_100, 192_000] {
                let ranges = band_ranges(scale, 64, 2048, rate);
                assert_eq!(ranges.len(), 64);
                for (lo, hi) in ranges {
                    assert!(lo >= 1 && hi > lo && hi <= 1024, "{scale:?} {rate}: {lo}..{hi}");
                }
            }
        }
    }

    #[test]
    fn sine_peaks_in_matching_band() {
        let cfg = spectrum_cfg();
        let mut a = SpectrumAnalyzer::new(&cfg);
        let frame = a.analyze(&sine(1_000.0, 48_000, 4_096, 0.8), 48_000);
        let (bars, _) = bars_of(&frame);
        let loudest = argmax(bars);
        let (lo, hi) = band_ranges(BandScale::Log, 64, 2048, 48_000)[loudest];
        let bin = (1_000.0f32 * 2048.0 / 48_000.0).round() as usize;
        assert!(lo <= bin + 1 && bin <= hi, "band {loudest} = {lo}..{hi}, bin {bin}");
        assert!(bars[loudest] > 0.8);
        assert!(bars.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn frame_length_is_independent_of_rate() {
        let cfg = spectrum_cfg();
        for rate in [8_000, 44_100, 96_000] {
            let mut a = Analyzer::from_config(&cfg);
            let frame = a.analyze(&sine(440.0, rate, 4_096, 0.5), rate);
            assert_eq!(frame.len(), 64);
        }
        let wave_cfg = AnalysisConfig {
            mode: AnalysisMode::Waveform,
            ..AnalysisConfig::default()
        };
        for rate in [8_000, 44_100, 96_000] {
            let mut a = Analyzer::from_config(&wave_cfg);
            let frame = a.analyze(&sine(440.0, rate, rate as usize, 0.5), rate);
            assert_eq!(frame.len(), 200);
            assert!(!frame.is_silent());
        }
    }

    #[test]
    fn short_history_yields_silent_frame() {
        let mut spec = Analyzer::from_config(&spectrum_cfg());
        let frame = spec.analyze(&[0.5; 100], 48_000);
        assert!(frame.is_silent());
        assert_eq!(frame.len(), 64);

        let mut wave = Analyzer::from_config(&AnalysisConfig {
            mode: AnalysisMode::Waveform,
            ..AnalysisConfig::default()
        });
        let frame = wave.analyze(&[0.5; 100], 48_000);
        assert!(frame.is_silent());
        assert_eq!(frame.len(), 200);
    }

    #[test]
    fn peaks_hold_then_fall_and_reset_on_rise() {
        let cfg = AnalysisConfig {
            smoothing: 0.0,
            peak_hold_ticks: 2,
            peak_gravity: 0.5,
            ..AnalysisConfig::default()
        };
        let mut a = SpectrumAnalyzer::new(&cfg);
        let loud = sine(1_000.0, 48_000, 2_048, 0.9);
        let quiet = vec![0.0f32; 2_048];

        let frame = a.analyze(&loud, 48_000);
        let (bars, _) = bars_of(&frame);
        let band = argmax(bars);
        let top = bars[band];

        let p1 = bars_of(&a.analyze(&quiet, 48_000)).1[band];
        let p2 = bars_of(&a.analyze(&quiet, 48_000)).1[band];
        let p3 = bars_of(&a.analyze(&quiet, 48_000)).1[band];
        assert_eq!(p1, top);
        assert_eq!(p2, top);
        assert!((p3 - top * 0.5).abs() < 1e-6);

        let frame = a.analyze(&loud, 48_000);
        let (bars, peaks) = bars_of(&frame);
        assert_eq!(peaks[band], bars[band]);
    }

    #[test]
    fn smoothing_blends_previous_bar() {
        let cfg = AnalysisConfig {
            smoothing: 0.5,
            ..AnalysisConfig::default()
        };
        let mut a = SpectrumAnalyzer::new(&cfg);
        let loud = sine(1_000.0, 48_000, 2_048, 0.9);
        let first = bars_of(&a.analyze(&loud, 48_000)).0.to_vec();
        let second = bars_of(&a.analyze(&loud, 48_000)).0.to_vec();
        let band = argmax(&second);
        assert!((first[band] - second[band] * 0.5 / 0.75).abs() < 1e-4);
        a.reset();
        let again = bars_of(&a.analyze(&loud, 48_000)).0.to_vec();
        assert!((again[band] - first[band]).abs() < 1e-6);
    }

    #[test]
    fn waveform_envelopes() {
        let peak_cfg = AnalysisConfig {
            mode: AnalysisMode::Waveform,
            waveform_points: 10,
            history_ms: 100,
            ..AnalysisConfig::default()
        };
        let mut peak = WaveformAnalyzer::new(&peak_cfg);
        let frame = peak.analyze(&vec![-0.5f32; 800], 8_000);
        assert_eq!(frame, AnalysisFrame::Waveform { points: vec![0.5; 10] });

        let mut rms = WaveformAnalyzer::new(&AnalysisConfig {
            envelope: Envelope::Rms,
            ..peak_cfg
        });
        let AnalysisFrame::Waveform { points } = rms.analyze(&sine(400.0, 8_000, 800, 1.0), 8_000)
        else {
            panic!("expected waveform");
        };
        assert_eq!(points.len(), 10);
        for p in points {
            assert!((p - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.02, "rms {p}");
        }
    }

    #[test]
    fn pipeline_publishes_only_while_playing() {
        let cfg = AnalysisConfig {
            interval_ms: 5,
            ..AnalysisConfig::default()
        };
        let tap = Arc::new(RingBuffer::new(1, 1 << 16));
        let shared = Arc::new(EngineShared::new(Some(tap.clone())));
        shared.set_playback(PlaybackInfo {
            output_sample_rate: Some(8_000),
            ..PlaybackInfo::default()
        });
        let bus = EventBus::new(16);
        let sub = bus.subscribe_to(&[EventKind::Analysis]);

        tap.try_write(&sine(500.0, 8_000, 4_000, 0.7)).unwrap();
        let handle = AnalysisHandle::spawn(&cfg, shared.clone(), tap, bus).unwrap();

        assert!(sub.recv_timeout(Duration::from_millis(100)).is_none());
        shared.store_state(TransportState::Playing);
        let event = sub.recv_timeout(Duration::from_secs(2)).expect("analysis frame");
        match event {
            EngineEvent::AnalysisFrameReady { frame } => {
                assert_eq!(frame.len(), 64);
                assert!(!frame.is_silent());
            }
            other => panic!("unexpected event {other:?}"),
        }
        drop(handle);
    }
}
