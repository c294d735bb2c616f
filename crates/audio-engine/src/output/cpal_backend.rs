//! CPAL output backend.
//!
//! Each stream lives on its own owner thread: CPAL streams are not `Send` on every host, so
//! the engine only ever holds a command channel to it.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use super::{
    ErrorSink, OutputBackend, OutputFormat, OutputRequest, OutputStream, RenderCallback,
    SampleFormat, run_bounded,
};
use crate::error::{EngineError, EngineResult};

/// Frames converted per pass for non-`f32` devices.
const SCRATCH_FRAMES: usize = 4096;

/// Largest fixed callback size we ask for.
const MAX_BUFFER_FRAMES: u32 = 16_384;

/// Output through the host's default audio API.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpalBackend;

/// Output device metadata for `--list-devices`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub is_default: bool,
}

/// Enumerate output devices on the default host.
pub fn list_devices() -> EngineResult<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().map(|d| device_name(&d));
    let devices = host
        .output_devices()
        .map_err(|e| EngineError::DeviceError(format!("enumerate devices: {e}")))?;

    let mut out = Vec::new();
    for d in devices {
        let name = device_name(&d);
        let mut min_rate = u32::MAX;
        let mut max_rate = 0u32;
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
            }
        }
        if max_rate == 0 || min_rate > max_rate {
            match d.default_output_config() {
                Ok(cfg) => {
                    min_rate = cfg.sample_rate();
                    max_rate = cfg.sample_rate();
                }
                Err(_) => {
                    tracing::warn!(device = %name, "skipping device without usable output config");
                    continue;
                }
            }
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

impl OutputBackend for CpalBackend {
    fn negotiate(&self, request: &OutputRequest, timeout: Duration) -> EngineResult<OutputFormat> {
        let request = request.clone();
        run_bounded(timeout, "device-negotiate", move || {
            let host = cpal::default_host();
            let device = pick_device(&host, request.device.as_deref())?;
            let config =
                pick_output_config(&device, Some(request.sample_rate), request.channels)?;
            let sample_format = map_sample_format(config.sample_format())?;
            let buffer_frames = match pick_buffer_size(&config) {
                Some(cpal::BufferSize::Fixed(n)) => Some(n),
                _ => None,
            };
            Ok(OutputFormat {
                device: device_name(&device),
                sample_rate: config.sample_rate(),
                channels: config.channels(),
                sample_format,
                buffer_frames,
            })
        })
    }

    fn open(
        &self,
        format: &OutputFormat,
        render: RenderCallback,
        on_error: ErrorSink,
        timeout: Duration,
    ) -> EngineResult<Box<dyn OutputStream>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<EngineResult<()>>(1);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<StreamCmd>();
        let format = format.clone();

        let join = thread::Builder::new()
            .name("peachy-output".to_string())
            .spawn(move || {
                let stream = match build_for_format(&format, render, on_error) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Some hosts start streams immediately.
                let _ = stream.pause();
                tracing::info!(
                    device = %format.device,
                    rate_hz = format.sample_rate,
                    channels = format.channels,
                    "output stream open"
                );
                let _ = ready_tx.send(Ok(()));
                stream_owner_loop(stream, cmd_rx);
            })
            .map_err(|e| EngineError::DeviceError(format!("spawn output thread: {e}")))?;

        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                cmd: Some(cmd_tx),
                join: Some(join),
                timeout,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::DeviceError(format!(
                "output stream open timed out after {} ms",
                timeout.as_millis()
            ))),
        }
    }
}

enum StreamCmd {
    Play(Sender<EngineResult<()>>),
    Pause(Sender<EngineResult<()>>),
}

/// Runs until the engine drops its command sender; the stream is dropped on exit.
fn stream_owner_loop(stream: cpal::Stream, cmd_rx: Receiver<StreamCmd>) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            StreamCmd::Play(reply) => {
                let _ = reply.send(
                    stream
                        .play()
                        .map_err(|e| EngineError::DeviceError(format!("play: {e}"))),
                );
            }
            StreamCmd::Pause(reply) => {
                let _ = reply.send(
                    stream
                        .pause()
                        .map_err(|e| EngineError::DeviceError(format!("pause: {e}"))),
                );
            }
        }
    }
}

struct CpalStream {
    cmd: Option<Sender<StreamCmd>>,
    join: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl CpalStream {
    fn request(&self, make: fn(Sender<EngineResult<()>>) -> StreamCmd) -> EngineResult<()> {
        let cmd = self
            .cmd
            .as_ref()
            .ok_or_else(|| EngineError::DeviceError("stream closed".to_string()))?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        cmd.send(make(tx))
            .map_err(|_| EngineError::DeviceError("output thread exited".to_string()))?;
        rx.recv_timeout(self.timeout)
            .map_err(|_| EngineError::DeviceError("output thread did not answer".to_string()))?
    }
}

impl OutputStream for CpalStream {
    fn play(&mut self) -> EngineResult<()> {
        self.request(StreamCmd::Play)
    }

    fn pause(&mut self) -> EngineResult<()> {
        self.request(StreamCmd::Pause)
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.cmd.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn build_for_format(
    format: &OutputFormat,
    render: RenderCallback,
    on_error: ErrorSink,
) -> EngineResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, Some(&format.device))?;
    let config = pick_output_config(&device, Some(format.sample_rate), format.channels)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(frames) = format.buffer_frames {
        stream_config.buffer_size = cpal::BufferSize::Fixed(frames);
    }
    match format.sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, render, on_error),
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, render, on_error),
        SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, render, on_error),
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, render, on_error),
    }
}

/// Type-specialized stream builder; renders `f32` into a scratch buffer and converts.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: RenderCallback,
    on_error: ErrorSink,
) -> EngineResult<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = render.channels();
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * channels];
    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        on_error(err.to_string());
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                for chunk in data.chunks_mut(scratch.len()) {
                    let buf = &mut scratch[..chunk.len()];
                    render.render(buf);
                    for (dst, src) in chunk.iter_mut().zip(buf.iter()) {
                        *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| EngineError::DeviceError(format!("build output stream: {e}")))
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "unknown device".to_string())
}

/// First output device whose name matches `needle` (exact, then substring), or the default.
fn pick_device(host: &cpal::Host, needle: Option<&str>) -> EngineResult<cpal::Device> {
    if let Some(needle) = needle {
        let devices: Vec<cpal::Device> = host
            .output_devices()
            .map_err(|e| EngineError::DeviceError(format!("enumerate devices: {e}")))?
            .collect();
        if let Some(d) = devices.iter().find(|d| device_name(d) == needle) {
            return Ok(d.clone());
        }
        return devices
            .into_iter()
            .find(|d| matches_device_name(&device_name(d), needle))
            .ok_or_else(|| EngineError::DeviceError(format!("no output device matched: {needle}")));
    }
    host.default_output_device()
        .ok_or_else(|| EngineError::DeviceError("no default output device".to_string()))
}

/// Best supported config for the track's rate and channel count.
///
/// Prefers the highest rate not above `target_rate`, then a matching channel count, then
/// `f32` over integer formats.
fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
    channels: u16,
) -> EngineResult<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| EngineError::DeviceError(format!("query output configs: {e}")))?
        .filter(|r| map_sample_format(r.sample_format()).is_ok())
        .collect();

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            below: target_rate.map(|t| rate <= t).unwrap_or(true),
            rate,
            channel_rank: u8::from(range.channels() != channels),
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = match &best {
            None => true,
            Some((b, _)) => candidate.is_better_than(b),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| EngineError::DeviceError("no supported output configs".to_string()))
}

/// Prefer a fixed buffer size when the device advertises a range.
fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = if *max > MAX_BUFFER_FRAMES {
                (*min).max(MAX_BUFFER_FRAMES.min(*max))
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(t) => t.clamp(min, max.max(min)),
        None => max,
    }
}

fn map_sample_format(format: cpal::SampleFormat) -> EngineResult<SampleFormat> {
    match format {
        cpal::SampleFormat::F32 => Ok(SampleFormat::F32),
        cpal::SampleFormat::I32 => Ok(SampleFormat::I32),
        cpal::SampleFormat::I16 => Ok(SampleFormat::I16),
        cpal::SampleFormat::U16 => Ok(SampleFormat::U16),
        other => Err(EngineError::DeviceError(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    below: bool,
    rate: u32,
    channel_rank: u8,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        if self.below != other.below {
            self.below
        } else if self.rate != other.rate {
            self.rate > other.rate
        } else if self.channel_rank != other.channel_rank {
            self.channel_rank < other.channel_rank
        } else {
            self.format_rank < other.format_rank
        }
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
