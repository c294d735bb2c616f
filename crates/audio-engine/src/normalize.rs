//! Converts decoded PCM to the output device's channel count and sample rate.
//!
//! Channel mapping happens first (cheap, and it keeps the resampler working on the final
//! channel count), then Rubato's streaming sinc resampler runs when the rates differ.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::decode::FrameBlock;
use crate::error::{EngineError, EngineResult};

/// Map interleaved `src` from `src_channels` to `dst_channels`, appending to `out`.
///
/// - mono → N: duplicate
/// - stereo → mono: average L/R
/// - same count: pass-through
/// - otherwise: clamp each output channel to the last available input channel
pub fn map_channels(src: &[f32], src_channels: usize, dst_channels: usize, out: &mut Vec<f32>) {
    if src_channels == dst_channels {
        out.extend_from_slice(src);
        return;
    }
    let frames = src.len() / src_channels.max(1);
    out.reserve(frames * dst_channels);
    for f in 0..frames {
        let frame = &src[f * src_channels..(f + 1) * src_channels];
        match (src_channels, dst_channels) {
            (2, 1) => out.push(0.5 * (frame[0] + frame[1])),
            (1, _) => out.extend(std::iter::repeat_n(frame[0], dst_channels)),
            _ => {
                for ch in 0..dst_channels {
                    out.push(frame[ch.min(src_channels - 1)]);
                }
            }
        }
    }
}

/// Streaming source → device format converter. One per decode session.
pub struct Normalizer {
    src_channels: usize,
    dst_channels: usize,
    chunk_frames: usize,
    resampler: Option<Box<dyn Resampler<f32>>>,
    /// Channel-mapped input waiting for a full resampler chunk.
    staged: Vec<f32>,
    out_buf: Vec<f32>,
}

impl Normalizer {
    pub fn new(
        src_rate: u32,
        src_channels: usize,
        dst_rate: u32,
        dst_channels: usize,
        chunk_frames: usize,
    ) -> EngineResult<Self> {
        let src_channels = src_channels.max(1);
        let dst_channels = dst_channels.max(1);
        let chunk_frames = chunk_frames.max(1);

        let resampler: Option<Box<dyn Resampler<f32>>> = if src_rate == dst_rate {
            None
        } else {
            let f_ratio = dst_rate as f64 / src_rate as f64;
            let sinc_len = 128;
            let window = WindowFunction::BlackmanHarris2;
            let params = SincInterpolationParameters {
                sinc_len,
                f_cutoff: calculate_cutoff(sinc_len, window),
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 256,
                window,
            };
            let r = Async::<f32>::new_sinc(
                f_ratio,
                1.1,
                &params,
                chunk_frames,
                dst_channels,
                FixedAsync::Input,
            )
            .map_err(|e| EngineError::UnsupportedFormat(format!("resampler init: {e}")))?;
            tracing::debug!(from_hz = src_rate, to_hz = dst_rate, "resampling");
            Some(Box::new(r))
        };

        Ok(Self {
            src_channels,
            dst_channels,
            chunk_frames,
            resampler,
            staged: Vec::with_capacity(chunk_frames * dst_channels * 2),
            out_buf: Vec::new(),
        })
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    /// Convert `block`, appending device-format samples to `out`.
    ///
    /// With resampling active, input is consumed in whole chunks; the remainder stays staged
    /// until the next call or [`Normalizer::finish`].
    pub fn process(&mut self, block: &FrameBlock, out: &mut Vec<f32>) -> EngineResult<()> {
        if self.resampler.is_none() {
            map_channels(block.samples(), self.src_channels, self.dst_channels, out);
            return Ok(());
        }
        map_channels(
            block.samples(),
            self.src_channels,
            self.dst_channels,
            &mut self.staged,
        );
        let chunk_samples = self.chunk_frames * self.dst_channels;
        let mut consumed = 0;
        while self.staged.len() - consumed >= chunk_samples {
            self.run_chunk(consumed, self.chunk_frames, None, out)?;
            consumed += chunk_samples;
        }
        self.staged.drain(..consumed);
        Ok(())
    }

    /// Flush staged input and the resampler's delay line at end of stream.
    pub fn finish(&mut self, out: &mut Vec<f32>) -> EngineResult<()> {
        if self.resampler.is_none() {
            return Ok(());
        }
        let tail_frames = self.staged.len() / self.dst_channels;
        if tail_frames > 0 {
            self.run_chunk(0, tail_frames, Some(tail_frames), out)?;
            self.staged.clear();
        }
        self.run_chunk(0, 0, Some(0), out)
    }

    fn run_chunk(
        &mut self,
        offset: usize,
        frames: usize,
        partial_len: Option<usize>,
        out: &mut Vec<f32>,
    ) -> EngineResult<()> {
        let channels = self.dst_channels;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        let out_frames = resampler.output_frames_next();
        if self.out_buf.len() < out_frames * channels {
            self.out_buf.resize(out_frames * channels, 0.0);
        }

        let input = &self.staged[offset..offset + frames * channels];
        let input_adapter = InterleavedSlice::new(input, channels, frames)
            .map_err(|e| EngineError::CorruptStream(format!("resampler input: {e}")))?;
        let mut output_adapter = InterleavedSlice::new_mut(
            &mut self.out_buf[..out_frames * channels],
            channels,
            out_frames,
        )
        .map_err(|e| EngineError::CorruptStream(format!("resampler output: {e}")))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| EngineError::CorruptStream(format!("resampler: {e}")))?;
        out.extend_from_slice(&self.out_buf[..nbr_out * channels]);
        Ok(())
    }
}
