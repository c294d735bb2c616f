//! Pull-based audio decoding.
//!
//! [`Decoder`] is the seam the playback engine reads PCM through; [`SymphoniaDecoder`] is the
//! production implementation. A [`SourceOpener`] turns queued [`Track`] descriptors into
//! decoders so tests (and embedders) can substitute their own sources.

use std::fs::File;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use audio_engine_types::{AudioFormat, Track};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::error::{EngineError, EngineResult};

/// File extensions recognized when expanding directories.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "flac", "mp3", "wav", "ogg", "m4a", "aac", "opus", "aiff", "aif", "alac",
];

/// Consecutive undecodable packets tolerated before the stream is declared corrupt.
const MAX_CONSECUTIVE_DECODE_ERRORS: usize = 8;

/// Whether `path` has one of [`AUDIO_EXTENSIONS`].
pub fn is_audio_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// A run of interleaved `f32` frames, moved from the decoder into the ring.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameBlock {
    channels: usize,
    samples: Vec<f32>,
}

impl FrameBlock {
    pub fn new(channels: usize, samples: Vec<f32>) -> Self {
        debug_assert!(channels > 0 && samples.len() % channels == 0);
        Self { channels, samples }
    }

    pub fn empty(channels: usize) -> Self {
        Self::new(channels, Vec::new())
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }

    /// An empty block signals end of stream.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

/// Pull-based PCM source for one track.
pub trait Decoder: Send {
    /// Descriptor resolved at open (rate, channels, duration, seekability).
    fn track(&self) -> &Track;

    /// Read up to `max_frames` frames. Fewer are returned only at end of stream; an empty
    /// block means end of stream.
    fn read_frames(&mut self, max_frames: usize) -> EngineResult<FrameBlock>;

    /// Reposition to `frame` (source frames). Returns the frame actually reached.
    fn seek(&mut self, frame: u64) -> EngineResult<u64>;

    /// Release the underlying source. Further reads return end of stream.
    fn close(&mut self);
}

/// Opens decoders for queued tracks.
pub trait SourceOpener: Send + Sync {
    fn open(&self, track: &Track) -> EngineResult<Box<dyn Decoder>>;
}

/// Default opener backed by Symphonia.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaOpener;

impl SourceOpener for SymphoniaOpener {
    fn open(&self, track: &Track) -> EngineResult<Box<dyn Decoder>> {
        let mut decoder = SymphoniaDecoder::open(&track.path)?;
        if decoder.track.title.is_none() {
            decoder.track.title = track.title.clone();
        }
        Ok(Box::new(decoder))
    }
}

struct Stream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
}

/// Symphonia-backed decoder for local files.
pub struct SymphoniaDecoder {
    track: Track,
    channels: usize,
    sample_rate: u32,
    stream: Option<Stream>,
    pending: Vec<f32>,
    pending_pos: usize,
    /// After a seek, drop decoded audio before this timestamp.
    trim_until: Option<u64>,
    finished: bool,
}

impl SymphoniaDecoder {
    /// Open and probe `path`.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => EngineError::FileNotFound(path.to_path_buf()),
            _ => EngineError::CorruptStream(format!("open {}: {e}", path.display())),
        })?;

        let mut hint = Hint::new();
        let ext = path.extension().and_then(|e| e.to_str());
        if let Some(ext) = ext {
            hint.with_extension(ext);
        }
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let seekable = mss.is_seekable();

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| match e {
                SymphoniaError::Unsupported(what) => {
                    EngineError::UnsupportedFormat(format!("{}: {what}", path.display()))
                }
                other => EngineError::CorruptStream(format!("probe {}: {other}", path.display())),
            })?;
        let format = probed.format;

        let source = format
            .default_track()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .or_else(|| {
                format
                    .tracks()
                    .iter()
                    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            })
            .ok_or_else(|| {
                EngineError::UnsupportedFormat(format!("{}: no audio track", path.display()))
            })?;
        let params: CodecParameters = source.codec_params.clone();
        let track_id = source.id;

        let sample_rate = params.sample_rate.ok_or_else(|| {
            EngineError::UnsupportedFormat(format!("{}: unknown sample rate", path.display()))
        })?;
        let channels = params
            .channels
            .map(|c| c.count())
            .filter(|c| *c > 0)
            .ok_or_else(|| {
                EngineError::UnsupportedFormat(format!("{}: unknown channel layout", path.display()))
            })?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| match e {
                SymphoniaError::Unsupported(what) => {
                    EngineError::UnsupportedFormat(format!("{}: {what}", path.display()))
                }
                other => EngineError::CorruptStream(other.to_string()),
            })?;

        let container = ext.map(AudioFormat::from_extension).unwrap_or_default();
        let track = Track {
            path: path.to_path_buf(),
            title: None,
            format: format_for_codec(&params, container),
            sample_rate: Some(sample_rate),
            channels: Some(channels as u16),
            duration_frames: params.n_frames,
            seekable,
        };
        tracing::debug!(
            path = %path.display(),
            rate_hz = sample_rate,
            channels,
            codec = codec_label(&params).unwrap_or("?"),
            "decoder opened"
        );

        Ok(Self {
            track,
            channels,
            sample_rate,
            stream: Some(Stream {
                format,
                decoder,
                track_id,
                time_base: params.time_base,
            }),
            pending: Vec::new(),
            pending_pos: 0,
            trim_until: None,
            finished: false,
        })
    }

    /// Decode the next packet of our track into `pending`. Returns `false` at end of stream.
    fn decode_next(&mut self) -> EngineResult<bool> {
        let channels = self.channels;
        let rate = self.sample_rate;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        let mut failures = 0usize;

        loop {
            let packet = match stream.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == IoErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    stream.decoder.reset();
                    continue;
                }
                Err(e) => return Err(EngineError::CorruptStream(format!("read packet: {e}"))),
            };
            if packet.track_id() != stream.track_id {
                continue;
            }

            let decoded = match stream.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(what)) => {
                    failures += 1;
                    tracing::debug!(failures, "skipping undecodable packet: {what}");
                    if failures > MAX_CONSECUTIVE_DECODE_ERRORS {
                        return Err(EngineError::CorruptStream(format!(
                            "{failures} consecutive undecodable packets: {what}"
                        )));
                    }
                    continue;
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == IoErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(e) => return Err(EngineError::CorruptStream(format!("decode: {e}"))),
            };

            if decoded.spec().channels.count() != channels {
                return Err(EngineError::CorruptStream(
                    "channel layout changed mid-stream".to_string(),
                ));
            }
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let mut skip = 0usize;
            if let Some(required) = self.trim_until {
                let start = packet.ts();
                let end = start.saturating_add(packet.dur());
                if end <= required {
                    continue;
                }
                if required > start {
                    skip = (ts_to_frames(stream.time_base, rate, required - start) as usize)
                        .min(frames);
                }
                self.trim_until = None;
            }

            let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            self.pending.clear();
            self.pending
                .extend_from_slice(&sample_buf.samples()[skip * channels..]);
            self.pending_pos = 0;
            return Ok(true);
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn track(&self) -> &Track {
        &self.track
    }

    fn read_frames(&mut self, max_frames: usize) -> EngineResult<FrameBlock> {
        let want = max_frames.max(1) * self.channels;
        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            if self.pending_pos < self.pending.len() {
                let take = (want - out.len()).min(self.pending.len() - self.pending_pos);
                out.extend_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
                self.pending_pos += take;
                continue;
            }
            if self.finished {
                break;
            }
            match self.decode_next() {
                Ok(true) => {}
                Ok(false) => self.finished = true,
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            }
        }
        Ok(FrameBlock::new(self.channels, out))
    }

    fn seek(&mut self, frame: u64) -> EngineResult<u64> {
        if !self.track.seekable {
            return Err(EngineError::SeekUnsupported);
        }
        if let Some(duration) = self.track.duration_frames {
            if frame >= duration {
                return Err(EngineError::InvalidSeek {
                    position: frame,
                    duration,
                });
            }
        }
        let rate = self.sample_rate;
        let stream = self.stream.as_mut().ok_or(EngineError::EngineClosed)?;
        let time = frames_to_time(frame, rate);
        let seeked = stream
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(stream.track_id),
                },
            )
            .map_err(|e| match e {
                SymphoniaError::SeekError(_) | SymphoniaError::Unsupported(_) => {
                    EngineError::SeekUnsupported
                }
                other => EngineError::CorruptStream(format!("seek: {other}")),
            })?;
        stream.decoder.reset();
        self.pending.clear();
        self.pending_pos = 0;
        self.finished = false;
        self.trim_until = (seeked.required_ts > seeked.actual_ts).then_some(seeked.required_ts);
        Ok(frame)
    }

    fn close(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.pending_pos = 0;
        self.finished = true;
    }
}

fn frames_to_time(frame: u64, rate: u32) -> Time {
    let rate = rate.max(1) as u64;
    Time::new(frame / rate, (frame % rate) as f64 / rate as f64)
}

fn ts_to_frames(time_base: Option<TimeBase>, rate: u32, ts: u64) -> u64 {
    match time_base {
        Some(tb) => {
            let t = tb.calc_time(ts);
            t.seconds * rate as u64 + (t.frac * rate as f64).round() as u64
        }
        None => ts,
    }
}

/// Short codec label for logs and status lines.
pub fn codec_label(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

/// Codec family, falling back to the container for raw PCM.
fn format_for_codec(params: &CodecParameters, container: AudioFormat) -> AudioFormat {
    match codec_label(params) {
        Some("FLAC") => AudioFormat::Flac,
        Some("MP3") => AudioFormat::Mp3,
        Some("AAC") => AudioFormat::Aac,
        Some("ALAC") => AudioFormat::Alac,
        Some("VORBIS") => AudioFormat::Vorbis,
        Some("OPUS") => AudioFormat::Opus,
        Some(_) => match container {
            AudioFormat::Wav | AudioFormat::Aiff => container,
            _ => AudioFormat::Pcm,
        },
        None => container,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TempDir, write_wav_ramp};
    use symphonia::core::codecs::*;

    #[test]
    fn audio_extension_filter() {
        assert!(is_audio_path(Path::new("/a/b.FLAC")));
        assert!(is_audio_path(Path::new("x.aif")));
        assert!(!is_audio_path(Path::new("cover.jpg")));
        assert!(!is_audio_path(Path::new("README")));
    }

    #[test]
    fn codec_label_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_label(&params), Some("FLAC"));
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_label(&params), Some("PCM_S16"));
        assert_eq!(format_for_codec(&params, AudioFormat::Wav), AudioFormat::Wav);
        assert_eq!(format_for_codec(&params, AudioFormat::Unknown), AudioFormat::Pcm);
        assert!(codec_label(&CodecParameters::new()).is_none());
    }

    #[test]
    fn frame_time_conversion() {
        let t = frames_to_time(66_150, 44_100);
        assert_eq!(t.seconds, 1);
        assert!((t.frac - 0.5).abs() < 1e-9);
        assert_eq!(ts_to_frames(None, 44_100, 123), 123);
        assert_eq!(ts_to_frames(Some(TimeBase::new(1, 8_000)), 8_000, 4_000), 4_000);
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let err = SymphoniaDecoder::open(Path::new("/nonexistent/track.flac"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::FileNotFound(_)));
    }

    #[test]
    fn garbage_file_is_unsupported() {
        let dir = TempDir::new("garbage");
        let path = dir.path().join("noise.flac");
        std::fs::write(&path, vec![0x5au8; 4096]).unwrap();
        let err = SymphoniaDecoder::open(&path).err().unwrap();
        assert!(
            matches!(err, EngineError::UnsupportedFormat(_) | EngineError::CorruptStream(_)),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn wav_decodes_all_frames_in_order() {
        let dir = TempDir::new("wav-read");
        let path = dir.path().join("ramp.wav");
        write_wav_ramp(&path, 8_000, 2, 5_000);

        let mut dec = SymphoniaDecoder::open(&path).unwrap();
        let track = dec.track().clone();
        assert_eq!(track.sample_rate, Some(8_000));
        assert_eq!(track.channels, Some(2));
        assert_eq!(track.duration_frames, Some(5_000));
        assert_eq!(track.format, AudioFormat::Wav);
        assert!(track.seekable);

        let mut total = 0usize;
        let mut first = None;
        loop {
            let block = dec.read_frames(1_000).unwrap();
            if block.is_empty() {
                break;
            }
            assert_eq!(block.channels(), 2);
            if first.is_none() {
                first = Some(block.samples()[..4].to_vec());
            }
            if total + block.frames() < 5_000 {
                assert_eq!(block.frames(), 1_000);
            }
            total += block.frames();
        }
        assert_eq!(total, 5_000);
        let first = first.unwrap();
        assert!(first[0].abs() < 1e-3);
        assert!(first[2] > first[0]);
    }

    #[test]
    fn wav_seek_repositions_cursor() {
        let dir = TempDir::new("wav-seek");
        let path = dir.path().join("ramp.wav");
        write_wav_ramp(&path, 8_000, 1, 8_000);

        let mut dec = SymphoniaDecoder::open(&path).unwrap();
        assert_eq!(dec.seek(4_000).unwrap(), 4_000);
        let mut total = 0usize;
        loop {
            let block = dec.read_frames(512).unwrap();
            if block.is_empty() {
                break;
            }
            total += block.frames();
        }
        assert_eq!(total, 4_000);

        let err = dec.seek(8_000).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSeek { .. }));
    }

    #[test]
    fn closed_decoder_reports_end_of_stream() {
        let dir = TempDir::new("wav-close");
        let path = dir.path().join("ramp.wav");
        write_wav_ramp(&path, 8_000, 1, 1_000);
        let mut dec = SymphoniaDecoder::open(&path).unwrap();
        dec.close();
        assert!(dec.read_frames(100).unwrap().is_empty());
    }
}
