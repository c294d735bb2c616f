//! Decode-ahead worker: keeps the ring filled for one track.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::decode::Decoder;
use crate::error::{EngineError, EngineResult};
use crate::normalize::Normalizer;
use crate::ring::RingBuffer;

/// How long the worker parks when the ring is full before checking again.
const FULL_BACKOFF: Duration = Duration::from_millis(5);

/// Messages from workers and device error callbacks to the engine thread.
///
/// `token` identifies the playback the message belongs to; stale tokens are ignored.
#[derive(Debug)]
pub(crate) enum Notice {
    /// The ring holds the prefill target, is full, or holds the whole (shorter) track.
    Primed { token: u64 },
    /// The decoder hit end of stream and every frame is in the ring.
    Finished { token: u64 },
    Failed { token: u64, error: EngineError },
    DeviceFailed { token: u64, message: String },
}

/// A decoder plus the conversion state that travels with it between sessions.
///
/// Normalized samples the ring had no room for stay in `pending`, so halting a worker and
/// spawning another one on the same feed loses nothing.
pub(crate) struct DecodeFeed {
    pub(crate) decoder: Box<dyn Decoder>,
    normalizer: Normalizer,
    pending: Vec<f32>,
    /// End of stream seen and the normalizer flushed.
    exhausted: bool,
}

impl DecodeFeed {
    pub(crate) fn new(decoder: Box<dyn Decoder>, normalizer: Normalizer) -> Self {
        Self {
            decoder,
            normalizer,
            pending: Vec::new(),
            exhausted: false,
        }
    }

    /// The decoder moved: drop converted leftovers and start a fresh conversion.
    pub(crate) fn restart(&mut self, normalizer: Normalizer) {
        self.normalizer = normalizer;
        self.pending.clear();
        self.exhausted = false;
    }

    /// Frames converted but not yet in the ring.
    fn pending_frames(&self, channels: usize) -> usize {
        self.pending.len() / channels.max(1)
    }

    /// Decode one block and append its converted samples to `pending`.
    fn refill(&mut self, chunk_frames: usize) -> EngineResult<()> {
        let block = self.decoder.read_frames(chunk_frames)?;
        if block.is_empty() {
            self.exhausted = true;
            self.normalizer.finish(&mut self.pending)
        } else {
            self.normalizer.process(&block, &mut self.pending)
        }
    }

    /// Move as much of `pending` into `ring` as fits; true once nothing is left.
    fn drain_into(&mut self, ring: &RingBuffer) -> bool {
        let written = ring.write_partial(&self.pending);
        self.pending.drain(..written * ring.channels());
        self.pending.is_empty()
    }
}

/// Sends `Primed` once, when the ring reaches the target or cannot take more.
struct Priming {
    token: u64,
    target: usize,
    sent: bool,
}

impl Priming {
    fn check(&mut self, ring: &RingBuffer, notices: &Sender<Notice>) {
        if !self.sent && (ring.available() >= self.target || ring.free() == 0) {
            self.send(notices);
        }
    }

    fn send(&mut self, notices: &Sender<Notice>) {
        if !self.sent {
            self.sent = true;
            let _ = notices.send(Notice::Primed { token: self.token });
        }
    }
}

enum Outcome {
    Finished,
    Failed(EngineError),
    Cancelled,
}

pub(crate) struct DecodeSession {
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<DecodeFeed>>,
}

impl DecodeSession {
    /// Start filling `ring` from `feed`, leftovers first.
    pub(crate) fn spawn(
        mut feed: DecodeFeed,
        ring: Arc<RingBuffer>,
        notices: Sender<Notice>,
        token: u64,
        chunk_frames: usize,
        prefill_frames: usize,
    ) -> EngineResult<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let chunk_frames = chunk_frames.max(1);

        let join = thread::Builder::new()
            .name("peachy-decode".to_string())
            .spawn(move || {
                let mut priming = Priming {
                    token,
                    target: prefill_frames,
                    sent: false,
                };

                let outcome = loop {
                    if cancel_flag.load(Ordering::Acquire) {
                        break Outcome::Cancelled;
                    }
                    if !feed.pending.is_empty() {
                        let done = feed.drain_into(&ring);
                        priming.check(&ring, &notices);
                        if !done {
                            // Full ring; the render side frees space, `halt` unparks us.
                            thread::park_timeout(FULL_BACKOFF);
                        }
                        continue;
                    }
                    if feed.exhausted {
                        break Outcome::Finished;
                    }
                    if let Err(e) = feed.refill(chunk_frames) {
                        break Outcome::Failed(e);
                    }
                };

                match outcome {
                    Outcome::Finished => {
                        ring.mark_ended();
                        priming.send(&notices);
                        let _ = notices.send(Notice::Finished { token });
                        tracing::debug!(token, "decode reached end of stream");
                    }
                    Outcome::Failed(error) => {
                        // Stop underrun accounting; the engine drops the track on this notice.
                        ring.mark_ended();
                        tracing::warn!(token, error = %error, "decode failed");
                        let _ = notices.send(Notice::Failed { token, error });
                    }
                    Outcome::Cancelled => tracing::debug!(
                        token,
                        pending = feed.pending_frames(ring.channels()),
                        "decode cancelled"
                    ),
                }
                feed
            })
            .map_err(|e| EngineError::DeviceError(format!("spawn decode thread: {e}")))?;

        Ok(Self {
            cancel,
            join: Some(join),
        })
    }

    /// Cancel the worker, wake it from any backoff and take the feed back.
    ///
    /// `None` only if the worker panicked.
    pub(crate) fn halt(mut self) -> Option<DecodeFeed> {
        self.stop()
    }

    fn stop(&mut self) -> Option<DecodeFeed> {
        self.cancel.store(true, Ordering::Release);
        let join = self.join.take()?;
        join.thread().unpark();
        join.join().ok()
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        if let Some(mut feed) = self.stop() {
            feed.decoder.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SyntheticDecoder, frame_of};

    fn feed(decoder: SyntheticDecoder, chunk: usize) -> DecodeFeed {
        let normalizer = Normalizer::new(8_000, 1, 8_000, 1, chunk).unwrap();
        DecodeFeed::new(Box::new(decoder), normalizer)
    }

    fn drain(ring: &RingBuffer, into: &mut Vec<f32>) {
        let mut buf = [0.0f32; 256];
        loop {
            let n = ring.read(&mut buf);
            if n == 0 {
                break;
            }
            into.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn fills_ring_and_reports_end() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ring = Arc::new(RingBuffer::new(1, 1_000));
        let decoder = SyntheticDecoder::new(8_000, 1, 500);
        let session =
            DecodeSession::spawn(feed(decoder, 64), ring.clone(), tx, 7, 64, 2_000).unwrap();

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Notice::Primed { token: 7 })
        ));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Notice::Finished { token: 7 })
        ));
        let mut samples = Vec::new();
        drain(&ring, &mut samples);
        assert_eq!(samples.len(), 500);
        assert!(ring.is_drained());
        assert!(session.halt().is_some());
    }

    #[test]
    fn waits_on_full_ring_and_halts_promptly() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ring = Arc::new(RingBuffer::new(1, 128));
        let decoder = SyntheticDecoder::new(8_000, 1, 100_000);
        let session =
            DecodeSession::spawn(feed(decoder, 64), ring.clone(), tx, 1, 64, 100).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Notice::Primed { token: 1 })
        ));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ring.available(), 128);

        let started = std::time::Instant::now();
        assert!(session.halt().is_some());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn primes_when_target_equals_capacity() {
        // 100-frame blocks never land exactly on a 128-frame ring.
        let (tx, rx) = crossbeam_channel::unbounded();
        let ring = Arc::new(RingBuffer::new(1, 128));
        let decoder = SyntheticDecoder::new(8_000, 1, 100_000);
        let _session =
            DecodeSession::spawn(feed(decoder, 100), ring.clone(), tx, 2, 100, 128).unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Notice::Primed { token: 2 })
        ));
        assert_eq!(ring.available(), 128);
    }

    #[test]
    fn halted_feed_resumes_without_gaps() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ring = Arc::new(RingBuffer::new(1, 128));
        let decoder = SyntheticDecoder::new(8_000, 1, 100_000);
        let session =
            DecodeSession::spawn(feed(decoder, 100), ring.clone(), tx.clone(), 1, 100, 128)
                .unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Notice::Primed { token: 1 })
        ));

        let halted = session.halt().unwrap();
        assert_eq!(halted.pending_frames(1), 72);
        let session = DecodeSession::spawn(halted, ring.clone(), tx, 2, 100, 128).unwrap();

        let mut samples = Vec::new();
        assert!(crate::testing::wait_until(Duration::from_secs(2), || {
            drain(&ring, &mut samples);
            samples.len() >= 1_000
        }));
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(frame_of(*s), i as u64, "frame {i} lost or duplicated");
        }
        drop(session);
    }

    #[test]
    fn decode_error_is_reported() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ring = Arc::new(RingBuffer::new(1, 10_000));
        let decoder = SyntheticDecoder::new(8_000, 1, 5_000).corrupt_at(1_000);
        let _session =
            DecodeSession::spawn(feed(decoder, 64), ring.clone(), tx, 3, 64, 4_000).unwrap();
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Notice::Failed { token: 3, error }) => {
                assert!(matches!(error, EngineError::CorruptStream(_)))
            }
            other => panic!("unexpected notice {other:?}"),
        }
        assert!(ring.is_ended());
    }
}
