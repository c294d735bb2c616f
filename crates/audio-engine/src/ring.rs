//! Lock-free single-producer/single-consumer ring of interleaved `f32` frames.
//!
//! The engine uses two of these:
//! - decode-ahead thread → render callback (the playback ring)
//! - render callback → analysis thread (a mono tap)
//!
//! Cursors are monotonically increasing frame counters; the slot index is the cursor modulo
//! capacity. The producer owns `write`, the consumer owns `read`. The only cross-role
//! mutation is [`RingBuffer::flush`], which moves `read` forward with a CAS so a concurrent
//! read that loses the race simply reports nothing.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

pub struct RingBuffer {
    channels: usize,
    capacity: usize,
    slots: Box<[AtomicU32]>,
    write: AtomicUsize,
    read: AtomicUsize,
    /// Producer reached end of stream; cleared by `flush`.
    ended: AtomicBool,
}

impl RingBuffer {
    /// Create a ring holding `capacity_frames` frames of `channels` interleaved samples.
    pub fn new(channels: usize, capacity_frames: usize) -> Self {
        let channels = channels.max(1);
        let capacity = capacity_frames.max(1);
        let slots = (0..capacity * channels)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            channels,
            capacity,
            slots,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames buffered and not yet read (snapshot).
    pub fn available(&self) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    /// Frames that can be written without blocking (snapshot).
    pub fn free(&self) -> usize {
        self.capacity - self.available().min(self.capacity)
    }

    /// Write all of `samples` or nothing.
    ///
    /// Fails with [`EngineError::BufferFull`] when fewer than `samples.len() / channels`
    /// frames are free.
    pub fn try_write(&self, samples: &[f32]) -> EngineResult<()> {
        let frames = samples.len() / self.channels;
        if frames > self.free() {
            return Err(EngineError::BufferFull);
        }
        self.write_partial(samples);
        Ok(())
    }

    /// Write as many whole frames of `samples` as fit; returns frames written.
    ///
    /// Never blocks, so it is safe on the render thread (the analysis tap uses it and simply
    /// loses data when the analysis thread lags).
    pub fn write_partial(&self, samples: &[f32]) -> usize {
        let w = self.write.load(Ordering::Relaxed);
        let r = self.read.load(Ordering::Acquire);
        let free = self.capacity - w.wrapping_sub(r).min(self.capacity);
        let frames = (samples.len() / self.channels).min(free);
        for f in 0..frames {
            let base = ((w.wrapping_add(f)) % self.capacity) * self.channels;
            let src = f * self.channels;
            for ch in 0..self.channels {
                self.slots[base + ch].store(samples[src + ch].to_bits(), Ordering::Relaxed);
            }
        }
        self.write.store(w.wrapping_add(frames), Ordering::Release);
        frames
    }

    /// Write all of `samples`, parking between attempts while the ring is full.
    ///
    /// Returns `false` if `cancel` was raised before everything was written; the frames
    /// written so far stay in the ring. Producers are woken early via `Thread::unpark`.
    pub fn write(&self, samples: &[f32], cancel: &AtomicBool, backoff: Duration) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            if cancel.load(Ordering::Acquire) {
                return false;
            }
            let written = self.write_partial(&samples[offset..]);
            if written == 0 {
                thread::park_timeout(backoff);
                continue;
            }
            offset += written * self.channels;
        }
        true
    }

    /// Read up to `out.len() / channels` frames into `out`; returns frames read.
    ///
    /// Non-blocking and allocation free. Only the first `frames * channels` samples of `out`
    /// are meaningful: a read that loses a race with [`RingBuffer::flush`] has already copied
    /// stale samples into `out` and returns 0.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let r = self.read.load(Ordering::Relaxed);
        let w = self.write.load(Ordering::Acquire);
        let frames = w.wrapping_sub(r).min(out.len() / self.channels);
        if frames == 0 {
            return 0;
        }
        for f in 0..frames {
            let base = ((r.wrapping_add(f)) % self.capacity) * self.channels;
            let dst = f * self.channels;
            for ch in 0..self.channels {
                out[dst + ch] = f32::from_bits(self.slots[base + ch].load(Ordering::Relaxed));
            }
        }
        match self.read.compare_exchange(
            r,
            r.wrapping_add(frames),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => frames,
            // Flushed underneath us; what we copied is stale.
            Err(_) => 0,
        }
    }

    /// Discard everything buffered and clear the end-of-stream mark.
    ///
    /// Callers must make sure the producer is idle.
    pub fn flush(&self) {
        let w = self.write.load(Ordering::Acquire);
        let mut r = self.read.load(Ordering::Acquire);
        while let Err(actual) =
            self.read
                .compare_exchange_weak(r, w, Ordering::AcqRel, Ordering::Acquire)
        {
            r = actual;
        }
        self.ended.store(false, Ordering::Release);
    }

    /// Producer has written its last frame.
    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// End of stream reached and every frame consumed.
    pub fn is_drained(&self) -> bool {
        self.is_ended() && self.available() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order_across_wraparound() {
        let ring = RingBuffer::new(2, 4);
        let mut out = [0.0f32; 8];
        let mut next = 0.0f32;
        let mut expected = 0.0f32;
        for _ in 0..10 {
            let block: Vec<f32> = (0..6).map(|i| next + i as f32).collect();
            next += 6.0;
            ring.try_write(&block).unwrap();
            let frames = ring.read(&mut out[..6]);
            assert_eq!(frames, 3);
            for v in &out[..6] {
                assert_eq!(*v, expected);
                expected += 1.0;
            }
        }
    }

    #[test]
    fn try_write_rejects_when_insufficient_space() {
        let ring = RingBuffer::new(1, 4);
        ring.try_write(&[1.0, 2.0, 3.0]).unwrap();
        let err = ring.try_write(&[4.0, 5.0]).unwrap_err();
        assert!(matches!(err, EngineError::BufferFull));
        assert_eq!(ring.available(), 3);
        ring.try_write(&[4.0]).unwrap();
        assert_eq!(ring.free(), 0);
    }

    #[test]
    fn read_returns_fewer_frames_when_short() {
        let ring = RingBuffer::new(2, 8);
        ring.try_write(&[1.0, 2.0]).unwrap();
        let mut out = [9.0f32; 6];
        assert_eq!(ring.read(&mut out), 1);
        assert_eq!(&out[..2], &[1.0, 2.0]);
        assert_eq!(&out[2..], &[9.0; 4]);
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn write_partial_stops_at_capacity() {
        let ring = RingBuffer::new(1, 3);
        assert_eq!(ring.write_partial(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3);
        assert_eq!(ring.write_partial(&[6.0]), 0);
    }

    #[test]
    fn flush_discards_and_clears_end_mark() {
        let ring = RingBuffer::new(1, 8);
        ring.try_write(&[1.0, 2.0, 3.0]).unwrap();
        ring.mark_ended();
        assert!(!ring.is_drained());
        ring.flush();
        assert_eq!(ring.available(), 0);
        assert!(!ring.is_ended());
        ring.try_write(&[7.0]).unwrap();
        let mut out = [0.0f32; 4];
        assert_eq!(ring.read(&mut out), 1);
        assert_eq!(out[0], 7.0);
    }

    #[test]
    fn drained_requires_end_mark_and_empty() {
        let ring = RingBuffer::new(1, 4);
        assert!(!ring.is_drained());
        ring.try_write(&[1.0]).unwrap();
        ring.mark_ended();
        assert!(!ring.is_drained());
        let mut out = [0.0f32; 1];
        ring.read(&mut out);
        assert!(ring.is_drained());
    }

    #[test]
    fn blocking_write_returns_false_on_cancel() {
        let ring = RingBuffer::new(1, 2);
        let cancel = AtomicBool::new(true);
        assert!(!ring.write(&[1.0, 2.0, 3.0], &cancel, Duration::from_millis(1)));
    }

    #[test]
    fn spsc_threads_preserve_sequence() {
        let ring = Arc::new(RingBuffer::new(2, 64));
        let producer_ring = ring.clone();
        let total_frames = 10_000usize;

        let producer = thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            let mut frame = 0usize;
            while frame < total_frames {
                let n = 37.min(total_frames - frame);
                let block: Vec<f32> = (frame..frame + n)
                    .flat_map(|f| [f as f32, -(f as f32)])
                    .collect();
                assert!(producer_ring.write(&block, &cancel, Duration::from_millis(1)));
                frame += n;
            }
            producer_ring.mark_ended();
        });

        let mut expected = 0usize;
        let mut out = [0.0f32; 50];
        while !ring.is_drained() {
            let frames = ring.read(&mut out);
            for f in 0..frames {
                assert_eq!(out[f * 2], expected as f32);
                assert_eq!(out[f * 2 + 1], -(expected as f32));
                expected += 1;
            }
            if frames == 0 {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(expected, total_frames);
    }
}
