//! Ring buffers on the edges of the mix graph.
//!
//! Two kinds of plumbing:
//!
//! - [`pcm_ring`]: lock-free SPSC f32 rings (rtrb). Used on the
//!   source->mixer edge (each producer task fills one, the pull loop
//!   drains it) and on the mixer->consumer edge for real-time consumers
//!   (local output callback, visualization tap).
//! - [`ByteRing`]: bounded byte-chunk ring with drop-oldest overflow for
//!   the serialized 16-bit stream consumers (HTTP clients). The mixer
//!   side never blocks: it uses `try_lock` and skips the chunk if a
//!   consumer is mid-read.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use tokio::sync::Notify;

/// Create a lock-free SPSC PCM ring holding `capacity` f32 samples.
pub fn pcm_ring(capacity: usize) -> (PcmWriter, PcmReader) {
    let (producer, consumer) = RingBuffer::<f32>::new(capacity);
    (PcmWriter { producer }, PcmReader { consumer })
}

/// Write half of a PCM ring. Owned by exactly one producer task.
pub struct PcmWriter {
    producer: Producer<f32>,
}

impl PcmWriter {
    /// Push as many samples as fit; returns how many were written.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let mut written = 0;
        for &s in samples {
            if self.producer.push(s).is_err() {
                break;
            }
            written += 1;
        }
        written
    }

    /// Free space in samples.
    pub fn space(&self) -> usize {
        self.producer.slots()
    }

    /// True once the reading half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }
}

/// Read half of a PCM ring. Owned by exactly one consumer.
pub struct PcmReader {
    consumer: Consumer<f32>,
}

impl PcmReader {
    /// Fill `out` from the ring; returns how many samples were read.
    /// The remainder of `out` is left untouched.
    pub fn pop(&mut self, out: &mut [f32]) -> usize {
        let mut read = 0;
        for slot in out.iter_mut() {
            match self.consumer.pop() {
                Ok(s) => {
                    *slot = s;
                    read += 1;
                }
                Err(_) => break,
            }
        }
        read
    }

    /// Samples currently buffered.
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    /// Drop everything currently buffered.
    pub fn drain(&mut self) {
        while self.consumer.pop().is_ok() {}
    }

    /// True once the writing half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }
}

/// Bounded byte-chunk ring with drop-oldest overflow.
///
/// Producer side is the mixer thread (non-blocking, try_lock); consumer
/// side is an async task awaiting chunks.
pub struct ByteRing {
    inner: Mutex<VecDeque<Bytes>>,
    capacity_bytes: usize,
    dropped_bytes: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl ByteRing {
    /// Create a ring bounded to roughly `capacity_bytes` of buffered audio.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity_bytes,
            dropped_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Push a chunk, discarding the oldest buffered chunks on overflow.
    ///
    /// Never blocks: if the consumer holds the lock the chunk is counted
    /// as dropped instead.
    pub fn push(&self, chunk: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.inner.try_lock() {
            Some(mut queue) => {
                let mut buffered: usize = queue.iter().map(Bytes::len).sum();
                buffered += chunk.len();
                while buffered > self.capacity_bytes {
                    match queue.pop_front() {
                        Some(old) => {
                            buffered -= old.len();
                            self.dropped_bytes.fetch_add(old.len() as u64, Ordering::Relaxed);
                        }
                        None => break,
                    }
                }
                queue.push_back(chunk);
            }
            None => {
                self.dropped_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    /// Await the next chunk; `None` once the ring is closed and drained.
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.inner.lock().pop_front() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, for synchronous consumers and tests.
    pub fn try_recv(&self) -> Option<Bytes> {
        self.inner.lock().pop_front()
    }

    /// Close the ring; pending chunks stay readable, then `recv` returns None.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bytes discarded due to overflow or contention.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_ring_round_trip() {
        let (mut w, mut r) = pcm_ring(8);
        assert_eq!(w.push(&[1.0, 2.0, 3.0]), 3);
        let mut out = [0.0f32; 4];
        assert_eq!(r.pop(&mut out), 3);
        assert_eq!(&out[..3], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_pcm_ring_overflow_is_partial_write() {
        let (mut w, _r) = pcm_ring(2);
        assert_eq!(w.push(&[1.0, 2.0, 3.0]), 2);
        assert_eq!(w.space(), 0);
    }

    #[test]
    fn test_byte_ring_drop_oldest() {
        let ring = ByteRing::new(8);
        ring.push(Bytes::from_static(&[1; 4]));
        ring.push(Bytes::from_static(&[2; 4]));
        ring.push(Bytes::from_static(&[3; 4])); // evicts the first chunk
        assert_eq!(ring.dropped_bytes(), 4);
        assert_eq!(ring.try_recv().unwrap()[0], 2);
        assert_eq!(ring.try_recv().unwrap()[0], 3);
        assert!(ring.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_byte_ring_recv_then_close() {
        let ring = ByteRing::new(64);
        ring.push(Bytes::from_static(b"abc"));
        assert_eq!(ring.recv().await.unwrap(), Bytes::from_static(b"abc"));
        ring.close();
        assert!(ring.recv().await.is_none());
    }
}
