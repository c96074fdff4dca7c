//! Ring-buffer consumption.
//!
//! A ring-buffer map mmaps as three regions: a consumer-position page
//! this side writes, a producer-position page the kernel writes, and the
//! data region. Both positions are monotonically increasing byte
//! counters; `pos % data_size` is the live offset. Synchronization is
//! the pair of atomics: producer observed with acquire, consumer
//! published with release.
//!
//! Record framing is decoded by [`decode_one`], which operates on plain
//! byte slices so the wrap and ordering behavior is testable without a
//! kernel.
//!
//! [`RingConsumer`] owns the one persistent worker thread in the crate:
//! an epoll loop draining batches into a user deserializer + callback
//! pair until stopped.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::consts::MapType;
use crate::error::{Error, Result};
use crate::maps::Map;
use crate::sys;

/// Record length header: 4 bytes, little-endian, includes itself.
const HEADER_BYTES: u64 = 4;

/// Copy `out.len()` bytes starting at `start`, wrapping at the end of
/// the region.
fn wrapping_copy(data: &[u8], start: usize, out: &mut [u8]) {
    let first = (data.len() - start).min(out.len());
    out[..first].copy_from_slice(&data[start..start + first]);
    let rest = out.len() - first;
    out[first..].copy_from_slice(&data[..rest]);
}

/// Decode the record at `consumer_pos`, if a whole one is available.
/// Returns the payload and the advanced consumer position. A zero,
/// undersized, or overlong length means the batch is over.
pub(crate) fn decode_one(data: &[u8], consumer_pos: u64, producer_pos: u64) -> Option<(Bytes, u64)> {
    let available = producer_pos.saturating_sub(consumer_pos);
    if available < HEADER_BYTES {
        return None;
    }
    let offset = (consumer_pos % data.len() as u64) as usize;
    let mut header = [0u8; 4];
    wrapping_copy(data, offset, &mut header);
    let length = u32::from_le_bytes(header) as u64;
    if length < HEADER_BYTES || length > available {
        return None;
    }
    let mut payload = vec![0u8; (length - HEADER_BYTES) as usize];
    let payload_at = ((consumer_pos + HEADER_BYTES) % data.len() as u64) as usize;
    wrapping_copy(data, payload_at, &mut payload);
    Some((Bytes::from(payload), consumer_pos + length))
}

/// A mapped ring-buffer map. Owns the map and the three regions; the
/// regions unmap when this drops.
pub struct RingBuffer {
    map: Map,
    regions: sys::RingbufRegions,
    data_size: usize,
}

impl RingBuffer {
    pub fn new(map: Map) -> Result<Self> {
        if map.map_type() != MapType::Ringbuf {
            return Err(Error::shape(format!(
                "ring-buffer consumer over a {:?} map",
                map.map_type()
            )));
        }
        let data_size = map.max_entries() as usize;
        let regions = sys::mmap_ringbuf(map.fd(), data_size)?;
        Ok(RingBuffer {
            map,
            regions,
            data_size,
        })
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.regions.data.as_ptr(), self.data_size) }
    }

    /// Kernel-side write position, acquire so the record bytes it
    /// covers are visible.
    pub fn producer_pos(&self) -> u64 {
        let atomic = unsafe { &*(self.regions.producer.as_ptr() as *const AtomicU64) };
        atomic.load(Ordering::Acquire)
    }

    pub fn consumer_pos(&self) -> u64 {
        let atomic = unsafe { &*(self.regions.consumer.as_ptr() as *const AtomicU64) };
        atomic.load(Ordering::Relaxed)
    }

    /// Release store so the kernel sees the space as free only after we
    /// are done reading it.
    fn publish_consumer_pos(&self, pos: u64) {
        let atomic = unsafe { &*(self.regions.consumer.as_ptr() as *const AtomicU64) };
        atomic.store(pos, Ordering::Release);
    }

    /// Drain up to `limit` records, publishing the consumer position
    /// after each one.
    pub fn read_batch(&mut self, limit: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut pos = self.consumer_pos();
        while out.len() < limit {
            let producer = self.producer_pos();
            match decode_one(self.data(), pos, producer) {
                Some((payload, next)) => {
                    pos = next;
                    self.publish_consumer_pos(pos);
                    out.push(payload);
                }
                None => break,
            }
        }
        out
    }

    /// Non-destructive read: decodes up to `limit` records without
    /// moving the consumer position. Diagnostics only; racing a live
    /// consumer gives torn views.
    pub fn peek(&self, limit: usize) -> Vec<Bytes> {
        let producer = self.producer_pos();
        let mut pos = self.consumer_pos();
        let mut out = Vec::new();
        while out.len() < limit {
            match decode_one(self.data(), pos, producer) {
                Some((payload, next)) => {
                    pos = next;
                    out.push(payload);
                }
                None => break,
            }
        }
        out
    }
}

/// Counters the consumer thread maintains.
#[derive(Default)]
pub struct ConsumerStats {
    events_read: AtomicU64,
    events_processed: AtomicU64,
    batches_read: AtomicU64,
    errors: AtomicU64,
    last_event_unix_ns: AtomicU64,
}

/// A point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_read: u64,
    pub events_processed: u64,
    pub batches_read: u64,
    pub errors: u64,
    pub last_event_time: Option<SystemTime>,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let ns = self.last_event_unix_ns.load(Ordering::Relaxed);
        StatsSnapshot {
            events_read: self.events_read.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            batches_read: self.batches_read.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_event_time: (ns != 0).then(|| UNIX_EPOCH + Duration::from_nanos(ns)),
        }
    }
}

/// Consumer loop tuning.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub batch_size: usize,
    pub poll_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            batch_size: 64,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

const STOP_JOIN_BOUND: Duration = Duration::from_secs(5);

/// The worker-thread handle for one ring buffer.
pub struct RingConsumer {
    running: Arc<AtomicBool>,
    stats: Arc<ConsumerStats>,
    thread: Option<JoinHandle<()>>,
}

impl RingConsumer {
    /// Spawn the consumer thread. Each drained record goes through
    /// `deserialize`; successes reach `callback`, failures only bump
    /// the error counter.
    pub fn start<T, D, F>(
        ring: RingBuffer,
        opts: ConsumerOptions,
        deserialize: D,
        mut callback: F,
    ) -> Result<RingConsumer>
    where
        T: 'static,
        D: Fn(&[u8]) -> Result<T> + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::shape(format!("epoll_create failed: {e}")))?;
        let map_fd = ring.map().fd();
        epoll
            .add(
                unsafe { BorrowedFd::borrow_raw(map_fd) },
                EpollEvent::new(EpollFlags::EPOLLIN, 0),
            )
            .map_err(|e| Error::shape(format!("epoll_ctl(add) failed: {e}")))?;

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ConsumerStats::default());
        let timeout_ms = opts.poll_timeout.as_millis().min(u16::MAX as u128) as u16;
        let timeout = EpollTimeout::from(timeout_ms);

        let thread = {
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            let mut ring = ring;
            std::thread::Builder::new()
                .name("ringbuf-consumer".into())
                .spawn(move || {
                    let mut events = [EpollEvent::empty(); 1];
                    while running.load(Ordering::Acquire) {
                        let ready = match epoll.wait(&mut events, timeout) {
                            Ok(n) => n,
                            Err(nix::errno::Errno::EINTR) => continue,
                            Err(e) => {
                                log::error!("epoll_wait failed, consumer stopping: {e}");
                                break;
                            }
                        };
                        if ready == 0 {
                            continue;
                        }
                        let batch = ring.read_batch(opts.batch_size);
                        if batch.is_empty() {
                            continue;
                        }
                        stats.batches_read.fetch_add(1, Ordering::Relaxed);
                        let now_ns = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_nanos() as u64)
                            .unwrap_or(0);
                        stats.last_event_unix_ns.store(now_ns, Ordering::Relaxed);
                        for record in batch {
                            stats.events_read.fetch_add(1, Ordering::Relaxed);
                            match deserialize(&record) {
                                Ok(event) => {
                                    callback(event);
                                    stats.events_processed.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    stats.errors.fetch_add(1, Ordering::Relaxed);
                                    log::debug!("ring-buffer record rejected: {e}");
                                }
                            }
                        }
                    }
                    // epoll registration, the mapped regions, and the
                    // map FD all release here with the ring
                    let _ = epoll.delete(unsafe { BorrowedFd::borrow_raw(map_fd) });
                    drop(ring);
                })
                .map_err(Error::Io)?
        };

        Ok(RingConsumer {
            running,
            stats,
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Clear the running flag and join, bounded at five seconds. A
    /// worker stuck past the bound is reported and abandoned; it still
    /// tears its resources down whenever it exits.
    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + STOP_JOIN_BOUND;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("ring-buffer consumer did not stop within {STOP_JOIN_BOUND:?}");
                return Err(Error::ResourceLeak {
                    detail: "consumer thread outlived its stop bound".into(),
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        thread
            .join()
            .map_err(|_| Error::ResourceLeak {
                detail: "consumer thread panicked".into(),
            })
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("stopping ring-buffer consumer during drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write a framed record into a simulated data region at an
    /// absolute position, wrapping like the kernel does.
    fn put_record(data: &mut [u8], pos: u64, payload: &[u8]) -> u64 {
        let length = (payload.len() as u64 + HEADER_BYTES) as u32;
        let size = data.len() as u64;
        let header = length.to_le_bytes();
        for (i, b) in header.iter().chain(payload.iter()).enumerate() {
            data[((pos + i as u64) % size) as usize] = *b;
        }
        pos + length as u64
    }

    #[test]
    fn records_decode_in_producer_order() {
        let mut data = vec![0u8; 4096];
        let mut pos = 0;
        pos = put_record(&mut data, pos, b"first");
        pos = put_record(&mut data, pos, b"second");
        pos = put_record(&mut data, pos, b"third");
        let producer = pos;

        let mut consumer = 0;
        let mut seen = Vec::new();
        while let Some((payload, next)) = decode_one(&data, consumer, producer) {
            seen.push(payload);
            consumer = next;
        }
        assert_eq!(seen, vec![&b"first"[..], b"second", b"third"]);
        // advanced by exactly the framed sizes
        assert_eq!(consumer, (5 + 4) + (6 + 4) + (5 + 4));
        assert_eq!(consumer, producer);
    }

    #[test]
    fn payload_reassembles_across_the_wrap() {
        let mut data = vec![0u8; 4096];
        let payload: Vec<u8> = (0..96u8).collect();
        let start = 4050;
        let end = put_record(&mut data, start, &payload);
        assert_eq!(end, 4150);

        let (decoded, next) = decode_one(&data, start, end).unwrap();
        assert_eq!(decoded.as_ref(), &payload[..]);
        assert_eq!(next, 4150);
    }

    #[test]
    fn zero_length_terminates() {
        let data = vec![0u8; 4096];
        // producer claims bytes are there, but the header reads zero
        assert!(decode_one(&data, 0, 64).is_none());
    }

    #[test]
    fn overlong_length_terminates() {
        let mut data = vec![0u8; 4096];
        data[0..4].copy_from_slice(&100u32.to_le_bytes());
        // only 50 bytes available
        assert!(decode_one(&data, 0, 50).is_none());
        // with enough available it decodes
        assert!(decode_one(&data, 0, 100).is_some());
    }

    #[test]
    fn short_header_window_terminates() {
        let data = vec![0u8; 4096];
        assert!(decode_one(&data, 10, 12).is_none());
    }

    #[test]
    fn stats_snapshot_roundtrip() {
        let stats = ConsumerStats::default();
        stats.events_read.store(7, Ordering::Relaxed);
        stats.errors.store(1, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.events_read, 7);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.last_event_time, None);
    }
}
