//! Fixed-length, newest-first history of blink count samples.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, atomic::AtomicBool};

use parking_lot::RwLock;

use crate::single_writer::WriterClaim;

/// One point-in-time reading of the blink counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSample {
    /// Seconds since the unix epoch.
    pub timestamp: i64,
    pub value: u64,
}

impl MetricSample {
    /// The value used to fill a window before any real sample exists.
    pub fn placeholder(timestamp: i64) -> Self {
        Self { timestamp, value: 0 }
    }
}

/// Newest-first samples. The length always equals the capacity.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<MetricSample>,
    capacity: NonZeroUsize,
}

impl SlidingWindow {
    /// A window filled with `capacity` placeholder samples.
    pub fn seeded(capacity: NonZeroUsize, seed_timestamp: i64) -> Self {
        let samples = std::iter::repeat_n(MetricSample::placeholder(seed_timestamp), capacity.get())
            .collect();
        Self { samples, capacity }
    }

    /// Insert `sample` as the newest entry and return the evicted oldest one.
    pub fn push(&mut self, sample: MetricSample) -> MetricSample {
        self.samples.push_front(sample);
        let evicted = self.samples.pop_back();
        debug_assert_eq!(self.samples.len(), self.capacity.get());
        evicted.unwrap_or(sample)
    }

    /// Replace all samples with placeholders.
    pub fn reseed(&mut self, seed_timestamp: i64) {
        *self = Self::seeded(self.capacity, seed_timestamp);
    }

    pub fn newest(&self) -> MetricSample {
        self.samples[0]
    }

    pub fn oldest(&self) -> MetricSample {
        self.samples[self.samples.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Samples from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter()
    }
}

/// Shared owner of the window used by the aggregator and its readers.
pub struct MetricWindow {
    inner: Arc<RwLock<SlidingWindow>>,
    writer_claimed: Arc<AtomicBool>,
}

impl MetricWindow {
    pub fn new(capacity: NonZeroUsize, seed_timestamp: i64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SlidingWindow::seeded(capacity, seed_timestamp))),
            writer_claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reader(&self) -> WindowReader {
        WindowReader {
            inner: self.inner.clone(),
        }
    }

    /// Returns `None` while another writer is alive.
    pub fn claim_writer(&self) -> Option<WindowWriter> {
        let claim = WriterClaim::try_claim(&self.writer_claimed)?;
        Some(WindowWriter {
            inner: self.inner.clone(),
            _claim: claim,
        })
    }
}

/// Read-only access to the window. All accessors return copies.
#[derive(Clone)]
pub struct WindowReader {
    inner: Arc<RwLock<SlidingWindow>>,
}

impl WindowReader {
    pub fn newest(&self) -> MetricSample {
        self.inner.read().newest()
    }

    /// Samples from newest to oldest.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.inner.read().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// The single writer of the window.
pub struct WindowWriter {
    inner: Arc<RwLock<SlidingWindow>>,
    _claim: WriterClaim,
}

impl WindowWriter {
    pub fn push(&mut self, sample: MetricSample) -> MetricSample {
        self.inner.write().push(sample)
    }

    pub fn reseed(&mut self, seed_timestamp: i64) {
        self.inner.write().reseed(seed_timestamp);
    }

    pub fn copy_window(&self) -> SlidingWindow {
        self.inner.read().clone()
    }

    /// Replace the whole window with one copied earlier.
    pub fn restore(&mut self, window: SlidingWindow) {
        *self.inner.write() = window;
    }

    pub fn reader(&self) -> WindowReader {
        WindowReader {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten() -> NonZeroUsize {
        NonZeroUsize::new(10).unwrap()
    }

    #[test]
    fn seeded_window_is_full() {
        let window = SlidingWindow::seeded(ten(), 1_000);
        assert_eq!(window.len(), 10);
        assert!(window.iter().all(|s| *s == MetricSample::placeholder(1_000)));
    }

    #[test]
    fn twelve_pushes_keep_ten_most_recent() {
        let mut window = SlidingWindow::seeded(ten(), 0);
        for i in 1..=12u64 {
            window.push(MetricSample {
                timestamp: i as i64,
                value: i,
            });
            assert_eq!(window.len(), 10);
        }
        let values: Vec<u64> = window.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![12, 11, 10, 9, 8, 7, 6, 5, 4, 3]);
        assert_eq!(window.newest().timestamp, 12);
        assert_eq!(window.oldest().timestamp, 3);
    }

    #[test]
    fn push_evicts_oldest_first() {
        let mut window = SlidingWindow::seeded(NonZeroUsize::new(2).unwrap(), 0);
        let a = MetricSample {
            timestamp: 1,
            value: 1,
        };
        let b = MetricSample {
            timestamp: 2,
            value: 2,
        };
        assert_eq!(window.push(a), MetricSample::placeholder(0));
        assert_eq!(window.push(b), MetricSample::placeholder(0));
        assert_eq!(window.push(b), a);
    }

    #[test]
    fn readers_get_copies() {
        let window = MetricWindow::new(ten(), 5);
        let reader = window.reader();
        let mut writer = window.claim_writer().unwrap();
        assert!(window.claim_writer().is_none());
        let before = reader.snapshot();
        writer.push(MetricSample {
            timestamp: 6,
            value: 2,
        });
        assert_eq!(before[0], MetricSample::placeholder(5));
        assert_eq!(reader.newest().value, 2);
        assert_eq!(reader.len(), 10);
        let saved = writer.copy_window();
        writer.reseed(7);
        assert_eq!(reader.newest(), MetricSample::placeholder(7));
        writer.restore(saved);
        assert_eq!(reader.newest().value, 2);
        assert_eq!(writer.reader().len(), 10);
    }
}
