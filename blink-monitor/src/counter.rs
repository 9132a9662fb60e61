//! The live blink counter.
//!
//! The counter has exactly one writer at a time, the analysis worker, and
//! any number of readers. Readers only ever see whole values.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::single_writer::WriterClaim;

/// Owner of the counter cell. Hands out readers and at most one writer.
pub struct BlinkCounter {
    value: Arc<AtomicU64>,
    writer_claimed: Arc<AtomicBool>,
}

impl Default for BlinkCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlinkCounter {
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
            writer_claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reader(&self) -> BlinkCounterReader {
        BlinkCounterReader {
            value: self.value.clone(),
        }
    }

    /// Returns `None` while another writer is alive.
    pub fn claim_writer(&self) -> Option<BlinkCounterWriter> {
        let claim = WriterClaim::try_claim(&self.writer_claimed)?;
        Some(BlinkCounterWriter {
            value: self.value.clone(),
            _claim: claim,
        })
    }
}

/// Read-only view of the counter.
#[derive(Clone)]
pub struct BlinkCounterReader {
    value: Arc<AtomicU64>,
}

impl BlinkCounterReader {
    /// A snapshot of the current count.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

/// The single writer of the counter.
pub struct BlinkCounterWriter {
    value: Arc<AtomicU64>,
    _claim: WriterClaim,
}

impl BlinkCounterWriter {
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Add `blinks` completed blinks and return the new count.
    pub fn add(&mut self, blinks: u64) -> u64 {
        if blinks == 0 {
            return self.get();
        }
        self.value.fetch_add(blinks, Ordering::AcqRel) + blinks
    }

    /// Set the count to zero. Only used between runs.
    pub fn reset(&mut self) {
        self.value.store(0, Ordering::Release);
    }

    /// Set the count to a value read earlier. Only used between runs.
    pub fn restore(&mut self, value: u64) {
        self.value.store(value, Ordering::Release);
    }
}
