//! Bounded handoff of frames from the capture thread to the analysis thread.
//!
//! The grid holds `queue_len` batches of `batch_len` slots each. The producer
//! writes slots round-robin; every slot is a separately allocated cell so a
//! write to one slot can never be observed through another. A frame becomes
//! visible to consumers only through [FrameBufferGrid::publish], which writes
//! the slot and the publication record under the same lock and then wakes
//! waiting consumers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::frame::CapturedFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndex {
    pub queue: usize,
    pub batch: usize,
}

/// A frame handed to a consumer together with its publication number.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    /// Increases by one with every publication, starting at 1.
    pub seq: u64,
    pub slot: SlotIndex,
    pub frame: Arc<CapturedFrame>,
}

#[derive(Default)]
struct Publication {
    seq: u64,
    slot: Option<SlotIndex>,
}

type Slot = Mutex<Option<Arc<CapturedFrame>>>;

pub struct FrameBufferGrid {
    batches: Vec<Vec<Slot>>,
    publication: Mutex<Publication>,
    published: Condvar,
}

impl FrameBufferGrid {
    /// Create a grid with `queue_len` batches of `batch_len` empty slots.
    ///
    /// Panics if either dimension is zero.
    pub fn new(queue_len: usize, batch_len: usize) -> Self {
        assert!(queue_len > 0 && batch_len > 0, "grid dimensions must be nonzero");
        let batches = (0..queue_len)
            .map(|_| (0..batch_len).map(|_| Mutex::new(None)).collect())
            .collect();
        Self {
            batches,
            publication: Mutex::new(Publication::default()),
            published: Condvar::new(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.batches.len()
    }

    pub fn batch_len(&self) -> usize {
        self.batches[0].len()
    }

    fn cell(&self, slot: SlotIndex) -> &Slot {
        &self.batches[slot.queue][slot.batch]
    }

    /// Store `frame` in `slot` and make it the latest published frame.
    ///
    /// Returns the publication number. Panics if `slot` is out of range.
    pub fn publish(&self, slot: SlotIndex, frame: CapturedFrame) -> u64 {
        let frame = Arc::new(frame);
        let seq = {
            let mut publication = self.publication.lock();
            *self.cell(slot).lock() = Some(frame);
            publication.seq += 1;
            publication.slot = Some(slot);
            publication.seq
        };
        self.published.notify_all();
        seq
    }

    /// The frame currently stored in `slot`, if any.
    pub fn slot(&self, slot: SlotIndex) -> Option<Arc<CapturedFrame>> {
        self.cell(slot).lock().clone()
    }

    /// The most recently published frame, if any.
    pub fn latest(&self) -> Option<PublishedFrame> {
        let publication = self.publication.lock();
        self.published_frame(&publication)
    }

    /// Wait up to `timeout` for a publication newer than `after_seq`.
    ///
    /// Returns the most recently published frame if it is newer than
    /// `after_seq`. Frames published in between are not returned.
    pub fn wait_for_newer(&self, after_seq: u64, timeout: Duration) -> Option<PublishedFrame> {
        let mut publication = self.publication.lock();
        if publication.seq <= after_seq {
            let _ = self.published.wait_for(&mut publication, timeout);
        }
        if publication.seq <= after_seq {
            return None;
        }
        self.published_frame(&publication)
    }

    fn published_frame(&self, publication: &Publication) -> Option<PublishedFrame> {
        let slot = publication.slot?;
        let frame = self.slot(slot)?;
        Some(PublishedFrame {
            seq: publication.seq,
            slot,
            frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(fno: u64) -> CapturedFrame {
        CapturedFrame::failed(fno, chrono::Utc::now(), format!("frame {fno}"))
    }

    fn all_slots(grid: &FrameBufferGrid) -> Vec<SlotIndex> {
        let mut slots = Vec::new();
        for queue in 0..grid.queue_len() {
            for batch in 0..grid.batch_len() {
                slots.push(SlotIndex { queue, batch });
            }
        }
        slots
    }

    fn contents(grid: &FrameBufferGrid) -> Vec<Option<u64>> {
        all_slots(grid)
            .into_iter()
            .map(|s| grid.slot(s).map(|f| f.fno))
            .collect()
    }

    #[test]
    fn writing_a_slot_changes_no_other_slot() {
        let grid = FrameBufferGrid::new(4, 5);
        let slots = all_slots(&grid);
        assert_eq!(slots.len(), 20);
        for (i, slot) in slots.iter().enumerate() {
            let before = contents(&grid);
            grid.publish(*slot, marker(100 + i as u64));
            let after = contents(&grid);
            for (j, (b, a)) in before.iter().zip(after.iter()).enumerate() {
                if j == i {
                    assert_eq!(*a, Some(100 + i as u64));
                } else {
                    assert_eq!(a, b, "slot {j} changed when writing slot {i}");
                }
            }
        }
        // Overwrite again in a second round and check the same property.
        for (i, slot) in slots.iter().enumerate() {
            grid.publish(*slot, marker(200 + i as u64));
            let after = contents(&grid);
            for (j, a) in after.iter().enumerate() {
                let expected = if j <= i { 200 + j as u64 } else { 100 + j as u64 };
                assert_eq!(*a, Some(expected));
            }
        }
    }

    #[test]
    fn latest_tracks_last_publication() {
        let grid = FrameBufferGrid::new(2, 2);
        assert!(grid.latest().is_none());
        let s1 = SlotIndex { queue: 0, batch: 1 };
        let s2 = SlotIndex { queue: 1, batch: 0 };
        assert_eq!(grid.publish(s1, marker(1)), 1);
        assert_eq!(grid.publish(s2, marker(2)), 2);
        let latest = grid.latest().unwrap();
        assert_eq!(latest.seq, 2);
        assert_eq!(latest.slot, s2);
        assert_eq!(latest.frame.fno, 2);
    }

    #[test]
    fn wait_for_newer_times_out_without_publication() {
        let grid = FrameBufferGrid::new(1, 1);
        assert!(grid.wait_for_newer(0, Duration::from_millis(20)).is_none());
        grid.publish(SlotIndex { queue: 0, batch: 0 }, marker(7));
        assert!(grid.wait_for_newer(1, Duration::from_millis(1)).is_none());
        assert_eq!(grid.wait_for_newer(0, Duration::ZERO).unwrap().frame.fno, 7);
    }

    #[test]
    fn consumer_wakes_on_publication() {
        let grid = Arc::new(FrameBufferGrid::new(2, 3));
        let consumer = {
            let grid = grid.clone();
            std::thread::spawn(move || {
                let mut last_seq = 0;
                let mut seen = Vec::new();
                while seen.last() != Some(&2) {
                    if let Some(p) = grid.wait_for_newer(last_seq, Duration::from_secs(5)) {
                        assert!(p.seq > last_seq);
                        last_seq = p.seq;
                        seen.push(p.frame.fno);
                    }
                }
                seen
            })
        };
        for fno in 0..3u64 {
            std::thread::sleep(Duration::from_millis(20));
            grid.publish(
                SlotIndex {
                    queue: 0,
                    batch: fno as usize,
                },
                marker(fno),
            );
        }
        let seen = consumer.join().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last(), Some(&2));
    }
}
