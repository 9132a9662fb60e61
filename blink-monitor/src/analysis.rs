//! The analysis consumer: feeds frames to the blink analyzer and advances the
//! blink counter.

use std::time::Duration;

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::counter::BlinkCounterWriter;
use crate::frame::{CapturedFrame, FrameData};
use crate::frame_grid::FrameBufferGrid;
use crate::{Error, Result};

/// How long the worker waits for a new frame before checking its stop flag.
const FRAME_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Metrics computed by the analyzer for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaceMetrics {
    /// Blinks completed since the analyzer was created.
    pub blink_counter: u64,
}

#[derive(Debug, Clone)]
pub struct AnalyzerOutput {
    /// The input frame with analysis overlays, if the analyzer draws any.
    pub annotated: Option<DynamicImage>,
    pub metrics: FaceMetrics,
}

/// Detects blinks in a stream of frames.
///
/// Implementations keep state between calls. `process_frame` is called with
/// frames in capture order, though not necessarily every captured frame.
pub trait BlinkAnalyzer: Send {
    fn process_frame(&mut self, image: &DynamicImage) -> anyhow::Result<AnalyzerOutput>;
}

impl<A: BlinkAnalyzer + ?Sized> BlinkAnalyzer for Box<A> {
    fn process_frame(&mut self, image: &DynamicImage) -> anyhow::Result<AnalyzerOutput> {
        (**self).process_frame(image)
    }
}

/// What happened to one frame handed to [AnalysisWorker::process].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The analyzer ran. `new_blinks` were added to the counter.
    Analyzed { new_blinks: u64, total: u64 },
    /// The frame was a failure marker and was not analyzed.
    FailureMarker,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisStats {
    pub analyzed: u64,
    pub failure_markers: u64,
    /// Frames overwritten in the grid before they could be analyzed.
    pub skipped: u64,
    /// Frames for which the analyzer returned an error.
    pub failed: u64,
}

pub struct AnalysisWorker<A> {
    analyzer: A,
    counter: BlinkCounterWriter,
    /// Cumulative analyzer count at the last analyzed frame.
    last_reported: u64,
    stats: AnalysisStats,
}

impl<A: BlinkAnalyzer> AnalysisWorker<A> {
    pub fn new(analyzer: A, counter: BlinkCounterWriter) -> Self {
        Self {
            analyzer,
            counter,
            last_reported: 0,
            stats: AnalysisStats::default(),
        }
    }

    pub fn stats(&self) -> AnalysisStats {
        self.stats
    }

    /// Analyze one frame and advance the counter by the number of blinks
    /// completed since the previous analyzed frame.
    pub fn process(&mut self, frame: &CapturedFrame) -> Result<FrameOutcome> {
        let image = match &frame.data {
            FrameData::Image(image) => image,
            FrameData::Failed(_) => {
                self.stats.failure_markers += 1;
                return Ok(FrameOutcome::FailureMarker);
            }
        };
        let output = self.analyzer.process_frame(image).map_err(|e| {
            self.stats.failed += 1;
            Error::AnalysisFailure(e)
        })?;
        self.stats.analyzed += 1;
        let reported = output.metrics.blink_counter;
        let new_blinks = if reported >= self.last_reported {
            reported - self.last_reported
        } else {
            // The counter never goes down. Take the analyzer's value as the
            // new baseline.
            warn!(
                "analyzer blink counter went back from {} to {reported}",
                self.last_reported
            );
            0
        };
        self.last_reported = reported;
        let total = self.counter.add(new_blinks);
        if new_blinks > 0 {
            debug!("frame {}: {new_blinks} new blink(s), {total} total", frame.fno);
        }
        Ok(FrameOutcome::Analyzed { new_blinks, total })
    }

    /// Analyze the most recently published frame, repeatedly, until `flag`
    /// is stopped.
    pub fn run(mut self, grid: &FrameBufferGrid, flag: &thread_control::Flag) -> AnalysisStats {
        let mut last_seq = 0;
        let mut last_fno: Option<u64> = None;
        while flag.is_alive() {
            let Some(published) = grid.wait_for_newer(last_seq, FRAME_WAIT_TIMEOUT) else {
                continue;
            };
            last_seq = published.seq;
            let frame = &published.frame;
            if let Some(prev) = last_fno {
                let gap = frame.fno.saturating_sub(prev + 1);
                if gap > 0 {
                    debug!("skipped {gap} frame(s) before frame {}", frame.fno);
                    self.stats.skipped += gap;
                }
            }
            last_fno = Some(frame.fno);
            if let Err(e) = self.process(frame) {
                warn!("frame {}: {e}", frame.fno);
            }
        }
        let stats = self.stats;
        info!(
            "analysis done: {} frames analyzed, {} failure markers, {} skipped, {} failed",
            stats.analyzed, stats.failure_markers, stats.skipped, stats.failed
        );
        stats
    }
}
