//! A stand-in [BlinkAnalyzer] based on mean image brightness.
//!
//! It knows nothing about faces. It treats a dark frame as "eyes closed" and
//! a bright frame as "eyes open" and counts closed-to-open transitions, which
//! is enough to drive the pipeline with the simulated camera.

use image::DynamicImage;

use crate::analysis::{AnalyzerOutput, BlinkAnalyzer, FaceMetrics};

pub const DEFAULT_CLOSED_BELOW: f64 = 60.0;
pub const DEFAULT_OPEN_ABOVE: f64 = 100.0;

pub struct IntensityBlinkAnalyzer {
    closed_below: f64,
    open_above: f64,
    eyes_closed: bool,
    blink_counter: u64,
}

impl Default for IntensityBlinkAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSED_BELOW, DEFAULT_OPEN_ABOVE)
    }
}

impl IntensityBlinkAnalyzer {
    /// Mean levels between the two thresholds keep the previous state.
    pub fn new(closed_below: f64, open_above: f64) -> Self {
        assert!(closed_below <= open_above);
        Self {
            closed_below,
            open_above,
            eyes_closed: false,
            blink_counter: 0,
        }
    }
}

fn mean_luma(image: &DynamicImage) -> Option<f64> {
    let owned;
    let gray = match image.as_luma8() {
        Some(gray) => gray,
        None => {
            owned = image.to_luma8();
            &owned
        }
    };
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return None;
    }
    let sum: u64 = pixels.iter().map(|&p| p as u64).sum();
    Some(sum as f64 / pixels.len() as f64)
}

impl BlinkAnalyzer for IntensityBlinkAnalyzer {
    fn process_frame(&mut self, image: &DynamicImage) -> anyhow::Result<AnalyzerOutput> {
        let mean = mean_luma(image).ok_or_else(|| anyhow::anyhow!("empty image"))?;
        if self.eyes_closed && mean > self.open_above {
            self.eyes_closed = false;
            self.blink_counter += 1;
        } else if !self.eyes_closed && mean < self.closed_below {
            self.eyes_closed = true;
        }
        Ok(AnalyzerOutput {
            annotated: None,
            metrics: FaceMetrics {
                blink_counter: self.blink_counter,
            },
        })
    }
}
