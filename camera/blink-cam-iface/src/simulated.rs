//! A camera backend which synthesizes frames.
//!
//! Frames are uniform 8-bit grayscale images. Most frames are bright ("eyes
//! open"); every `blink_period` frames the last `closed_frames` frames are
//! dark, so a brightness based analyzer sees one completed blink per period.

use std::time::{Duration, Instant};

use image::{DynamicImage, GrayImage, Luma};
use tracing::debug;

use crate::{Camera, CameraModule, Error, FrameWithInfo, HostTimingInfo, Result};

pub const OPEN_LEVEL: u8 = 180;
pub const CLOSED_LEVEL: u8 = 20;

#[derive(Debug, Clone)]
pub struct SimulatedCameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Number of frames between the starts of two blinks.
    pub blink_period: usize,
    /// Number of dark frames per blink.
    pub closed_frames: usize,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
            blink_period: 90,
            closed_frames: 4,
        }
    }
}

/// Opens [SimulatedCamera] instances at the configured device indices.
pub struct SimulatedCameraModule {
    indices: Vec<usize>,
    config: SimulatedCameraConfig,
}

impl SimulatedCameraModule {
    /// A module with a single camera at index 0.
    pub fn new(config: SimulatedCameraConfig) -> Self {
        Self::with_indices(vec![0], config)
    }

    /// A module whose cameras respond only at `indices`.
    pub fn with_indices(indices: Vec<usize>, config: SimulatedCameraConfig) -> Self {
        Self { indices, config }
    }
}

impl CameraModule for SimulatedCameraModule {
    type CameraType = SimulatedCamera;

    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self, index: usize) -> Result<SimulatedCamera> {
        if !self.indices.contains(&index) {
            return Err(Error::NotFound { index });
        }
        debug!(
            "simulated camera {index}: {}x{} at {} fps, blink every {} frames",
            self.config.width, self.config.height, self.config.fps, self.config.blink_period
        );
        Ok(SimulatedCamera {
            name: format!("simulated-{index}"),
            config: self.config.clone(),
            fno: 0,
            next_deadline: None,
        })
    }
}

pub struct SimulatedCamera {
    name: String,
    config: SimulatedCameraConfig,
    fno: usize,
    next_deadline: Option<Instant>,
}

impl SimulatedCamera {
    fn frame_interval(&self) -> Duration {
        if self.config.fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.config.fps)
        } else {
            Duration::ZERO
        }
    }

    /// Whether frame number `fno` shows closed eyes.
    pub fn is_closed(&self, fno: usize) -> bool {
        let period = self.config.blink_period.max(1);
        let closed = self.config.closed_frames.min(period);
        fno % period >= period - closed
    }
}

impl Camera for SimulatedCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn width(&self) -> Result<u32> {
        Ok(self.config.width)
    }

    fn height(&self) -> Result<u32> {
        Ok(self.config.height)
    }

    fn set_frame_width(&mut self, width: u32) -> Result<()> {
        self.config.width = width;
        Ok(())
    }

    fn set_frame_height(&mut self, height: u32) -> Result<()> {
        self.config.height = height;
        Ok(())
    }

    fn set_acquisition_frame_rate(&mut self, fps: f64) -> Result<()> {
        self.config.fps = fps;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<FrameWithInfo> {
        // Block like a real device would until the next frame is due.
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + self.frame_interval());

        let level = if self.is_closed(self.fno) {
            CLOSED_LEVEL
        } else {
            OPEN_LEVEL
        };
        let image = GrayImage::from_pixel(self.config.width, self.config.height, Luma([level]));
        let host_timing = HostTimingInfo {
            fno: self.fno,
            datetime: chrono::Utc::now(),
        };
        self.fno += 1;
        Ok(FrameWithInfo {
            image: DynamicImage::ImageLuma8(image),
            host_timing,
        })
    }
}
