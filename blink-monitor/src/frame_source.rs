//! Acquires a camera and fills the [FrameBufferGrid] with captured frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use blink_cam_iface::{Camera, CameraModule};
use tracing::{debug, info, warn};

use crate::frame::CapturedFrame;
use crate::frame_grid::{FrameBufferGrid, SlotIndex};
use crate::{Error, Result};

/// Open the first camera responding at an index in
/// `device_hint..device_hint + max_probe`, probing in ascending order.
pub fn acquire<M: CameraModule>(
    module: &mut M,
    device_hint: usize,
    max_probe: usize,
) -> Result<(usize, M::CameraType)> {
    for index in device_hint..device_hint.saturating_add(max_probe) {
        match module.open(index) {
            Ok(cam) => {
                info!(
                    "opened camera \"{}\" at index {index} using {}",
                    cam.name(),
                    module.name()
                );
                return Ok((index, cam));
            }
            Err(e) => {
                debug!("no camera at index {index}: {e}");
            }
        }
    }
    Err(Error::DeviceUnavailable {
        first_index: device_hint,
        probed: max_probe,
    })
}

/// Request frame size and rate. Settings the device rejects are logged and
/// otherwise ignored.
pub fn configure<C: Camera>(cam: &mut C, width: u32, height: u32, fps: f64) {
    if let Err(e) = cam.set_frame_width(width) {
        warn!("camera \"{}\" rejected frame width {width}: {e}", cam.name());
    }
    if let Err(e) = cam.set_frame_height(height) {
        warn!("camera \"{}\" rejected frame height {height}: {e}", cam.name());
    }
    if let Err(e) = cam.set_acquisition_frame_rate(fps) {
        warn!("camera \"{}\" rejected frame rate {fps}: {e}", cam.name());
    }
    match (cam.width(), cam.height()) {
        (Ok(w), Ok(h)) => info!("camera \"{}\" delivers {w}x{h}", cam.name()),
        (Err(e), _) | (_, Err(e)) => debug!("could not read back frame size: {e}"),
    }
}

/// Consecutive failed reads after which the camera is considered lost.
pub const FAILURES_UNTIL_LOST: u32 = 30;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Capture attempts, including failures.
    pub frames: u64,
    pub failed: u64,
    /// Completed passes over the whole grid.
    pub cycles: u64,
}

/// The producer side of the grid. Owns the camera for one run.
pub struct FrameSource<C> {
    camera: C,
    grid: Arc<FrameBufferGrid>,
    next_fno: u64,
    /// Minimum time taken by a failed capture.
    frame_interval: Duration,
    consecutive_failures: u32,
    disconnected: bool,
}

impl<C: Camera> FrameSource<C> {
    pub fn new(camera: C, grid: Arc<FrameBufferGrid>, frame_interval: Duration) -> Self {
        Self {
            camera,
            grid,
            next_fno: 0,
            frame_interval,
            consecutive_failures: 0,
            disconnected: false,
        }
    }

    /// Perform one blocking capture.
    ///
    /// Always returns a frame. A failed capture yields a failure marker and
    /// takes at least one frame interval, so markers are produced no faster
    /// than the configured frame rate.
    pub fn capture(&mut self) -> CapturedFrame {
        let fno = self.next_fno;
        self.next_fno += 1;
        let attempt_start = Instant::now();
        let err = match self.camera.next_frame() {
            Ok(frame) => {
                if self.disconnected {
                    info!("camera \"{}\" delivers frames again", self.camera.name());
                    self.disconnected = false;
                }
                self.consecutive_failures = 0;
                return CapturedFrame::image(fno, frame.host_timing.datetime, frame.image);
            }
            Err(e) => e,
        };
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let lost_reason = match &err {
            blink_cam_iface::Error::Disconnected(msg) => Some(msg.clone()),
            e if self.consecutive_failures >= FAILURES_UNTIL_LOST => Some(format!(
                "{} consecutive failed reads, last: {e}",
                self.consecutive_failures
            )),
            _ => None,
        };
        match lost_reason {
            Some(reason) if !self.disconnected => {
                warn!(
                    "camera \"{}\" lost: {reason}. Capturing failure markers until it returns.",
                    self.camera.name()
                );
                self.disconnected = true;
            }
            _ => {}
        }
        let e = Error::CaptureFailure(match err {
            blink_cam_iface::Error::Disconnected(msg) => msg,
            e => e.to_string(),
        });
        debug!("frame {fno}: {e}");
        std::thread::sleep(self.frame_interval.saturating_sub(attempt_start.elapsed()));
        CapturedFrame::failed(fno, chrono::Utc::now(), e.to_string())
    }

    /// Capture into the grid round-robin until `flag` is stopped.
    ///
    /// The flag is checked before every slot.
    pub fn run(mut self, flag: &thread_control::Flag) -> CaptureStats {
        let queue_len = self.grid.queue_len();
        let batch_len = self.grid.batch_len();
        let mut stats = CaptureStats::default();
        'capture: loop {
            let cycle_start = Instant::now();
            let mut cycle_failed = 0;
            for queue in 0..queue_len {
                for batch in 0..batch_len {
                    if !flag.is_alive() {
                        break 'capture;
                    }
                    let frame = self.capture();
                    if frame.is_failure() {
                        cycle_failed += 1;
                        stats.failed += 1;
                    }
                    self.grid.publish(SlotIndex { queue, batch }, frame);
                    stats.frames += 1;
                }
            }
            stats.cycles += 1;
            let n_frames = queue_len * batch_len;
            let fps = n_frames as f64 / cycle_start.elapsed().as_secs_f64();
            if cycle_failed > 0 {
                warn!("capture: {fps:.1} fps, {cycle_failed} of {n_frames} frames failed");
            } else {
                info!("capture: {fps:.1} fps");
            }
        }
        debug!(
            "frame source done after {} frames ({} failed)",
            stats.frames, stats.failed
        );
        stats
    }
}
