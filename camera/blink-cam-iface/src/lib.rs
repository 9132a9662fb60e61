//! Camera interface traits used by the blink monitor capture thread.
//!
//! A [CameraModule] opens cameras by device index, and a [Camera] delivers
//! frames with blocking calls to [Camera::next_frame]. Two backends are
//! provided: [simulated], which synthesizes frames and is always available,
//! and `opencv_backend`, which captures from real devices and requires the
//! `backend_opencv` feature.

use image::DynamicImage;

pub mod simulated;

#[cfg(feature = "backend_opencv")]
pub mod opencv_backend;

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A single frame could not be read. The camera remains usable.
    #[error("SingleFrameError({0})")]
    SingleFrameError(String),
    /// The device went away while acquiring.
    #[error("camera disconnected: {0}")]
    Disconnected(String),
    #[error("no camera responds at index {index}")]
    NotFound { index: usize },
    #[error("feature not present: {0}")]
    FeatureNotPresent(&'static str),
    #[error("BackendError({0})")]
    BackendError(#[from] anyhow::Error),
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

// ---------------------------
// CameraModule

/// A module for opening cameras (e.g. OpenCV videoio).
pub trait CameraModule: Send {
    type CameraType: Camera;

    fn name(&self) -> &str;
    /// Open the camera at device index `index`.
    ///
    /// Returns [Error::NotFound] if nothing responds at that index.
    fn open(&mut self, index: usize) -> Result<Self::CameraType>;
}

/// Timing information acquired on the host computer.
#[derive(Debug, Clone)]
pub struct HostTimingInfo {
    /// The frame number as counted by the backend.
    pub fno: usize,
    /// The timestamp of the frame when it was acquired by the host.
    pub datetime: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct FrameWithInfo {
    /// The image frame acquired from the camera.
    pub image: DynamicImage,
    /// Frame timing information acquired by the host.
    pub host_timing: HostTimingInfo,
}

impl FrameWithInfo {
    pub fn width(&self) -> u32 {
        self.image.width()
    }
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

// ---------------------------
// Camera

pub trait Camera: Send {
    fn name(&self) -> &str;

    /// Return the current frame width in pixels
    fn width(&self) -> Result<u32>;
    /// Return the current frame height in pixels
    fn height(&self) -> Result<u32>;

    /// Request a frame width. Devices are free to ignore the request.
    fn set_frame_width(&mut self, _width: u32) -> Result<()> {
        Err(Error::FeatureNotPresent("frame width"))
    }
    /// Request a frame height. Devices are free to ignore the request.
    fn set_frame_height(&mut self, _height: u32) -> Result<()> {
        Err(Error::FeatureNotPresent("frame height"))
    }
    /// Request an acquisition frame rate in frames per second.
    fn set_acquisition_frame_rate(&mut self, _fps: f64) -> Result<()> {
        Err(Error::FeatureNotPresent("acquisition frame rate"))
    }

    /// synchronous (blocking) frame acquisition
    fn next_frame(&mut self) -> Result<FrameWithInfo>;
}

impl<C: Camera + ?Sized> Camera for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn width(&self) -> Result<u32> {
        (**self).width()
    }
    fn height(&self) -> Result<u32> {
        (**self).height()
    }
    fn set_frame_width(&mut self, width: u32) -> Result<()> {
        (**self).set_frame_width(width)
    }
    fn set_frame_height(&mut self, height: u32) -> Result<()> {
        (**self).set_frame_height(height)
    }
    fn set_acquisition_frame_rate(&mut self, fps: f64) -> Result<()> {
        (**self).set_acquisition_frame_rate(fps)
    }
    fn next_frame(&mut self) -> Result<FrameWithInfo> {
        (**self).next_frame()
    }
}
