//! Capture from local video devices using OpenCV's `videoio` module.

use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};

use tracing::{debug, trace};

use crate::{Camera, CameraModule, Error, FrameWithInfo, HostTimingInfo, Result};

fn backend_err(e: opencv::Error) -> Error {
    Error::BackendError(e.into())
}

#[derive(Default)]
pub struct OpencvCameraModule {}

impl OpencvCameraModule {
    pub fn new() -> Self {
        Self {}
    }
}

impl CameraModule for OpencvCameraModule {
    type CameraType = OpencvCamera;

    fn name(&self) -> &str {
        "opencv"
    }

    fn open(&mut self, index: usize) -> Result<OpencvCamera> {
        let index_i32 = i32::try_from(index).map_err(|e| Error::BackendError(e.into()))?;
        let cap = VideoCapture::new(index_i32, videoio::CAP_ANY).map_err(backend_err)?;
        if !cap.is_opened().map_err(backend_err)? {
            return Err(Error::NotFound { index });
        }
        match cap.get_backend_name() {
            Ok(api) => debug!("opened video device {index} through {api}"),
            Err(e) => debug!("opened video device {index}, backend unknown: {e}"),
        }
        Ok(OpencvCamera {
            name: format!("opencv-{index}"),
            cap,
            frame: Mat::default(),
            rgb: Mat::default(),
            fno: 0,
        })
    }
}

pub struct OpencvCamera {
    name: String,
    cap: VideoCapture,
    frame: Mat,
    rgb: Mat,
    fno: usize,
}

impl OpencvCamera {
    fn set_prop(&mut self, prop: i32, value: f64, feature: &'static str) -> Result<()> {
        if self.cap.set(prop, value).map_err(backend_err)? {
            trace!("{}: set {feature} to {value}", self.name);
            Ok(())
        } else {
            Err(Error::FeatureNotPresent(feature))
        }
    }

    fn get_prop(&self, prop: i32) -> Result<u32> {
        Ok(self.cap.get(prop).map_err(backend_err)? as u32)
    }
}

impl Camera for OpencvCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn width(&self) -> Result<u32> {
        self.get_prop(videoio::CAP_PROP_FRAME_WIDTH)
    }

    fn height(&self) -> Result<u32> {
        self.get_prop(videoio::CAP_PROP_FRAME_HEIGHT)
    }

    fn set_frame_width(&mut self, width: u32) -> Result<()> {
        self.set_prop(videoio::CAP_PROP_FRAME_WIDTH, width as f64, "frame width")
    }

    fn set_frame_height(&mut self, height: u32) -> Result<()> {
        self.set_prop(videoio::CAP_PROP_FRAME_HEIGHT, height as f64, "frame height")
    }

    fn set_acquisition_frame_rate(&mut self, fps: f64) -> Result<()> {
        self.set_prop(videoio::CAP_PROP_FPS, fps, "acquisition frame rate")
    }

    fn next_frame(&mut self) -> Result<FrameWithInfo> {
        let got_frame = self.cap.read(&mut self.frame).map_err(backend_err)?;
        if !got_frame || self.frame.empty() {
            if !self.cap.is_opened().map_err(backend_err)? {
                debug!("{}: device closed", self.name);
                return Err(Error::Disconnected(self.name.clone()));
            }
            trace!("{}: empty read at frame {}", self.name, self.fno);
            return Err(Error::SingleFrameError("empty read".into()));
        }
        let datetime = chrono::Utc::now();

        imgproc::cvt_color(&self.frame, &mut self.rgb, imgproc::COLOR_BGR2RGB, 0)
            .map_err(backend_err)?;
        let width = self.rgb.cols() as u32;
        let height = self.rgb.rows() as u32;
        let data = self.rgb.data_bytes().map_err(backend_err)?.to_vec();
        let image = image::RgbImage::from_raw(width, height, data)
            .ok_or_else(|| Error::SingleFrameError("unexpected buffer size".into()))?;

        let host_timing = HostTimingInfo {
            fno: self.fno,
            datetime,
        };
        self.fno += 1;
        Ok(FrameWithInfo {
            image: image::DynamicImage::ImageRgb8(image),
            host_timing,
        })
    }
}
