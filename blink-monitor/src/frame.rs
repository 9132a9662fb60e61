use chrono::{DateTime, Utc};
use image::DynamicImage;

/// Image data of a captured frame, or the reason there is none.
#[derive(Clone)]
pub enum FrameData {
    Image(DynamicImage),
    /// A failed capture. Kept in place of the frame so gaps stay visible.
    Failed(String),
}

/// One capture attempt.
#[derive(Clone)]
pub struct CapturedFrame {
    /// Frame number counted by the frame source, including failed captures.
    pub fno: u64,
    pub timestamp: DateTime<Utc>,
    pub data: FrameData,
}

impl CapturedFrame {
    pub fn image(fno: u64, timestamp: DateTime<Utc>, image: DynamicImage) -> Self {
        Self {
            fno,
            timestamp,
            data: FrameData::Image(image),
        }
    }

    pub fn failed(fno: u64, timestamp: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            fno,
            timestamp,
            data: FrameData::Failed(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.data, FrameData::Failed(_))
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("CapturedFrame");
        s.field("fno", &self.fno).field("timestamp", &self.timestamp);
        match &self.data {
            FrameData::Image(im) => s.field("image", &(im.width(), im.height())),
            FrameData::Failed(reason) => s.field("failed", reason),
        };
        s.finish()
    }
}
