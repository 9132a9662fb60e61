//! Capture camera frames, count blinks, and keep a persisted blink history.
//!
//! The pipeline consists of independent worker threads composed by
//! [PipelineController]:
//!
//! - [frame_source::FrameSource] captures frames into a
//!   [frame_grid::FrameBufferGrid].
//! - [analysis::AnalysisWorker] feeds the most recent frame to a
//!   [analysis::BlinkAnalyzer] and advances the [counter::BlinkCounter].
//! - [aggregator::MetricAggregator] samples the counter into a
//!   [window::MetricWindow].
//! - [persistence::PersistenceWorker] appends the newest window sample to a
//!   [store::SampleStore].
//! - [telemetry::TelemetryWorker] logs CPU and memory usage of the process.
//!
//! A presentation layer polls the pipeline through a [PipelineHandle].

use std::time::Duration;

pub mod aggregator;
pub mod analysis;
pub mod config;
pub mod controller;
pub mod counter;
pub mod frame;
pub mod frame_grid;
pub mod frame_source;
pub mod intensity_analyzer;
pub mod persistence;
pub mod store;
pub mod telemetry;
pub mod window;

mod single_writer;
mod worker;

pub use crate::config::{BlinkMonitorConfig, CounterPolicy};
pub use crate::controller::{PipelineController, PipelineHandle, PipelineState};

/// Possible errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No camera opened at startup. This is the only fatal startup error.
    #[error("no camera available (probed {probed} device indices starting at {first_index})")]
    DeviceUnavailable { first_index: usize, probed: usize },
    #[error("capture failure: {0}")]
    CaptureFailure(String),
    #[error("analysis failure: {0}")]
    AnalysisFailure(anyhow::Error),
    #[error("storage write failure: {0}")]
    StorageWriteFailure(#[from] store::StoreError),
    #[error("worker \"{worker}\" did not exit within {waited:?} of being stopped")]
    ShutdownTimeout { worker: String, waited: Duration },
    #[error("a writer for the {0} is already active")]
    WriterAlreadyClaimed(&'static str),
    #[error("could not spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    #[error("worker \"{0}\" panicked")]
    WorkerPanicked(String),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}
