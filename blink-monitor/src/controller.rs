//! Composition of the pipeline workers and their start and stop sequence.

use std::sync::Arc;
use std::time::Duration;

use blink_cam_iface::CameraModule;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::aggregator::MetricAggregator;
use crate::analysis::{AnalysisWorker, BlinkAnalyzer};
use crate::config::{BlinkMonitorConfig, CounterPolicy};
use crate::counter::{BlinkCounter, BlinkCounterReader};
use crate::frame_grid::FrameBufferGrid;
use crate::frame_source::{self, FrameSource};
use crate::persistence::PersistenceWorker;
use crate::store::StoreOpener;
use crate::telemetry::{TelemetryReader, TelemetryRecord, TelemetryWorker};
use crate::window::{MetricSample, MetricWindow, SlidingWindow, WindowReader};
use crate::worker::{ControlledJoinHandle, spawn_controlled};
use crate::{Error, Result};

/// Time a worker may take to exit after being stopped, not counting one
/// blocking camera read.
const WORKER_STOP_BOUND: Duration = Duration::from_secs(2);

/// Creates a fresh analyzer for every run of the pipeline.
pub type AnalyzerFactory = Box<dyn FnMut() -> Box<dyn BlinkAnalyzer> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, never started.
    Idle,
    Running,
    /// Workers are being stopped.
    Stopping,
    /// Stopped after running. Can be started again.
    Stopped,
}

/// Read-only view of the pipeline for the presentation layer.
#[derive(Clone)]
pub struct PipelineHandle {
    state: Arc<RwLock<PipelineState>>,
    counter: BlinkCounterReader,
    window: WindowReader,
    telemetry: TelemetryReader,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    /// Blinks counted so far.
    pub fn blink_count(&self) -> u64 {
        self.counter.get()
    }

    pub fn newest_sample(&self) -> MetricSample {
        self.window.newest()
    }

    /// The metric window, newest first.
    pub fn window(&self) -> Vec<MetricSample> {
        self.window.snapshot()
    }

    pub fn latest_telemetry(&self) -> Option<TelemetryRecord> {
        self.telemetry.latest()
    }
}

/// The worker threads of one run, in start order.
#[derive(Default)]
struct RunningWorkers {
    frame_source: Option<ControlledJoinHandle<frame_source::CaptureStats>>,
    analysis: Option<ControlledJoinHandle<crate::analysis::AnalysisStats>>,
    aggregator: Option<ControlledJoinHandle<u64>>,
    persistence: Option<ControlledJoinHandle<crate::persistence::PersistenceStats>>,
    telemetry: Option<ControlledJoinHandle<u64>>,
}

fn join_worker<T: std::fmt::Debug>(
    handle: Option<ControlledJoinHandle<T>>,
    first_err: &mut Option<Error>,
) {
    let Some(handle) = handle else {
        return;
    };
    let name = handle.name();
    match handle.close_and_join() {
        Ok(result) => debug!("worker \"{name}\" finished: {result:?}"),
        Err(e) => {
            error!("{e}");
            first_err.get_or_insert(e);
        }
    }
}

impl RunningWorkers {
    /// Stop and join every worker, one after the other, in shutdown order.
    ///
    /// The store is closed first so that no row is written after the
    /// sources of its data are gone. Telemetry keeps reporting until last.
    fn stop_all(&mut self) -> Result<()> {
        let mut first_err = None;
        join_worker(self.persistence.take(), &mut first_err);
        join_worker(self.aggregator.take(), &mut first_err);
        join_worker(self.analysis.take(), &mut first_err);
        join_worker(self.frame_source.take(), &mut first_err);
        join_worker(self.telemetry.take(), &mut first_err);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Owns the pipeline workers and sequences their start and stop.
///
/// The blink counter and metric window outlive individual runs. Whether
/// they are reset at [PipelineController::start] is set by
/// [CounterPolicy].
pub struct PipelineController<M: CameraModule> {
    config: BlinkMonitorConfig,
    module: M,
    analyzer_factory: AnalyzerFactory,
    store_opener: Arc<dyn StoreOpener>,
    state: Arc<RwLock<PipelineState>>,
    counter: BlinkCounter,
    window: MetricWindow,
    telemetry: TelemetryReader,
    workers: Option<RunningWorkers>,
    n_runs: u64,
}

impl<M> PipelineController<M>
where
    M: CameraModule,
    M::CameraType: 'static,
{
    pub fn new(
        config: BlinkMonitorConfig,
        module: M,
        analyzer_factory: AnalyzerFactory,
        store_opener: Arc<dyn StoreOpener>,
    ) -> Result<Self> {
        config.validate()?;
        let window = MetricWindow::new(config.window_len, chrono::Utc::now().timestamp());
        Ok(Self {
            config,
            module,
            analyzer_factory,
            store_opener,
            state: Arc::new(RwLock::new(PipelineState::Idle)),
            counter: BlinkCounter::new(),
            window,
            telemetry: TelemetryReader::default(),
            workers: None,
            n_runs: 0,
        })
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            state: self.state.clone(),
            counter: self.counter.reader(),
            window: self.window.reader(),
            telemetry: self.telemetry.clone(),
        }
    }

    /// Acquire the camera and start all workers.
    ///
    /// Does nothing if already running. If the camera cannot be acquired or
    /// a worker cannot be started, workers already started are stopped again
    /// and the state is left unchanged.
    pub fn start(&mut self) -> Result<()> {
        if self.workers.is_some() {
            debug!("pipeline already running");
            return Ok(());
        }
        let cfg = &self.config;
        let (index, mut camera) = frame_source::acquire(
            &mut self.module,
            cfg.camera.device_index,
            cfg.camera.max_probe,
        )?;
        frame_source::configure(&mut camera, cfg.camera.width, cfg.camera.height, cfg.camera.fps);

        let mut counter = self
            .counter
            .claim_writer()
            .ok_or(Error::WriterAlreadyClaimed("blink counter"))?;
        let mut window = self
            .window
            .claim_writer()
            .ok_or(Error::WriterAlreadyClaimed("metric window"))?;
        let previous = (counter.get(), window.copy_window());
        if self.config.counter_policy == CounterPolicy::ResetOnStart {
            counter.reset();
            window.reseed(chrono::Utc::now().timestamp());
        }

        let grid = Arc::new(FrameBufferGrid::new(
            self.config.queue_len(),
            self.config.batch_len(),
        ));
        let frame_interval = self.config.frame_interval();
        let source = FrameSource::new(camera, grid.clone(), frame_interval);
        let analysis = AnalysisWorker::new((self.analyzer_factory)(), counter);
        let aggregator =
            MetricAggregator::new(self.counter.reader(), window, self.config.stream_interval());
        let persistence = PersistenceWorker::new(
            self.store_opener.clone(),
            self.window.reader(),
            self.config.persist_interval(),
        );
        let telemetry = TelemetryWorker::new(&self.telemetry, self.config.telemetry_interval());

        let mut workers = RunningWorkers::default();
        let spawned = (|| -> Result<()> {
            let source_bound = WORKER_STOP_BOUND + 2 * frame_interval;
            workers.frame_source = Some(spawn_controlled("frame-source", source_bound, move |flag| {
                source.run(&flag)
            })?);
            workers.analysis = Some(spawn_controlled("analysis", WORKER_STOP_BOUND, move |flag| {
                analysis.run(&grid, &flag)
            })?);
            workers.aggregator = Some(spawn_controlled("aggregator", WORKER_STOP_BOUND, move |flag| {
                aggregator.run(&flag)
            })?);
            workers.persistence = Some(spawn_controlled(
                "persistence",
                WORKER_STOP_BOUND,
                move |flag| persistence.run(&flag),
            )?);
            workers.telemetry = Some(spawn_controlled("telemetry", WORKER_STOP_BOUND, move |flag| {
                telemetry.run(&flag)
            })?);
            Ok(())
        })();
        if let Err(e) = spawned {
            error!("could not start pipeline: {e}");
            if let Err(e2) = workers.stop_all() {
                error!("while stopping partially started pipeline: {e2}");
            }
            self.restore(previous);
            return Err(e);
        }

        self.workers = Some(workers);
        self.n_runs += 1;
        *self.state.write() = PipelineState::Running;
        info!(
            "pipeline started (run {}) with camera index {index}, {}x{} frame grid",
            self.n_runs,
            self.config.queue_len(),
            self.config.batch_len()
        );
        Ok(())
    }

    /// Put back counter and window values saved before a failed start.
    ///
    /// Must be called after the workers of that start have been joined.
    fn restore(&self, (count, window): (u64, SlidingWindow)) {
        match (self.counter.claim_writer(), self.window.claim_writer()) {
            (Some(mut c), Some(mut w)) => {
                c.restore(count);
                w.restore(window);
            }
            _ => error!("cannot restore blink count, a writer is still active"),
        }
    }

    /// Stop all workers in shutdown order, waiting for each to exit.
    ///
    /// Does nothing unless running. Returns an error if a worker panicked,
    /// after all workers have been stopped.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut workers) = self.workers.take() else {
            debug!("pipeline not running");
            return Ok(());
        };
        *self.state.write() = PipelineState::Stopping;
        info!("stopping pipeline");
        let result = workers.stop_all();
        *self.state.write() = PipelineState::Stopped;
        info!("pipeline stopped");
        result
    }
}

impl<M: CameraModule> Drop for PipelineController<M> {
    fn drop(&mut self) {
        if let Some(mut workers) = self.workers.take() {
            *self.state.write() = PipelineState::Stopping;
            if let Err(e) = workers.stop_all() {
                error!("while stopping pipeline on drop: {e}");
            }
            *self.state.write() = PipelineState::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use blink_cam_iface::simulated::{SimulatedCameraConfig, SimulatedCameraModule};

    use super::*;
    use crate::config::DEFAULT_WINDOW_LEN;
    use crate::intensity_analyzer::IntensityBlinkAnalyzer;
    use crate::store::SqliteStoreOpener;

    fn idle_controller(store_dir: &std::path::Path) -> PipelineController<SimulatedCameraModule> {
        let mut cfg = BlinkMonitorConfig::default();
        cfg.logging.file = None;
        let opener = Arc::new(SqliteStoreOpener::new(store_dir.join("blinks.db"), "user1"));
        PipelineController::new(
            cfg,
            SimulatedCameraModule::new(SimulatedCameraConfig::default()),
            Box::new(|| Box::new(IntensityBlinkAnalyzer::default()) as Box<dyn BlinkAnalyzer>),
            opener,
        )
        .unwrap()
    }

    #[test]
    fn failed_start_puts_back_count_and_window() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = idle_controller(dir.path());
        let handle = pipeline.handle();
        let sample = MetricSample {
            timestamp: 1_000,
            value: 3,
        };

        // What start() does before spawning workers.
        let previous = {
            let mut counter = pipeline.counter.claim_writer().unwrap();
            let mut window = pipeline.window.claim_writer().unwrap();
            counter.add(3);
            window.push(sample);
            let previous = (counter.get(), window.copy_window());
            counter.reset();
            window.reseed(2_000);
            previous
        };
        assert_eq!(handle.blink_count(), 0);

        pipeline.restore(previous);
        assert_eq!(handle.blink_count(), 3);
        assert_eq!(handle.newest_sample(), sample);
        assert_eq!(handle.window().len(), DEFAULT_WINDOW_LEN);
        assert_eq!(handle.state(), PipelineState::Idle);
    }

    #[test]
    fn restore_leaves_active_writer_alone() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = idle_controller(dir.path());
        let handle = pipeline.handle();
        let mut writer = pipeline.counter.claim_writer().unwrap();
        writer.add(2);
        let window = pipeline.window.reader();
        let saved = SlidingWindow::seeded(pipeline.config.window_len, 0);
        pipeline.restore((7, saved));
        assert_eq!(handle.blink_count(), 2);
        assert_ne!(window.newest().timestamp, 0);
    }
}
