use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use blink_cam_iface::{
    CameraModule,
    simulated::{SimulatedCameraConfig, SimulatedCameraModule},
};
use blink_monitor::{
    BlinkMonitorConfig, PipelineController, PipelineHandle,
    analysis::BlinkAnalyzer,
    config::CameraBackend,
    intensity_analyzer::IntensityBlinkAnalyzer,
    store::SqliteStoreOpener,
    telemetry::format_memory,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count blinks until Ctrl-C is pressed.
    Run {
        /// Configuration file. Defaults are used if not given.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stop after this many seconds.
        #[arg(long, value_parser = parse_seconds)]
        duration: Option<Duration>,
        /// Do not log to the console. Log records are shown together with
        /// the blink count instead.
        #[arg(long)]
        no_console_log: bool,
    },
    /// Print the default configuration in TOML format.
    PrintExampleConfig,
    /// Print persisted blink counts.
    History {
        /// Configuration file naming the store.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print only the most recent rows.
        #[arg(long)]
        last: Option<usize>,
    },
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{secs} seconds: {e}"))
}

fn load_config(fname: Option<&PathBuf>) -> anyhow::Result<BlinkMonitorConfig> {
    match fname {
        Some(fname) => BlinkMonitorConfig::from_toml_file(fname)
            .with_context(|| format!("reading config file \"{}\"", fname.display())),
        None => Ok(BlinkMonitorConfig::default()),
    }
}

fn format_timestamp(timestamp: i64) -> String {
    match chrono::DateTime::from_timestamp(timestamp, 0) {
        Some(dt) => dt
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => timestamp.to_string(),
    }
}

fn print_status(handle: &PipelineHandle) {
    let newest = handle.newest_sample();
    let telemetry = match handle.latest_telemetry() {
        Some(t) => format!(
            "CPU {:.1}% | RAM {}",
            t.cpu_percent,
            format_memory(t.rss_bytes)
        ),
        None => "no telemetry yet".to_string(),
    };
    println!(
        "Total blinks: {} | last sample {} at {} | {telemetry}",
        handle.blink_count(),
        newest.value,
        format_timestamp(newest.timestamp),
    );
}

fn run<M>(
    cfg: BlinkMonitorConfig,
    module: M,
    duration: Option<Duration>,
    live_log: Option<crossbeam_channel::Receiver<env_tracing_logger::LogRecord>>,
) -> anyhow::Result<()>
where
    M: CameraModule,
    M::CameraType: 'static,
{
    let store_opener = Arc::new(SqliteStoreOpener::new(
        cfg.store.path.clone(),
        cfg.store.table.clone(),
    ));
    let presentation_interval = cfg.presentation_interval();
    let mut controller = PipelineController::new(
        cfg,
        module,
        Box::new(|| Box::new(IntensityBlinkAnalyzer::default()) as Box<dyn BlinkAnalyzer>),
        store_opener,
    )?;
    let handle = controller.handle();

    let (quit_tx, quit_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        info!("got Ctrl-C, shutting down");
        let _ = quit_tx.try_send(());
    })
    .context("setting Ctrl-C handler")?;

    controller.start()?;

    let deadline = duration.map(|d| Instant::now() + d);
    let live_log = live_log.unwrap_or_else(crossbeam_channel::never);
    let ticker = crossbeam_channel::tick(presentation_interval);
    loop {
        crossbeam_channel::select! {
            recv(quit_rx) -> _ => break,
            recv(live_log) -> record => {
                if let Ok(record) = record {
                    println!("{record}");
                }
            }
            recv(ticker) -> _ => print_status(&handle),
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("requested duration elapsed");
            break;
        }
    }

    controller.stop()?;
    print_status(&handle);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            duration,
            no_console_log,
        } => {
            let cfg = load_config(config.as_ref())?;
            if std::env::var_os("RUST_LOG").is_none() {
                // Environment access happens here before any thread is spawned.
                unsafe { std::env::set_var("RUST_LOG", "info") };
            }
            let (live_layer, live_rx) = if no_console_log {
                let (layer, rx) = env_tracing_logger::live_channel(256);
                (Some(layer), Some(rx))
            } else {
                (None, None)
            };
            let _guard = env_tracing_logger::initiate_logging(
                cfg.logging.file.clone(),
                no_console_log,
                live_layer,
            )
            .map_err(|e| anyhow::anyhow!(e))?;
            info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

            match cfg.camera.backend {
                CameraBackend::Simulated => {
                    let module = SimulatedCameraModule::new(SimulatedCameraConfig {
                        width: cfg.camera.width,
                        height: cfg.camera.height,
                        fps: cfg.camera.fps,
                        blink_period: cfg.camera.simulated_blink_period,
                        ..Default::default()
                    });
                    run(cfg, module, duration, live_rx)
                }
                #[cfg(feature = "backend_opencv")]
                CameraBackend::Opencv => {
                    let module = blink_cam_iface::opencv_backend::OpencvCameraModule::new();
                    run(cfg, module, duration, live_rx)
                }
                #[cfg(not(feature = "backend_opencv"))]
                CameraBackend::Opencv => {
                    anyhow::bail!(
                        "OpenCV camera backend requested but compiled without the \"backend_opencv\" feature"
                    );
                }
            }
        }
        Command::PrintExampleConfig => {
            let cfg = BlinkMonitorConfig::default();
            print!("{}", cfg.to_toml_string()?);
            Ok(())
        }
        Command::History { config, last } => {
            let _guard = env_tracing_logger::init();
            let cfg = load_config(config.as_ref())?;
            let store = SqliteStoreOpener::new(cfg.store.path.clone(), cfg.store.table.clone())
                .open_sqlite()
                .with_context(|| format!("opening store \"{}\"", cfg.store.path.display()))?;
            println!("timestamp,blinkcount");
            for record in store.records(last)? {
                println!("{},{}", format_timestamp(record.timestamp), record.blink_count);
            }
            Ok(())
        }
    }
}
