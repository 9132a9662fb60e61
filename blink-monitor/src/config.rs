//! Configuration of the blink monitor, usually read from a `.toml` file.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The configuration error type.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {source}")]
    TomlSerError {
        #[from]
        source: toml::ser::Error,
    },
    #[error("path is not valid utf-8: {0}")]
    NonUtf8Path(PathBuf),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// The default value for [BlinkMonitorConfig::window_len].
pub const DEFAULT_WINDOW_LEN: usize = 10;
/// The default value for [StoreConfig::path].
pub const DEFAULT_STORE_PATH: &str = "wellness_at_work_db";
/// The default value for [StoreConfig::table].
pub const DEFAULT_STORE_TABLE: &str = "user1";
/// The default value for [LoggingConfig::file].
pub const DEFAULT_LOG_FILE: &str = "Blink-Monitor.log";

/// Lowest accepted [CameraConfig::fps].
pub const MIN_FPS: f64 = 0.01;
/// Highest accepted [CameraConfig::fps].
pub const MAX_FPS: f64 = 1000.0;

const DEFAULT_INTERVAL_MSEC: u64 = 1000;

fn default_window_len() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_WINDOW_LEN).unwrap()
}

fn default_queue_len() -> NonZeroUsize {
    NonZeroUsize::new(4).unwrap()
}

fn default_interval_msec() -> u64 {
    DEFAULT_INTERVAL_MSEC
}

/// What happens to the blink counter and metric window when the pipeline is
/// started again after being stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterPolicy {
    /// Count from zero and refill the window with placeholders on every
    /// start.
    #[default]
    ResetOnStart,
    /// Continue counting from the value of the previous run.
    Preserve,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    /// Synthetic frames with regular blinks. Needs no hardware.
    #[default]
    Simulated,
    /// OpenCV `VideoCapture`. Requires the `backend_opencv` feature.
    Opencv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    #[serde(default)]
    pub backend: CameraBackend,
    /// The first device index probed.
    #[serde(default)]
    pub device_index: usize,
    /// How many device indices are probed, starting at `device_index`.
    #[serde(default = "CameraConfig::default_max_probe")]
    pub max_probe: usize,
    #[serde(default = "CameraConfig::default_width")]
    pub width: u32,
    #[serde(default = "CameraConfig::default_height")]
    pub height: u32,
    #[serde(default = "CameraConfig::default_fps")]
    pub fps: f64,
    /// Frames between two blinks of the simulated camera.
    #[serde(default = "CameraConfig::default_simulated_blink_period")]
    pub simulated_blink_period: usize,
}

impl CameraConfig {
    fn default_max_probe() -> usize {
        4
    }
    fn default_width() -> u32 {
        640
    }
    fn default_height() -> u32 {
        480
    }
    fn default_fps() -> f64 {
        30.0
    }
    fn default_simulated_blink_period() -> usize {
        90
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::default(),
            device_index: 0,
            max_probe: Self::default_max_probe(),
            width: Self::default_width(),
            height: Self::default_height(),
            fps: Self::default_fps(),
            simulated_blink_period: Self::default_simulated_blink_period(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Number of batches in the frame grid.
    #[serde(default = "default_queue_len")]
    pub queue_len: NonZeroUsize,
    /// Frames per batch. Defaults to the camera frame rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_len: Option<NonZeroUsize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            queue_len: default_queue_len(),
            batch_len: None,
        }
    }
}

/// Periods of the pipeline workers, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalsConfig {
    /// Sampling of the blink counter into the metric window.
    #[serde(default = "default_interval_msec")]
    pub stream_msec: u64,
    /// Appending the newest sample to the store.
    #[serde(default = "default_interval_msec")]
    pub persist_msec: u64,
    /// Sampling CPU and memory usage.
    #[serde(default = "default_interval_msec")]
    pub telemetry_msec: u64,
    /// Refreshing the console display.
    #[serde(default = "default_interval_msec")]
    pub presentation_msec: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            stream_msec: DEFAULT_INTERVAL_MSEC,
            persist_msec: DEFAULT_INTERVAL_MSEC,
            telemetry_msec: DEFAULT_INTERVAL_MSEC,
            presentation_msec: DEFAULT_INTERVAL_MSEC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database file. May start with `~` or contain environment
    /// variables.
    #[serde(default = "StoreConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "StoreConfig::default_table")]
    pub table: String,
}

impl StoreConfig {
    fn default_path() -> PathBuf {
        DEFAULT_STORE_PATH.into()
    }
    fn default_table() -> String {
        DEFAULT_STORE_TABLE.to_string()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            table: Self::default_table(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log file, appended to. No file is written if `None`.
    #[serde(
        default = "LoggingConfig::default_file",
        skip_serializing_if = "Option::is_none"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_file() -> Option<PathBuf> {
        Some(DEFAULT_LOG_FILE.into())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: Self::default_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlinkMonitorConfig {
    /// Number of samples in the metric window.
    #[serde(default = "default_window_len")]
    pub window_len: NonZeroUsize,
    #[serde(default)]
    pub counter_policy: CounterPolicy,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BlinkMonitorConfig {
    fn default() -> Self {
        Self {
            window_len: default_window_len(),
            counter_policy: CounterPolicy::default(),
            camera: CameraConfig::default(),
            buffer: BufferConfig::default(),
            intervals: IntervalsConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Expand `~` and environment variables in `path`. If the result is
/// relative and `dirname` is given, make it relative to `dirname`.
fn fixup_path(path: &mut PathBuf, dirname: Option<&Path>) -> Result<()> {
    let pathstr = path
        .to_str()
        .ok_or_else(|| ConfigError::NonUtf8Path(path.clone()))?;
    let expanded = shellexpand::full(pathstr)?;
    *path = PathBuf::from(expanded.to_string());

    if let Some(dirname) = dirname {
        if path.is_relative() {
            *path = dirname.join(&path);
        }
    }
    Ok(())
}

impl BlinkMonitorConfig {
    /// Parse a `.toml` file. Relative paths in the file are taken relative
    /// to the directory containing the file.
    pub fn from_toml_file<P: AsRef<Path>>(fname: P) -> Result<Self> {
        let fname = fname.as_ref();
        let contents = std::fs::read_to_string(fname)?;
        let mut cfg: Self = toml::from_str(&contents)?;
        let dirname = fname.parent().unwrap_or_else(|| Path::new(""));
        cfg.fixup_paths(Some(dirname))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML text. Relative paths are kept relative to the working
    /// directory.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut cfg: Self = toml::from_str(contents)?;
        cfg.fixup_paths(None)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    fn fixup_paths(&mut self, dirname: Option<&Path>) -> Result<()> {
        fixup_path(&mut self.store.path, dirname)?;
        if let Some(file) = self.logging.file.as_mut() {
            fixup_path(file, dirname)?;
        }
        Ok(())
    }

    /// Check values which the types alone do not constrain.
    pub fn validate(&self) -> Result<()> {
        let fps = self.camera.fps;
        if !(MIN_FPS..=MAX_FPS).contains(&fps) {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be between {MIN_FPS} and {MAX_FPS}, not {fps}"
            )));
        }
        if self.camera.max_probe == 0 {
            return Err(ConfigError::Invalid(
                "camera.max_probe must be at least 1".into(),
            ));
        }
        if self.buffer.batch_len.is_none() && self.batch_len() == 0 {
            return Err(ConfigError::Invalid(format!(
                "buffer.batch_len must be set when camera.fps ({fps}) rounds to zero"
            )));
        }
        let i = &self.intervals;
        for (name, msec) in [
            ("stream_msec", i.stream_msec),
            ("persist_msec", i.persist_msec),
            ("telemetry_msec", i.telemetry_msec),
            ("presentation_msec", i.presentation_msec),
        ] {
            if msec == 0 {
                return Err(ConfigError::Invalid(format!(
                    "intervals.{name} must be positive"
                )));
            }
        }
        if self.store.table.is_empty() {
            return Err(ConfigError::Invalid("store.table must not be empty".into()));
        }
        Ok(())
    }

    /// Frames per batch of the frame grid.
    pub fn batch_len(&self) -> usize {
        match self.buffer.batch_len {
            Some(n) => n.get(),
            None => self.camera.fps.round() as usize,
        }
    }

    /// Time between frames at the configured frame rate.
    ///
    /// Only meaningful for a validated configuration.
    pub fn frame_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.camera.fps).unwrap_or(Duration::ZERO)
    }

    pub fn queue_len(&self) -> usize {
        self.buffer.queue_len.get()
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.stream_msec)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.persist_msec)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.telemetry_msec)
    }

    pub fn presentation_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.presentation_msec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let cfg = BlinkMonitorConfig::default();
        let text = cfg.to_toml_string().unwrap();
        assert!(text.contains("table = \"user1\""));
        assert_eq!(BlinkMonitorConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = BlinkMonitorConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, BlinkMonitorConfig::default());
        assert_eq!(cfg.window_len.get(), 10);
        assert_eq!(cfg.queue_len(), 4);
        assert_eq!(cfg.batch_len(), 30);
        assert_eq!(cfg.stream_interval(), Duration::from_secs(1));
        assert_eq!(cfg.store.path, PathBuf::from("wellness_at_work_db"));
        assert_eq!(cfg.logging.file, Some(PathBuf::from("Blink-Monitor.log")));
    }

    #[test]
    fn partial_file_overrides_some_values() {
        let cfg = BlinkMonitorConfig::from_toml_str(
            r#"
            counter_policy = "preserve"

            [camera]
            fps = 15

            [buffer]
            batch_len = 5

            [intervals]
            stream_msec = 200
            "#,
        )
        .unwrap();
        assert_eq!(cfg.counter_policy, CounterPolicy::Preserve);
        assert_eq!(cfg.camera.fps, 15.0);
        assert_eq!(cfg.camera.width, 640);
        assert_eq!(cfg.batch_len(), 5);
        assert_eq!(cfg.stream_interval(), Duration::from_millis(200));
        assert_eq!(cfg.persist_interval(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = BlinkMonitorConfig::from_toml_str("[camera]\nframerate = 30.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlDeError { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for text in [
            "window_len = 0",
            "[intervals]\npersist_msec = 0",
            "[camera]\nfps = 0.0",
            "[camera]\nfps = 1e-320",
            "[camera]\nfps = nan",
            "[camera]\nfps = 1e9",
            "[camera]\nmax_probe = 0",
            "[buffer]\nqueue_len = 0",
        ] {
            assert!(BlinkMonitorConfig::from_toml_str(text).is_err(), "{text}");
        }
    }

    #[test]
    fn paths_are_expanded_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let fname = dir.path().join("blink-monitor.toml");
        std::fs::write(&fname, "[store]\npath = \"blinks.db\"\n").unwrap();
        let cfg = BlinkMonitorConfig::from_toml_file(&fname).unwrap();
        assert_eq!(cfg.store.path, dir.path().join("blinks.db"));
        assert_eq!(
            cfg.logging.file,
            Some(dir.path().join(DEFAULT_LOG_FILE))
        );
    }

    #[test]
    fn empty_logging_table_keeps_default_file() {
        let cfg = BlinkMonitorConfig::from_toml_str("[logging]\n").unwrap();
        assert_eq!(cfg.logging.file, Some(PathBuf::from(DEFAULT_LOG_FILE)));
        assert_eq!(cfg.logging, LoggingConfig::default());
    }

    #[test]
    fn frame_interval_follows_fps() {
        let cfg = BlinkMonitorConfig::from_toml_str("[camera]\nfps = 50.0\n").unwrap();
        assert_eq!(cfg.frame_interval(), Duration::from_millis(20));
    }

    #[test]
    fn home_directory_is_expanded() {
        let cfg = BlinkMonitorConfig::from_toml_str("[store]\npath = \"~/blinks.db\"\n").unwrap();
        assert!(!cfg.store.path.starts_with("~"));
        assert!(cfg.store.path.ends_with("blinks.db"));
    }
}
