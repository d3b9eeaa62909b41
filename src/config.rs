use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::filter::MAX_SPREAD;

/// Lines between cancellation checks and progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 1000;

/// Workers added on top of the available parallelism for filter passes.
pub const EXTRA_FILTER_WORKERS: usize = 2;

/// Capacity of the per-view observer channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Configuration for the filtering engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound for spread-before/behind counts
    pub max_spread: usize,
    /// Cadence, in lines, of cancellation checks and progress reports
    pub progress_interval: usize,
    /// Size of the parallel filter worker pool
    pub worker_count: usize,
    /// Whether bulk filter passes use the worker pool
    pub parallel_filter: bool,
    /// Row height used when a line has no override
    pub default_row_height: u32,
    /// Amount a row grows or shrinks per height change
    pub row_height_step: u32,
    /// Capacity of the view observer channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_spread: MAX_SPREAD,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            worker_count: default_worker_count(),
            parallel_filter: true,
            default_row_height: 1,
            row_height_step: 1,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        + EXTRA_FILTER_WORKERS
}

/// On-disk shape of the config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    max_spread: Option<usize>,
    progress_interval: Option<usize>,
    worker_count: Option<usize>,
    parallel_filter: Option<bool>,
    default_row_height: Option<u32>,
    row_height_step: Option<u32>,
    event_buffer: Option<usize>,
}

impl EngineConfig {
    /// Defaults overridden by `BARK_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Defaults, then the user config file (if any), then the environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = Self::default_path() {
            if path.exists() {
                config = Self::from_file(&path)?;
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Location of the user config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("barkview").join("config.toml"))
    }

    /// Read a TOML config file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text).map_err(|reason| EngineError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn from_toml(text: &str) -> std::result::Result<Self, String> {
        let file: FileConfig = toml::from_str(text).map_err(|e| e.to_string())?;
        let mut config = Self::default();
        if let Some(v) = file.max_spread {
            config.max_spread = v;
        }
        if let Some(v) = file.progress_interval {
            config.progress_interval = v;
        }
        if let Some(v) = file.worker_count {
            config.worker_count = v;
        }
        if let Some(v) = file.parallel_filter {
            config.parallel_filter = v;
        }
        if let Some(v) = file.default_row_height {
            config.default_row_height = v;
        }
        if let Some(v) = file.row_height_step {
            config.row_height_step = v;
        }
        if let Some(v) = file.event_buffer {
            config.event_buffer = v;
        }
        Ok(config.sanitized())
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var(&lookup, "BARK_MAX_SPREAD") {
            self.max_spread = v;
        }
        if let Some(v) = parse_var(&lookup, "BARK_PROGRESS_INTERVAL") {
            self.progress_interval = v;
        }
        if let Some(v) = parse_var(&lookup, "BARK_WORKERS") {
            self.worker_count = v;
        }
        if let Some(v) = parse_var(&lookup, "BARK_PARALLEL_FILTER") {
            self.parallel_filter = v;
        }
        *self = self.clone().sanitized();
    }

    /// Replace out-of-range values with defaults.
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_spread == 0 || self.max_spread > MAX_SPREAD {
            warn!(max_spread = self.max_spread, "max_spread out of range, using default");
            self.max_spread = defaults.max_spread;
        }
        if self.progress_interval == 0 {
            warn!("progress_interval must be positive, using default");
            self.progress_interval = defaults.progress_interval;
        }
        if self.worker_count == 0 {
            warn!("worker_count must be positive, using default");
            self.worker_count = defaults.worker_count;
        }
        if self.default_row_height == 0 {
            self.default_row_height = defaults.default_row_height;
        }
        if self.row_height_step == 0 {
            self.row_height_step = defaults.row_height_step;
        }
        if self.event_buffer == 0 {
            self.event_buffer = defaults.event_buffer;
        }
        self
    }

    /// Cap of the recent-context window used for spread deduplication
    pub fn context_window_cap(&self) -> usize {
        self.max_spread * 2
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_spread, 99);
        assert_eq!(config.progress_interval, 1000);
        assert!(config.worker_count > EXTRA_FILTER_WORKERS);
        assert_eq!(config.context_window_cap(), 198);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BARK_MAX_SPREAD", "10"),
            ("BARK_WORKERS", "3"),
            ("BARK_PARALLEL_FILTER", "false"),
            ("BARK_PROGRESS_INTERVAL", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_spread, 10);
        assert_eq!(config.worker_count, 3);
        assert!(!config.parallel_filter);
        assert_eq!(config.progress_interval, DEFAULT_PROGRESS_INTERVAL);
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let config = EngineConfig::from_toml("max_spread = 5000\nworker_count = 0\n").unwrap();
        assert_eq!(config.max_spread, MAX_SPREAD);
        assert_eq!(config.worker_count, EngineConfig::default().worker_count);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "progress_interval = 250").unwrap();
        writeln!(file, "parallel_filter = false").unwrap();
        writeln!(file, "row_height_step = 4").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.progress_interval, 250);
        assert!(!config.parallel_filter);
        assert_eq!(config.row_height_step, 4);
        assert_eq!(config.max_spread, MAX_SPREAD);
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_spread = \"lots\"").unwrap();
        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }
}
