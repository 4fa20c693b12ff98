use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_FILE_NAMES: &[&str] = &["simfleet.toml", ".simfleetrc"];

/// Tunables for the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorConfig {
    pub max_instances: usize,

    /// Seconds between engine ticks, passed to each child unmodified.
    pub default_tick_interval: f64,

    /// Ticks between snapshot dumps, passed to each child unmodified.
    pub default_snapshot_period: u32,

    #[serde(with = "duration_secs")]
    pub data_collection_interval: Duration,

    pub port_range_start: u16,

    /// Parent of every instance's private data directory.
    pub base_data_dir: PathBuf,

    pub engine_program: String,

    pub engine_args: Vec<String>,

    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,

    /// Number of recent structured log entries pulled per instance per collection cycle.
    pub collection_log_limit: usize,

    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            default_tick_interval: 1.0,
            default_snapshot_period: 10,
            data_collection_interval: Duration::from_secs(5),
            port_range_start: 8100,
            base_data_dir: PathBuf::from("instances"),
            engine_program: "simulation-engine".to_string(),
            engine_args: Vec::new(),
            stop_timeout: Duration::from_secs(5),
            collection_log_limit: 10,
            monitor_interval: Duration::from_millis(500),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults, then the discovered config file, then `SIMFLEET_*` environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let file = match explicit {
            Some(path) => Some((FleetFile::load(path)?, path.to_path_buf())),
            None => FleetFile::discover()?,
        };
        if let Some((file, path)) = file {
            config.apply_file(&file, &path.display().to_string())?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: &FleetFile, source_name: &str) -> Result<()> {
        if let Some(max) = file.max_instances {
            self.max_instances = max;
        }
        if let Some(interval) = file.tick_interval {
            self.default_tick_interval = interval;
        }
        if let Some(period) = file.snapshot_period {
            self.default_snapshot_period = period;
        }
        if let Some(secs) = file.collection_interval_secs {
            self.data_collection_interval = secs_to_duration(secs, source_name, "collection_interval_secs")?;
        }
        if let Some(port) = file.port_range_start {
            self.port_range_start = port;
        }
        if let Some(dir) = &file.data_dir {
            self.base_data_dir = dir.clone();
        }
        if let Some(engine) = &file.engine {
            self.set_engine_command(engine, source_name)?;
        }
        if let Some(secs) = file.stop_timeout_secs {
            self.stop_timeout = secs_to_duration(secs, source_name, "stop_timeout_secs")?;
        }
        if let Some(limit) = file.log_limit {
            self.collection_log_limit = limit;
        }
        Ok(())
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("SIMFLEET_DATA_DIR") {
            self.base_data_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("SIMFLEET_PORT_START") {
            self.port_range_start = port
                .trim()
                .parse()
                .map_err(|e| Error::config("SIMFLEET_PORT_START", format!("{port:?}: {e}")))?;
        }
        if let Some(max) = lookup("SIMFLEET_MAX_INSTANCES") {
            self.max_instances = max
                .trim()
                .parse()
                .map_err(|e| Error::config("SIMFLEET_MAX_INSTANCES", format!("{max:?}: {e}")))?;
        }
        if let Some(engine) = lookup("SIMFLEET_ENGINE") {
            self.set_engine_command(&engine, "SIMFLEET_ENGINE")?;
        }
        Ok(())
    }

    /// Splits a shell-style command string into the engine program and its leading args.
    pub fn set_engine_command(&mut self, command: &str, source_name: &str) -> Result<()> {
        let mut words = shell_words::split(command)
            .map_err(|e| Error::config(source_name, format!("engine command: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| Error::config(source_name, "engine command is empty"))?;
        self.engine_program = program;
        self.engine_args = words.collect();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_instances == 0 {
            return Err(Error::config("config", "max_instances must be at least 1"));
        }
        if self.port_range_start == 0 {
            return Err(Error::config("config", "port_range_start must be non-zero"));
        }
        if !(self.default_tick_interval.is_finite() && self.default_tick_interval > 0.0) {
            return Err(Error::config("config", "tick_interval must be positive"));
        }
        if self.data_collection_interval.is_zero() {
            return Err(Error::config("config", "collection interval must be positive"));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> String {
        let file = FleetFile {
            max_instances: Some(self.max_instances),
            tick_interval: Some(self.default_tick_interval),
            snapshot_period: Some(self.default_snapshot_period),
            collection_interval_secs: Some(self.data_collection_interval.as_secs_f64()),
            port_range_start: Some(self.port_range_start),
            data_dir: Some(self.base_data_dir.clone()),
            engine: Some(shell_words::join(
                std::iter::once(self.engine_program.as_str())
                    .chain(self.engine_args.iter().map(String::as_str)),
            )),
            stop_timeout_secs: Some(self.stop_timeout.as_secs_f64()),
            log_limit: Some(self.collection_log_limit),
        };
        toml::to_string(&file).unwrap_or_default()
    }
}

/// Fleet configuration loaded from `simfleet.toml` or `.simfleetrc`.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetFile {
    pub max_instances: Option<usize>,
    pub tick_interval: Option<f64>,
    pub snapshot_period: Option<u32>,
    pub collection_interval_secs: Option<f64>,
    pub port_range_start: Option<u16>,
    pub data_dir: Option<PathBuf>,
    /// Engine command line, e.g. `"python3 run_simulation.py"`.
    pub engine: Option<String>,
    pub stop_timeout_secs: Option<f64>,
    pub log_limit: Option<usize>,
}

impl FleetFile {
    /// Search the current directory and its ancestors for a config file.
    pub fn discover() -> Result<Option<(Self, PathBuf)>> {
        let Ok(cwd) = std::env::current_dir() else {
            return Ok(None);
        };
        match Self::find_in(&cwd) {
            Some(path) => Ok(Some((Self::load(&path)?, path))),
            None => Ok(None),
        }
    }

    pub fn find_in(start: &Path) -> Option<PathBuf> {
        for dir in start.ancestors() {
            for name in CONFIG_FILE_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| Error::config(path.display().to_string(), e.to_string()))
    }
}

fn secs_to_duration(secs: f64, source_name: &str, key: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::config(source_name, format!("{key} = {secs}: {e}")))
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
