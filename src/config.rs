//! Typed configuration, loaded with Figment.
//!
//! Configuration merges, in order: built-in defaults, a TOML file
//! (`saxs_stream.toml` by default), and environment variables prefixed with
//! `SAXS_STREAM_` using `__` as the section separator, e.g.
//!
//! ```text
//! SAXS_STREAM_APPLICATION__LOG_LEVEL=debug
//! SAXS_STREAM_POLLER__POLL_INTERVAL=500ms
//! SAXS_STREAM_CATALOG__URI=http://tiled.beamline.lab:8000
//! ```
//!
//! Everything is validated before any task spawns; an invalid configuration
//! stops the process at startup.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::driver::notify::NotifyOptions;
use crate::driver::polling::PollerOptions;
use crate::error::{AppResult, PipelineError};
use crate::recovery::RetryPolicy;
use crate::sim::SimOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "saxs_stream.toml";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Catalog connection settings.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Polling-driver settings.
    #[serde(default)]
    pub poller: PollerConfig,
    /// Push-driver settings.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Message-channel settings.
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Reducer selection.
    #[serde(default)]
    pub reducer: ReducerConfig,
    /// Simulated-acquisition settings.
    #[serde(default)]
    pub sim: SimConfig,
}

/// Application-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used in log output.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "saxs_stream".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Catalog connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the catalog server.
    pub uri: String,
    /// API key, if the catalog requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Path of the container holding runs.
    pub root_segments: Vec<String>,
    /// Path of the frame-stream node inside each run.
    pub frame_segments: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:8000".to_string(),
            api_key: None,
            root_segments: vec!["runs".to_string()],
            frame_segments: vec![
                "primary".to_string(),
                "data".to_string(),
                "image".to_string(),
            ],
        }
    }
}

/// Polling-driver settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Time between poll cycles.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Deliver exactly this run, then exit.
    #[serde(default)]
    pub single_run_id: Option<String>,
    /// Cycles of no progress after the stop document before remaining gaps
    /// are abandoned.
    pub drain_grace_cycles: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            single_run_id: None,
            drain_grace_cycles: 3,
        }
    }
}

/// Push-driver settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Address of the notification service.
    pub address: String,
    /// Drain attempts after `run_stop` before the run closes anyway.
    pub drain_grace_cycles: u32,
    /// Pause between drain attempts.
    #[serde(with = "humantime_serde")]
    pub drain_delay: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8765".to_string(),
            drain_grace_cycles: 3,
            drain_delay: Duration::from_millis(500),
        }
    }
}

/// Message-channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Bind address for publishing raw lifecycle events.
    pub publish_address: String,
    /// Bind address for publishing derived events.
    pub derived_address: String,
    /// Broker frontend (producers connect here).
    pub broker_frontend_address: String,
    /// Broker backend (workers connect here).
    pub broker_backend_address: String,
    /// High-water mark for bounded queues; producers block beyond it.
    pub queue_depth: usize,
    /// Retry policy for sends and reconnects.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            publish_address: "127.0.0.1:5555".to_string(),
            derived_address: "127.0.0.1:5556".to_string(),
            broker_frontend_address: "127.0.0.1:5560".to_string(),
            broker_backend_address: "127.0.0.1:5561".to_string(),
            queue_depth: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Reducer selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReducerConfig {
    /// Registry name of the reducer to run.
    pub name: String,
    /// Reducer-specific parameters, passed through to its factory.
    #[serde(default = "empty_table")]
    pub params: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            name: "radial_profile".to_string(),
            params: empty_table(),
        }
    }
}

/// Simulated-acquisition settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of runs to produce.
    pub runs: u32,
    /// Frames per run.
    pub frames_per_run: u32,
    /// Time between frames.
    #[serde(with = "humantime_serde")]
    pub frame_interval: Duration,
    /// Pause between runs.
    #[serde(with = "humantime_serde")]
    pub run_pause: Duration,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        let defaults = SimOptions::default();
        Self {
            runs: defaults.runs,
            frames_per_run: defaults.frames_per_run,
            frame_interval: defaults.frame_interval,
            run_pause: defaults.run_pause,
            width: defaults.width,
            height: defaults.height,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from defaults, an optional TOML file, and the
    /// environment.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("SAXS_STREAM_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks beyond what serde can express.
    pub fn validate(&self) -> AppResult<()> {
        let fail = |message: String| Err(PipelineError::Configuration(message));
        if self.catalog.uri.is_empty() {
            return fail("catalog.uri must not be empty".to_string());
        }
        if self.catalog.frame_segments.is_empty() {
            return fail("catalog.frame_segments must name the frame node".to_string());
        }
        if self.poller.poll_interval.is_zero() {
            return fail("poller.poll_interval must be positive".to_string());
        }
        if self.channel.queue_depth == 0 {
            return fail("channel.queue_depth must be at least 1".to_string());
        }
        if self.channel.retry.max_attempts == 0 {
            return fail("channel.retry.max_attempts must be at least 1".to_string());
        }
        if self.sim.width == 0 || self.sim.height == 0 {
            return fail("sim frame dimensions must be positive".to_string());
        }
        Ok(())
    }

    /// Options for the polling driver.
    pub fn poller_options(&self) -> PollerOptions {
        PollerOptions {
            poll_interval: self.poller.poll_interval,
            single_run_id: self.poller.single_run_id.clone(),
            drain_grace_cycles: self.poller.drain_grace_cycles,
            retry: self.channel.retry.clone(),
        }
    }

    /// Options for the push driver.
    pub fn notify_options(&self) -> NotifyOptions {
        NotifyOptions {
            drain_grace_cycles: self.notify.drain_grace_cycles,
            drain_delay: self.notify.drain_delay,
            retry: self.channel.retry.clone(),
        }
    }

    /// Options for the simulated acquisition.
    pub fn sim_options(&self) -> SimOptions {
        SimOptions {
            runs: self.sim.runs,
            frames_per_run: self.sim.frames_per_run,
            frame_interval: self.sim.frame_interval,
            run_pause: self.sim.run_pause,
            width: self.sim.width,
            height: self.sim.height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reducer.name, "radial_profile");
        assert_eq!(config.poller.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[poller]
poll_interval = "250ms"

[reducer]
name = "mean_pool"
params = {{ grid = 4 }}
"#
        )
        .unwrap();
        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.poller.poll_interval, Duration::from_millis(250));
        assert_eq!(config.reducer.name, "mean_pool");
        assert_eq!(
            config.reducer.params.get("grid").and_then(toml::Value::as_integer),
            Some(4)
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.channel.queue_depth, 1024);
    }

    #[test]
    fn test_zero_poll_interval_is_fatal() {
        let mut config = PipelineConfig::default();
        config.poller.poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = PipelineConfig::load(Some(Path::new("/nonexistent/nowhere.toml"))).unwrap();
        assert_eq!(config.application.name, "saxs_stream");
    }
}
