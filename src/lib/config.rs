//! ## Splitter Configuration Module
//!
//! Defines [`SplitterConfig`], the read-only configuration shared by every mapper.
//!
//! This module handles:
//! - The ordered upstream pool list ([`PoolConfig`])
//! - Donation level and donation pool
//! - Verbosity and colored output flags
//! - Scheduler cadence (tick interval, sweep interval) and failover retries
use std::path::{Path, PathBuf};

use ext_config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::error::{SplitterError, SplitterResult};

/// Highest accepted donation level, in percent.
pub const MAX_DONATE_LEVEL: u8 = 99;

/// Configuration for the splitter.
#[derive(Debug, Deserialize, Clone)]
pub struct SplitterConfig {
    /// Upstream pools in priority order.
    pub pools: Vec<PoolConfig>,
    /// Percentage of time spent mining for the donation pool. 0 disables donation.
    #[serde(default)]
    pub donate_level: u8,
    /// Pool used by the donation strategy.
    #[serde(default)]
    pub donate_pool: Option<PoolConfig>,
    /// Logs every job and every share result.
    #[serde(default)]
    pub verbose: bool,
    /// Emphasizes slot log lines with ANSI colors.
    #[serde(default = "default_colors")]
    pub colors: bool,
    /// Identifies this proxy to upstreams.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Milliseconds between two scheduler ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Number of ticks between two idle sweeps.
    #[serde(default = "default_gc_interval_ticks")]
    pub gc_interval_ticks: u64,
    /// Connection failures tolerated on the first pool before failing over.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// The path to the log file.
    #[serde(default)]
    log_file: Option<PathBuf>,
}

fn default_colors() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_gc_interval_ticks() -> u64 {
    60
}

fn default_retries() -> u32 {
    5
}

impl SplitterConfig {
    /// Creates a config with defaults for everything but the pool list.
    pub fn new(pools: Vec<PoolConfig>) -> Self {
        Self {
            pools,
            donate_level: 0,
            donate_pool: None,
            verbose: false,
            colors: default_colors(),
            user_agent: default_user_agent(),
            tick_interval_ms: default_tick_interval_ms(),
            gc_interval_ticks: default_gc_interval_ticks(),
            retries: default_retries(),
            log_file: None,
        }
    }

    /// Loads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> SplitterResult<Self> {
        let config_path = path.to_str().ok_or_else(|| {
            SplitterError::InvalidConfig(format!("invalid config path {}", path.display()))
        })?;

        let settings = Config::builder()
            .add_source(File::new(config_path, FileFormat::Toml))
            .build()?;

        let config = settings.try_deserialize::<SplitterConfig>()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the mappers rely on.
    pub fn validate(&self) -> SplitterResult<()> {
        if self.pools.is_empty() {
            return Err(SplitterError::NoPools);
        }
        if self.donate_level > MAX_DONATE_LEVEL {
            return Err(SplitterError::InvalidConfig(format!(
                "donate_level {} exceeds {MAX_DONATE_LEVEL}",
                self.donate_level
            )));
        }
        if self.donate_level > 0 && self.donate_pool.is_none() {
            return Err(SplitterError::InvalidConfig(
                "donate_level is set but donate_pool is missing".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 || self.gc_interval_ticks == 0 {
            return Err(SplitterError::InvalidConfig(
                "tick_interval_ms and gc_interval_ticks must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Where [`crate::logging::init_logging`] should also write, if anywhere.
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

/// One upstream endpoint.
///
/// Equality is by value over every field, which is what a pool-list reload compares.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub rig_id: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub keepalive: bool,
}

fn default_password() -> String {
    "x".to_string()
}

impl PoolConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: String::new(),
            password: default_password(),
            rig_id: None,
            tls: false,
            keepalive: false,
        }
    }
}
