//! Daemon configuration.
//!
//! All knobs are read once at startup from a TOML file; changing them
//! requires a restart. Unset keys fall back to the defaults below, so an
//! empty file (or no file at all) yields a fully working configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::resource::{ApplyType, PermissionClass, Policy, ValueUnit};

// Maximum size for a config file (1 MB).
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cap on requests concurrently active across all clients.
    pub max_concurrent_requests: usize,
    /// Cap on resource triples carried by a single request.
    pub max_resources_per_request: usize,
    /// Longest duration a request may ask for, in milliseconds.
    pub max_request_duration_ms: i64,
    /// Duration substituted when a request asks for 0 ms.
    pub default_request_duration_ms: i64,
    /// Bound on requests parked in the queue awaiting the consumer.
    pub request_queue_capacity: usize,
    /// Period of the client liveness sweep.
    pub pulse_duration_ms: u64,
    /// Period of the dead-client cleanup sweep. Kept coprime with the pulse
    /// period so the two sweeps do not synchronize.
    pub garbage_collection_duration_ms: u64,
    /// Dead clients cleaned per garbage collection tick.
    pub garbage_collection_batch_cap: usize,
    /// Two requests from one thread closer together than this are penalized.
    pub rate_limiter_delta_ms: i64,
    /// Health subtracted per penalized request.
    pub penalty_factor: f64,
    /// Health restored per well-spaced request, capped at 100.
    pub reward_factor: f64,
    /// Prefix prepended to every resource path. Kept at "/" in production;
    /// tests point it at a scratch directory.
    pub sysfs_root: PathBuf,
    /// Cgroup ids addressable by cgroup-level resources.
    pub cgroup_ids: Vec<u32>,
    /// Static resource catalog for the daemon binary.
    #[serde(rename = "resource")]
    pub resources: Vec<ResourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 64,
            max_resources_per_request: 16,
            max_request_duration_ms: 86_400_000,
            default_request_duration_ms: 5_000,
            request_queue_capacity: 256,
            pulse_duration_ms: 60_000,
            garbage_collection_duration_ms: 83_000,
            garbage_collection_batch_cap: 8,
            rate_limiter_delta_ms: 5,
            penalty_factor: 2.0,
            reward_factor: 0.4,
            sysfs_root: PathBuf::from("/"),
            cgroup_ids: Vec::new(),
            resources: Vec::new(),
        }
    }
}

/// One `[[resource]]` table in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub code: u32,
    /// Path template relative to `sysfs_root`; `{}` is replaced by the
    /// physical core, cluster or cgroup id for non-global resources.
    pub path: String,
    pub low: i32,
    pub high: i32,
    #[serde(default)]
    pub permissions: PermissionClass,
    /// Bitmap of device modes (display on, doze, ...) under which the
    /// resource may be provisioned.
    #[serde(default)]
    pub modes: u8,
    #[serde(default)]
    pub apply_type: ApplyType,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub unit: ValueUnit,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::parse_file(p)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn parse_file(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
        if metadata.len() > MAX_CONFIG_SIZE {
            bail!(
                "Config file {} exceeds the {} byte limit",
                path.display(),
                MAX_CONFIG_SIZE
            );
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            bail!("max_concurrent_requests must be positive");
        }
        if self.max_resources_per_request == 0 {
            bail!("max_resources_per_request must be positive");
        }
        if self.max_request_duration_ms <= 0 || self.default_request_duration_ms <= 0 {
            bail!("request durations must be positive");
        }
        if self.default_request_duration_ms > self.max_request_duration_ms {
            bail!("default_request_duration_ms exceeds max_request_duration_ms");
        }
        if self.request_queue_capacity == 0 {
            bail!("request_queue_capacity must be positive");
        }
        if self.pulse_duration_ms == 0 || self.garbage_collection_duration_ms == 0 {
            bail!("pulse and garbage collection periods must be positive");
        }
        if self.garbage_collection_batch_cap == 0 {
            bail!("garbage_collection_batch_cap must be positive");
        }
        if self.rate_limiter_delta_ms < 0 {
            bail!("rate_limiter_delta_ms must be non-negative");
        }
        if self.penalty_factor <= 0.0 || self.reward_factor <= 0.0 {
            bail!("penalty_factor and reward_factor must be positive");
        }
        for res in &self.resources {
            if res.low > res.high {
                bail!(
                    "resource {:#010x} has inverted bounds [{}, {}]",
                    res.code,
                    res.low,
                    res.high
                );
            }
            if res.path.is_empty() {
                bail!("resource {:#010x} has an empty path", res.code);
            }
        }
        Ok(())
    }
}
