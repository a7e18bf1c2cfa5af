//! Startup configuration for the pipeline, the climbers and the coordinator.
//!
//! Values come from a JSON document, from `SHOTGUN_*` environment variables,
//! or both (environment overrides file). Every field has a default, so a
//! partial document is fine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config_error;
use crate::errors::{SgError, SgResult};

/// Which result cache backend the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// Bounded in-memory least-recently-used cache.
    #[default]
    Lru,
    /// Memoization disabled.
    Noop,
}

impl FromStr for CacheBackend {
    type Err = SgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "noop" | "none" => Ok(Self::Noop),
            other => Err(config_error!("unknown cache backend: {other}")),
        }
    }
}

/// Evaluation pipeline sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Result cache capacity before LRU eviction.
    pub max_cache_size: usize,
    /// Number of evaluator worker threads.
    pub evaluator_threads: usize,
    /// Result queue capacity.
    pub result_ring_size: usize,
    /// Request queue capacity.
    pub request_ring_size: usize,
    pub cache_backend: CacheBackend,
    /// Per-request timeout. `None` waits for the evaluator indefinitely.
    pub request_timeout_ms: Option<u64>,
    /// Longest a submitter blocks on a full request queue. `None` blocks
    /// until space frees up or the pipeline shuts down.
    pub submit_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 1 << 20,
            evaluator_threads: 8,
            result_ring_size: 1 << 20,
            request_ring_size: 1 << 20,
            cache_backend: CacheBackend::Lru,
            request_timeout_ms: None,
            submit_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> SgResult<()> {
        if self.evaluator_threads == 0 {
            return Err(config_error!("evaluator_threads must be at least 1"));
        }
        if self.request_ring_size == 0 {
            return Err(config_error!("request_ring_size must be at least 1"));
        }
        if self.result_ring_size == 0 {
            return Err(config_error!("result_ring_size must be at least 1"));
        }
        Ok(())
    }
}

/// Hill-climbing parameters shared by every climber of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClimberConfig {
    /// Candidates submitted per iteration.
    pub flood_batch_size: usize,
    /// Initial step, as a fraction of each dimension's range.
    pub initial_step: f64,
    /// A climber converges once its step fraction falls below this.
    pub min_step: f64,
    /// Step multiplier applied after a non-improving iteration.
    pub shrink_factor: f64,
    /// Minimum objective gain that counts as an improvement.
    pub tolerance: f64,
    /// Safety cap on iterations per climber.
    pub max_iterations: u64,
}

impl Default for ClimberConfig {
    fn default() -> Self {
        Self {
            flood_batch_size: 100,
            initial_step: 0.1,
            min_step: 1e-4,
            shrink_factor: 0.5,
            tolerance: 1e-9,
            max_iterations: 10_000,
        }
    }
}

impl ClimberConfig {
    pub fn validate(&self) -> SgResult<()> {
        if self.flood_batch_size == 0 {
            return Err(config_error!("flood_batch_size must be at least 1"));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(config_error!(
                "shrink_factor must be in (0, 1), got {}",
                self.shrink_factor
            ));
        }
        if !(self.min_step > 0.0 && self.min_step <= self.initial_step) {
            return Err(config_error!(
                "min_step must be in (0, initial_step], got {} with initial_step {}",
                self.min_step,
                self.initial_step
            ));
        }
        if !(self.tolerance >= 0.0) {
            return Err(config_error!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            ));
        }
        if self.max_iterations == 0 {
            return Err(config_error!("max_iterations must be at least 1"));
        }
        Ok(())
    }
}

/// Top-level configuration for an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub pipeline: PipelineConfig,
    pub climber: ClimberConfig,
    /// Number of concurrent climbers.
    pub num_shotgun_climbers: usize,
    /// Base RNG seed; climber `i` uses `seed + i`. Random when absent.
    pub seed: Option<u64>,
    /// Cancel the run after this long and report the best point so far.
    pub max_run_time_ms: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            climber: ClimberConfig::default(),
            num_shotgun_climbers: 6,
            seed: None,
            max_run_time_ms: None,
        }
    }
}

impl OptimizerConfig {
    pub fn from_json_str(json: &str) -> SgResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SgResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Defaults overridden by `SHOTGUN_*` environment variables.
    pub fn from_env() -> SgResult<Self> {
        Self::default().apply_env()
    }

    pub fn apply_env(self) -> SgResult<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(mut self, lookup: F) -> SgResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let p = &mut self.pipeline;
        override_with(&lookup, "SHOTGUN_MAX_CACHE_SIZE", &mut p.max_cache_size)?;
        override_with(&lookup, "SHOTGUN_EVALUATOR_THREADS", &mut p.evaluator_threads)?;
        override_with(&lookup, "SHOTGUN_RESULT_RING_SIZE", &mut p.result_ring_size)?;
        override_with(&lookup, "SHOTGUN_REQUEST_RING_SIZE", &mut p.request_ring_size)?;
        override_with(&lookup, "SHOTGUN_CACHE_BACKEND", &mut p.cache_backend)?;
        override_optional(&lookup, "SHOTGUN_REQUEST_TIMEOUT_MS", &mut p.request_timeout_ms)?;
        override_optional(&lookup, "SHOTGUN_SUBMIT_TIMEOUT_MS", &mut p.submit_timeout_ms)?;

        let c = &mut self.climber;
        override_with(&lookup, "SHOTGUN_FLOOD_BATCH_SIZE", &mut c.flood_batch_size)?;
        override_with(&lookup, "SHOTGUN_INITIAL_STEP", &mut c.initial_step)?;
        override_with(&lookup, "SHOTGUN_MIN_STEP", &mut c.min_step)?;
        override_with(&lookup, "SHOTGUN_SHRINK_FACTOR", &mut c.shrink_factor)?;
        override_with(&lookup, "SHOTGUN_TOLERANCE", &mut c.tolerance)?;
        override_with(&lookup, "SHOTGUN_MAX_ITERATIONS", &mut c.max_iterations)?;

        override_with(&lookup, "SHOTGUN_CLIMBERS", &mut self.num_shotgun_climbers)?;
        override_optional(&lookup, "SHOTGUN_SEED", &mut self.seed)?;
        override_optional(&lookup, "SHOTGUN_MAX_RUN_TIME_MS", &mut self.max_run_time_ms)?;
        Ok(self)
    }

    pub fn with_climbers(mut self, n: usize) -> Self {
        self.num_shotgun_climbers = n;
        self
    }

    pub fn with_evaluator_threads(mut self, n: usize) -> Self {
        self.pipeline.evaluator_threads = n;
        self
    }

    pub fn with_flood_batch_size(mut self, n: usize) -> Self {
        self.climber.flood_batch_size = n;
        self
    }

    pub fn with_cache(mut self, backend: CacheBackend, max_cache_size: usize) -> Self {
        self.pipeline.cache_backend = backend;
        self.pipeline.max_cache_size = max_cache_size;
        self
    }

    pub fn with_ring_sizes(mut self, request: usize, result: usize) -> Self {
        self.pipeline.request_ring_size = request;
        self.pipeline.result_ring_size = result;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_run_time(mut self, limit: Duration) -> Self {
        self.max_run_time_ms = Some(limit.as_millis() as u64);
        self
    }

    pub fn max_run_time(&self) -> Option<Duration> {
        self.max_run_time_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> SgResult<()> {
        self.pipeline.validate()?;
        self.climber.validate()?;
        if self.num_shotgun_climbers == 0 {
            return Err(config_error!("num_shotgun_climbers must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, raw: &str) -> SgResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| config_error!("invalid value for {name}: {raw:?} ({e})"))
}

fn override_with<F, T>(lookup: &F, name: &str, slot: &mut T) -> SgResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_var(name, &raw)?;
    }
    Ok(())
}

fn override_optional<F, T>(lookup: &F, name: &str, slot: &mut Option<T>) -> SgResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = Some(parse_var(name, &raw)?);
    }
    Ok(())
}
