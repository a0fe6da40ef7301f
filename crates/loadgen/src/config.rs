//! Configuration types for the load generator.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a certain base action rate should be maintained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct RatePeriod {
    /// Segment length in seconds.
    pub for_secs: u64,
    /// Target base actions per second during this segment.
    pub rate: u64,
}

impl RatePeriod {
    /// Create a new plan segment.
    pub fn new(duration: Duration, rate: u64) -> Self {
        Self {
            for_secs: duration.as_secs(),
            rate,
        }
    }

    /// Segment duration.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.for_secs)
    }
}

impl std::str::FromStr for RatePeriod {
    type Err = ConfigError;

    /// Parse `<secs>:<rate>`, e.g. `30:50`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, rate) = s
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidPlan(s.to_string()))?;
        let for_secs = secs
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPlan(s.to_string()))?;
        let rate = rate
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPlan(s.to_string()))?;
        Ok(Self { for_secs, rate })
    }
}

/// Relative weights for each protocol action.
///
/// A weight of zero disables the action entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ActionWeights {
    pub new_actor: u32,
    pub new_authorization: u32,
    pub new_certificate: u32,
    pub revoke_certificate: u32,
}

impl Default for ActionWeights {
    fn default() -> Self {
        Self {
            new_actor: 1,
            new_authorization: 3,
            new_certificate: 4,
            revoke_certificate: 2,
        }
    }
}

/// Challenge responder subprocess configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Don't start the challenge responder (one is already running elsewhere).
    pub skip: bool,

    /// Binary to launch. Defaults to the current executable.
    pub binary: Option<PathBuf>,

    /// Address the responder accepts token registrations on.
    pub rpc_addr: String,

    /// Address the responder answers HTTP-01 validation requests on.
    pub http_one_addr: String,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            skip: false,
            binary: None,
            rpc_addr: "127.0.0.1:6060".to_string(),
            http_one_addr: "0.0.0.0:5002".to_string(),
        }
    }
}

impl ChallengeConfig {
    /// Base URL for token registration requests.
    pub fn rpc_url(&self) -> String {
        format!("http://{}", self.rpc_addr)
    }
}

/// Configuration for a load generation run.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoadgenConfig {
    /// ACME directory URL of the service under test.
    pub directory_url: String,

    /// Value sent in the `X-Real-IP` header of every request.
    pub real_ip: String,

    /// Value sent in the `User-Agent` header of every request.
    pub user_agent: String,

    /// Parent domain for generated identifiers.
    pub domain_base: String,

    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Base actions per second when no run plan segment is active.
    pub rate: u64,

    /// Ordered rate segments applied from the start of dispatch.
    pub run_plan: Vec<RatePeriod>,

    /// Total dispatch duration in seconds.
    pub runtime_secs: u64,

    /// Population cap. 0 means unbounded.
    pub max_actors: usize,

    /// Population to build before dispatch begins.
    pub warmup_actors: usize,

    /// Concurrent workers used during warmup.
    pub warmup_workers: usize,

    /// Action weights for steady-state selection.
    pub weights: ActionWeights,

    /// Authorization status polls before giving up.
    pub authz_poll_attempts: u32,

    /// Delay between authorization status polls, in milliseconds.
    pub authz_poll_interval_ms: u64,

    /// Order status polls before giving up.
    pub order_poll_attempts: u32,

    /// Challenge responder settings.
    pub challenge: ChallengeConfig,

    /// Interval between progress lines, in seconds.
    pub progress_interval_secs: u64,

    /// Seed for action selection. When omitted, a time-derived seed is used.
    pub seed: Option<u64>,
}

impl Default for LoadgenConfig {
    fn default() -> Self {
        Self {
            directory_url: "https://localhost:4431/directory".to_string(),
            real_ip: "10.0.0.1".to_string(),
            user_agent: "acme-loadgen".to_string(),
            domain_base: "com".to_string(),
            request_timeout_ms: 30_000,
            rate: 1,
            run_plan: Vec::new(),
            runtime_secs: 60,
            max_actors: 0,
            warmup_actors: 0,
            warmup_workers: 1,
            weights: ActionWeights::default(),
            authz_poll_attempts: 10,
            authz_poll_interval_ms: 500,
            order_poll_attempts: 10,
            challenge: ChallengeConfig::default(),
            progress_interval_secs: 10,
            seed: None,
        }
    }
}

impl LoadgenConfig {
    /// Create a configuration targeting the given directory URL.
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Set the base rate.
    pub fn with_rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// Set the run plan.
    pub fn with_run_plan(mut self, plan: Vec<RatePeriod>) -> Self {
        self.run_plan = plan;
        self
    }

    /// Set the total runtime.
    pub fn with_runtime(mut self, runtime: Duration) -> Self {
        self.runtime_secs = runtime.as_secs();
        self
    }

    /// Set the population cap (0 = unbounded).
    pub fn with_max_actors(mut self, max: usize) -> Self {
        self.max_actors = max;
        self
    }

    /// Set the warmup target and worker count.
    pub fn with_warmup(mut self, actors: usize, workers: usize) -> Self {
        self.warmup_actors = actors;
        self.warmup_workers = workers;
        self
    }

    /// Set the action weights.
    pub fn with_weights(mut self, weights: ActionWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Skip launching the challenge responder.
    pub fn with_skip_challenge_server(mut self, skip: bool) -> Self {
        self.challenge.skip = skip;
        self
    }

    /// Set the selection seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Total dispatch duration.
    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay between authorization polls.
    pub fn authz_poll_interval(&self) -> Duration {
        Duration::from_millis(self.authz_poll_interval_ms)
    }

    /// Interval between progress lines.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }

    /// Warmup target, clamped to the population cap when one is set.
    pub fn effective_warmup_target(&self) -> usize {
        if self.max_actors > 0 {
            self.warmup_actors.min(self.max_actors)
        } else {
            self.warmup_actors
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if let Some(p) = self.run_plan.iter().find(|p| p.rate == 0) {
            return Err(ConfigError::InvalidPlan(format!(
                "{}:{} has a zero rate",
                p.for_secs, p.rate
            )));
        }
        if self.warmup_actors > 0 && self.warmup_workers == 0 {
            return Err(ConfigError::NoWarmupWorkers);
        }
        if self.directory_url.is_empty() {
            return Err(ConfigError::MissingDirectory);
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Base rate must be positive")]
    ZeroRate,

    #[error("Invalid run plan segment: {0} (expected <secs>:<rate>)")]
    InvalidPlan(String),

    #[error("Warmup requested with zero workers")]
    NoWarmupWorkers,

    #[error("Directory URL is required")]
    MissingDirectory,

    #[error("Failed to read {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
