//! Engine configuration.
//!
//! Settings come from an optional YAML or JSON file and are then
//! overridden by environment variables:
//!
//! - `PIPEWRIGHT_BUDGET_PER_RUN`, `PIPEWRIGHT_BUDGET_DAILY`,
//!   `PIPEWRIGHT_BUDGET_MONTHLY`: spend ceilings in dollars
//! - `PIPEWRIGHT_MANIFEST_DIR`: where run manifests are written
//! - `PIPEWRIGHT_CACHE_DIR`: enables the file cache in this directory
//! - `PIPEWRIGHT_COST_LEDGER`: path of the spend ledger
//! - `PIPEWRIGHT_RATE_<SERVICE>_PER_MINUTE`, `..._PER_HOUR`, `..._PER_DAY`:
//!   call limits for a service; the service name is lowercased

use crate::cache::{FileCache, MemoryCache, SharedCache};
use crate::definition::BackoffSettings;
use crate::errors::ConfigError;
use crate::limits::{Budgets, CostTracker, RateLimiter, ServiceLimits};
use crate::worker::Services;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "PIPEWRIGHT_";
const RATE_PREFIX: &str = "PIPEWRIGHT_RATE_";

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_workers_per_queue() -> usize {
    1
}

fn default_cache_ttl_secs() -> Option<u64> {
    Some(7 * 24 * 3600)
}

fn default_state_attempts() -> u32 {
    3
}

/// Stage result cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Directory for the file cache; the in-memory cache is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Entry lifetime in seconds; `None` keeps entries forever.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheSettings {
    /// Entry lifetime.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// State-machine mode settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineSettings {
    /// Attempts per state before the run fails.
    #[serde(default = "default_state_attempts")]
    pub max_attempts: u32,
    /// State name → agent name overrides.
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
}

impl Default for StateMachineSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_state_attempts(),
            agents: BTreeMap::new(),
        }
    }
}

/// Process-wide engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for run manifests.
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
    /// Cache settings.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Spend ceilings.
    #[serde(default)]
    pub budgets: Budgets,
    /// Call limits per external service.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, ServiceLimits>,
    /// Backoff used where the pipeline does not set one.
    #[serde(default)]
    pub backoff: BackoffSettings,
    /// Time allowed for in-flight jobs on shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Worker tasks per queue.
    #[serde(default = "default_workers_per_queue")]
    pub workers_per_queue: usize,
    /// Spend ledger persisted across runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    /// State-machine mode settings.
    #[serde(default)]
    pub state_machine: StateMachineSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
            cache: CacheSettings::default(),
            budgets: Budgets::default(),
            rate_limits: BTreeMap::new(),
            backoff: BackoffSettings::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            workers_per_queue: default_workers_per_queue(),
            ledger_path: None,
            state_machine: StateMachineSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a YAML or JSON file; `.json` files are parsed as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the optional file, then applies the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unreadable files or invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env_overrides(std::env::vars())
    }

    /// Applies `PIPEWRIGHT_*` overrides from the given variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unparseable values.
    pub fn with_env_overrides<I>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "BUDGET_PER_RUN" => self.budgets.per_run = Some(parse_env_value(&value, &key)?),
                "BUDGET_DAILY" => self.budgets.daily = Some(parse_env_value(&value, &key)?),
                "BUDGET_MONTHLY" => self.budgets.monthly = Some(parse_env_value(&value, &key)?),
                "MANIFEST_DIR" => self.manifest_dir = PathBuf::from(value),
                "CACHE_DIR" => self.cache.dir = Some(PathBuf::from(value)),
                "COST_LEDGER" => self.ledger_path = Some(PathBuf::from(value)),
                _ if key.starts_with(RATE_PREFIX) => self.apply_rate_override(&key, &value)?,
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    fn apply_rate_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let rest = &key[RATE_PREFIX.len()..];
        let (service, window) = ["_PER_MINUTE", "_PER_HOUR", "_PER_DAY"]
            .iter()
            .find_map(|suffix| rest.strip_suffix(suffix).map(|service| (service, *suffix)))
            .ok_or_else(|| ConfigError::Invalid(format!("Unrecognized rate limit variable {key}")))?;
        if service.is_empty() {
            return Err(ConfigError::Invalid(format!("{key} names no service")));
        }

        let limit: u32 = parse_env_value(value, key)?;
        let limits = self.rate_limits.entry(service.to_lowercase()).or_default();
        match window {
            "_PER_MINUTE" => limits.per_minute = Some(limit),
            "_PER_HOUR" => limits.per_hour = Some(limit),
            _ => limits.per_day = Some(limit),
        }
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let budgets = [
            ("per_run", self.budgets.per_run),
            ("daily", self.budgets.daily),
            ("monthly", self.budgets.monthly),
        ];
        for (name, limit) in budgets {
            if let Some(limit) = limit {
                if !limit.is_finite() || limit < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "Budget {name} must be a non-negative number, got {limit}"
                    )));
                }
            }
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.workers_per_queue == 0 {
            return Err(ConfigError::Invalid(
                "workers_per_queue must be greater than 0".to_string(),
            ));
        }
        if self.state_machine.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "state_machine.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff base delay {}ms exceeds cap {}ms",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Shutdown timeout as a duration.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Builds the rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::with_limits(&self.rate_limits)
    }

    /// Builds the configured cache backend.
    #[must_use]
    pub fn cache(&self) -> SharedCache {
        match &self.cache.dir {
            Some(dir) => Arc::new(FileCache::new(dir)),
            None => Arc::new(MemoryCache::new()),
        }
    }

    /// Builds the shared services.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the cost ledger cannot be read.
    pub fn services(&self) -> Result<Services, ConfigError> {
        let cost_tracker = match &self.ledger_path {
            Some(path) => {
                CostTracker::with_ledger(path).map_err(|e| ConfigError::Invalid(e.to_string()))?
            }
            None => CostTracker::new(),
        };
        Ok(Services {
            cache: self.cache(),
            rate_limiter: Arc::new(self.rate_limiter()),
            cost_tracker: Arc::new(cost_tracker),
        })
    }
}

fn parse_env_value<T>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{key}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.manifest_dir, PathBuf::from("runs"));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.backoff.base_delay_ms, 1000);
        assert_eq!(config.state_machine.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default()
            .with_env_overrides(vars(&[
                ("PIPEWRIGHT_BUDGET_PER_RUN", "2.5"),
                ("PIPEWRIGHT_BUDGET_DAILY", "10"),
                ("PIPEWRIGHT_MANIFEST_DIR", "/tmp/runs"),
                ("PIPEWRIGHT_CACHE_DIR", "/tmp/cache"),
                ("PIPEWRIGHT_RATE_OPENAI_PER_MINUTE", "60"),
                ("PIPEWRIGHT_RATE_OPENAI_PER_DAY", "1000"),
                ("PIPEWRIGHT_RATE_IMAGE_GEN_PER_HOUR", "20"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.budgets.per_run, Some(2.5));
        assert_eq!(config.budgets.daily, Some(10.0));
        assert_eq!(config.budgets.monthly, None);
        assert_eq!(config.manifest_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.cache.dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(
            config.rate_limits["openai"],
            ServiceLimits::default().per_minute(60).per_day(1000)
        );
        assert_eq!(config.rate_limits["image_gen"].per_hour, Some(20));
    }

    #[test]
    fn test_invalid_env_values() {
        let err = EngineConfig::default()
            .with_env_overrides(vars(&[("PIPEWRIGHT_BUDGET_DAILY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("PIPEWRIGHT_BUDGET_DAILY")));

        assert!(EngineConfig::default()
            .with_env_overrides(vars(&[("PIPEWRIGHT_BUDGET_DAILY", "-1")]))
            .is_err());
        assert!(EngineConfig::default()
            .with_env_overrides(vars(&[("PIPEWRIGHT_RATE_OPENAI_PER_WEEK", "5")]))
            .is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(
            &path,
            r"
manifest_dir: out/runs
budgets:
  per_run: 5
  monthly: 200
rate_limits:
  openai:
    per_minute: 30
cache:
  dir: out/cache
  ttl_secs: 60
state_machine:
  max_attempts: 5
  agents:
    POLISH: editor
",
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.manifest_dir, PathBuf::from("out/runs"));
        assert_eq!(config.budgets.per_run, Some(5.0));
        assert_eq!(config.rate_limits["openai"].per_minute, Some(30));
        assert_eq!(config.cache.ttl(), Some(Duration::from_secs(60)));
        assert_eq!(config.state_machine.agents["POLISH"], "editor");
        assert_eq!(config.shutdown_timeout_ms, 30_000);
    }

    #[test]
    fn test_from_json_file_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"workers_per_queue": 2}"#).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap().workers_per_queue, 2);

        std::fs::write(&path, r#"{"workers_per_queue": 0}"#).unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            EngineConfig::from_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
