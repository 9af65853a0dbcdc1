//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Work scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of item operations running at once (0 is treated as 1)
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: u32,
    /// Minimum interval between progress emissions, in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_max_concurrent_operations() -> u32 {
    3
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl SchedulerConfig {
    /// Operation cap with the zero case clamped to a single worker.
    pub fn effective_max_concurrent_operations(&self) -> usize {
        self.max_concurrent_operations.max(1) as usize
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent_operations(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// Memoization cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Root directory holding one sub-directory per cache namespace
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Minimum interval between write-backs, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Schema version of the codec capability cache
    #[serde(default = "default_capability_version")]
    pub capability_version: u32,
    /// Schema version of the transcode outcome cache
    #[serde(default = "default_outcome_version")]
    pub outcome_version: u32,
    /// Schema version of the resource statistics cache
    #[serde(default = "default_resource_stats_version")]
    pub resource_stats_version: u32,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".hevc-sweep/cache")
}

// Below the time a suspended host gives us before it stops, so the last
// write-back lands before shutdown.
fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_capability_version() -> u32 {
    3
}

fn default_outcome_version() -> u32 {
    4
}

fn default_resource_stats_version() -> u32 {
    3
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            flush_interval_ms: default_flush_interval_ms(),
            capability_version: default_capability_version(),
            outcome_version: default_outcome_version(),
            resource_stats_version: default_resource_stats_version(),
        }
    }
}

/// Network class assumed for hosts without a reachability probe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssumedNetwork {
    Unmetered,
    Metered,
    Offline,
}

impl Default for AssumedNetwork {
    fn default() -> Self {
        Self::Unmetered
    }
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Only admit work on an unmetered network (default true)
    #[serde(default = "default_true")]
    pub require_unmetered_network: bool,
    /// Only admit work while on external power (default true)
    #[serde(default = "default_true")]
    pub require_external_power: bool,
    /// Network class reported by the host signal source
    #[serde(default)]
    pub network: AssumedNetwork,
    /// Interval between device signal polls, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            require_unmetered_network: true,
            require_external_power: true,
            network: AssumedNetwork::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Directory receiving transcoded outputs
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory receiving staged copies of the sources
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// x265 constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// x265 preset name
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Savings ratio an output must exceed to be worth applying
    #[serde(default = "default_min_savings_ratio")]
    pub min_savings_ratio: f32,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".hevc-sweep/transcoded")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(".hevc-sweep/staging")
}

fn default_crf() -> u8 {
    28
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_min_savings_ratio() -> f32 {
    0.05
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            staging_dir: default_staging_dir(),
            crf: default_crf(),
            preset: default_preset(),
            min_savings_ratio: default_min_savings_ratio(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SCHEDULER_MAX_CONCURRENT_OPERATIONS -> scheduler.max_concurrent_operations
    /// - SCHEDULER_PROGRESS_INTERVAL_MS -> scheduler.progress_interval_ms
    /// - CACHE_DIR -> cache.dir
    /// - CACHE_FLUSH_INTERVAL_MS -> cache.flush_interval_ms
    /// - ADMISSION_REQUIRE_UNMETERED_NETWORK -> admission.require_unmetered_network
    /// - ADMISSION_REQUIRE_EXTERNAL_POWER -> admission.require_external_power
    /// - ENCODE_CRF -> encode.crf
    pub fn apply_env_overrides(&mut self) {
        if let Some(ops) = env_parsed::<u32>("SCHEDULER_MAX_CONCURRENT_OPERATIONS") {
            self.scheduler.max_concurrent_operations = ops;
        }

        if let Some(ms) = env_parsed::<u64>("SCHEDULER_PROGRESS_INTERVAL_MS") {
            self.scheduler.progress_interval_ms = ms;
        }

        if let Ok(dir) = env::var("CACHE_DIR") {
            if !dir.is_empty() {
                self.cache.dir = PathBuf::from(dir);
            }
        }

        if let Some(ms) = env_parsed::<u64>("CACHE_FLUSH_INTERVAL_MS") {
            self.cache.flush_interval_ms = ms;
        }

        if let Some(flag) = env_flag("ADMISSION_REQUIRE_UNMETERED_NETWORK") {
            self.admission.require_unmetered_network = flag;
        }

        if let Some(flag) = env_flag("ADMISSION_REQUIRE_EXTERNAL_POWER") {
            self.admission.require_external_power = flag;
        }

        if let Some(crf) = env_parsed::<u8>("ENCODE_CRF") {
            self.encode.crf = crf;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

/// Accepts "true", "1", "yes" as true and "false", "0", "no" as false.
fn env_flag(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("SCHEDULER_MAX_CONCURRENT_OPERATIONS");
        env::remove_var("SCHEDULER_PROGRESS_INTERVAL_MS");
        env::remove_var("CACHE_DIR");
        env::remove_var("CACHE_FLUSH_INTERVAL_MS");
        env::remove_var("ADMISSION_REQUIRE_UNMETERED_NETWORK");
        env::remove_var("ADMISSION_REQUIRE_EXTERNAL_POWER");
        env::remove_var("ENCODE_CRF");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_ops in 0u32..16,
            progress_ms in 1u64..10_000,
            flush_ms in 1u64..60_000,
            outcome_version in 0u32..100,
            require_wifi in proptest::bool::ANY,
            require_power in proptest::bool::ANY,
            crf in 0u8..51,
        ) {
            let toml_str = format!(
                r#"
[scheduler]
max_concurrent_operations = {}
progress_interval_ms = {}

[cache]
flush_interval_ms = {}
outcome_version = {}

[admission]
require_unmetered_network = {}
require_external_power = {}
network = "metered"

[encode]
crf = {}
"#,
                max_ops, progress_ms, flush_ms, outcome_version, require_wifi, require_power, crf
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.scheduler.max_concurrent_operations, max_ops);
            prop_assert_eq!(config.scheduler.progress_interval_ms, progress_ms);
            prop_assert_eq!(config.cache.flush_interval_ms, flush_ms);
            prop_assert_eq!(config.cache.outcome_version, outcome_version);
            // Untouched keys in a present section keep their defaults
            prop_assert_eq!(config.cache.capability_version, 3);
            prop_assert_eq!(config.admission.require_unmetered_network, require_wifi);
            prop_assert_eq!(config.admission.require_external_power, require_power);
            prop_assert_eq!(config.admission.network, AssumedNetwork::Metered);
            prop_assert_eq!(config.encode.crf, crf);
            prop_assert_eq!(config.encode.preset.as_str(), "medium");
        }

        #[test]
        fn prop_env_overrides_max_concurrent_operations(
            initial in 0u32..8,
            overridden in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[scheduler]\nmax_concurrent_operations = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("SCHEDULER_MAX_CONCURRENT_OPERATIONS", overridden.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.scheduler.max_concurrent_operations, overridden);
        }

        #[test]
        fn prop_env_overrides_admission_flags(
            initial_wifi in proptest::bool::ANY,
            initial_power in proptest::bool::ANY,
            override_wifi in proptest::bool::ANY,
            override_power in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[admission]\nrequire_unmetered_network = {}\nrequire_external_power = {}\n",
                initial_wifi, initial_power
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ADMISSION_REQUIRE_UNMETERED_NETWORK", override_wifi.to_string());
            env::set_var("ADMISSION_REQUIRE_EXTERNAL_POWER", if override_power { "yes" } else { "0" });
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.admission.require_unmetered_network, override_wifi);
            prop_assert_eq!(config.admission.require_external_power, override_power);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.scheduler.max_concurrent_operations, 3);
        assert_eq!(config.scheduler.progress_interval_ms, 500);
        assert_eq!(config.cache.dir, PathBuf::from(".hevc-sweep/cache"));
        assert_eq!(config.cache.flush_interval_ms, 5000);
        assert_eq!(config.cache.capability_version, 3);
        assert_eq!(config.cache.outcome_version, 4);
        assert_eq!(config.cache.resource_stats_version, 3);
        assert!(config.admission.require_unmetered_network);
        assert!(config.admission.require_external_power);
        assert_eq!(config.admission.network, AssumedNetwork::Unmetered);
        assert_eq!(config.encode.crf, 28);
        assert!((config.encode.min_savings_ratio - 0.05).abs() < 0.0001);
    }

    #[test]
    fn test_zero_operations_clamped_to_one() {
        let config = Config::parse_toml("[scheduler]\nmax_concurrent_operations = 0\n")
            .expect("Valid TOML");
        assert_eq!(config.scheduler.effective_max_concurrent_operations(), 1);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("SCHEDULER_MAX_CONCURRENT_OPERATIONS", "lots");
        env::set_var("ADMISSION_REQUIRE_EXTERNAL_POWER", "maybe");
        env::set_var("CACHE_DIR", "/var/cache/sweep");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.scheduler.max_concurrent_operations, 3);
        assert!(config.admission.require_external_power);
        assert_eq!(config.cache.dir, PathBuf::from("/var/cache/sweep"));
    }

    #[test]
    fn test_unknown_network_class_is_a_parse_error() {
        let result = Config::parse_toml("[admission]\nnetwork = \"carrier-pigeon\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
