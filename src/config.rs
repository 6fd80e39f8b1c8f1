//! Configuration from defaults, a TOML or JSON file and `BOARD_COUNTER_*` environment variables.

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{harness::MAX_CONCURRENCY, storage::RetryPolicy, types::ConfigError};

const ENV_PREFIX: &str = "BOARD_COUNTER_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub storage: StorageConfig,
	#[serde(default)]
	pub harness: HarnessConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

/// Which engine keeps the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
	#[default]
	Sqlite,
	/// Needs the `rocksdb` feature.
	#[value(name = "rocksdb")]
	RocksDb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	pub backend: Backend,
	/// SQLite database file, or RocksDB directory.
	pub path: PathBuf,
	/// SQLite only: how long to wait on another connection's write lock.
	pub busy_timeout_ms: u64,
	/// Leave unset to use the backend's own default.
	pub max_conflict_retries: Option<u32>,
	pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
	pub concurrency: usize,
	pub total_calls: usize,
	pub runs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	pub level: String,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			backend: Backend::Sqlite,
			path: PathBuf::from("board.db"),
			busy_timeout_ms: 5_000,
			max_conflict_retries: None,
			retry_backoff_ms: None,
		}
	}
}

impl Default for HarnessConfig {
	fn default() -> Self {
		Self { concurrency: 10, total_calls: 500, runs: 1 }
	}
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self { level: "info".to_string() }
	}
}

impl Config {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reads a `.json` file as JSON and anything else as TOML.
	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)?;

		let ext = path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase());
		match ext.as_deref() {
			Some("json") =>
				serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string())),
			_ => toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string())),
		}
	}

	pub fn merge_from_env(mut self) -> Result<Self, ConfigError> {
		if let Some(val) = env_var("BACKEND") {
			self.storage.backend = match val.to_lowercase().as_str() {
				"sqlite" => Backend::Sqlite,
				"rocksdb" => Backend::RocksDb,
				_ => return Err(invalid_env("BACKEND", &val)),
			};
		}
		if let Some(val) = env_var("DATABASE") {
			self.storage.path = PathBuf::from(val);
		}
		if let Some(val) = env_var("BUSY_TIMEOUT_MS") {
			self.storage.busy_timeout_ms = parse_env("BUSY_TIMEOUT_MS", &val)?;
		}
		if let Some(val) = env_var("MAX_CONFLICT_RETRIES") {
			self.storage.max_conflict_retries = Some(parse_env("MAX_CONFLICT_RETRIES", &val)?);
		}
		if let Some(val) = env_var("RETRY_BACKOFF_MS") {
			self.storage.retry_backoff_ms = Some(parse_env("RETRY_BACKOFF_MS", &val)?);
		}
		if let Some(val) = env_var("CONCURRENCY") {
			self.harness.concurrency = parse_env("CONCURRENCY", &val)?;
		}
		if let Some(val) = env_var("TOTAL_CALLS") {
			self.harness.total_calls = parse_env("TOTAL_CALLS", &val)?;
		}
		if let Some(val) = env_var("RUNS") {
			self.harness.runs = parse_env("RUNS", &val)?;
		}
		if let Some(val) = env_var("LOG_LEVEL") {
			self.logging.level = val;
		}

		Ok(self)
	}

	/// Collects every problem instead of stopping at the first one.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let mut issues = Vec::new();

		if self.storage.path.as_os_str().is_empty() {
			issues.push("storage.path must not be empty".to_string());
		}
		if self.storage.busy_timeout_ms == 0 || self.storage.busy_timeout_ms > 600_000 {
			issues.push(format!(
				"storage.busy_timeout_ms must be between 1 and 600000, got {}",
				self.storage.busy_timeout_ms
			));
		}
		if cfg!(not(feature = "rocksdb")) && self.storage.backend == Backend::RocksDb {
			issues.push("storage.backend = \"rocksdb\" needs the `rocksdb` feature".to_string());
		}
		if self.harness.concurrency == 0 || self.harness.concurrency > MAX_CONCURRENCY {
			issues.push(format!(
				"harness.concurrency must be between 1 and {}, got {}",
				MAX_CONCURRENCY, self.harness.concurrency
			));
		}
		if self.harness.runs == 0 {
			issues.push("harness.runs must be at least 1".to_string());
		}
		if self.logging.level.parse::<tracing::Level>().is_err() {
			issues.push(format!("logging.level {:?} is not a log level", self.logging.level));
		}

		if issues.is_empty() {
			Ok(())
		} else {
			Err(ConfigError::Invalid(issues))
		}
	}

	pub fn busy_timeout(&self) -> Duration {
		Duration::from_millis(self.storage.busy_timeout_ms)
	}

	/// `base` with whatever the configuration overrides.
	pub fn retry_policy(&self, base: RetryPolicy) -> RetryPolicy {
		RetryPolicy {
			max_retries: self.storage.max_conflict_retries.unwrap_or(base.max_retries),
			backoff: self
				.storage
				.retry_backoff_ms
				.map(Duration::from_millis)
				.unwrap_or(base.backoff),
		}
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn invalid_env(name: &str, val: &str) -> ConfigError {
	ConfigError::Invalid(vec![format!("{}{} has invalid value {:?}", ENV_PREFIX, name, val)])
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T, ConfigError> {
	val.trim().parse().map_err(|_| invalid_env(name, val))
}
