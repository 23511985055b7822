use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub exclude: ExcludeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
}

impl StorageConfig {
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.sqlite")
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("jobs.sqlite")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.vectors_dir().join("index.sqlite")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("strata.log")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("strata.lock")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7777".to_string()
}

/// A watched source root. File events under `path` become extraction jobs.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Extension whitelist (without dots). Empty means all supported types.
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExcludeConfig {
    /// Glob patterns matched against the full path.
    #[serde(default = "default_exclude_globs")]
    pub globs: Vec<String>,
    /// Extensions never extracted (without dots).
    #[serde(default = "default_exclude_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

impl Default for ExcludeConfig {
    fn default() -> Self {
        Self {
            globs: default_exclude_globs(),
            extensions: default_exclude_extensions(),
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

fn default_exclude_globs() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/target/**".to_string(),
        "**/__pycache__/**".to_string(),
        "**/.venv/**".to_string(),
    ]
}

fn default_exclude_extensions() -> Vec<String> {
    vec![
        "tmp".to_string(),
        "log".to_string(),
        "bak".to_string(),
        "lock".to_string(),
        "exe".to_string(),
        "dll".to_string(),
        "so".to_string(),
    ]
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_code_max_lines")]
    pub code_max_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            max_tokens: default_max_tokens(),
            code_max_lines: default_code_max_lines(),
        }
    }
}

fn default_target_tokens() -> usize {
    500
}
fn default_max_tokens() -> usize {
    1000
}
fn default_code_max_lines() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_recent_ring")]
    pub recent_ring: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            recent_ring: default_recent_ring(),
        }
    }
}

fn default_max_attempts() -> i64 {
    3
}
fn default_recent_ring() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorrelationConfig {
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_max_pairs_per_file")]
    pub max_pairs_per_file: usize,
    #[serde(default = "default_max_total_pairs")]
    pub max_total_pairs: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_entities: default_max_entities(),
            max_pairs_per_file: default_max_pairs_per_file(),
            max_total_pairs: default_max_total_pairs(),
            min_confidence: default_min_confidence(),
            min_sources: default_min_sources(),
        }
    }
}

fn default_max_entities() -> usize {
    50_000
}
fn default_max_pairs_per_file() -> usize {
    500
}
fn default_max_total_pairs() -> usize {
    1_000_000
}
fn default_min_confidence() -> f64 {
    0.7
}
fn default_min_sources() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load the config file if present, otherwise fall back to defaults.
/// Lets `strata serve` run without a config file.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        let config: Config = toml::from_str("").with_context(|| "Failed to build default config")?;
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.max_tokens < config.chunking.target_tokens {
        anyhow::bail!("chunking.max_tokens must be >= chunking.target_tokens");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified for the openai provider");
    }

    if !(0.0..=1.0).contains(&config.correlation.min_confidence) {
        anyhow::bail!("correlation.min_confidence must be in [0.0, 1.0]");
    }
    if config.correlation.max_entities == 0
        || config.correlation.max_pairs_per_file == 0
        || config.correlation.max_total_pairs == 0
    {
        anyhow::bail!("correlation bounds must all be > 0");
    }

    if config.queue.max_attempts < 1 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.embedding.dims, 384);
        assert_eq!(config.correlation.max_entities, 50_000);
        assert_eq!(config.correlation.min_confidence, 0.7);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.watcher.debounce_ms, 500);
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"quantum\"").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_confidence_out_of_range() {
        let config: Config = toml::from_str("[correlation]\nmin_confidence = 1.5").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/tmp/strata-test"),
        };
        assert_eq!(
            storage.catalog_path(),
            PathBuf::from("/tmp/strata-test/catalog.sqlite")
        );
        assert_eq!(
            storage.vectors_path(),
            PathBuf::from("/tmp/strata-test/vectors/index.sqlite")
        );
    }
}
