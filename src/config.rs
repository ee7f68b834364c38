use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache;
use crate::cli::{Cli, OutputFormat};
use crate::http_client::HttpClientConfig;
use crate::validator::ValidationOptions;

/// Environment variable access, injectable for tests
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Invalid {key} value: {value}")]
    Environment { key: String, value: String },

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const CONFIG_FILE_NAMES: [&str; 4] = [
    "schematron.toml",
    "schematron.json",
    ".schematron.toml",
    ".schematron.json",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub validation: ValidationConfig,
    pub network: NetworkConfig,
    pub cache: CacheConfig,
    pub output: OutputConfig,
    pub files: FileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ValidationConfig {
    /// Files validated concurrently; defaults to the CPU count
    pub threads: Option<usize>,
    pub fail_fast: bool,
    pub lenient: bool,
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Compiled schemas kept in memory
    pub max_schemas: u64,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub verbose: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub extensions: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_schemas: 100,
            ttl_seconds: 3600,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Config {
    pub fn thread_count(&self) -> usize {
        self.validation.threads.unwrap_or_else(num_cpus::get)
    }

    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            phase: self.validation.phase.clone(),
            lenient: self.validation.lenient,
            cancel: None,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout_seconds: self.network.timeout_seconds,
            retry_attempts: self.network.retry_attempts,
            retry_delay_ms: self.network.retry_delay_ms,
            ..HttpClientConfig::default()
        }
    }

    pub fn cache_config(&self) -> cache::CacheConfig {
        cache::CacheConfig {
            max_schemas: self.cache.max_schemas,
            ttl_seconds: self.cache.ttl_seconds,
        }
    }
}

fn parse_env<T: FromStr>(env: &impl EnvProvider, key: &str) -> Result<Option<T>> {
    match env.get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Environment {
                key: key.to_string(),
                value,
            }),
    }
}

/// Layers configuration: defaults, then a file, then `SCHEMATRON_*`
/// environment variables, then command line flags.
pub struct ConfigManager;

impl ConfigManager {
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        Self::load_config_with(cli, &SystemEnvProvider, &Self::search_dirs()).await
    }

    pub async fn load_config_with(
        cli: &Cli,
        env: &impl EnvProvider,
        search_dirs: &[PathBuf],
    ) -> Result<Config> {
        let config = match &cli.config {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::find_config_file(search_dirs)
                .await?
                .unwrap_or_default(),
        };
        let config = Self::apply_environment_overrides(env, config)?;
        let config = Self::merge_with_cli(config, cli);
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// The working directory, then the user configuration directory.
    pub fn search_dirs() -> Vec<PathBuf> {
        let mut dirs = vec![PathBuf::from(".")];
        if let Some(config_dir) = dirs::config_dir() {
            dirs.push(config_dir.join("schematron"));
        }
        dirs
    }

    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;
        debug!(path = %path.display(), "loading configuration file");

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(_) => Ok(serde_json::from_str(&content)?),
            },
        }
    }

    pub async fn find_config_file(search_dirs: &[PathBuf]) -> Result<Option<Config>> {
        for dir in search_dirs {
            for name in CONFIG_FILE_NAMES {
                let path = dir.join(name);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }
        Ok(None)
    }

    pub fn apply_environment_overrides(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        if let Some(threads) = parse_env(env, "SCHEMATRON_THREADS")? {
            config.validation.threads = Some(threads);
        }
        if let Some(fail_fast) = parse_env(env, "SCHEMATRON_FAIL_FAST")? {
            config.validation.fail_fast = fail_fast;
        }
        if let Some(lenient) = parse_env(env, "SCHEMATRON_LENIENT")? {
            config.validation.lenient = lenient;
        }
        if let Some(phase) = env.get("SCHEMATRON_PHASE").filter(|p| !p.trim().is_empty()) {
            config.validation.phase = Some(phase.trim().to_string());
        }

        if let Some(timeout) = parse_env(env, "SCHEMATRON_TIMEOUT")? {
            config.network.timeout_seconds = timeout;
        }
        if let Some(retries) = parse_env(env, "SCHEMATRON_RETRY_ATTEMPTS")? {
            config.network.retry_attempts = retries;
        }

        if let Some(size) = parse_env(env, "SCHEMATRON_CACHE_SIZE")? {
            config.cache.max_schemas = size;
        }
        if let Some(ttl) = parse_env(env, "SCHEMATRON_CACHE_TTL")? {
            config.cache.ttl_seconds = ttl;
        }

        if let Some(verbose) = parse_env(env, "SCHEMATRON_VERBOSE")? {
            config.output.verbose = verbose;
        }
        if let Some(quiet) = parse_env(env, "SCHEMATRON_QUIET")? {
            config.output.quiet = quiet;
        }
        if let Some(format) = env.get("SCHEMATRON_FORMAT") {
            config.output.format = match format.trim().to_lowercase().as_str() {
                "human" => OutputFormat::Human,
                "json" => OutputFormat::Json,
                "summary" => OutputFormat::Summary,
                _ => {
                    return Err(ConfigError::Environment {
                        key: "SCHEMATRON_FORMAT".to_string(),
                        value: format,
                    });
                }
            };
        }

        if let Some(extensions) = env.get("SCHEMATRON_EXTENSIONS") {
            config.files.extensions = crate::cli::split_list(&extensions);
        }

        Ok(config)
    }

    /// Flags the user actually passed win over every other layer.
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if cli.threads.is_some() {
            config.validation.threads = cli.threads;
        }
        config.validation.fail_fast |= cli.fail_fast;
        config.validation.lenient |= cli.lenient;
        if cli.phase.is_some() {
            config.validation.phase = cli.phase.clone();
        }

        if let Some(timeout) = cli.timeout {
            config.network.timeout_seconds = timeout;
        }
        if let Some(retries) = cli.retry_attempts {
            config.network.retry_attempts = retries;
        }
        if let Some(size) = cli.cache_size {
            config.cache.max_schemas = size;
        }

        if let Some(format) = cli.format {
            config.output.format = format;
        }
        if cli.verbose {
            config.output.verbose = true;
            config.output.quiet = false;
        }
        if cli.quiet {
            config.output.quiet = true;
            config.output.verbose = false;
        }

        if let Some(extensions) = cli.extensions() {
            config.files.extensions = extensions;
        }
        if !cli.include_patterns.is_empty() {
            config.files.include_patterns = cli.include_patterns.clone();
        }
        if !cli.exclude_patterns.is_empty() {
            config.files.exclude_patterns = cli.exclude_patterns.clone();
        }

        config
    }

    pub fn validate_config(config: &Config) -> Result<()> {
        let invalid = |message: &str| Err(ConfigError::Validation(message.to_string()));

        match config.validation.threads {
            Some(0) => return invalid("Number of threads must be greater than 0"),
            Some(n) if n > 1000 => return invalid("Number of threads cannot exceed 1000"),
            _ => {}
        }
        if config.validation.phase.as_deref() == Some("") {
            return invalid("Phase name must not be empty");
        }
        if config.network.timeout_seconds == 0 {
            return invalid("Timeout must be greater than 0");
        }
        if config.network.retry_attempts > 10 {
            return invalid("Retry attempts cannot exceed 10");
        }
        if config.cache.max_schemas == 0 {
            return invalid("Schema cache size must be greater than 0");
        }
        if config.cache.ttl_seconds == 0 {
            return invalid("Schema cache TTL must be greater than 0");
        }
        if config.output.verbose && config.output.quiet {
            return invalid("Cannot enable both verbose and quiet modes");
        }
        if config.files.extensions.is_empty() {
            return invalid("At least one file extension must be specified");
        }
        for ext in &config.files.extensions {
            if ext.contains(['/', '\\', '.']) {
                return Err(ConfigError::Validation(format!(
                    "Invalid file extension: {}",
                    ext
                )));
            }
        }
        Ok(())
    }
}
