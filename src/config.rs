//! # Configuration Management Module
//!
//! ## Purpose
//! Centralized configuration for the crawl scheduler: the search alphabet and
//! partitioning thresholds, HTTP endpoint settings, session pool sizing,
//! checkpoint cadence, and storage paths, loaded from TOML with validation and
//! documented defaults.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration files (TOML)
//! - **Output**: Validated configuration structs with defaults and overrides
//! - **Validation**: Type checking, range validation, alphabet sanity
//!
//! ## Usage
//! ```rust,no_run
//! use case_search_spider::config::Config;
//!
//! // Load from the default location, falling back to defaults
//! let config = Config::load()?;
//!
//! // Load from a specific file
//! let config = Config::from_file("custom.toml")?;
//! # Ok::<(), case_search_spider::SpiderError>(())
//! ```

use crate::errors::{Result, SpiderError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Every character the endpoint can search on: uppercase letters, digits,
/// and printable punctuation. Site-specific exclusions are applied on top
/// via `excluded_chars` rather than trimmed from this set.
pub const DEFAULT_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Characters removed from the alphabet by default. The underscore is an
/// observed server-side timeout trigger on the target site, so it ships
/// excluded but stays configurable.
pub const DEFAULT_EXCLUDED_CHARS: &str = "_";

/// Main configuration structure containing all system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Search-space partitioning settings
    pub search: SearchConfig,
    /// HTTP endpoint settings
    pub http: HttpConfig,
    /// Session pool settings
    pub pool: PoolConfig,
    /// Checkpoint cadence
    pub checkpoint: CheckpointConfig,
    /// Storage paths and thresholds
    pub store: StoreConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Search-space partitioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Characters appended to a prefix when refining an overflowed query
    pub alphabet: String,
    /// Characters excluded from the alphabet (empirical site quirks)
    pub excluded_chars: String,
    /// Calendar days covered by one root slice
    pub days_per_query: i64,
    /// The server's hard cap on returned rows; reaching it signals overflow
    pub row_cap: usize,
    /// Response-body substrings that explicitly signal "more than the cap"
    pub overflow_markers: Vec<String>,
    /// Response-body substrings that signal a server-side query timeout
    pub timeout_markers: Vec<String>,
    /// Response-body substrings that signal an empty result set
    pub no_results_markers: Vec<String>,
    /// Server errors tolerated per node before the node is failed
    pub max_server_errors: u32,
}

impl SearchConfig {
    /// The effective, deterministic symbol order used for refinement:
    /// the configured alphabet minus exclusions, first occurrence wins.
    pub fn symbols(&self) -> Vec<char> {
        let mut seen = std::collections::HashSet::new();
        self.alphabet
            .chars()
            .filter(|c| !self.excluded_chars.contains(*c))
            .filter(|c| *c != ' ')
            .filter(|c| seen.insert(*c))
            .collect()
    }
}

/// HTTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Root URL of the case-search site
    pub base_url: String,
    /// Path of the search form endpoint
    pub search_path: String,
    /// Path of the disclaimer-acceptance endpoint used for session renewal
    pub disclaimer_path: String,
    /// Client-side request timeout; the endpoint gives up at two minutes
    pub timeout_seconds: u64,
    /// User agent sent with every request
    pub user_agent: String,
    /// Default court filter applied when a run specifies none
    pub court: Option<String>,
    /// Default site filter applied when a run specifies none
    pub site: Option<String>,
    /// Body/URL substrings that mean the session is no longer authenticated
    pub session_markers: Vec<String>,
}

/// Session pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of authenticated sessions, and therefore the concurrency bound
    pub concurrency: usize,
}

/// Checkpoint cadence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// How often the run loop wakes to consider a checkpoint
    pub poll_interval_seconds: u64,
    /// Minimum gap between two full-tree checkpoints
    pub interval_seconds: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Run-state database path
    pub run_db_path: PathBuf,
    /// Case registry database path
    pub registry_path: PathBuf,
    /// Directory for run trees too large for the primary store
    pub blob_dir: PathBuf,
    /// Serialized-tree size above which the tree overflows to a blob
    pub blob_threshold_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (`error`..`trace`)
    pub level: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| SpiderError::Config {
            message: format!("Failed to read config file {:?}: {}", path.as_ref(), e),
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `config.toml` in the working directory, falling back to
    /// defaults when no file exists
    pub fn load() -> Result<Self> {
        let path = Path::new("config.toml");
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.search.symbols().is_empty() {
            return Err(SpiderError::ValidationFailed {
                field: "search.alphabet".to_string(),
                reason: "Alphabet is empty after exclusions".to_string(),
            });
        }

        if self.search.days_per_query <= 0 {
            return Err(SpiderError::ValidationFailed {
                field: "search.days_per_query".to_string(),
                reason: "Root slices must cover at least one day".to_string(),
            });
        }

        if self.search.row_cap == 0 {
            return Err(SpiderError::ValidationFailed {
                field: "search.row_cap".to_string(),
                reason: "Row cap must be greater than zero".to_string(),
            });
        }

        if self.pool.concurrency == 0 {
            return Err(SpiderError::ValidationFailed {
                field: "pool.concurrency".to_string(),
                reason: "Session pool cannot be empty".to_string(),
            });
        }

        if self.http.timeout_seconds == 0 {
            return Err(SpiderError::ValidationFailed {
                field: "http.timeout_seconds".to_string(),
                reason: "Request timeout must be greater than zero".to_string(),
            });
        }

        if self.checkpoint.poll_interval_seconds == 0
            || self.checkpoint.interval_seconds < self.checkpoint.poll_interval_seconds
        {
            return Err(SpiderError::ValidationFailed {
                field: "checkpoint.interval_seconds".to_string(),
                reason: "Checkpoint interval must be at least the poll interval".to_string(),
            });
        }

        if self.store.blob_threshold_bytes == 0 {
            return Err(SpiderError::ValidationFailed {
                field: "store.blob_threshold_bytes".to_string(),
                reason: "Blob threshold must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SpiderError::Config {
            message: format!("Failed to serialize config to TOML: {}", e),
        })
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchConfig {
                alphabet: DEFAULT_ALPHABET.to_string(),
                excluded_chars: DEFAULT_EXCLUDED_CHARS.to_string(),
                days_per_query: 16,
                row_cap: 500,
                overflow_markers: vec!["exceeds the maximum".to_string()],
                timeout_markers: vec!["search timed out".to_string()],
                no_results_markers: vec!["no cases found".to_string()],
                max_server_errors: 3,
            },
            http: HttpConfig {
                base_url: "https://casesearch.example.gov".to_string(),
                search_path: "/inquiry/search.jis".to_string(),
                disclaimer_path: "/inquiry/processDisclaimer.jis".to_string(),
                timeout_seconds: 120,
                user_agent: "case-search-spider/0.1".to_string(),
                court: None,
                site: None,
                session_markers: vec![
                    "terms and conditions of use".to_string(),
                    "disclaimer".to_string(),
                ],
            },
            pool: PoolConfig { concurrency: 10 },
            checkpoint: CheckpointConfig {
                poll_interval_seconds: 5,
                interval_seconds: 300,
            },
            store: StoreConfig {
                run_db_path: PathBuf::from("./data/runs.db"),
                registry_path: PathBuf::from("./data/registry.db"),
                blob_dir: PathBuf::from("./data/run_blobs"),
                blob_threshold_bytes: 256 * 1024,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
