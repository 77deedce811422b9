//! Effective runtime configuration.
//!
//! Loaded once at startup from a TOML file (project data dir or user config
//! dir) and passed by value to the components that need it. Unknown keys are
//! ignored so older installs can carry newer config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ============================================================================
// Watch / admission
// ============================================================================

/// Watched roots and admission filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
  /// Absolute paths to scan and watch
  pub watched_roots: Vec<PathBuf>,

  /// Glob patterns excluded from scanning and watching
  pub exclude_patterns: Vec<String>,

  /// Glob patterns identifying bundles (app packages, photo libraries)
  pub bundle_patterns: Vec<String>,

  /// Whether bundle matches are excluded up-front (default: true)
  pub exclude_bundles: bool,

  /// Per-parser enablement overrides, keyed by parser id
  pub file_types: HashMap<String, bool>,

  /// Watcher debounce per path in milliseconds (default: 500)
  pub debounce_ms: u64,

  /// Maximum file size to index in bytes (default: 16MB)
  pub max_file_size: u64,
}

impl Default for WatchConfig {
  fn default() -> Self {
    Self {
      watched_roots: Vec::new(),
      exclude_patterns: vec![
        "**/.git/**".to_string(),
        "**/node_modules/**".to_string(),
        "**/.Trash/**".to_string(),
        "**/Library/Caches/**".to_string(),
      ],
      bundle_patterns: vec!["**/*.app/**".to_string(), "**/*.photoslibrary/**".to_string()],
      exclude_bundles: true,
      file_types: HashMap::new(),
      debounce_ms: 500,
      max_file_size: 16 * 1024 * 1024,
    }
  }
}

// ============================================================================
// Embedding service
// ============================================================================

/// Pooling mode requested from the embedding server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
  #[default]
  Mean,
  Cls,
  Max,
}

impl Pooling {
  pub fn as_str(&self) -> &'static str {
    match self {
      Pooling::Mean => "mean",
      Pooling::Cls => "cls",
      Pooling::Max => "max",
    }
  }
}

/// Embedding service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
  /// Loopback endpoint of the embedding server
  pub endpoint: String,

  /// Command used to launch the server process. Empty means the server is
  /// managed externally and only the endpoint is used.
  pub server_command: Vec<String>,

  /// Model identifier, opaque to the core. Changing it requires a schema
  /// version bump (vectors from different models must never mix).
  pub model_id: String,

  /// Fixed output dimension of the model
  pub dimensions: usize,

  /// Whether the server should L2-normalize returned vectors
  pub normalize: bool,

  /// Pooling mode (mean, cls, max)
  pub pooling: Pooling,

  /// Per-batch request timeout in milliseconds (default: 30000)
  pub batch_timeout_ms: u64,

  /// Query embedding timeout in milliseconds (default: 10000)
  pub query_timeout_ms: u64,

  /// Maximum retries per request (default: 2)
  pub max_retries: u32,

  /// Base delay for exponential retry backoff in milliseconds (default: 500)
  pub retry_base_delay_ms: u64,

  /// Overall timeout for server startup in milliseconds (default: 60000)
  pub startup_timeout_ms: u64,

  /// Idle health-check interval in milliseconds (default: 10000)
  pub health_interval_ms: u64,

  /// Maximum restarts within the restart window before the service goes to
  /// error (default: 5)
  pub max_restarts: u32,

  /// Restart accounting window in milliseconds (default: 600000)
  pub restart_window_ms: u64,

  /// Optional RSS ceiling for the server process in MB; 0 disables the
  /// memory-based restart
  pub rss_ceiling_mb: u64,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      endpoint: "http://127.0.0.1:8787".to_string(),
      server_command: Vec::new(),
      model_id: "paraphrase-multilingual-mpnet-base-v2".to_string(),
      dimensions: 768,
      normalize: true,
      pooling: Pooling::Mean,
      batch_timeout_ms: 30_000,
      query_timeout_ms: 10_000,
      max_retries: 2,
      retry_base_delay_ms: 500,
      startup_timeout_ms: 60_000,
      health_interval_ms: 10_000,
      max_restarts: 5,
      restart_window_ms: 600_000,
      rss_ceiling_mb: 0,
    }
  }
}

// ============================================================================
// Queue
// ============================================================================

/// Embedding queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Hard cap on queued chunks (default: 2000)
  pub max_queue_size: usize,

  /// High-water mark that asserts backpressure (default: 1000)
  pub backpressure_threshold: usize,

  /// Maximum texts per embedding batch (default: 32)
  pub batch_size: usize,

  /// Token-estimate cap per embedding batch (default: 7000)
  pub batch_token_cap: usize,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_queue_size: 2000,
      backpressure_threshold: 1000,
      batch_size: 32,
      batch_token_cap: 7000,
    }
  }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Concurrent file scheduler limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  /// Maximum concurrently ingesting files (default: 4)
  pub max_concurrent_files: usize,

  /// Soft process memory ceiling in MB; 0 disables the check
  pub memory_soft_ceiling_mb: u64,

  /// Hours before a failed file becomes eligible for retry (default: 24)
  pub failed_retry_hours: u64,

  /// Soft timeout for one file ingestion in milliseconds (default: 300000)
  pub ingestion_timeout_ms: u64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_concurrent_files: 4,
      memory_soft_ceiling_mb: 0,
      failed_retry_hours: 24,
      ingestion_timeout_ms: 300_000,
    }
  }
}

// ============================================================================
// Chunking
// ============================================================================

/// Chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
  /// Target chunk size in estimated tokens (default: 500)
  pub target_tokens: usize,

  /// Overlap tail carried between chunks in estimated tokens (default: 80)
  pub overlap_tokens: usize,
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      target_tokens: 500,
      overlap_tokens: 80,
    }
  }
}

// ============================================================================
// Search
// ============================================================================

/// Search defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
  /// Default number of result groups (default: 10)
  pub default_limit: usize,

  /// Raw hits fetched per requested group before grouping (default: 4)
  pub grouping_factor: usize,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self {
      default_limit: 10,
      grouping_factor: 4,
    }
  }
}

// ============================================================================
// Main configuration
// ============================================================================

/// Semadex configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  #[serde(default)]
  pub watch: WatchConfig,

  #[serde(default)]
  pub embedding: EmbeddingConfig,

  #[serde(default)]
  pub queue: QueueConfig,

  #[serde(default)]
  pub scheduler: SchedulerConfig,

  #[serde(default)]
  pub index: IndexConfig,

  #[serde(default)]
  pub search: SearchConfig,
}

impl Config {
  /// Load config from an explicit file, falling back to the user config,
  /// falling back to defaults.
  pub fn load(explicit: Option<&Path>) -> Self {
    if let Some(path) = explicit
      && let Ok(content) = std::fs::read_to_string(path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    if let Some(user_path) = Self::user_config_path()
      && user_path.exists()
      && let Ok(content) = std::fs::read_to_string(&user_path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    Self::default()
  }

  /// User-level config path (`~/.config/semadex/config.toml`, overridable
  /// via `SEMADEX_CONFIG_DIR` / `XDG_CONFIG_HOME`).
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("SEMADEX_CONFIG_DIR") {
      return Some(PathBuf::from(dir).join("config.toml"));
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(xdg).join("semadex").join("config.toml"));
    }

    dirs::config_dir().map(|p| p.join("semadex").join("config.toml"))
  }

  /// Data directory holding the vector store, file status table, lock file
  /// and logs.
  pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SEMADEX_DATA_DIR") {
      return PathBuf::from(dir);
    }

    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
      return PathBuf::from(xdg).join("semadex");
    }

    dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("semadex")
  }

  /// Whether a parser is enabled, honoring per-parser overrides.
  pub fn parser_enabled(&self, parser_id: &str, default: bool) -> bool {
    self.watch.file_types.get(parser_id).copied().unwrap_or(default)
  }
}
