//! Configuration management for backend endpoints, batching, and paths.

use std::{
   fs,
   path::{Path, PathBuf},
   sync::OnceLock,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub const MAX_BATCH_SIZE_CAP: usize = 1_000;
pub const MAX_WORKERS_CAP: usize = 64;
pub const MAX_INLINE_BYTES_CAP: u64 = 10_485_760;
pub const MAX_TRUNCATE_BYTES_CAP: u64 = 2_097_152;
pub const MAX_RETRIES_CAP: u32 = 20;

/// Application configuration loaded from config file and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub backend_url: String,
   pub embed_url:   String,
   pub embed_model: String,
   pub collection:  String,

   pub batch_size: usize,
   pub max_batch_size: usize,
   pub worker_count: usize,
   pub max_workers: usize,
   pub max_retries: u32,
   pub max_inline_bytes: u64,
   pub encode_threshold_bytes: u64,
   pub truncate_bytes: u64,
   pub request_timeout_ms: u64,
   pub busy_timeout_ms: u64,
   pub retain_days: u32,
   pub breaker_failure_threshold: u32,
   pub breaker_recovery_ms: u64,

   pub skip_embedding: bool,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         backend_url: "http://localhost:6333".to_string(),
         embed_url: "http://localhost:1234/v1".to_string(),
         embed_model: "text-embedding-3-small".to_string(),
         collection: "default".to_string(),
         batch_size: 50,
         max_batch_size: MAX_BATCH_SIZE_CAP,
         worker_count: 4,
         max_workers: 32,
         max_retries: 3,
         max_inline_bytes: 1_048_576,
         encode_threshold_bytes: 65_536,
         truncate_bytes: 512_000,
         request_timeout_ms: 30_000,
         busy_timeout_ms: 5_000,
         retain_days: 30,
         breaker_failure_threshold: 5,
         breaker_recovery_ms: 60_000,
         skip_embedding: false,
      }
   }
}

impl Config {
   pub fn load() -> Self {
      let config_path = ensure_global_config();

      Figment::from(Serialized::defaults(Self::default()))
         .merge(Toml::file(config_path))
         .merge(Env::prefixed("GSYNC_").lowercase(true))
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   fn create_default_config(path: &Path) {
      if let Some(parent) = path.parent() {
         let _ = fs::create_dir_all(parent);
      }
      let default_config = Self::default();
      if let Ok(toml) = toml::to_string_pretty(&default_config) {
         let _ = fs::write(path, toml);
      }
   }

   /// Returns the configured batch size, capped at maximum
   pub fn effective_batch_size(&self) -> usize {
      self
         .batch_size
         .min(self.max_batch_size)
         .min(MAX_BATCH_SIZE_CAP)
         .max(1)
   }

   /// Calculates default worker count based on available CPUs
   pub fn default_workers(&self) -> usize {
      (num_cpus::get().saturating_sub(2)).clamp(1, self.effective_max_workers())
   }

   pub fn effective_workers(&self) -> usize {
      if self.worker_count == 0 {
         return self.default_workers();
      }
      self.worker_count.min(self.effective_max_workers())
   }

   pub fn effective_max_workers(&self) -> usize {
      self.max_workers.min(MAX_WORKERS_CAP).max(1)
   }

   pub fn effective_max_retries(&self) -> u32 {
      self.max_retries.min(MAX_RETRIES_CAP)
   }

   pub fn effective_max_inline_bytes(&self) -> u64 {
      self.max_inline_bytes.min(MAX_INLINE_BYTES_CAP).max(1)
   }

   pub fn effective_truncate_bytes(&self) -> u64 {
      self.truncate_bytes.min(MAX_TRUNCATE_BYTES_CAP).max(1)
   }
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// Returns the base directory for gsync data and configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".gsync"))
}

fn ensure_global_config() -> PathBuf {
   let config_path = config_file_path();
   if !config_path.exists() {
      Config::create_default_config(config_path);
   }
   config_path.to_path_buf()
}

pub fn validate(cfg: &Config) -> Result<()> {
   if cfg.batch_size > MAX_BATCH_SIZE_CAP {
      return Err(
         ConfigError::InvalidConfig(format!(
            "batch_size {} exceeds hard cap {}",
            cfg.batch_size, MAX_BATCH_SIZE_CAP
         ))
         .into(),
      );
   }
   if cfg.max_inline_bytes > MAX_INLINE_BYTES_CAP {
      return Err(
         ConfigError::InvalidConfig(format!(
            "max_inline_bytes {} exceeds hard cap {}",
            cfg.max_inline_bytes, MAX_INLINE_BYTES_CAP
         ))
         .into(),
      );
   }
   if cfg.truncate_bytes > MAX_TRUNCATE_BYTES_CAP {
      return Err(
         ConfigError::InvalidConfig(format!(
            "truncate_bytes {} exceeds hard cap {}",
            cfg.truncate_bytes, MAX_TRUNCATE_BYTES_CAP
         ))
         .into(),
      );
   }
   if cfg.encode_threshold_bytes > cfg.max_inline_bytes {
      return Err(
         ConfigError::InvalidConfig(format!(
            "encode_threshold_bytes {} exceeds max_inline_bytes {}",
            cfg.encode_threshold_bytes, cfg.max_inline_bytes
         ))
         .into(),
      );
   }
   Ok(())
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}

macro_rules! define_paths {
   ($($fn_name:ident: $path:literal),* $(,)?) => {
      $(
         pub fn $fn_name() -> &'static PathBuf {
            static ONCE: OnceLock<PathBuf> = OnceLock::new();
            ONCE.get_or_init(|| base_dir().join($path))
         }
      )*
   };
}

define_paths! {
   config_file_path: "config.toml",
   data_dir: "data",
   checkpoint_db_path: "data/checkpoints.db",
}
