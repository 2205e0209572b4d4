//! Application configuration for schemaflow.
//!
//! User config lives at `~/.schemaflow/schemaflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::types::ExtensionCategory;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "schemaflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".schemaflow";

// ---------------------------------------------------------------------------
// Config structs (matching schemaflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Document store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Scheduler tunables.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Change feed transport tunables.
    #[serde(default)]
    pub feed: FeedSection,

    /// Extension descriptors. Empty means the built-in set.
    #[serde(default)]
    pub extensions: Vec<ExtensionDescriptor>,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.schemaflow/schemaflow.db".into()
}

impl StoreConfig {
    /// Resolve `~` against the home directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    PipelineError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.path)),
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Maximum change events read per queue slice.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Buffered items that force a write.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Re-invocations of a conflicting call before giving up.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Writes between best-effort view refreshes.
    #[serde(default = "default_view_refresh_every")]
    pub view_refresh_every: usize,

    /// Unsaved sequence distance that forces a checkpoint write.
    #[serde(default = "default_checkpoint_drift")]
    pub checkpoint_drift: u64,

    /// Abort everything on the first extension failure.
    #[serde(default)]
    pub stop_on_error: bool,

    /// Seconds between status log lines.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Seconds to wait for queues during shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_threshold: default_flush_threshold(),
            max_conflict_retries: default_max_conflict_retries(),
            view_refresh_every: default_view_refresh_every(),
            checkpoint_drift: default_checkpoint_drift(),
            stop_on_error: false,
            status_interval_secs: default_status_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_batch_size() -> usize {
    2000
}
fn default_flush_threshold() -> usize {
    20
}
fn default_max_conflict_retries() -> u32 {
    3
}
fn default_view_refresh_every() -> usize {
    50
}
fn default_checkpoint_drift() -> u64 {
    5000
}
fn default_status_interval() -> u64 {
    5
}
fn default_shutdown_timeout() -> u64 {
    10
}

/// `[feed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSection {
    /// Milliseconds between change log polls while waiting.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Seconds of silence before a heartbeat line.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Seconds of silence before the feed ends its batch.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Milliseconds to wait before reconnecting after a reset.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            heartbeat_secs: default_heartbeat(),
            idle_timeout_secs: default_idle_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

fn default_poll_interval() -> u64 {
    100
}
fn default_heartbeat() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_reconnect_delay() -> u64 {
    250
}

/// `[[extensions]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    /// Unique extension id (also the queue name).
    pub id: String,
    /// Name of the compiled-in handler to run.
    pub handler: String,
    /// Name of the compiled-in batch handler for deferred tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub later_handler: Option<String>,
    /// Schemas whose changes trigger the extension.
    pub source_schemas: Vec<String>,
    /// Schemas the extension declares it writes.
    #[serde(default)]
    pub emits: Vec<String>,
    pub category: ExtensionCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub uses_dependencies: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime scheduler configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub flush_threshold: usize,
    pub max_conflict_retries: u32,
    pub view_refresh_every: usize,
    pub checkpoint_drift: u64,
    pub stop_on_error: bool,
    pub status_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Restrict the run to these queue ids (empty means all).
    pub only: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            batch_size: p.batch_size.max(1),
            flush_threshold: p.flush_threshold,
            max_conflict_retries: p.max_conflict_retries,
            view_refresh_every: p.view_refresh_every.max(1),
            checkpoint_drift: p.checkpoint_drift,
            stop_on_error: p.stop_on_error,
            status_interval: Duration::from_secs(p.status_interval_secs.max(1)),
            shutdown_timeout: Duration::from_secs(p.shutdown_timeout_secs),
            only: Vec::new(),
        }
    }
}

/// Runtime change feed configuration.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub poll_interval: Duration,
    pub heartbeat: Duration,
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FeedOptions {
    fn from(config: &AppConfig) -> Self {
        let f = &config.feed;
        Self {
            poll_interval: Duration::from_millis(f.poll_interval_ms.max(1)),
            heartbeat: Duration::from_secs(f.heartbeat_secs),
            idle_timeout: Duration::from_secs(f.idle_timeout_secs),
            reconnect_delay: Duration::from_millis(f.reconnect_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.schemaflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.schemaflow/schemaflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
