//! Configuration for the reconciliation layer

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::DocumentKind;

/// Environment variable naming the config file used by the binary
pub const CONFIG_ENV_VAR: &str = "DOC_RECONCILE_CONFIG";

/// Largest accepted stuck threshold (30 days)
pub const MAX_STUCK_THRESHOLD_SECS: u64 = 30 * 24 * 60 * 60;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReconcileConfig {
    /// Object store / metadata store locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upload validation
    #[serde(default)]
    pub upload: UploadConfig,
    /// Retry/backoff policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Stuck detection
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Fetch rate limiting
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Orphan classification rules
    #[serde(default)]
    pub sync: SyncConfig,
    /// External extraction job endpoint
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

impl ReconcileConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check values that would make the components misbehave
    pub fn validate(&self) -> Result<()> {
        if self.storage.ingest_prefix.is_empty() {
            return Err(Error::Config("storage.ingest_prefix must not be empty".to_string()));
        }
        if self.upload.max_file_size == 0 {
            return Err(Error::Config("upload.max_file_size must be positive".to_string()));
        }
        if self.upload.accepted_mime_types.is_empty() {
            return Err(Error::Config(
                "upload.accepted_mime_types must list at least one type".to_string(),
            ));
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::Config(
                "retry.max_delay_ms must be >= retry.base_delay_ms > 0".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(Error::Config("retry.max_retries must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry.jitter must be within 0.0..=1.0".to_string()));
        }
        if self.lifecycle.stuck_threshold_secs == 0 || self.lifecycle.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "lifecycle thresholds must be positive".to_string(),
            ));
        }
        if self.lifecycle.stuck_threshold_secs > MAX_STUCK_THRESHOLD_SECS {
            return Err(Error::Config(format!(
                "lifecycle.stuck_threshold_secs must be at most {}",
                MAX_STUCK_THRESHOLD_SECS
            )));
        }
        Ok(())
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the local object store
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Key prefix every ingested object lives under
    #[serde(default = "default_ingest_prefix")]
    pub ingest_prefix: String,
    /// SQLite metadata database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./data/objects")
}
fn default_ingest_prefix() -> String {
    "uploads/".to_string()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("./data/metadata.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            ingest_prefix: default_ingest_prefix(),
            database_path: default_database_path(),
        }
    }
}

/// Upload validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted file in bytes (default: 10MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Declared content types accepted for ingestion
    #[serde(default = "default_accepted_mime_types")]
    pub accepted_mime_types: Vec<String>,
}

fn default_max_file_size() -> u64 { 10 * 1024 * 1024 }
fn default_accepted_mime_types() -> Vec<String> {
    vec!["application/pdf".to_string()]
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            accepted_mime_types: default_accepted_mime_types(),
        }
    }
}

/// Retry policy shared by every operation kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failed attempts before the operation kind gives up (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default: 1000)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 30000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Share of each delay that is randomized, 0.0 = deterministic
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_retries() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30_000 }

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
        }
    }
}

/// Stuck-job detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Processing longer than this is classified stuck (default: 300 = 5 minutes)
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
    /// Period of the stuck sweep (default: 60s)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_stuck_threshold() -> u64 { 300 }
fn default_sweep_interval() -> u64 { 60 }

impl LifecycleConfig {
    /// Stuck threshold, clamped to [`MAX_STUCK_THRESHOLD_SECS`]
    pub fn stuck_threshold(&self) -> chrono::Duration {
        let secs = self.stuck_threshold_secs.min(MAX_STUCK_THRESHOLD_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_secs: default_stuck_threshold(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Fetch coordinator rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Calls closer together than this return the cached list (default: 1000ms)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 { 1000 }

impl FetchConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// One substring rule: keys containing `pattern` get `kind`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationRule {
    pub pattern: String,
    pub kind: DocumentKind,
}

impl ClassificationRule {
    pub fn new(pattern: impl Into<String>, kind: DocumentKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
        }
    }
}

/// Orphan classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Ordered rules, first match wins
    #[serde(default = "default_rules")]
    pub rules: Vec<ClassificationRule>,
    /// Kind used when no rule matches
    #[serde(default = "default_kind")]
    pub default_kind: DocumentKind,
}

fn default_kind() -> DocumentKind {
    DocumentKind::Other
}

fn default_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::new("invoice", DocumentKind::Invoice),
        ClassificationRule::new("inv_", DocumentKind::Invoice),
        ClassificationRule::new("receipt", DocumentKind::Receipt),
        ClassificationRule::new("statement", DocumentKind::BankStatement),
        ClassificationRule::new("bank", DocumentKind::BankStatement),
        ClassificationRule::new("contract", DocumentKind::Contract),
        ClassificationRule::new("agreement", DocumentKind::Contract),
        ClassificationRule::new("w2", DocumentKind::TaxForm),
        ClassificationRule::new("1099", DocumentKind::TaxForm),
        ClassificationRule::new("tax", DocumentKind::TaxForm),
        ClassificationRule::new("payslip", DocumentKind::Payslip),
        ClassificationRule::new("payroll", DocumentKind::Payslip),
        ClassificationRule::new("salary", DocumentKind::Payslip),
    ]
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            default_kind: default_kind(),
        }
    }
}

/// External extraction job endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// URL the job invocation is POSTed to
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Bearer token sent with each invocation
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_extraction_timeout")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8787/extract".to_string()
}
fn default_extraction_timeout() -> u64 { 30 }

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            timeout_secs: default_extraction_timeout(),
        }
    }
}
