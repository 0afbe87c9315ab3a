use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Batch settings blob ───────────────────────────────────────

/// Settings of a batching connection point, parsed from its JSON blob.
///
/// All keys are required. The blob uses the key names of the connection
/// point configuration UI (`MessageToPackage`, `DebugMode`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Number of messages of one class that triggers an immediate flush.
    #[serde(rename = "MessageToPackage")]
    pub messages_per_batch: u32,
    /// Enables per-message debug logging and the startup settings dump.
    #[serde(rename = "DebugMode")]
    pub debug_mode: bool,
    /// Class id stamped on every emitted batch message.
    #[serde(rename = "ClassId")]
    pub class_id: String,
    /// Type tag stamped on every emitted batch message.
    #[serde(rename = "Type")]
    pub message_type: String,
    /// Minutes between two time-triggered flushes of everything accumulated.
    #[serde(rename = "WaitingTime")]
    pub wait_minutes: u32,
}

impl BatchSettings {
    /// Parse and validate a settings blob.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        if json.trim().is_empty() {
            return Err(ConfigError::Missing("settings".into()));
        }
        let settings: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messages_per_batch == 0 {
            return Err(ConfigError::Invalid(
                "MessageToPackage must be a positive integer".into(),
            ));
        }
        if self.wait_minutes == 0 {
            return Err(ConfigError::Invalid(
                "WaitingTime must be a positive integer".into(),
            ));
        }
        if self.class_id.trim().is_empty() {
            return Err(ConfigError::Invalid("ClassId must not be empty".into()));
        }
        if self.message_type.trim().is_empty() {
            return Err(ConfigError::Invalid("Type must not be empty".into()));
        }
        Ok(())
    }

    /// Interval after which everything accumulated is flushed.
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.wait_minutes) * 60)
    }

    /// Print the settings for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Batch settings:");
        tracing::info!("  messages per batch: {}", self.messages_per_batch);
        tracing::info!("  batch class id:     {}", self.class_id);
        tracing::info!("  batch type:         {}", self.message_type);
        tracing::info!("  waiting time (min): {}", self.wait_minutes);
        tracing::info!("  debug mode:         {}", self.debug_mode);
    }
}

// ── Worker config ─────────────────────────────────────────────

/// Slack between the wait interval and the lock duration, covering the peek
/// timeout, backoff and the flush itself.
pub const LOCK_MARGIN_SECS: u64 = 60;

/// Everything the `batch-worker` process needs besides the settings blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    /// Inline settings blob; takes precedence over `settings_file`.
    pub settings_json: Option<String>,
    pub settings_file: PathBuf,
    pub source_queue_url: Option<String>,
    pub sink_queue_url: Option<String>,
    pub dlq_url: Option<String>,
    pub peek_timeout_ms: u64,
    pub idle_delay_ms: u64,
    pub backoff_max_ms: u64,
    pub visibility_timeout_secs: u64,
    pub aws: AwsConfig,
}

impl WorkerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `BATCHPOINT_PROFILE`.
    pub fn from_env() -> Self {
        let profile = env_or("BATCHPOINT_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            settings_json: profiled_env_opt(p, "BATCH_SETTINGS"),
            settings_file: PathBuf::from(profiled_env_or(
                p,
                "BATCH_SETTINGS_FILE",
                "config/batch.json",
            )),
            source_queue_url: profiled_env_opt(p, "SOURCE_QUEUE_URL"),
            sink_queue_url: profiled_env_opt(p, "SINK_QUEUE_URL"),
            dlq_url: profiled_env_opt(p, "DLQ_URL"),
            peek_timeout_ms: profiled_env_u64(p, "PEEK_TIMEOUT_MS", 10_000),
            idle_delay_ms: profiled_env_u64(p, "IDLE_DELAY_MS", 10),
            backoff_max_ms: profiled_env_u64(p, "BACKOFF_MAX_MS", 30_000),
            visibility_timeout_secs: profiled_env_u64(p, "VISIBILITY_TIMEOUT_SECS", 900),
            aws: AwsConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Resolve the settings blob (inline first, then file) and validate it
    /// together with the lock duration.
    pub fn load_settings(&self) -> Result<BatchSettings, ConfigError> {
        let settings = match &self.settings_json {
            Some(json) => BatchSettings::from_json(json)?,
            None => read_settings_file(&self.settings_file)?,
        };
        self.check_lock_window(&settings)?;
        Ok(settings)
    }

    /// A folded message stays locked until its batch is flushed, which can
    /// take up to the full wait interval. The lock must outlive that or the
    /// message is redelivered while its batch is still open.
    pub fn check_lock_window(&self, settings: &BatchSettings) -> Result<(), ConfigError> {
        let required = settings.wait_interval().as_secs() + LOCK_MARGIN_SECS;
        if self.visibility_timeout_secs <= required {
            return Err(ConfigError::Invalid(format!(
                "VISIBILITY_TIMEOUT_SECS ({}) must exceed WaitingTime ({} min) plus {}s, i.e. be above {}",
                self.visibility_timeout_secs, settings.wait_minutes, LOCK_MARGIN_SECS, required
            )));
        }
        Ok(())
    }

    pub fn peek_timeout(&self) -> Duration {
        Duration::from_millis(self.peek_timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  source:   {}", self.source_queue_url.as_deref().unwrap_or("(none)"));
        tracing::info!("  sink:     {}", self.sink_queue_url.as_deref().unwrap_or("(none)"));
        tracing::info!("  dlq:      {}", self.dlq_url.as_deref().unwrap_or("(none)"));
        tracing::info!("  peek:     timeout={}ms, idle={}ms", self.peek_timeout_ms, self.idle_delay_ms);
        tracing::info!("  aws:      region={}, static_credentials={}", self.aws.region, self.aws.has_static_credentials());
    }
}

fn read_settings_file(path: &Path) -> Result<BatchSettings, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Missing(format!(
            "settings file {} (or BATCH_SETTINGS)",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    BatchSettings::from_json(&content)
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "ap-southeast-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}
