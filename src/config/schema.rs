use crate::routing::RuleTarget;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Parley configuration, loaded from `config.toml`.
///
/// Resolution order: `PARLEY_CONFIG_DIR` env → `~/.parley/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Storage backend selection and connection settings (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Routing policy and config-defined rules (`[routing]`).
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Pipeline settings (`[interceptor]`).
    #[serde(default)]
    pub interceptor: InterceptorConfig,
}

// ── Storage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Redis,
    Memory,
    Hybrid,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Redis => "redis",
            Self::Memory => "memory",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "local" => Ok(Self::File),
            "redis" => Ok(Self::Redis),
            "memory" | "in_memory" => Ok(Self::Memory),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// Storage configuration (`[storage]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "file" | "redis" | "memory" | "hybrid". Default: `"file"`.
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// Root directory of the file backend. `~` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prepended to every Redis key (e.g. `"parley:"`).
    #[serde(default)]
    pub key_prefix: String,
    /// Composition used when `backend = "hybrid"` (`[storage.hybrid]`).
    #[serde(default)]
    pub hybrid: HybridConfig,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_data_dir() -> String {
    "~/.parley/data".into()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            data_dir: default_data_dir(),
            redis_url: default_redis_url(),
            key_prefix: String::new(),
            hybrid: HybridConfig::default(),
        }
    }
}

impl StorageConfig {
    /// `data_dir` with a leading `~` expanded to the home directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).into_owned())
    }

    fn uses(&self, backend: StorageBackend) -> bool {
        self.backend == backend
            || (self.backend == StorageBackend::Hybrid
                && (self.hybrid.primary == backend || self.hybrid.secondary == Some(backend)))
    }
}

/// Hybrid composition (`[storage.hybrid]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_hybrid_primary")]
    pub primary: StorageBackend,
    /// Omit to run the hybrid with a primary only.
    #[serde(default)]
    pub secondary: Option<StorageBackend>,
    /// Mirror writes to the secondary and fill the primary on fallback reads.
    #[serde(default)]
    pub sync: bool,
}

fn default_hybrid_primary() -> StorageBackend {
    StorageBackend::File
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            primary: default_hybrid_primary(),
            secondary: None,
            sync: false,
        }
    }
}

// ── Routing ───────────────────────────────────────────────────────

/// Routing configuration (`[routing]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// A sender's latest conversation is continued if it saw activity within
    /// this many seconds. Default: `1800`.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// Priority given to rules registered without one. Default: `50`.
    #[serde(default = "default_rule_priority")]
    pub default_rule_priority: i32,
    #[serde(default)]
    pub keyword_routes: Vec<KeywordRoute>,
    #[serde(default)]
    pub pattern_routes: Vec<PatternRoute>,
}

fn default_inactivity_timeout_secs() -> u64 {
    30 * 60
}

fn default_rule_priority() -> i32 {
    50
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            default_rule_priority: default_rule_priority(),
            keyword_routes: Vec::new(),
            pattern_routes: Vec::new(),
        }
    }
}

/// Fires when any keyword occurs in the message content (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRoute {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub target: RuleTarget,
    /// Falls back to `routing.default_rule_priority`.
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Fires when the regex finds a match in the message content (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRoute {
    pub pattern: String,
    #[serde(default)]
    pub target: RuleTarget,
    #[serde(default)]
    pub priority: Option<i32>,
}

// ── Interceptor ───────────────────────────────────────────────────

/// Pipeline configuration (`[interceptor]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Bounded wait of the background loop on an empty queue. Default: `1000`.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
    /// Agent used when a conversation has no bound agent; empty disables
    /// the fallback. Default: `"assistant"`.
    #[serde(default = "default_agent_id")]
    pub default_agent: String,
    /// Messages of history handed to agents. Default: `50`.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_queue_poll_interval_ms() -> u64 {
    1000
}

fn default_agent_id() -> String {
    "assistant".into()
}

fn default_history_limit() -> usize {
    50
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            default_agent: default_agent_id(),
            history_limit: default_history_limit(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".parley").join("config.toml"),
            storage: StorageConfig::default(),
            routing: RoutingConfig::default(),
            interceptor: InterceptorConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("PARLEY_CONFIG_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(&dir).into_owned()));
        }
    }
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".parley"))
}

fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load `config.toml` from the config directory, writing defaults on first run.
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = default_config_dir()?;
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path;
            config.save().await?;
            config
        } else {
            Self::read(&config_path).await?
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            backend = %config.storage.backend,
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Load an explicit config file. The file must exist.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::read(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(path = %config.config_path.display(), "Config loaded");
        Ok(config)
    }

    async fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    ///
    /// Called after TOML deserialization and env-override application.
    pub fn validate(&self) -> Result<()> {
        // Storage
        if self.storage.uses(StorageBackend::File) && self.storage.data_dir.trim().is_empty() {
            anyhow::bail!("storage.data_dir must not be empty");
        }
        if self.storage.uses(StorageBackend::Redis) && self.storage.redis_url.trim().is_empty() {
            anyhow::bail!("storage.redis_url must not be empty");
        }
        if self.storage.hybrid.primary == StorageBackend::Hybrid
            || self.storage.hybrid.secondary == Some(StorageBackend::Hybrid)
        {
            anyhow::bail!("storage.hybrid cannot nest another hybrid backend");
        }

        // Routing
        for (i, route) in self.routing.keyword_routes.iter().enumerate() {
            if route.keywords.iter().all(|k| k.trim().is_empty()) {
                anyhow::bail!("routing.keyword_routes[{i}] needs at least one non-empty keyword");
            }
        }
        for (i, route) in self.routing.pattern_routes.iter().enumerate() {
            regex::Regex::new(&route.pattern).with_context(|| {
                format!("routing.pattern_routes[{i}] has an invalid pattern")
            })?;
        }

        // Interceptor
        if self.interceptor.queue_poll_interval_ms == 0 {
            anyhow::bail!("interceptor.queue_poll_interval_ms must be greater than 0");
        }
        if self.interceptor.history_limit == 0 {
            anyhow::bail!("interceptor.history_limit must be greater than 0");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Backend: PARLEY_STORAGE_BACKEND
        if let Ok(raw) = std::env::var("PARLEY_STORAGE_BACKEND") {
            if !raw.is_empty() {
                match raw.parse::<StorageBackend>() {
                    Ok(backend) => self.storage.backend = backend,
                    Err(e) => tracing::warn!("Ignoring PARLEY_STORAGE_BACKEND: {e}"),
                }
            }
        }

        // File backend root: PARLEY_DATA_DIR
        if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
            if !dir.is_empty() {
                self.storage.data_dir = dir;
            }
        }

        // Redis URL: PARLEY_REDIS_URL
        if let Ok(url) = std::env::var("PARLEY_REDIS_URL") {
            if !url.is_empty() {
                self.storage.redis_url = url;
            }
        }

        // Hybrid sync: PARLEY_STORAGE_SYNC
        if let Ok(raw) = std::env::var("PARLEY_STORAGE_SYNC") {
            match parse_bool_flag(&raw) {
                Some(sync) => self.storage.hybrid.sync = sync,
                None if raw.is_empty() => {}
                None => tracing::warn!("Ignoring invalid PARLEY_STORAGE_SYNC value: {raw}"),
            }
        }
    }

    /// Write the config to `config_path` via a temp file and rename.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        Ok(())
    }
}
